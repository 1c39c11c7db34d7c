//! The free-space manager.
//!
//! Free space is managed via segregated lists: a fixed table of bins indexed
//! by `size >> log2_first_bin_size`. Bin 0 holds chunks of any size between
//! the dark-matter cutoff and the first bin boundary and primarily feeds
//! TLAB refills; the other bins serve large-object allocation; the last bin
//! is unbounded above. All allocation entry points serialise on one mutex,
//! which is never held across a collection pause. The sweep protocol
//! (`sweep.rs`) rebuilds the bins from scratch during each stop-the-world
//! pause.

use super::bins::FreeSpaceList;
use super::chunk::{FreeChunk, CHUNK_HEADER_SIZE, MIN_OBJECT_SIZE, WORD_SIZE};
use super::committed::CommittedRegion;
use super::refill::RefillPolicy;
use super::sweep::SweepPhase;
use super::vm::VmError;
use crate::sync::{Mutex, OnceLock};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::fmt;
use std::ptr::NonNull;

/// Number of segregated free-list bins.
pub(crate) const NUM_BINS: usize = 10;

/// A collector invoked more often than this for one request, each time
/// claiming success, is treated as a non-progressing (broken) collector.
pub(crate) const MAX_GC_ATTEMPTS: u32 = 8;

#[derive(Debug)]
pub enum HeapError {
    /// Reserve/commit failure. Fatal at initialization: the runtime cannot
    /// proceed without a usable heap.
    Vm(VmError),
    /// Allocation unsatisfiable even after triggering collection.
    OutOfMemory { requested: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::Vm(e) => write!(f, "heap backing store failure: {e}"),
            HeapError::OutOfMemory { requested } => {
                write!(f, "out of memory: {requested} bytes unsatisfiable after collection")
            }
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::Vm(e) => Some(e),
            HeapError::OutOfMemory { .. } => None,
        }
    }
}

impl From<VmError> for HeapError {
    fn from(e: VmError) -> Self {
        HeapError::Vm(e)
    }
}

/// The collector, as seen from a failed allocation.
///
/// `collect_garbage` blocks the calling thread through a full stop-the-world
/// cycle (no timeout, no cancellation) and returns `false` once no further
/// space can be recovered. The manager's mutex is released before this is
/// called and re-acquired on retry.
pub trait CollectGarbage {
    fn collect_garbage(&mut self, requested: usize) -> bool;
}

impl<F: FnMut(usize) -> bool> CollectGarbage for F {
    fn collect_garbage(&mut self, requested: usize) -> bool {
        self(requested)
    }
}

/// Configuration for [`SpaceManager`]. All fields have sensible defaults.
/// Fixed at `initialize()` time, immutable afterward.
#[derive(Clone, Debug)]
pub struct SpaceManagerConfig {
    /// Reserved (maximum) heap size. Default: 256 MB.
    pub reserved_size: usize,

    /// Committed heap size at startup, rounded to allocation granularity.
    /// Default: 32 MB.
    pub initial_size: usize,

    /// Minimum size treated as a large object. Rounded down to a power of
    /// two; its log2 sets the bin granularity. Default: 64 KB.
    pub large_object_min_size: usize,

    /// Minimum reclaimable chunk size — gaps below this are never tracked
    /// (dark matter). Clamped to at least [`MIN_OBJECT_SIZE`] and
    /// word-rounded. Default: 64.
    pub min_reclaimable_size: usize,

    /// Space left below which an external bump allocator should ask for a
    /// refill. Default: 64 words.
    pub refill_threshold: usize,
}

impl Default for SpaceManagerConfig {
    fn default() -> Self {
        Self {
            reserved_size: 256 * 1024 * 1024,
            initial_size: 32 * 1024 * 1024,
            large_object_min_size: 64 * 1024,
            min_reclaimable_size: 64,
            refill_threshold: 64 * WORD_SIZE,
        }
    }
}

/// Config values after validation, copied wherever the hot paths need them.
#[derive(Clone, Copy)]
pub(crate) struct ResolvedConfig {
    pub log2_first_bin_size: u32,
    pub min_reclaimable: usize,
}

impl ResolvedConfig {
    #[inline]
    pub fn bin_index(&self, size: usize) -> usize {
        let i = size >> self.log2_first_bin_size;
        i.min(NUM_BINS - 1)
    }
}

/// Mutex-protected manager state: the bins, the backing region, the running
/// totals and the sweep phase.
pub(crate) struct FreeSpace {
    pub(crate) bins: [FreeSpaceList; NUM_BINS],
    /// Total space in free chunks. Excludes space already handed out.
    pub(crate) total_free_chunk_space: usize,
    /// Untracked sub-threshold bytes created since the last `begin_sweep`.
    pub(crate) dark_matter: usize,
    pub(crate) region: CommittedRegion,
    /// End of the last visited object/range; the sweep cursor.
    pub(crate) sweep_cursor: NonNull<u8>,
    pub(crate) phase: SweepPhase,
    /// Whether the current sweep walks object by object (diagnostic only).
    pub(crate) precise_sweep: bool,
    /// Whether bin 0 currently holds space worth bulk-draining for TLABs.
    pub(crate) use_tlab_bin: bool,
    pub(crate) cfg: ResolvedConfig,
    /// Debug map of tracked chunk starts (one bit per MIN_OBJECT_SIZE
    /// granule). Catches a chunk entering two lists, or the same range being
    /// recorded twice in one sweep.
    #[cfg(debug_assertions)]
    tracked: FixedBitSet,
}

// Safety: every raw pointer in here refers into the heap region the manager
// owns; all access is serialised by the enclosing mutex.
unsafe impl Send for FreeSpace {}

impl FreeSpace {
    fn new(region: CommittedRegion, cfg: ResolvedConfig) -> Self {
        let sweep_cursor = region.start();
        Self {
            bins: std::array::from_fn(FreeSpaceList::new),
            total_free_chunk_space: 0,
            dark_matter: 0,
            region,
            sweep_cursor,
            phase: SweepPhase::Idle,
            precise_sweep: false,
            use_tlab_bin: false,
            cfg,
            #[cfg(debug_assertions)]
            tracked: FixedBitSet::new(),
        }
    }

    #[inline]
    pub(crate) fn assert_idle(&self, op: &str) {
        assert!(
            self.phase == SweepPhase::Idle,
            "{op} called while a sweep is in progress; the collector's phase contract is broken"
        );
    }

    #[inline]
    pub(crate) fn update_tlab_bin(&mut self) {
        self.use_tlab_bin = self.bins[0].total_size > 0;
    }

    #[inline]
    pub(crate) fn track(&mut self, _chunk: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let granule = self.granule_of(_chunk);
            self.tracked.grow(granule + 1);
            assert!(
                !self.tracked.contains(granule),
                "free-space corruption: chunk at {:p} tracked twice",
                _chunk.as_ptr()
            );
            self.tracked.insert(granule);
        }
    }

    #[inline]
    pub(crate) fn untrack(&mut self, _chunk: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let granule = self.granule_of(_chunk);
            assert!(
                self.tracked.contains(granule),
                "free-space corruption: removing untracked chunk at {:p}",
                _chunk.as_ptr()
            );
            self.tracked.set(granule, false);
        }
    }

    /// Clear tracking bits for every chunk in a detached run.
    pub(crate) fn untrack_run(&mut self, _head: NonNull<u8>) {
        #[cfg(debug_assertions)]
        {
            let mut cur = Some(_head);
            while let Some(chunk) = cur {
                self.untrack(chunk);
                // Safety: run members are formatted chunks.
                cur = unsafe { FreeChunk::next(chunk) };
            }
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn clear_tracking(&mut self) {
        self.tracked.clear();
    }

    #[cfg(debug_assertions)]
    fn granule_of(&self, chunk: NonNull<u8>) -> usize {
        let offset = chunk.as_ptr() as usize - self.region.start().as_ptr() as usize;
        offset / MIN_OBJECT_SIZE
    }

    /// Debug invariant: the sum of bin totals equals the tracked total.
    #[inline]
    pub(crate) fn check_bin_free_space(&self) {
        #[cfg(debug_assertions)]
        {
            let in_lists: usize = self.bins.iter().map(|b| b.total_size).sum();
            assert!(
                in_lists == self.total_free_chunk_space,
                "inconsistent free space counts: bins hold {in_lists}, tracked total is {}",
                self.total_free_chunk_space
            );
        }
    }

    /// Record a free range into the bin its size maps to.
    ///
    /// # Safety
    /// `chunk` must address `size` committed, word-aligned bytes holding no
    /// live data and tracked by no list.
    pub(crate) unsafe fn record_free_space(&mut self, chunk: NonNull<u8>, size: usize) {
        let bin = self.cfg.bin_index(size);
        // Safety: upheld by caller.
        unsafe { self.bins[bin].append(chunk, size) };
        self.track(chunk);
        self.total_free_chunk_space += size;
        self.update_tlab_bin();
    }

    /// Dismiss a range as dark matter: dead-marked, never tracked again.
    ///
    /// # Safety
    /// Same ownership requirements as [`record_free_space`](Self::record_free_space).
    pub(crate) unsafe fn discard_dark_matter(&mut self, range: NonNull<u8>, size: usize) {
        // Safety: upheld by caller.
        unsafe { FreeChunk::format_dark(range, size) };
        self.dark_matter += size;
    }

    /// First-fit over one bin. Lives here rather than on the list because a
    /// split leftover may move to a different bin.
    ///
    /// With `exact_fit` the carved region is always the low end of the chunk
    /// and any leftover of at least `min_reclaimable` bytes is re-entered
    /// into the bin its new size maps to; a smaller leftover becomes dark
    /// matter. Without `exact_fit` the whole chunk is handed out, header
    /// intact, and the caller reads the actual length from it. A chunk whose
    /// size matches the request exactly is removed whole either way.
    fn allocate_first_fit(&mut self, bin: usize, size: usize, exact_fit: bool) -> Option<NonNull<u8>> {
        let with_headroom = size.checked_add(MIN_OBJECT_SIZE)?;
        let mut prev: Option<NonNull<u8>> = None;
        let mut cur = self.bins[bin].head;
        while let Some(chunk) = cur {
            // Safety: list members are formatted chunks in committed space.
            let chunk_size = unsafe { FreeChunk::size(chunk) };
            if chunk_size >= with_headroom {
                // Safety: chunk is a member of bins[bin] with predecessor prev.
                unsafe { self.bins[bin].remove_after(prev, chunk, chunk_size) };
                self.untrack(chunk);
                self.total_free_chunk_space -= chunk_size;
                if exact_fit {
                    let leftover = chunk_size - size;
                    // Safety: the leftover range lies inside the chunk just removed.
                    let rest = unsafe { NonNull::new_unchecked(chunk.as_ptr().add(size)) };
                    if leftover >= self.cfg.min_reclaimable {
                        let rebin = self.cfg.bin_index(leftover);
                        // Safety: rest addresses `leftover` free bytes we own.
                        unsafe { self.bins[rebin].append(rest, leftover) };
                        self.track(rest);
                        self.total_free_chunk_space += leftover;
                    } else if leftover > 0 {
                        // Safety: rest addresses `leftover` free bytes we own.
                        unsafe { self.discard_dark_matter(rest, leftover) };
                    }
                }
                self.update_tlab_bin();
                return Some(chunk);
            } else if chunk_size == size {
                // Exact fit: removed whole regardless of the split mode.
                // Safety: chunk is a member of bins[bin] with predecessor prev.
                unsafe { self.bins[bin].remove_after(prev, chunk, chunk_size) };
                self.untrack(chunk);
                self.total_free_chunk_space -= size;
                self.update_tlab_bin();
                return Some(chunk);
            }
            prev = Some(chunk);
            // Safety: list members are formatted chunks.
            cur = unsafe { FreeChunk::next(chunk) };
        }
        None
    }

    /// Scan bins from `first_bin` upward. Any chunk in a higher-indexed bin
    /// is guaranteed large enough, but bin 0 (and bins below `bin_index(size)`
    /// when the refill path starts at 1) still need a first-fit walk.
    pub(crate) fn bin_try_allocate(&mut self, first_bin: usize, size: usize, exact_fit: bool) -> Option<NonNull<u8>> {
        for bin in first_bin..NUM_BINS {
            if !self.bins[bin].is_empty() {
                if let Some(found) = self.allocate_first_fit(bin, size, exact_fit) {
                    self.check_bin_free_space();
                    return Some(found);
                }
            }
        }
        None
    }

    /// One lock-held TLAB attempt; `None` sends the caller to the collector.
    fn try_allocate_tlab(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.use_tlab_bin && self.bins[0].total_size > size {
            // Safety: bin 0 is non-empty (its total exceeds the request).
            let (run, taken, num) = unsafe { self.bins[0].allocate_chunks(size) };
            self.untrack_run(run);
            self.total_free_chunk_space -= taken;
            self.update_tlab_bin();
            self.check_bin_free_space();
            log::trace!("TLAB run: {num} chunk(s), {taken} bytes from bin 0 for a {size}-byte request");
            return Some(run);
        }
        // Drain bin 0 completely, then try to cover the shortfall from
        // higher bins and chain the two runs together.
        if let Some((head, drained, num)) = self.bins[0].take_all() {
            self.untrack_run(head);
            self.total_free_chunk_space -= drained;
            self.update_tlab_bin();
            let shortfall = size.saturating_sub(drained);
            if shortfall > self.cfg.min_reclaimable {
                if let Some(extra) = self.bin_try_allocate(1, shortfall, true) {
                    // Safety: extra addresses `shortfall` committed bytes we own.
                    unsafe { FreeChunk::format_linked(extra, shortfall, Some(head)) };
                    self.check_bin_free_space();
                    log::trace!(
                        "TLAB shortfall: {shortfall} bytes chained from higher bins ahead of {num} bin-0 chunk(s)"
                    );
                    return Some(extra);
                }
            }
            self.check_bin_free_space();
            // Undersized TLAB; the caller gets what bin 0 held and the next
            // request will trigger a collection if it is not enough.
            log::trace!("TLAB undersized: {drained} of {size} bytes ({num} chunks)");
            return Some(head);
        }
        // Bin 0 empty: a single chunk from the higher bins, formatted so the
        // result is still a parsable one-chunk chain.
        let chunk = self.bin_try_allocate(1, size, true)?;
        // Safety: chunk addresses `size` committed bytes we own.
        unsafe { FreeChunk::format(chunk, size) };
        Some(chunk)
    }
}

/// The free-space manager of the managed heap. One instance exists per heap
/// (see [`GlobalSpaceManager`]); all allocation entry points serialise on the
/// internal mutex.
pub struct SpaceManager {
    pub(crate) inner: Mutex<FreeSpace>,
    pub(crate) cfg: ResolvedConfig,
    pub(crate) policy: RefillPolicy,
}

impl SpaceManager {
    /// Reserve and commit the heap and seed the bins with the initial
    /// committed space as one chunk.
    ///
    /// # Errors
    ///
    /// Any `HeapError::Vm` here is fatal for the surrounding runtime.
    pub fn initialize(config: &SpaceManagerConfig) -> Result<Self, HeapError> {
        if config.large_object_min_size < MIN_OBJECT_SIZE {
            return Err(HeapError::Vm(VmError::InitializationFailed(format!(
                "large_object_min_size {} is below the minimum cell size {MIN_OBJECT_SIZE}",
                config.large_object_min_size
            ))));
        }
        // Round down to a power of two: the bin width.
        let log2_first_bin_size = usize::BITS - 1 - config.large_object_min_size.leading_zeros();
        let large_min = 1usize << log2_first_bin_size;
        let min_reclaimable = config
            .min_reclaimable_size
            .max(MIN_OBJECT_SIZE)
            .next_multiple_of(WORD_SIZE);
        let cfg = ResolvedConfig {
            log2_first_bin_size,
            min_reclaimable,
        };
        let policy = RefillPolicy {
            refill_size: large_min,
            refill_threshold: config.refill_threshold,
            min_chunk_size: min_reclaimable,
        };

        let mut region = CommittedRegion::reserve(config.reserved_size)?;
        let mut inner = {
            let initial = region.adjust_growth(config.initial_size);
            if initial > 0 {
                if !region.grow_committed_space(initial) {
                    return Err(HeapError::Vm(VmError::InitializationFailed(format!(
                        "could not commit initial {initial} bytes of heap"
                    ))));
                }
            }
            FreeSpace::new(region, cfg)
        };
        let initial = inner.region.committed_size();
        if initial >= CHUNK_HEADER_SIZE {
            let start = inner.region.start();
            // Safety: the freshly committed range holds no live data.
            unsafe { inner.record_free_space(start, initial) };
        }
        log::info!(
            "heap initialized: {} bytes reserved, {initial} bytes committed at {}-byte granularity, bin width {} bytes, dark-matter cutoff {min_reclaimable} bytes",
            inner.region.reserved_size(),
            inner.region.granularity(),
            1usize << cfg.log2_first_bin_size,
        );
        Ok(Self {
            inner: Mutex::new(inner),
            cfg,
            policy,
        })
    }

    /// Bin index covering `size`; bin 0 spans `[min_reclaimable, first bin
    /// boundary)`, the last bin is unbounded above.
    #[inline]
    pub fn bin_index(&self, size: usize) -> usize {
        self.cfg.bin_index(size)
    }

    fn round_request(size: usize) -> Result<usize, HeapError> {
        size.max(MIN_OBJECT_SIZE)
            .checked_next_multiple_of(WORD_SIZE)
            .ok_or(HeapError::OutOfMemory { requested: size })
    }

    /// Allocate `size` bytes of zero-filled, ready-to-use memory.
    ///
    /// On failure the mutex is released, `gc` runs a collection, and the
    /// request is retried; a collector that keeps reporting progress without
    /// ever satisfying the request is a fatal bug.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` once the collector can recover nothing more.
    pub fn allocate(&self, size: usize, gc: &mut dyn CollectGarbage) -> Result<NonNull<u8>, HeapError> {
        let size = Self::round_request(size)?;
        let mut gc_attempts = 0u32;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.assert_idle("allocate");
                if let Some(found) = inner.bin_try_allocate(self.cfg.bin_index(size), size, true) {
                    // Ready-to-use contract: the region is zero-filled.
                    // Safety: found addresses `size` committed bytes now
                    // owned exclusively by the caller.
                    unsafe { std::ptr::write_bytes(found.as_ptr(), 0, size) };
                    return Ok(found);
                }
            }
            gc_attempts += 1;
            assert!(
                gc_attempts <= MAX_GC_ATTEMPTS,
                "{gc_attempts} collection cycles without satisfying a {size}-byte request; \
                 the collector is not progressing"
            );
            log::debug!("allocation failure: {size} bytes (attempt {gc_attempts}); triggering collection");
            if !gc.collect_garbage(size) {
                return Err(HeapError::OutOfMemory { requested: size });
            }
        }
    }

    /// Allocate a TLAB of about `size` bytes as one or more chained chunks.
    ///
    /// The result is raw (unzeroed) memory: a null-terminated chain of
    /// formatted chunks the caller walks via [`FreeChunk`] and reformats for
    /// bump allocation. The run may be smaller than requested when bin 0 had
    /// less to give; it may also overshoot by up to one chunk.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` once the collector can recover nothing more.
    pub fn allocate_tlab(&self, size: usize, gc: &mut dyn CollectGarbage) -> Result<NonNull<u8>, HeapError> {
        let size = Self::round_request(size.max(CHUNK_HEADER_SIZE))?;
        let mut gc_attempts = 0u32;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.assert_idle("allocate_tlab");
                if let Some(run) = inner.try_allocate_tlab(size) {
                    return Ok(run);
                }
            }
            gc_attempts += 1;
            assert!(
                gc_attempts <= MAX_GC_ATTEMPTS,
                "{gc_attempts} collection cycles without satisfying a {size}-byte TLAB request; \
                 the collector is not progressing"
            );
            log::debug!("TLAB allocation failure: {size} bytes (attempt {gc_attempts}); triggering collection");
            if !gc.collect_garbage(size) {
                return Err(HeapError::OutOfMemory { requested: size });
            }
        }
    }

    /// Read-only: could `size` bytes be allocated right now? Used by the
    /// collector to decide whether a pass freed enough space, without
    /// mutating any list.
    pub fn can_satisfy_allocation(&self, size: usize) -> bool {
        let size = match Self::round_request(size) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let inner = self.inner.lock().unwrap();
        for bin in self.cfg.bin_index(size)..NUM_BINS {
            // Safety: list members are formatted chunks.
            if !inner.bins[bin].is_empty() && unsafe { inner.bins[bin].can_fit(size, MIN_OBJECT_SIZE) } {
                return true;
            }
        }
        false
    }

    /// Estimated free space left, in bytes.
    pub fn free_space_left(&self) -> usize {
        self.inner.lock().unwrap().total_free_chunk_space
    }

    /// Currently committed heap size.
    pub fn total_space(&self) -> usize {
        self.inner.lock().unwrap().region.committed_size()
    }

    /// Total reservable heap capacity.
    pub fn total_capacity(&self) -> usize {
        self.inner.lock().unwrap().region.reserved_size()
    }

    /// Grow the committed space by about `delta` bytes (rounded to the
    /// platform allocation granularity, capped at the reservation). The new
    /// space is formatted as one chunk and immediately allocatable. Returns
    /// the effective growth; 0 when the heap is at capacity.
    pub fn grow_after_gc(&self, delta: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let adjusted = inner.region.adjust_growth(delta);
        if adjusted == 0 {
            return 0;
        }
        let chunk_start = inner.region.committed_end();
        let grown = inner.region.grow_committed_space(adjusted);
        // Headroom was validated by adjust_growth; an OS failure here leaves
        // the manager unable to honor space it already promised.
        assert!(grown, "committing over reserved space should always succeed");
        // Safety: the freshly committed range holds no live data.
        unsafe { inner.record_free_space(chunk_start, adjusted) };
        inner.check_bin_free_space();
        log::debug!(
            "heap grown by {adjusted} bytes after GC ({} of {} committed)",
            inner.region.committed_size(),
            inner.region.reserved_size()
        );
        adjusted
    }

    /// Committed space never returns to the OS in this design: without
    /// evacuation there is no way to guarantee the trailing chunk is free.
    /// Always returns 0.
    pub fn shrink_after_gc(&self, _delta: usize) -> usize {
        0
    }

    /// Dead-mark every free chunk and empty the bins, leaving the heap
    /// linearly parsable (each free range carries a dead header a walker can
    /// step over). The tracked total drops to zero; the next sweep rebuilds
    /// the index.
    pub fn make_parsable(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut dismissed = 0usize;
        for bin in 0..NUM_BINS {
            if let Some((head, size, _)) = inner.bins[bin].take_all() {
                let mut cur = Some(head);
                while let Some(chunk) = cur {
                    inner.untrack(chunk);
                    // Safety: chunk is a formatted free chunk we just detached.
                    unsafe {
                        let chunk_size = FreeChunk::size(chunk);
                        cur = FreeChunk::next(chunk);
                        FreeChunk::format_dark(chunk, chunk_size);
                    }
                }
                dismissed += size;
            }
        }
        inner.total_free_chunk_space = 0;
        inner.update_tlab_bin();
        inner.check_bin_free_space();
        log::debug!("made heap parsable: {dismissed} free bytes dead-marked");
    }

    /// Diagnostic snapshot. Per-bin detail stays internal; these totals are
    /// what monitoring needs.
    pub fn stats(&self) -> SpaceStats {
        let inner = self.inner.lock().unwrap();
        SpaceStats {
            reserved: inner.region.reserved_size(),
            committed: inner.region.committed_size(),
            free_chunk_space: inner.total_free_chunk_space,
            free_chunks: inner.bins.iter().map(|b| b.total_chunks).sum(),
            dark_matter: inner.dark_matter,
        }
    }

    #[cfg(test)]
    pub(crate) fn bin_totals(&self) -> [(usize, usize); NUM_BINS] {
        let inner = self.inner.lock().unwrap();
        std::array::from_fn(|i| (inner.bins[i].total_chunks, inner.bins[i].total_size))
    }

    /// Committed range bounds, for tests standing in for the collector.
    #[cfg(test)]
    pub(crate) fn committed_bounds(&self) -> (NonNull<u8>, NonNull<u8>) {
        let inner = self.inner.lock().unwrap();
        (inner.region.start(), inner.region.committed_end())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SpaceStats {
    pub reserved: usize,
    pub committed: usize,
    pub free_chunk_space: usize,
    pub free_chunks: usize,
    /// Untracked sub-threshold bytes since the last sweep began.
    pub dark_matter: usize,
}

static GLOBAL_SPACE_MANAGER: OnceLock<SpaceManager> = OnceLock::new();

/// Process-wide singleton: one free-space manager per managed heap,
/// initialized once at startup, torn down at process exit.
pub struct GlobalSpaceManager;

impl GlobalSpaceManager {
    /// Initialize the global manager.
    ///
    /// # Errors
    ///
    /// `HeapError::Vm` if the heap cannot be reserved or committed, or an
    /// `InitializationFailed` if a manager already exists.
    pub fn init(config: &SpaceManagerConfig) -> Result<(), HeapError> {
        let manager = SpaceManager::initialize(config)?;
        GLOBAL_SPACE_MANAGER.set(manager).map_err(|_| {
            HeapError::Vm(VmError::InitializationFailed(
                "global space manager already initialized".to_string(),
            ))
        })
    }

    pub fn get() -> Option<&'static SpaceManager> {
        GLOBAL_SPACE_MANAGER.get()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    pub(crate) fn small_heap(initial: usize) -> SpaceManager {
        SpaceManager::initialize(&SpaceManagerConfig {
            reserved_size: 8 * 1024 * 1024,
            initial_size: initial,
            large_object_min_size: 64 * 1024,
            min_reclaimable_size: 64,
            ..SpaceManagerConfig::default()
        })
        .unwrap()
    }

    /// A collector stub that records invocations and never recovers space.
    struct NoProgress {
        calls: u32,
    }

    impl CollectGarbage for NoProgress {
        fn collect_garbage(&mut self, _requested: usize) -> bool {
            self.calls += 1;
            false
        }
    }

    #[test]
    fn test_initial_space_is_binned_and_allocatable() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(1024 * 1024);
        let free = heap.free_space_left();
        assert!(free >= 1024 * 1024);
        assert_eq!(free, heap.total_space());

        let mut gc = NoProgress { calls: 0 };
        let p = heap.allocate(4096, &mut gc).unwrap();
        assert_eq!(gc.calls, 0);
        assert_eq!(heap.free_space_left(), free - 4096);
        // Zeroed, ready to use.
        // Safety: Test code.
        unsafe {
            for i in 0..4096 {
                assert_eq!(p.as_ptr().add(i).read(), 0);
            }
        }
    }

    #[test]
    fn test_bin_index_mapping() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        assert_eq!(heap.bin_index(64), 0);
        assert_eq!(heap.bin_index(64 * 1024 - 1), 0);
        assert_eq!(heap.bin_index(64 * 1024), 1);
        assert_eq!(heap.bin_index(200 * 1024), 3);
        // last bin is unbounded above
        assert_eq!(heap.bin_index(usize::MAX), NUM_BINS - 1);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(1024 * 1024);
        let mut gc = NoProgress { calls: 0 };
        let mut regions: Vec<(usize, usize)> = Vec::new();
        let sizes = [64, 4096, 128, 64 * 1024, 256, 1024, 32 * 1024, 64];
        for (i, &size) in sizes.iter().cycle().take(64).enumerate() {
            let p = heap.allocate(size, &mut gc).unwrap();
            // Safety: Test code.
            unsafe { p.as_ptr().write_bytes((i & 0xFF) as u8, size) };
            regions.push((p.as_ptr() as usize, size));
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            let (a, a_len) = pair[0];
            let (b, _) = pair[1];
            assert!(a + a_len <= b, "allocated regions overlap");
        }
    }

    #[test]
    fn test_split_leftover_is_rebinned() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // One 200 KiB chunk; carve 100 KiB and the 100 KiB leftover must land
        // in the bin its new size maps to (bin 1 for a 64 KiB bin width).
        let heap = small_heap(0);
        assert_eq!(heap.grow_after_gc(200 * 1024), 200 * 1024);
        assert_eq!(heap.bin_totals()[heap.bin_index(200 * 1024)].0, 1);

        let mut gc = NoProgress { calls: 0 };
        let p = heap.allocate(100 * 1024, &mut gc).unwrap();
        assert_eq!(heap.free_space_left(), 100 * 1024);
        let totals = heap.bin_totals();
        assert_eq!(totals[heap.bin_index(100 * 1024)], (1, 100 * 1024));
        // Low-end carve: the leftover sits right past the allocation.
        let stats = heap.stats();
        assert_eq!(stats.dark_matter, 0);
        // Safety: Test code.
        unsafe { p.as_ptr().write_bytes(0xAB, 100 * 1024) };
    }

    #[test]
    fn test_sub_threshold_leftover_becomes_dark_matter() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        // 4 KiB chunk, request 4 KiB - 32: leftover 32 < 64 cutoff.
        assert!(heap.grow_after_gc(1) >= 4096);
        let committed = heap.total_space();
        let mut gc = NoProgress { calls: 0 };
        let request = committed - 32;
        let _p = heap.allocate(request, &mut gc).unwrap();
        assert_eq!(heap.free_space_left(), 0);
        assert_eq!(heap.stats().dark_matter, 32);
        // The dark remainder is never allocatable again.
        assert!(!heap.can_satisfy_allocation(16));
        assert!(heap.allocate(16, &mut gc).is_err());
    }

    #[test]
    fn test_oom_after_unproductive_collection() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Exactly one 64 KiB chunk of free space: the first allocation
        // empties it, the second triggers a collection and fails.
        let heap = small_heap(0);
        assert_eq!(heap.grow_after_gc(64 * 1024), 64 * 1024);

        let mut gc = NoProgress { calls: 0 };
        heap.allocate(64 * 1024, &mut gc).unwrap();
        assert_eq!(gc.calls, 0);
        assert_eq!(heap.free_space_left(), 0);

        let err = heap.allocate(64 * 1024, &mut gc).unwrap_err();
        assert_eq!(gc.calls, 1);
        match err {
            HeapError::OutOfMemory { requested } => assert_eq!(requested, 64 * 1024),
            other => panic!("expected OutOfMemory, got {other}"),
        }
    }

    #[test]
    fn test_collection_that_grows_the_heap_unblocks_allocation() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        let mut calls = 0u32;
        {
            let mut gc = |_requested: usize| {
                calls += 1;
                heap.grow_after_gc(128 * 1024) > 0
            };
            let p = heap.allocate(64 * 1024, &mut gc);
            assert!(p.is_ok());
        }
        assert_eq!(calls, 1);
    }

    #[test]
    #[should_panic(expected = "not progressing")]
    fn test_non_progressing_collector_is_fatal() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        // Claims success forever, never frees anything.
        let mut gc = |_requested: usize| true;
        let _ = heap.allocate(4096, &mut gc);
    }

    #[test]
    fn test_exact_fit_removes_whole_chunk() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        assert_eq!(heap.grow_after_gc(64 * 1024), 64 * 1024);
        let mut gc = NoProgress { calls: 0 };
        // Request the chunk's exact size: no split, no dark matter.
        heap.allocate(64 * 1024, &mut gc).unwrap();
        assert_eq!(heap.free_space_left(), 0);
        assert_eq!(heap.stats().dark_matter, 0);
        assert_eq!(heap.stats().free_chunks, 0);
    }

    #[test]
    fn test_can_satisfy_allocation_is_read_only() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        assert!(!heap.can_satisfy_allocation(4096));
        heap.grow_after_gc(64 * 1024);
        let before = heap.free_space_left();
        assert!(heap.can_satisfy_allocation(4096));
        assert!(heap.can_satisfy_allocation(64 * 1024));
        assert!(!heap.can_satisfy_allocation(64 * 1024 + 8));
        assert_eq!(heap.free_space_left(), before);
    }

    #[test]
    fn test_grow_is_granularity_rounded_and_capped() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(0);
        let grown = heap.grow_after_gc(1);
        assert!(grown >= 4096 || grown == heap.total_capacity());
        assert_eq!(grown % 4096, 0);
        // Exhaust the reservation; further growth returns 0.
        let rest = heap.grow_after_gc(usize::MAX);
        assert_eq!(grown + rest, heap.total_capacity());
        assert_eq!(heap.grow_after_gc(4096), 0);
        assert_eq!(heap.free_space_left(), heap.total_space());
    }

    #[test]
    fn test_shrink_is_a_documented_noop() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(1024 * 1024);
        assert_eq!(heap.shrink_after_gc(512 * 1024), 0);
        assert_eq!(heap.total_space(), heap.free_space_left());
    }

    #[test]
    fn test_make_parsable_empties_the_index() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = small_heap(1024 * 1024);
        assert!(heap.free_space_left() > 0);
        heap.make_parsable();
        assert_eq!(heap.free_space_left(), 0);
        assert_eq!(heap.stats().free_chunks, 0);
        assert!(!heap.can_satisfy_allocation(64));
    }
}
