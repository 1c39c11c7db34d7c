//! The stop-the-world sweep protocol.
//!
//! After marking, the collector walks the committed region in address order
//! and feeds the manager what it finds. `begin_sweep` throws away the entire
//! free-space index; the `process_*` callbacks rebuild it chunk by chunk;
//! `end_sweep` finalizes the bins and reopens the heap for allocation. The
//! index afterwards holds exactly what the collector reported, nothing more.
//! The world is stopped for the whole window, so the mutex is uncontended;
//! holding the phase in the same lock-protected state still lets every entry
//! point assert the protocol is respected.
//!
//! The callbacks must arrive in strict address order. Gaps below the
//! dark-matter cutoff are dead-marked in place and never tracked again.

use super::chunk::{FreeChunk, MIN_OBJECT_SIZE, WORD_SIZE};
use super::space::SpaceManager;
use super::stats;
use std::ptr::NonNull;

/// Phase of the sweep protocol. Allocation entry points are only legal in
/// `Idle`; the `process_*` callbacks only in `Sweeping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SweepPhase {
    Idle,
    Sweeping,
}

/// A live object (or run of live objects) the collector found during its
/// address-ordered walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveCell {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

impl LiveCell {
    pub fn new(ptr: NonNull<u8>, size: usize) -> Self {
        debug_assert_eq!(size % WORD_SIZE, 0, "live cell size {size} is not word-aligned");
        Self { ptr, size }
    }

    /// One past the cell's last byte.
    pub fn end(&self) -> NonNull<u8> {
        // Safety: a live cell lies entirely within the committed region.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.size)) }
    }
}

/// Observer for [`SpaceManager::verify_with`]: called once per tracked free
/// chunk, in bin order, while the built-in containment and alignment checks
/// run. Lets a collector cross-check the rebuilt index against its own mark
/// state.
pub trait SweepVerifier {
    fn verify_chunk(&mut self, chunk: NonNull<u8>, size: usize, bin: usize);
}

impl SpaceManager {
    /// Open a sweep: drop the whole free-space index and reset the sweep
    /// cursor to the start of the heap. `precise` records whether the
    /// collector will walk object by object or report measured dead ranges.
    /// Returns the dark-matter cutoff so the collector knows which dead
    /// ranges are worth reporting.
    pub fn begin_sweep(&self, precise: bool) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.assert_idle("begin_sweep");
        inner.phase = SweepPhase::Sweeping;
        inner.precise_sweep = precise;
        for bin in &mut inner.bins {
            bin.reset();
        }
        inner.total_free_chunk_space = 0;
        inner.dark_matter = 0;
        inner.use_tlab_bin = false;
        inner.sweep_cursor = inner.region.start();
        #[cfg(debug_assertions)]
        inner.clear_tracking();
        log::debug!(
            "{} sweep started over {} committed bytes, cutoff {}",
            if precise { "precise" } else { "imprecise" },
            inner.region.committed_size(),
            self.cfg.min_reclaimable
        );
        self.cfg.min_reclaimable
    }

    /// Record a dead range the collector measured itself. Ranges below the
    /// cutoff become dark matter. Advances the cursor past the range.
    pub fn process_dead_space(&self, start: NonNull<u8>, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.phase == SweepPhase::Sweeping,
            "process_dead_space outside a sweep"
        );
        debug_assert!(
            start.as_ptr() >= inner.sweep_cursor.as_ptr(),
            "sweep callbacks out of address order"
        );
        // Safety: the collector reports ranges within the committed region.
        let end = unsafe { NonNull::new_unchecked(start.as_ptr().add(size)) };
        debug_assert!(
            end.as_ptr().cast_const() <= inner.region.committed_end().as_ptr().cast_const(),
            "dead range past the committed end"
        );
        if size >= self.cfg.min_reclaimable {
            // Safety: a reported dead range holds no live data.
            unsafe { inner.record_free_space(start, size) };
        } else if size > 0 {
            // Safety: as above.
            unsafe { inner.discard_dark_matter(start, size) };
            log::trace!("dark matter: {size} bytes at {:p}", start.as_ptr());
        }
        inner.sweep_cursor = end;
    }

    /// Record a live cell. The gap between the cursor and the cell start is
    /// dead and gets tracked or dead-marked by size; the cursor moves to the
    /// cell's end, which is returned so the collector can resume its walk
    /// there.
    pub fn process_live_object(&self, cell: LiveCell) -> NonNull<u8> {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.phase == SweepPhase::Sweeping,
            "process_live_object outside a sweep"
        );
        let cursor = inner.sweep_cursor;
        debug_assert!(
            cell.ptr.as_ptr() >= cursor.as_ptr(),
            "sweep callbacks out of address order"
        );
        let gap = cell.ptr.as_ptr() as usize - cursor.as_ptr() as usize;
        if gap >= self.cfg.min_reclaimable {
            // Safety: the range up to a live cell's start is dead.
            unsafe { inner.record_free_space(cursor, gap) };
        } else if gap > 0 {
            // Safety: as above.
            unsafe { inner.discard_dark_matter(cursor, gap) };
            log::trace!("dark matter: {gap} bytes at {:p}", cursor.as_ptr());
        }
        inner.sweep_cursor = cell.end();
        inner.sweep_cursor
    }

    /// Shortcut for a gap bounded by two live cells far apart: records the
    /// dead middle under the usual cutoff rule without the collector having
    /// to walk it cell by cell. Both bounding cells count as visited; the
    /// cursor moves to the right cell's end, which is returned.
    pub fn process_large_gap(&self, left: LiveCell, right: LiveCell) -> NonNull<u8> {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.phase == SweepPhase::Sweeping,
            "process_large_gap outside a sweep"
        );
        let gap_start = left.end();
        debug_assert!(
            gap_start.as_ptr() >= inner.sweep_cursor.as_ptr()
                && right.ptr.as_ptr() >= gap_start.as_ptr(),
            "sweep callbacks out of address order"
        );
        let size = right.ptr.as_ptr() as usize - gap_start.as_ptr() as usize;
        if size >= self.cfg.min_reclaimable {
            // Safety: the range between two live cells is dead.
            unsafe { inner.record_free_space(gap_start, size) };
        } else if size > 0 {
            // Safety: as above.
            unsafe { inner.discard_dark_matter(gap_start, size) };
            log::trace!("dark matter: {size} bytes at {:p}", gap_start.as_ptr());
        }
        inner.sweep_cursor = right.end();
        inner.sweep_cursor
    }

    /// Close the sweep: the phase returns to `Idle` and allocation reopens.
    /// The index holds exactly what the collector reported; a dead tail the
    /// collector never mentioned stays unknown to the manager. Returns the
    /// total free chunk space the sweep recovered.
    pub fn end_sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.phase == SweepPhase::Sweeping, "end_sweep outside a sweep");
        inner.phase = SweepPhase::Idle;
        inner.update_tlab_bin();
        inner.check_bin_free_space();
        stats::SWEPT_FREE_BYTES.set(inner.total_free_chunk_space);
        stats::DARK_MATTER_BYTES.set(inner.dark_matter);
        log::debug!(
            "{} sweep finished: {} free bytes in {} chunks, {} bytes of dark matter",
            if inner.precise_sweep { "precise" } else { "imprecise" },
            inner.total_free_chunk_space,
            inner.bins.iter().map(|b| b.total_chunks).sum::<usize>(),
            inner.dark_matter
        );
        inner.total_free_chunk_space
    }

    /// Cross-check the books after a sweep. `free`, `dark` and `live` are
    /// the collector's own tallies from its walk; a mismatch with the
    /// manager's accounting is fatal.
    pub fn verify_usage(&self, free: usize, dark: usize, live: usize) {
        let inner = self.inner.lock().unwrap();
        assert!(
            free == inner.total_free_chunk_space,
            "usage mismatch: collector counted {free} free bytes, manager tracks {}",
            inner.total_free_chunk_space
        );
        let committed = inner.region.committed_size();
        assert!(
            free + dark + live == committed,
            "usage mismatch: free {free} + dark {dark} + live {live} != committed {committed}"
        );
    }

    /// Walk every tracked free chunk, running containment, alignment and
    /// bin-placement checks, and hand each chunk to `v`.
    pub fn verify_with(&self, v: &mut dyn SweepVerifier) {
        let inner = self.inner.lock().unwrap();
        for (bin, list) in inner.bins.iter().enumerate() {
            // Safety: list members are formatted chunks under the lock.
            unsafe {
                list.for_each(|chunk, size| {
                    assert!(
                        inner.region.contains(chunk),
                        "free chunk at {:p} outside the committed region",
                        chunk.as_ptr()
                    );
                    assert_eq!(chunk.as_ptr() as usize % WORD_SIZE, 0, "misaligned free chunk");
                    assert!(size >= MIN_OBJECT_SIZE, "tracked chunk below the minimum cell size");
                    assert_eq!(self.cfg.bin_index(size), bin, "chunk of {size} bytes in the wrong bin");
                    assert!(!FreeChunk::is_dark(chunk), "dead-marked range on a free list");
                    v.verify_chunk(chunk, size, bin);
                });
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::space::{CollectGarbage, SpaceManager, SpaceManagerConfig};

    fn heap(initial: usize) -> SpaceManager {
        SpaceManager::initialize(&SpaceManagerConfig {
            reserved_size: 8 * 1024 * 1024,
            initial_size: initial,
            ..SpaceManagerConfig::default()
        })
        .unwrap()
    }

    struct NoGc;
    impl CollectGarbage for NoGc {
        fn collect_garbage(&mut self, _requested: usize) -> bool {
            false
        }
    }

    #[test]
    fn test_sweep_with_no_live_objects_frees_everything() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let committed = h.total_space();
        // Pin some allocations, then sweep without reporting them live.
        let mut gc = NoGc;
        h.allocate(64 * 1024, &mut gc).unwrap();
        h.allocate(512, &mut gc).unwrap();
        assert!(h.free_space_left() < committed);

        let (start, _) = h.committed_bounds();
        let cutoff = h.begin_sweep(false);
        assert!(cutoff >= 64);
        // One dead range spanning the whole heap.
        h.process_dead_space(start, committed);
        let recovered = h.end_sweep();
        assert_eq!(recovered, committed);
        assert_eq!(h.free_space_left(), committed);
        assert_eq!(h.stats().free_chunks, 1);
        h.verify_usage(committed, 0, 0);
    }

    #[test]
    fn test_empty_sweep_empties_every_bin() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // begin immediately followed by end: the old index is gone and
        // nothing was reported, so no free space remains.
        let h = heap(1024 * 1024);
        assert!(h.free_space_left() > 0);
        h.begin_sweep(true);
        assert_eq!(h.end_sweep(), 0);
        assert_eq!(h.free_space_left(), 0);
        assert_eq!(h.stats().free_chunks, 0);
        assert!(!h.can_satisfy_allocation(64));
        // Only growth can bring such a heap back.
        assert!(h.grow_after_gc(64 * 1024) > 0);
        assert!(h.can_satisfy_allocation(64));
    }

    #[test]
    fn test_sweep_of_empty_heap_recovers_nothing() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        h.begin_sweep(true);
        assert_eq!(h.end_sweep(), 0);
        assert_eq!(h.free_space_left(), 0);
    }

    #[test]
    fn test_live_cells_split_the_heap_into_gaps() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let committed = h.total_space();
        let mut gc = NoGc;
        // Carve two regions; the first dies, the second survives.
        let dead = h.allocate(100 * 1024, &mut gc).unwrap();
        let live = h.allocate(4096, &mut gc).unwrap();
        assert!(dead.as_ptr() < live.as_ptr());

        let (_, end) = h.committed_bounds();
        h.begin_sweep(true);
        let cell = LiveCell::new(live, 4096);
        h.process_live_object(cell);
        let tail = end.as_ptr() as usize - cell.end().as_ptr() as usize;
        h.process_dead_space(cell.end(), tail);
        let recovered = h.end_sweep();
        // Everything but the live cell came back, as two chunks: the gap in
        // front of it and the tail after it.
        assert_eq!(recovered, committed - 4096);
        assert_eq!(h.stats().free_chunks, 2);
        h.verify_usage(committed - 4096, 0, 4096);

        // The recovered space is immediately allocatable.
        assert!(h.can_satisfy_allocation(100 * 1024));
        h.allocate(100 * 1024, &mut gc).unwrap();
    }

    #[test]
    fn test_explicit_dead_space_and_large_gap() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let committed = h.total_space();
        let mut gc = NoGc;
        let a = h.allocate(32 * 1024, &mut gc).unwrap();
        let b = h.allocate(64 * 1024, &mut gc).unwrap();
        let _mid = h.allocate(16 * 1024, &mut gc).unwrap();
        let c = h.allocate(8 * 1024, &mut gc).unwrap();

        let (_, end) = h.committed_bounds();
        h.begin_sweep(false);
        // a dies and the collector measured it itself.
        h.process_dead_space(a, 32 * 1024);
        let b_cell = LiveCell::new(b, 64 * 1024);
        h.process_live_object(b_cell);
        let c_cell = LiveCell::new(c, 8 * 1024);
        // mid dies; the collector skips straight from b to c.
        let resumed = h.process_large_gap(b_cell, c_cell);
        assert_eq!(resumed, c_cell.end());
        let tail = end.as_ptr() as usize - c_cell.end().as_ptr() as usize;
        h.process_dead_space(c_cell.end(), tail);
        let recovered = h.end_sweep();

        assert_eq!(recovered, committed - 64 * 1024 - 8 * 1024);
        h.verify_usage(recovered, 0, 72 * 1024);
    }

    #[test]
    fn test_sub_cutoff_gap_becomes_dark_matter() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let committed = h.total_space();
        let mut gc = NoGc;
        let a = h.allocate(1024, &mut gc).unwrap();
        let b = h.allocate(4096, &mut gc).unwrap();

        let (_, end) = h.committed_bounds();
        h.begin_sweep(true);
        // Only the first 992 bytes of a survive: the 32-byte sliver between
        // a's live end and b is below the 64-byte cutoff.
        h.process_live_object(LiveCell::new(a, 992));
        let b_cell = LiveCell::new(b, 4096);
        h.process_live_object(b_cell);
        let tail = end.as_ptr() as usize - b_cell.end().as_ptr() as usize;
        h.process_dead_space(b_cell.end(), tail);
        let recovered = h.end_sweep();

        let stats = h.stats();
        assert_eq!(stats.dark_matter, 32);
        assert_eq!(recovered + 32 + 992 + 4096, committed);
        h.verify_usage(recovered, 32, 992 + 4096);
        // Dark matter never comes back.
        assert_eq!(h.free_space_left(), recovered);
    }

    #[test]
    fn test_verify_with_walks_every_chunk() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let mut gc = NoGc;
        let live = h.allocate(4096, &mut gc).unwrap();
        let (_, end) = h.committed_bounds();
        h.begin_sweep(true);
        let cell = LiveCell::new(live, 4096);
        h.process_live_object(cell);
        let tail = end.as_ptr() as usize - cell.end().as_ptr() as usize;
        h.process_dead_space(cell.end(), tail);
        h.end_sweep();

        struct Tally {
            chunks: usize,
            bytes: usize,
        }
        impl SweepVerifier for Tally {
            fn verify_chunk(&mut self, _chunk: NonNull<u8>, size: usize, _bin: usize) {
                self.chunks += 1;
                self.bytes += size;
            }
        }
        let mut tally = Tally { chunks: 0, bytes: 0 };
        h.verify_with(&mut tally);
        assert_eq!(tally.chunks, h.stats().free_chunks);
        assert_eq!(tally.bytes, h.free_space_left());
    }

    #[test]
    #[should_panic(expected = "usage mismatch")]
    fn test_verify_usage_rejects_bad_tallies() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let committed = h.total_space();
        let (start, _) = h.committed_bounds();
        h.begin_sweep(true);
        h.process_dead_space(start, committed);
        h.end_sweep();
        h.verify_usage(committed, 0, 4096);
    }

    #[test]
    #[should_panic(expected = "while a sweep is in progress")]
    fn test_allocation_during_sweep_is_fatal() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        h.begin_sweep(true);
        let mut gc = NoGc;
        let _ = h.allocate(64, &mut gc);
    }

    #[test]
    #[should_panic(expected = "outside a sweep")]
    fn test_process_callbacks_require_an_open_sweep() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(1024 * 1024);
        let mut gc = NoGc;
        let p = h.allocate(64, &mut gc).unwrap();
        h.process_dead_space(p, 64);
    }

    #[test]
    #[should_panic(expected = "outside a sweep")]
    fn test_end_sweep_requires_an_open_sweep() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        h.end_sweep();
    }
}
