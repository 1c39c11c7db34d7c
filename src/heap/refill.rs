//! Refill contract for external bump allocators.
//!
//! Mutator-side linear allocators (TLAB dispensers, evacuation buffers) own a
//! span of heap memory and bump through it. When a span runs low they hand
//! the unusable remainder back and ask for a fresh chunk. The manager decides
//! both halves of that conversation: when a remainder is too small to keep
//! bumping, and which chunk replaces it.

#[cfg(test)]
use super::chunk::FreeChunk;
use super::space::{CollectGarbage, HeapError, SpaceManager};
use std::ptr::NonNull;

/// Sizing knobs of the refill contract, fixed at initialization.
#[derive(Clone, Copy, Debug)]
pub struct RefillPolicy {
    /// Target size of a replacement chunk.
    pub refill_size: usize,
    /// A span with less than this left should be retired.
    pub refill_threshold: usize,
    /// Smallest remainder worth re-entering into the bins; anything smaller
    /// is written off as dark matter.
    pub min_chunk_size: usize,
}

/// A span remainder a bump allocator hands back when retiring its span.
#[derive(Clone, Copy, Debug)]
pub struct FreeRange {
    pub ptr: NonNull<u8>,
    pub size: usize,
}

/// The manager as seen from a bump allocator.
pub trait RefillContract {
    fn refill_policy(&self) -> RefillPolicy;

    /// Whether a span with `space_left` bytes should be retired rather than
    /// serve a `requested`-byte allocation. Requests larger than the refill
    /// size never go through a span at all.
    fn should_refill(&self, requested: usize, space_left: usize) -> bool;

    /// Retire a span: re-enter its remainder and hand out a fresh chunk.
    ///
    /// The returned chunk keeps its header; the caller reads the actual
    /// length (at least the refill size, often more) via [`FreeChunk::size`]
    /// before reformatting the span for bumping.
    ///
    /// # Errors
    ///
    /// `HeapError::OutOfMemory` once the collector can recover nothing more.
    ///
    /// # Safety
    /// `spare` must describe committed, word-aligned memory owned by the
    /// caller, with no live data and no other view over it.
    unsafe fn refill(
        &self,
        spare: Option<FreeRange>,
        gc: &mut dyn CollectGarbage,
    ) -> Result<NonNull<u8>, HeapError>;
}

impl RefillContract for SpaceManager {
    fn refill_policy(&self) -> RefillPolicy {
        self.policy
    }

    fn should_refill(&self, requested: usize, space_left: usize) -> bool {
        requested <= self.policy.refill_size && space_left < self.policy.refill_threshold
    }

    unsafe fn refill(
        &self,
        spare: Option<FreeRange>,
        gc: &mut dyn CollectGarbage,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = self.policy.refill_size;
        let mut gc_attempts = 0u32;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.assert_idle("refill");
                if let Some(FreeRange { ptr, size: spare_size }) = spare.filter(|_| gc_attempts == 0) {
                    if spare_size >= self.policy.min_chunk_size {
                        // Safety: upheld by caller.
                        unsafe { inner.record_free_space(ptr, spare_size) };
                    } else if spare_size > 0 {
                        // Safety: upheld by caller.
                        unsafe { inner.discard_dark_matter(ptr, spare_size) };
                    }
                }
                if let Some(found) = inner.bin_try_allocate(self.cfg.bin_index(size), size, false) {
                    return Ok(found);
                }
            }
            gc_attempts += 1;
            assert!(
                gc_attempts <= super::space::MAX_GC_ATTEMPTS,
                "{gc_attempts} collection cycles without satisfying a {size}-byte refill; \
                 the collector is not progressing"
            );
            if !gc.collect_garbage(size) {
                return Err(HeapError::OutOfMemory { requested: size });
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::space::SpaceManagerConfig;

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
    fn test_should_refill_threshold() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        let policy = h.refill_policy();
        assert_eq!(policy.refill_size, 64 * 1024);

        assert!(h.should_refill(64, policy.refill_threshold - 1));
        assert!(!h.should_refill(64, policy.refill_threshold));
        // Oversized requests bypass the span entirely.
        assert!(!h.should_refill(policy.refill_size + 8, 0));
    }

    #[test]
    fn test_refill_hands_out_a_whole_chunk() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        h.grow_after_gc(128 * 1024);
        let mut gc = NoGc;
        // Safety: Test code.
        let chunk = unsafe { h.refill(None, &mut gc) }.unwrap();
        // Not an exact fit: the whole 128 KiB chunk comes out, header intact.
        // Safety: Test code.
        let got = unsafe { FreeChunk::size(chunk) };
        assert_eq!(got, 128 * 1024);
        assert_eq!(h.free_space_left(), 0);
    }

    #[test]
    fn test_refill_reenters_the_spare() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        h.grow_after_gc(256 * 1024);
        let mut gc = NoGc;
        // Simulate a retiring span: take a chunk, keep a 4 KiB remainder.
        let p = h.allocate(64 * 1024, &mut gc).unwrap();
        let before = h.free_space_left();
        let spare = FreeRange { ptr: p, size: 4096 };
        // Safety: Test code.
        let chunk = unsafe { h.refill(Some(spare), &mut gc) }.unwrap();
        // Safety: Test code.
        let got = unsafe { FreeChunk::size(chunk) };
        assert_eq!(h.free_space_left(), before + 4096 - got);
        // The spare is allocatable again.
        assert!(h.can_satisfy_allocation(4096 - 16));
    }

    #[test]
    fn test_sub_threshold_spare_is_written_off() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        h.grow_after_gc(128 * 1024);
        let mut gc = NoGc;
        let p = h.allocate(1024, &mut gc).unwrap();
        let before = h.free_space_left();
        let spare = FreeRange { ptr: p, size: 32 };
        // Safety: Test code.
        let chunk = unsafe { h.refill(Some(spare), &mut gc) };
        assert!(chunk.is_ok());
        assert!(h.free_space_left() < before);
        assert_eq!(h.stats().dark_matter, 32);
    }

    #[test]
    fn test_refill_on_an_empty_heap_reports_oom() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let h = heap(0);
        let mut gc = NoGc;
        // Safety: Test code.
        let err = unsafe { h.refill(None, &mut gc) }.unwrap_err();
        match err {
            HeapError::OutOfMemory { requested } => assert_eq!(requested, 64 * 1024),
            other => panic!("expected OutOfMemory, got {other}"),
        }
    }
}
