//! The contiguous committed heap region.
//!
//! The whole heap address range is reserved once at startup; physical pages
//! are committed incrementally and only forward. Committed space is never
//! handed back to the OS (no decommit, no compaction) — `shrink` at the
//! manager level is a documented no-op.

use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use std::ptr::NonNull;

pub(crate) struct CommittedRegion {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    /// Platform allocation granularity; growth is rounded to this.
    granularity: usize,
}

// Safety: CommittedRegion owns the reservation and is safe to send between
// threads; all mutation happens under the manager's mutex.
unsafe impl Send for CommittedRegion {}

impl Drop for CommittedRegion {
    fn drop(&mut self) {
        // Safety: base/reserved match the reservation made in `reserve`.
        unsafe {
            drop(PlatformVmOps::release(self.base, self.reserved));
        }
        stats::sub_saturating(&stats::HEAP_RESERVED, self.reserved);
        stats::sub_saturating(&stats::HEAP_COMMITTED, self.committed);
    }
}

impl CommittedRegion {
    /// Reserve address space for a heap of at most `max_size` bytes.
    /// Nothing is committed yet. Failure here is fatal at the call site —
    /// the runtime cannot start without a usable heap.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the OS refuses the reservation.
    pub fn reserve(max_size: usize) -> Result<Self, VmError> {
        let granularity = PlatformVmOps::page_size();
        let reserved = max_size.next_multiple_of(granularity);
        if reserved == 0 {
            return Err(VmError::InitializationFailed(
                "heap reservation of zero bytes".to_string(),
            ));
        }
        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(reserved)? };
        stats::HEAP_RESERVED.add(reserved);
        Ok(Self {
            base,
            reserved,
            committed: 0,
            granularity,
        })
    }

    /// Commit `delta` more bytes at the current committed end.
    ///
    /// `delta` must be granularity-rounded and validated against remaining
    /// reservation headroom via [`adjust_growth`](Self::adjust_growth);
    /// with that done, the only failures left are OS-level and the caller
    /// treats them as fatal.
    pub fn grow_committed_space(&mut self, delta: usize) -> bool {
        debug_assert_eq!(delta % self.granularity, 0, "unrounded growth of {delta} bytes");
        debug_assert!(
            self.committed + delta <= self.reserved,
            "growth of {delta} bytes exceeds reservation headroom"
        );
        if delta == 0 || self.committed + delta > self.reserved {
            return false;
        }
        // Safety: the range lies within our reservation.
        let end = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed)) };
        // Safety: FFI call to commit memory within the reservation.
        if unsafe { PlatformVmOps::commit(end, delta) }.is_err() {
            return false;
        }
        self.committed += delta;
        stats::HEAP_COMMITTED.add(delta);
        true
    }

    /// Round a requested growth up to allocation granularity and cap it at
    /// the remaining reservable capacity. Returns 0 if no growth is possible.
    pub fn adjust_growth(&self, requested_delta: usize) -> usize {
        if requested_delta == 0 {
            return 0;
        }
        let headroom = self.reserved - self.committed;
        let rounded = requested_delta
            .checked_next_multiple_of(self.granularity)
            .unwrap_or(headroom);
        rounded.min(headroom)
    }

    /// Start of the committed (and reserved) range.
    pub fn start(&self) -> NonNull<u8> {
        self.base
    }

    /// One past the last committed byte.
    pub fn committed_end(&self) -> NonNull<u8> {
        // Safety: committed <= reserved, so the offset stays in range.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.committed)) }
    }

    pub fn committed_size(&self) -> usize {
        self.committed
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Whether `ptr` lies within the committed range.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + self.committed
    }
}
