//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., committed may briefly disagree with the region's own
//! bookkeeping while a grow is in flight). This is acceptable for diagnostic
//! display. Do NOT use these values for allocation decisions — the manager's
//! mutex-protected totals are the authoritative state.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    /// Overwrite the gauge with an absolute value (sweep summaries).
    #[inline]
    pub fn set(&self, val: usize) {
        self.0.store(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved for the managed heap
crate::sync::static_atomic! {
    pub static HEAP_RESERVED: Counter = Counter::new();
}
// Physical memory committed to the managed heap
crate::sync::static_atomic! {
    pub static HEAP_COMMITTED: Counter = Counter::new();
}
// Free chunk bytes as of the last completed sweep
crate::sync::static_atomic! {
    pub static SWEPT_FREE_BYTES: Counter = Counter::new();
}
// Untracked sub-threshold gap bytes discovered by the last sweep
crate::sync::static_atomic! {
    pub static DARK_MATTER_BYTES: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Process-wide snapshot of the heap gauges, for monitoring display.
#[derive(Clone, Copy, Debug)]
pub struct GlobalHeapStats {
    pub reserved: usize,
    pub committed: usize,
    /// Free chunk bytes as of the last completed sweep.
    pub swept_free: usize,
    /// Dark matter bytes discovered by the last completed sweep.
    pub dark_matter: usize,
}

pub fn global_stats() -> GlobalHeapStats {
    GlobalHeapStats {
        reserved: HEAP_RESERVED.get(),
        committed: HEAP_COMMITTED.get(),
        swept_free: SWEPT_FREE_BYTES.get(),
        dark_matter: DARK_MATTER_BYTES.get(),
    }
}
