#[cfg(not(target_pointer_width = "64"))]
compile_error!("sweepbin supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// manager + config
pub use heap::space::{
    CollectGarbage, GlobalSpaceManager, HeapError, SpaceManager, SpaceManagerConfig, SpaceStats,
};

// chunk header access for TLAB/refill consumers
pub use heap::chunk::{FreeChunk, CHUNK_HEADER_SIZE, MIN_OBJECT_SIZE};

// sweep protocol
pub use heap::sweep::{LiveCell, SweepVerifier};

// refill boundary
pub use heap::refill::{FreeRange, RefillContract, RefillPolicy};

// process-wide diagnostic gauges
pub use heap::stats::{global_stats, GlobalHeapStats};

// errors
pub use heap::vm::VmError;
