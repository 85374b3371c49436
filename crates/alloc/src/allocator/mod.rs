//! Allocator interface and the built-in strategies
//!
//! - [`GlobalHeap`]: leaf over the C runtime heap
//! - [`FixedPoolAllocator`]: leaf serving fixed-size slots from one parent block
//! - [`ArenaProxyAllocator`]: proxy that frees everything on drop
//! - [`TrackerProxyAllocator`]: proxy with exact byte/count statistics
//! - [`DebugAllocator`]: proxy with guard bytes and free callbacks

mod arena;
mod debug;
mod heap;
mod pool;
mod tracker;
mod traits;

pub use arena::{ARENA_HEADER_SIZE, ArenaProxyAllocator};
pub use debug::{DebugAllocator, checked_bytes};
pub use heap::{GlobalHeap, global_heap};
pub use pool::FixedPoolAllocator;
pub use tracker::{TRACKER_PREFIX_SIZE, TrackerProxyAllocator, TrackerStats};
pub use traits::{Allocator, ancestry};

pub use crate::error::{AllocError, AllocResult};
