//! Debug verification: free callbacks and whole-process block checks
//!
//! The free functions here operate on [`DebugRegistry::global`]; tests and
//! tools that want isolation construct their own registry and bind debug
//! allocators to it with
//! [`DebugAllocator::with_registry`](crate::allocator::DebugAllocator::with_registry).

mod registry;

pub(crate) use registry::VerifyBlocks;
pub use registry::{DebugRegistry, FreeCallback, FreeEvent};

/// Registers `callbacks` on the process-wide registry
pub fn register_debug_callbacks(callbacks: impl FreeCallback + 'static) {
    DebugRegistry::global().register_callbacks(callbacks);
}

/// Verifies every debug allocator on the process-wide registry
///
/// Corruption is fatal and reported with the caller's location.
#[track_caller]
pub fn verify_all() {
    DebugRegistry::global().verify_all();
}
