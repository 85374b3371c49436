//! # nebula-alloc
//!
//! Composable memory allocators behind one interface.
//!
//! Every strategy implements [`Allocator`](allocator::Allocator) and most of
//! them are proxies over a parent allocator, so they stack:
//!
//! - [`GlobalHeap`](allocator::GlobalHeap): the C runtime heap, always available
//! - [`FixedPoolAllocator`](allocator::FixedPoolAllocator): fixed-size slots
//!   carved from one parent block
//! - [`ArenaProxyAllocator`](allocator::ArenaProxyAllocator): frees everything
//!   it handed out when dropped
//! - [`TrackerProxyAllocator`](allocator::TrackerProxyAllocator): exact byte and
//!   block counts
//! - [`DebugAllocator`](allocator::DebugAllocator): guard bytes, poisoning and
//!   free callbacks
//!
//! On top sit the null-routing [`api`] (a `None` handle means the global
//! heap), typed arrays with a length header ([`array`]) and single-object
//! placement ([`object`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_alloc::prelude::*;
//!
//! let tracker = TrackerProxyAllocator::new(global_heap());
//! {
//!     let arena = ArenaProxyAllocator::new(&tracker);
//!     let scratch = api::allocate(Some(&arena), 256);
//!     let names = TypedArray::<String>::new_in(Some(&arena), 4)?;
//!     assert_eq!(names.len(), 4);
//!     # let _ = scratch;
//! }
//! // The arena released everything through the tracker.
//! assert_eq!(tracker.stats().allocated_count, 0);
//! # Ok::<(), nebula_alloc::MemoryError>(())
//! ```
//!
//! ## Features
//!
//! - `logging` (default): allocator lifecycle and fatal conditions through
//!   `tracing`
//!
//! ## Threading
//!
//! Allocator instances are single-threaded (`!Sync`); share them by
//! reference within one thread. The global heap and the debug registry are
//! safe to use from any thread.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Header and slot pointers are aligned by construction
#![allow(clippy::cast_ptr_alignment)]

pub mod allocator;
pub mod api;
pub mod array;
pub mod config;
pub mod debug;
pub mod error;
pub mod fatal;
pub mod location;
pub mod object;
pub mod utils;

pub use config::{AllocatorConfig, DebugConfig, FatalPolicy};
pub use error::{AllocError, AllocResult, MemoryError, MemoryResult};
pub use location::SourceLocation;

#[cfg(feature = "logging")]
use tracing::{debug, info};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs the process-wide configuration
///
/// Optional: without it the defaults of [`AllocatorConfig::default`] apply.
/// Debug allocators created afterwards pick up the new
/// [`DebugConfig`]; existing ones keep theirs.
///
/// # Example
///
/// ```
/// nebula_alloc::init(nebula_alloc::AllocatorConfig::debug())?;
/// # Ok::<(), nebula_alloc::MemoryError>(())
/// ```
pub fn init(config: AllocatorConfig) -> MemoryResult<()> {
    config::install(config)?;

    #[cfg(feature = "logging")]
    info!(version = VERSION, "allocator framework initialized");

    Ok(())
}

/// Verifies every debug allocator on the global registry and restores the
/// default configuration
///
/// Corruption found here is fatal.
#[track_caller]
pub fn shutdown() {
    debug::DebugRegistry::global().verify_all_at(SourceLocation::caller());

    config::reset();

    #[cfg(feature = "logging")]
    debug!(
        checked_bytes = api::allocated_memory(),
        "allocator framework shut down"
    );
}

/// Everyday imports
pub mod prelude {
    pub use crate::allocator::{
        Allocator, ArenaProxyAllocator, DebugAllocator, FixedPoolAllocator, GlobalHeap,
        TrackerProxyAllocator, TrackerStats, global_heap,
    };
    pub use crate::api::{self, AllocatorRef};
    pub use crate::array::{ArrayElement, TypedArray};
    pub use crate::debug::{DebugRegistry, FreeEvent};
    pub use crate::error::{AllocError, AllocResult, MemoryError, MemoryResult};
    pub use crate::here;
    pub use crate::location::SourceLocation;
    pub use crate::object::{delete_in, new_in};
}
