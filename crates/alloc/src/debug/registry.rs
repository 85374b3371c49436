//! Debug verification registry
//!
//! Subscribers registered here are told about every free performed by a
//! [`DebugAllocator`](crate::allocator::DebugAllocator) bound to the
//! registry, while the freed payload is still readable. The registry also
//! tracks its debug allocators so one call can verify every live block.
//!
//! Registrations are append-only. Lists are guarded by `parking_lot` locks
//! and callbacks run on a snapshot, so a callback may register further
//! callbacks or trigger verification without deadlocking.

use core::fmt;
use core::ptr::NonNull;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{self, FatalPolicy};
use crate::error::{MemoryError, MemoryResult};
use crate::fatal;
use crate::location::SourceLocation;

#[cfg(feature = "logging")]
use tracing::debug;

static GLOBAL: LazyLock<Arc<DebugRegistry>> = LazyLock::new(|| Arc::new(DebugRegistry::build(None)));

/// Details of a block being freed through a debug allocator
pub struct FreeEvent<'a> {
    pub(crate) allocator: &'a str,
    pub(crate) ptr: NonNull<u8>,
    pub(crate) contents: &'a [u8],
    pub(crate) location: SourceLocation,
}

impl<'a> FreeEvent<'a> {
    /// Name of the debug allocator performing the free
    pub fn allocator(&self) -> &'a str {
        self.allocator
    }

    /// Payload pointer the client is releasing
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Requested size of the payload
    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// Final contents of the payload
    pub fn contents(&self) -> &'a [u8] {
        self.contents
    }

    /// Where the free was issued
    pub fn location(&self) -> SourceLocation {
        self.location
    }
}

impl fmt::Debug for FreeEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeEvent")
            .field("allocator", &self.allocator)
            .field("ptr", &self.ptr)
            .field("size", &self.size())
            .field("location", &self.location)
            .finish()
    }
}

/// Subscriber notified on every debug free
pub trait FreeCallback: Send + Sync {
    fn on_free(&self, event: &FreeEvent<'_>);
}

impl<F> FreeCallback for F
where
    F: Fn(&FreeEvent<'_>) + Send + Sync,
{
    fn on_free(&self, event: &FreeEvent<'_>) {
        self(event);
    }
}

/// Something holding live debug blocks that can be checked for corruption
pub(crate) trait VerifyBlocks: Send + Sync {
    fn verify_blocks(&self, detected_at: SourceLocation) -> MemoryResult<()>;
}

/// Process-wide (or test-local) list of free callbacks and tracked debug
/// allocators
pub struct DebugRegistry {
    policy: Option<FatalPolicy>,
    callbacks: RwLock<Vec<Arc<dyn FreeCallback>>>,
    tracked: Mutex<Vec<Weak<dyn VerifyBlocks>>>,
}

impl DebugRegistry {
    fn build(policy: Option<FatalPolicy>) -> Self {
        Self {
            policy,
            callbacks: RwLock::new(Vec::new()),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Creates an isolated registry that follows the process fatal policy
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Creates an isolated registry with its own fatal policy
    pub fn with_policy(policy: FatalPolicy) -> Arc<Self> {
        Arc::new(Self::build(Some(policy)))
    }

    /// The process-wide registry used by default-constructed debug
    /// allocators
    pub fn global() -> &'static Arc<Self> {
        &GLOBAL
    }

    /// Appends a subscriber; it stays registered for the registry's lifetime
    pub fn register_callbacks(&self, callbacks: impl FreeCallback + 'static) {
        let mut list = self.callbacks.write();
        list.push(Arc::new(callbacks));

        #[cfg(feature = "logging")]
        debug!(count = list.len(), "debug free callbacks registered");
    }

    /// Number of registered subscribers
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Number of debug allocators still alive and bound to this registry
    pub fn tracked_count(&self) -> usize {
        let mut tracked = self.tracked.lock();
        tracked.retain(|weak| weak.strong_count() > 0);
        tracked.len()
    }

    pub(crate) fn track(&self, blocks: Weak<dyn VerifyBlocks>) {
        let mut tracked = self.tracked.lock();
        tracked.retain(|weak| weak.strong_count() > 0);
        tracked.push(blocks);
    }

    pub(crate) fn notify_free(&self, event: &FreeEvent<'_>) {
        let snapshot: Vec<_> = self.callbacks.read().clone();
        for callback in &snapshot {
            callback.on_free(event);
        }
    }

    /// Checks every live block of every tracked allocator
    ///
    /// # Errors
    /// Returns the first [`MemoryError::Corruption`] found.
    pub fn check_all(&self, detected_at: SourceLocation) -> MemoryResult<()> {
        let live: Vec<_> = {
            let mut tracked = self.tracked.lock();
            tracked.retain(|weak| weak.strong_count() > 0);
            tracked.iter().filter_map(Weak::upgrade).collect()
        };

        live.iter()
            .try_for_each(|blocks| blocks.verify_blocks(detected_at))
    }

    /// Verifies every tracked allocator, treating corruption as fatal
    #[track_caller]
    pub fn verify_all(&self) {
        self.verify_all_at(SourceLocation::caller());
    }

    /// [`verify_all`](Self::verify_all) with an explicit location
    pub fn verify_all_at(&self, location: SourceLocation) {
        if let Err(err) = self.check_all(location) {
            self.fatal(&err, location);
        }
    }

    pub(crate) fn fatal(&self, err: &MemoryError, location: SourceLocation) -> ! {
        let policy = self
            .policy
            .unwrap_or_else(|| config::current().fatal_policy);
        fatal::raise(policy, err, location)
    }
}

impl fmt::Debug for DebugRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugRegistry")
            .field("policy", &self.policy)
            .field("callbacks", &self.callback_count())
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
