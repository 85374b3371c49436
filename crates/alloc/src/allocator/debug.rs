//! Debug (checked) allocator
//!
//! Proxy that surrounds every payload with guard bytes and keeps a side
//! table of live blocks keyed by payload address.
//!
//! # Memory Layout
//! ```text
//! [front guard][payload: size bytes][tail guard]
//!  guard_size                         guard_size
//! ```
//!
//! # Safety
//!
//! - The side table is the only authority on which payloads are live;
//!   `free`/`reallocate` on an address missing from it is a contract
//!   violation and panics
//! - A record is removed before its block is released, so verification
//!   never reads freed memory
//! - `guard_size` is a multiple of the metadata alignment, so payloads keep
//!   the parent's alignment

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::Allocator;
use crate::config::{self, DebugConfig};
use crate::debug::{DebugRegistry, FreeEvent, VerifyBlocks};
use crate::error::{AllocError, AllocResult, MemoryResult};
use crate::location::SourceLocation;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Live payload bytes across every debug allocator in the process
static CHECKED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Sum of requested sizes of all live debug-allocator blocks
pub fn checked_bytes() -> usize {
    CHECKED_BYTES.load(Ordering::Acquire)
}

#[derive(Debug, Clone, Copy)]
struct BlockRecord {
    size: usize,
    allocated_at: SourceLocation,
}

/// Side table shared with the registry for whole-process verification
struct BlockTable {
    name: String,
    config: DebugConfig,
    blocks: Mutex<HashMap<usize, BlockRecord>>,
}

impl BlockTable {
    fn insert(&self, payload: NonNull<u8>, record: BlockRecord) {
        self.blocks.lock().insert(payload.as_ptr() as usize, record);
    }

    fn take(&self, payload: NonNull<u8>) -> Option<BlockRecord> {
        self.blocks.lock().remove(&(payload.as_ptr() as usize))
    }

    /// Writes both guards around a payload of `size` bytes
    ///
    /// # Safety
    /// `payload` must be preceded and followed by `guard_size` writable
    /// bytes of the same block.
    unsafe fn write_guards(&self, payload: NonNull<u8>, size: usize) {
        let guard = self.config.guard_size;
        // SAFETY: Caller contract.
        unsafe {
            core::ptr::write_bytes(payload.sub(guard).as_ptr(), self.config.guard_byte, guard);
            core::ptr::write_bytes(payload.add(size).as_ptr(), self.config.guard_byte, guard);
        }
    }

    /// Compares both guards against the guard byte
    ///
    /// # Safety
    /// `payload` must be a live block of this table described by `record`.
    unsafe fn check_block(
        &self,
        payload: NonNull<u8>,
        record: &BlockRecord,
        detected_at: SourceLocation,
    ) -> MemoryResult<()> {
        let guard = self.config.guard_size;
        // SAFETY: Caller contract; guards belong to the same block.
        let (front, tail) = unsafe {
            (
                core::slice::from_raw_parts(payload.sub(guard).as_ptr(), guard),
                core::slice::from_raw_parts(payload.add(record.size).as_ptr(), guard),
            )
        };

        let expected = self.config.guard_byte;
        let details = if let Some(pos) = front.iter().position(|&b| b != expected) {
            format!(
                "front guard of {}-byte block {payload:p} overwritten {} bytes before the payload",
                record.size,
                guard - pos
            )
        } else if let Some(pos) = tail.iter().position(|&b| b != expected) {
            format!(
                "tail guard of {}-byte block {payload:p} overwritten {pos} bytes past the payload",
                record.size
            )
        } else {
            return Ok(());
        };

        Err(AllocError::corruption(
            &self.name,
            details,
            record.allocated_at,
            detected_at,
        ))
    }
}

impl VerifyBlocks for BlockTable {
    fn verify_blocks(&self, detected_at: SourceLocation) -> MemoryResult<()> {
        let blocks = self.blocks.lock();
        blocks.iter().try_for_each(|(&addr, record)| {
            // SAFETY: Table entries are live payloads; the lock keeps them
            // from being released while they are checked.
            unsafe {
                let payload = NonNull::new_unchecked(addr as *mut u8);
                self.check_block(payload, record, detected_at)
            }
        })
    }
}

/// Proxy that detects overruns, foreign frees and double frees
///
/// Every free notifies the callbacks of the bound [`DebugRegistry`] before
/// memory is released; corruption found on free or by verification is
/// fatal under the registry's policy.
pub struct DebugAllocator<P: Allocator> {
    parent: P,
    table: Arc<BlockTable>,
    registry: Arc<DebugRegistry>,
}

impl<P: Allocator> DebugAllocator<P> {
    /// Creates a debug allocator bound to the process-wide registry, using
    /// the process-wide debug configuration
    pub fn new(parent: P) -> Self {
        let config = config::current().debug;
        Self::build(parent, Arc::clone(DebugRegistry::global()), config, "debug")
    }

    /// Creates a debug allocator bound to `registry`
    pub fn with_registry(parent: P, registry: Arc<DebugRegistry>) -> Self {
        let config = config::current().debug;
        Self::build(parent, registry, config, "debug")
    }

    /// Fully explicit construction
    ///
    /// # Errors
    /// `InvalidConfig` when `config` does not validate.
    pub fn with_config(
        parent: P,
        registry: Arc<DebugRegistry>,
        config: DebugConfig,
        name: impl Into<String>,
    ) -> AllocResult<Self> {
        config.validate()?;
        Ok(Self::build(parent, registry, config, name))
    }

    fn build(
        parent: P,
        registry: Arc<DebugRegistry>,
        config: DebugConfig,
        name: impl Into<String>,
    ) -> Self {
        let table = Arc::new(BlockTable {
            name: name.into(),
            config,
            blocks: Mutex::new(HashMap::new()),
        });
        let weak: Weak<BlockTable> = Arc::downgrade(&table);
        registry.track(weak);

        #[cfg(feature = "logging")]
        debug!(
            allocator = %table.name,
            guard_size = config.guard_size,
            parent = parent.name(),
            "debug allocator created"
        );

        Self {
            parent,
            table,
            registry,
        }
    }

    /// Number of live blocks
    pub fn live_blocks(&self) -> usize {
        self.table.blocks.lock().len()
    }

    /// Sum of requested sizes of live blocks
    pub fn live_bytes(&self) -> usize {
        self.table.blocks.lock().values().map(|r| r.size).sum()
    }

    /// Checks this allocator's live blocks without treating corruption as
    /// fatal
    ///
    /// # Errors
    /// Returns the first [`crate::MemoryError::Corruption`] found.
    #[track_caller]
    pub fn check(&self) -> MemoryResult<()> {
        self.table.verify_blocks(SourceLocation::caller())
    }

    fn guarded_size(&self, size: usize) -> AllocResult<usize> {
        size.checked_add(2 * self.table.config.guard_size)
            .ok_or_else(|| AllocError::size_overflow("debug guards"))
    }

    fn take_record(&self, ptr: NonNull<u8>, location: SourceLocation) -> BlockRecord {
        self.table.take(ptr).unwrap_or_else(|| {
            panic!(
                "pointer {ptr:p} released at {location} is not a live block of debug allocator '{}' (foreign pointer or double free)",
                self.table.name
            )
        })
    }
}

// SAFETY: Payloads are parent blocks offset past a guard; every operation
// forwards to the parent with the guards included.
unsafe impl<P: Allocator> Allocator for DebugAllocator<P> {
    fn name(&self) -> &str {
        &self.table.name
    }

    fn parent(&self) -> Option<&dyn Allocator> {
        Some(&self.parent)
    }

    fn allocate(&self, size: usize, location: SourceLocation) -> AllocResult<NonNull<u8>> {
        let total = self.guarded_size(size)?;
        let block = self.parent.allocate(total, location)?;

        // SAFETY: `block` spans guard + size + guard bytes.
        let payload = unsafe {
            let payload = block.add(self.table.config.guard_size);
            self.table.write_guards(payload, size);
            if let Some(fill) = self.table.config.fill_on_alloc {
                core::ptr::write_bytes(payload.as_ptr(), fill, size);
            }
            payload
        };

        self.table.insert(
            payload,
            BlockRecord {
                size,
                allocated_at: location,
            },
        );
        CHECKED_BYTES.fetch_add(size, Ordering::AcqRel);
        Ok(payload)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation) {
        let record = self.take_record(ptr, location);

        // SAFETY: The record proved `ptr` is a live payload of this allocator.
        if let Err(err) = unsafe { self.table.check_block(ptr, &record, location) } {
            self.registry.fatal(&err, location);
        }
        CHECKED_BYTES.fetch_sub(record.size, Ordering::AcqRel);

        // SAFETY: The payload is still allocated and `size` bytes long.
        let contents = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), record.size) };
        self.registry.notify_free(&FreeEvent {
            allocator: &self.table.name,
            ptr,
            contents,
            location,
        });

        // SAFETY: Same block; the guard precedes the payload.
        unsafe {
            if let Some(poison) = self.table.config.poison_on_free {
                core::ptr::write_bytes(ptr.as_ptr(), poison, record.size);
            }
            self.parent
                .free(ptr.sub(self.table.config.guard_size), location);
        }
    }

    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        location: SourceLocation,
    ) -> AllocResult<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, location);
        };

        let total = self.guarded_size(new_size)?;
        let record = self.take_record(ptr, location);
        // SAFETY: The record proved `ptr` is a live payload of this allocator.
        if let Err(err) = unsafe { self.table.check_block(ptr, &record, location) } {
            self.registry.fatal(&err, location);
        }

        let guard = self.table.config.guard_size;
        // SAFETY: The guard precedes the payload in the parent's block.
        let block = match unsafe { self.parent.reallocate(Some(ptr.sub(guard)), total, location) } {
            Ok(block) => block,
            Err(err) => {
                self.table.insert(ptr, record);
                return Err(err);
            }
        };

        // SAFETY: `block` spans guard + new_size + guard bytes; the front
        // guard and the first min(old, new) payload bytes moved with it.
        let payload = unsafe {
            let payload = block.add(guard);
            if new_size > record.size {
                if let Some(fill) = self.table.config.fill_on_alloc {
                    core::ptr::write_bytes(
                        payload.add(record.size).as_ptr(),
                        fill,
                        new_size - record.size,
                    );
                }
            }
            self.table.write_guards(payload, new_size);
            payload
        };

        self.table.insert(
            payload,
            BlockRecord {
                size: new_size,
                allocated_at: location,
            },
        );
        CHECKED_BYTES.fetch_sub(record.size, Ordering::AcqRel);
        CHECKED_BYTES.fetch_add(new_size, Ordering::AcqRel);
        Ok(payload)
    }
}

impl<P: Allocator> Drop for DebugAllocator<P> {
    fn drop(&mut self) {
        // Verification may still hold the table; empty it before `parent`
        // releases the blocks it describes.
        let mut blocks = self.table.blocks.lock();
        if blocks.is_empty() {
            return;
        }
        let bytes: usize = blocks.values().map(|r| r.size).sum();
        CHECKED_BYTES.fetch_sub(bytes, Ordering::AcqRel);

        #[cfg(feature = "logging")]
        warn!(
            allocator = %self.table.name,
            blocks = blocks.len(),
            bytes,
            "debug allocator destroyed with live blocks"
        );

        blocks.clear();
    }
}

impl<P: Allocator> core::fmt::Debug for DebugAllocator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DebugAllocator")
            .field("name", &self.table.name)
            .field("live_blocks", &self.live_blocks())
            .field("config", &self.table.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::global_heap;
    use crate::config::FatalPolicy;
    use std::sync::atomic::AtomicBool;

    fn loc() -> SourceLocation {
        SourceLocation::caller()
    }

    fn isolated() -> DebugAllocator<&'static crate::allocator::GlobalHeap> {
        let registry = DebugRegistry::with_policy(FatalPolicy::Panic);
        DebugAllocator::with_config(global_heap(), registry, DebugConfig::default(), "test")
            .unwrap()
    }

    #[test]
    fn fresh_payload_is_filled() {
        let debug = isolated();
        let ptr = debug.allocate(8, loc()).unwrap();
        unsafe {
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), 8);
            assert!(bytes.iter().all(|&b| b == 0xCD));
            debug.free(ptr, loc());
        }
    }

    #[test]
    fn tracks_live_blocks() {
        let debug = isolated();
        let a = debug.allocate(10, loc()).unwrap();
        let b = debug.allocate(20, loc()).unwrap();
        assert_eq!(debug.live_blocks(), 2);
        assert_eq!(debug.live_bytes(), 30);

        unsafe {
            debug.free(a, loc());
            debug.free(b, loc());
        }
        assert_eq!(debug.live_blocks(), 0);
    }

    #[test]
    fn detects_tail_overrun() {
        let debug = isolated();
        let ptr = debug.allocate(16, loc()).unwrap();
        unsafe { ptr.add(16).as_ptr().write(0) };

        let err = debug.check().unwrap_err();
        assert_eq!(err.code(), "MEM:DEBUG:CORRUPTION");
        assert!(err.to_string().contains("tail guard"));

        // Repair so the block can be released cleanly.
        unsafe {
            ptr.add(16).as_ptr().write(0xFD);
            debug.free(ptr, loc());
        }
    }

    #[test]
    fn detects_front_underrun() {
        let debug = isolated();
        let ptr = debug.allocate(4, loc()).unwrap();
        unsafe { ptr.sub(1).as_ptr().write(0) };

        let err = debug.check().unwrap_err();
        assert!(err.to_string().contains("1 bytes before"));

        unsafe {
            ptr.sub(1).as_ptr().write(0xFD);
            debug.free(ptr, loc());
        }
    }

    #[test]
    #[should_panic(expected = "MEM:DEBUG:CORRUPTION")]
    fn free_of_corrupted_block_is_fatal() {
        let debug = isolated();
        let ptr = debug.allocate(4, loc()).unwrap();
        unsafe {
            ptr.add(4).as_ptr().write(0);
            debug.free(ptr, loc());
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_asserted() {
        let debug = isolated();
        let ptr = debug.allocate(4, loc()).unwrap();
        unsafe {
            debug.free(ptr, loc());
            debug.free(ptr, loc());
        }
    }

    #[test]
    fn callbacks_see_final_contents_before_poison() {
        let registry = DebugRegistry::with_policy(FatalPolicy::Panic);
        let seen = Arc::new(AtomicBool::new(false));
        {
            let seen = Arc::clone(&seen);
            registry.register_callbacks(move |event: &FreeEvent<'_>| {
                assert_eq!(event.allocator(), "cb");
                assert_eq!(event.contents(), b"final!");
                seen.store(true, Ordering::SeqCst);
            });
        }

        let debug =
            DebugAllocator::with_config(global_heap(), registry, DebugConfig::default(), "cb")
                .unwrap();
        let ptr = debug.allocate(6, loc()).unwrap();
        unsafe {
            core::ptr::copy_nonoverlapping(b"final!".as_ptr(), ptr.as_ptr(), 6);
            debug.free(ptr, loc());
        }
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn reallocate_moves_guards() {
        let debug = isolated();
        unsafe {
            let ptr = debug.allocate(4, loc()).unwrap();
            core::ptr::copy_nonoverlapping(b"keep".as_ptr(), ptr.as_ptr(), 4);

            let ptr = debug.reallocate(Some(ptr), 4096, loc()).unwrap();
            assert_eq!(core::slice::from_raw_parts(ptr.as_ptr(), 4), b"keep");
            assert_eq!(*ptr.add(4).as_ptr(), 0xCD);
            assert!(debug.check().is_ok());
            assert_eq!(debug.live_bytes(), 4096);

            let ptr = debug.reallocate(Some(ptr), 2, loc()).unwrap();
            assert!(debug.check().is_ok());
            debug.free(ptr, loc());
        }
    }

    #[test]
    fn registry_tracks_until_drop() {
        let registry = DebugRegistry::with_policy(FatalPolicy::Panic);
        let debug = DebugAllocator::with_registry(global_heap(), Arc::clone(&registry));
        assert_eq!(registry.tracked_count(), 1);
        drop(debug);
        assert_eq!(registry.tracked_count(), 0);
    }

    #[test]
    fn drop_over_arena_empties_table() {
        use crate::allocator::{ArenaProxyAllocator, TrackerProxyAllocator};

        let tracker = TrackerProxyAllocator::new(global_heap());
        let registry = DebugRegistry::with_policy(FatalPolicy::Panic);
        let debug = DebugAllocator::with_registry(
            ArenaProxyAllocator::new(&tracker),
            Arc::clone(&registry),
        );
        let table = Arc::clone(&debug.table);
        debug.allocate(100, loc()).unwrap();
        debug.allocate(28, loc()).unwrap();

        drop(debug);
        assert!(table.blocks.lock().is_empty());
        assert!(table.verify_blocks(loc()).is_ok());
        assert_eq!(tracker.stats().allocated_count, 0);
    }
}
