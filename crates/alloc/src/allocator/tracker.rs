//! Tracking proxy allocator
//!
//! Provides an allocator that keeps exact byte and block counts by
//! wrapping another allocator implementation.
//!
//! # Safety
//!
//! Each block carries a hidden [`SizePrefix`] in front of the payload:
//! - The prefix holds the size the caller asked for, so `free` and
//!   `reallocate` need no size argument
//! - It is padded to the metadata alignment so payloads keep the parent's
//!   alignment
//!
//! ## Invariants
//!
//! - `allocated_bytes` is the sum of requested sizes of live blocks
//! - `allocated_count` is the number of live blocks
//! - Failed requests leave both counters untouched

use core::cell::Cell;
use core::ptr::NonNull;

use super::Allocator;
use crate::error::AllocResult;
use crate::location::SourceLocation;
use crate::utils::padded_size;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Hidden prefix recording a block's requested size
#[repr(C, align(16))]
struct SizePrefix {
    size: usize,
}

/// Bytes the tracker adds in front of every allocation
pub const TRACKER_PREFIX_SIZE: usize = size_of::<SizePrefix>();

/// Point-in-time counters of a [`TrackerProxyAllocator`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Sum of requested sizes of outstanding blocks
    pub allocated_bytes: usize,
    /// Number of outstanding blocks
    pub allocated_count: usize,
    /// Highest `allocated_bytes` ever observed
    pub peak_bytes: usize,
}

impl core::fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} bytes in {} blocks (peak {} bytes)",
            self.allocated_bytes, self.allocated_count, self.peak_bytes
        )
    }
}

/// A wrapper allocator that keeps exact usage statistics
///
/// Counters are updated synchronously with every operation, so
/// [`stats`](Self::stats) is exact immediately after any call. Not
/// thread-safe.
pub struct TrackerProxyAllocator<P: Allocator> {
    parent: P,
    name: String,
    allocated_bytes: Cell<usize>,
    allocated_count: Cell<usize>,
    peak_bytes: Cell<usize>,
}

impl<P: Allocator> TrackerProxyAllocator<P> {
    /// Creates a tracker over `parent`
    pub fn new(parent: P) -> Self {
        Self::with_name(parent, "tracker-proxy")
    }

    /// Creates a tracker over `parent` with a diagnostic name
    pub fn with_name(parent: P, name: impl Into<String>) -> Self {
        let tracker = Self {
            parent,
            name: name.into(),
            allocated_bytes: Cell::new(0),
            allocated_count: Cell::new(0),
            peak_bytes: Cell::new(0),
        };

        #[cfg(feature = "logging")]
        debug!(tracker = %tracker.name, parent = tracker.parent.name(), "tracker created");

        tracker
    }

    /// Current `(bytes, count)` plus peak
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            allocated_bytes: self.allocated_bytes.get(),
            allocated_count: self.allocated_count.get(),
            peak_bytes: self.peak_bytes.get(),
        }
    }

    /// Gets a reference to the underlying allocator
    pub fn inner(&self) -> &P {
        &self.parent
    }

    fn add_bytes(&self, size: usize) {
        let bytes = self.allocated_bytes.get() + size;
        self.allocated_bytes.set(bytes);
        if bytes > self.peak_bytes.get() {
            self.peak_bytes.set(bytes);
        }
    }

    fn prefix_of(ptr: NonNull<u8>) -> NonNull<SizePrefix> {
        // SAFETY: Tracker payloads are always preceded by their prefix.
        unsafe { ptr.sub(TRACKER_PREFIX_SIZE).cast() }
    }

    /// Writes the prefix and returns the payload pointer
    ///
    /// # Safety
    /// `block` must be valid for `TRACKER_PREFIX_SIZE + size` bytes.
    unsafe fn stamp(block: NonNull<u8>, size: usize) -> NonNull<u8> {
        // SAFETY: Caller contract.
        unsafe {
            block.cast::<SizePrefix>().as_ptr().write(SizePrefix { size });
            block.add(TRACKER_PREFIX_SIZE)
        }
    }
}

// SAFETY: Payloads are parent blocks offset past a private prefix; all
// operations forward to the parent with the prefix included.
unsafe impl<P: Allocator> Allocator for TrackerProxyAllocator<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&dyn Allocator> {
        Some(&self.parent)
    }

    fn allocate(&self, size: usize, location: SourceLocation) -> AllocResult<NonNull<u8>> {
        let total = padded_size(size, TRACKER_PREFIX_SIZE, "tracker prefix")?;
        let block = self.parent.allocate(total, location)?;

        self.add_bytes(size);
        self.allocated_count.set(self.allocated_count.get() + 1);

        // SAFETY: `block` is valid for `total` bytes.
        Ok(unsafe { Self::stamp(block, size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation) {
        let prefix = Self::prefix_of(ptr);
        // SAFETY: Caller guarantees `ptr` is a live payload of this tracker.
        let size = unsafe { prefix.as_ref().size };

        self.allocated_bytes.set(self.allocated_bytes.get() - size);
        self.allocated_count.set(self.allocated_count.get() - 1);

        // SAFETY: The prefix address is the block the parent returned.
        unsafe { self.parent.free(prefix.cast(), location) };
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

        let total = padded_size(new_size, TRACKER_PREFIX_SIZE, "tracker prefix")?;
        let prefix = Self::prefix_of(ptr);
        // SAFETY: Caller guarantees `ptr` is a live payload of this tracker.
        let old_size = unsafe { prefix.as_ref().size };
        // SAFETY: Same; the prefix is the parent's block.
        let block = unsafe { self.parent.reallocate(Some(prefix.cast()), total, location)? };

        self.allocated_bytes.set(self.allocated_bytes.get() - old_size);
        self.add_bytes(new_size);

        // SAFETY: `block` is valid for `total` bytes.
        Ok(unsafe { Self::stamp(block, new_size) })
    }
}

impl<P: Allocator> Drop for TrackerProxyAllocator<P> {
    fn drop(&mut self) {
        #[cfg(feature = "logging")]
        {
            let stats = self.stats();
            if stats.allocated_count > 0 {
                warn!(tracker = %self.name, %stats, "tracker destroyed with outstanding blocks");
            }
        }
    }
}

impl<P: Allocator> core::fmt::Debug for TrackerProxyAllocator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackerProxyAllocator")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::global_heap;

    fn loc() -> SourceLocation {
        SourceLocation::caller()
    }

    #[test]
    fn counts_follow_allocate_and_free() {
        let tracker = TrackerProxyAllocator::new(global_heap());
        let a = tracker.allocate(100, loc()).unwrap();
        let b = tracker.allocate(28, loc()).unwrap();
        assert_eq!(
            tracker.stats(),
            TrackerStats {
                allocated_bytes: 128,
                allocated_count: 2,
                peak_bytes: 128,
            }
        );

        unsafe { tracker.free(a, loc()) };
        assert_eq!(tracker.stats().allocated_bytes, 28);
        assert_eq!(tracker.stats().allocated_count, 1);

        unsafe { tracker.free(b, loc()) };
        assert_eq!(tracker.stats().allocated_bytes, 0);
        assert_eq!(tracker.stats().peak_bytes, 128);
    }

    #[test]
    fn reallocate_adjusts_by_delta() {
        let tracker = TrackerProxyAllocator::new(global_heap());
        unsafe {
            let ptr = tracker.allocate(10, loc()).unwrap();
            let ptr = tracker.reallocate(Some(ptr), 1000, loc()).unwrap();
            assert_eq!(tracker.stats().allocated_bytes, 1000);
            assert_eq!(tracker.stats().allocated_count, 1);

            let ptr = tracker.reallocate(Some(ptr), 1, loc()).unwrap();
            assert_eq!(tracker.stats().allocated_bytes, 1);
            tracker.free(ptr, loc());
        }
        assert_eq!(tracker.stats().allocated_count, 0);
    }

    #[test]
    fn failed_request_leaves_counters() {
        let tracker = TrackerProxyAllocator::new(global_heap());
        assert!(tracker.allocate(usize::MAX, loc()).is_err());
        assert_eq!(tracker.stats(), TrackerStats::default());
    }

    #[test]
    fn payload_keeps_alignment() {
        let tracker = TrackerProxyAllocator::new(global_heap());
        let ptr = tracker.allocate(3, loc()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % TRACKER_PREFIX_SIZE, 0);
        unsafe { tracker.free(ptr, loc()) };
    }
}
