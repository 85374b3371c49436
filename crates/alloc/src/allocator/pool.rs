//! Fixed pool allocator
//!
//! # Safety
//!
//! The pool carves `item_count` equally sized slots out of one block
//! obtained from its parent at construction:
//! - Free slots store the next-free pointer in their first bytes
//!   (intrusive singly-linked list)
//! - Slot stride is the item size rounded up to the metadata alignment, so
//!   every slot keeps the alignment of the backing block
//! - An occupancy table backs the range/slot/double-free assertions on
//!   `free`
//!
//! ## Invariants
//!
//! - Every outstanding pointer lies in `[block, block + stride * item_count)`
//!   at a slot boundary
//! - `free_count` equals the length of the free list
//! - Exhaustion is an error, never silent reuse

use core::cell::Cell;
use core::ptr::NonNull;

use super::Allocator;
use crate::error::{AllocError, AllocResult};
use crate::location::SourceLocation;
use crate::utils::{METADATA_ALIGN, align_up};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Node in the free list
///
/// When a slot is free, its first bytes hold a pointer to the next free
/// slot.
#[repr(C)]
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Pool of up to `item_count` fixed-size slots
///
/// O(1) allocate and free with zero fragmentation, at the cost of serving
/// only requests up to `item_size` bytes. Not thread-safe.
///
/// # Memory Layout
/// ```text
/// [Slot0][Slot1][Slot2][Slot3]...[SlotN]
///    ↓      ↓      ↓      ↓         ↓
/// [free] → [free] [used] → [free] → null
/// ```
pub struct FixedPoolAllocator<P: Allocator> {
    parent: P,
    name: String,
    block: NonNull<u8>,
    item_size: usize,
    stride: usize,
    item_count: usize,
    free_head: Cell<Option<NonNull<FreeSlot>>>,
    free_count: Cell<usize>,
    in_use: Box<[Cell<bool>]>,
}

impl<P: Allocator> FixedPoolAllocator<P> {
    /// Creates a pool of `item_count` slots of `item_size` bytes backed by
    /// one block from `parent`
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero item size or count
    /// - `SizeOverflow` when the backing block size overflows
    /// - Whatever `parent` returns when it cannot serve the backing block
    pub fn new(parent: P, item_size: usize, item_count: usize) -> AllocResult<Self> {
        Self::with_name(parent, item_size, item_count, "fixed-pool")
    }

    /// Same as [`new`](Self::new) with a diagnostic name
    pub fn with_name(
        parent: P,
        item_size: usize,
        item_count: usize,
        name: impl Into<String>,
    ) -> AllocResult<Self> {
        if item_size == 0 {
            return Err(AllocError::invalid_config("fixed pool item size must be non-zero"));
        }
        if item_count == 0 {
            return Err(AllocError::invalid_config("fixed pool item count must be non-zero"));
        }

        let stride = align_up(
            item_size.max(size_of::<FreeSlot>()),
            METADATA_ALIGN,
        );
        let total = stride
            .checked_mul(item_count)
            .ok_or_else(|| AllocError::size_overflow("fixed pool block"))?;
        let block = parent.allocate(total, SourceLocation::internal())?;

        let pool = Self {
            parent,
            name: name.into(),
            block,
            item_size,
            stride,
            item_count,
            free_head: Cell::new(None),
            free_count: Cell::new(0),
            in_use: (0..item_count).map(|_| Cell::new(false)).collect(),
        };
        pool.initialize_free_list();

        #[cfg(feature = "logging")]
        debug!(
            pool = %pool.name,
            item_size,
            item_count,
            stride,
            parent = pool.parent.name(),
            "fixed pool created"
        );

        Ok(pool)
    }

    /// Links every slot, lowest address first
    fn initialize_free_list(&self) {
        let mut head = None;
        for index in (0..self.item_count).rev() {
            let slot = self.slot_ptr(index).cast::<FreeSlot>();
            // SAFETY: `slot` is inside the backing block, aligned to the
            // metadata alignment and at least pointer-sized.
            unsafe { slot.as_ptr().write(FreeSlot { next: head }) };
            head = Some(slot);
        }
        self.free_head.set(head);
        self.free_count.set(self.item_count);
    }

    fn slot_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.item_count);
        // SAFETY: `index * stride` stays inside the backing block.
        unsafe { self.block.add(index * self.stride) }
    }

    /// Slot index of `ptr`, asserting it lies on a slot boundary in range
    fn slot_index(&self, ptr: NonNull<u8>, location: SourceLocation) -> usize {
        let start = self.block.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        let end = start + self.stride * self.item_count;
        assert!(
            (start..end).contains(&addr),
            "pointer {ptr:p} freed at {location} does not belong to fixed pool '{}'",
            self.name
        );
        let offset = addr - start;
        assert!(
            offset % self.stride == 0,
            "pointer {ptr:p} freed at {location} is not at a slot boundary of fixed pool '{}'",
            self.name
        );
        offset / self.stride
    }

    /// Maximum bytes one allocation may request
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.item_count
    }

    /// Number of slots currently available
    pub fn free_slots(&self) -> usize {
        self.free_count.get()
    }

    /// Number of slots currently handed out
    pub fn outstanding(&self) -> usize {
        self.item_count - self.free_count.get()
    }

    /// Whether `ptr` points into this pool's backing block
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.block.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr < start + self.stride * self.item_count
    }
}

// SAFETY: Slots are disjoint sub-ranges of a block owned by the pool; a slot
// is handed out only while it is off the free list.
unsafe impl<P: Allocator> Allocator for FixedPoolAllocator<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&dyn Allocator> {
        Some(&self.parent)
    }

    fn allocate(&self, size: usize, _location: SourceLocation) -> AllocResult<NonNull<u8>> {
        if size > self.item_size {
            return Err(AllocError::exceeds_item_size(size, self.item_size));
        }

        let Some(slot) = self.free_head.get() else {
            return Err(AllocError::pool_exhausted(&self.name, self.item_count));
        };

        // SAFETY: Slots on the free list hold an initialized `FreeSlot`.
        let next = unsafe { slot.as_ptr().read().next };
        self.free_head.set(next);
        self.free_count.set(self.free_count.get() - 1);

        let ptr = slot.cast::<u8>();
        let index = (ptr.as_ptr() as usize - self.block.as_ptr() as usize) / self.stride;
        self.in_use[index].set(true);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation) {
        let index = self.slot_index(ptr, location);
        assert!(
            self.in_use[index].replace(false),
            "double free of slot {index} at {location} in fixed pool '{}'",
            self.name
        );

        let slot = ptr.cast::<FreeSlot>();
        // SAFETY: The slot is inside the block, aligned, and no longer handed
        // out, so the pool may reuse its first bytes.
        unsafe {
            slot.as_ptr().write(FreeSlot {
                next: self.free_head.get(),
            });
        }
        self.free_head.set(Some(slot));
        self.free_count.set(self.free_count.get() + 1);
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

        let index = self.slot_index(ptr, location);
        assert!(
            self.in_use[index].get(),
            "reallocation of free slot {index} at {location} in fixed pool '{}'",
            self.name
        );

        if new_size > self.item_size {
            return Err(AllocError::exceeds_item_size(new_size, self.item_size));
        }
        Ok(ptr)
    }
}

impl<P: Allocator> Drop for FixedPoolAllocator<P> {
    fn drop(&mut self) {
        #[cfg(feature = "logging")]
        {
            let outstanding = self.outstanding();
            if outstanding > 0 {
                warn!(pool = %self.name, outstanding, "fixed pool destroyed with outstanding slots");
            }
            debug!(pool = %self.name, "fixed pool destroyed");
        }

        // SAFETY: `block` came from `parent.allocate` and is released once.
        unsafe { self.parent.free(self.block, SourceLocation::internal()) };
    }
}

impl<P: Allocator> core::fmt::Debug for FixedPoolAllocator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FixedPoolAllocator")
            .field("name", &self.name)
            .field("item_size", &self.item_size)
            .field("item_count", &self.item_count)
            .field("free_slots", &self.free_slots())
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
    fn slots_are_distinct_and_in_range() {
        let pool = FixedPoolAllocator::new(global_heap(), 24, 8).unwrap();
        let ptrs: Vec<_> = (0..8).map(|_| pool.allocate(24, loc()).unwrap()).collect();

        for (i, a) in ptrs.iter().enumerate() {
            assert!(pool.contains(*a));
            assert!(crate::utils::is_aligned(a.as_ptr() as usize, METADATA_ALIGN));
            for b in &ptrs[i + 1..] {
                assert_ne!(a, b);
            }
        }

        for ptr in ptrs {
            unsafe { pool.free(ptr, loc()) };
        }
        assert_eq!(pool.free_slots(), 8);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = FixedPoolAllocator::new(global_heap(), 16, 2).unwrap();
        let a = pool.allocate(16, loc()).unwrap();
        let b = pool.allocate(1, loc()).unwrap();

        let err = pool.allocate(1, loc()).unwrap_err();
        assert!(err.is_exhaustion());

        unsafe {
            pool.free(a, loc());
            pool.free(b, loc());
        }
    }

    #[test]
    fn oversize_request_is_refused() {
        let pool = FixedPoolAllocator::new(global_heap(), 32, 2).unwrap();
        let err = pool.allocate(33, loc()).unwrap_err();
        assert_eq!(err.code(), "MEM:POOL:ITEM_SIZE");
        assert_eq!(pool.free_slots(), 2);
    }

    #[test]
    fn reallocate_within_item_size_keeps_pointer() {
        let pool = FixedPoolAllocator::new(global_heap(), 64, 1).unwrap();
        unsafe {
            let ptr = pool.allocate(16, loc()).unwrap();
            assert_eq!(pool.reallocate(Some(ptr), 64, loc()).unwrap(), ptr);
            assert_eq!(pool.reallocate(Some(ptr), 8, loc()).unwrap(), ptr);

            let err = pool.reallocate(Some(ptr), 65, loc()).unwrap_err();
            assert_eq!(err.code(), "MEM:POOL:ITEM_SIZE");

            pool.free(ptr, loc());
        }
    }

    #[test]
    fn rejects_zero_sized_configuration() {
        assert!(FixedPoolAllocator::new(global_heap(), 0, 4).is_err());
        assert!(FixedPoolAllocator::new(global_heap(), 8, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_asserted() {
        let pool = FixedPoolAllocator::new(global_heap(), 16, 2).unwrap();
        let ptr = pool.allocate(8, loc()).unwrap();
        unsafe {
            pool.free(ptr, loc());
            pool.free(ptr, loc());
        }
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn foreign_pointer_is_asserted() {
        let pool = FixedPoolAllocator::new(global_heap(), 16, 2).unwrap();
        let mut outside = 0u64;
        let ptr = NonNull::from(&mut outside).cast::<u8>();
        unsafe { pool.free(ptr, loc()) };
    }

    #[test]
    #[should_panic(expected = "slot boundary")]
    fn interior_pointer_is_asserted() {
        let pool = FixedPoolAllocator::new(global_heap(), 32, 2).unwrap();
        let ptr = pool.allocate(8, loc()).unwrap();
        unsafe { pool.free(ptr.add(4), loc()) };
    }
}
