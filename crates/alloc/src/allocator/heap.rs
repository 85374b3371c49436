//! Global heap allocator
//!
//! Leaf allocator over the C runtime's `malloc`/`calloc`/`realloc`/`free`.
//! Because those primitives remember block sizes themselves, the global heap
//! needs no metadata of its own and can serve `free(ptr)` without a size.

use core::ptr::NonNull;

use super::Allocator;
use crate::error::{AllocError, AllocResult};
use crate::location::SourceLocation;

static GLOBAL_HEAP: GlobalHeap = GlobalHeap::new();

/// Returns the shared global heap instance
///
/// Passing `None` as the allocator to any function in [`crate::api`] routes
/// here.
#[inline]
pub fn global_heap() -> &'static GlobalHeap {
    &GLOBAL_HEAP
}

/// Wrapper for the process's raw allocation primitive
///
/// # Thread Safety
/// The C runtime heap is thread-safe; this is the one built-in allocator
/// that may be shared between threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalHeap {
    _private: (),
}

impl GlobalHeap {
    const NAME: &'static str = "global-heap";

    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

// SAFETY: Every pointer comes from the C heap, which satisfies the contract;
// zero-sized requests are bumped to one byte so a unique pointer is returned.
unsafe impl Allocator for GlobalHeap {
    fn name(&self) -> &str {
        Self::NAME
    }

    #[inline]
    fn allocate(&self, size: usize, _location: SourceLocation) -> AllocResult<NonNull<u8>> {
        // SAFETY: malloc has no preconditions.
        let ptr = unsafe { libc::malloc(size.max(1)) };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| AllocError::allocation_failed(size))
    }

    #[inline]
    fn callocate(
        &self,
        count: usize,
        size: usize,
        _location: SourceLocation,
    ) -> AllocResult<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| AllocError::size_overflow("callocate"))?;
        // SAFETY: calloc has no preconditions; the product is checked above.
        let ptr = unsafe { libc::calloc(1, total.max(1)) };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| AllocError::allocation_failed(total))
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>, _location: SourceLocation) {
        // SAFETY: Caller guarantees `ptr` came from this heap and is live.
        unsafe { libc::free(ptr.as_ptr().cast()) };
    }

    #[inline]
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        location: SourceLocation,
    ) -> AllocResult<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, location);
        };

        // SAFETY: Caller guarantees `ptr` came from this heap and is live.
        // realloc leaves the old block intact when it returns null.
        let new_ptr = unsafe { libc::realloc(ptr.as_ptr().cast(), new_size.max(1)) };
        NonNull::new(new_ptr.cast::<u8>()).ok_or_else(|| AllocError::allocation_failed(new_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocation() {
        let heap = global_heap();
        let ptr = heap.allocate(64, SourceLocation::caller()).unwrap();

        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0x42, 64);
            assert_eq!(*ptr.as_ptr().add(63), 0x42);
            heap.free(ptr, SourceLocation::caller());
        }
    }

    #[test]
    fn test_zero_sized_allocation() {
        let heap = global_heap();
        let ptr = heap.allocate(0, SourceLocation::caller()).unwrap();
        unsafe { heap.free(ptr, SourceLocation::caller()) };
    }

    #[test]
    fn test_callocate_zeroes() {
        let heap = global_heap();
        let ptr = heap.callocate(16, 4, SourceLocation::caller()).unwrap();
        unsafe {
            let bytes = core::slice::from_raw_parts(ptr.as_ptr(), 64);
            assert!(bytes.iter().all(|&b| b == 0));
            heap.free(ptr, SourceLocation::caller());
        }
    }

    #[test]
    fn test_callocate_overflow() {
        let err = global_heap()
            .callocate(usize::MAX, 2, SourceLocation::caller())
            .unwrap_err();
        assert_eq!(err.code(), "MEM:ALLOC:OVERFLOW");
    }

    #[test]
    fn test_reallocate_preserves_prefix() {
        let heap = global_heap();
        unsafe {
            let ptr = heap.allocate(8, SourceLocation::caller()).unwrap();
            core::ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), ptr.as_ptr(), 8);

            let grown = heap
                .reallocate(Some(ptr), 4096, SourceLocation::caller())
                .unwrap();
            assert_eq!(core::slice::from_raw_parts(grown.as_ptr(), 8), b"abcdefgh");

            let shrunk = heap
                .reallocate(Some(grown), 4, SourceLocation::caller())
                .unwrap();
            assert_eq!(core::slice::from_raw_parts(shrunk.as_ptr(), 4), b"abcd");
            heap.free(shrunk, SourceLocation::caller());
        }
    }

    #[test]
    fn test_reallocate_none_allocates() {
        let heap = global_heap();
        unsafe {
            let ptr = heap.reallocate(None, 32, SourceLocation::caller()).unwrap();
            heap.free(ptr, SourceLocation::caller());
        }
    }
}
