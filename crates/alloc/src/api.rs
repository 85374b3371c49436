//! Allocation surface used by the rest of the system
//!
//! Every function takes an optional allocator handle; `None` routes to the
//! [global heap](crate::allocator::global_heap), exactly as if the global
//! heap had been passed explicitly. The call site is captured through
//! `#[track_caller]` and handed to the allocator for diagnostics.
//!
//! `allocate`, `callocate` and `reallocate` treat failure as fatal (see
//! [`crate::fatal`]); the `try_` forms return it instead.
//!
//! # Examples
//! ```
//! use nebula_alloc::api;
//!
//! let ptr = api::allocate(None, 64);
//! let ptr = unsafe { api::reallocate(None, Some(ptr), 128) };
//! unsafe { api::free(None, Some(ptr)) };
//! ```

use core::ptr::NonNull;

use crate::allocator::{self, Allocator};
use crate::error::AllocResult;
use crate::fatal;
use crate::location::SourceLocation;

/// Optional allocator handle; `None` means the global heap
pub type AllocatorRef<'a> = Option<&'a dyn Allocator>;

#[inline]
pub(crate) fn resolve(allocator: AllocatorRef<'_>) -> &dyn Allocator {
    match allocator {
        Some(allocator) => allocator,
        None => allocator::global_heap(),
    }
}

/// Allocates `size` bytes, returning the error on failure
#[track_caller]
pub fn try_allocate(allocator: AllocatorRef<'_>, size: usize) -> AllocResult<NonNull<u8>> {
    resolve(allocator).allocate(size, SourceLocation::caller())
}

/// Allocates `size` bytes; failure is fatal
#[track_caller]
pub fn allocate(allocator: AllocatorRef<'_>, size: usize) -> NonNull<u8> {
    let location = SourceLocation::caller();
    resolve(allocator)
        .allocate(size, location)
        .unwrap_or_else(|err| fatal::out_of_memory(&err, location))
}

/// Allocates `count * size` zeroed bytes, returning the error on failure
#[track_caller]
pub fn try_callocate(
    allocator: AllocatorRef<'_>,
    count: usize,
    size: usize,
) -> AllocResult<NonNull<u8>> {
    resolve(allocator).callocate(count, size, SourceLocation::caller())
}

/// Allocates `count * size` zeroed bytes; failure is fatal
#[track_caller]
pub fn callocate(allocator: AllocatorRef<'_>, count: usize, size: usize) -> NonNull<u8> {
    let location = SourceLocation::caller();
    resolve(allocator)
        .callocate(count, size, location)
        .unwrap_or_else(|err| fatal::out_of_memory(&err, location))
}

/// Releases `ptr`; `None` is a no-op
///
/// # Safety
/// `ptr` must be live and come from the resolved allocator.
#[track_caller]
pub unsafe fn free(allocator: AllocatorRef<'_>, ptr: Option<NonNull<u8>>) {
    if let Some(ptr) = ptr {
        // SAFETY: Caller contract.
        unsafe { resolve(allocator).free(ptr, SourceLocation::caller()) };
    }
}

/// Releases the block behind `slot` and clears it
///
/// # Safety
/// Same as [`free`].
#[track_caller]
pub unsafe fn free_and_clear(allocator: AllocatorRef<'_>, slot: &mut Option<NonNull<u8>>) {
    // SAFETY: Caller contract.
    unsafe { free(allocator, slot.take()) };
}

/// Resizes `ptr` (or allocates when `None`), returning the error on failure
///
/// # Safety
/// Same as [`free`].
#[track_caller]
pub unsafe fn try_reallocate(
    allocator: AllocatorRef<'_>,
    ptr: Option<NonNull<u8>>,
    new_size: usize,
) -> AllocResult<NonNull<u8>> {
    // SAFETY: Caller contract.
    unsafe { resolve(allocator).reallocate(ptr, new_size, SourceLocation::caller()) }
}

/// Resizes `ptr` (or allocates when `None`); failure is fatal
///
/// # Safety
/// Same as [`free`].
#[track_caller]
pub unsafe fn reallocate(
    allocator: AllocatorRef<'_>,
    ptr: Option<NonNull<u8>>,
    new_size: usize,
) -> NonNull<u8> {
    let location = SourceLocation::caller();
    // SAFETY: Caller contract.
    unsafe { resolve(allocator).reallocate(ptr, new_size, location) }
        .unwrap_or_else(|err| fatal::out_of_memory(&err, location))
}

/// Bytes currently allocated through the checked (debug) path
///
/// Zero unless [`DebugAllocator`](crate::allocator::DebugAllocator)s hold
/// live blocks.
pub fn allocated_memory() -> usize {
    allocator::checked_bytes()
}
