//! Typed array layer
//!
//! Arrays are allocated with an [`ArrayHeader`] placed immediately before
//! the first element. The header records the element count so that
//! [`deallocate_array`] can destruct the right number of elements without
//! the caller passing a length, whichever allocator backs the block.
//!
//! ```text
//! [ArrayHeader: count, padded to 16][T; count]
//!                                    ^ pointer handed to the caller
//! ```
//!
//! Element types opt in through [`ArrayElement`]. Fundamental types
//! (integers, floats, `bool`, `char`, raw pointers) are zero-filled and never
//! constructed or destructed; every other element type is default-
//! constructed in ascending index order and destructed in descending order.
//!
//! The header carries no type tag: deallocating with a different `T` than
//! the one used to allocate is undefined, which is why the raw functions are
//! `unsafe` and [`TypedArray`] is the preferred safe handle.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::allocator::Allocator;
use crate::api::{AllocatorRef, resolve};
use crate::error::{AllocError, AllocResult};
use crate::fatal;
use crate::location::SourceLocation;
use crate::utils::{METADATA_ALIGN, padded_size};

/// Length metadata stored in front of every array
#[repr(C, align(16))]
struct ArrayHeader {
    count: usize,
}

/// Bytes reserved in front of the first element
pub const ARRAY_HEADER_SIZE: usize = size_of::<ArrayHeader>();

const _: () = assert!(ARRAY_HEADER_SIZE == METADATA_ALIGN);

/// Element types the array layer knows how to initialize
///
/// # Safety
/// When `FUNDAMENTAL` is `true`, the all-zero bit pattern must be a valid
/// value of `Self` and `Self` must not need dropping.
pub unsafe trait ArrayElement: Sized {
    /// Zero-filled and never constructed or destructed
    const FUNDAMENTAL: bool;

    /// Value placed in each slot of a non-fundamental array
    fn construct() -> Self;
}

macro_rules! fundamental_elements {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: Zero is a valid value and the type has no drop glue.
            unsafe impl ArrayElement for $ty {
                const FUNDAMENTAL: bool = true;

                #[inline]
                fn construct() -> Self {
                    <$ty>::default()
                }
            }
        )*
    };
}

fundamental_elements!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
);

// SAFETY: The null pointer is the zero pattern and pointers have no drop glue.
unsafe impl<T> ArrayElement for *const T {
    const FUNDAMENTAL: bool = true;

    fn construct() -> Self {
        core::ptr::null()
    }
}

// SAFETY: As above.
unsafe impl<T> ArrayElement for *mut T {
    const FUNDAMENTAL: bool = true;

    fn construct() -> Self {
        core::ptr::null_mut()
    }
}

/// Makes `Default` types usable as non-fundamental array elements
///
/// ```
/// #[derive(Default)]
/// struct Particle {
///     name: String,
/// }
///
/// nebula_alloc::array_element!(Particle);
/// ```
#[macro_export]
macro_rules! array_element {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: Not fundamental; elements are built with `Default`.
            unsafe impl $crate::array::ArrayElement for $ty {
                const FUNDAMENTAL: bool = false;

                fn construct() -> Self {
                    <$ty as ::core::default::Default>::default()
                }
            }
        )*
    };
}

array_element!(String);

// SAFETY: Not fundamental.
unsafe impl<T> ArrayElement for Vec<T> {
    const FUNDAMENTAL: bool = false;

    fn construct() -> Self {
        Vec::new()
    }
}

// SAFETY: Not fundamental.
unsafe impl<T> ArrayElement for Option<T> {
    const FUNDAMENTAL: bool = false;

    fn construct() -> Self {
        None
    }
}

/// Drops constructed elements and frees the block if construction unwinds
struct ConstructionGuard<'a, T> {
    allocator: &'a dyn Allocator,
    block: NonNull<u8>,
    data: NonNull<T>,
    constructed: usize,
    location: SourceLocation,
}

impl<T> Drop for ConstructionGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: Exactly `constructed` leading elements are initialized and
        // `block` is the allocation they live in.
        unsafe {
            for index in (0..self.constructed).rev() {
                core::ptr::drop_in_place(self.data.add(index).as_ptr());
            }
            self.allocator.free(self.block, self.location);
        }
    }
}

/// Allocates and initializes `count` elements, returning the error on
/// failure
///
/// The returned pointer addresses the first element; release it with
/// [`deallocate_array`] on the same allocator.
#[track_caller]
pub fn try_allocate_array<T: ArrayElement>(
    allocator: AllocatorRef<'_>,
    count: usize,
) -> AllocResult<NonNull<T>> {
    const {
        assert!(
            align_of::<T>() <= ARRAY_HEADER_SIZE,
            "array element alignment exceeds the array header alignment"
        );
    }

    let location = SourceLocation::caller();
    let allocator = resolve(allocator);
    let bytes = count
        .checked_mul(size_of::<T>())
        .ok_or_else(|| AllocError::size_overflow("array elements"))?;
    let total = padded_size(bytes, ARRAY_HEADER_SIZE, "array header")?;

    let block = if T::FUNDAMENTAL {
        allocator.callocate(1, total, location)?
    } else {
        allocator.allocate(total, location)?
    };

    // SAFETY: `block` spans header + `count` elements.
    let data = unsafe {
        block.cast::<ArrayHeader>().as_ptr().write(ArrayHeader { count });
        block.add(ARRAY_HEADER_SIZE).cast::<T>()
    };

    if !T::FUNDAMENTAL {
        let mut guard = ConstructionGuard {
            allocator,
            block,
            data,
            constructed: 0,
            location,
        };
        while guard.constructed < count {
            // SAFETY: Index is in bounds of the element region.
            unsafe { data.add(guard.constructed).as_ptr().write(T::construct()) };
            guard.constructed += 1;
        }
        let _ = ManuallyDrop::new(guard);
    }

    Ok(data)
}

/// Allocates and initializes `count` elements; failure is fatal
#[track_caller]
pub fn allocate_array<T: ArrayElement>(allocator: AllocatorRef<'_>, count: usize) -> NonNull<T> {
    try_allocate_array(allocator, count)
        .unwrap_or_else(|err| fatal::out_of_memory(&err, SourceLocation::caller()))
}

/// Element count recorded for an array
///
/// # Safety
/// `data` must come from [`allocate_array`]/[`try_allocate_array`] and be
/// live.
pub unsafe fn array_len<T>(data: NonNull<T>) -> usize {
    // SAFETY: Caller contract; the header precedes the first element.
    unsafe { header_of(data).as_ref().count }
}

/// # Safety
/// `data` must be the first element of a live array allocation.
unsafe fn header_of<T>(data: NonNull<T>) -> NonNull<ArrayHeader> {
    // SAFETY: Caller contract.
    unsafe { data.cast::<u8>().sub(ARRAY_HEADER_SIZE).cast() }
}

/// Destructs the elements of an array in descending index order and frees
/// the whole block; `None` is a no-op
///
/// # Safety
/// `data` must come from [`allocate_array`]/[`try_allocate_array`] with the
/// same `T` and the same allocator, and must be live.
#[track_caller]
pub unsafe fn deallocate_array<T: ArrayElement>(allocator: AllocatorRef<'_>, data: Option<NonNull<T>>) {
    let Some(data) = data else {
        return;
    };

    // SAFETY: Caller contract.
    unsafe {
        let header = header_of(data);
        let count = header.as_ref().count;
        if !T::FUNDAMENTAL {
            for index in (0..count).rev() {
                core::ptr::drop_in_place(data.add(index).as_ptr());
            }
        }
        resolve(allocator).free(header.cast(), SourceLocation::caller());
    }
}

/// Owning handle over an array allocation
///
/// Dereferences to `[T]` and deallocates through the allocator it was
/// created with when dropped.
pub struct TypedArray<'a, T: ArrayElement> {
    allocator: AllocatorRef<'a>,
    data: NonNull<T>,
    len: usize,
}

impl<'a, T: ArrayElement> TypedArray<'a, T> {
    /// Allocates `count` initialized elements
    ///
    /// # Errors
    /// Whatever the allocator reports, or `SizeOverflow` for huge counts.
    #[track_caller]
    pub fn new_in(allocator: AllocatorRef<'a>, count: usize) -> AllocResult<Self> {
        let data = try_allocate_array(allocator, count)?;
        Ok(Self {
            allocator,
            data,
            len: count,
        })
    }

    /// Releases ownership, returning the first-element pointer
    pub fn into_raw(self) -> NonNull<T> {
        ManuallyDrop::new(self).data
    }

    /// Takes ownership of a raw array
    ///
    /// # Safety
    /// `data` must come from [`try_allocate_array`]/[`allocate_array`] on
    /// `allocator` with the same `T`, and must not be owned elsewhere.
    pub unsafe fn from_raw(allocator: AllocatorRef<'a>, data: NonNull<T>) -> Self {
        // SAFETY: Caller contract.
        let len = unsafe { array_len(data) };
        Self {
            allocator,
            data,
            len,
        }
    }
}

impl<T: ArrayElement> Deref for TypedArray<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` initialized elements start at `data`.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl<T: ArrayElement> DerefMut for TypedArray<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: As above; the handle is the unique owner.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<T: ArrayElement> Drop for TypedArray<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The handle owns an array allocated on `allocator`.
        unsafe { deallocate_array(self.allocator, Some(self.data)) };
    }
}

impl<T: ArrayElement + core::fmt::Debug> core::fmt::Debug for TypedArray<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{TrackerProxyAllocator, global_heap};

    #[test]
    fn header_stores_count() {
        let data = allocate_array::<u32>(None, 7);
        unsafe {
            assert_eq!(array_len(data), 7);
            deallocate_array(None, Some(data));
        }
    }

    #[test]
    fn strings_are_default_constructed() {
        let mut names = TypedArray::<String>::new_in(None, 3).unwrap();
        assert!(names.iter().all(String::is_empty));
        names[1].push_str("middle");
        assert_eq!(names[1], "middle");
    }

    #[test]
    fn null_deallocation_is_noop() {
        unsafe { deallocate_array::<String>(None, None) };
    }

    #[test]
    fn block_covers_header_and_elements() {
        let tracker = TrackerProxyAllocator::new(global_heap());
        let data = allocate_array::<u64>(Some(&tracker), 4);
        assert_eq!(
            tracker.stats().allocated_bytes,
            ARRAY_HEADER_SIZE + 4 * size_of::<u64>()
        );
        unsafe { deallocate_array(Some(&tracker), Some(data)) };
        assert_eq!(tracker.stats().allocated_count, 0);
    }

    #[test]
    fn element_overflow_is_reported() {
        let err = try_allocate_array::<u64>(None, usize::MAX).unwrap_err();
        assert_eq!(err.code(), "MEM:ALLOC:OVERFLOW");
    }

    #[test]
    fn raw_round_trip_keeps_length() {
        let array = TypedArray::<Option<u8>>::new_in(None, 5).unwrap();
        let raw = array.into_raw();
        let array = unsafe { TypedArray::<Option<u8>>::from_raw(None, raw) };
        assert_eq!(array.len(), 5);
        assert!(array.iter().all(Option::is_none));
    }

    #[test]
    fn panicking_construction_releases_block() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static BUILT: AtomicUsize = AtomicUsize::new(0);
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Fragile;

        // SAFETY: Not fundamental.
        unsafe impl ArrayElement for Fragile {
            const FUNDAMENTAL: bool = false;

            fn construct() -> Self {
                assert!(BUILT.fetch_add(1, Ordering::SeqCst) < 3, "fourth element");
                Fragile
            }
        }

        impl Drop for Fragile {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tracker = TrackerProxyAllocator::new(global_heap());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            try_allocate_array::<Fragile>(Some(&tracker), 10)
        }));
        assert!(result.is_err());
        assert_eq!(DROPPED.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.stats().allocated_count, 0);
    }
}
