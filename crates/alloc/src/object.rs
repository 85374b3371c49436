//! Single objects placed on an arbitrary allocator

use core::ptr::NonNull;

use crate::api::{AllocatorRef, resolve};
use crate::error::AllocResult;
use crate::location::SourceLocation;
use crate::utils::METADATA_ALIGN;

/// Moves `value` into a block from `allocator`
///
/// # Errors
/// Whatever the allocator reports; `value` is dropped in that case.
#[track_caller]
pub fn new_in<T>(allocator: AllocatorRef<'_>, value: T) -> AllocResult<NonNull<T>> {
    const {
        assert!(
            align_of::<T>() <= METADATA_ALIGN,
            "object alignment exceeds allocator block alignment"
        );
    }

    let block = resolve(allocator).allocate(size_of::<T>(), SourceLocation::caller())?;
    let object = block.cast::<T>();
    // SAFETY: The block is large enough and suitably aligned for `T`.
    unsafe { object.as_ptr().write(value) };
    Ok(object)
}

/// Drops the object and returns its block; `None` is a no-op
///
/// # Safety
/// `object` must come from [`new_in`] on the same allocator and be live.
#[track_caller]
pub unsafe fn delete_in<T>(allocator: AllocatorRef<'_>, object: Option<NonNull<T>>) {
    let Some(object) = object else {
        return;
    };
    // SAFETY: Caller contract.
    unsafe {
        core::ptr::drop_in_place(object.as_ptr());
        resolve(allocator).free(object.cast(), SourceLocation::caller());
    }
}
