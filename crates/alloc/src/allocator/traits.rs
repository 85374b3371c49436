//! The allocator interface every strategy and proxy implements
//!
//! An allocator is identified by a diagnostic [`name`](Allocator::name) and
//! may report the [`parent`](Allocator::parent) it obtains backing memory
//! from. Composition is by value: a proxy owns (or borrows, through the
//! blanket impls for `&A`, `Box<A>`, `Rc<A>`, `Arc<A>`) the allocator it
//! wraps. Destroying an allocator is dropping it.
//!
//! # Safety
//!
//! ## Trait Safety Contract
//!
//! Implementors promise that:
//! - A pointer returned by `allocate`/`callocate`/`reallocate` is valid for
//!   reads and writes of at least the requested number of bytes until it is
//!   passed to `free` or `reallocate` on the same instance
//! - Returned blocks keep the alignment of the blocks their parent returns
//!   (16 bytes for the global heap on 64-bit targets)
//! - `reallocate` preserves the first `min(old, new)` bytes and leaves the
//!   old block valid when it fails
//!
//! ## Caller Contract
//!
//! `free` and `reallocate` are `unsafe`: the pointer must come from the same
//! allocator instance and must still be live. Which violations are detected
//! depends on the kind (the fixed pool and the debug allocator assert; the
//! global heap cannot).

use core::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{AllocError, AllocResult};
use crate::location::SourceLocation;

/// Polymorphic allocator with `malloc`/`free`/`realloc` semantics
///
/// Unlike layout-based allocators, the size of a block is never passed
/// back on `free`; allocators that need it keep it themselves.
///
/// # Safety
/// See the [module-level contract](self).
pub unsafe trait Allocator {
    /// Diagnostic name; not required to be unique
    fn name(&self) -> &str;

    /// Allocator this one obtains its backing memory from, if any
    ///
    /// The child does not imply ownership of the parent in the other
    /// direction: the parent never learns about its children.
    fn parent(&self) -> Option<&dyn Allocator> {
        None
    }

    /// Allocates a block of at least `size` bytes
    ///
    /// The content of the block is unspecified.
    ///
    /// # Errors
    /// Returns an exhaustion error when the allocator cannot serve the
    /// request, or a request error for sizes the allocator never serves.
    fn allocate(&self, size: usize, location: SourceLocation) -> AllocResult<NonNull<u8>>;

    /// Allocates `count * size` zeroed bytes
    ///
    /// # Errors
    /// Same as [`allocate`](Allocator::allocate), plus `SizeOverflow` when
    /// `count * size` does not fit in `usize`.
    fn callocate(
        &self,
        count: usize,
        size: usize,
        location: SourceLocation,
    ) -> AllocResult<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| AllocError::size_overflow("callocate"))?;
        let ptr = self.allocate(total, location)?;
        // SAFETY: `allocate` returned a block valid for `total` bytes.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// Releases a block
    ///
    /// # Safety
    /// - `ptr` must have been returned by this allocator instance
    /// - `ptr` must not have been freed or reallocated since
    unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation);

    /// Grows, shrinks or moves a block
    ///
    /// `None` behaves like [`allocate`](Allocator::allocate). On success the
    /// old pointer is invalid and the first `min(old, new)` bytes are
    /// preserved at the returned pointer; on failure the old block is
    /// untouched.
    ///
    /// # Safety
    /// Same requirements on `ptr` as [`free`](Allocator::free).
    unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        location: SourceLocation,
    ) -> AllocResult<NonNull<u8>>;
}

macro_rules! forward_allocator {
    ($($wrapper:ty),* $(,)?) => {
        $(
            // SAFETY: Pure forwarding; the wrapped allocator upholds the contract.
            unsafe impl<A: Allocator + ?Sized> Allocator for $wrapper {
                #[inline]
                fn name(&self) -> &str {
                    (**self).name()
                }

                #[inline]
                fn parent(&self) -> Option<&dyn Allocator> {
                    (**self).parent()
                }

                #[inline]
                fn allocate(
                    &self,
                    size: usize,
                    location: SourceLocation,
                ) -> AllocResult<NonNull<u8>> {
                    (**self).allocate(size, location)
                }

                #[inline]
                fn callocate(
                    &self,
                    count: usize,
                    size: usize,
                    location: SourceLocation,
                ) -> AllocResult<NonNull<u8>> {
                    (**self).callocate(count, size, location)
                }

                #[inline]
                unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation) {
                    // SAFETY: Caller contract forwarded unchanged.
                    unsafe { (**self).free(ptr, location) }
                }

                #[inline]
                unsafe fn reallocate(
                    &self,
                    ptr: Option<NonNull<u8>>,
                    new_size: usize,
                    location: SourceLocation,
                ) -> AllocResult<NonNull<u8>> {
                    // SAFETY: Caller contract forwarded unchanged.
                    unsafe { (**self).reallocate(ptr, new_size, location) }
                }
            }
        )*
    };
}

forward_allocator!(&A, Box<A>, Rc<A>, Arc<A>);

/// Walk from `allocator` up through its parents, yielding each name
pub fn ancestry(allocator: &dyn Allocator) -> Vec<&str> {
    let mut names = vec![allocator.name()];
    let mut current = allocator.parent();
    while let Some(parent) = current {
        names.push(parent.name());
        current = parent.parent();
    }
    names
}
