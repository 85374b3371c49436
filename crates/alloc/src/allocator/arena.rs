//! Arena proxy allocator
//!
//! # Safety
//!
//! Every block handed out is prefixed with an [`ArenaLink`] header that
//! threads it onto an intrusive doubly-linked list owned by the arena:
//! - The header is exactly two link pointers, padded to the metadata
//!   alignment so the payload keeps the parent's alignment
//! - A header is only ever reached from the list head or from a payload
//!   pointer the arena returned
//! - Reallocation relinks neighbours when the parent moves a block
//!
//! ## Invariants
//!
//! - Every live payload appears in the list exactly once
//! - `live` equals the list length
//! - Dropping the arena frees every remaining block through the parent

use core::cell::Cell;
use core::ptr::NonNull;

use super::Allocator;
use crate::error::AllocResult;
use crate::location::SourceLocation;
use crate::utils::padded_size;

#[cfg(feature = "logging")]
use tracing::debug;

/// Intrusive list node stored in front of every arena payload
#[repr(C, align(16))]
struct ArenaLink {
    prev: Option<NonNull<ArenaLink>>,
    next: Option<NonNull<ArenaLink>>,
}

/// Bytes the arena adds in front of every allocation
pub const ARENA_HEADER_SIZE: usize = size_of::<ArenaLink>();

/// Proxy that remembers every allocation and releases them all at once
///
/// Callers doing many short-lived allocations within one phase can skip
/// individual frees and drop (or [`reset`](Self::reset)) the arena instead.
/// Individual frees still work and return memory to the parent immediately.
/// Not thread-safe.
///
/// # Examples
/// ```
/// use nebula_alloc::prelude::*;
///
/// let tracker = TrackerProxyAllocator::new(global_heap());
/// {
///     let arena = ArenaProxyAllocator::new(&tracker);
///     for size in [16, 256, 4096] {
///         arena.allocate(size, here!())?;
///     }
/// }
/// assert_eq!(tracker.stats().allocated_count, 0);
/// # Ok::<(), nebula_alloc::MemoryError>(())
/// ```
pub struct ArenaProxyAllocator<P: Allocator> {
    parent: P,
    name: String,
    head: Cell<Option<NonNull<ArenaLink>>>,
    live: Cell<usize>,
}

impl<P: Allocator> ArenaProxyAllocator<P> {
    /// Creates an arena over `parent`
    pub fn new(parent: P) -> Self {
        Self::with_name(parent, "arena-proxy")
    }

    /// Creates an arena over `parent` with a diagnostic name
    pub fn with_name(parent: P, name: impl Into<String>) -> Self {
        let arena = Self {
            parent,
            name: name.into(),
            head: Cell::new(None),
            live: Cell::new(0),
        };

        #[cfg(feature = "logging")]
        debug!(arena = %arena.name, parent = arena.parent.name(), "arena created");

        arena
    }

    /// Number of blocks currently owned by the arena
    pub fn live_count(&self) -> usize {
        self.live.get()
    }

    /// Frees every live block through the parent, keeping the arena usable
    pub fn reset(&self) {
        let released = self.release_all();

        #[cfg(feature = "logging")]
        debug!(arena = %self.name, released, "arena reset");
        #[cfg(not(feature = "logging"))]
        let _ = released;
    }

    /// Walks the list from head to tail, freeing each node
    fn release_all(&self) -> usize {
        let mut released = 0;
        let mut cursor = self.head.take();
        while let Some(link) = cursor {
            // SAFETY: Nodes on the list are live headers written by `link_front`.
            cursor = unsafe { link.as_ref().next };
            // SAFETY: The header address is the block the parent returned.
            unsafe { self.parent.free(link.cast(), SourceLocation::internal()) };
            released += 1;
        }
        self.live.set(0);
        released
    }

    /// Initializes `link` and inserts it at the head of the list
    ///
    /// # Safety
    /// `link` must point to at least `ARENA_HEADER_SIZE` writable bytes
    /// that are not on the list.
    unsafe fn link_front(&self, link: NonNull<ArenaLink>) {
        let next = self.head.get();
        // SAFETY: Caller contract; `next` is a live header.
        unsafe {
            link.as_ptr().write(ArenaLink { prev: None, next });
            if let Some(next) = next {
                (*next.as_ptr()).prev = Some(link);
            }
        }
        self.head.set(Some(link));
        self.live.set(self.live.get() + 1);
    }

    /// Removes `link` from the list
    ///
    /// # Safety
    /// `link` must be a header currently on this arena's list.
    unsafe fn unlink(&self, link: NonNull<ArenaLink>) {
        // SAFETY: Caller contract; neighbours are live headers.
        unsafe {
            let ArenaLink { prev, next } = link.as_ptr().read();
            self.replace_neighbours(prev, next, next, prev);
        }
        self.live.set(self.live.get() - 1);
    }

    /// Points `prev.next` at `new_next` (or the head, when `prev` is none)
    /// and `next.prev` at `new_prev`.
    ///
    /// # Safety
    /// `prev` and `next` must be live headers of this arena.
    unsafe fn replace_neighbours(
        &self,
        prev: Option<NonNull<ArenaLink>>,
        next: Option<NonNull<ArenaLink>>,
        new_next: Option<NonNull<ArenaLink>>,
        new_prev: Option<NonNull<ArenaLink>>,
    ) {
        // SAFETY: Caller contract.
        unsafe {
            match prev {
                Some(prev) => (*prev.as_ptr()).next = new_next,
                None => self.head.set(new_next),
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = new_prev;
            }
        }
    }

    fn header_of(ptr: NonNull<u8>) -> NonNull<ArenaLink> {
        // SAFETY: Arena payloads are always preceded by their header.
        unsafe { ptr.sub(ARENA_HEADER_SIZE).cast() }
    }

    fn payload_of(link: NonNull<ArenaLink>) -> NonNull<u8> {
        // SAFETY: The block was sized as header + payload.
        unsafe { link.cast::<u8>().add(ARENA_HEADER_SIZE) }
    }
}

// SAFETY: Payloads are sub-ranges of parent blocks past a private header;
// headers are only touched through the list.
unsafe impl<P: Allocator> Allocator for ArenaProxyAllocator<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&dyn Allocator> {
        Some(&self.parent)
    }

    fn allocate(&self, size: usize, location: SourceLocation) -> AllocResult<NonNull<u8>> {
        let total = padded_size(size, ARENA_HEADER_SIZE, "arena header")?;
        let block = self.parent.allocate(total, location)?;
        let link = block.cast::<ArenaLink>();
        // SAFETY: Fresh block of at least header size, not on the list.
        unsafe { self.link_front(link) };
        Ok(Self::payload_of(link))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, location: SourceLocation) {
        let link = Self::header_of(ptr);
        // SAFETY: Caller guarantees `ptr` is a live payload of this arena.
        unsafe {
            self.unlink(link);
            self.parent.free(link.cast(), location);
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

        let total = padded_size(new_size, ARENA_HEADER_SIZE, "arena header")?;
        let old_link = Self::header_of(ptr);
        // SAFETY: Caller guarantees `ptr` is a live payload; the header
        // bytes travel with the block if the parent moves it.
        let block = unsafe { self.parent.reallocate(Some(old_link.cast()), total, location)? };
        let new_link = block.cast::<ArenaLink>();

        if new_link != old_link {
            // SAFETY: The moved header still names the old neighbours, which
            // are live headers on this list.
            unsafe {
                let ArenaLink { prev, next } = new_link.as_ptr().read();
                self.replace_neighbours(prev, next, Some(new_link), Some(new_link));
            }
        }
        Ok(Self::payload_of(new_link))
    }
}

impl<P: Allocator> Drop for ArenaProxyAllocator<P> {
    fn drop(&mut self) {
        let released = self.release_all();

        #[cfg(feature = "logging")]
        debug!(arena = %self.name, released, "arena destroyed");
        #[cfg(not(feature = "logging"))]
        let _ = released;
    }
}

impl<P: Allocator> core::fmt::Debug for ArenaProxyAllocator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaProxyAllocator")
            .field("name", &self.name)
            .field("live", &self.live.get())
            .finish()
    }
}
