//! A fixed-arena binary-buddy allocator.
//!
//! This crate manages a single contiguous region of `2^MAX_ORDER` bytes by
//! partitioning it into power-of-two-sized, power-of-two-aligned blocks.
//! Allocation and deallocation run in `O(MAX_ORDER - MIN_ORDER)` time, with
//! freed blocks eagerly coalesced with their buddies.
//!
//! The allocator tracks every block in a fixed table of page descriptors
//! allocated up front, so the managed region itself is never written by the
//! allocator. This makes it suitable as a page allocator beneath a kernel or
//! embedded heap, where the managed memory may not be byte-addressable from
//! ordinary code.
//!
//! # Example
//!
//! ```
//! use buddy_arena::BuddyArena;
//!
//! // 4 KiB pages, 1 MiB arena.
//! let mut arena = BuddyArena::<12, 20, _>::try_new().unwrap();
//!
//! let block = arena.alloc(8192).unwrap();
//! assert_eq!(block.len(), 8192);
//!
//! unsafe { arena.free(block.cast()) };
//! ```
//!
//! # Concurrency
//!
//! [`BuddyArena`] is a synchronous, single-threaded data structure; every
//! mutating operation takes `&mut self`. Callers that share an arena between
//! threads must wrap it in their own mutual-exclusion primitive.

#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![doc(html_root_url = "https://docs.rs/buddy-arena/0.1.0")]

extern crate alloc;

#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops.
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

pub mod buddy;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

pub use crate::buddy::BuddyArena;

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig,
}

/// The error type for allocation requests.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The requested size exceeds the largest block the arena can hold.
    ///
    /// No arena state is touched before this is detected; the caller may
    /// retry with a smaller size.
    RequestTooLarge,

    /// No free block of sufficient order exists.
    ///
    /// This can occur even with free bytes available, if they are fragmented
    /// below the needed order. The allocator performs no compaction; the
    /// caller may free other blocks and retry.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::RequestTooLarge => {
                write!(f, "requested size exceeds the largest supported block")
            }
            AllocError::OutOfMemory => {
                write!(f, "no free block large enough to satisfy the request")
            }
        }
    }
}

/// A pointer to the base of the region of memory managed by an allocator.
///
/// All allocator bookkeeping is done with byte offsets from this base;
/// machine pointers are minted only when handing a block to the caller.
#[derive(Copy, Clone, Debug)]
struct BasePtr {
    ptr: NonNull<u8>,
}

impl BasePtr {
    /// Calculates the offset from `self` to `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is below the base address.
    fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get()
            .checked_sub(self.ptr.addr().get())
            .expect("address precedes the arena base")
    }

    /// Creates a new pointer at the given offset from the base.
    ///
    /// The returned pointer has the provenance of the base pointer.
    fn with_offset(self, offset: usize) -> NonNull<u8> {
        let addr = self.ptr.addr().checked_add(offset).unwrap();
        self.ptr.with_addr(addr)
    }

    fn with_offset_and_size(self, offset: usize, len: usize) -> NonNull<[u8]> {
        NonNull::slice_from_raw_parts(self.with_offset(offset), len)
    }
}

/// Types which provide memory which backs an allocator.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by
///   another allocator. This is the case when constructing the allocator
///   from a raw pointer. Memory used by this allocator can be reclaimed
///   using `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by a raw pointer.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;
impl Sealed for Global {}
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
