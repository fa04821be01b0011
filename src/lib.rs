//! Allocators for a pre-reserved, contiguous region of memory.
//!
//! This crate provides two allocation strategies which partition a single
//! region handed to them at construction time:
//!
//! - [`FreeList`], a variable-size allocator which serves requests from an
//!   address-ordered list of free extents using first-fit search, splitting
//!   oversized extents and coalescing neighbours on free.
//! - [`Buddy`], a binary-buddy allocator which rounds requests up to a power
//!   of two, splits larger blocks down to the requested size and merges
//!   buddies back together on free.
//!
//! Neither allocator calls into a general-purpose heap once constructed. The
//! bookkeeping for free memory lives inside the free memory itself.
//!
//! ## Thread safety
//!
//! The allocators are designed for single-threaded use and are neither
//! `Send` nor `Sync`. Sharing an allocator between threads requires external
//! synchronization.

#![doc(html_root_url = "https://docs.rs/carve_alloc/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods which have since been
// stabilized in `core`.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

pub mod align;
mod base;
pub mod buddy;
pub mod freelist;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{buddy::Buddy, freelist::FreeList};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
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
    /// This variant is returned when the region passed to a constructor
    /// cannot be managed by the allocator, e.g. because it is misaligned or
    /// has an unsupported size.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate region (size: {}, align: {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
///
/// Running out of space is an expected outcome for a fixed-size region, so
/// this is reported as a value rather than a panic. The caller may free
/// memory and retry, or retry with a smaller size.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
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

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Zero-sized regions are never obtained from the global allocator.
        if layout.size() != 0 {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Obtains a region described by `layout` from the global allocator.
///
/// Zero-sized layouts yield a dangling, suitably aligned pointer.
#[cfg(any(feature = "alloc", test))]
fn global_region(layout: Layout) -> Result<NonNull<u8>, AllocInitError> {
    use sptr::invalid_mut;

    if layout.size() == 0 {
        // SAFETY: align is guaranteed to be non-zero
        return Ok(unsafe { NonNull::new_unchecked(invalid_mut::<u8>(layout.align())) });
    }

    // SAFETY: region size is not zero
    let raw = unsafe { alloc::alloc::alloc(layout) };
    NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
