use core::{
    mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use sptr::Strict;

use crate::align;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Free-list links are stored as byte offsets from this pointer rather than
/// as pointers. Any actual pointer into the region must be derived from the
/// base pointer, and NOT by casting a stored offset or address directly!
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region would overflow the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> usize {
        // Checked in `new`.
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// Returns `None` if `addr` is not within the region.
    #[inline]
    pub fn offset_of(self, addr: NonZeroUsize) -> Option<usize> {
        self.contains_addr(addr)
            .then(|| addr.get() - self.ptr.addr().get())
    }

    /// Returns `true` if `size_of::<T>()` bytes starting `ofs` bytes from the
    /// base lie entirely within the region and are properly aligned for `T`.
    #[inline]
    fn fits<T>(self, ofs: usize) -> bool {
        let aligned = align::is_aligned(
            self.ptr.addr().get().wrapping_add(ofs),
            mem::align_of::<T>(),
        );

        aligned
            && ofs
                .checked_add(mem::size_of::<T>())
                .map_or(false, |end| end <= self.extent)
    }

    /// Writes a link value `ofs` bytes from the base.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be properly aligned for `T` relative to the base address.
    /// - `ofs + size_of::<T>()` must not exceed the extent of the region.
    /// - The memory at `ofs` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at<T: Copy>(self, ofs: usize, link: T) {
        debug_assert!(self.fits::<T>(ofs), "link out of region: ofs={ofs:#x}");

        unsafe { self.raw_at(ofs).cast::<T>().write(link) };
    }

    /// Reads the link value stored `ofs` bytes from the base.
    ///
    /// No reference to the link is created, so the memory it occupies is
    /// never borrowed.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be properly aligned for `T` relative to the base address.
    /// - The memory at `ofs` must contain a properly initialized `T` value
    ///   previously written by `init_link_at`.
    /// - The memory at `ofs` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_at<T: Copy>(self, ofs: usize) -> T {
        debug_assert!(self.fits::<T>(ofs), "link out of region: ofs={ofs:#x}");

        unsafe { self.raw_at(ofs).cast::<T>().read() }
    }

    #[inline]
    fn raw_at(self, ofs: usize) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        ptr.with_addr(Strict::addr(ptr) + ofs)
    }

    /// Creates a new pointer `ofs` bytes from the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: usize) -> NonNull<u8> {
        debug_assert!(ofs < self.extent);

        // SAFETY: The sum cannot overflow or be zero: it is bounded by
        // `limit()` and at least the (non-zero) base address.
        let addr = unsafe { NonZeroUsize::new_unchecked(self.ptr.addr().get() + ofs) };

        self.ptr.with_addr(addr)
    }

    /// Creates a new slice pointer to `len` bytes starting `ofs` bytes from
    /// the base.
    #[inline]
    pub fn with_offset_and_size(self, ofs: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(ofs.checked_add(len).map_or(false, |end| end <= self.extent));

        let raw_slice = ptr::slice_from_raw_parts_mut(self.with_offset(ofs).as_ptr(), len);

        // SAFETY: the data pointer is derived from a `NonNull`.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}

/// A link in a singly linked list of free blocks.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list. `next` holds the offset of the next free block from the base
/// of the region.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct BlockLink {
    pub next: Option<usize>,
}
