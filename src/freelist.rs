//! Free-list allocation.
//!
//! A free-list allocator serves variable-size requests from a list of free
//! extents, kept in ascending address order. Allocation takes the first
//! extent large enough to satisfy the request, splitting off the remainder
//! if it is large enough to be reused. Deallocation reinserts the extent in
//! address order and coalesces it with any free neighbours, so no two free
//! extents are ever adjacent.
//!
//! Each free extent stores its length and the offset of the next free extent
//! in its own first bytes; the allocator needs no memory besides the managed
//! region. Allocated extents carry no header: the `NonNull<[u8]>` returned by
//! [`FreeList::allocate`] records the extent length, and is handed back
//! unchanged to [`FreeList::deallocate`].
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(1)      | O(n)       |
//! | Deallocate               | O(1)      | O(n)       |
//!
//! where `n` is the number of free extents.
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a multiple of the word size and to at least
//! [`MIN_BLOCK_SIZE`] bytes. When the remainder of a chosen extent would be
//! smaller than `MIN_BLOCK_SIZE`, the whole extent is handed out instead, so
//! some internal fragmentation is traded for never leaving unusably small
//! free fragments. First-fit search is subject to external fragmentation
//! when long-lived and short-lived allocations are interleaved.

use core::{
    alloc::{Layout, LayoutError},
    cmp, fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use crate::{align, base::BasePtr, AllocError, AllocInitError, BackingAllocator, Raw};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The alignment of every extent handed out by a [`FreeList`].
pub const WORD_ALIGN: usize = mem::align_of::<usize>();

/// The smallest extent a [`FreeList`] will hand out or keep on its free list.
///
/// Every extent must be able to hold a free-extent header once it is freed.
pub const MIN_BLOCK_SIZE: usize = align::align_up(mem::size_of::<ExtentLink>(), WORD_ALIGN);

/// The header stored at the start of every free extent.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct ExtentLink {
    /// The length of this extent in bytes.
    len: usize,
    /// The offset of the next free extent, which is always greater than the
    /// offset of this one.
    next: Option<usize>,
}

/// A variable-size, first-fit free-list allocator.
///
/// For a discussion of free-list allocation, see the [module-level
/// documentation].
///
/// [module-level documentation]: crate::freelist
pub struct FreeList<A: BackingAllocator> {
    base: BasePtr,
    /// Offset of the lowest-addressed free extent.
    free_list: Option<usize>,
    used: usize,
    backing_allocator: A,
}

impl FreeList<Raw> {
    /// Constructs a new `FreeList` from a raw pointer.
    ///
    /// The allocator starts out with a single free extent spanning the whole
    /// region. A zero-length region is permitted; every allocation from it
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if any of the following are
    /// true:
    /// - `region` is not aligned to [`WORD_ALIGN`].
    /// - `len` is not a multiple of [`WORD_ALIGN`].
    /// - `len` is nonzero but smaller than [`MIN_BLOCK_SIZE`].
    /// - The region would extend past the end of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes, and the
    /// memory must not be accessed except through this allocator for as long
    /// as the allocator exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        len: usize,
    ) -> Result<FreeList<Raw>, AllocInitError> {
        unsafe { RawFreeList::try_new(region, len).map(|f| f.with_backing_allocator(Raw)) }
    }

    /// Decomposes the allocator into its region pointer and length.
    ///
    /// Any outstanding allocations remain valid memory, but the allocator
    /// no longer tracks them.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        let this = ManuallyDrop::new(self);

        (this.base.ptr(), this.base.extent())
    }
}

#[cfg(any(feature = "alloc", test))]
impl FreeList<Global> {
    /// Attempts to construct a new `FreeList` backed by the global allocator.
    ///
    /// The memory managed by this `FreeList` is allocated from the global
    /// allocator according to the layout indicated by
    /// [`Self::region_layout(len)`], and freed when the allocator is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is not a valid region size (see
    /// [`FreeList::new_raw`]) or if the region could not be allocated.
    ///
    /// [`Self::region_layout(len)`]: FreeList::region_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(len: usize) -> Result<FreeList<Global>, AllocInitError> {
        let region_layout = Self::region_layout(len).map_err(|_| AllocInitError::InvalidConfig)?;
        let region_ptr = crate::global_region(region_layout)?;

        match unsafe { RawFreeList::try_new(region_ptr, len) } {
            Ok(f) => Ok(f.with_backing_allocator(Global)),
            Err(e) => {
                unsafe { Global.deallocate(region_ptr, region_layout) };
                Err(e)
            }
        }
    }
}

impl<A> FreeList<A>
where
    A: BackingAllocator,
{
    /// Returns the layout requirements of a region of `len` bytes managed by
    /// a `FreeList`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `len` cannot be represented as the size of a
    /// [`Layout`].
    pub fn region_layout(len: usize) -> Result<Layout, LayoutError> {
        Layout::from_size_align(len, WORD_ALIGN)
    }

    /// Attempts to allocate an extent of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] covering the whole extent. Its
    /// length is `size` rounded up to a multiple of [`WORD_ALIGN`] and to at
    /// least [`MIN_BLOCK_SIZE`], and may be larger still if the remainder of
    /// the chosen free extent was too small to split off. The extent is
    /// aligned to [`WORD_ALIGN`] relative to the base of the region.
    ///
    /// The contents of the extent are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, or if no free extent is large enough.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let required = align::checked_align_up(size, WORD_ALIGN).ok_or(AllocError)?;
        let required = cmp::max(required, MIN_BLOCK_SIZE);

        let mut prev = None;
        let mut current = self.free_list;

        while let Some(ofs) = current {
            let extent: ExtentLink = unsafe { self.base.link_at(ofs) };

            if extent.len >= required {
                let (len, next) = if extent.len - required >= MIN_BLOCK_SIZE {
                    // Split off the tail. It stays at the same position in
                    // the list since it lies above the allocated head.
                    let tail = ofs + required;
                    unsafe {
                        self.base.init_link_at(
                            tail,
                            ExtentLink {
                                len: extent.len - required,
                                next: extent.next,
                            },
                        )
                    };

                    log::trace!(
                        "freelist: split extent {ofs:#x}+{:#x} at {tail:#x}",
                        extent.len
                    );

                    (required, Some(tail))
                } else {
                    (extent.len, extent.next)
                };

                unsafe { self.set_next(prev, next) };
                self.used += len;

                return Ok(self.base.with_offset_and_size(ofs, len));
            }

            prev = Some(ofs);
            current = extent.next;
        }

        log::trace!("freelist: no extent of {required:#x} bytes available");

        Err(AllocError)
    }

    /// Deallocates the extent referenced by `ptr`.
    ///
    /// The extent is reinserted into the free list in address order and
    /// merged with the free extents immediately before and after it, if
    /// any.
    ///
    /// # Safety
    ///
    /// `ptr` must be a value returned by [`Self::allocate`] on this allocator,
    /// unmodified, which has not already been deallocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>) {
        let len = ptr.len();
        let Some(ofs) = self.base.offset_of(ptr.cast::<u8>().addr()) else {
            debug_assert!(false, "pointer not owned by this allocator");
            return;
        };

        debug_assert!(align::is_aligned(ofs, WORD_ALIGN));
        debug_assert!(align::is_aligned(len, WORD_ALIGN) && len >= MIN_BLOCK_SIZE);
        debug_assert!(ofs + len <= self.base.extent(), "extent out of region");

        // Find the free extents on either side of the freed one.
        let mut prev: Option<(usize, ExtentLink)> = None;
        let mut next = self.free_list;

        while let Some(n) = next {
            if n >= ofs {
                break;
            }

            let link: ExtentLink = unsafe { self.base.link_at(n) };
            prev = Some((n, link));
            next = link.next;
        }

        debug_assert!(
            next.map_or(true, |n| ofs + len <= n),
            "freed extent overlaps a free extent"
        );
        debug_assert!(
            prev.map_or(true, |(p, link)| p + link.len <= ofs),
            "freed extent overlaps a free extent"
        );

        let mut extent = ExtentLink { len, next };

        // Absorb the following extent if the two touch.
        if let Some(n) = next {
            if ofs + len == n {
                let following: ExtentLink = unsafe { self.base.link_at(n) };
                extent.len += following.len;
                extent.next = following.next;

                log::trace!("freelist: merged {ofs:#x} with following extent {n:#x}");
            }
        }

        match prev {
            // The preceding extent absorbs this one.
            Some((p, mut link)) if p + link.len == ofs => {
                link.len += extent.len;
                link.next = extent.next;
                unsafe { self.base.init_link_at(p, link) };

                log::trace!("freelist: merged {ofs:#x} into preceding extent {p:#x}");
            }

            Some((p, mut link)) => unsafe {
                self.base.init_link_at(ofs, extent);
                link.next = Some(ofs);
                self.base.init_link_at(p, link);
            },

            None => {
                unsafe { self.base.init_link_at(ofs, extent) };
                self.free_list = Some(ofs);
            }
        }

        self.used -= len;
    }

    /// Points the link preceding a removed extent at `next`.
    ///
    /// # Safety
    ///
    /// `prev`, if `Some`, must be the offset of a free extent.
    unsafe fn set_next(&mut self, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(p) => unsafe {
                let mut link: ExtentLink = self.base.link_at(p);
                link.next = next;
                self.base.init_link_at(p, link);
            },
            None => self.free_list = next,
        }
    }

    /// Returns the size of the managed region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.base.extent()
    }

    /// Returns the number of bytes currently allocated.
    ///
    /// This counts whole extents, including any rounding applied to the
    /// requested sizes.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Returns the number of bytes currently free.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.used
    }

    /// Returns the length of the largest free extent.
    ///
    /// An allocation of up to this many bytes, rounded as described in
    /// [`Self::allocate`], is guaranteed to succeed.
    pub fn largest_free_extent(&self) -> usize {
        self.free_extents().map(|(_, len)| len).max().unwrap_or(0)
    }

    /// Returns an iterator over the free extents as `(offset, len)` pairs, in
    /// ascending address order.
    pub fn free_extents(&self) -> FreeExtents<'_> {
        FreeExtents {
            base: self.base,
            next: self.free_list,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if `ptr` points into the region managed by this
    /// allocator.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }
}

impl<A> fmt::Debug for FreeList<A>
where
    A: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("base", &self.base.ptr())
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}

impl<A> Drop for FreeList<A>
where
    A: BackingAllocator,
{
    fn drop(&mut self) {
        if let Ok(region_layout) = Self::region_layout(self.base.extent()) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout)
            }
        }
    }
}

/// An iterator over the free extents of a [`FreeList`].
///
/// Yields `(offset, len)` pairs, where `offset` is relative to the base of
/// the region.
#[derive(Debug)]
pub struct FreeExtents<'a> {
    base: BasePtr,
    next: Option<usize>,
    _marker: PhantomData<&'a ()>,
}

impl Iterator for FreeExtents<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let ofs = self.next?;

        // SAFETY: the allocator is borrowed for 'a, so the list cannot change
        // while this iterator exists.
        let link: ExtentLink = unsafe { self.base.link_at(ofs) };
        self.next = link.next;

        Some((ofs, link.len))
    }
}

struct RawFreeList {
    base: BasePtr,
    free_list: Option<usize>,
}

impl RawFreeList {
    /// Attempts to construct a new `FreeList` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes.
    unsafe fn try_new(region: NonNull<u8>, len: usize) -> Result<RawFreeList, AllocInitError> {
        if !align::is_aligned(region.addr().get(), WORD_ALIGN)
            || !align::is_aligned(len, WORD_ALIGN)
            || (len != 0 && len < MIN_BLOCK_SIZE)
        {
            return Err(AllocInitError::InvalidConfig);
        }

        // Ensure pointer calculations will not overflow.
        let base = BasePtr::new(region, len).ok_or(AllocInitError::InvalidConfig)?;

        let free_list = (len != 0).then_some(0);
        if free_list.is_some() {
            unsafe { base.init_link_at(0, ExtentLink { len, next: None }) };
        }

        log::debug!("freelist: managing {len:#x} bytes at {:#x}", base.addr());

        Ok(RawFreeList { base, free_list })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> FreeList<A> {
        FreeList {
            base: self.base,
            free_list: self.free_list,
            used: 0,
            backing_allocator,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    fn offset_of<A: BackingAllocator>(list: &FreeList<A>, ptr: NonNull<[u8]>) -> usize {
        ptr.cast::<u8>().addr().get() - list.base.addr().get()
    }

    fn assert_invariants<A: BackingAllocator>(list: &FreeList<A>) {
        let extents: Vec<_> = list.free_extents().collect();

        for pair in extents.windows(2) {
            let (a_ofs, a_len) = pair[0];
            let (b_ofs, _) = pair[1];
            assert!(a_ofs + a_len < b_ofs, "free extents touch: {extents:?}");
        }

        let free: usize = extents.iter().map(|&(_, len)| len).sum();
        assert_eq!(free + list.used_bytes(), list.capacity());
    }

    #[test]
    fn invalid_regions_error() {
        let mut buf = vec![0usize; 16];
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

        unsafe {
            // Misaligned base.
            let misaligned = NonNull::new(ptr.as_ptr().add(1)).unwrap();
            FreeList::new_raw(misaligned, 64).unwrap_err();

            // Length not a multiple of the word size.
            FreeList::new_raw(ptr, 65).unwrap_err();

            // Too small to hold a free extent.
            FreeList::new_raw(ptr, WORD_ALIGN).unwrap_err();
        }

        FreeList::<Global>::try_new(MIN_BLOCK_SIZE - 1).unwrap_err();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "pointer not owned by this allocator")]
    fn foreign_pointer_is_rejected() {
        let mut list = FreeList::<Global>::try_new(256).unwrap();
        let mut other = FreeList::<Global>::try_new(256).unwrap();

        let b = other.allocate(32).unwrap();
        unsafe { list.deallocate(b) };
    }

    #[test]
    fn zero_length_region() {
        let mut list = FreeList::<Global>::try_new(0).unwrap();
        list.allocate(1).unwrap_err();
        assert_eq!(list.free_extents().count(), 0);
        assert_eq!(list.largest_free_extent(), 0);
    }

    #[test]
    fn zero_size_request_fails() {
        let mut list = FreeList::<Global>::try_new(1024).unwrap();
        list.allocate(0).unwrap_err();
        assert_eq!(list.used_bytes(), 0);
    }

    #[test]
    fn oversized_request_fails() {
        let mut list = FreeList::<Global>::try_new(1024).unwrap();
        list.allocate(1025).unwrap_err();
        list.allocate(usize::MAX).unwrap_err();
        assert_invariants(&list);
    }

    #[test]
    fn freed_extent_is_reused_first_fit() {
        let mut list = FreeList::<Global>::try_new(1024).unwrap();

        let a = list.allocate(100).unwrap();
        let b = list.allocate(200).unwrap();
        let c = list.allocate(50).unwrap();
        assert_invariants(&list);

        let b_ofs = offset_of(&list, b);
        unsafe { list.deallocate(b) };
        assert_invariants(&list);

        let d = list.allocate(150).unwrap();
        assert_eq!(offset_of(&list, d), b_ofs);
        assert_invariants(&list);

        unsafe {
            list.deallocate(a);
            list.deallocate(c);
            list.deallocate(d);
        }

        assert_eq!(list.free_extents().collect::<Vec<_>>(), [(0, 1024)]);
    }

    #[test]
    fn exact_fit_uses_whole_region() {
        let mut list = FreeList::<Global>::try_new(64).unwrap();

        let a = list.allocate(64).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(list.used_bytes(), 64);
        assert_eq!(list.free_extents().count(), 0);

        list.allocate(1).unwrap_err();

        unsafe { list.deallocate(a) };
        assert_eq!(list.used_bytes(), 0);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let mut list = FreeList::<Global>::try_new(64).unwrap();

        // The remaining 16 bytes cannot hold a free extent.
        let a = list.allocate(48).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(list.free_extents().count(), 0);
        unsafe { list.deallocate(a) };

        // The remaining 24 bytes can.
        let b = list.allocate(40).unwrap();
        assert_eq!(b.len(), 40);
        assert_eq!(list.free_extents().collect::<Vec<_>>(), [(40, 24)]);
        assert_invariants(&list);
    }

    #[test]
    fn requests_are_rounded() {
        let mut list = FreeList::<Global>::try_new(256).unwrap();

        let a = list.allocate(1).unwrap();
        assert_eq!(a.len(), MIN_BLOCK_SIZE);

        let b = list.allocate(MIN_BLOCK_SIZE + 1).unwrap();
        assert_eq!(b.len(), MIN_BLOCK_SIZE + WORD_ALIGN);
        assert!(align::is_aligned(offset_of(&list, b), WORD_ALIGN));

        assert_eq!(list.used_bytes(), a.len() + b.len());
        assert_invariants(&list);
    }

    #[test]
    fn freeing_all_leaves_one_extent() {
        const ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in ORDERS {
            let mut list = FreeList::<Global>::try_new(512).unwrap();

            let blocks = [
                list.allocate(64).unwrap(),
                list.allocate(24).unwrap(),
                list.allocate(100).unwrap(),
            ];

            for idx in order {
                unsafe { list.deallocate(blocks[idx]) };
                assert_invariants(&list);
            }

            assert_eq!(
                list.free_extents().collect::<Vec<_>>(),
                [(0, 512)],
                "free order {order:?}"
            );
        }
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut list = FreeList::<Global>::try_new(96).unwrap();

        let a = list.allocate(32).unwrap();
        let b = list.allocate(32).unwrap();
        let c = list.allocate(32).unwrap();
        list.allocate(1).unwrap_err();

        unsafe {
            list.deallocate(a);
            list.deallocate(c);
        }
        assert_eq!(list.free_extents().collect::<Vec<_>>(), [(0, 32), (64, 32)]);

        unsafe { list.deallocate(b) };
        assert_eq!(list.free_extents().collect::<Vec<_>>(), [(0, 96)]);
    }

    #[test]
    fn freeing_increases_largest_extent() {
        let mut list = FreeList::<Global>::try_new(256).unwrap();

        let mut blocks = Vec::new();
        while let Ok(b) = list.allocate(32) {
            blocks.push(b);
        }
        assert_eq!(list.largest_free_extent(), 0);

        let mut largest = 0;
        for b in blocks.into_iter().step_by(2) {
            unsafe { list.deallocate(b) };
            let now = list.largest_free_extent();
            assert!(now >= largest);
            assert!(now > 0);
            largest = now;
        }
        assert_invariants(&list);

        list.allocate(largest).unwrap();
    }

    #[test]
    fn allocations_hold_their_contents() {
        let mut list = FreeList::<Global>::try_new(1024).unwrap();

        let mut blocks = Vec::new();
        for (i, size) in [8, 100, 33, 64, 200].into_iter().enumerate() {
            let b = list.allocate(size).unwrap();
            unsafe { b.cast::<u8>().as_ptr().write_bytes(i as u8 + 1, b.len()) };
            blocks.push((i as u8 + 1, b));
        }

        for (fill, b) in blocks {
            let bytes = unsafe { b.as_ref() };
            assert!(bytes.iter().all(|&byte| byte == fill));
            unsafe { list.deallocate(b) };
        }

        assert_eq!(list.free_extents().collect::<Vec<_>>(), [(0, 1024)]);
    }

    #[test]
    fn raw_region_round_trip() {
        let mut buf = vec![0usize; 32];
        let len = buf.len() * mem::size_of::<usize>();
        let ptr = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();

        let mut list = unsafe { FreeList::new_raw(ptr, len).unwrap() };
        assert!(list.contains(ptr));

        let a = list.allocate(16).unwrap();
        assert!(list.contains(a.cast()));
        unsafe { list.deallocate(a) };

        let (region, region_len) = list.into_raw_parts();
        assert_eq!(region, ptr);
        assert_eq!(region_len, len);
    }
}
