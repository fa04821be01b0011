//! Binary-buddy allocation.
//!
//! A buddy allocator manages a region whose size is a power of two. The
//! region is divided into _levels_: level `k` consists of blocks of
//! `MIN_BLK_SIZE << k` bytes, and the top level consists of a single block
//! spanning the whole region. Every block except the top one has a _buddy_,
//! the other half of the block it was split from, found by toggling bit
//! `log2(block_size)` of its offset.
//!
//! Allocation rounds the request up to a level, then takes a free block from
//! the lowest level at or above it which has one, splitting it in halves
//! until it reaches the requested level. Each split leaves the upper half on
//! the free list of the level below. Deallocation is the reverse: while the
//! buddy of the freed block is also free, the two are merged into a block one
//! level up. As a result, no block and its buddy are ever free at the same
//! time.
//!
//! Each level keeps a singly linked list of its free blocks, stored in the
//! first bytes of the blocks themselves. Blocks carry no header, so the
//! caller must pass the allocation size back to [`Buddy::deallocate`].
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                    |
//! |--------------------------|-----------|-------------------------------|
//! | Allocate                 | O(1)      | O(levels)                     |
//! | Deallocate               | O(1)      | O(levels * free blocks)       |
//!
//! #### Fragmentation
//!
//! Rounding every request up to a power of two causes internal
//! fragmentation of up to half of each block. External fragmentation is
//! limited by merging, but a single live block prevents its ancestors from
//! being reassembled.

use core::{
    alloc::{Layout, LayoutError},
    fmt,
    marker::PhantomData,
    mem::{self, ManuallyDrop},
    ptr::NonNull,
};

use crate::{
    align,
    base::{BasePtr, BlockLink},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The most levels a `Buddy` can have: one per bit of a `usize`.
const MAX_LEVELS: usize = usize::BITS as usize;

#[derive(Copy, Clone)]
struct BuddyLevel {
    block_size: usize,
    /// Offset of the first free block at this level.
    free_list: Option<usize>,
}

impl BuddyLevel {
    const EMPTY: BuddyLevel = BuddyLevel {
        block_size: 0,
        free_list: None,
    };

    /// Retrieves the offset of the buddy of the block which starts
    /// `block_ofs` bytes from the base.
    #[inline]
    fn buddy_ofs(&self, block_ofs: usize) -> usize {
        block_ofs ^ self.block_size
    }

    /// Pushes a block onto the free list.
    ///
    /// # Safety
    ///
    /// `block` must be the offset of an unallocated block of this level's
    /// size which is not already on a free list.
    unsafe fn free_list_push(&mut self, base: BasePtr, block: usize) {
        debug_assert!(align::is_aligned(block, self.block_size));

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    next: self.free_list,
                },
            )
        };

        self.free_list = Some(block);
    }

    /// Pops a block from the free list.
    unsafe fn free_list_pop(&mut self, base: BasePtr) -> Option<usize> {
        let head = self.free_list?;

        let link: BlockLink = unsafe { base.link_at(head) };
        self.free_list = link.next;

        Some(head)
    }

    /// Removes the specified block from the free list, if present.
    ///
    /// Returns `true` if the block was found and removed.
    unsafe fn free_list_remove(&mut self, base: BasePtr, block: usize) -> bool {
        let mut prev = None;
        let mut current = self.free_list;

        while let Some(cur) = current {
            let link: BlockLink = unsafe { base.link_at(cur) };

            if cur == block {
                match prev {
                    // Link `prev` forward to `next`.
                    Some(p) => unsafe { base.init_link_at(p, link) },

                    // If there's no previous block, then `block` is the head
                    // of the free list.
                    None => self.free_list = link.next,
                }

                return true;
            }

            prev = Some(cur);
            current = link.next;
        }

        false
    }
}

/// A binary-buddy allocator.
///
/// This takes one const parameter, `MIN_BLK_SIZE`, the size of the smallest
/// block the allocator will hand out. It is subject to the following
/// invariants:
/// - `MIN_BLK_SIZE` must be a power of two.
/// - `MIN_BLK_SIZE` must be at least large enough to hold a free-list link,
///   i.e. `2 * mem::size_of::<usize>()` bytes.
///
/// Attempting to construct a `Buddy` whose const parameter violates these
/// invariants will result in a panic.
///
/// For example, the type of a buddy allocator whose smallest blocks are 64
/// bytes would be:
///
/// ```
/// use carve_alloc::Buddy;
///
/// type CustomBuddy<A> = Buddy<64, A>;
/// # fn main() {}
/// ```
///
/// For a discussion of buddy allocation, see the [module-level
/// documentation].
///
/// [module-level documentation]: crate::buddy
pub struct Buddy<const MIN_BLK_SIZE: usize, A: BackingAllocator> {
    base: BasePtr,
    num_levels: usize,
    /// Level `k` holds blocks of `MIN_BLK_SIZE << k` bytes. Only the first
    /// `num_levels` entries are in use.
    levels: [BuddyLevel; MAX_LEVELS],
    used: usize,
    backing_allocator: A,
}

impl<const MIN_BLK_SIZE: usize> Buddy<MIN_BLK_SIZE, Raw> {
    /// Constructs a new `Buddy` from a raw pointer.
    ///
    /// The allocator starts out with a single free block spanning the whole
    /// region.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if any of the following are
    /// true:
    /// - `len` is not a power of two, or is smaller than `MIN_BLK_SIZE`.
    /// - `region` is not aligned to `align_of::<usize>()`.
    /// - The region would extend past the end of the address space.
    ///
    /// # Panics
    ///
    /// Panics if `MIN_BLK_SIZE` is invalid (see the [type-level
    /// documentation](Buddy)).
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes, and the
    /// memory must not be accessed except through this allocator for as long
    /// as the allocator exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        len: usize,
    ) -> Result<Buddy<MIN_BLK_SIZE, Raw>, AllocInitError> {
        unsafe {
            RawBuddy::<MIN_BLK_SIZE>::try_new(region, len).map(|b| b.with_backing_allocator(Raw))
        }
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
impl<const MIN_BLK_SIZE: usize> Buddy<MIN_BLK_SIZE, Global> {
    /// Attempts to construct a new `Buddy` backed by the global allocator.
    ///
    /// The memory managed by this `Buddy` is allocated from the global
    /// allocator according to the layout indicated by
    /// [`Self::region_layout(len)`], and freed when the allocator is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is not a valid region size (see
    /// [`Buddy::new_raw`]) or if the region could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `MIN_BLK_SIZE` is invalid (see the [type-level
    /// documentation](Buddy)).
    ///
    /// [`Self::region_layout(len)`]: Buddy::region_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(len: usize) -> Result<Buddy<MIN_BLK_SIZE, Global>, AllocInitError> {
        // Reject bad sizes before touching the global allocator.
        Self::num_levels_for(len).ok_or(AllocInitError::InvalidConfig)?;

        let region_layout = Self::region_layout(len).map_err(|_| AllocInitError::InvalidConfig)?;

        let region_ptr = crate::global_region(region_layout)?;

        match unsafe { RawBuddy::<MIN_BLK_SIZE>::try_new(region_ptr, len) } {
            Ok(b) => Ok(b.with_backing_allocator(Global)),
            Err(e) => {
                unsafe { Global.deallocate(region_ptr, region_layout) };
                Err(e)
            }
        }
    }
}

impl<const MIN_BLK_SIZE: usize, A: BackingAllocator> Buddy<MIN_BLK_SIZE, A> {
    fn assert_const_param_invariants() {
        assert!(
            MIN_BLK_SIZE.is_power_of_two(),
            "buddy allocator minimum block size must be a power of two"
        );
        assert!(
            MIN_BLK_SIZE >= mem::size_of::<BlockLink>(),
            "buddy allocator minimum block size must be at least mem::size_of::<BlockLink>() bytes"
        );
    }

    /// Returns the number of levels needed to manage a region of `len`
    /// bytes, or `None` if `len` is not a valid region size.
    fn num_levels_for(len: usize) -> Option<usize> {
        Self::assert_const_param_invariants();

        if !len.is_power_of_two() || len < MIN_BLK_SIZE {
            return None;
        }

        let levels: usize = (len.ilog2() - MIN_BLK_SIZE.ilog2()).try_into().ok()?;

        Some(levels + 1)
    }

    /// Returns the layout requirements of a region of `len` bytes managed by
    /// a `Buddy` of this type.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `len` cannot be represented as the size of a
    /// [`Layout`].
    pub fn region_layout(len: usize) -> Result<Layout, LayoutError> {
        Layout::from_size_align(len, MIN_BLK_SIZE)
    }

    /// Returns the number of levels in this allocator.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Returns the size of the blocks at `level`, or `None` if `level` is out
    /// of range.
    #[inline]
    pub fn block_size(&self, level: usize) -> Option<usize> {
        (level < self.num_levels).then(|| self.levels[level].block_size)
    }

    /// Returns the level whose blocks serve a request of `size` bytes.
    ///
    /// This is the smallest level whose block size is at least `size`.
    /// Returns `None` if `size` is zero or larger than the region.
    pub fn level_for(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.capacity() {
            return None;
        }

        // Cannot overflow: `size` is at most the region size, a power of two.
        let block_size = size.max(MIN_BLK_SIZE).next_power_of_two();
        let level: usize = (block_size.ilog2() - MIN_BLK_SIZE.ilog2()).try_into().ok()?;

        Some(level)
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] covering the whole block. Its
    /// length is `size` rounded up to the next power of two, and to at least
    /// `MIN_BLK_SIZE`. The block is aligned to its own size relative to the
    /// base of the region.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, exceeds the region size, or if no
    /// block large enough is free.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let target_level = self.level_for(size).ok_or(AllocError)?;

        // Scan increasing block sizes until a free block is found.
        let (block_ofs, init_level) = (target_level..self.num_levels)
            .find_map(|level| unsafe {
                self.levels[level]
                    .free_list_pop(self.base)
                    .map(|block| (block, level))
            })
            .ok_or_else(|| {
                log::trace!("buddy: no block free at or above level {target_level}");
                AllocError
            })?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for level in (target_level..init_level).rev() {
            let back_half = block_ofs + self.levels[level].block_size;

            // Add the back half of the split block to the next level's free
            // list.
            unsafe { self.levels[level].free_list_push(self.base, back_half) };
        }

        if init_level != target_level {
            log::trace!(
                "buddy: split block {block_ofs:#x} from level {init_level} down to {target_level}"
            );
        }

        let block_size = self.levels[target_level].block_size;
        self.used += block_size;

        // The returned block inherits the provenance of the base pointer.
        Ok(self.base.with_offset_and_size(block_ofs, block_size))
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// The freed block is merged with its buddy for as long as the buddy is
    /// also free, possibly all the way up to the top level.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must denote a block of memory currently allocated via this
    ///   allocator.
    /// - `size` must map to the same level as the size passed to
    ///   [`Self::allocate`]; both the requested size and the length of the
    ///   returned block satisfy this.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let Some(mut block_ofs) = self.base.offset_of(ptr.addr()) else {
            debug_assert!(false, "pointer not owned by this allocator");
            return;
        };

        let Some(mut level) = self.level_for(size) else {
            debug_assert!(false, "deallocated size {size:#x} is not a valid block size");
            return;
        };

        debug_assert!(
            align::is_aligned(block_ofs, self.levels[level].block_size),
            "block {block_ofs:#x} is not aligned to its level"
        );
        debug_assert!(
            !self.free_blocks(level).any(|ofs| ofs == block_ofs),
            "block {block_ofs:#x} is already free"
        );

        self.used -= self.levels[level].block_size;

        while level + 1 < self.num_levels {
            let buddy_ofs = self.levels[level].buddy_ofs(block_ofs);

            if !unsafe { self.levels[level].free_list_remove(self.base, buddy_ofs) } {
                break;
            }

            log::trace!("buddy: merged {block_ofs:#x} with buddy {buddy_ofs:#x} at level {level}");

            block_ofs = block_ofs.min(buddy_ofs);
            level += 1;
        }

        unsafe { self.levels[level].free_list_push(self.base, block_ofs) };
    }

    /// Returns the size of the managed region in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.base.extent()
    }

    /// Returns the number of bytes currently allocated.
    ///
    /// This counts whole blocks, including the rounding applied to the
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

    /// Returns the size of the largest free block, or zero if every block is
    /// allocated.
    pub fn largest_free_block(&self) -> usize {
        self.levels[..self.num_levels]
            .iter()
            .rev()
            .find(|level| level.free_list.is_some())
            .map_or(0, |level| level.block_size)
    }

    /// Returns an iterator over the offsets of the free blocks at `level`.
    ///
    /// The iterator is empty if `level` is out of range.
    pub fn free_blocks(&self, level: usize) -> FreeBlocks<'_> {
        let next = if level < self.num_levels {
            self.levels[level].free_list
        } else {
            None
        };

        FreeBlocks {
            base: self.base,
            next,
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

impl<const MIN_BLK_SIZE: usize, A: BackingAllocator> fmt::Debug for Buddy<MIN_BLK_SIZE, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.base.ptr())
            .field("MIN_BLK_SIZE", &MIN_BLK_SIZE)
            .field("capacity", &self.capacity())
            .field("num_levels", &self.num_levels)
            .field("used", &self.used)
            .finish()
    }
}

impl<const MIN_BLK_SIZE: usize, A: BackingAllocator> Drop for Buddy<MIN_BLK_SIZE, A> {
    fn drop(&mut self) {
        if let Ok(region_layout) = Self::region_layout(self.base.extent()) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout)
            }
        }
    }
}

/// An iterator over the offsets of the free blocks at one level of a
/// [`Buddy`].
#[derive(Debug)]
pub struct FreeBlocks<'a> {
    base: BasePtr,
    next: Option<usize>,
    _marker: PhantomData<&'a ()>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let ofs = self.next?;

        // SAFETY: the allocator is borrowed for 'a, so the list cannot change
        // while this iterator exists.
        let link: BlockLink = unsafe { self.base.link_at(ofs) };
        self.next = link.next;

        Some(ofs)
    }
}

/// Like a `Buddy`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `Buddy` itself cannot.
struct RawBuddy<const MIN_BLK_SIZE: usize> {
    base: BasePtr,
    num_levels: usize,
    levels: [BuddyLevel; MAX_LEVELS],
}

impl<const MIN_BLK_SIZE: usize> RawBuddy<MIN_BLK_SIZE> {
    /// Attempts to construct a new `Buddy` from a raw pointer.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes.
    unsafe fn try_new(
        region: NonNull<u8>,
        len: usize,
    ) -> Result<RawBuddy<MIN_BLK_SIZE>, AllocInitError> {
        let num_levels = Buddy::<MIN_BLK_SIZE, Raw>::num_levels_for(len)
            .ok_or(AllocInitError::InvalidConfig)?;

        if !align::is_aligned(region.addr().get(), mem::align_of::<BlockLink>()) {
            return Err(AllocInitError::InvalidConfig);
        }

        // Ensure pointer calculations will not overflow.
        let base = BasePtr::new(region, len).ok_or(AllocInitError::InvalidConfig)?;

        let mut levels = [BuddyLevel::EMPTY; MAX_LEVELS];
        for (li, level) in levels.iter_mut().take(num_levels).enumerate() {
            level.block_size = MIN_BLK_SIZE << li;
        }

        // The whole region starts out as a single free block on the top
        // level.
        unsafe { levels[num_levels - 1].free_list_push(base, 0) };

        log::debug!(
            "buddy: managing {len:#x} bytes at {:#x} in {num_levels} levels",
            base.addr()
        );

        Ok(RawBuddy {
            base,
            num_levels,
            levels,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> Buddy<MIN_BLK_SIZE, A> {
        let RawBuddy {
            base,
            num_levels,
            levels,
        } = self;

        Buddy {
            base,
            num_levels,
            levels,
            used: 0,
            backing_allocator,
        }
    }
}
