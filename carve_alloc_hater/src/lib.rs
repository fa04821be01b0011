#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use carve_alloc::{align, AllocInitError, Buddy, FreeList, Global};

pub struct FreeListSubject(FreeList<Global>);

impl FreeListSubject {
    pub fn new(len: usize) -> Result<Self, AllocInitError> {
        let f = FreeList::try_new(len)?;
        Ok(FreeListSubject(f))
    }
}

impl Subject for FreeListSubject {
    type AllocError = carve_alloc::AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>, _size: usize) {
        unsafe { self.0.deallocate(ptr) };
    }

    fn check(&self) -> bool {
        let extents: Vec<(usize, usize)> = self.0.free_extents().collect();

        let separated = extents
            .windows(2)
            .all(|pair| pair[0].0 + pair[0].1 < pair[1].0);
        let free: usize = extents.iter().map(|&(_, len)| len).sum();

        separated && free + self.0.used_bytes() == self.0.capacity()
    }
}

pub struct BuddySubject<const MIN_BLK_SIZE: usize>(Buddy<MIN_BLK_SIZE, Global>);

impl<const MIN_BLK_SIZE: usize> BuddySubject<MIN_BLK_SIZE> {
    pub fn new(len: usize) -> Result<Self, AllocInitError> {
        let b = Buddy::try_new(len)?;
        Ok(BuddySubject(b))
    }
}

impl<const MIN_BLK_SIZE: usize> Subject for BuddySubject<MIN_BLK_SIZE> {
    type AllocError = carve_alloc::AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>, size: usize) {
        unsafe { self.0.deallocate(ptr.cast(), size) };
    }

    fn check(&self) -> bool {
        let b = &self.0;
        let mut free = 0;

        for level in 0..b.num_levels() {
            let Some(size) = b.block_size(level) else {
                return false;
            };
            let blocks: Vec<usize> = b.free_blocks(level).collect();
            let is_top = level + 1 == b.num_levels();

            let well_formed = blocks.iter().all(|&ofs| {
                align::is_aligned(ofs, size) && (is_top || !blocks.contains(&(ofs ^ size)))
            });

            if !well_formed {
                return false;
            }

            free += size * blocks.len();
        }

        free + b.used_bytes() == b.capacity()
    }
}
