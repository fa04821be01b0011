#![cfg(test)]
extern crate std;

use core::{cmp, fmt::Debug, marker::PhantomData, mem, ptr::NonNull};

use crate::{
    align, freelist::MIN_BLOCK_SIZE, AllocError, AllocInitError, Buddy, FreeList, Global,
};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    /// Deallocates a block previously returned by `allocate`.
    ///
    /// `size` is the size originally requested.
    unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>, size: usize);

    fn used_bytes(&self) -> usize;

    /// Checks the structural invariants of the allocator.
    fn invariants_hold(&self) -> bool;
}

// Free list ==================================================================

#[derive(Clone, Debug)]
struct FreeListParams {
    len: usize,
}

impl Arbitrary for FreeListParams {
    fn arbitrary(g: &mut Gen) -> Self {
        let words = usize::arbitrary(g) % (g.size() * 8);

        FreeListParams {
            len: cmp::max(words * mem::size_of::<usize>(), MIN_BLOCK_SIZE),
        }
    }
}

impl QcAllocator for FreeList<Global> {
    type Params = FreeListParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        FreeList::try_new(params.len)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>, _: usize) {
        unsafe { self.deallocate(ptr) }
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes()
    }

    fn invariants_hold(&self) -> bool {
        let extents: Vec<_> = self.free_extents().collect();

        // Ordered, disjoint and never touching.
        let separated = extents
            .windows(2)
            .all(|pair| pair[0].0 + pair[0].1 < pair[1].0);

        let free: usize = extents.iter().map(|&(_, len)| len).sum();

        separated && free + self.used_bytes() == self.capacity()
    }
}

// Buddy ======================================================================

#[derive(Clone, Debug)]
struct BuddyParams {
    len: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        // 16 bytes to 64 KiB.
        let shift = 4 + u8::arbitrary(g) % 13;

        BuddyParams { len: 1 << shift }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let len = self.len;
        Box::new((4..len.ilog2()).map(|shift| BuddyParams { len: 1 << shift }))
    }
}

impl<const MIN_BLK_SIZE: usize> QcAllocator for Buddy<MIN_BLK_SIZE, Global> {
    type Params = BuddyParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        Buddy::try_new(cmp::max(params.len, MIN_BLK_SIZE))
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<[u8]>, size: usize) {
        unsafe { self.deallocate(ptr.cast(), size) }
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes()
    }

    fn invariants_hold(&self) -> bool {
        let mut free = 0;

        for level in 0..self.num_levels() {
            let Some(size) = self.block_size(level) else {
                return false;
            };
            let blocks: Vec<usize> = self.free_blocks(level).collect();

            for &ofs in &blocks {
                if !align::is_aligned(ofs, size) {
                    return false;
                }

                // A free block's buddy must not be free at the same level.
                if level + 1 < self.num_levels() && blocks.contains(&(ofs ^ size)) {
                    return false;
                }
            }

            free += size * blocks.len();
        }

        free + self.used_bytes() == self.capacity()
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of at least `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

/// A live allocation, painted with the ID of the operation which created it.
struct Allocation {
    op_id: OpId,
    ptr: NonNull<[u8]>,
    size: usize,
}

impl Allocation {
    fn paint(&mut self) {
        let id_bytes = self.op_id.to_le_bytes().into_iter().cycle();
        let slice = unsafe { self.ptr.as_mut() };

        for (byte, value) in slice.iter_mut().zip(id_bytes) {
            *byte = value;
        }
    }

    fn verify(&self) -> bool {
        let id_bytes = self.op_id.to_le_bytes().into_iter().cycle();
        let slice = unsafe { self.ptr.as_ref() };

        slice.iter().zip(id_bytes).all(|(&byte, value)| byte == value)
    }
}

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    /// Examines the allocator after each operation.
    fn post_op(allocator: &Self::Allocator, allocations: &[Allocation]) -> bool {
        let _ = (allocator, allocations);
        true
    }

    /// Examines an allocation just before it is freed.
    fn pre_deallocate(allocation: &Allocation) -> bool {
        let _ = allocation;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { size } => match self.allocator.allocate(size) {
                Ok(ptr) => {
                    if ptr.len() < size {
                        return false;
                    }

                    let mut a = Allocation { op_id, ptr, size };
                    a.paint();
                    self.allocations.push(a);
                }

                // Exhaustion is an expected outcome.
                Err(AllocError) => (),
            },

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&a) {
                    return false;
                }

                unsafe { self.allocator.deallocate(a.ptr, a.size) };
            }
        }

        P::post_op(&self.allocator, &self.allocations)
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in mem::take(&mut self.allocations) {
            if !P::pre_deallocate(&a) {
                return false;
            }

            unsafe { self.allocator.deallocate(a.ptr, a.size) };

            if !P::post_op(&self.allocator, &self.allocations) {
                return false;
            }
        }

        self.allocator.used_bytes() == 0
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Live allocations never overlap: each keeps the pattern written to it.
struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    fn pre_deallocate(allocation: &Allocation) -> bool {
        allocation.verify()
    }
}

/// The allocator's free lists stay well-formed after every operation.
struct Invariants<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> Prop for Invariants<A> {
    type Allocator = A;

    fn post_op(allocator: &A, _: &[Allocation]) -> bool {
        allocator.invariants_hold()
    }
}

fn check<P: Prop>(params: <P::Allocator as QcAllocator>::Params, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<P> = match AllocatorChecker::new(params, ops.capacity()) {
        Ok(c) => c,
        // Not every generated region is valid; there is nothing to check.
        Err(AllocInitError::InvalidConfig) => return true,
        Err(e) => panic!("allocator construction failed: {e}"),
    };

    checker.run(ops)
}

#[test]
fn freelist_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<FreeList<Global>>> as fn(_, _) -> bool);
}

#[test]
fn freelist_invariants_hold() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Invariants<FreeList<Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<Buddy<16, Global>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<Buddy<64, Global>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<Buddy<1024, Global>>> as fn(_, _) -> bool);
}

#[test]
fn buddy_invariants_hold() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Invariants<Buddy<16, Global>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<Invariants<Buddy<128, Global>>> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[test]
fn readme_deps() {
    version_sync::assert_markdown_deps_updated!("README.md");
}
