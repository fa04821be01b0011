#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use carve_alloc_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MIN_BLK_SIZE: usize = 64;
const MAX_SHIFT: u32 = 24;

#[derive(Clone, Debug)]
struct Args {
    len: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        // Select a random shift to obtain a power of two.
        let shift = u32::from(u8::arbitrary(un)?) % (MAX_SHIFT + 1);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            len: 1 << shift,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::<MIN_BLK_SIZE>::new(args.len) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("buddy allocator failed evaluation: {failed:?}");
    }
});
