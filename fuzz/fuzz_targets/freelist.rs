#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use carve_alloc_hater::FreeListSubject;
use libfuzzer_sys::fuzz_target;

const MAX_WORDS: usize = 1 << 16;

#[derive(Clone, Debug)]
struct Args {
    len: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        // Word multiples, so most generated regions are valid.
        let words = usize::arbitrary(un)? % MAX_WORDS;
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            len: words * core::mem::size_of::<usize>(),
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let subject = match FreeListSubject::new(args.len) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("free list failed evaluation: {failed:?}");
    }
});
