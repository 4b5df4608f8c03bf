//! Randomized allocation churn: sizes across every class, constant
//! turnover of a bounded working set, and periodic forced collections.
//! The heap must stay bounded and every live object must stay resolvable.

mod common;

use common::{peek, poke};
use consgc::Address;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SLOTS: usize = 64;
const ROUNDS: usize = 20_000;

#[test]
fn random_churn() {
    consgc::init();
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);

    // The working set hangs off one scanned object held on the stack;
    // overwriting a slot drops the previous occupant.
    let slots = consgc::malloc(SLOTS * 8);
    let mut total_allocated = 0usize;

    for round in 0..ROUNDS {
        let idx = rng.random_range(0..SLOTS);
        let bytes = if rng.random_range(0..20) == 0 {
            // Occasionally take the whole-block path.
            rng.random_range(2049..6000)
        } else {
            rng.random_range(0..2048)
        };
        let obj = consgc::malloc(bytes);
        total_allocated += consgc::size(obj);
        if bytes >= 8 {
            poke(obj, round);
        }
        poke(slots + idx * 8, obj.as_usize());

        if rng.random_range(0..1000) < 5 {
            consgc::gcollect();
        }
        if rng.random_range(0..1000) < 3 {
            // Explicit frees mix into the accounting too.
            poke(slots + idx * 8, 0);
            consgc::free(obj);
        }
    }

    // Every survivor is still a first-class object.
    for i in 0..SLOTS {
        let raw = peek(slots + i * 8);
        if raw != 0 {
            let p = Address::from_usize(raw);
            assert_eq!(consgc::base(p), Some(p));
            assert!(consgc::size(p) > 0);
        }
    }

    // Turnover dwarfs the live set; reclamation must keep the heap a small
    // fraction of everything ever allocated.
    assert!(total_allocated > 16 * 1024 * 1024);
    assert!(
        consgc::heap_size() < 16 * 1024 * 1024,
        "heap of {} bytes suggests dropped storage is not being reclaimed",
        consgc::heap_size()
    );

    std::hint::black_box(slots);
}
