//! Finalization ordering: an object pointed to by another finalizable
//! object is finalized only after its referrer.

mod common;

use std::sync::Mutex;

use common::{collect_hard, poke};
use consgc::Address;

static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn record(_obj: Address, tag: usize) {
    ORDER.lock().expect("order log").push(tag);
}

const TAG_A: usize = 1;
const TAG_B: usize = 2;

/// A holds the only reference to B; both get finalizers.
#[inline(never)]
fn setup() {
    let b = consgc::malloc(64);
    let a = consgc::malloc(64);
    poke(a, b.as_usize());
    assert!(consgc::register_finalizer(a, Some((record, TAG_A))).is_none());
    assert!(consgc::register_finalizer(b, Some((record, TAG_B))).is_none());
    common::clobber_registers();
}

fn recorded() -> Vec<usize> {
    ORDER.lock().expect("order log").clone()
}

#[test]
fn finalizer_order() {
    // Keep finalizer invocation under the test's explicit control.
    std::env::set_var("GC_FINALIZE_ON_DEMAND", "1");
    consgc::init();

    setup();

    // First round: A is unreachable, but B is kept by A's ordering mark.
    let mut rounds = 0;
    while recorded().is_empty() {
        rounds += 1;
        assert!(rounds <= 5, "A's finalizer never became ready");
        collect_hard(1);
        consgc::invoke_finalizers();
    }
    assert_eq!(recorded(), vec![TAG_A]);

    // Second round: with A finalized, B becomes unreachable too.
    let mut rounds = 0;
    while recorded().len() < 2 {
        rounds += 1;
        assert!(rounds <= 5, "B's finalizer never became ready");
        collect_hard(1);
        consgc::invoke_finalizers();
    }
    assert_eq!(recorded(), vec![TAG_A, TAG_B]);
    assert!(!consgc::should_invoke_finalizers());
}
