//! Disappearing links: a registered slot is nulled when its object dies,
//! and an unregistered one is left alone.

mod common;

use common::{clobber_registers, clobber_stack, collect_hard, peek, poke};
use consgc::{Address, LinkStatus};

/// Allocate the watched object and store it in `slot`.  Runs in its own
/// frame so no reference survives on the live stack.
#[inline(never)]
fn plant(slot: Address, register: bool) {
    let obj = consgc::malloc(64);
    poke(obj, 0x0dd_ba11);
    poke(slot, obj.as_usize());
    if register {
        let status = consgc::general_register_disappearing_link(slot, obj)
            .expect("slot and object are valid");
        assert_eq!(status, LinkStatus::Registered);
    }
    clobber_registers();
}

#[test]
fn disappearing_link() {
    consgc::init();

    // The slots live in pointer-free storage: the collector never traces
    // them, so the objects they name are otherwise unreachable.
    let slots = consgc::malloc_atomic(64);
    let watched_slot = slots;
    let plain_slot = slots + 8usize;

    plant(watched_slot, true);
    plant(plain_slot, true);

    // Re-registering the same slot reports a duplicate.
    let obj = Address::from_usize(peek(watched_slot));
    assert_eq!(
        consgc::general_register_disappearing_link(watched_slot, obj),
        Some(LinkStatus::Duplicate)
    );

    // register-then-unregister leaves the table as before: the plain slot
    // must keep its (stale) value through the collections below.
    assert!(consgc::unregister_disappearing_link(plain_slot));
    assert!(!consgc::unregister_disappearing_link(plain_slot));

    clobber_stack();
    let mut cleared = false;
    for _ in 0..5 {
        collect_hard(1);
        if peek(watched_slot) == 0 {
            cleared = true;
            break;
        }
    }
    assert!(cleared, "watched slot was never cleared");
    assert_ne!(
        peek(plain_slot),
        0,
        "unregistered slot must not be touched by the collector"
    );

    std::hint::black_box(slots);
}
