//! Realloc semantics: shrink in place with the freed tail zeroed, grow by
//! move, and the C edge cases for null and zero.

mod common;

use common::{peek, poke};
use consgc::Address;

#[test]
fn realloc_in_place() {
    consgc::init();

    let p = consgc::malloc(100);
    let class_bytes = consgc::size(p);
    assert!(class_bytes >= 100);
    for i in 0..(100 / 8) {
        poke(p + i * 8, 0xabab_abab_0000 + i);
    }

    // Shrink: same object, same class, tail zeroed so stale words in the
    // discarded range can no longer pin anything.
    let q = consgc::realloc(p, 50);
    assert_eq!(q, p);
    assert_eq!(consgc::size(q), class_bytes);
    for i in 0..(50 / 8) {
        assert_eq!(peek(q + i * 8), 0xabab_abab_0000 + i, "kept prefix damaged");
    }
    let mut off = 56; // first word boundary past the 50 retained bytes
    while off < class_bytes {
        assert_eq!(peek(q + off), 0, "byte range [{}..) was not zeroed", off);
        off += 8;
    }

    // Grow beyond the class: a new object of the same kind, contents copied.
    let r = consgc::realloc(q, 3000);
    assert_ne!(r, q);
    assert!(consgc::size(r) >= 3000);
    for i in 0..(50 / 8) {
        assert_eq!(peek(r + i * 8), 0xabab_abab_0000 + i, "copy lost the prefix");
    }

    // ANSI edges: realloc(null) allocates, realloc(p, 0) frees.
    let s = consgc::realloc(Address::ZERO, 24);
    assert!(!s.is_zero());
    assert_eq!(consgc::realloc(s, 0), Address::ZERO);

    consgc::free(r);
}
