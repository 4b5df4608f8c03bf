//! Uncollectable storage survives any number of collections without a
//! single traced reference to it.

mod common;

use common::{collect_hard, peek, poke};
use consgc::Address;

const N: usize = 100;
const OBJ_BYTES: usize = 32;

#[test]
fn uncollectable_retention() {
    consgc::init();

    // Keep only the bitwise complements of the addresses, so the collector
    // can never mistake them for references.
    let mut hidden = Vec::with_capacity(N);
    for i in 0..N {
        let obj = consgc::malloc_uncollectable(OBJ_BYTES);
        poke(obj, 0xfeed_0000 + i);
        poke(obj + std::mem::size_of::<usize>(), i);
        hidden.push(!obj.as_usize());
    }

    let class_bytes = consgc::size(Address::from_usize(!hidden[0]));
    assert!(class_bytes >= OBJ_BYTES);

    collect_hard(10);

    for (i, &h) in hidden.iter().enumerate() {
        let obj = Address::from_usize(!h);
        // Still resolvable as an object base.
        assert_eq!(consgc::base(obj), Some(obj), "object {} lost its header", i);
        assert_eq!(consgc::size(obj), class_bytes);
        // Contents intact.
        assert_eq!(peek(obj), 0xfeed_0000 + i);
        assert_eq!(peek(obj + std::mem::size_of::<usize>()), i);
    }

    // Uncollectable storage is reclaimed only by an explicit free.
    for &h in &hidden {
        consgc::free(Address::from_usize(!h));
    }
    collect_hard(1);
}
