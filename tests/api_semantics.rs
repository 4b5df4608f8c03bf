//! Boundary behavior of the allocation interface: base/size resolution,
//! interior pointers, size-class rounding, aligned and batched allocation.

mod common;

use common::{collect_hard, peek, poke};
use consgc::util::constants::{BYTES_IN_WORD, HBLKSIZE};
use consgc::Address;

#[test]
fn api_semantics() {
    consgc::init();

    // Zero-size requests round up to the minimum class.
    let z = consgc::malloc(0);
    assert_eq!(consgc::size(z), BYTES_IN_WORD);

    // base() resolves interior addresses of small objects.
    let p = consgc::malloc(40);
    assert_eq!(consgc::base(p), Some(p));
    assert_eq!(consgc::base(p + 17usize), Some(p));
    assert_eq!(consgc::base(p + (consgc::size(p) - 1)), Some(p));

    // Foreign pointers resolve to nothing.
    let local = 0usize;
    assert_eq!(consgc::base(Address::from_ref(&local)), None);
    assert_eq!(consgc::size(Address::from_ref(&local)), 0);

    // Requests beyond half a block take the whole-block path, and interior
    // addresses anywhere in the run resolve to the base.
    let big = consgc::malloc(3 * HBLKSIZE - 64);
    assert!(consgc::size(big) >= 3 * HBLKSIZE - 64);
    assert_eq!(consgc::base(big + 2 * HBLKSIZE + 100usize), Some(big));
    consgc::free(big);

    // An address in a block's trailing slack, past the last whole object,
    // has no base.
    let odd = consgc::malloc(680);
    let class = consgc::size(odd);
    let per_block = HBLKSIZE / class;
    if per_block * class < HBLKSIZE {
        let slack = odd.block_base() + per_block * class;
        assert_eq!(consgc::base(slack), None);
    }

    // Registered displacements make interior field pointers first-class:
    // exercised via aligned allocation, which registers its offset.
    let aligned = consgc::memalign(256, 100);
    assert!(aligned.is_aligned_to(256));
    let r = consgc::posix_memalign(256, 64).expect("valid alignment");
    assert!(r.is_aligned_to(256));
    assert!(consgc::posix_memalign(100, 64).is_err());
    let v = consgc::valloc(10);
    assert!(v.is_aligned_to(HBLKSIZE));

    // Batched allocation: every object usable and distinct.
    let mut chain = consgc::malloc_many(48);
    assert!(chain.object_size() >= 48);
    let mut seen = std::collections::HashSet::new();
    let mut got = 0;
    while let Some(obj) = chain.pop() {
        assert!(seen.insert(obj.as_usize()));
        poke(obj, got);
        got += 1;
    }
    assert!(got >= 2);

    // Back-to-back collections are a fixed point: a reachable object stays,
    // and the heap does not change size.
    let keeper = consgc::malloc(64);
    poke(keeper, 0x5eed);
    consgc::gcollect();
    let h1 = consgc::heap_size();
    consgc::gcollect();
    assert_eq!(consgc::heap_size(), h1);
    assert_eq!(peek(keeper), 0x5eed);
    assert_eq!(consgc::base(keeper), Some(keeper));

    // Explicit heap growth is visible and free() of junk is ignored.
    let before = consgc::heap_size();
    assert!(consgc::expand_hp(4));
    assert_eq!(consgc::heap_size(), before + 4 * HBLKSIZE);
    consgc::free(Address::ZERO);
    consgc::free(Address::from_usize(0x10));

    collect_hard(1);
    assert_eq!(peek(keeper), 0x5eed);
    std::hint::black_box(keeper);
}
