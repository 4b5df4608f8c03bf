//! Hidden pointers.  The finalization tables hold logical references the
//! collector must not follow during conservative marking; storing them XORed
//! with a per-process mask makes them look like nothing at all.

use std::hash::{BuildHasher, Hasher};

use crate::util::Address;

lazy_static! {
    /// Per-process mask.  Randomised at startup so hidden values cannot
    /// collide with real addresses across runs in any predictable way.
    static ref HIDE_MASK: usize = {
        let mut h = std::collections::hash_map::RandomState::new().build_hasher();
        h.write_u64(0x9e37_79b9_7f4a_7c15);
        h.finish() as usize | 1
    };
}

/// A pointer disguised from the conservative scanner.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HiddenPointer(usize);

impl HiddenPointer {
    /// Disguise an address.
    pub fn hide(addr: Address) -> HiddenPointer {
        HiddenPointer(addr.as_usize() ^ *HIDE_MASK)
    }

    /// Recover the original address.
    pub fn reveal(self) -> Address {
        Address::from_usize(self.0 ^ *HIDE_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let a = Address::from_usize(0xdead_b000);
        let h = HiddenPointer::hide(a);
        assert_eq!(h.reveal(), a);
    }

    #[test]
    fn hidden_value_differs_from_address() {
        let a = Address::from_usize(0x1000_0000);
        let h = HiddenPointer::hide(a);
        assert_ne!(h, HiddenPointer(a.as_usize()));
    }

    #[test]
    fn distinct_addresses_stay_distinct() {
        let a = HiddenPointer::hide(Address::from_usize(0x1000));
        let b = HiddenPointer::hide(Address::from_usize(0x2000));
        assert_ne!(a, b);
    }
}
