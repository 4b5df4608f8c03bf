//! The registered static root set.
//!
//! Roots are byte ranges contributed by the client (data segments, arenas,
//! anything that may hold pointers into the collected heap).  The span
//! holding the collector's own state is excluded on registration: marking
//! from our own tables is sound but pure waste, and the finalization tables
//! deliberately hold hidden pointers that must not be traced.

use crate::util::constants::MAX_ROOT_SETS;
use crate::util::Address;

pub struct RootSet {
    ranges: Vec<(Address, Address)>,
    /// Total registered bytes; an input to the collection trigger.
    pub root_size: usize,
    /// Span to carve out of every registered range.
    excluded: (Address, Address),
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet {
            ranges: Vec::new(),
            root_size: 0,
            excluded: (Address::ZERO, Address::ZERO),
        }
    }

    /// Record the span occupied by the collector's own state.
    pub fn set_excluded(&mut self, start: Address, end: Address) {
        self.excluded = (start, end);
    }

    /// Register [b, e) as a root range.  Ranges overlapping the excluded
    /// span are split around it.  Returns false once the table is full.
    pub fn add(&mut self, b: Address, e: Address) -> bool {
        let (ex_start, ex_end) = self.excluded;
        if b < ex_start && e > ex_start {
            if e <= ex_end {
                return self.add_inner(b, ex_start);
            }
            return self.add_inner(b, ex_start) && self.add_inner(ex_end, e);
        }
        if b < ex_end && e > ex_end {
            return self.add_inner(ex_end, e);
        }
        if b >= ex_start && e <= ex_end && !(ex_start == ex_end) {
            // Entirely inside the excluded span.
            return true;
        }
        self.add_inner(b, e)
    }

    fn add_inner(&mut self, b: Address, e: Address) -> bool {
        if b >= e {
            return true;
        }
        if self.ranges.len() == MAX_ROOT_SETS {
            return false;
        }
        self.root_size += e - b;
        self.ranges.push((b, e));
        true
    }

    /// Drop every registered range.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.root_size = 0;
    }

    pub fn ranges(&self) -> &[(Address, Address)] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a(x: usize) -> Address {
        Address::from_usize(x)
    }

    #[test]
    fn add_and_clear() {
        let mut roots = RootSet::new();
        assert!(roots.add(a(0x1000), a(0x2000)));
        assert_eq!(roots.root_size, 0x1000);
        assert_eq!(roots.ranges().len(), 1);
        roots.clear();
        assert_eq!(roots.root_size, 0);
        assert!(roots.ranges().is_empty());
    }

    #[test]
    fn excluded_span_is_carved_out() {
        let mut roots = RootSet::new();
        roots.set_excluded(a(0x5000), a(0x6000));

        // Straddles the whole excluded span: split in two.
        assert!(roots.add(a(0x4000), a(0x7000)));
        assert_eq!(roots.ranges(), &[(a(0x4000), a(0x5000)), (a(0x6000), a(0x7000))]);
        assert_eq!(roots.root_size, 0x2000);

        // Overlaps only the front of the span.
        roots.clear();
        assert!(roots.add(a(0x4800), a(0x5800)));
        assert_eq!(roots.ranges(), &[(a(0x4800), a(0x5000))]);

        // Overlaps only the back.
        roots.clear();
        assert!(roots.add(a(0x5800), a(0x6800)));
        assert_eq!(roots.ranges(), &[(a(0x6000), a(0x6800))]);

        // Entirely inside: nothing registered, but not an error.
        roots.clear();
        assert!(roots.add(a(0x5100), a(0x5200)));
        assert!(roots.ranges().is_empty());
    }

    #[test]
    fn bounded_capacity() {
        let mut roots = RootSet::new();
        for i in 0..MAX_ROOT_SETS {
            assert!(roots.add(a(0x1_0000 + i * 0x100), a(0x1_0000 + i * 0x100 + 0x80)));
        }
        assert!(!roots.add(a(0x9000_0000), a(0x9000_1000)));
    }
}
