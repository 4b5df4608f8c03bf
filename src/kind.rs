//! Object kinds.
//!
//! A kind bundles the per-size free lists, the per-size reclaim queues, the
//! marking behavior, and whether fresh objects must be zeroed.  Keeping
//! pointer-free data in its own kind lets the mark phase skip those blocks
//! entirely, which is the main performance lever of the design.

use crate::collector::Collector;
use crate::util::constants::MAXOBJSZ;
use crate::util::Address;

/// Kind of objects that contain no pointers; never scanned.
pub const PTRFREE: u8 = 0;
/// Kind of ordinary objects: scanned conservatively, zeroed on allocation.
pub const NORMAL: u8 = 1;
/// Kind of objects that are scanned but never reclaimed implicitly.
pub const UNCOLLECTABLE: u8 = 2;

/// Number of kinds in the table.
pub const N_KINDS: usize = 3;

/// How objects of a kind are traversed by the mark phase.  The common two
/// variants are dispatched without an indirect call.
#[derive(Copy, Clone)]
pub enum MarkDescriptor {
    /// No outgoing pointers.
    PointerFree,
    /// Treat every aligned word of the object as a candidate pointer.
    Conservative,
    /// Push the object's children explicitly.  The procedure must be pure
    /// over its arguments and must not allocate.
    Custom(fn(&mut Collector, Address, usize)),
}

/// One kind's allocation and marking state.
pub struct ObjKind {
    /// Head of the free list for each size class, linked through the first
    /// word of each object.
    pub freelist: Box<[Address; MAXOBJSZ + 1]>,
    /// Blocks of each size class awaiting deferred sweeping.
    pub reclaim: Box<[Address; MAXOBJSZ + 1]>,
    /// Marking behavior.
    pub mark: MarkDescriptor,
    /// Clear object bodies before handing them out.
    pub init: bool,
}

impl ObjKind {
    fn new(mark: MarkDescriptor, init: bool) -> ObjKind {
        ObjKind {
            freelist: Box::new([Address::ZERO; MAXOBJSZ + 1]),
            reclaim: Box::new([Address::ZERO; MAXOBJSZ + 1]),
            mark,
            init,
        }
    }
}

/// The fixed kind table.
pub struct KindTable {
    kinds: Vec<ObjKind>,
}

impl KindTable {
    pub fn new() -> KindTable {
        KindTable {
            kinds: vec![
                ObjKind::new(MarkDescriptor::PointerFree, false),
                ObjKind::new(MarkDescriptor::Conservative, true),
                ObjKind::new(MarkDescriptor::Conservative, true),
            ],
        }
    }

    pub fn get(&self, kind: u8) -> &ObjKind {
        &self.kinds[kind as usize]
    }

    pub fn get_mut(&mut self, kind: u8) -> &mut ObjKind {
        &mut self.kinds[kind as usize]
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        let t = KindTable::new();
        assert_eq!(t.len(), N_KINDS);
        assert!(!t.get(PTRFREE).init);
        assert!(t.get(NORMAL).init);
        assert!(t.get(UNCOLLECTABLE).init);
        assert!(matches!(t.get(PTRFREE).mark, MarkDescriptor::PointerFree));
        assert!(matches!(t.get(NORMAL).mark, MarkDescriptor::Conservative));
    }

    #[test]
    fn freelists_start_empty() {
        let t = KindTable::new();
        for sz in 0..=MAXOBJSZ {
            assert!(t.get(NORMAL).freelist[sz].is_zero());
            assert!(t.get(NORMAL).reclaim[sz].is_zero());
        }
    }
}
