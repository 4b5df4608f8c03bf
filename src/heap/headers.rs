//! Block headers and the index that maps arbitrary addresses to them.
//!
//! The index is a two-level structure: the low bits of the block number pick
//! a slot inside a bottom index, and bottom indexes hang off a fixed-size
//! top-level table keyed by the remaining high bits (hashed, with collision
//! chaining, so the same structure serves 64-bit address spaces).  A slot is
//! either vacant, a forwarding distance for the interior blocks of a large
//! object, or a header reference.  Lookup is O(1); interior lookups resolve
//! through the forwarding distance.
//!
//! Headers live in a slab and are addressed by 32-bit indices.  Slab storage
//! is never returned; retired headers go on a private free list so repeated
//! block turnover does not grow the slab without bound.

use crate::heap::obj_map::{MapId, INVALID_MAP};
use crate::util::constants::*;
use crate::util::Address;

/// Reference to a header in the slab.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HeaderId(u32);

impl HeaderId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One bottom-index slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Slot {
    /// Not our heap.
    Nil,
    /// The block starts this many blocks below the addressed one.
    Forward(u16),
    /// The block's header.
    Hdr(HeaderId),
}

/// Per-block metadata.
///
/// `sz` is the per-object size in words while the block is in use, and the
/// whole-block length in bytes while the block is free.
pub struct Header {
    pub sz: usize,
    /// Link for the sorted free-block list or a per-size reclaim queue.
    pub next: Address,
    /// Kind of the objects in the block.
    pub kind: u8,
    /// Valid-offsets map for the block's size class; `INVALID_MAP` iff free.
    pub map: MapId,
    /// Collection number at which the block was last allocated or swept.
    pub last_reclaimed: u16,
    /// One bit per body word; bit i set iff an object starting at word i is
    /// reachable.
    pub marks: [usize; MARK_BITS_SZ],
}

impl Header {
    fn new() -> Header {
        Header {
            sz: 0,
            next: Address::ZERO,
            kind: 0,
            map: INVALID_MAP,
            last_reclaimed: 0,
            marks: [0; MARK_BITS_SZ],
        }
    }

    /// Is the mark bit for the object starting at body word `n` set?
    pub fn mark_bit(&self, n: usize) -> bool {
        (self.marks[n >> LOG_BITS_IN_WORD] >> (n & (BITS_IN_WORD - 1))) & 1 != 0
    }

    pub fn set_mark_bit(&mut self, n: usize) {
        self.marks[n >> LOG_BITS_IN_WORD] |= 1 << (n & (BITS_IN_WORD - 1));
    }

    pub fn clear_mark_bit(&mut self, n: usize) {
        self.marks[n >> LOG_BITS_IN_WORD] &= !(1 << (n & (BITS_IN_WORD - 1)));
    }

    pub fn clear_marks(&mut self) {
        self.marks = [0; MARK_BITS_SZ];
    }

    /// Block completely unmarked?
    pub fn is_empty(&self) -> bool {
        self.marks.iter().all(|w| *w == 0)
    }
}

struct BottomIndex {
    key: usize,
    slots: Box<[Slot; BOTTOM_SZ]>,
}

fn bottom_key(block: Address) -> usize {
    block.as_usize() >> (LOG_BOTTOM_SZ + LOG_HBLKSIZE)
}

fn bottom_slot(block: Address) -> usize {
    (block.as_usize() >> LOG_HBLKSIZE) & (BOTTOM_SZ - 1)
}

/// The block-header index plus the header slab.
pub struct HeaderIndex {
    top: Vec<Vec<BottomIndex>>,
    headers: Vec<Header>,
    free_headers: Vec<HeaderId>,
}

impl HeaderIndex {
    pub fn new() -> HeaderIndex {
        let mut top = Vec::with_capacity(TOP_SZ);
        top.resize_with(TOP_SZ, Vec::new);
        HeaderIndex {
            top,
            headers: Vec::new(),
            free_headers: Vec::new(),
        }
    }

    fn bucket(key: usize) -> usize {
        key & (TOP_SZ - 1)
    }

    fn find_bottom(&self, key: usize) -> Option<&BottomIndex> {
        self.top[Self::bucket(key)].iter().find(|bi| bi.key == key)
    }

    /// Make sure a bottom index exists for `block`'s neighborhood.
    fn get_index(&mut self, block: Address) -> &mut BottomIndex {
        let key = bottom_key(block);
        let chain = &mut self.top[Self::bucket(key)];
        if let Some(pos) = chain.iter().position(|bi| bi.key == key) {
            return &mut chain[pos];
        }
        chain.push(BottomIndex {
            key,
            slots: Box::new([Slot::Nil; BOTTOM_SZ]),
        });
        chain.last_mut().expect("just pushed")
    }

    /// The raw slot for the block containing `addr`.
    pub fn slot(&self, addr: Address) -> Slot {
        let block = addr.block_base();
        match self.find_bottom(bottom_key(block)) {
            Some(bi) => bi.slots[bottom_slot(block)],
            None => Slot::Nil,
        }
    }

    fn set_slot(&mut self, block: Address, slot: Slot) {
        let idx = bottom_slot(block);
        self.get_index(block).slots[idx] = slot;
    }

    fn alloc_hdr(&mut self) -> HeaderId {
        match self.free_headers.pop() {
            Some(id) => {
                self.headers[id.index()] = Header::new();
                id
            }
            None => {
                self.headers.push(Header::new());
                HeaderId((self.headers.len() - 1) as u32)
            }
        }
    }

    fn free_hdr(&mut self, id: HeaderId) {
        self.free_headers.push(id);
    }

    pub fn header(&self, id: HeaderId) -> &Header {
        &self.headers[id.index()]
    }

    pub fn header_mut(&mut self, id: HeaderId) -> &mut Header {
        &mut self.headers[id.index()]
    }

    /// Header of the block directly containing `addr`, without forwarding.
    pub fn plain_header_id(&self, addr: Address) -> Option<HeaderId> {
        match self.slot(addr) {
            Slot::Hdr(id) => Some(id),
            _ => None,
        }
    }

    /// Resolve `addr` to the first block of the object run containing it and
    /// that block's header.  Interior addresses of large objects follow the
    /// forwarding distances down to the first block.
    pub fn base_block(&self, addr: Address) -> Option<(Address, HeaderId)> {
        let mut block = addr.block_base();
        loop {
            match self.slot(block) {
                Slot::Nil => return None,
                Slot::Forward(d) => block -= (d as usize) << LOG_HBLKSIZE,
                Slot::Hdr(id) => return Some((block, id)),
            }
        }
    }

    /// Install a fresh, uninitialized header for block `h`.
    pub fn install_header(&mut self, h: Address) -> HeaderId {
        debug_assert!(h.is_aligned_to(HBLKSIZE));
        let id = self.alloc_hdr();
        self.set_slot(h, Slot::Hdr(id));
        id
    }

    /// Set up forwarding distances for the interior blocks of the run
    /// starting at `h` and spanning `size_bytes`.
    pub fn install_counts(&mut self, h: Address, size_bytes: usize) {
        let blocks = size_bytes >> LOG_HBLKSIZE;
        for i in 1..blocks {
            let jump = i.min(MAX_JUMP) as u16;
            self.set_slot(h + (i << LOG_HBLKSIZE), Slot::Forward(jump));
        }
    }

    /// Remove the header for block `h`, recycling its slab entry.
    pub fn remove_header(&mut self, h: Address) {
        if let Slot::Hdr(id) = self.slot(h) {
            self.free_hdr(id);
        }
        self.set_slot(h, Slot::Nil);
    }

    /// Remove the forwarding distances installed by `install_counts`.
    pub fn remove_counts(&mut self, h: Address, size_bytes: usize) {
        let blocks = size_bytes >> LOG_HBLKSIZE;
        for i in 1..blocks {
            self.set_slot(h + (i << LOG_HBLKSIZE), Slot::Nil);
        }
    }

    /// Every allocated (non-free) block, as (block address, header) pairs.
    /// Forwarding slots and free blocks are skipped.
    pub fn all_blocks(&self) -> Vec<(Address, HeaderId)> {
        let mut out = Vec::new();
        for chain in &self.top {
            for bi in chain {
                for (j, slot) in bi.slots.iter().enumerate() {
                    if let Slot::Hdr(id) = slot {
                        if self.headers[id.index()].map != INVALID_MAP {
                            let block = Address::from_usize(
                                ((bi.key << LOG_BOTTOM_SZ) + j) << LOG_HBLKSIZE,
                            );
                            out.push((block, *id));
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLK: usize = HBLKSIZE;

    #[test]
    fn install_and_lookup() {
        let mut ix = HeaderIndex::new();
        let h = Address::from_usize(64 * BLK);
        let id = ix.install_header(h);
        assert_eq!(ix.plain_header_id(h), Some(id));
        // Interior byte of the same block resolves to the same header.
        assert_eq!(ix.base_block(h + 100usize), Some((h, id)));
        // The neighboring block is not ours.
        assert_eq!(ix.slot(h + BLK), Slot::Nil);
    }

    #[test]
    fn forwarding_for_large_runs() {
        let mut ix = HeaderIndex::new();
        let h = Address::from_usize(128 * BLK);
        let id = ix.install_header(h);
        ix.install_counts(h, 5 * BLK);
        for i in 1..5 {
            let interior = h + (i * BLK + 16);
            assert_eq!(ix.base_block(interior), Some((h, id)));
        }
        ix.remove_counts(h, 5 * BLK);
        assert_eq!(ix.base_block(h + (2 * BLK)), None);
        assert_eq!(ix.base_block(h + 8usize), Some((h, id)));
    }

    #[test]
    fn forwarding_spans_bottom_indexes() {
        let mut ix = HeaderIndex::new();
        // A run that crosses a bottom-index boundary.
        let h = Address::from_usize((BOTTOM_SZ - 2) * BLK);
        let id = ix.install_header(h);
        ix.install_counts(h, 6 * BLK);
        let far = h + (5 * BLK + 24);
        assert_eq!(ix.base_block(far), Some((h, id)));
    }

    #[test]
    fn header_recycling() {
        let mut ix = HeaderIndex::new();
        let a = Address::from_usize(8 * BLK);
        let id_a = ix.install_header(a);
        ix.remove_header(a);
        assert_eq!(ix.slot(a), Slot::Nil);
        let b = Address::from_usize(9 * BLK);
        let id_b = ix.install_header(b);
        // The retired slab entry is reused.
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn mark_bits() {
        let mut h = Header::new();
        assert!(h.is_empty());
        h.set_mark_bit(0);
        h.set_mark_bit(77);
        assert!(h.mark_bit(0));
        assert!(h.mark_bit(77));
        assert!(!h.mark_bit(76));
        assert!(!h.is_empty());
        h.clear_mark_bit(77);
        assert!(!h.mark_bit(77));
        h.clear_marks();
        assert!(h.is_empty());
    }

    #[test]
    fn all_blocks_skips_free_and_forwarding() {
        let mut ix = HeaderIndex::new();
        let used = Address::from_usize(16 * BLK);
        let id = ix.install_header(used);
        ix.header_mut(id).map = 0; // any valid map
        ix.install_counts(used, 3 * BLK);
        let free = Address::from_usize(40 * BLK);
        ix.install_header(free); // keeps INVALID_MAP: a free block
        let blocks = ix.all_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, used);
    }
}
