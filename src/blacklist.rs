//! Black lists: page hash tables remembering heap pages that plausible but
//! false pointers have referred to.  The block allocator consults them to
//! avoid placing new objects where stale integers would pin them, turning
//! chronic false retention into a one-time event.
//!
//! False hits from the stack are more dangerous than false hits from
//! elsewhere: a stack word can pin a large object that merely *spans* the
//! suspect page.  Stack-origin entries therefore veto any block overlapping
//! the page, while non-stack entries only veto blocks starting on it.

use crate::collector::Collector;
use crate::util::constants::*;
use crate::util::conversions::pht_hash;
use crate::util::Address;

/// A set of pages, one bit per hash bucket.  Spurious membership is
/// acceptable by construction.
pub struct PageHashTable {
    bits: Box<[usize; PHT_SIZE]>,
}

impl PageHashTable {
    pub fn new() -> PageHashTable {
        PageHashTable {
            bits: Box::new([0; PHT_SIZE]),
        }
    }

    pub fn get(&self, index: usize) -> bool {
        (self.bits[index >> LOG_BITS_IN_WORD] >> (index & (BITS_IN_WORD - 1))) & 1 != 0
    }

    pub fn set(&mut self, index: usize) {
        self.bits[index >> LOG_BITS_IN_WORD] |= 1 << (index & (BITS_IN_WORD - 1));
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// The whole word of buckets covering `index`; zero means none of those
    /// buckets are set, which lets scans skip a word at a time.
    fn word_for(&self, index: usize) -> usize {
        self.bits[index >> LOG_BITS_IN_WORD]
    }
}

/// The two generations of the two source classes.
pub struct BlackLists {
    pub old_normal: PageHashTable,
    pub incomplete_normal: PageHashTable,
    pub old_stack: PageHashTable,
    pub incomplete_stack: PageHashTable,
}

impl BlackLists {
    pub fn new() -> BlackLists {
        BlackLists {
            old_normal: PageHashTable::new(),
            incomplete_normal: PageHashTable::new(),
            old_stack: PageHashTable::new(),
            incomplete_stack: PageHashTable::new(),
        }
    }

    /// Declare an end to a black-listing phase: the entries gathered this
    /// cycle become authoritative, and gathering starts over.  The one-cycle
    /// delay lets transiently genuine pointers stop contributing.
    pub fn promote(&mut self) {
        std::mem::swap(&mut self.old_normal, &mut self.incomplete_normal);
        std::mem::swap(&mut self.old_stack, &mut self.incomplete_stack);
        self.incomplete_normal.clear();
        self.incomplete_stack.clear();
    }

    /// Is a block run starting at `h` of `len` bytes unusable?  If so,
    /// return the next plausible start past the offending page.  Every
    /// smaller candidate after `h` is guaranteed no better.
    pub fn is_black_listed(&self, h: Address, len: usize, all_interior: bool) -> Option<Address> {
        let index = pht_hash(h);
        let nblocks = len >> LOG_HBLKSIZE;

        if !all_interior && (self.old_normal.get(index) || self.incomplete_normal.get(index)) {
            return Some(h + HBLKSIZE);
        }

        let mut i = 0;
        let mut index = index;
        loop {
            if self.old_stack.word_for(index) == 0 && self.incomplete_stack.word_for(index) == 0 {
                // An easy case: a whole word of clear buckets.
                i += BITS_IN_WORD - (index & (BITS_IN_WORD - 1));
            } else {
                if self.old_stack.get(index) || self.incomplete_stack.get(index) {
                    return Some(h + (i + 1) * HBLKSIZE);
                }
                i += 1;
            }
            if i >= nblocks {
                break;
            }
            index = pht_hash(h + i * HBLKSIZE);
        }
        None
    }
}

impl Collector {
    /// `p` fell inside the plausible heap bounds but is not a valid object
    /// reference, and did not come from a stack.  Record its page if the word
    /// could have been a pointer at all (its low bits match some registered
    /// displacement) and it is either outside the heap or already on the old
    /// list.  Otherwise it is probably an interior pointer to a live object
    /// and not worth remembering.
    pub(crate) fn add_to_black_list_normal(&mut self, p: Address) {
        if self.obj_maps.all_interior() {
            // Interior pointers being valid everywhere, only the stack class
            // is meaningful.
            self.add_to_black_list_stack(p);
            return;
        }
        if !self.obj_maps.modws_valid(p.as_usize() & (BYTES_IN_WORD - 1)) {
            return;
        }
        let index = pht_hash(p);
        if self.headers.base_block(p).is_none() || self.black.old_normal.get(index) {
            if !self.black.incomplete_normal.get(index) {
                trace!("black listing (normal) {}", p);
            }
            self.black.incomplete_normal.set(index);
        }
    }

    /// Same, for false references found on a stack.  No residue filter.
    pub(crate) fn add_to_black_list_stack(&mut self, p: Address) {
        let index = pht_hash(p);
        if self.headers.base_block(p).is_none() || self.black.old_stack.get(index) {
            if !self.black.incomplete_stack.get(index) {
                trace!("black listing (stack) {}", p);
            }
            self.black.incomplete_stack.set(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_swaps_generations() {
        let mut bl = BlackLists::new();
        let page = Address::from_usize(13 * HBLKSIZE);
        bl.incomplete_stack.set(pht_hash(page));
        assert!(bl.is_black_listed(page, HBLKSIZE, false).is_some());
        bl.promote();
        // Entry survived into the old generation.
        assert!(bl.old_stack.get(pht_hash(page)));
        assert!(bl.is_black_listed(page, HBLKSIZE, false).is_some());
        bl.promote();
        // Gone after the second promotion with no re-observation.
        assert!(bl.is_black_listed(page, HBLKSIZE, false).is_none());
    }

    #[test]
    fn stack_entries_veto_spanning_runs() {
        let mut bl = BlackLists::new();
        let start = Address::from_usize(32 * HBLKSIZE);
        let dirty = start + 3 * HBLKSIZE;
        bl.old_stack.set(pht_hash(dirty));
        // A run that spans the dirty page is rejected with a skip hint past it.
        let hint = bl.is_black_listed(start, 8 * HBLKSIZE, false);
        assert_eq!(hint, Some(dirty + HBLKSIZE));
        // A run that stops short of it is fine.
        assert!(bl.is_black_listed(start, 3 * HBLKSIZE, false).is_none());
    }

    #[test]
    fn normal_entries_only_veto_starts() {
        let mut bl = BlackLists::new();
        let start = Address::from_usize(64 * HBLKSIZE);
        bl.old_normal.set(pht_hash(start));
        assert_eq!(
            bl.is_black_listed(start, HBLKSIZE, false),
            Some(start + HBLKSIZE)
        );
        // A run starting one block earlier merely spans the page; the normal
        // class does not reject it.
        let before = start - HBLKSIZE;
        assert!(bl.is_black_listed(before, 2 * HBLKSIZE, false).is_none());
        // Under all-interior recognition the normal tables are not consulted.
        assert!(bl.is_black_listed(start, HBLKSIZE, true).is_none());
    }
}
