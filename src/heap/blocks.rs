//! Allocation and deallocation of whole heap blocks.
//!
//! Free blocks live on a single list sorted by address and linked through
//! their headers; a free header's `sz` holds the byte length of the whole
//! run.  Neighbors are coalesced on every free.  Allocation is first fit
//! from a round-robin cursor, with a one-entry look-ahead that keeps a large
//! block intact when the following block is a tighter fit, and black-list
//! consultation that steers pointer-containing data away from suspect pages.

use crate::collector::Collector;
use crate::heap::headers::HeaderId;
use crate::heap::obj_map::INVALID_MAP;
use crate::kind::PTRFREE;
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::{memory, Address};

impl Collector {
    /// Header id for a block known to have one.
    pub(crate) fn hdr_id(&self, h: Address) -> HeaderId {
        match self.headers.plain_header_id(h) {
            Some(id) => id,
            None => unreachable!("block {} has no header", h),
        }
    }

    /// Initialize a header for a block holding `sz`-word objects of `kind`:
    /// size, kind, shared offset map, cleared marks.
    fn setup_header(&mut self, id: HeaderId, sz: usize, kind: u8) {
        let map = self.obj_maps.add_map_entry(sz);
        let gc_no = self.gc_no as u16;
        let hhdr = self.headers.header_mut(id);
        hhdr.sz = sz;
        hhdr.kind = kind;
        hhdr.map = map;
        hhdr.last_reclaimed = gc_no;
        hhdr.clear_marks();
    }

    /// Allocate a run of heap blocks for objects of `sz` words of `kind`.
    /// The offset map is installed; building the object free list inside the
    /// block is the caller's business.  Returns `None` when no (acceptable)
    /// free run exists; the caller is expected to collect or expand.
    pub(crate) fn alloc_hblk(&mut self, sz: usize, kind: u8) -> Option<Address> {
        let size_needed = raw_align_up_hblk(words_to_bytes(sz));
        let all_interior = self.obj_maps.all_interior();
        let mut first_time = true;

        let mut hbp = self.cursor;
        let thishbp;
        loop {
            let mut prevhbp = hbp;
            hbp = if prevhbp.is_zero() {
                self.hblk_free_list
            } else {
                self.headers.header(self.hdr_id(prevhbp)).next
            };

            if prevhbp == self.cursor && !first_time {
                return None;
            }
            first_time = false;

            if hbp.is_zero() {
                continue;
            }
            let hhdr = self.hdr_id(hbp);
            let block_sz = self.headers.header(hhdr).sz;
            let mut size_avail = block_sz as isize;
            if size_avail < size_needed as isize {
                continue;
            }

            // If the next free block is a tighter but sufficient fit, go on.
            // This keeps us from disassembling a single large block into
            // tiny ones.
            {
                let mut next = self.headers.header(hhdr).next;
                if next.is_zero() {
                    next = self.hblk_free_list;
                }
                let next_size = self.headers.header(self.hdr_id(next)).sz as isize;
                if next_size < size_avail
                    && next_size >= size_needed as isize
                    && self
                        .black
                        .is_black_listed(next, size_needed, all_interior)
                        .is_none()
                {
                    continue;
                }
            }

            if kind != PTRFREE || size_needed > MAX_BLACK_LIST_ALLOC {
                // Skip forward past black-listed starting pages.
                let mut lasthbp = hbp;
                while size_avail >= size_needed as isize {
                    match self.black.is_black_listed(lasthbp, size_needed, all_interior) {
                        Some(next) => lasthbp = next,
                        None => break,
                    }
                }
                size_avail = block_sz as isize - (lasthbp - hbp) as isize;
                if size_avail >= size_needed as isize && lasthbp != hbp {
                    // Split the block at lasthbp; the remainder up to it
                    // stays free.
                    let this_id = self.headers.install_header(lasthbp);
                    {
                        let old_next = self.headers.header(hhdr).next;
                        let this_hdr = self.headers.header_mut(this_id);
                        this_hdr.next = old_next;
                        this_hdr.sz = size_avail as usize;
                    }
                    {
                        let hhdr_mut = self.headers.header_mut(hhdr);
                        hhdr_mut.sz = lasthbp - hbp;
                        hhdr_mut.next = lasthbp;
                    }
                    prevhbp = hbp;
                    hbp = lasthbp;
                } else if size_avail == 0
                    && size_needed == HBLKSIZE
                    && !prevhbp.is_zero()
                {
                    // A completely black-listed single block.  Dropping a
                    // quarter of these bounds scan cost when pointer-free
                    // allocation is rare; a dropped block is reconsidered at
                    // the next collection.
                    self.drop_count += 1;
                    if self.drop_count & 3 == 0 {
                        debug!("dropping black-listed block {}", hbp);
                        let prev_id = self.hdr_id(prevhbp);
                        let next = self.headers.header(hhdr).next;
                        self.headers.header_mut(prev_id).next = next;
                        let bytes = self.headers.header(hhdr).sz;
                        self.headers.install_counts(hbp, bytes);
                        self.setup_header(hhdr, bytes_to_words(bytes), PTRFREE);
                        if self.cursor == hbp {
                            self.cursor = prevhbp;
                        }
                        hbp = prevhbp;
                        if hbp == self.cursor {
                            first_time = true;
                        }
                    }
                    continue;
                }
            }

            if size_avail >= size_needed as isize {
                // Found a big enough run starting at hbp; unlink the portion
                // we take and leave any tail on the free list.
                let this_id = self.hdr_id(hbp);
                let taken = hbp;
                let after = if size_avail as usize == size_needed {
                    self.headers.header(this_id).next
                } else {
                    let rest = taken + size_needed;
                    let rest_id = self.headers.install_header(rest);
                    let old_next = self.headers.header(this_id).next;
                    let rest_hdr = self.headers.header_mut(rest_id);
                    rest_hdr.next = old_next;
                    rest_hdr.sz = size_avail as usize - size_needed;
                    rest
                };
                if prevhbp.is_zero() {
                    self.hblk_free_list = after;
                } else {
                    let prev_id = self.hdr_id(prevhbp);
                    self.headers.header_mut(prev_id).next = after;
                }
                self.cursor = after;
                thishbp = taken;
                break;
            }
        }

        // Multi-block runs for kinds that hand out cleared objects are
        // zeroed here; per-object clearing covers the small case.
        if sz > MAXOBJSZ && self.kinds.get(kind).init {
            unsafe {
                memory::zero(thishbp, size_needed);
            }
        }
        let id = self.hdr_id(thishbp);
        self.setup_header(id, sz, kind);
        self.headers.install_counts(thishbp, size_needed);
        Some(thishbp)
    }

    /// Return block run `p` to the free list, coalescing with any
    /// address-adjacent free neighbors.  Mark bits must already be clear.
    pub(crate) fn free_hblk(&mut self, p: Address) {
        // Coalescing can invalidate the cursor's neighbors.
        self.cursor = Address::ZERO;

        let pid = self.hdr_id(p);
        debug_assert!(self.headers.header(pid).is_empty());
        let size = raw_align_up_hblk(words_to_bytes(self.headers.header(pid).sz));
        self.headers.remove_counts(p, size);
        {
            let phdr = self.headers.header_mut(pid);
            phdr.sz = size;
            phdr.map = INVALID_MAP;
        }

        let mut prevhbp = Address::ZERO;
        let mut hbp = self.hblk_free_list;
        while !hbp.is_zero() && hbp < p {
            prevhbp = hbp;
            hbp = self.headers.header(self.hdr_id(hbp)).next;
        }

        // Duplicate deallocation shows up as overlap with a neighbor.
        let overlaps_succ = !hbp.is_zero() && p + size > hbp;
        let overlaps_pred = !prevhbp.is_zero()
            && prevhbp + self.headers.header(self.hdr_id(prevhbp)).sz > p;
        if overlaps_succ || overlaps_pred {
            error!(
                "duplicate large block deallocation of {} (neighbors {} and {})",
                p, prevhbp, hbp
            );
        }

        // Coalesce with the successor if contiguous.
        if !hbp.is_zero() && p + size == hbp {
            let succ_id = self.hdr_id(hbp);
            let succ_next = self.headers.header(succ_id).next;
            let succ_sz = self.headers.header(succ_id).sz;
            {
                let phdr = self.headers.header_mut(pid);
                phdr.next = succ_next;
                phdr.sz += succ_sz;
            }
            self.headers.remove_header(hbp);
        } else {
            self.headers.header_mut(pid).next = hbp;
        }

        if prevhbp.is_zero() {
            self.hblk_free_list = p;
        } else {
            let prev_id = self.hdr_id(prevhbp);
            let prev_sz = self.headers.header(prev_id).sz;
            if prevhbp + prev_sz == p {
                // Coalesce with the predecessor.
                let p_next = self.headers.header(pid).next;
                let p_sz = self.headers.header(pid).sz;
                let prev = self.headers.header_mut(prev_id);
                prev.next = p_next;
                prev.sz += p_sz;
                self.headers.remove_header(p);
            } else {
                self.headers.header_mut(prev_id).next = p;
            }
        }
    }

    /// Dump the free-block list.
    pub(crate) fn log_hblk_free_list(&self) {
        let mut h = self.hblk_free_list;
        let mut total = 0;
        while !h.is_zero() {
            let hhdr = self.headers.header(self.hdr_id(h));
            debug!("free block {} of {} bytes", h, hhdr.sz);
            total += hhdr.sz;
            h = hhdr.next;
        }
        debug!("total of {} bytes on free list", total);
    }

    /// Sum of the free-block list, in bytes.
    #[cfg(test)]
    pub(crate) fn free_bytes(&self) -> usize {
        let mut h = self.hblk_free_list;
        let mut total = 0;
        while !h.is_zero() {
            let hhdr = self.headers.header(self.hdr_id(h));
            total += hhdr.sz;
            h = hhdr.next;
        }
        total
    }

    /// Free-block list as (address, bytes) pairs, in list order.
    #[cfg(test)]
    pub(crate) fn free_runs(&self) -> Vec<(Address, usize)> {
        let mut out = Vec::new();
        let mut h = self.hblk_free_list;
        while !h.is_zero() {
            let hhdr = self.headers.header(self.hdr_id(h));
            out.push((h, hhdr.sz));
            h = hhdr.next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::NORMAL;

    fn with_heap(blocks: usize) -> (Collector, Address) {
        let mut c = Collector::new();
        c.obj_maps.register_displacement(0);
        c.size_map.init(false);
        let m = memory::get_mem(blocks * HBLKSIZE).expect("test heap");
        c.add_to_heap(m, blocks * HBLKSIZE);
        (c, m)
    }

    #[test]
    fn carve_then_coalesce_back_to_one_run() {
        let (mut c, m) = with_heap(8);
        assert_eq!(c.free_bytes(), 8 * HBLKSIZE);

        let sz = 16; // words: a single-block request
        let a = c.alloc_hblk(sz, PTRFREE).expect("first block");
        assert_eq!(a, m);
        let b = c.alloc_hblk(sz, PTRFREE).expect("second block");
        let d = c.alloc_hblk(sz, PTRFREE).expect("third block");
        assert_eq!(b, m + HBLKSIZE);
        assert_eq!(d, m + 2 * HBLKSIZE);
        assert_eq!(c.free_bytes(), 5 * HBLKSIZE);

        // Free the outer two: list stays sorted with no adjacent runs.
        c.free_hblk(a);
        c.free_hblk(d);
        let runs = c.free_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (a, HBLKSIZE));
        // d coalesced with the tail remainder.
        assert_eq!(runs[1], (d, 6 * HBLKSIZE));
        for w in runs.windows(2) {
            assert!(w[0].0 < w[1].0);
            assert!(w[0].0 + w[0].1 < w[1].0);
        }

        // Freeing the middle block merges everything into one run.
        c.free_hblk(b);
        let runs = c.free_runs();
        assert_eq!(runs, vec![(m, 8 * HBLKSIZE)]);
    }

    #[test]
    fn split_prefers_low_addresses_and_installs_maps() {
        let (mut c, m) = with_heap(4);
        let sz = 8;
        let h = c.alloc_hblk(sz, NORMAL).expect("block");
        assert_eq!(h, m);
        let id = c.hdr_id(h);
        let hhdr = c.headers.header(id);
        assert_eq!(hhdr.sz, sz);
        assert_eq!(hhdr.kind, NORMAL);
        assert_ne!(hhdr.map, INVALID_MAP);
        assert!(hhdr.is_empty());
        // The tail remainder is a free block with the sentinel map.
        let tail = c.hdr_id(m + HBLKSIZE);
        assert_eq!(c.headers.header(tail).map, INVALID_MAP);
        assert_eq!(c.headers.header(tail).sz, 3 * HBLKSIZE);
    }

    #[test]
    fn multi_block_run_forwards_interior_addresses() {
        let (mut c, m) = with_heap(8);
        let sz = crate::util::conversions::bytes_to_words(3 * HBLKSIZE);
        let h = c.alloc_hblk(sz, NORMAL).expect("large run");
        assert_eq!(h, m);
        let interior = h + HBLKSIZE + 64usize;
        let (block, _) = c.headers.base_block(interior).expect("forwarded");
        assert_eq!(block, h);
        // Large composite runs are zeroed.
        let w: usize = unsafe { (h + HBLKSIZE).load() };
        assert_eq!(w, 0);
    }

    #[test]
    fn black_listed_page_is_skipped_for_scanned_kinds() {
        let (mut c, m) = with_heap(8);
        // Poison the first page for stack sources.
        let index = crate::util::conversions::pht_hash(m);
        c.black.old_stack.set(index);
        let h = c.alloc_hblk(8, NORMAL).expect("block");
        assert_ne!(h, m, "allocation must avoid the black-listed page");
        // Pointer-free single-block requests ignore the black list.
        c.free_hblk(h);
        let h = c.alloc_hblk(8, PTRFREE).expect("block");
        assert_eq!(h, m);
    }
}
