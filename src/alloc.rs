//! The object allocator.
//!
//! The fast path pops the per-(kind, size) free list.  An empty list is
//! refilled by sweeping queued blocks, then by carving a fresh heap block
//! into a free list, and finally by collecting or expanding and retrying.
//! Byte requests are rounded to a reduced set of size classes so few
//! distinct free lists are live at once.

use crate::collector::{fatal_error, Collector};
use crate::kind::UNCOLLECTABLE;
use crate::reclaim::{obj_link, set_obj_link};
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::{memory, Address};

/// Rounds allocation requests to size classes.  Quantization guarantees at
/// most 1/8 internal waste and reuses nearby populated classes.  Entries are
/// filled lazily above eight words.
pub struct SizeMap {
    map: Vec<usize>,
    all_interior: bool,
}

impl SizeMap {
    pub fn new() -> SizeMap {
        SizeMap {
            map: Vec::new(),
            all_interior: false,
        }
    }

    /// Populate the small, always-hot entries.
    pub fn init(&mut self, all_interior: bool) {
        self.all_interior = all_interior;
        self.map = vec![0; words_to_bytes(MAXOBJSZ + 1)];
        // Size 0 allocations round up to the minimum class.
        self.map[0] = 1;
        for i in 1..BYTES_IN_WORD {
            self.map[i] = 1;
        }
        self.map[BYTES_IN_WORD] = rounded_up_words(BYTES_IN_WORD, all_interior);
        for i in BYTES_IN_WORD + 1..=8 * BYTES_IN_WORD {
            self.map[i] = rounded_up_words(i, all_interior);
        }
    }

    /// Size class, in words, for a byte request.  The caller has already
    /// routed anything beyond `MAXOBJSZ` to the large-object path.
    pub fn get(&mut self, bytes: usize) -> usize {
        debug_assert!(bytes < self.map.len());
        if self.map[bytes] == 0 {
            self.extend(bytes);
        }
        self.map[bytes]
    }

    /// Fill in entries covering byte size `i`, keeping the number of
    /// distinct classes small.  A filled-in stretch ending at n always has
    /// length at least n/4.
    fn extend(&mut self, i: usize) {
        let orig_word_sz = rounded_up_words(i, self.all_interior);
        let mut word_sz = orig_word_sz;
        let byte_sz = words_to_bytes(word_sz);
        // The size we try to preserve: close to i, unless that would
        // introduce too many distinct sizes.
        let smaller_than_i = byte_sz - (byte_sz >> 3);
        let much_smaller_than_i = byte_sz - (byte_sz >> 2);
        let mut low_limit;
        if self.map[smaller_than_i] == 0 {
            low_limit = much_smaller_than_i;
            while self.map[low_limit] != 0 {
                low_limit += 1;
            }
        } else {
            low_limit = smaller_than_i + 1;
            while self.map[low_limit] != 0 {
                low_limit += 1;
            }
            word_sz = rounded_up_words(low_limit, self.all_interior);
            word_sz += word_sz >> 3;
            if word_sz < orig_word_sz {
                word_sz = orig_word_sz;
            }
        }
        if word_sz > MAXOBJSZ {
            word_sz = MAXOBJSZ;
        }
        let mut byte_sz = words_to_bytes(word_sz);
        if self.all_interior {
            // One extra byte is needed; leave the exact boundary unfilled.
            byte_sz -= 1;
        }
        for j in low_limit..=byte_sz {
            self.map[j] = word_sz;
        }
    }
}

/// A batch of same-sized objects linked through their first words, obtained
/// under one lock acquisition.
pub struct FreeListChain {
    pub(crate) head: Address,
    pub(crate) obj_bytes: usize,
}

impl FreeListChain {
    /// Bytes usable in each object of the chain.
    pub fn object_size(&self) -> usize {
        self.obj_bytes
    }

    /// Detach and return the next object.  The link word is cleared.
    pub fn pop(&mut self) -> Option<Address> {
        if self.head.is_zero() {
            return None;
        }
        let obj = self.head;
        unsafe {
            self.head = obj_link(obj);
            set_obj_link(obj, Address::ZERO);
        }
        Some(obj)
    }
}

impl Collector {
    /// Make the free list for (`sz`, `kind`) nonempty and return its head.
    /// The caller removes the object from the list.
    pub(crate) fn allocobj(&mut self, sz: usize, kind: u8) -> Address {
        debug_assert!(sz > 0 && sz <= MAXOBJSZ);
        let mut tries = 0;
        loop {
            let head = self.kinds.get(kind).freelist[sz];
            if !head.is_zero() {
                return head;
            }
            self.continue_reclaim(sz, kind);
            if self.kinds.get(kind).freelist[sz].is_zero() {
                self.new_hblk(sz, kind);
            }
            if self.kinds.get(kind).freelist[sz].is_zero() {
                tries += 1;
                if tries > *self.options.max_retries {
                    fatal_error("out of memory: refill keeps failing");
                }
                self.collect_or_expand(1);
            }
        }
    }

    /// Allocate a new heap block and build a free list of `sz`-word objects
    /// in it, linked through their first words.
    fn new_hblk(&mut self, sz: usize, kind: u8) {
        let block = match self.alloc_hblk(sz, kind) {
            Some(b) => b,
            None => return,
        };
        if self.kinds.get(kind).init {
            unsafe {
                memory::zero(block, HBLKSIZE);
            }
        }
        // Thread back to front so the list hands objects out in address
        // order.
        let mut head = self.kinds.get(kind).freelist[sz];
        let n_objs = WORDS_IN_HBLK / sz;
        for i in (0..n_objs).rev() {
            let obj = block + words_to_bytes(i * sz);
            unsafe {
                set_obj_link(obj, head);
            }
            head = obj;
        }
        self.kinds.get_mut(kind).freelist[sz] = head;
        trace!("built free list of {} objects of {} words at {}", n_objs, sz, block);
    }

    /// Allocate `bytes` of `kind` storage.  Small requests are rounded to a
    /// size class and served from the free lists; larger ones take whole
    /// heap blocks.
    pub(crate) fn generic_malloc_inner(&mut self, bytes: usize, kind: u8) -> Address {
        let all_interior = self.obj_maps.all_interior();
        if rounded_up_words(bytes, all_interior) <= MAXOBJSZ {
            let lw = self.size_map.get(bytes);
            let mut op = self.kinds.get(kind).freelist[lw];
            if op.is_zero() {
                op = self.allocobj(lw, kind);
            }
            unsafe {
                let next = obj_link(op);
                self.kinds.get_mut(kind).freelist[lw] = next;
                set_obj_link(op, Address::ZERO);
            }
            self.words_allocd += lw;
            op
        } else {
            let lw = rounded_up_words(bytes, all_interior);
            let mut tries = 0;
            let block = loop {
                if let Some(b) = self.alloc_hblk(lw, kind) {
                    break b;
                }
                tries += 1;
                if tries > *self.options.max_retries {
                    fatal_error("out of memory: large allocation keeps failing");
                }
                self.collect_or_expand(obj_sz_to_blocks(lw));
            };
            self.words_allocd += lw;
            block
        }
    }

    /// Uncollectable storage: marked at allocation, scanned every cycle,
    /// reclaimed only by an explicit free.
    pub(crate) fn malloc_uncollectable_inner(&mut self, bytes: usize) -> Address {
        let op = self.generic_malloc_inner(bytes, UNCOLLECTABLE);
        self.set_mark_bit(op);
        let sz = self.size_of_inner(op);
        self.non_gc_bytes += words_to_bytes(sz);
        op
    }

    /// Take the entire free list for the class covering `bytes`, refilling
    /// first if needed.
    pub(crate) fn malloc_many_inner(&mut self, bytes: usize, kind: u8) -> FreeListChain {
        let all_interior = self.obj_maps.all_interior();
        if rounded_up_words(bytes, all_interior) > MAXOBJSZ {
            // Batching buys nothing for whole-block objects.
            let op = self.generic_malloc_inner(bytes, kind);
            let obj_bytes = words_to_bytes(self.size_of_inner(op));
            return FreeListChain {
                head: op,
                obj_bytes,
            };
        }
        let lw = self.size_map.get(bytes);
        let mut head = self.kinds.get(kind).freelist[lw];
        if head.is_zero() {
            head = self.allocobj(lw, kind);
        }
        self.kinds.get_mut(kind).freelist[lw] = Address::ZERO;
        let mut n = 0;
        let mut p = head;
        while !p.is_zero() {
            n += 1;
            p = unsafe { obj_link(p) };
        }
        self.words_allocd += n * lw;
        FreeListChain {
            head,
            obj_bytes: words_to_bytes(lw),
        }
    }

    /// Base pointer of the object containing `p`, or `None` if `p` is not in
    /// the heap.  An interior pointer that would place the object past its
    /// block's end is rejected.
    pub(crate) fn base_inner(&self, p: Address) -> Option<Address> {
        let (block, id) = self.headers.base_block(p)?;
        let hhdr = self.headers.header(id);
        if hhdr.map == crate::heap::obj_map::INVALID_MAP {
            return None;
        }
        let r = p.align_down(BYTES_IN_WORD);
        let offset = (r - block) / BYTES_IN_WORD;
        let sz = hhdr.sz;
        let correction = offset % sz;
        let r = r - words_to_bytes(correction);
        let obj_word = offset - correction;
        if obj_word + sz > WORDS_IN_HBLK && sz <= WORDS_IN_HBLK {
            return None;
        }
        Some(r)
    }

    /// Object size in words, given its base.
    pub(crate) fn size_of_inner(&self, p: Address) -> usize {
        match self.headers.base_block(p) {
            Some((_, id)) => self.headers.header(id).sz,
            None => 0,
        }
    }

    /// Change the object at `p` to hold at least `bytes`.  Shrinks in place
    /// whenever the current class can hold the request, zeroing the tail of
    /// scanned objects so stale values do not pin garbage; otherwise
    /// allocates anew with the same kind, copies, and frees the original.
    pub(crate) fn realloc_inner(&mut self, p: Address, bytes: usize) -> Address {
        let all_interior = self.obj_maps.all_interior();
        let id = match self.headers.base_block(p) {
            Some((_, id)) => id,
            None => return Address::ZERO,
        };
        let (sz, kind) = {
            let hhdr = self.headers.header(id);
            (hhdr.sz, hhdr.kind)
        };
        let orig_bytes = words_to_bytes(sz);

        if sz > MAXOBJSZ {
            // Normalize a large object's size to its whole-block capacity.
            // Concurrent readers of the size field see either value; both
            // describe the same single-object block run.
            let capacity = raw_align_up_hblk(orig_bytes);
            self.headers.header_mut(id).sz = bytes_to_words(capacity);
            if bytes <= capacity {
                if self.kinds.get(kind).init && bytes < orig_bytes {
                    unsafe {
                        memory::zero(p + bytes, orig_bytes - bytes);
                    }
                }
                return p;
            }
        } else if rounded_up_words(bytes, all_interior) <= sz {
            // The current class can hold the request: shrink in place.
            if self.kinds.get(kind).init && bytes < orig_bytes {
                unsafe {
                    memory::zero(p + bytes, orig_bytes - bytes);
                }
            }
            return p;
        }

        let result = match kind {
            UNCOLLECTABLE => self.malloc_uncollectable_inner(bytes),
            _ => self.generic_malloc_inner(bytes, kind),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(
                p.to_ptr::<u8>(),
                result.to_mut_ptr::<u8>(),
                orig_bytes.min(bytes),
            );
        }
        self.free_inner(p);
        result
    }

    /// Aligned allocation.  Over-allocates and registers the chosen interior
    /// displacement so the aligned pointer remains a recognized reference.
    pub(crate) fn memalign_inner(&mut self, align: usize, bytes: usize, kind: u8) -> Address {
        if align <= BYTES_IN_WORD {
            return self.generic_malloc_inner(bytes, kind);
        }
        let op = self.generic_malloc_inner(bytes + align - 1, kind);
        let result = op.align_up(align);
        let offset = result - op;
        if offset != 0 {
            if !self.obj_maps.register_displacement(offset) {
                fatal_error("unregistrable displacement in memalign");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_map() -> SizeMap {
        let mut m = SizeMap::new();
        m.init(false);
        m
    }

    #[test]
    fn zero_and_tiny_round_to_minimum() {
        let mut m = fresh_map();
        assert_eq!(m.get(0), 1);
        assert_eq!(m.get(1), 1);
        assert_eq!(m.get(BYTES_IN_WORD), 1);
    }

    #[test]
    fn exact_for_small_sizes() {
        let mut m = fresh_map();
        for i in BYTES_IN_WORD + 1..=8 * BYTES_IN_WORD {
            assert_eq!(m.get(i), rounded_up_words(i, false));
        }
    }

    #[test]
    fn bounded_waste() {
        let mut m = fresh_map();
        for bytes in (9 * BYTES_IN_WORD..words_to_bytes(MAXOBJSZ)).step_by(61) {
            let words = m.get(bytes);
            assert!(words_to_bytes(words) >= bytes, "class too small for {}", bytes);
            assert!(words <= MAXOBJSZ);
            if words < MAXOBJSZ {
                // At most 1/8 over the request once rounded to words.
                let want = rounded_up_words(bytes, false);
                assert!(
                    words <= want + (want >> 3) + 1,
                    "class {} too wasteful for request {}",
                    words,
                    bytes
                );
            }
        }
    }

    #[test]
    fn classes_are_monotone() {
        let mut m = fresh_map();
        let mut prev = 0;
        for bytes in 0..words_to_bytes(MAXOBJSZ) {
            let words = m.get(bytes);
            assert!(words >= prev, "size map not monotone at {}", bytes);
            prev = words;
        }
    }

    #[test]
    fn interior_mode_pads_by_a_word() {
        let mut m = SizeMap::new();
        m.init(true);
        assert_eq!(m.get(BYTES_IN_WORD), 2);
        assert_eq!(m.get(2 * BYTES_IN_WORD), 3);
    }
}
