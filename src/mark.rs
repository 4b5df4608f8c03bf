//! The conservative mark phase.
//!
//! Every aligned word in the roots is treated as a potential pointer.  A
//! candidate survives a plausible-range check, resolves through the header
//! index (following forwarding for interiors of large objects), and must hit
//! a valid displacement in the block's offset map; then the object's mark
//! bit is set and, for scanned kinds, its body is pushed for traversal.
//! Words that get through the cheap checks but fail the map are reported to
//! the black lists, keyed by whether they came from a stack.
//!
//! All raw reads of client memory are confined to `scan_range_excluding`.

use crate::collector::Collector;
use crate::heap::obj_map::{INVALID_MAP, MAX_OFFSET};
use crate::kind::{MarkDescriptor, UNCOLLECTABLE};
use crate::util::constants::*;
use crate::util::conversions::words_to_bytes;
use crate::util::stack::{approx_sp, REGISTER_SNAPSHOT_WORDS};
use crate::util::Address;

/// Where a candidate pointer was found.  Stack sources feed the stack black
/// lists, which veto more aggressively.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PointerOrigin {
    Normal,
    Stack,
}

/// The mark stack: (start, end) word ranges awaiting a scan.  Overflow is
/// not fatal; it sets a flag and the collector remarks.
pub struct MarkState {
    stack: Vec<(Address, Address)>,
    capacity: usize,
    dropped: bool,
}

impl MarkState {
    pub fn new() -> MarkState {
        MarkState {
            stack: Vec::new(),
            capacity: INITIAL_MARK_STACK_SIZE,
            dropped: false,
        }
    }

    fn push(&mut self, start: Address, end: Address) {
        if self.stack.len() >= self.capacity {
            self.dropped = true;
            return;
        }
        self.stack.push((start, end));
    }

    fn pop(&mut self) -> Option<(Address, Address)> {
        self.stack.pop()
    }

    fn grow(&mut self) {
        self.capacity *= 2;
    }
}

/// Zero a window of our own frame garbage so stale values left on the stack
/// by the collector itself are not taken for roots.
#[inline(never)]
fn clear_a_few_frames() {
    const NWORDS: usize = 64;
    let mut frames = [0usize; NWORDS];
    std::hint::black_box(&mut frames);
}

impl Collector {
    /// Push everything reachable from the roots and drain the mark stack,
    /// remarking as long as overflow was recorded.
    pub(crate) fn mark_roots(&mut self) {
        clear_a_few_frames();

        // Statics first; ordering across root classes is irrelevant because
        // marking is idempotent.
        for (b, e) in self.roots.ranges().to_vec() {
            self.scan_range(b, e, PointerOrigin::Normal);
        }

        // Registers.
        let mut regs = [0usize; REGISTER_SNAPSHOT_WORDS];
        let n = self.stack.register_snapshot(&mut regs);
        for &w in &regs[..n] {
            self.push_one(Address::from_usize(w), PointerOrigin::Stack);
        }

        // The stack, from the current hot end to the recorded bottom.
        let sp = approx_sp();
        let bottom = self.stack.stack_bottom();
        self.scan_range(sp, bottom, PointerOrigin::Stack);

        // Uncollectable objects are scanned but never reclaimed: marked ones
        // act as additional mark sources.
        self.push_uncollectable();

        // Objects sitting on the finalization queue must survive until their
        // finalizers run, along with everything they reference.
        self.push_finalize_queue();

        self.drain_with_remark();
    }

    /// Scan a range of raw words, testing each as a potential pointer.
    pub(crate) fn scan_range(&mut self, begin: Address, end: Address, origin: PointerOrigin) {
        self.scan_range_excluding(begin, end, origin, None);
    }

    /// As [`scan_range`](Self::scan_range), but words whose value falls in
    /// `exclude` are not treated as pointers; finalization ordering uses
    /// this to ignore an object's references into its own extent.  The
    /// single place where arbitrary client memory is read.
    pub(crate) fn scan_range_excluding(
        &mut self,
        begin: Address,
        end: Address,
        origin: PointerOrigin,
        exclude: Option<(Address, Address)>,
    ) {
        let mut p = begin.align_up(BYTES_IN_WORD);
        while p + BYTES_IN_WORD <= end {
            let w: usize = unsafe { p.load() };
            let q = Address::from_usize(w);
            if let Some((lo, hi)) = exclude {
                if q >= lo && q < hi {
                    p += BYTES_IN_WORD;
                    continue;
                }
            }
            self.push_one(q, origin);
            p += BYTES_IN_WORD;
        }
    }

    /// The conservative pointer test.  If `p` is a valid object reference,
    /// set the object's mark bit and push its body for traversal; otherwise
    /// report the page to the appropriate black list.
    pub(crate) fn push_one(&mut self, p: Address, origin: PointerOrigin) {
        if p <= self.least_plausible_heap_addr || p >= self.greatest_plausible_heap_addr {
            return;
        }
        let (block, id) = match self.headers.base_block(p) {
            Some(found) => found,
            None => {
                self.blacklist(p, origin);
                return;
            }
        };
        let (map, sz, kind) = {
            let hhdr = self.headers.header(id);
            (hhdr.map, hhdr.sz, hhdr.kind)
        };
        if map == INVALID_MAP {
            // A free block.
            self.blacklist(p, origin);
            return;
        }
        let displ = p - block;
        if displ > MAX_OFFSET {
            // Too deep inside a large object to be a recognized pointer.
            self.blacklist(p, origin);
            return;
        }
        let wdispl = match self.obj_maps.lookup(map, displ) {
            Some(w) => w,
            None => {
                self.blacklist(p, origin);
                return;
            }
        };
        let base_word = displ / BYTES_IN_WORD - wdispl;
        {
            let hhdr = self.headers.header_mut(id);
            if hhdr.mark_bit(base_word) {
                return;
            }
            hhdr.set_mark_bit(base_word);
        }
        let base = block + words_to_bytes(base_word);
        self.push_obj_contents(base, sz, kind);
    }

    fn blacklist(&mut self, p: Address, origin: PointerOrigin) {
        match origin {
            PointerOrigin::Normal => self.add_to_black_list_normal(p),
            PointerOrigin::Stack => self.add_to_black_list_stack(p),
        }
    }

    /// Arrange for the descendants of the object at `base` to be marked.
    pub(crate) fn push_obj_contents(&mut self, base: Address, sz: usize, kind: u8) {
        match self.kinds.get(kind).mark {
            MarkDescriptor::PointerFree => {}
            MarkDescriptor::Conservative => {
                self.mark.push(base, base + words_to_bytes(sz));
            }
            MarkDescriptor::Custom(f) => f(self, base, sz),
        }
    }

    /// Push a single candidate pointer found by a custom mark procedure.
    pub(crate) fn mark_push_one(&mut self, p: Address) {
        self.push_one(p, PointerOrigin::Normal);
    }

    /// Drain the mark stack.  Popped entries are heap object bodies, so
    /// their words are non-stack sources.
    pub(crate) fn mark_from_mark_stack(&mut self) {
        while let Some((start, end)) = self.mark.pop() {
            self.scan_range(start, end, PointerOrigin::Normal);
        }
    }

    /// Drain, and while entries were dropped to overflow, grow the stack and
    /// remark: push the bodies of all marked objects again and re-drain.
    /// Marking is idempotent, so over-pushing is merely wasted work.
    pub(crate) fn drain_with_remark(&mut self) {
        self.mark_from_mark_stack();
        while self.mark.dropped {
            self.mark.dropped = false;
            self.mark.grow();
            debug!("mark stack overflow: remarking");
            for (block, id) in self.headers.all_blocks() {
                let (sz, kind) = {
                    let hhdr = self.headers.header(id);
                    (hhdr.sz, hhdr.kind)
                };
                if matches!(self.kinds.get(kind).mark, MarkDescriptor::PointerFree) {
                    continue;
                }
                for word_no in self.marked_objects(id, sz) {
                    let base = block + words_to_bytes(word_no);
                    self.push_obj_contents(base, sz, kind);
                }
            }
            self.mark_from_mark_stack();
        }
    }

    /// Word offsets of marked objects in a block of `sz`-word objects.
    fn marked_objects(&self, id: crate::heap::headers::HeaderId, sz: usize) -> Vec<usize> {
        let hhdr = self.headers.header(id);
        let mut out = Vec::new();
        if sz > MAXOBJSZ {
            if hhdr.mark_bit(0) {
                out.push(0);
            }
            return out;
        }
        let mut w = 0;
        while w + sz <= WORDS_IN_HBLK {
            if hhdr.mark_bit(w) {
                out.push(w);
            }
            w += sz;
        }
        out
    }

    /// Push the contents of every marked object in uncollectable blocks.
    fn push_uncollectable(&mut self) {
        for (block, id) in self.headers.all_blocks() {
            let (sz, kind) = {
                let hhdr = self.headers.header(id);
                (hhdr.sz, hhdr.kind)
            };
            if kind != UNCOLLECTABLE {
                continue;
            }
            for word_no in self.marked_objects(id, sz) {
                let base = block + words_to_bytes(word_no);
                self.push_obj_contents(base, sz, kind);
            }
        }
    }

    /// Is the object with base `p` marked?  `p` must be an object base.
    pub(crate) fn is_marked(&self, p: Address) -> bool {
        match self.headers.base_block(p) {
            Some((block, id)) => self.headers.header(id).mark_bit((p - block) / BYTES_IN_WORD),
            None => false,
        }
    }

    pub(crate) fn set_mark_bit(&mut self, p: Address) {
        if let Some((block, id)) = self.headers.base_block(p) {
            let word_no = (p - block) / BYTES_IN_WORD;
            self.headers.header_mut(id).set_mark_bit(word_no);
        }
    }
}
