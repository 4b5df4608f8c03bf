//! Deferred sweeping.
//!
//! After marking, fully empty blocks go straight back to the block free
//! list, and every other small-object block is queued per (kind, size).
//! The per-size free lists are rebuilt lazily: an allocation that finds its
//! free list empty sweeps one queued block at a time, threading unmarked
//! objects onto the list.  This amortizes sweep cost across allocation.

use crate::collector::Collector;
use crate::kind::UNCOLLECTABLE;
use crate::util::constants::*;
use crate::util::conversions::words_to_bytes;
use crate::util::{memory, Address};

/// Object free-list link, stored in the object's first word.
pub(crate) unsafe fn obj_link(p: Address) -> Address {
    p.load()
}

pub(crate) unsafe fn set_obj_link(p: Address, next: Address) {
    p.store(next);
}

impl Collector {
    /// Clear mark bits on free-list objects.  Stray integers may have marked
    /// them during the conservative scan; only the list links themselves can
    /// be affected, since composite free objects are otherwise cleared.  The
    /// reclaimed-words count is adjusted down so a free object is not later
    /// double-counted as newly reclaimed.
    pub(crate) fn clear_free_list_marks(&mut self) {
        for kind in 0..self.kinds.len() {
            for sz in 1..=MAXOBJSZ {
                let mut p = self.kinds.get(kind as u8).freelist[sz];
                while !p.is_zero() {
                    if let Some((block, id)) = self.headers.base_block(p) {
                        let word_no = (p - block) / BYTES_IN_WORD;
                        self.headers.header_mut(id).clear_mark_bit(word_no);
                        self.mem_found -= sz as isize;
                    }
                    p = unsafe { obj_link(p) };
                }
            }
        }
    }

    /// Rebuild the reclaim queues: return fully empty blocks to the block
    /// free list, queue the rest for lazy sweeping, and drop every per-size
    /// free list so the deferred sweep rebuilds them from scratch.
    pub(crate) fn start_reclaim(&mut self) {
        for kind in 0..self.kinds.len() {
            let k = self.kinds.get_mut(kind as u8);
            for sz in 0..=MAXOBJSZ {
                // Uncollectable free lists are rebuilt only by explicit
                // frees; dropping them here would strand their objects.
                if kind as u8 != UNCOLLECTABLE {
                    k.freelist[sz] = Address::ZERO;
                }
                k.reclaim[sz] = Address::ZERO;
            }
        }

        for (block, id) in self.headers.all_blocks() {
            let (sz, kind) = {
                let hhdr = self.headers.header(id);
                (hhdr.sz, hhdr.kind)
            };
            if kind == UNCOLLECTABLE {
                continue;
            }
            if sz > MAXOBJSZ {
                // A large object has one mark bit, at its first word.
                if !self.headers.header(id).mark_bit(0) {
                    trace!("reclaiming large object at {} ({} words)", block, sz);
                    self.mem_found += sz as isize;
                    self.free_hblk(block);
                }
            } else if self.headers.header(id).is_empty() {
                let n_objs = WORDS_IN_HBLK / sz;
                self.mem_found += (n_objs * sz) as isize;
                self.free_hblk(block);
            } else {
                // At least one live object: sweep lazily, on demand.
                let head = self.kinds.get(kind).reclaim[sz];
                self.headers.header_mut(id).next = head;
                self.kinds.get_mut(kind).reclaim[sz] = block;
            }
        }
    }

    /// Sweep queued blocks of the given size and kind for as long as the
    /// corresponding free list stays empty.
    pub(crate) fn continue_reclaim(&mut self, sz: usize, kind: u8) {
        loop {
            if !self.kinds.get(kind).freelist[sz].is_zero() {
                return;
            }
            let block = self.kinds.get(kind).reclaim[sz];
            if block.is_zero() {
                return;
            }
            let id = self.hdr_id(block);
            let next = self.headers.header(id).next;
            self.kinds.get_mut(kind).reclaim[sz] = next;
            self.reclaim_block(block, sz, kind);
        }
    }

    /// Thread the unmarked objects of one block onto the kind's free list.
    fn reclaim_block(&mut self, block: Address, sz: usize, kind: u8) {
        let id = self.hdr_id(block);
        let init = self.kinds.get(kind).init;
        let mut head = self.kinds.get(kind).freelist[sz];
        let mut found = 0isize;
        let mut w = 0;
        while w + sz <= WORDS_IN_HBLK {
            if !self.headers.header(id).mark_bit(w) {
                let obj = block + words_to_bytes(w);
                unsafe {
                    if init {
                        // Composite free objects carry their link in the
                        // first word and zeroes elsewhere.
                        memory::zero(obj, words_to_bytes(sz));
                    }
                    set_obj_link(obj, head);
                }
                head = obj;
                found += sz as isize;
            }
            w += sz;
        }
        self.kinds.get_mut(kind).freelist[sz] = head;
        self.mem_found += found;
        let gc_no = self.gc_no as u16;
        self.headers.header_mut(id).last_reclaimed = gc_no;
    }

    /// Explicitly deallocate the object at base `p`.  Invalid and foreign
    /// pointers are ignored, preserving C `free(NULL)` manners.
    pub(crate) fn free_inner(&mut self, p: Address) {
        if p.is_zero() {
            return;
        }
        let (block, id) = match self.headers.base_block(p) {
            Some(found) => found,
            None => return,
        };
        let (sz, kind, map) = {
            let hhdr = self.headers.header(id);
            (hhdr.sz, hhdr.kind, hhdr.map)
        };
        if map == crate::heap::obj_map::INVALID_MAP {
            return;
        }
        if sz > MAXOBJSZ {
            if p != block {
                return;
            }
            self.mem_freed += sz;
            if kind == UNCOLLECTABLE {
                self.non_gc_bytes = self.non_gc_bytes.saturating_sub(words_to_bytes(sz));
            }
            self.headers.header_mut(id).clear_marks();
            self.free_hblk(block);
            return;
        }
        let word_no = (p - block) / BYTES_IN_WORD;
        if word_no % sz != 0 {
            // Not an object base.
            return;
        }
        self.headers.header_mut(id).clear_mark_bit(word_no);
        let init = self.kinds.get(kind).init;
        let head = self.kinds.get(kind).freelist[sz];
        unsafe {
            if init {
                memory::zero(p, words_to_bytes(sz));
            }
            set_obj_link(p, head);
        }
        self.kinds.get_mut(kind).freelist[sz] = p;
        self.mem_freed += sz;
        if kind == UNCOLLECTABLE {
            self.non_gc_bytes = self.non_gc_bytes.saturating_sub(words_to_bytes(sz));
        }
    }
}
