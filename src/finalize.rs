//! Finalization: disappearing links, registered finalizers with ordering
//! marks, and the finalize-now queue.
//!
//! Both tables are closed hash tables keyed by hidden addresses, so the
//! conservative scanner never mistakes their contents for references and
//! keeps dead objects alive.  Once an object moves to the finalize-now
//! queue its base is revealed again: from then on it must survive until its
//! finalizer has run, and the mark phase treats the queue as a root set.

use std::collections::VecDeque;

use crate::collector::Collector;
use crate::mark::PointerOrigin;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions::words_to_bytes;
use crate::util::{Address, HiddenPointer};

/// A finalizer: called with the object base and the registered client datum,
/// with the allocator lock not held.
pub type FinalizerFn = fn(obj: Address, client_data: usize);

/// Ordering behavior of a registered finalizer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FinalizeMark {
    /// Mark the object's pointees: referents are finalized in a later cycle.
    Normal,
    /// Like `Normal`, but pointers into the object's own extent are ignored;
    /// for self-referential structures.
    IgnoreSelf,
    /// Mark nothing: no ordering among finalizable objects.
    NoOrder,
    /// Like `Normal`, but the object is finalized as soon as it is
    /// unreachable even through chains of other finalizable objects.
    Unreachable,
}

/// Outcome of a link registration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LinkStatus {
    Registered,
    /// The slot was already registered; its object was updated.
    Duplicate,
}

/// Outcome of moving a link to a new slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MoveStatus {
    Moved,
    NotFound,
    /// The destination slot is already registered.
    Duplicate,
    /// Source and destination are the same slot.
    Unchanged,
}

struct DisappearingLink {
    hidden_link: HiddenPointer,
    hidden_obj: HiddenPointer,
}

struct FinalizableEntry {
    hidden_base: HiddenPointer,
    func: FinalizerFn,
    client_data: usize,
    /// Object size in words, recorded at registration.
    sz: usize,
    mark: FinalizeMark,
}

/// An object whose finalizer is ready to run.  The base is revealed.
struct ReadyFinalizer {
    base: Address,
    func: FinalizerFn,
    client_data: usize,
    sz: usize,
    mark: FinalizeMark,
}

fn table_hash(addr: Address, log_size: u32) -> usize {
    let a = addr.as_usize();
    ((a >> 3) ^ (a >> (3 + log_size))) & ((1usize << log_size) - 1)
}

/// A closed hash table of disappearing links, keyed by the hidden slot
/// address.  Doubles when the load factor passes one.
struct LinkTable {
    buckets: Vec<Vec<DisappearingLink>>,
    log_size: u32,
    entries: usize,
}

impl LinkTable {
    fn new() -> LinkTable {
        LinkTable {
            buckets: Vec::new(),
            log_size: 0,
            entries: 0,
        }
    }

    fn grow(&mut self) {
        let new_log = if self.buckets.is_empty() { 4 } else { self.log_size + 1 };
        let mut new_buckets: Vec<Vec<DisappearingLink>> = Vec::new();
        new_buckets.resize_with(1 << new_log, Vec::new);
        for bucket in self.buckets.drain(..) {
            for dl in bucket {
                let h = table_hash(dl.hidden_link.reveal(), new_log);
                new_buckets[h].push(dl);
            }
        }
        self.buckets = new_buckets;
        self.log_size = new_log;
        debug!("grew disappearing link table to {} buckets", 1usize << new_log);
    }

    fn register(&mut self, link: Address, obj: Address) -> LinkStatus {
        if self.buckets.is_empty() || self.entries > (1 << self.log_size) {
            self.grow();
        }
        let h = table_hash(link, self.log_size);
        let hidden_link = HiddenPointer::hide(link);
        for dl in &mut self.buckets[h] {
            if dl.hidden_link == hidden_link {
                dl.hidden_obj = HiddenPointer::hide(obj);
                return LinkStatus::Duplicate;
            }
        }
        self.buckets[h].push(DisappearingLink {
            hidden_link,
            hidden_obj: HiddenPointer::hide(obj),
        });
        self.entries += 1;
        LinkStatus::Registered
    }

    fn unregister(&mut self, link: Address) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let h = table_hash(link, self.log_size);
        let hidden_link = HiddenPointer::hide(link);
        let bucket = &mut self.buckets[h];
        match bucket.iter().position(|dl| dl.hidden_link == hidden_link) {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.entries -= 1;
                true
            }
            None => false,
        }
    }

    fn move_link(&mut self, link: Address, new_link: Address) -> MoveStatus {
        if self.buckets.is_empty() {
            return MoveStatus::NotFound;
        }
        let h = table_hash(link, self.log_size);
        let hidden_link = HiddenPointer::hide(link);
        if !self.buckets[h].iter().any(|dl| dl.hidden_link == hidden_link) {
            return MoveStatus::NotFound;
        }
        if link == new_link {
            return MoveStatus::Unchanged;
        }
        let new_h = table_hash(new_link, self.log_size);
        let hidden_new = HiddenPointer::hide(new_link);
        if self.buckets[new_h].iter().any(|dl| dl.hidden_link == hidden_new) {
            return MoveStatus::Duplicate;
        }
        let pos = self.buckets[h]
            .iter()
            .position(|dl| dl.hidden_link == hidden_link)
            .expect("entry found above");
        let mut dl = self.buckets[h].swap_remove(pos);
        dl.hidden_link = hidden_new;
        self.buckets[new_h].push(dl);
        MoveStatus::Moved
    }
}

/// The finalizer registry, keyed by the hidden object base.
struct FinalizerTable {
    buckets: Vec<Vec<FinalizableEntry>>,
    log_size: u32,
    entries: usize,
}

impl FinalizerTable {
    fn new() -> FinalizerTable {
        FinalizerTable {
            buckets: Vec::new(),
            log_size: 0,
            entries: 0,
        }
    }

    fn grow(&mut self) {
        let new_log = if self.buckets.is_empty() { 4 } else { self.log_size + 1 };
        let mut new_buckets: Vec<Vec<FinalizableEntry>> = Vec::new();
        new_buckets.resize_with(1 << new_log, Vec::new);
        for bucket in self.buckets.drain(..) {
            for fo in bucket {
                let h = table_hash(fo.hidden_base.reveal(), new_log);
                new_buckets[h].push(fo);
            }
        }
        self.buckets = new_buckets;
        self.log_size = new_log;
        debug!("grew finalizer table to {} buckets", 1usize << new_log);
    }
}

pub struct Finalization {
    /// Short links: cleared before their referent is enqueued.
    dl: LinkTable,
    /// Long links: cleared only after the referent has been enqueued.
    ll: LinkTable,
    fo: FinalizerTable,
    queue: VecDeque<ReadyFinalizer>,
    /// Recursion depth of automatic finalizer invocation.
    nested: u32,
    /// Invocations skipped while nested, for exponential backoff.
    skipped: u32,
    /// Cap on finalizers run per invocation; zero means no limit.
    interrupt_limit: usize,
    /// Some registered finalizer uses the `Unreachable` mark.
    need_unreachable: bool,
}

impl Finalization {
    pub fn new() -> Finalization {
        Finalization {
            dl: LinkTable::new(),
            ll: LinkTable::new(),
            fo: FinalizerTable::new(),
            queue: VecDeque::new(),
            nested: 0,
            skipped: 0,
            interrupt_limit: 0,
            need_unreachable: false,
        }
    }

    pub fn set_interrupt_limit(&mut self, limit: usize) {
        self.interrupt_limit = limit;
    }
}

/// Which link table an operation addresses.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Short,
    Long,
}

impl Collector {
    fn link_table(&mut self, which: LinkKind) -> &mut LinkTable {
        match which {
            LinkKind::Short => &mut self.fin.dl,
            LinkKind::Long => &mut self.fin.ll,
        }
    }

    /// Register `link` to be cleared when `obj` becomes unreachable.
    /// `obj` must be an object base; a misaligned slot is rejected.
    pub(crate) fn register_link_inner(
        &mut self,
        link: Address,
        obj: Address,
        which: LinkKind,
    ) -> Option<LinkStatus> {
        if !link.is_aligned_to(BYTES_IN_WORD) {
            return None;
        }
        if self.base_inner(obj) != Some(obj) {
            return None;
        }
        Some(self.link_table(which).register(link, obj))
    }

    pub(crate) fn unregister_link_inner(&mut self, link: Address, which: LinkKind) -> bool {
        if !link.is_aligned_to(BYTES_IN_WORD) {
            return false;
        }
        self.link_table(which).unregister(link)
    }

    pub(crate) fn move_link_inner(
        &mut self,
        link: Address,
        new_link: Address,
        which: LinkKind,
    ) -> MoveStatus {
        if !new_link.is_aligned_to(BYTES_IN_WORD) || !link.is_aligned_to(BYTES_IN_WORD) {
            return MoveStatus::NotFound;
        }
        self.link_table(which).move_link(link, new_link)
    }

    /// Register (or with `func` = None, remove) a finalizer for the object
    /// at base `obj`.  Returns the previously registered pair, if any.
    pub(crate) fn register_finalizer_inner(
        &mut self,
        obj: Address,
        func: Option<(FinalizerFn, usize)>,
        mark: FinalizeMark,
    ) -> Option<(FinalizerFn, usize)> {
        if self.base_inner(obj) != Some(obj) {
            return None;
        }
        if mark == FinalizeMark::Unreachable {
            self.fin.need_unreachable = true;
        }
        let sz = self.size_of_inner(obj);
        let table = &mut self.fin.fo;
        if table.buckets.is_empty() || table.entries > (1 << table.log_size) {
            table.grow();
        }
        let h = table_hash(obj, table.log_size);
        let hidden_base = HiddenPointer::hide(obj);
        let bucket = &mut table.buckets[h];
        let existing = bucket.iter().position(|fo| fo.hidden_base == hidden_base);
        match (existing, func) {
            (Some(pos), Some((f, cd))) => {
                let old = (bucket[pos].func, bucket[pos].client_data);
                bucket[pos].func = f;
                bucket[pos].client_data = cd;
                bucket[pos].mark = mark;
                Some(old)
            }
            (Some(pos), None) => {
                let old = bucket.swap_remove(pos);
                table.entries -= 1;
                Some((old.func, old.client_data))
            }
            (None, Some((f, cd))) => {
                bucket.push(FinalizableEntry {
                    hidden_base,
                    func: f,
                    client_data: cd,
                    sz,
                    mark,
                });
                table.entries += 1;
                None
            }
            (None, None) => None,
        }
    }

    /// Run one finalization-ordering mark procedure from `base` and drain
    /// whatever it pushed.  Does not mark `base` itself.
    fn mark_fo(&mut self, base: Address, mark: FinalizeMark) {
        let sz = self.size_of_inner(base);
        match mark {
            FinalizeMark::Normal | FinalizeMark::Unreachable => {
                let kind = match self.headers.base_block(base) {
                    Some((_, id)) => self.headers.header(id).kind,
                    None => return,
                };
                self.push_obj_contents(base, sz, kind);
            }
            FinalizeMark::IgnoreSelf => {
                let end = base + words_to_bytes(sz);
                self.scan_range_excluding(base, end, PointerOrigin::Normal, Some((base, end)));
            }
            FinalizeMark::NoOrder => {}
        }
        self.drain_with_remark();
    }

    /// Null the slot of every link whose object is unmarked, dropping the
    /// entry.  With `dangling` set, instead drop (without nulling) entries
    /// whose slot itself lies inside an unmarked object, so the clearing
    /// store can never land in a page about to be reclaimed.
    fn make_links_disappear(&mut self, which: LinkKind, dangling: bool) {
        let nbuckets = match which {
            LinkKind::Short => self.fin.dl.buckets.len(),
            LinkKind::Long => self.fin.ll.buckets.len(),
        };
        for i in 0..nbuckets {
            let mut kept = Vec::new();
            let drained: Vec<DisappearingLink> = {
                let table = self.link_table(which);
                std::mem::take(&mut table.buckets[i])
            };
            let mut removed = 0;
            for dl in drained {
                if dangling {
                    let slot = dl.hidden_link.reveal();
                    let slot_base = self.base_inner(slot);
                    match slot_base {
                        Some(b) if !self.is_marked(b) => {
                            removed += 1;
                            continue;
                        }
                        _ => kept.push(dl),
                    }
                } else if self.is_marked(dl.hidden_obj.reveal()) {
                    kept.push(dl);
                } else {
                    let slot = dl.hidden_link.reveal();
                    unsafe {
                        slot.store(Address::ZERO);
                    }
                    removed += 1;
                }
            }
            let table = self.link_table(which);
            table.buckets[i] = kept;
            table.entries -= removed;
        }
    }

    /// The per-cycle finalization step: runs after user marking completes
    /// and before sweeping.
    pub(crate) fn finalize(&mut self) {
        // 1. Clear short links to dead objects.
        self.make_links_disappear(LinkKind::Short, false);

        // 2. Mark everything reachable via chains of one or more pointers
        // from finalizable objects, without marking the objects themselves.
        let candidates: Vec<(Address, FinalizeMark)> = self
            .fin
            .fo
            .buckets
            .iter()
            .flatten()
            .map(|fo| (fo.hidden_base.reveal(), fo.mark))
            .collect();
        for (base, mark) in candidates {
            if !self.is_marked(base) {
                self.mark_fo(base, mark);
                if self.is_marked(base) {
                    warn!("finalization cycle involving {}", base);
                }
            }
        }

        // 3. Enqueue everything still unreachable, revealing the base so
        // later cycles see it.
        let java = *self.options.java_finalization;
        for i in 0..self.fin.fo.buckets.len() {
            let bucket = std::mem::take(&mut self.fin.fo.buckets[i]);
            let mut kept = Vec::new();
            for fo in bucket {
                let base = fo.hidden_base.reveal();
                if self.is_marked(base) {
                    kept.push(fo);
                    continue;
                }
                if !java {
                    // Protect the contents through the coming sweep.
                    self.set_mark_bit(base);
                }
                self.fin.fo.entries -= 1;
                self.fin.queue.push_back(ReadyFinalizer {
                    base,
                    func: fo.func,
                    client_data: fo.client_data,
                    sz: fo.sz,
                    mark: fo.mark,
                });
            }
            self.fin.fo.buckets[i] = kept;
        }

        if java {
            // Everything reachable from a queued object must be safe to
            // touch during finalization.
            let queued: Vec<(Address, FinalizeMark)> = self
                .fin
                .queue
                .iter()
                .map(|r| (r.base, r.mark))
                .collect();
            for (base, mark) in queued {
                if !self.is_marked(base) {
                    if mark == FinalizeMark::NoOrder {
                        self.mark_fo(base, FinalizeMark::Normal);
                    }
                    if mark != FinalizeMark::Unreachable {
                        self.set_mark_bit(base);
                    }
                }
            }
            // Revive unreachable-kind objects that became reachable from
            // other queued finalizers: they go back in the registry.
            if self.fin.need_unreachable {
                let mut requeue = VecDeque::new();
                while let Some(r) = self.fin.queue.pop_front() {
                    if r.mark != FinalizeMark::Unreachable {
                        requeue.push_back(r);
                        continue;
                    }
                    if !self.is_marked(r.base) {
                        self.set_mark_bit(r.base);
                        requeue.push_back(r);
                    } else {
                        self.register_finalizer_inner(
                            r.base,
                            Some((r.func, r.client_data)),
                            FinalizeMark::Unreachable,
                        );
                    }
                }
                self.fin.queue = requeue;
            }
        }

        // 4. Drop links whose slots are themselves about to be reclaimed.
        self.make_links_disappear(LinkKind::Short, true);

        // Long links disappear only now, after enqueueing.
        self.make_links_disappear(LinkKind::Long, false);
        self.make_links_disappear(LinkKind::Long, true);
    }

    /// Root contribution of the finalize-now queue: everything on it, and
    /// everything reachable from it, survives until invocation.
    pub(crate) fn push_finalize_queue(&mut self) {
        let queued: Vec<(Address, usize)> = self
            .fin
            .queue
            .iter()
            .map(|r| (r.base, r.sz))
            .collect();
        for (base, sz) in queued {
            self.set_mark_bit(base);
            let kind = match self.headers.base_block(base) {
                Some((_, id)) => self.headers.header(id).kind,
                None => continue,
            };
            self.push_obj_contents(base, sz, kind);
        }
    }

    /// Is it worth calling `invoke_finalizers`?
    pub(crate) fn should_invoke_finalizers(&self) -> bool {
        !self.fin.queue.is_empty()
    }

    /// Move every registered finalizer to the queue, marking the objects and
    /// their closures live first.
    pub(crate) fn enqueue_all_finalizers(&mut self) {
        for i in 0..self.fin.fo.buckets.len() {
            let bucket = std::mem::take(&mut self.fin.fo.buckets[i]);
            for fo in bucket {
                let base = fo.hidden_base.reveal();
                self.mark_fo(base, FinalizeMark::Normal);
                self.set_mark_bit(base);
                self.fin.fo.entries -= 1;
                self.fin.queue.push_back(ReadyFinalizer {
                    base,
                    func: fo.func,
                    client_data: fo.client_data,
                    sz: fo.sz,
                    mark: fo.mark,
                });
            }
        }
    }

    pub(crate) fn finalizer_entries(&self) -> usize {
        self.fin.fo.entries
    }

    /// Pop the next ready finalizer, honoring the per-invocation cap.
    pub(crate) fn next_ready_finalizer(
        &mut self,
        already_run: usize,
    ) -> Option<(FinalizerFn, Address, usize)> {
        if self.fin.interrupt_limit != 0 && already_run >= self.fin.interrupt_limit {
            return None;
        }
        self.fin
            .queue
            .pop_front()
            .map(|r| (r.func, r.base, r.client_data))
    }

    /// Decide whether an automatic (allocation-triggered) invocation should
    /// proceed, with exponential backoff while nested.
    pub(crate) fn check_finalizer_nested(&mut self) -> bool {
        let nesting = self.fin.nested;
        if nesting > 0 {
            self.fin.skipped += 1;
            if self.fin.skipped < (1 << nesting.min(31)) {
                return false;
            }
            self.fin.skipped = 0;
        }
        self.fin.nested = nesting + 1;
        true
    }

    pub(crate) fn reset_finalizer_nested(&mut self) {
        self.fin.nested = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(x: usize) -> Address {
        Address::from_usize(x)
    }

    #[test]
    fn link_table_register_unregister_round_trip() {
        let mut t = LinkTable::new();
        assert_eq!(t.register(addr(0x1000), addr(0x2000)), LinkStatus::Registered);
        assert_eq!(t.entries, 1);
        // Duplicate updates the object.
        assert_eq!(t.register(addr(0x1000), addr(0x3000)), LinkStatus::Duplicate);
        assert_eq!(t.entries, 1);
        assert!(t.unregister(addr(0x1000)));
        assert_eq!(t.entries, 0);
        assert!(!t.unregister(addr(0x1000)));
    }

    #[test]
    fn link_table_grows_and_keeps_entries() {
        let mut t = LinkTable::new();
        for i in 0..100 {
            assert_eq!(
                t.register(addr(0x1000 + i * 8), addr(0x100000)),
                LinkStatus::Registered
            );
        }
        assert_eq!(t.entries, 100);
        for i in 0..100 {
            assert!(t.unregister(addr(0x1000 + i * 8)), "lost entry {}", i);
        }
        assert_eq!(t.entries, 0);
    }

    #[test]
    fn move_link_statuses() {
        let mut t = LinkTable::new();
        t.register(addr(0x1000), addr(0x9000));
        t.register(addr(0x2000), addr(0x9000));
        assert_eq!(t.move_link(addr(0x5000), addr(0x6000)), MoveStatus::NotFound);
        assert_eq!(t.move_link(addr(0x1000), addr(0x1000)), MoveStatus::Unchanged);
        assert_eq!(t.move_link(addr(0x1000), addr(0x2000)), MoveStatus::Duplicate);
        assert_eq!(t.move_link(addr(0x1000), addr(0x4000)), MoveStatus::Moved);
        assert!(t.unregister(addr(0x4000)));
        assert!(!t.unregister(addr(0x1000)));
    }
}
