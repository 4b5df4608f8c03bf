//! The public allocation and finalization interface.
//!
//! Every entry point acquires the process-wide critical section, initializes
//! the collector on first use, and delegates to the inner routines.  Any
//! allocation may trigger a full collection.  Finalizers themselves are
//! always invoked with the lock released, so they may allocate freely.

use crate::alloc::FreeListChain;
use crate::collector::gc;
use crate::finalize::{FinalizeMark, FinalizerFn, LinkKind, LinkStatus, MoveStatus};
use crate::kind::{NORMAL, PTRFREE};
use crate::util::constants::{BYTES_IN_WORD, HBLKSIZE};
use crate::util::conversions::words_to_bytes;
use crate::util::stack::StackDiscovery;
use crate::util::Address;

/// Errors surfaced by the POSIX-style aligned allocation entry point.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AlignError {
    /// Alignment is not a power of two, or not a multiple of the word size.
    BadAlignment,
}

/// Initialize the collector.  Idempotent.  Optional: every entry point
/// initializes on first use, but the stack bottom is captured here, so call
/// this near the top of the thread that owns the mutator stack.
pub fn init() {
    gc().init_inner(None);
}

/// Initialize with an explicit stack discovery implementation.
pub fn init_with_stack(stack: Box<dyn StackDiscovery>) {
    gc().init_inner(Some(stack));
}

fn alloc_entry(bytes: usize, kind: u8) -> Address {
    let result = {
        let mut gc = gc();
        gc.init_inner(None);
        let op = gc.generic_malloc_inner(bytes, kind);
        gc.clear_stack();
        op
    };
    maybe_invoke_finalizers();
    result
}

/// Allocate `bytes` of zeroed, conservatively scanned storage.
pub fn malloc(bytes: usize) -> Address {
    alloc_entry(bytes, NORMAL)
}

/// Allocate `bytes` of pointer-free storage.  Never scanned; contents are
/// not cleared.
pub fn malloc_atomic(bytes: usize) -> Address {
    alloc_entry(bytes, PTRFREE)
}

/// Allocate storage that is scanned for pointers but never reclaimed by the
/// collector; release it with [`free`].
pub fn malloc_uncollectable(bytes: usize) -> Address {
    let result = {
        let mut gc = gc();
        gc.init_inner(None);
        let op = gc.malloc_uncollectable_inner(bytes);
        gc.clear_stack();
        op
    };
    maybe_invoke_finalizers();
    result
}

/// Obtain an entire free list of objects of the class covering `bytes`,
/// under a single lock acquisition.
pub fn malloc_many(bytes: usize) -> FreeListChain {
    let result = {
        let mut gc = gc();
        gc.init_inner(None);
        gc.malloc_many_inner(bytes, NORMAL)
    };
    maybe_invoke_finalizers();
    result
}

/// Explicitly deallocate `p`.  Optional; unknown and null pointers are
/// ignored, preserving C `free` manners.
pub fn free(p: Address) {
    let mut gc = gc();
    gc.init_inner(None);
    gc.free_inner(p);
}

/// Resize the object at `p`.  Null `p` allocates; zero `bytes` frees.
/// Shrinks in place when the current storage suffices.
pub fn realloc(p: Address, bytes: usize) -> Address {
    if p.is_zero() {
        return malloc(bytes);
    }
    if bytes == 0 {
        free(p);
        return Address::ZERO;
    }
    let result = {
        let mut gc = gc();
        gc.init_inner(None);
        gc.realloc_inner(p, bytes)
    };
    maybe_invoke_finalizers();
    result
}

/// Allocate `bytes` whose address is a multiple of `align`.
pub fn memalign(align: usize, bytes: usize) -> Address {
    let result = {
        let mut gc = gc();
        gc.init_inner(None);
        gc.memalign_inner(align, bytes, NORMAL)
    };
    maybe_invoke_finalizers();
    result
}

/// POSIX-style aligned allocation: the alignment must be a power of two and
/// a multiple of the word size.
pub fn posix_memalign(align: usize, bytes: usize) -> Result<Address, AlignError> {
    if !align.is_power_of_two() || align % BYTES_IN_WORD != 0 {
        return Err(AlignError::BadAlignment);
    }
    Ok(memalign(align, bytes))
}

/// Page-aligned allocation.
pub fn valloc(bytes: usize) -> Address {
    memalign(HBLKSIZE, bytes)
}

/// Page-aligned allocation rounded up to a whole number of pages.
pub fn pvalloc(bytes: usize) -> Address {
    memalign(HBLKSIZE, crate::util::conversions::raw_align_up_hblk(bytes))
}

/// Base pointer of the object containing `p`, or `None` if `p` does not
/// point into the heap.
pub fn base(p: Address) -> Option<Address> {
    let gc = gc();
    gc.base_inner(p)
}

/// Size in bytes of the object with base `p`; zero for foreign pointers.
pub fn size(p: Address) -> usize {
    let gc = gc();
    words_to_bytes(gc.size_of_inner(p))
}

/// Force a full collection.
pub fn gcollect() {
    {
        let mut gc = gc();
        gc.init_inner(None);
        gc.gcollect_inner(true);
    }
    maybe_invoke_finalizers();
}

/// Pre-grow the heap by `n` heap blocks.  Returns false if the OS refused.
pub fn expand_hp(n: usize) -> bool {
    let mut gc = gc();
    gc.init_inner(None);
    gc.expand_hp_inner(n)
}

/// Declare pointers `offset` bytes past an object base to be valid
/// references to the object.
pub fn register_displacement(offset: usize) {
    let mut gc = gc();
    gc.init_inner(None);
    if !gc.obj_maps.register_displacement(offset) {
        drop(gc);
        crate::collector::fatal_error("bad argument to register_displacement");
    }
}

/// Register [start, end) as a static root range.
pub fn add_roots(start: Address, end: Address) {
    let mut gc = gc();
    gc.init_inner(None);
    if !gc.roots.add(start, end) {
        drop(gc);
        crate::collector::fatal_error("too many root sets");
    }
}

/// Drop every registered static root range.
pub fn clear_roots() {
    let mut gc = gc();
    gc.init_inner(None);
    gc.roots.clear();
}

/// Current heap size in bytes.
pub fn heap_size() -> usize {
    gc().heap_size()
}

/// Number of completed collections.
pub fn gc_no() -> usize {
    gc().gc_no
}

/// Inhibit or re-enable collection.
pub fn set_dont_gc(value: bool) {
    gc().dont_gc = value;
}

/// Inhibit or re-enable heap expansion.
pub fn set_dont_expand(value: bool) {
    gc().dont_expand = value;
}

/// Has the collector been initialized?
pub fn is_initialized() -> bool {
    gc().initialized
}

/// Refill failures tolerated before out-of-memory becomes fatal.
pub fn set_max_retries(n: usize) {
    gc().options.max_retries.set(n);
}

/// Enable Java-style finalization: everything reachable from a queued
/// finalizable object is kept safe to access during finalization.
pub fn set_java_finalization(value: bool) {
    gc().options.java_finalization.set(value);
}

// Finalization interface.

fn register_finalizer_with_mark(
    obj: Address,
    func: Option<(FinalizerFn, usize)>,
    mark: FinalizeMark,
) -> Option<(FinalizerFn, usize)> {
    let mut gc = gc();
    gc.init_inner(None);
    gc.register_finalizer_inner(obj, func, mark)
}

/// Register `func` to run (with `client_data`) after `obj` becomes
/// unreachable.  Objects reachable from `obj` are finalized in a later
/// cycle.  Returns the previously registered pair, which is replaced.
/// Passing `None` removes any registration.
pub fn register_finalizer(
    obj: Address,
    func: Option<(FinalizerFn, usize)>,
) -> Option<(FinalizerFn, usize)> {
    register_finalizer_with_mark(obj, func, FinalizeMark::Normal)
}

/// Like [`register_finalizer`], but pointers within `obj`'s own extent
/// impose no ordering; for self-referential structures.
pub fn register_finalizer_ignore_self(
    obj: Address,
    func: Option<(FinalizerFn, usize)>,
) -> Option<(FinalizerFn, usize)> {
    register_finalizer_with_mark(obj, func, FinalizeMark::IgnoreSelf)
}

/// Like [`register_finalizer`] with no ordering at all.
pub fn register_finalizer_no_order(
    obj: Address,
    func: Option<(FinalizerFn, usize)>,
) -> Option<(FinalizerFn, usize)> {
    register_finalizer_with_mark(obj, func, FinalizeMark::NoOrder)
}

/// Like [`register_finalizer`], but `obj` is finalized as soon as it is
/// unreachable from outside the finalizable set, even through chains of
/// other finalizable objects.
pub fn register_finalizer_unreachable(
    obj: Address,
    func: Option<(FinalizerFn, usize)>,
) -> Option<(FinalizerFn, usize)> {
    register_finalizer_with_mark(obj, func, FinalizeMark::Unreachable)
}

/// Register the word at `slot` to be cleared when the object containing the
/// slot becomes unreachable.
pub fn register_disappearing_link(slot: Address) -> Option<LinkStatus> {
    let mut gc = gc();
    gc.init_inner(None);
    let obj = gc.base_inner(slot)?;
    gc.register_link_inner(slot, obj, LinkKind::Short)
}

/// Register the word at `slot` to be cleared when `obj` becomes
/// unreachable.  `obj` must be an object base.
pub fn general_register_disappearing_link(slot: Address, obj: Address) -> Option<LinkStatus> {
    let mut gc = gc();
    gc.init_inner(None);
    gc.register_link_inner(slot, obj, LinkKind::Short)
}

/// Remove a disappearing-link registration.
pub fn unregister_disappearing_link(slot: Address) -> bool {
    gc().unregister_link_inner(slot, LinkKind::Short)
}

/// Transfer a registration to a new slot.
pub fn move_disappearing_link(slot: Address, new_slot: Address) -> MoveStatus {
    gc().move_link_inner(slot, new_slot, LinkKind::Short)
}

/// Long-link variants: identical, except the slot is cleared after the
/// referent is enqueued for finalization rather than before.
pub fn register_long_link(slot: Address, obj: Address) -> Option<LinkStatus> {
    let mut gc = gc();
    gc.init_inner(None);
    gc.register_link_inner(slot, obj, LinkKind::Long)
}

pub fn unregister_long_link(slot: Address) -> bool {
    gc().unregister_link_inner(slot, LinkKind::Long)
}

pub fn move_long_link(slot: Address, new_slot: Address) -> MoveStatus {
    gc().move_link_inner(slot, new_slot, LinkKind::Long)
}

/// Is the finalize-now queue nonempty?
pub fn should_invoke_finalizers() -> bool {
    gc().should_invoke_finalizers()
}

/// Cap the number of finalizers run per invocation; zero removes the cap.
pub fn set_interrupt_finalizers(limit: usize) {
    gc().fin.set_interrupt_limit(limit);
}

/// Run pending finalizers, with the allocator lock released around each
/// call.  Returns the number invoked.
pub fn invoke_finalizers() -> usize {
    let mut count = 0;
    loop {
        let next = {
            let mut gc = gc();
            gc.next_ready_finalizer(count)
        };
        match next {
            Some((func, obj, client_data)) => {
                func(obj, client_data);
                count += 1;
            }
            None => break,
        }
    }
    count
}

/// Drain every registered finalizer, running them even for reachable
/// objects.  Finalizers may resurrect state; repeat until the registry is
/// empty.
pub fn finalize_all() {
    loop {
        {
            let mut gc = gc();
            gc.init_inner(None);
            if gc.finalizer_entries() == 0 {
                break;
            }
            gc.enqueue_all_finalizers();
        }
        invoke_finalizers();
    }
}

/// Automatic invocation from allocation sites: skipped entirely in
/// finalize-on-demand mode, and exponentially backed off when a finalizer
/// allocates and re-enters.
fn maybe_invoke_finalizers() {
    let proceed = {
        let mut gc = gc();
        if !gc.initialized
            || *gc.options.finalize_on_demand
            || !gc.should_invoke_finalizers()
        {
            false
        } else {
            gc.check_finalizer_nested()
        }
    };
    if proceed {
        invoke_finalizers();
        gc().reset_finalizer_nested();
    }
}
