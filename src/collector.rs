//! The process-wide collector state and the collection controller.
//!
//! Every table and counter lives in one owned [`Collector`] value behind a
//! single signal-blocking critical section, so the mark phase can skip the
//! collector's own memory with one excluded range and the lock brackets all
//! mutation observed by a cycle.

use crate::alloc::SizeMap;
use crate::blacklist::BlackLists;
use crate::finalize::Finalization;
use crate::heap::headers::HeaderIndex;
use crate::kind::{KindTable, UNCOLLECTABLE};
use crate::mark::MarkState;
use crate::options::Options;
use crate::roots::RootSet;
use crate::util::constants::*;
use crate::util::conversions::*;
use crate::util::stack::{approx_sp, HostStack, StackDiscovery};
use crate::util::sync::{CriticalGuard, CriticalSection};
use crate::util::{memory, Address};

/// Abandon ship.  The collector is a library and does not unwind; conditions
/// the design treats as fatal terminate the process.
pub(crate) fn fatal_error(msg: &str) -> ! {
    error!("{}", msg);
    std::process::abort();
}

pub struct Collector {
    pub(crate) headers: HeaderIndex,
    pub(crate) obj_maps: crate::heap::obj_map::ObjMaps,
    pub(crate) kinds: KindTable,
    pub(crate) size_map: SizeMap,
    pub(crate) black: BlackLists,
    pub(crate) roots: RootSet,
    pub(crate) mark: MarkState,
    pub(crate) fin: Finalization,
    pub(crate) options: Options,
    pub(crate) stack: Box<dyn StackDiscovery>,

    /// Head of the address-sorted list of free heap blocks.
    pub(crate) hblk_free_list: Address,
    /// Block preceding the next one the block allocator will examine; the
    /// round-robin first-fit cursor.  Zero restarts from the list head.
    pub(crate) cursor: Address,
    /// Counter driving the drop-a-blacklisted-block policy.
    pub(crate) drop_count: u32,

    /// Total bytes ever added to the heap.
    pub(crate) heapsize: usize,
    /// Next heap increment, in blocks.  Doubles up to the configured cap.
    pub(crate) hincr: usize,
    pub(crate) least_plausible_heap_addr: Address,
    pub(crate) greatest_plausible_heap_addr: Address,
    pub(crate) last_heap_addr: Address,
    pub(crate) prev_heap_addr: Address,

    /// Collection number.  Bumped at the start of every cycle.
    pub(crate) gc_no: usize,
    /// Words allocated since the last collection.
    pub(crate) words_allocd: usize,
    pub(crate) words_allocd_before_gc: usize,
    /// Words explicitly deallocated since the last collection.
    pub(crate) mem_freed: usize,
    /// Words found reclaimable during the current cycle.
    pub(crate) mem_found: isize,
    /// Bytes of storage under explicit management (uncollectable objects).
    pub(crate) non_gc_bytes: usize,
    pub(crate) non_gc_bytes_at_gc: usize,

    pub(crate) dont_gc: bool,
    pub(crate) dont_expand: bool,
    /// Consecutive refill failures, for the out-of-memory policy.
    pub(crate) fail_count: usize,

    // Stack-clearing policy state (see `clear_stack`).
    pub(crate) stack_last_cleared: usize,
    pub(crate) min_sp: Address,
    pub(crate) high_water: Address,
    pub(crate) words_allocd_at_reset: usize,

    pub(crate) initialized: bool,
}

lazy_static! {
    static ref GC: CriticalSection<Collector> = CriticalSection::new(Collector::new());
}

/// Enter the allocator critical section.
pub(crate) fn gc() -> CriticalGuard<'static, Collector> {
    GC.enter()
}

impl Collector {
    pub(crate) fn new() -> Collector {
        Collector {
            headers: HeaderIndex::new(),
            obj_maps: crate::heap::obj_map::ObjMaps::new(false),
            kinds: KindTable::new(),
            size_map: SizeMap::new(),
            black: BlackLists::new(),
            roots: RootSet::new(),
            mark: MarkState::new(),
            fin: Finalization::new(),
            options: Options::default(),
            stack: Box::new(HostStack::with_bottom(Address::ZERO)),
            hblk_free_list: Address::ZERO,
            cursor: Address::ZERO,
            drop_count: 0,
            heapsize: 0,
            hincr: MINHINCR,
            least_plausible_heap_addr: Address::MAX,
            greatest_plausible_heap_addr: Address::ZERO,
            last_heap_addr: Address::ZERO,
            prev_heap_addr: Address::ZERO,
            gc_no: 0,
            words_allocd: 0,
            words_allocd_before_gc: 0,
            mem_freed: 0,
            mem_found: 0,
            non_gc_bytes: 0,
            non_gc_bytes_at_gc: 0,
            dont_gc: false,
            dont_expand: false,
            fail_count: 0,
            stack_last_cleared: 0,
            min_sp: Address::ZERO,
            high_water: Address::ZERO,
            words_allocd_at_reset: 0,
            initialized: false,
        }
    }

    /// One-time initialization.  Idempotent; called from every public entry
    /// point.  `stack` overrides the default stack discovery when supplied.
    pub(crate) fn init_inner(&mut self, stack: Option<Box<dyn StackDiscovery>>) {
        if self.initialized {
            return;
        }
        crate::util::logger::try_init();
        self.options = Options::from_env();
        self.dont_gc = *self.options.dont_gc;
        self.dont_expand = *self.options.dont_expand;
        self.obj_maps = crate::heap::obj_map::ObjMaps::new(*self.options.all_interior_pointers);
        self.stack = stack.unwrap_or_else(|| Box::new(HostStack::for_current_thread()));

        // The design assumes downward stack growth on every supported target.
        let sp = approx_sp();
        let bottom = self.stack.stack_bottom();
        if sp >= bottom {
            error!("sp = {}, stack bottom = {}", sp, bottom);
            fatal_error("stack appears to grow upward");
        }

        // The collector's own state is not a root.
        let begin = Address::from_ref(self);
        self.roots
            .set_excluded(begin, begin + std::mem::size_of::<Collector>());

        self.initialized = true;
        let initial = *self.options.initial_heap_blocks;
        if !self.expand_hp_inner(initial) {
            fatal_error("can't start up: not enough memory");
        }
        // Preallocate the large-object map; failure is inconvenient later.
        self.obj_maps.add_map_entry(MAXOBJSZ + 1);
        self.obj_maps.register_displacement(0);
        self.size_map.init(self.obj_maps.all_interior());
        debug!(
            "collector initialized with {} blocks, block size {}",
            initial, HBLKSIZE
        );
    }

    /// Halt mutator threads at safe points.  A no-op in the single-threaded
    /// core; a threaded embedding supplies real suspension behind the same
    /// contract: no mutator runs between `stop_world` and `start_world`.
    pub(crate) fn stop_world(&mut self) {}

    /// Resume mutator threads.
    pub(crate) fn start_world(&mut self) {}

    /// Minimum words that must be allocated between collections to amortize
    /// the collection cost.  The stack counts double: it is expensive to
    /// scan relative to its size.
    pub(crate) fn min_words_allocd(&self) -> usize {
        let sp = approx_sp();
        let bottom = self.stack.stack_bottom();
        let stack_size = if bottom > sp { bottom - sp } else { sp - bottom };
        let total_root_size = 2 * stack_size + self.roots.root_size;
        bytes_to_words(self.heapsize + total_root_size) / *self.options.free_space_divisor
    }

    /// Words allocated since the last cycle, adjusted for explicit storage
    /// management, with a floor of one eighth of the raw count so collection
    /// never becomes arbitrarily rare.
    pub(crate) fn adj_words_allocd(&self) -> usize {
        let expl_managed =
            bytes_to_words(self.non_gc_bytes.wrapping_sub(self.non_gc_bytes_at_gc)) as isize;
        let mut result = self.words_allocd as isize - self.mem_freed as isize - expl_managed;
        if result > self.words_allocd as isize {
            // Probably a client accounting bug or unfortunate scheduling.
            result = self.words_allocd as isize;
        }
        if result < (self.words_allocd >> 2) as isize {
            self.words_allocd >> 3
        } else {
            result as usize
        }
    }

    /// Run a full collection cycle.  With `force` false the trigger policy
    /// may decline (returning false) when too little has been allocated to
    /// merit the cost; the caller then grows the heap instead.
    pub(crate) fn gcollect_inner(&mut self, force: bool) -> bool {
        if !force && !self.dont_expand && self.adj_words_allocd() < self.min_words_allocd() {
            return false;
        }

        self.gc_no += 1;
        if *self.options.print_stats {
            info!(
                "collection {} after {} allocated bytes (heapsize = {} bytes)",
                self.gc_no,
                words_to_bytes(self.words_allocd),
                self.heapsize
            );
        } else {
            debug!(
                "collection {} after {} allocated bytes (heapsize = {} bytes)",
                self.gc_no,
                words_to_bytes(self.words_allocd),
                self.heapsize
            );
        }
        self.mem_found = 0;

        self.clear_marks();
        self.stop_world();
        self.mark_roots();
        self.black.promote();
        self.start_world();

        self.finalize();
        self.clear_free_list_marks();
        self.start_reclaim();

        if *self.options.print_stats {
            info!(
                "collection {} immediately reclaimed {} bytes ({} words allocated over the program's life)",
                self.gc_no,
                words_to_bytes(self.mem_found.max(0) as usize),
                self.words_allocd_before_gc + self.words_allocd
            );
            self.log_hblk_free_list();
        }

        self.words_allocd_before_gc += self.words_allocd;
        self.non_gc_bytes_at_gc = self.non_gc_bytes;
        self.words_allocd = 0;
        self.mem_freed = 0;
        true
    }

    /// Try to make `needed_blocks` blocks available: collect if the trigger
    /// allows, otherwise (or additionally, on allocation pressure) expand.
    pub(crate) fn collect_or_expand(&mut self, needed_blocks: usize) {
        if self.dont_gc || !self.gcollect_inner(false) {
            let expanded = !self.dont_expand
                && (self.expand_hp_inner(self.hincr + needed_blocks)
                    || self.expand_hp_inner(needed_blocks));
            if !expanded {
                self.fail_count += 1;
                if self.fail_count <= *self.options.max_retries {
                    warn!("out of memory: trying to continue");
                    self.gcollect_inner(true);
                } else {
                    fatal_error("out of memory: giving up");
                }
            } else {
                self.fail_count = 0;
                self.hincr = (self.hincr * 2).min(*self.options.max_heap_increment);
            }
        }
    }

    /// Grow the heap by `n` blocks.  Returns false if the OS refuses.
    pub(crate) fn expand_hp_inner(&mut self, n: usize) -> bool {
        let bytes = blocks_to_bytes(n);
        if n > 2 * self.hincr {
            self.hincr = n / 2;
        }
        let space = match memory::get_mem(bytes) {
            Some(s) => s,
            None => return false,
        };
        info!("increasing heap size by {} bytes", bytes);

        // Pre-authorize future extensions in the inferred growth direction so
        // plausibility checks stay valid without re-scanning headers.
        let mut expansion_slop = 8 * words_to_bytes(self.min_words_allocd());
        if 5 * HBLKSIZE * MAXHINCR > expansion_slop {
            expansion_slop = 5 * HBLKSIZE * MAXHINCR;
        }
        let high_bit = 1usize << (BITS_IN_WORD - 1);
        let growing_up = if self.last_heap_addr.is_zero() {
            space.as_usize() & high_bit == 0
        } else {
            self.last_heap_addr < space
        };
        if growing_up {
            let limit = Address::from_usize(
                (space + bytes).as_usize().saturating_add(expansion_slop),
            );
            if limit > self.greatest_plausible_heap_addr {
                self.greatest_plausible_heap_addr = limit;
            }
        } else {
            let limit =
                Address::from_usize(space.as_usize().saturating_sub(expansion_slop));
            if limit < self.least_plausible_heap_addr {
                self.least_plausible_heap_addr = limit;
            }
        }
        self.prev_heap_addr = self.last_heap_addr;
        self.last_heap_addr = space;
        trace!(
            "heap segments now end at {} (previously {})",
            self.last_heap_addr,
            self.prev_heap_addr
        );
        self.add_to_heap(space, bytes);
        true
    }

    /// Use the chunk starting at `p` of `bytes` bytes as part of the heap.
    /// `p` is block aligned and `bytes` a block multiple.
    pub(crate) fn add_to_heap(&mut self, p: Address, bytes: usize) {
        debug_assert!(p.is_aligned_to(HBLKSIZE));
        debug_assert!(bytes % HBLKSIZE == 0);
        let id = self.headers.install_header(p);
        self.headers.header_mut(id).sz = bytes_to_words(bytes);
        self.free_hblk(p);
        self.heapsize += bytes;
        if p <= self.least_plausible_heap_addr {
            // A little smaller than necessary, so the bounds variable itself
            // never produces a false hit.
            self.least_plausible_heap_addr = p - BYTES_IN_WORD;
        }
        if p + bytes >= self.greatest_plausible_heap_addr {
            self.greatest_plausible_heap_addr = p + bytes;
        }
    }

    /// Clear mark bits in every collectable block.  Uncollectable objects
    /// keep their bits: they are marked at allocation and act as root
    /// sources until explicitly freed.
    pub(crate) fn clear_marks(&mut self) {
        for (_, id) in self.headers.all_blocks() {
            if self.headers.header(id).kind != UNCOLLECTABLE {
                self.headers.header_mut(id).clear_marks();
            }
        }
    }

    /// Current heap size in bytes.
    pub(crate) fn heap_size(&self) -> usize {
        self.heapsize
    }

    // Stack-clearing policy.  Bogus pointer-like words can survive in holes
    // of dead stack frames for a long time; periodically zeroing the dead
    // zone below the stack pointer bounds how long they pin garbage.

    const CLEAR_SIZE: usize = 213;
    const DEGRADE_RATE: usize = 50;
    const SLOP: usize = 400;
    const STACK_SLOP: usize = 4000;
    const CLEAR_THRESHOLD: usize = 100_000;

    /// Clear some of the inaccessible stack below the current frame.
    pub(crate) fn clear_stack(&mut self) {
        let sp = approx_sp();
        if self.gc_no > self.stack_last_cleared {
            // Start over: clear the entire dead zone again this cycle.
            if self.stack_last_cleared == 0 {
                self.high_water = self.stack.stack_bottom();
            }
            self.min_sp = self.high_water;
            self.stack_last_cleared = self.gc_no;
            self.words_allocd_at_reset = self.words_allocd;
        }
        // Degrade the high-water mark, then pull it back to the hottest
        // point seen, with slop for collector noise above this frame.
        self.high_water = Address::from_usize(
            self.high_water
                .as_usize()
                .saturating_add(words_to_bytes(Self::DEGRADE_RATE) + Self::STACK_SLOP),
        );
        if sp < self.high_water {
            self.high_water = sp;
        }
        self.high_water = Address::from_usize(
            self.high_water.as_usize().saturating_sub(Self::STACK_SLOP),
        );
        // Wrapping on purpose: a still-unset min_sp of zero must produce a
        // limit no stack address ever exceeds.
        let limit = Address::from_usize(self.min_sp.as_usize().wrapping_sub(Self::SLOP));
        if sp > limit {
            let limit = limit.align_down(16);
            self.min_sp = sp;
            clear_stack_inner(limit);
        } else if words_to_bytes(self.words_allocd - self.words_allocd_at_reset)
            > Self::CLEAR_THRESHOLD
        {
            // Restart the clearing process, but bound the work: heavily
            // recursive programs with sparse stacks would otherwise regrow
            // the heap without bound.
            self.min_sp = Address::from_usize(
                sp.as_usize().saturating_sub(Self::CLEAR_THRESHOLD / 4),
            );
            if self.min_sp < self.high_water {
                self.min_sp = self.high_water;
            }
            self.words_allocd_at_reset = self.words_allocd;
        }
    }
}

/// Zero dead stack down to about `limit` by recursing through zeroed frames.
#[inline(never)]
fn clear_stack_inner(limit: Address) {
    let mut dummy = [0usize; Collector::CLEAR_SIZE];
    // Keep the frame and its zeroing alive.
    std::hint::black_box(&mut dummy);
    if Address::from_ref(&dummy) > limit {
        clear_stack_inner(limit);
    }
    std::hint::black_box(&dummy);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adj_words_allocd_floor() {
        let mut c = Collector::new();
        c.words_allocd = 800;
        c.mem_freed = 790;
        // Nearly everything was explicitly freed: still count 1/8.
        assert_eq!(c.adj_words_allocd(), 100);
        c.mem_freed = 100;
        assert_eq!(c.adj_words_allocd(), 700);
        // Freed more than allocated (client bug): clamp at the raw count's
        // floor rather than going negative.
        c.mem_freed = 10_000;
        assert_eq!(c.adj_words_allocd(), 100);
    }

    #[test]
    fn hincr_adapts_to_large_requests() {
        let mut c = Collector::new();
        assert_eq!(c.hincr, MINHINCR);
        // A request much larger than the increment raises the increment.
        let n = 100;
        if n > 2 * c.hincr {
            c.hincr = n / 2;
        }
        assert_eq!(c.hincr, 50);
    }
}
