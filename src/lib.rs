//! A conservative mark-sweep garbage collector for uncooperative hosts.
//!
//! The collector manages a heap of variably sized, typed blocks and
//! periodically reclaims every block unreachable from a root set discovered
//! without compiler cooperation: registered static ranges, the mutator
//! stack, and a register snapshot are scanned word by word, and anything
//! that looks like a pointer into the heap keeps its target alive.  Clients
//! allocate through `malloc`-style entry points and may simply drop
//! references; explicit [`api::free`] is optional.
//!
//! Logically, the crate divides into:
//! * [`api`]: the public allocation, collection and finalization surface.
//! * [`collector`]: the process-wide state bundle and the collection
//!   controller (trigger policy, heap growth, cycle orchestration).
//! * [`heap`]: block headers and the address index, the block allocator
//!   with its sorted coalescing free list, and the per-size offset maps.
//! * [`mark`], [`blacklist`], [`reclaim`]: the conservative mark phase, the
//!   false-pointer page lists, and deferred sweeping.
//! * [`finalize`]: disappearing links, finalizers and their ordering.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod alloc;
pub mod api;
pub mod blacklist;
pub mod collector;
pub mod finalize;
pub mod heap;
pub mod kind;
pub mod mark;
pub mod options;
pub mod reclaim;
pub mod roots;
pub mod util;

pub use crate::alloc::FreeListChain;
pub use crate::api::*;
pub use crate::finalize::{FinalizeMark, FinalizerFn, LinkStatus, MoveStatus};
pub use crate::util::Address;
