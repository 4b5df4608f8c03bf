//! Geometry of the collected heap: word sizes, heap-block sizes, and the
//! derived bounds used by the block headers and the page hash tables.

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: usize = 3;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the heap block size in bytes.  Heap blocks are the granularity at
/// which the collector acquires, splits and coalesces memory.
pub const LOG_HBLKSIZE: usize = 12;
/// The heap block size in bytes.  A power of two.
pub const HBLKSIZE: usize = 1 << LOG_HBLKSIZE;
/// Low-bit mask for an address within a heap block.
pub const HBLKMASK: usize = HBLKSIZE - 1;
/// The number of words in a heap block body.
pub const WORDS_IN_HBLK: usize = HBLKSIZE >> LOG_BYTES_IN_WORD;

/// Largest object size, in words, served by the per-size free lists.  Larger
/// objects are allocated as whole runs of heap blocks.
pub const MAXOBJSZ: usize = WORDS_IN_HBLK / 2;

/// One mark bit per word of block body.  Only bits corresponding to the first
/// word of an object are ever consulted.
pub const MARK_BITS_PER_HBLK: usize = WORDS_IN_HBLK;
/// Words of mark bitmap carried by each block header.
pub const MARK_BITS_SZ: usize = (MARK_BITS_PER_HBLK + BITS_IN_WORD - 1) / BITS_IN_WORD;

/// log2 of the number of top-level buckets in the block header index.
pub const LOG_TOP_SZ: usize = 11;
/// Number of top-level buckets in the block header index.
pub const TOP_SZ: usize = 1 << LOG_TOP_SZ;
/// log2 of the number of header slots in one bottom index.
pub const LOG_BOTTOM_SZ: usize = 10;
/// Number of header slots in one bottom index.
pub const BOTTOM_SZ: usize = 1 << LOG_BOTTOM_SZ;
/// Largest forwarding distance, in blocks, stored in an index slot.
pub const MAX_JUMP: usize = HBLKSIZE - 1;

/// log2 of the number of buckets in a page hash table.
pub const LOG_PHT_ENTRIES: usize = 14;
/// Number of buckets in a page hash table.  Collisions become likely once the
/// heap grows past `PHT_ENTRIES` blocks.
pub const PHT_ENTRIES: usize = 1 << LOG_PHT_ENTRIES;
/// Words in a page hash table (one bit per bucket).
pub const PHT_SIZE: usize = PHT_ENTRIES >> LOG_BITS_IN_WORD;

/// Minimum heap increment, in blocks.
pub const MINHINCR: usize = 16;
/// Maximum heap increment, in blocks.
pub const MAXHINCR: usize = 512;

/// Largest request, in bytes, for which a black-listed candidate block is
/// still acceptable.  Must be at least `HBLKSIZE`.
pub const MAX_BLACK_LIST_ALLOC: usize = 2 * HBLKSIZE;

/// Bound on registered static root ranges.
pub const MAX_ROOT_SETS: usize = 64;

/// Initial mark stack capacity, in entries.  Doubled after each overflow.
pub const INITIAL_MARK_STACK_SIZE: usize = 4096;

// The block geometry the rest of the crate is built on.
static_assertions::const_assert!(HBLKSIZE % BYTES_IN_WORD == 0);
static_assertions::const_assert!(MARK_BITS_SZ * BITS_IN_WORD >= MARK_BITS_PER_HBLK);
static_assertions::const_assert!(MAX_BLACK_LIST_ALLOC >= HBLKSIZE);
static_assertions::const_assert!(MAXOBJSZ < WORDS_IN_HBLK);
