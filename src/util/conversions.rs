use crate::util::constants::*;
use crate::util::Address;

/// Convert a count of words to bytes.
pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

/// Convert a count of bytes to whole words, rounding down.
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes >> LOG_BYTES_IN_WORD
}

/// Round a byte allocation request up to an integral number of words.
/// With interior-pointer recognition enabled every object is padded by one
/// word so that a pointer just past the end still resolves to the object.
pub fn rounded_up_words(bytes: usize, all_interior: bool) -> usize {
    if all_interior {
        bytes_to_words(bytes + words_to_bytes(1))
    } else {
        bytes_to_words(bytes + words_to_bytes(1) - 1)
    }
}

/// Round a byte count up to a multiple of the heap block size.
pub const fn raw_align_up_hblk(bytes: usize) -> usize {
    (bytes + HBLKSIZE - 1) & !HBLKMASK
}

/// Number of heap blocks needed to hold objects of `sz` words.
pub const fn obj_sz_to_blocks(sz: usize) -> usize {
    (words_to_bytes(sz) + HBLKSIZE - 1) >> LOG_HBLKSIZE
}

/// Convert a block count to bytes.
pub const fn blocks_to_bytes(blocks: usize) -> usize {
    blocks << LOG_HBLKSIZE
}

/// Hash of the heap block containing `addr` into a page hash table bucket.
pub fn pht_hash(addr: Address) -> usize {
    (addr.as_usize() >> LOG_HBLKSIZE) & (PHT_ENTRIES - 1)
}
