//! OS memory acquisition.  The collector obtains heap-block-aligned, zeroed
//! regions directly from the operating system and never returns them.

use crate::util::constants::{HBLKSIZE, LOG_HBLKSIZE};
use crate::util::conversions::raw_align_up_hblk;
use crate::util::Address;

/// Acquire `bytes` of zeroed memory from the OS, aligned to the heap block
/// size.  Returns `None` when the OS refuses more pages.
pub fn get_mem(bytes: usize) -> Option<Address> {
    let bytes = raw_align_up_hblk(bytes);
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            mmap_aligned(bytes)
        } else {
            compile_error!("no OS memory acquisition for this platform");
        }
    }
}

#[cfg(unix)]
fn mmap_aligned(bytes: usize) -> Option<Address> {
    // Over-allocate by one block so we can carve out an aligned region even
    // when the kernel hands back an unaligned mapping, then trim the ends.
    let request = bytes + HBLKSIZE;
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            request,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        warn!("mmap of {} bytes failed", request);
        return None;
    }
    let start = Address::from_mut_ptr(raw);
    let aligned = start.align_up(HBLKSIZE);
    let lead = aligned - start;
    if lead != 0 {
        unsafe {
            libc::munmap(start.to_mut_ptr(), lead);
        }
    }
    let tail = HBLKSIZE - lead;
    if tail != 0 {
        unsafe {
            libc::munmap((aligned + bytes).to_mut_ptr(), tail);
        }
    }
    trace!(
        "acquired {} blocks from the OS at {}",
        bytes >> LOG_HBLKSIZE,
        aligned
    );
    Some(aligned)
}

/// Set a range of memory to zero.
///
/// # Safety
/// The whole range must be mapped and writable.
pub unsafe fn zero(start: Address, len: usize) {
    std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mem_is_aligned_and_zeroed() {
        let m = get_mem(3 * HBLKSIZE).unwrap();
        assert!(m.is_aligned_to(HBLKSIZE));
        for i in 0..(3 * HBLKSIZE / std::mem::size_of::<usize>()) {
            let w: usize = unsafe { (m + i * std::mem::size_of::<usize>()).load() };
            assert_eq!(w, 0);
        }
    }

    #[test]
    fn zero_clears() {
        let m = get_mem(HBLKSIZE).unwrap();
        unsafe {
            m.store(0xdeadbeefusize);
            zero(m, HBLKSIZE);
            assert_eq!(m.load::<usize>(), 0);
        }
    }
}
