//! Discovery of the mutator stack and register state.
//!
//! The collector treats every word between the current stack pointer and the
//! captured stack bottom as a potential root, plus a snapshot of the
//! callee-saved registers.  How the bottom is found is platform business;
//! the core depends only on the [`StackDiscovery`] trait.

use crate::util::Address;

/// Words captured by a register snapshot.
pub const REGISTER_SNAPSHOT_WORDS: usize = 16;

/// Capability for locating the scannable stack of the mutator thread.
pub trait StackDiscovery: Send {
    /// The cool end of the stack (the highest scannable address; stacks are
    /// assumed to grow downward on all supported targets).
    fn stack_bottom(&self) -> Address;

    /// An address at or below the hottest live frame.
    fn current_sp(&self) -> Address {
        approx_sp()
    }

    /// Store the callee-saved register contents into `buf`, returning the
    /// number of words written.  Caller-saved registers need no handling:
    /// reaching this call spills them into frames the stack scan covers.
    fn register_snapshot(&self, buf: &mut [usize; REGISTER_SNAPSHOT_WORDS]) -> usize {
        capture_callee_saved(buf)
    }
}

/// Default discovery for the thread that initialized the collector.
pub struct HostStack {
    bottom: Address,
}

impl HostStack {
    /// Locate the current thread's stack bottom.  Prefers the thread library's
    /// own bookkeeping; falls back to the address of a local in the caller's
    /// frame, which is good enough when init runs near the top of `main`.
    pub fn for_current_thread() -> HostStack {
        let bottom = thread_stack_bottom().unwrap_or_else(approx_sp);
        HostStack { bottom }
    }

    /// Use an explicitly supplied bottom.
    pub fn with_bottom(bottom: Address) -> HostStack {
        HostStack { bottom }
    }
}

impl StackDiscovery for HostStack {
    fn stack_bottom(&self) -> Address {
        self.bottom
    }
}

/// Approximate stack pointer: the address of a local in a non-inlined frame.
#[inline(never)]
pub fn approx_sp() -> Address {
    let dummy: usize = 0;
    // black_box keeps the local materialized on the stack.
    Address::from_ref(std::hint::black_box(&dummy))
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn thread_stack_bottom() -> Option<Address> {
            unsafe {
                let mut attr: libc::pthread_attr_t = std::mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                    return None;
                }
                let mut stackaddr = std::ptr::null_mut();
                let mut stacksize = 0;
                let rc = libc::pthread_attr_getstack(&attr, &mut stackaddr, &mut stacksize);
                libc::pthread_attr_destroy(&mut attr);
                if rc != 0 {
                    return None;
                }
                Some(Address::from_mut_ptr(stackaddr) + stacksize)
            }
        }
    } else if #[cfg(target_os = "macos")] {
        fn thread_stack_bottom() -> Option<Address> {
            unsafe {
                let this = libc::pthread_self();
                let addr = libc::pthread_get_stackaddr_np(this);
                Some(Address::from_mut_ptr(addr))
            }
        }
    } else {
        fn thread_stack_bottom() -> Option<Address> {
            None
        }
    }
}

/// Read the callee-saved registers into `buf`.  These are the only registers
/// that may hold a pointer without a spilled copy anywhere in the scanned
/// frames.
#[inline(never)]
pub fn capture_callee_saved(buf: &mut [usize; REGISTER_SNAPSHOT_WORDS]) -> usize {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::asm;
        let (rbx, rbp, r12, r13, r14, r15): (usize, usize, usize, usize, usize, usize);
        asm!("mov {0}, rbx", out(reg) rbx, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, r12", out(reg) r12, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, r13", out(reg) r13, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, r14", out(reg) r14, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, r15", out(reg) r15, options(nomem, nostack, preserves_flags));
        buf[0] = rbx;
        buf[1] = rbp;
        buf[2] = r12;
        buf[3] = r13;
        buf[4] = r14;
        buf[5] = r15;
        6
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        use std::arch::asm;
        let (x19, x20, x21, x22, x23): (usize, usize, usize, usize, usize);
        let (x24, x25, x26, x27, x28, x29): (usize, usize, usize, usize, usize, usize);
        asm!("mov {0}, x19", out(reg) x19, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x20", out(reg) x20, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x21", out(reg) x21, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x22", out(reg) x22, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x23", out(reg) x23, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x24", out(reg) x24, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x25", out(reg) x25, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x26", out(reg) x26, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x27", out(reg) x27, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x28", out(reg) x28, options(nomem, nostack, preserves_flags));
        asm!("mov {0}, x29", out(reg) x29, options(nomem, nostack, preserves_flags));
        buf[..11].copy_from_slice(&[x19, x20, x21, x22, x23, x24, x25, x26, x27, x28, x29]);
        11
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        // No snapshot: a non-inlined call chain reached this point, so the
        // caller's register state is spilled into scanned frames.
        buf.fill(0);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_is_below_bottom() {
        let host = HostStack::for_current_thread();
        let sp = approx_sp();
        assert!(sp < host.stack_bottom());
    }

    #[test]
    fn snapshot_finds_a_held_pointer() {
        // Pin a recognizable value into a callee-saved register by giving the
        // optimizer a loop-carried live value, then snapshot.
        let sentinel = Box::new(0x5afe_usize);
        let p = &*sentinel as *const usize as usize;
        let mut acc = p;
        for i in 0..4 {
            acc = std::hint::black_box(acc ^ i ^ i);
        }
        let mut buf = [0usize; REGISTER_SNAPSHOT_WORDS];
        let n = capture_callee_saved(&mut buf);
        // The value is either in the snapshot or spilled to our own frame;
        // the test only checks that the snapshot mechanism runs and reports
        // a plausible register count.
        assert!(n <= REGISTER_SNAPSHOT_WORDS);
        assert_eq!(std::hint::black_box(acc), p);
    }
}
