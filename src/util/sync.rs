//! Signal-safe mutual exclusion for the allocator and collector entry points.
//!
//! Every public operation runs inside one process-wide critical section.  On
//! Unix, acquiring it also blocks asynchronous signals for its duration, so a
//! handler can never observe the collector's tables mid-update.  Release
//! restores the previous signal mask.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// A mutex whose guard also defers asynchronous signals while held.
pub struct CriticalSection<T> {
    inner: Mutex<T>,
}

/// RAII guard for a [`CriticalSection`].  Dropping it releases the lock and
/// restores the saved signal mask.
pub struct CriticalGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    #[cfg(unix)]
    old_mask: libc::sigset_t,
}

impl<T> CriticalSection<T> {
    pub fn new(value: T) -> Self {
        CriticalSection {
            inner: Mutex::new(value),
        }
    }

    /// Enter the critical section, blocking signals first so that a signal
    /// delivered to this thread cannot reenter the allocator.
    pub fn enter(&self) -> CriticalGuard<'_, T> {
        #[cfg(unix)]
        let old_mask = block_signals();
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        CriticalGuard {
            guard: Some(guard),
            #[cfg(unix)]
            old_mask,
        }
    }
}

impl<T> std::ops::Deref for CriticalGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken")
    }
}

impl<T> std::ops::DerefMut for CriticalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T> Drop for CriticalGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before unblocking, so a signal handler that allocates (which
        // it must not, but defensively) never sees the lock held by us.
        drop(self.guard.take());
        #[cfg(unix)]
        restore_signals(self.old_mask);
    }
}

#[cfg(unix)]
fn block_signals() -> libc::sigset_t {
    unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut old);
        old
    }
}

#[cfg(unix)]
fn restore_signals(old: libc::sigset_t) {
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &old, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_gives_exclusive_access() {
        let cs = CriticalSection::new(0usize);
        {
            let mut g = cs.enter();
            *g += 1;
        }
        assert_eq!(*cs.enter(), 1);
    }

    #[test]
    fn reacquire_after_release() {
        let cs = CriticalSection::new(Vec::<u32>::new());
        cs.enter().push(1);
        cs.enter().push(2);
        assert_eq!(cs.enter().as_slice(), &[1, 2]);
    }
}
