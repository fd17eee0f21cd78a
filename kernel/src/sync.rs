//! The big kernel lock
//!
//! A single process-wide mutex: exactly one CPU executes kernel code at
//! a time, while user code on the other CPUs runs unlocked. Taken when
//! a CPU leaves the halted state and on every entry from user mode;
//! released in the scheduler immediately before the CPU returns to user
//! mode. Because the release happens on the far side of an `iret`, the
//! lock is driven through explicit `lock`/`unlock` calls rather than a
//! scoped guard.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::cpu;

pub struct BigKernelLock {
    inner: Mutex<()>,
    /// CPU index of the holder plus one; 0 when unheld. This is the
    /// sole cross-CPU mutable word outside the atomics in `cpu`.
    holder: AtomicU32,
}

impl BigKernelLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
            holder: AtomicU32::new(0),
        }
    }

    /// Spin until the calling CPU holds the kernel.
    pub fn lock(&self) {
        let me = cpu::cpu_index() as u32 + 1;
        assert_ne!(
            self.holder.load(Ordering::Acquire),
            me,
            "big kernel lock is not recursive"
        );
        core::mem::forget(self.inner.lock());
        self.holder.store(me, Ordering::Release);
    }

    /// Release the kernel. Must be called by the holding CPU.
    pub fn unlock(&self) {
        let me = cpu::cpu_index() as u32 + 1;
        assert_eq!(
            self.holder.load(Ordering::Acquire),
            me,
            "unlock of a big kernel lock held elsewhere"
        );
        self.holder.store(0, Ordering::Release);
        // SAFETY: the matching guard was forgotten in `lock`, and the
        // assertion above pins the caller as the holder.
        unsafe { self.inner.force_unlock() };
    }

    /// Does the calling CPU hold the kernel?
    pub fn holding(&self) -> bool {
        self.holder.load(Ordering::Acquire) == cpu::cpu_index() as u32 + 1
    }
}

impl Default for BigKernelLock {
    fn default() -> Self {
        Self::new()
    }
}

/// The one kernel-wide lock instance.
pub static KERNEL_LOCK: BigKernelLock = BigKernelLock::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_round_trip() {
        let lock = BigKernelLock::new();
        assert!(!lock.holding());
        lock.lock();
        assert!(lock.holding());
        lock.unlock();
        assert!(!lock.holding());
        // Reusable after release.
        lock.lock();
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "not recursive")]
    fn relock_panics() {
        let lock = BigKernelLock::new();
        lock.lock();
        lock.lock();
    }

    #[test]
    #[should_panic(expected = "held elsewhere")]
    fn unlock_without_lock_panics() {
        let lock = BigKernelLock::new();
        lock.unlock();
    }
}
