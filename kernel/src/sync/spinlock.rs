//! Interrupt-safe spinlock.
//!
//! Acquisition captures EFLAGS.IF, disables interrupts, then spins on an
//! atomic exchange until the previous value reads 0. Release restores IF
//! if and only if it was set at acquisition. This single convention makes
//! every spinlock safe against re-entry by an interrupt handler on the
//! same CPU.
//!
//! The restore action lives in the guard's destructor, so forgetting it is
//! a type error rather than a latent deadlock.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::arch::hal;

/// A spinlock protecting a value of type `T`.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock provides the required mutual exclusion.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, disabling interrupts for the critical section.
    ///
    /// Returns a guard granting access to the protected data. The prior
    /// interrupt-enable state is restored when the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let if_was_set = hal::interrupts_enabled();
        hal::cli();

        while self.locked.swap(1, Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            if_was_set,
        }
    }

    /// True when the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
    }
}

/// Guard for a held [`SpinLock`]. Releases the lock and restores the
/// interrupt-enable flag on drop.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    if_was_set: bool,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.locked.swap(0, Ordering::Release) != 1 {
            panic!("spinlock: releasing a lock that is not held");
        }
        if self.if_was_set {
            hal::sti();
        }
    }
}

/// Bare interrupt-disable guard with no lock attached.
///
/// Used where only the IF save/restore half of the spinlock contract is
/// needed, e.g. while copying through a temporary mapping that a
/// reschedule would tear down.
pub struct InterruptGuard {
    if_was_set: bool,
}

/// Disable interrupts until the returned guard drops.
pub fn interrupt_guard() -> InterruptGuard {
    let if_was_set = hal::interrupts_enabled();
    hal::cli();
    InterruptGuard { if_was_set }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.if_was_set {
            hal::sti();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_provides_mutable_access() {
        let lock = SpinLock::new(41);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn balanced_acquire_release_restores_if() {
        hal::sti();
        let lock = SpinLock::new(());
        assert!(hal::interrupts_enabled());
        {
            let _guard = lock.lock();
            assert!(!hal::interrupts_enabled());
        }
        assert!(hal::interrupts_enabled());
    }

    #[test]
    fn nested_locks_restore_if_in_order() {
        hal::sti();
        let outer = SpinLock::new(());
        let inner = SpinLock::new(());
        {
            let _o = outer.lock();
            {
                // Inner captures IF already clear; releasing it must not
                // re-enable interrupts while the outer lock is held.
                let _i = inner.lock();
            }
            assert!(!hal::interrupts_enabled());
        }
        assert!(hal::interrupts_enabled());
    }

    #[test]
    fn interrupt_guard_restores_prior_state() {
        hal::cli();
        {
            let _g = interrupt_guard();
            assert!(!hal::interrupts_enabled());
        }
        assert!(!hal::interrupts_enabled());
        hal::sti();
        {
            let _g = interrupt_guard();
        }
        assert!(hal::interrupts_enabled());
    }
}
