//! Recursive mutex with ownership tracking.
//!
//! The inner state is guarded by a spinlock; the `(pid, tid)` recorded on
//! first acquisition lets the same thread re-enter without blocking. A
//! contended acquire releases the inner spinlock and yields the CPU
//! between retries, so mutex holders may be preempted (unlike spinlock
//! holders).

use crate::{
    error::{KernelError, KernelResult},
    sched,
    sched::{Pid, Tid},
    sync::SpinLock,
};

#[derive(Clone, Copy)]
struct MutexState {
    /// Recursion depth. Zero means unlocked; the owner fields are then
    /// logically dead.
    count: u32,
    owner: (Pid, Tid),
}

/// A recursive, ownership-tracking mutex.
pub struct RecursiveMutex {
    state: SpinLock<MutexState>,
}

impl RecursiveMutex {
    /// Create a new unlocked mutex.
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(MutexState {
                count: 0,
                owner: (Pid(0), Tid(0)),
            }),
        }
    }

    /// Acquire the mutex, blocking (spin + yield) while another thread
    /// holds it. Re-entry by the owning thread succeeds immediately.
    pub fn lock(&self) {
        loop {
            {
                let mut state = self.state.lock();
                let me = sched::current_ids();

                if state.count == 0 {
                    state.owner = me;
                    state.count = 1;
                    return;
                }
                if state.owner == me {
                    state.count += 1;
                    return;
                }
            }
            // Held by someone else; hand the CPU over and retry.
            sched::yield_now();
        }
    }

    /// Release one level of the mutex.
    ///
    /// Panics when called by a thread that does not own the mutex, or when
    /// the mutex is not locked at all. Both are kernel bugs, not runtime
    /// conditions.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        let me = sched::current_ids();

        if state.count == 0 {
            panic!("mutex: unlock of an unlocked mutex");
        }
        if state.owner != me {
            panic!(
                "mutex: unlock by non-owner (owner pid={} tid={}, caller pid={} tid={})",
                state.owner.0 .0, state.owner.1 .0, me.0 .0, me.1 .0
            );
        }
        state.count -= 1;
    }

    /// Run `f` with the mutex held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }

    /// Tear the mutex down. A live recursion count at destroy time is a
    /// caller bug; rather than erroring, wait (yielding) until every level
    /// has been released.
    pub fn destroy(&self) {
        while self.lock_count() != 0 {
            sched::yield_now();
        }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> KernelResult<()> {
        let mut state = self.state.lock();
        let me = sched::current_ids();

        if state.count == 0 {
            state.owner = me;
            state.count = 1;
            Ok(())
        } else if state.owner == me {
            state.count += 1;
            Ok(())
        } else {
            Err(KernelError::TimedOut)
        }
    }

    /// Current recursion depth.
    pub fn lock_count(&self) -> u32 {
        self.state.lock().count
    }

    /// Current owner; meaningful only while `lock_count() > 0`.
    pub fn owner(&self) -> (Pid, Tid) {
        self.state.lock().owner
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_lock_never_blocks_same_thread() {
        let m = RecursiveMutex::new();
        m.lock();
        m.lock();
        m.lock();
        assert_eq!(m.lock_count(), 3);
        assert_eq!(m.owner(), sched::current_ids());
        m.unlock();
        m.unlock();
        assert_eq!(m.lock_count(), 1);
        m.unlock();
        assert_eq!(m.lock_count(), 0);
    }

    #[test]
    fn try_lock_fails_for_foreign_owner() {
        let m = RecursiveMutex::new();
        sched::test_set_current_ids(Pid(7), Tid(1));
        m.lock();
        sched::test_set_current_ids(Pid(8), Tid(1));
        assert_eq!(m.try_lock(), Err(KernelError::TimedOut));
        sched::test_set_current_ids(Pid(7), Tid(1));
        m.unlock();
        sched::test_clear_current_ids();
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn unlock_by_non_owner_panics() {
        let m = RecursiveMutex::new();
        sched::test_set_current_ids(Pid(21), Tid(3));
        m.lock();
        sched::test_set_current_ids(Pid(22), Tid(3));
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "unlocked")]
    fn unlock_of_unlocked_panics() {
        let m = RecursiveMutex::new();
        m.unlock();
    }
}
