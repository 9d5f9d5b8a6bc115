//! Preemptive scheduler.
//!
//! Single CPU, timer-driven round-robin over one FIFO run queue, with a
//! software interrupt for voluntary yield. Processes own address spaces
//! and up to [`MAX_THREADS`] threads; every thread owns a kernel stack
//! and, for ring-3 threads, a user stack.
//!
//! Lock order across the kernel: process table / process → scheduler →
//! VMM. Taking them the other way round is a latent deadlock.

pub mod process;
pub mod queue;
pub mod scheduler;
pub mod thread;

use core::fmt;

pub use process::Process;
pub use queue::RunQueue;
pub use scheduler::{current_ids as scheduler_current_ids, yield_now};
pub use thread::{Context, FrameSpec, Thread};

/// Process identifier. Allocated from a monotonically increasing
/// counter; ids are not recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Thread identifier, unique within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Terminated = 4,
}

impl ThreadState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Terminated,
            other => panic!("invalid thread state {}", other),
        }
    }
}

/// Process priorities. Four levels are defined as an extension point;
/// the run queue is currently flat round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u32)]
pub enum Priority {
    Highest = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

/// Execution mode of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Kernel,
    User,
}

/// Threads per process.
pub const MAX_THREADS: usize = 32;

/// Live processes.
pub const MAX_PROCESSES: usize = 32;

/// Default CPU quantum in timer ticks.
pub const DEFAULT_QUANTUM: u32 = 20;

/// Kernel stack size.
pub const KERNEL_STACK_SIZE: usize = 0x2000;

/// User stack size.
pub const USER_STACK_SIZE: usize = 0x2000;

/// Unmapped guard gap left between thread stacks.
pub const STACK_GAP_SIZE: usize = 0x1000;

/// Identity of the current thread, `(Pid(0), Tid(0))` during boot before
/// the scheduler runs.
pub fn current_ids() -> (Pid, Tid) {
    #[cfg(test)]
    if let Some(ids) = test_ids::get() {
        return ids;
    }
    scheduler::current_ids()
}

#[cfg(test)]
mod test_ids {
    //! Per-thread identity override so ownership-sensitive primitives
    //! (the recursive mutex) can be exercised on the host, where no
    //! scheduler runs.

    extern crate std;

    use std::cell::Cell;

    use super::{Pid, Tid};

    std::thread_local! {
        static OVERRIDE: Cell<Option<(Pid, Tid)>> = const { Cell::new(None) };
    }

    pub fn get() -> Option<(Pid, Tid)> {
        OVERRIDE.with(|o| o.get())
    }

    pub fn set(ids: Option<(Pid, Tid)>) {
        OVERRIDE.with(|o| o.set(ids));
    }
}

/// Pretend to be `(pid, tid)` on this test thread.
#[cfg(test)]
pub fn test_set_current_ids(pid: Pid, tid: Tid) {
    test_ids::set(Some((pid, tid)));
}

/// Drop the identity override on this test thread.
#[cfg(test)]
pub fn test_clear_current_ids() {
    test_ids::set(None);
}
