//! Synchronization primitives.
//!
//! Three layers, each built on the one below:
//!
//! * [`SpinLock`]: busy-wait lock that disables interrupts for the
//!   duration of the critical section and restores the previous
//!   interrupt-enable state when the guard drops.
//! * [`RecursiveMutex`]: ownership-tracking lock that the holding thread
//!   may re-enter; contended acquires yield the CPU between retries.
//! * [`Event`]: counting signal with optional auto-reset and timed waits.
//!
//! IRQ handlers may take spinlocks, never mutexes; they talk to threaded
//! code through events and ring buffers only.

mod event;
mod mutex;
mod spinlock;

pub use event::{Event, TIMEOUT_INFINITE};
pub use mutex::RecursiveMutex;
pub use spinlock::{interrupt_guard, InterruptGuard, SpinLock, SpinLockGuard};
