//! Counting event with auto-reset and timed wait.
//!
//! `signal` increments a counter; `wait` spins, yielding the CPU between
//! checks, until the counter is positive or the timeout elapses. With
//! auto-reset enabled each successful wait consumes one signal.

use crate::{
    error::{KernelError, KernelResult},
    sched,
    sync::SpinLock,
    timer,
};

/// Wait forever.
pub const TIMEOUT_INFINITE: u32 = u32::MAX;

/// A counting synchronization event.
pub struct Event {
    state: SpinLock<u32>,
    autoreset: bool,
}

impl Event {
    /// Create an event in the unsignaled state.
    pub const fn new(autoreset: bool) -> Self {
        Self {
            state: SpinLock::new(0),
            autoreset,
        }
    }

    /// Signal the event, incrementing its counter.
    pub fn signal(&self) {
        *self.state.lock() += 1;
    }

    /// Force the event back to the unsignaled state.
    pub fn reset(&self) {
        *self.state.lock() = 0;
    }

    /// Current signal count.
    pub fn state(&self) -> u32 {
        *self.state.lock()
    }

    /// Consume one signal if any is pending.
    fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        if *state > 0 {
            if self.autoreset {
                *state -= 1;
            }
            true
        } else {
            false
        }
    }

    /// Wait until the event is signaled or `timeout` ticks elapse.
    ///
    /// A timeout of 0 is treated as 1 tick so the caller always gets at
    /// least one state read; [`TIMEOUT_INFINITE`] never times out. The
    /// wait loop yields the CPU between checks.
    pub fn wait(&self, timeout: u32) -> KernelResult<()> {
        let timeout = if timeout == 0 { 1 } else { timeout };
        let start = timer::ticks();

        loop {
            if self.try_consume() {
                return Ok(());
            }
            if timeout != TIMEOUT_INFINITE && timer::ticks() - start >= u64::from(timeout) {
                return Err(KernelError::TimedOut);
            }
            sched::yield_now();
        }
    }

    /// Wait for the first of several events to become signaled.
    ///
    /// Returns the index of the event whose signal was consumed. Events
    /// are polled in order, so on simultaneous signals the lowest index
    /// wins.
    pub fn wait_multiple(events: &[&Event], timeout: u32) -> KernelResult<usize> {
        if events.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        let timeout = if timeout == 0 { 1 } else { timeout };
        let start = timer::ticks();

        loop {
            for (index, event) in events.iter().enumerate() {
                if event.try_consume() {
                    return Ok(index);
                }
            }
            if timeout != TIMEOUT_INFINITE && timer::ticks() - start >= u64::from(timeout) {
                return Err(KernelError::TimedOut);
            }
            sched::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoreset_consumes_exactly_one_signal_per_wait() {
        let e = Event::new(true);
        for _ in 0..3 {
            e.signal();
        }
        for _ in 0..3 {
            assert_eq!(e.wait(10), Ok(()));
        }
        assert_eq!(e.state(), 0);
        assert_eq!(e.wait(10), Err(KernelError::TimedOut));
    }

    #[test]
    fn manual_reset_event_stays_signaled() {
        let e = Event::new(false);
        e.signal();
        assert_eq!(e.wait(10), Ok(()));
        assert_eq!(e.wait(10), Ok(()));
        e.reset();
        assert_eq!(e.wait(5), Err(KernelError::TimedOut));
    }

    #[test]
    fn fresh_autoreset_event_times_out() {
        let e = Event::new(true);
        assert_eq!(e.wait(100), Err(KernelError::TimedOut));
        assert_eq!(e.state(), 0);
    }

    #[test]
    fn zero_timeout_still_reads_state_once() {
        let e = Event::new(true);
        e.signal();
        assert_eq!(e.wait(0), Ok(()));
        assert_eq!(e.wait(0), Err(KernelError::TimedOut));
    }

    #[test]
    fn wait_multiple_returns_signaled_index() {
        let a = Event::new(true);
        let b = Event::new(true);
        let c = Event::new(true);
        b.signal();
        assert_eq!(Event::wait_multiple(&[&a, &b, &c], 10), Ok(1));
        assert_eq!(
            Event::wait_multiple(&[&a, &b, &c], 10),
            Err(KernelError::TimedOut)
        );
        assert_eq!(Event::wait_multiple(&[], 10), Err(KernelError::InvalidArgument));
    }
}
