//! System tick source.
//!
//! The PIT fires IRQ0 at [`TIMER_HZ`]; the scheduler's IRQ0 handler calls
//! [`on_tick`] before running the preemption path. Timed waits compare
//! against [`ticks`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency in Hz.
pub const TIMER_HZ: u32 = 20;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the IRQ0 path, once per timer interrupt.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Advance virtual time.
///
/// Hosts and the pre-scheduler boot environment have no timer interrupt;
/// spin-wait loops that yield still need time to make progress, so the
/// yield path calls this when no scheduler is live.
pub fn advance(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

/// Program PIT channel 0 as a rate generator at [`TIMER_HZ`].
#[cfg(target_arch = "x86")]
pub fn init() {
    use crate::arch::hal;

    const PIT_FREQUENCY: u32 = 1_193_182;
    const PIT_CHANNEL0: u16 = 0x40;
    const PIT_COMMAND: u16 = 0x43;

    let divisor = (PIT_FREQUENCY / TIMER_HZ) as u16;
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 2 (rate generator)
        hal::outb(PIT_COMMAND, 0x36);
        hal::outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        hal::outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    log::debug!("PIT programmed for {} Hz (divisor {})", TIMER_HZ, divisor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let before = ticks();
        on_tick();
        advance(3);
        assert!(ticks() >= before + 4);
    }
}
