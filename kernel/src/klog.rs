//! Kernel logger.
//!
//! Installs a `log` facade backend that renders records to the VGA text
//! console and the COM1 serial port. The panic path bypasses this and
//! writes to VGA directly, since it cannot trust the logger's locks.

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        #[cfg(target_arch = "x86")]
        {
            use core::fmt::Write;

            let mut vga = crate::arch::x86::vga::writer();
            let _ = writeln!(vga, "[{:>5}] {}", record.level(), record.args());

            let mut serial = crate::arch::x86::serial::writer();
            let _ = writeln!(serial, "[{:>5}] {}", record.level(), record.args());
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let _ = record;
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Debug builds log at `Debug`, release at `Info`.
pub fn init() {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
