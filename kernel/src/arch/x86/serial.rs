//! COM1 serial port, used as a secondary log sink.

use core::fmt;

use spin::Mutex;

use crate::arch::hal;

const COM1: u16 = 0x3F8;

pub struct SerialPort;

impl SerialPort {
    /// Program 115200 8N1 with FIFOs enabled.
    fn init(&mut self) {
        // SAFETY: standard 16550 setup sequence on COM1.
        unsafe {
            hal::outb(COM1 + 1, 0x00); // disable interrupts
            hal::outb(COM1 + 3, 0x80); // DLAB on
            hal::outb(COM1, 0x01); // divisor 1 = 115200 baud
            hal::outb(COM1 + 1, 0x00);
            hal::outb(COM1 + 3, 0x03); // 8N1, DLAB off
            hal::outb(COM1 + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
            hal::outb(COM1 + 4, 0x0B); // DTR | RTS | OUT2
        }
    }

    fn write_byte(&mut self, byte: u8) {
        // SAFETY: polls LSR then writes THR.
        unsafe {
            while hal::inb(COM1 + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            hal::outb(COM1, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static PORT: Mutex<SerialPort> = Mutex::new(SerialPort);

/// Initialize COM1.
pub fn init() {
    PORT.lock().init();
}

/// Lock the serial writer.
pub fn writer() -> spin::MutexGuard<'static, SerialPort> {
    PORT.lock()
}
