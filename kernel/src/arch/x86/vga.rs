//! VGA text console.
//!
//! 80x25 character cells at the statically mapped `0xC00B8000` alias of
//! the VGA text buffer. Output scrolls; there is no cursor management
//! beyond the write position.

use core::fmt;

use spin::Mutex;

const BUFFER_ADDR: usize = 0xC00B_8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;

/// Light grey on black.
const DEFAULT_ATTR: u8 = 0x07;

/// White on red, for panic output.
const PANIC_ATTR: u8 = 0x4F;

pub struct VgaWriter {
    row: usize,
    col: usize,
    attr: u8,
}

impl VgaWriter {
    const fn new() -> Self {
        Self {
            row: 0,
            col: 0,
            attr: DEFAULT_ATTR,
        }
    }

    #[inline]
    fn cell(row: usize, col: usize) -> *mut u16 {
        (BUFFER_ADDR + (row * WIDTH + col) * 2) as *mut u16
    }

    fn put(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            b'\r' => self.col = 0,
            byte => {
                // SAFETY: row/col stay inside the 80x25 buffer.
                unsafe {
                    Self::cell(self.row, self.col)
                        .write_volatile(u16::from(byte) | (u16::from(self.attr) << 8));
                }
                self.col += 1;
                if self.col == WIDTH {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row == HEIGHT {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                // SAFETY: both cells are inside the buffer.
                unsafe {
                    let value = Self::cell(row, col).read_volatile();
                    Self::cell(row - 1, col).write_volatile(value);
                }
            }
        }
        for col in 0..WIDTH {
            // SAFETY: last row of the buffer.
            unsafe {
                Self::cell(HEIGHT - 1, col)
                    .write_volatile(u16::from(b' ') | (u16::from(DEFAULT_ATTR) << 8));
            }
        }
        self.row = HEIGHT - 1;
    }

    pub fn clear(&mut self) {
        for row in 0..HEIGHT {
            for col in 0..WIDTH {
                // SAFETY: inside the buffer.
                unsafe {
                    Self::cell(row, col)
                        .write_volatile(u16::from(b' ') | (u16::from(DEFAULT_ATTR) << 8));
                }
            }
        }
        self.row = 0;
        self.col = 0;
    }
}

impl fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put(byte);
        }
        Ok(())
    }
}

static WRITER: Mutex<VgaWriter> = Mutex::new(VgaWriter::new());

/// Lock the console writer.
pub fn writer() -> spin::MutexGuard<'static, VgaWriter> {
    WRITER.lock()
}

/// Clear the screen.
pub fn init() {
    WRITER.lock().clear();
}

/// Write a plain string to the console.
pub fn print_str(s: &str) {
    use fmt::Write;
    let _ = WRITER.lock().write_str(s);
}

/// Panic output path: bypasses the writer lock, which may be held by
/// the very code that panicked.
pub fn panic_print(args: fmt::Arguments) {
    use fmt::Write;

    let mut writer = VgaWriter {
        row: HEIGHT - 4,
        col: 0,
        attr: PANIC_ATTR,
    };
    let _ = writer.write_fmt(args);
}
