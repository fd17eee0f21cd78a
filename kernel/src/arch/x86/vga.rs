//! VGA text-mode console
//!
//! 80x25 character buffer at physical 0xb8000, reached through the
//! kernel direct map. Light-grey-on-black, scrolls by one line when the
//! last row fills.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use spin::Mutex;

use crate::mm::KERNBASE;

const BUFFER: u32 = KERNBASE + 0xb8000;
const COLS: usize = 80;
const ROWS: usize = 25;
const ATTR: u16 = 0x0700; // light grey on black

struct Writer {
    row: usize,
    col: usize,
}

static WRITER: Mutex<Writer> = Mutex::new(Writer { row: 0, col: 0 });

impl Writer {
    fn cell(&self, row: usize, col: usize) -> *mut u16 {
        (BUFFER as usize + 2 * (row * COLS + col)) as *mut u16
    }

    fn putc(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            0x08 => {
                // backspace: rub out the previous cell
                if self.col > 0 {
                    self.col -= 1;
                    // SAFETY: row/col stay inside the 80x25 buffer.
                    unsafe { self.cell(self.row, self.col).write_volatile(ATTR | b' ' as u16) };
                }
            }
            _ => {
                // SAFETY: row/col stay inside the 80x25 buffer.
                unsafe {
                    self.cell(self.row, self.col)
                        .write_volatile(ATTR | byte as u16)
                };
                self.col += 1;
                if self.col == COLS {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row == ROWS {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        // SAFETY: both ranges lie inside the text buffer.
        unsafe {
            core::ptr::copy(
                self.cell(1, 0),
                self.cell(0, 0),
                (ROWS - 1) * COLS,
            );
            for col in 0..COLS {
                self.cell(ROWS - 1, col).write_volatile(ATTR | b' ' as u16);
            }
        }
        self.row = ROWS - 1;
    }
}

pub fn putc(byte: u8) {
    WRITER.lock().putc(byte);
}
