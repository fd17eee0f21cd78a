//! PS/2 keyboard input
//!
//! The keyboard IRQ handler pulls scancodes from the 8042 data port and
//! runs them through `pc-keyboard`'s set-1 decoder; decoded characters
//! land in the shared console buffer.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use lazy_static::lazy_static;
use pc_keyboard::{layouts::Us104Key, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86::io::inb;

const KBD_STATUS: u16 = 0x64;
const KBD_DATA: u16 = 0x60;
const STATUS_HAS_DATA: u8 = 0x01;

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
        ScancodeSet1::new(),
        Us104Key,
        HandleControl::MapLettersToUnicode,
    ));
}

/// Drain and decode pending scancodes; returns the next input byte if a
/// keypress completed.
pub fn intr() -> Option<u8> {
    let mut keyboard = KEYBOARD.lock();
    // SAFETY: status/data reads on the 8042 controller ports.
    while unsafe { inb(KBD_STATUS) } & STATUS_HAS_DATA != 0 {
        let scancode = unsafe { inb(KBD_DATA) };
        if let Ok(Some(event)) = keyboard.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(event) {
                if ch.is_ascii() {
                    return Some(ch as u8);
                }
            }
        }
    }
    None
}
