//! HID keyboard driver.
//!
//! Walks the parsed report format to locate the modifier byte, the key
//! array, and the LED byte, then diffs successive input reports:
//! modifier-bit XOR yields press/release events, and the key array is
//! diffed in both directions (new-not-old = press, old-not-new =
//! release).

use alloc::vec;
use alloc::vec::Vec;

use crate::hid::report::{ItemKind, ReportFormat};
use crate::hid::usage;
use crate::input::{EventType, input_event};

/// Key codes emitted through the input subsystem (evdev-compatible
/// values for the boot-protocol range).
pub mod key {
    #![allow(missing_docs)]
    pub const KEY_ESC: u16 = 1;
    pub const KEY_1: u16 = 2;
    pub const KEY_2: u16 = 3;
    pub const KEY_3: u16 = 4;
    pub const KEY_4: u16 = 5;
    pub const KEY_5: u16 = 6;
    pub const KEY_6: u16 = 7;
    pub const KEY_7: u16 = 8;
    pub const KEY_8: u16 = 9;
    pub const KEY_9: u16 = 10;
    pub const KEY_0: u16 = 11;
    pub const KEY_MINUS: u16 = 12;
    pub const KEY_EQUAL: u16 = 13;
    pub const KEY_BACKSPACE: u16 = 14;
    pub const KEY_TAB: u16 = 15;
    pub const KEY_Q: u16 = 16;
    pub const KEY_W: u16 = 17;
    pub const KEY_E: u16 = 18;
    pub const KEY_R: u16 = 19;
    pub const KEY_T: u16 = 20;
    pub const KEY_Y: u16 = 21;
    pub const KEY_U: u16 = 22;
    pub const KEY_I: u16 = 23;
    pub const KEY_O: u16 = 24;
    pub const KEY_P: u16 = 25;
    pub const KEY_LEFTBRACE: u16 = 26;
    pub const KEY_RIGHTBRACE: u16 = 27;
    pub const KEY_ENTER: u16 = 28;
    pub const KEY_LEFTCTRL: u16 = 29;
    pub const KEY_A: u16 = 30;
    pub const KEY_S: u16 = 31;
    pub const KEY_D: u16 = 32;
    pub const KEY_F: u16 = 33;
    pub const KEY_G: u16 = 34;
    pub const KEY_H: u16 = 35;
    pub const KEY_J: u16 = 36;
    pub const KEY_K: u16 = 37;
    pub const KEY_L: u16 = 38;
    pub const KEY_SEMICOLON: u16 = 39;
    pub const KEY_APOSTROPHE: u16 = 40;
    pub const KEY_GRAVE: u16 = 41;
    pub const KEY_LEFTSHIFT: u16 = 42;
    pub const KEY_BACKSLASH: u16 = 43;
    pub const KEY_Z: u16 = 44;
    pub const KEY_X: u16 = 45;
    pub const KEY_C: u16 = 46;
    pub const KEY_V: u16 = 47;
    pub const KEY_B: u16 = 48;
    pub const KEY_N: u16 = 49;
    pub const KEY_M: u16 = 50;
    pub const KEY_COMMA: u16 = 51;
    pub const KEY_DOT: u16 = 52;
    pub const KEY_SLASH: u16 = 53;
    pub const KEY_RIGHTSHIFT: u16 = 54;
    pub const KEY_LEFTALT: u16 = 56;
    pub const KEY_SPACE: u16 = 57;
    pub const KEY_CAPSLOCK: u16 = 58;
    pub const KEY_F1: u16 = 59;
    pub const KEY_F2: u16 = 60;
    pub const KEY_F3: u16 = 61;
    pub const KEY_F4: u16 = 62;
    pub const KEY_F5: u16 = 63;
    pub const KEY_F6: u16 = 64;
    pub const KEY_F7: u16 = 65;
    pub const KEY_F8: u16 = 66;
    pub const KEY_F9: u16 = 67;
    pub const KEY_F10: u16 = 68;
    pub const KEY_F11: u16 = 87;
    pub const KEY_F12: u16 = 88;
    pub const KEY_RIGHTCTRL: u16 = 97;
    pub const KEY_RIGHTALT: u16 = 100;
    pub const KEY_LEFTMETA: u16 = 125;
    pub const KEY_RIGHTMETA: u16 = 126;
}

/// Maps a HID keyboard-page usage to an input key code (0 = unmapped).
pub fn hid_usage_to_key(hid: u8) -> u16 {
    use key::*;
    match hid {
        0x04 => KEY_A,
        0x05 => KEY_B,
        0x06 => KEY_C,
        0x07 => KEY_D,
        0x08 => KEY_E,
        0x09 => KEY_F,
        0x0A => KEY_G,
        0x0B => KEY_H,
        0x0C => KEY_I,
        0x0D => KEY_J,
        0x0E => KEY_K,
        0x0F => KEY_L,
        0x10 => KEY_M,
        0x11 => KEY_N,
        0x12 => KEY_O,
        0x13 => KEY_P,
        0x14 => KEY_Q,
        0x15 => KEY_R,
        0x16 => KEY_S,
        0x17 => KEY_T,
        0x18 => KEY_U,
        0x19 => KEY_V,
        0x1A => KEY_W,
        0x1B => KEY_X,
        0x1C => KEY_Y,
        0x1D => KEY_Z,
        0x1E => KEY_1,
        0x1F => KEY_2,
        0x20 => KEY_3,
        0x21 => KEY_4,
        0x22 => KEY_5,
        0x23 => KEY_6,
        0x24 => KEY_7,
        0x25 => KEY_8,
        0x26 => KEY_9,
        0x27 => KEY_0,
        0x28 => KEY_ENTER,
        0x29 => KEY_ESC,
        0x2A => KEY_BACKSPACE,
        0x2B => KEY_TAB,
        0x2C => KEY_SPACE,
        0x2D => KEY_MINUS,
        0x2E => KEY_EQUAL,
        0x2F => KEY_LEFTBRACE,
        0x30 => KEY_RIGHTBRACE,
        0x31 => KEY_BACKSLASH,
        0x33 => KEY_SEMICOLON,
        0x34 => KEY_APOSTROPHE,
        0x35 => KEY_GRAVE,
        0x36 => KEY_COMMA,
        0x37 => KEY_DOT,
        0x38 => KEY_SLASH,
        0x39 => KEY_CAPSLOCK,
        0x3A => KEY_F1,
        0x3B => KEY_F2,
        0x3C => KEY_F3,
        0x3D => KEY_F4,
        0x3E => KEY_F5,
        0x3F => KEY_F6,
        0x40 => KEY_F7,
        0x41 => KEY_F8,
        0x42 => KEY_F9,
        0x43 => KEY_F10,
        0x44 => KEY_F11,
        0x45 => KEY_F12,
        _ => 0,
    }
}

/// Maps a modifier bit index (0..7) to its key code.
pub fn modifier_bit_to_key(bit: u8) -> u16 {
    use key::*;
    match bit {
        0 => KEY_LEFTCTRL,
        1 => KEY_LEFTSHIFT,
        2 => KEY_LEFTALT,
        3 => KEY_LEFTMETA,
        4 => KEY_RIGHTCTRL,
        5 => KEY_RIGHTSHIFT,
        6 => KEY_RIGHTALT,
        7 => KEY_RIGHTMETA,
        _ => 0,
    }
}

/// Keyboard driver state.
pub struct HidKeyboard {
    /// Byte offset of the modifier bitmap in the input report.
    pub modifier_offset: usize,
    /// Byte offset of the key array.
    pub key_offset: usize,
    /// Key-array length in bytes.
    pub key_count: usize,
    /// Byte offset of the LED bitmap in the output report.
    pub led_offset: usize,
    prev: Vec<u8>,
}

impl HidKeyboard {
    /// Builds the driver from a parsed report format.
    ///
    /// Returns `None` when the top-level collection is not a keyboard.
    pub fn new(format: &ReportFormat) -> Option<HidKeyboard> {
        let top = format.top_collection()?;
        if !(top.usage_page == usage::GENERIC_DESKTOP_PAGE && top.usage == usage::KEYBOARD_USAGE) {
            return None;
        }

        let mut kb = HidKeyboard {
            modifier_offset: 0,
            key_offset: 0,
            key_count: 0,
            led_offset: 0,
            prev: vec![0; format.size],
        };

        // Input and output reports have independent layouts; walk each
        // with its own bit cursor.
        let mut in_bits = 0u32;
        let mut out_bits = 0u32;
        for item in top.items() {
            match item.kind {
                ItemKind::Input => {
                    if item.covers_usage_range(
                        usage::KEYBOARD_PAGE,
                        usage::HID_KEY_A,
                        usage::HID_KEY_F12,
                    ) {
                        kb.key_offset = (in_bits / 8) as usize;
                        kb.key_count = item.report_count as usize;
                    } else if item.covers_usage_range(
                        usage::KEYBOARD_PAGE,
                        usage::HID_KEY_LCONTROL,
                        usage::HID_KEY_RGUI,
                    ) {
                        kb.modifier_offset = (in_bits / 8) as usize;
                    }
                    in_bits += item.size_bits();
                }
                ItemKind::Output => {
                    if item.usage_page == usage::LED_PAGE {
                        kb.led_offset = (out_bits / 8) as usize;
                    }
                    out_bits += item.size_bits();
                }
                ItemKind::Feature => {}
            }
        }

        if kb.key_count == 0 {
            return None;
        }
        Some(kb)
    }

    /// Diffs `report` against the previous one and emits key events.
    pub fn handle_input(&mut self, report: &[u8]) {
        if report.len() < self.key_offset + self.key_count {
            return;
        }

        let prev_mod = self.prev[self.modifier_offset];
        let curr_mod = report[self.modifier_offset];

        // Modifiers first: each flipped bit is one press or release.
        let mut moddiff = curr_mod ^ prev_mod;
        while moddiff != 0 {
            let bit = moddiff.trailing_zeros() as u8;
            let state = i32::from(prev_mod & (1 << bit) == 0);
            input_event(EventType::Key, modifier_bit_to_key(bit), state);
            moddiff &= !(1 << bit);
        }

        let curr_keys = &report[self.key_offset..self.key_offset + self.key_count];
        let prev_keys = &self.prev[self.key_offset..self.key_offset + self.key_count];

        // Presses: in the new array but not the old.
        for &code in curr_keys {
            if code == 0 {
                break;
            }
            if !prev_keys.contains(&code) {
                input_event(EventType::Key, hid_usage_to_key(code), 1);
            }
        }

        // Releases: in the old array but not the new.
        for &code in prev_keys {
            if code == 0 {
                break;
            }
            if !curr_keys.contains(&code) {
                input_event(EventType::Key, hid_usage_to_key(code), 0);
            }
        }

        let n = report.len().min(self.prev.len());
        self.prev[..n].copy_from_slice(&report[..n]);
    }
}
