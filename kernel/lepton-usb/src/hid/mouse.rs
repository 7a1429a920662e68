//! HID mouse driver.
//!
//! Locates the button byte and the two signed delta axes from the
//! parsed report format and emits pointer and button updates.

use crate::hid::report::{ItemKind, ReportFormat};
use crate::hid::usage;
use crate::input::{EventType, btn, input_event, rel};

/// Mouse driver state.
pub struct HidMouse {
    /// Byte offset of the button bitmap.
    pub buttons_offset: usize,
    /// Byte offset of the X delta.
    pub x_offset: usize,
    /// Byte offset of the Y delta.
    pub y_offset: usize,
    prev_buttons: u8,
}

impl HidMouse {
    /// Builds the driver from a parsed report format.
    ///
    /// Returns `None` when the top-level collection is not a mouse.
    pub fn new(format: &ReportFormat) -> Option<HidMouse> {
        let top = format.top_collection()?;
        if !(top.usage_page == usage::GENERIC_DESKTOP_PAGE && top.usage == usage::MOUSE_USAGE) {
            return None;
        }

        let mut mouse = HidMouse {
            buttons_offset: 0,
            x_offset: 0,
            y_offset: 0,
            prev_buttons: 0,
        };
        let mut found_axes = false;

        let mut bits = 0u32;
        for item in top.items() {
            if item.kind != ItemKind::Input {
                continue;
            }
            if item.usage_page == usage::BUTTON_PAGE && item.report_size == 1 {
                mouse.buttons_offset = (bits / 8) as usize;
            } else if item.usage_page == usage::GENERIC_DESKTOP_PAGE {
                let base = (bits / 8) as usize;
                if let Some(x) = item.find_usage(usage::GENERIC_DESKTOP_PAGE, usage::X_USAGE) {
                    mouse.x_offset = base + item.usage_byte_offset(x);
                    found_axes = true;
                }
                if let Some(y) = item.find_usage(usage::GENERIC_DESKTOP_PAGE, usage::Y_USAGE) {
                    mouse.y_offset = base + item.usage_byte_offset(y);
                }
            }
            bits += item.size_bits();
        }

        if !found_axes {
            return None;
        }
        Some(mouse)
    }

    /// Emits pointer deltas and button changes for one input report.
    pub fn handle_input(&mut self, report: &[u8]) {
        let needed = self.buttons_offset.max(self.x_offset).max(self.y_offset);
        if report.len() <= needed {
            return;
        }

        let buttons = report[self.buttons_offset];
        let dx = report[self.x_offset] as i8;
        let dy = report[self.y_offset] as i8;

        if dx != 0 {
            input_event(EventType::Relative, rel::REL_X, dx as i32);
        }
        if dy != 0 {
            input_event(EventType::Relative, rel::REL_Y, dy as i32);
        }

        let diff = buttons ^ self.prev_buttons;
        for (bit, code) in [(0, btn::BTN_LEFT), (1, btn::BTN_RIGHT), (2, btn::BTN_MIDDLE)] {
            if diff & (1 << bit) != 0 {
                input_event(EventType::Key, code, i32::from(buttons & (1 << bit) != 0));
            }
        }
        self.prev_buttons = buttons;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::report::{BOOT_MOUSE_DESCRIPTOR, parse_report_descriptor};
    use crate::input::tests::{CAPTURED, install_capture, lock_sink};

    fn boot_mouse() -> HidMouse {
        let format = parse_report_descriptor(BOOT_MOUSE_DESCRIPTOR).unwrap();
        HidMouse::new(&format).unwrap()
    }

    #[test]
    fn boot_layout_offsets() {
        let mouse = boot_mouse();
        assert_eq!(mouse.buttons_offset, 0);
        assert_eq!(mouse.x_offset, 1);
        assert_eq!(mouse.y_offset, 2);
    }

    #[test]
    fn keyboard_descriptor_is_rejected() {
        let format =
            parse_report_descriptor(crate::hid::report::BOOT_KEYBOARD_DESCRIPTOR).unwrap();
        assert!(HidMouse::new(&format).is_none());
    }

    #[test]
    fn motion_emits_deltas() {
        let _guard = lock_sink();
        install_capture();
        let mut mouse = boot_mouse();

        // dx = +5, dy = -3 (0xFD as i8).
        mouse.handle_input(&[0, 5, 0xFD]);
        let events = CAPTURED.lock().unwrap().clone();
        assert_eq!(events, vec![
            (EventType::Relative, rel::REL_X, 5),
            (EventType::Relative, rel::REL_Y, -3),
        ]);
    }

    #[test]
    fn button_transitions() {
        let _guard = lock_sink();
        install_capture();
        let mut mouse = boot_mouse();

        mouse.handle_input(&[0b001, 0, 0]); // left down
        mouse.handle_input(&[0b100, 0, 0]); // left up, middle down
        mouse.handle_input(&[0b100, 0, 0]); // no change

        let events = CAPTURED.lock().unwrap().clone();
        assert_eq!(events, vec![
            (EventType::Key, btn::BTN_LEFT, 1),
            (EventType::Key, btn::BTN_LEFT, 0),
            (EventType::Key, btn::BTN_MIDDLE, 1),
        ]);
    }
}
