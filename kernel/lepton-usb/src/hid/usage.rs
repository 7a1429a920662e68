//! HID usage pages and usages consumed by the class drivers.

/// Generic Desktop usage page.
pub const GENERIC_DESKTOP_PAGE: u32 = 0x01;
/// Keyboard/Keypad usage page.
pub const KEYBOARD_PAGE: u32 = 0x07;
/// LED usage page.
pub const LED_PAGE: u32 = 0x08;
/// Button usage page.
pub const BUTTON_PAGE: u32 = 0x09;

/// Generic Desktop: Pointer.
pub const POINTER_USAGE: u32 = 0x01;
/// Generic Desktop: Mouse.
pub const MOUSE_USAGE: u32 = 0x02;
/// Generic Desktop: Keyboard.
pub const KEYBOARD_USAGE: u32 = 0x06;
/// Generic Desktop: X axis.
pub const X_USAGE: u32 = 0x30;
/// Generic Desktop: Y axis.
pub const Y_USAGE: u32 = 0x31;

/// Keyboard page: first letter key (A).
pub const HID_KEY_A: u32 = 0x04;
/// Keyboard page: F12 (end of the boot-protocol key range checked for
/// the key array).
pub const HID_KEY_F12: u32 = 0x45;
/// Keyboard page: Left Control, first modifier.
pub const HID_KEY_LCONTROL: u32 = 0xE0;
/// Keyboard page: Right GUI, last modifier.
pub const HID_KEY_RGUI: u32 = 0xE7;

/// Returns a human-readable name for a `(page, usage)` pair the HID
/// layer knows about (diagnostics for rejected devices).
pub fn usage_name(page: u32, usage: u32) -> &'static str {
    match (page, usage) {
        (GENERIC_DESKTOP_PAGE, POINTER_USAGE) => "pointer",
        (GENERIC_DESKTOP_PAGE, MOUSE_USAGE) => "mouse",
        (GENERIC_DESKTOP_PAGE, KEYBOARD_USAGE) => "keyboard",
        (GENERIC_DESKTOP_PAGE, 0x04) => "joystick",
        (GENERIC_DESKTOP_PAGE, 0x05) => "gamepad",
        _ => "unknown",
    }
}
