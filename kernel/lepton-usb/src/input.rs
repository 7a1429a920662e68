//! Input event sink.
//!
//! Class drivers emit `(type, code, value)` triples; the consumer (a
//! console, a window system) registers a sink hook at boot. Events
//! emitted before registration are dropped.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventType {
    /// Key or button state change (`value`: 1 press, 0 release).
    Key = 1,
    /// Relative axis movement (`value`: signed delta).
    Relative = 2,
}

/// Relative axis codes.
pub mod rel {
    /// Horizontal movement.
    pub const REL_X: u16 = 0;
    /// Vertical movement.
    pub const REL_Y: u16 = 1;
}

/// Button codes (mouse).
pub mod btn {
    /// Left button.
    pub const BTN_LEFT: u16 = 0x110;
    /// Right button.
    pub const BTN_RIGHT: u16 = 0x111;
    /// Middle button.
    pub const BTN_MIDDLE: u16 = 0x112;
}

/// The sink hook signature.
pub type InputSinkFn = fn(EventType, u16, i32);

fn null_sink(_ev: EventType, _code: u16, _value: i32) {}

static INPUT_SINK: AtomicPtr<()> = AtomicPtr::new(null_sink as *mut ());

/// Registers the input event sink.
///
/// # Safety
///
/// The sink must be callable from kernel-thread context and never block
/// for long periods (it runs on the HID service threads).
pub unsafe fn set_input_sink(f: InputSinkFn) {
    INPUT_SINK.store(f as *mut (), Ordering::Release);
}

/// Emits one input event.
#[inline]
pub fn input_event(ev: EventType, code: u16, value: i32) {
    let ptr = INPUT_SINK.load(Ordering::Acquire);
    // SAFETY: Only valid `InputSinkFn` pointers are ever stored.
    let f: InputSinkFn = unsafe { core::mem::transmute(ptr) };
    f(ev, code, value)
}
