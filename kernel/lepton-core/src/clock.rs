//! Monotonic and wall-clock time hooks.
//!
//! The hardware clock source is installed by the kernel at boot. The host
//! default is a strictly-increasing atomic counter so tests observe
//! monotonic time without real hardware.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Nanoseconds per millisecond.
pub const MS_TO_NS: u64 = 1_000_000;
/// Nanoseconds per second.
pub const SEC_TO_NS: u64 = 1_000_000_000;

/// A UTC time value with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeVal {
    /// Whole seconds.
    pub sec: u64,
    /// Microseconds within the second.
    pub usec: u64,
}

impl TimeVal {
    /// Returns `true` if both fields are zero.
    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Converts to nanoseconds.
    pub const fn to_nanos(&self) -> u64 {
        self.sec * SEC_TO_NS + self.usec * 1_000
    }

    /// Builds a `TimeVal` from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        Self {
            sec: ns / SEC_TO_NS,
            usec: (ns % SEC_TO_NS) / 1_000,
        }
    }
}

/// The signature of the monotonic clock hook.
pub type ClockFn = fn() -> u64;

static FALLBACK_TICK: AtomicU64 = AtomicU64::new(0);

fn default_clock_nanos() -> u64 {
    // Each read advances by 1 us so repeated reads are strictly ordered.
    FALLBACK_TICK.fetch_add(1_000, Ordering::Relaxed) + 1_000
}

static CLOCK_FN: AtomicPtr<()> = AtomicPtr::new(default_clock_nanos as *mut ());
static REALTIME_OFFSET_NS: AtomicU64 = AtomicU64::new(0);

/// Registers the monotonic clock hook.
///
/// # Safety
///
/// The function must be callable from any context and monotonic.
pub unsafe fn set_clock_fn(f: ClockFn) {
    CLOCK_FN.store(f as *mut (), Ordering::Release);
}

/// Returns monotonic nanoseconds since boot.
#[inline]
pub fn clock_nanos() -> u64 {
    let ptr = CLOCK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `ClockFn` pointers are ever stored.
    let f: ClockFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Sets the UTC offset of the monotonic clock (from the RTC at boot).
pub fn set_realtime_offset(ns: u64) {
    REALTIME_OFFSET_NS.store(ns, Ordering::Release);
}

/// Returns the current UTC time with microsecond resolution.
pub fn clock_micro_time() -> TimeVal {
    let ns = clock_nanos() + REALTIME_OFFSET_NS.load(Ordering::Acquire);
    TimeVal::from_nanos(ns)
}

/// Returns a monotonic timestamp `offset_ns` in the future.
#[inline]
pub fn clock_future(offset_ns: u64) -> u64 {
    clock_nanos() + offset_ns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clock_is_monotonic() {
        let a = clock_nanos();
        let b = clock_nanos();
        assert!(b > a);
    }

    #[test]
    fn timeval_roundtrip() {
        let tv = TimeVal { sec: 3, usec: 250_000 };
        assert_eq!(TimeVal::from_nanos(tv.to_nanos()), tv);
        assert!(!tv.is_zero());
        assert!(TimeVal::default().is_zero());
    }
}
