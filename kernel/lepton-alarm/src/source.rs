//! Hardware alarm source abstraction.
//!
//! An [`AlarmSource`] wraps a hardware timer (HPET comparator, PIT, LAPIC
//! timer) behind the [`AlarmHw`] trait. Sources advertise capability
//! flags; the subsystem programs absolute values when the hardware
//! supports them and falls back to relative deltas otherwise.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use lepton_core::clock::clock_nanos;
use lepton_core::kdebug;
use lepton_core::sync::SpinLock;
use lepton_core::{Errno, KResult};

bitflags! {
    /// Capabilities (and selected mode) of an alarm source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AlarmCaps: u32 {
        /// Fires once per programming.
        const ONE_SHOT = 1 << 0;
        /// Fires repeatedly at the programmed interval.
        const PERIODIC = 1 << 1;
        /// Comparator takes absolute counter values.
        const ABSOLUTE = 1 << 2;
    }
}

/// Interrupt handler invoked when a source fires.
pub type AlarmIrqHandler = fn();

/// Hardware operations implemented by each timer driver.
pub trait AlarmHw: Send + Sync {
    /// Programs the hardware for the given mode and hooks up the IRQ.
    fn init(&self, mode: AlarmCaps, handler: AlarmIrqHandler) -> KResult<()>;
    /// Starts the timer.
    fn enable(&self) -> KResult<()>;
    /// Stops the timer.
    fn disable(&self) -> KResult<()>;
    /// Programs the comparator, in source units.
    fn setval(&self, value: u64) -> KResult<()>;
}

struct SourceState {
    mode: AlarmCaps,
}

/// A registered hardware timer.
pub struct AlarmSource {
    name: &'static str,
    caps: AlarmCaps,
    /// Nanoseconds per counter unit.
    scale_ns: u64,
    /// Largest programmable counter value.
    value_mask: u64,
    state: SpinLock<SourceState>,
    hw: Box<dyn AlarmHw>,
}

impl AlarmSource {
    /// Creates a source description. The source is inert until
    /// [`init`](Self::init) selects a mode.
    ///
    /// # Panics
    ///
    /// Panics if the source supports neither one-shot nor periodic mode.
    pub fn new(
        name: &'static str,
        caps: AlarmCaps,
        scale_ns: u64,
        value_mask: u64,
        hw: Box<dyn AlarmHw>,
    ) -> Self {
        assert!(
            caps.intersects(AlarmCaps::ONE_SHOT | AlarmCaps::PERIODIC),
            "alarm source '{name}' must support either one-shot or periodic mode"
        );
        Self {
            name,
            caps,
            scale_ns,
            value_mask,
            state: SpinLock::new(SourceState {
                mode: AlarmCaps::empty(),
            }),
            hw,
        }
    }

    /// Returns the source's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the source's capability flags.
    pub fn caps(&self) -> AlarmCaps {
        self.caps
    }

    /// Selects a mode and installs the IRQ handler.
    ///
    /// # Errors
    ///
    /// `EINVAL` if `mode` is not exactly one of ONE_SHOT/PERIODIC or the
    /// source does not support it; `EBUSY` if already initialized.
    pub fn init(&self, mode: AlarmCaps, handler: AlarmIrqHandler) -> KResult<()> {
        if mode != AlarmCaps::ONE_SHOT && mode != AlarmCaps::PERIODIC {
            return Err(Errno::Inval);
        }
        if !self.caps.contains(mode) {
            kdebug!("alarm: source '{}' does not support mode {mode:?}", self.name);
            return Err(Errno::Inval);
        }

        let mut state = self.state.lock();
        if !state.mode.is_empty() {
            return Err(Errno::Busy);
        }
        self.hw.init(mode, handler)?;
        state.mode = mode;
        Ok(())
    }

    /// Starts the timer.
    pub fn enable(&self) -> KResult<()> {
        let _state = self.state.lock();
        self.hw.enable()
    }

    /// Stops the timer.
    pub fn disable(&self) -> KResult<()> {
        let _state = self.state.lock();
        self.hw.disable()
    }

    /// Programs the comparator for an absolute monotonic time.
    ///
    /// Sources without [`AlarmCaps::ABSOLUTE`] get the delta from now.
    ///
    /// # Errors
    ///
    /// `EINVAL` if the target is in the past (relative sources only);
    /// `ERANGE` if the scaled value falls outside `[scale, value_mask]`.
    pub fn setval_abs_ns(&self, abs_ns: u64) -> KResult<()> {
        let value = if self.caps.contains(AlarmCaps::ABSOLUTE) {
            abs_ns / self.scale_ns
        } else {
            let now = clock_nanos();
            if abs_ns <= now {
                kdebug!("alarm: source '{}' target {abs_ns} is in the past", self.name);
                return Err(Errno::Inval);
            }
            (abs_ns - now) / self.scale_ns
        };
        self.check_range(value)?;

        let _state = self.state.lock();
        self.hw.setval(value)
    }

    /// Programs the comparator for a delta from now.
    ///
    /// Sources with [`AlarmCaps::ABSOLUTE`] get `now + rel_ns` instead.
    pub fn setval_rel_ns(&self, rel_ns: u64) -> KResult<()> {
        let value = if self.caps.contains(AlarmCaps::ABSOLUTE) {
            (clock_nanos() + rel_ns) / self.scale_ns
        } else {
            rel_ns / self.scale_ns
        };
        self.check_range(value)?;

        let _state = self.state.lock();
        self.hw.setval(value)
    }

    fn check_range(&self, value: u64) -> KResult<()> {
        if value < self.scale_ns || value > self.value_mask {
            kdebug!(
                "alarm: source '{}' value {value} out of range [min={}, max={}]",
                self.name,
                self.scale_ns,
                self.value_mask
            );
            return Err(Errno::Range);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

static SOURCES: SpinLock<Vec<Arc<AlarmSource>>> = SpinLock::new(Vec::new());
static TICKLESS: SpinLock<Option<Arc<AlarmSource>>> = SpinLock::new(None);
static TICK: SpinLock<Option<Arc<AlarmSource>>> = SpinLock::new(None);

/// Registers a hardware alarm source.
pub fn register_source(source: Arc<AlarmSource>) {
    kdebug!("alarm: registered alarm source '{}'", source.name());
    SOURCES.lock().push(source);
}

/// Looks up a source by name.
pub fn source_get(name: &str) -> Option<Arc<AlarmSource>> {
    SOURCES.lock().iter().find(|s| s.name() == name).cloned()
}

pub(crate) fn set_tickless_source(source: Arc<AlarmSource>) {
    *TICKLESS.lock() = Some(source);
}

pub(crate) fn set_tick_source(source: Arc<AlarmSource>) {
    *TICK.lock() = Some(source);
}

/// Non-panicking variant of [`tickless_source`], for rearm paths that can
/// run before the subsystem is initialized.
pub(crate) fn tickless_probe() -> Option<Arc<AlarmSource>> {
    TICKLESS.lock().clone()
}

/// Returns the tickless (one-shot) source.
///
/// # Panics
///
/// Panics if the subsystem has not been initialized.
pub fn tickless_source() -> Arc<AlarmSource> {
    TICKLESS
        .lock()
        .clone()
        .expect("alarm subsystem not initialized")
}

/// Returns the periodic tick source, if one is configured.
pub fn tick_source() -> Option<Arc<AlarmSource>> {
    TICK.lock().clone()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc as StdArc;

    /// Records programmed values for assertions.
    pub struct MockHw {
        pub last_value: StdArc<AtomicU64>,
        pub enables: StdArc<AtomicU64>,
    }

    impl AlarmHw for MockHw {
        fn init(&self, _mode: AlarmCaps, _handler: AlarmIrqHandler) -> KResult<()> {
            Ok(())
        }
        fn enable(&self) -> KResult<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disable(&self) -> KResult<()> {
            Ok(())
        }
        fn setval(&self, value: u64) -> KResult<()> {
            self.last_value.store(value, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn mock_source(
        name: &'static str,
        caps: AlarmCaps,
        scale_ns: u64,
        mask: u64,
    ) -> (AlarmSource, StdArc<AtomicU64>, StdArc<AtomicU64>) {
        let last = StdArc::new(AtomicU64::new(0));
        let enables = StdArc::new(AtomicU64::new(0));
        let hw = MockHw {
            last_value: last.clone(),
            enables: enables.clone(),
        };
        (
            AlarmSource::new(name, caps, scale_ns, mask, Box::new(hw)),
            last,
            enables,
        )
    }

    fn noop_handler() {}

    #[test]
    fn init_validates_mode() {
        let (src, _, _) = mock_source("m0", AlarmCaps::ONE_SHOT | AlarmCaps::ABSOLUTE, 1, u64::MAX);
        assert_eq!(src.init(AlarmCaps::PERIODIC, noop_handler), Err(Errno::Inval));
        assert_eq!(
            src.init(AlarmCaps::ONE_SHOT | AlarmCaps::PERIODIC, noop_handler),
            Err(Errno::Inval)
        );
        assert!(src.init(AlarmCaps::ONE_SHOT, noop_handler).is_ok());
        // Second init is rejected.
        assert_eq!(src.init(AlarmCaps::ONE_SHOT, noop_handler), Err(Errno::Busy));
    }

    #[test]
    fn absolute_source_programs_scaled_value() {
        let (src, last, _) =
            mock_source("m1", AlarmCaps::ONE_SHOT | AlarmCaps::ABSOLUTE, 100, u64::MAX);
        src.setval_abs_ns(1_000_000).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let (src, _, _) = mock_source("m2", AlarmCaps::ONE_SHOT | AlarmCaps::ABSOLUTE, 100, 5_000);
        // 1_000_000 / 100 = 10_000 > mask of 5_000.
        assert_eq!(src.setval_abs_ns(1_000_000), Err(Errno::Range));
        // Below the scale floor.
        assert_eq!(src.setval_abs_ns(50), Err(Errno::Range));
    }

    #[test]
    fn relative_source_subtracts_now() {
        let (src, last, _) = mock_source("m3", AlarmCaps::ONE_SHOT, 1, u64::MAX);
        let now = clock_nanos();
        // A target well in the future programs a delta.
        src.setval_abs_ns(now + 1_000_000).unwrap();
        let programmed = last.load(Ordering::SeqCst);
        assert!(programmed > 0 && programmed <= 1_000_000);
        // A past target is rejected.
        assert_eq!(src.setval_abs_ns(1), Err(Errno::Inval));
    }

    #[test]
    #[should_panic(expected = "must support either")]
    fn source_without_firing_mode_panics() {
        let _ = mock_source("m4", AlarmCaps::ABSOLUTE, 1, u64::MAX);
    }

    #[test]
    fn registry_lookup() {
        let (src, _, _) = mock_source("hpet-test", AlarmCaps::ONE_SHOT | AlarmCaps::ABSOLUTE, 1, u64::MAX);
        register_source(Arc::new(src));
        assert!(source_get("hpet-test").is_some());
        assert!(source_get("missing").is_none());
    }
}
