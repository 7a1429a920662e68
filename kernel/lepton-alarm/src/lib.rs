//! Alarm subsystem: hardware timer sources and the pending-alarm queue.
//!
//! Two hardware sources drive the subsystem: a *tickless* one-shot source
//! programmed to the nearest future expiry, and an optional *tick* source
//! firing at a fixed cadence to drive preemption. Pending alarms live in
//! an expiry-ordered multimap; the interrupt handlers drain expired
//! entries, invoke their callbacks, and reprogram the tickless source.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod alarm;
mod source;

pub use alarm::{
    Alarm, AlarmCallback, AlarmId, AlarmQueue, alarms, handle_tick_irq, handle_tickless_irq,
    init, reschedule_source, set_tick_period_ns, set_timeslice_check_fn, sleep_ms,
};
pub use source::{
    AlarmCaps, AlarmHw, AlarmIrqHandler, AlarmSource, register_source, source_get, tick_source,
    tickless_source,
};
