//! Per-CPU idle loop.
//!
//! Runs as the CPU's idle thread: yields whenever work appears, pauses
//! otherwise. If nothing arrives for a full second it reprograms the
//! tickless alarm source defensively in case a programmed expiry was
//! lost.

use lepton_core::clock::{MS_TO_NS, clock_nanos};
use lepton_core::cpu;
use lepton_core::kdebug;

use crate::scheduler::{current_scheduler, sched_yield};

/// How long the idle loop waits before defensively reprogramming the
/// alarm source.
const IDLE_REARM_NS: u64 = 1_000 * MS_TO_NS;

/// Body of every CPU's idle thread. Never returns.
pub fn idle_loop() -> ! {
    let sched = current_scheduler().expect("idle loop without a scheduler");
    kdebug!("sched: CPU#{} entering idle", sched.cpu_id);

    let mut rearm_at = clock_nanos() + IDLE_REARM_NS;
    loop {
        let now = clock_nanos();
        if now >= rearm_at {
            lepton_alarm::reschedule_source();
            rearm_at = now + IDLE_REARM_NS;
        }

        if sched.ready_count() > 0 {
            sched_yield();
            rearm_at = clock_nanos() + IDLE_REARM_NS;
        }

        cpu::cpu_pause();
        cpu::cpu_pause();
        cpu::cpu_pause();
    }
}
