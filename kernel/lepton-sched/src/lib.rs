//! Per-CPU thread scheduler.
//!
//! Each CPU owns a [`Scheduler`] with per-policy ready structures, a
//! blocked list, and counters. All state transitions take the scheduler,
//! thread, and policy locks in that order. Cross-CPU operations drop all
//! locks before delivering a reschedule IPI through the installed hook.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod fprr;
mod idle;
mod policy;
mod scheduler;
mod thread;

pub use fprr::Fprr;
pub use idle::idle_loop;
pub use policy::{NUM_POLICIES, POLICY_DRIVER, POLICY_SYSTEM, SchedPolicy};
pub use scheduler::{
    IpiFn, SchedCause, Scheduler, SwitchFn, current_scheduler, curthread, num_schedulers,
    sched_add, sched_block, sched_init_cpu, sched_sleep, sched_terminate, sched_unblock,
    sched_wakeup, sched_yield, scheduler, set_ipi_fn, set_preempt_pending, set_switch_fn,
    take_preempt_pending, timeslice_check,
};
pub use thread::{Thread, ThreadFlags, ThreadState, ThreadStats, Tid};
