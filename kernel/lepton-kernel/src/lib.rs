//! Kernel glue: process lifecycle, syscalls, parameters, and the boot
//! wiring between the subsystem crates.
//!
//! The subsystem crates are deliberately freestanding; this crate
//! installs the cross-cutting hooks (scheduler blocking for the sync
//! primitives, the timeslice check for the alarm tick, the console UART
//! parameter) and hosts the process model and syscall surface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod init;
pub mod params;
pub mod proc;
pub mod syscall;

use lepton_core::sched::Tid;
use lepton_sched::{sched_block, sched_unblock, sched_yield};

// ---------------------------------------------------------------------------
// Scheduler hook glue
// ---------------------------------------------------------------------------

fn hook_current_tid() -> Tid {
    lepton_sched::curthread().map_or(0, |td| td.tid)
}

fn hook_block_current(_reason: &'static str) {
    let Some(td) = lepton_sched::curthread() else {
        // No scheduler yet: the caller's retry loop spins.
        core::hint::spin_loop();
        return;
    };
    // Consume a wake that raced ahead of this block.
    if td.take_wake() {
        return;
    }
    sched_block(&td);
}

fn hook_unblock(tid: Tid) {
    let Some(td) = proc::thread_by_tid(tid) else {
        return;
    };
    if td.is_blocked() {
        sched_unblock(&td);
    } else {
        // The target has not blocked yet; leave it a permit.
        td.post_wake();
    }
}

fn hook_yield() {
    sched_yield();
}

fn hook_set_preempted(v: bool) {
    lepton_sched::set_preempt_pending(v);
}

/// Installs the cross-crate hooks. Called once during early boot,
/// before secondary CPUs or any blocking primitive user starts.
pub fn install_hooks() {
    // SAFETY: the hook implementations are callable from any context;
    // install_hooks runs before concurrent use.
    unsafe {
        lepton_core::sched::set_sched_hooks(
            hook_current_tid,
            hook_block_current,
            hook_unblock,
            hook_yield,
            hook_set_preempted,
        );
        lepton_alarm::set_timeslice_check_fn(lepton_sched::timeslice_check);
    }
}

/// Applies kernel parameters that other subsystems consume.
pub fn apply_params() {
    if let Some(port) = params::get("console.uart.port") {
        lepton_tty::set_console_port_param(&port);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn hooks_install_without_scheduler() {
        super::install_hooks();
        // With no scheduler initialized the hooks are inert.
        assert_eq!(super::hook_current_tid(), 0);
        super::hook_block_current("test");
        super::hook_unblock(42);
        super::hook_yield();
        super::hook_set_preempted(false);
    }

    #[test]
    fn console_param_applies() {
        super::params::parse_cmdline("console.uart.port=com2 loglevel=debug");
        super::apply_params();
        assert_eq!(lepton_tty::console_port(), lepton_tty::COM2);
        // Restore the default for other tests.
        super::params::parse_cmdline("console.uart.port=com4");
        super::apply_params();
    }
}
