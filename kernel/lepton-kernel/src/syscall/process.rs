//! Process-management syscalls.

use lepton_core::KResult;
use lepton_core::sched::Tid;

use super::current_process;
use crate::proc::thread_stop;

/// `brk(addr)`: adjusts the heap end and returns the new end. Invalid
/// addresses leave the range untouched and return the current end.
pub fn sys_brk(addr: u64) -> KResult<u64> {
    let proc = current_process()?;
    Ok(proc.brk(addr))
}

/// `set_tid_address(ptr)`: records the clear-on-exit pointer and
/// returns the caller's tid.
pub fn sys_set_tid_address(ptr: u64) -> KResult<Tid> {
    let proc = current_process()?;
    proc.tid_address
        .store(ptr, core::sync::atomic::Ordering::Release);
    Ok(lepton_sched::curthread().map_or(0, |td| td.tid))
}

/// `exit_group(code)`: stops every thread of the calling process. Does
/// not return once the current thread is stopped.
pub fn sys_exit_group(code: i32) -> KResult<()> {
    let proc = current_process()?;
    let current = lepton_sched::curthread();

    // Stop the siblings first so none of them keeps running while the
    // process tears down, then stop the caller last.
    for td in proc.threads() {
        let is_current = current.as_ref().is_some_and(|c| c.tid == td.tid);
        if !is_current {
            thread_stop(&td);
        }
    }
    proc.exit_all(code);
    if let Some(td) = current {
        thread_stop(&td);
        // Unreachable on a live scheduler; reached in host tests.
    }
    Ok(())
}
