//! Timer syscalls: `alarm`, `getitimer`, `setitimer`.
//!
//! Only `ITIMER_REAL` is supported; the virtual and profiling timers
//! return `ENOTSUP`. Expiries deliver `SIGALRM` to the process; a
//! periodic itimer re-arms itself from its callback by pushing the
//! alarm's expiry forward (the registry re-inserts it).

use alloc::boxed::Box;

use lepton_core::clock::{SEC_TO_NS, TimeVal, clock_nanos};
use lepton_core::{Errno, KResult, kdebug};

use super::current_process;
use crate::proc::{ITimerVal, SIGALRM, proc_lookup};

/// Wall-clock interval timer.
pub const ITIMER_REAL: i32 = 0;
/// Virtual (user CPU time) timer — unsupported.
pub const ITIMER_VIRTUAL: i32 = 1;
/// Profiling timer — unsupported.
pub const ITIMER_PROF: i32 = 2;

fn deliver_sigalrm(pid: u32) {
    match proc_lookup(pid) {
        Some(proc) => proc.post_signal(SIGALRM),
        None => kdebug!("alarm: process {pid} gone before SIGALRM delivery"),
    }
}

/// `alarm(seconds)`: arms (or with 0, cancels) a one-shot SIGALRM.
/// Returns the seconds remaining on any previously pending alarm.
pub fn sys_alarm(seconds: u32) -> KResult<u32> {
    let proc = current_process()?;
    let alarms = lepton_alarm::alarms();

    // Cancel any existing pending alarm, computing its remainder.
    let mut pending = proc.pending_alarm.lock();
    let mut remaining = 0;
    if *pending != 0 {
        if let Some(expiry) = alarms.expiry_of(*pending) {
            remaining = expiry.saturating_sub(clock_nanos()).div_ceil(SEC_TO_NS) as u32;
        }
        let _ = alarms.unregister(*pending);
        *pending = 0;
    }

    if seconds == 0 {
        return Ok(remaining);
    }

    let pid = proc.pid;
    let alarm = lepton_alarm::Alarm::new_relative(
        seconds as u64 * SEC_TO_NS,
        Box::new(move |_a| deliver_sigalrm(pid)),
    );
    *pending = alarms.register(alarm).map_err(|_| Errno::Inval)?;
    Ok(remaining)
}

/// `getitimer(which, out)`.
pub fn sys_getitimer(which: i32) -> KResult<ITimerVal> {
    if which != ITIMER_REAL {
        return Err(Errno::NotSup);
    }
    let proc = current_process()?;
    let itimer = *proc.itimer.lock();

    // Report the time remaining rather than the programmed value.
    let alarm_id = *proc.itimer_alarm.lock();
    if alarm_id != 0 {
        if let Some(expiry) = lepton_alarm::alarms().expiry_of(alarm_id) {
            let remaining = expiry.saturating_sub(clock_nanos());
            return Ok(ITimerVal {
                interval: itimer.interval,
                value: TimeVal::from_nanos(remaining),
            });
        }
    }
    Ok(ITimerVal {
        interval: itimer.interval,
        value: TimeVal::default(),
    })
}

/// `setitimer(which, new, old)`: returns the previous timer value.
pub fn sys_setitimer(which: i32, new: ITimerVal) -> KResult<ITimerVal> {
    if which != ITIMER_REAL {
        return Err(Errno::NotSup);
    }
    let proc = current_process()?;
    let old = sys_getitimer(which)?;
    let alarms = lepton_alarm::alarms();

    // Cancel the previous alarm.
    {
        let mut alarm_id = proc.itimer_alarm.lock();
        if *alarm_id != 0 {
            let _ = alarms.unregister(*alarm_id);
            *alarm_id = 0;
        }
    }
    *proc.itimer.lock() = new;

    if !new.value.is_zero() {
        let pid = proc.pid;
        let interval_ns = new.interval.to_nanos();
        let alarm = lepton_alarm::Alarm::new_relative(
            new.value.to_nanos(),
            Box::new(move |a| {
                deliver_sigalrm(pid);
                if interval_ns != 0 {
                    // Periodic: push the expiry forward; the registry
                    // re-inserts the alarm after the callback returns.
                    a.expires_ns = clock_nanos() + interval_ns;
                }
            }),
        );
        *proc.itimer_alarm.lock() = alarms.register(alarm).map_err(|_| Errno::Inval)?;
    }

    Ok(old)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_real_timers_unsupported() {
        assert_eq!(sys_getitimer(ITIMER_VIRTUAL).unwrap_err(), Errno::NotSup);
        assert_eq!(
            sys_setitimer(ITIMER_PROF, ITimerVal::default()).unwrap_err(),
            Errno::NotSup
        );
    }
}
