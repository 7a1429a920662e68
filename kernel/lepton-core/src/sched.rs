//! Scheduler hook points.
//!
//! Synchronization primitives in this crate block and wake threads through
//! the hooks below instead of depending on the scheduler crate directly.
//! The kernel installs real implementations at boot; the host defaults
//! degrade blocking into spin-waiting so primitives remain correct (if
//! inefficient) under `cargo test` with OS threads.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Thread identifier used by the hook layer. 0 means "no thread".
pub type Tid = u64;

/// Returns the id of the currently running thread.
pub type CurrentTidFn = fn() -> Tid;
/// Suspends the current thread until it is unblocked. The reason string is
/// for diagnostics only.
pub type BlockFn = fn(reason: &'static str);
/// Marks the given thread runnable again.
pub type UnblockFn = fn(tid: Tid);
/// Yields the current thread's timeslice.
pub type YieldFn = fn();
/// Requests deferred preemption of the current CPU.
pub type SetPreemptedFn = fn(bool);

fn default_current_tid() -> Tid {
    0
}

fn default_block(_reason: &'static str) {
    // No scheduler: let the caller's retry loop spin.
    core::hint::spin_loop();
}

fn default_unblock(_tid: Tid) {}

fn default_yield() {
    core::hint::spin_loop();
}

fn default_set_preempted(_v: bool) {}

static CURRENT_TID_FN: AtomicPtr<()> = AtomicPtr::new(default_current_tid as *mut ());
static BLOCK_FN: AtomicPtr<()> = AtomicPtr::new(default_block as *mut ());
static UNBLOCK_FN: AtomicPtr<()> = AtomicPtr::new(default_unblock as *mut ());
static YIELD_FN: AtomicPtr<()> = AtomicPtr::new(default_yield as *mut ());
static SET_PREEMPTED_FN: AtomicPtr<()> = AtomicPtr::new(default_set_preempted as *mut ());

/// Installs the scheduler hooks.
///
/// # Safety
///
/// All functions must be safe to call from any thread context. `block`
/// must only be called from a context that can be suspended; `unblock`
/// must tolerate ids of threads that are not currently blocked.
pub unsafe fn set_sched_hooks(
    current_tid: CurrentTidFn,
    block: BlockFn,
    unblock: UnblockFn,
    yield_now: YieldFn,
    set_preempted: SetPreemptedFn,
) {
    CURRENT_TID_FN.store(current_tid as *mut (), Ordering::Release);
    BLOCK_FN.store(block as *mut (), Ordering::Release);
    UNBLOCK_FN.store(unblock as *mut (), Ordering::Release);
    YIELD_FN.store(yield_now as *mut (), Ordering::Release);
    SET_PREEMPTED_FN.store(set_preempted as *mut (), Ordering::Release);
}

macro_rules! load_hook {
    ($static:ident, $ty:ty) => {{
        let ptr = $static.load(Ordering::Acquire);
        // SAFETY: Only valid pointers of the right type are ever stored.
        unsafe { core::mem::transmute::<*mut (), $ty>(ptr) }
    }};
}

/// Returns the current thread id (0 if no scheduler is running).
#[inline]
pub fn current_tid() -> Tid {
    load_hook!(CURRENT_TID_FN, CurrentTidFn)()
}

/// Blocks the current thread. Returns when some other context calls
/// [`unblock`] with this thread's id (or immediately under the host
/// default, leaving the caller's retry loop to spin).
#[inline]
pub fn block_current(reason: &'static str) {
    load_hook!(BLOCK_FN, BlockFn)(reason)
}

/// Wakes a blocked thread.
#[inline]
pub fn unblock(tid: Tid) {
    load_hook!(UNBLOCK_FN, UnblockFn)(tid)
}

/// Yields the current thread's timeslice.
#[inline]
pub fn yield_now() {
    load_hook!(YIELD_FN, YieldFn)()
}

/// Sets or clears the deferred-preemption flag for the current CPU.
#[inline]
pub fn set_preempted(v: bool) {
    load_hook!(SET_PREEMPTED_FN, SetPreemptedFn)(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AOrd};

    static LAST_UNBLOCKED: AtomicU64 = AtomicU64::new(0);

    fn record_unblock(tid: Tid) {
        LAST_UNBLOCKED.store(tid, AOrd::SeqCst);
    }

    #[test]
    fn hooks_are_replaceable() {
        unsafe {
            set_sched_hooks(
                default_current_tid,
                default_block,
                record_unblock,
                default_yield,
                default_set_preempted,
            );
        }
        unblock(42);
        assert_eq!(LAST_UNBLOCKED.load(AOrd::SeqCst), 42);
        unsafe {
            set_sched_hooks(
                default_current_tid,
                default_block,
                default_unblock,
                default_yield,
                default_set_preempted,
            );
        }
    }

    #[test]
    fn defaults_are_inert() {
        assert_eq!(current_tid(), 0);
        block_current("test");
        yield_now();
        set_preempted(true);
    }
}
