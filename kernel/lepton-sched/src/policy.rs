//! Scheduling policy interface.
//!
//! Policies are totally ordered: the dispatcher always serves the
//! lowest-indexed non-empty policy. Each per-CPU scheduler instantiates
//! its own policy objects; a policy guards its ready structure with its
//! own internal lock.

use alloc::sync::Arc;

use crate::scheduler::SchedCause;
use crate::thread::Thread;

/// Number of policy slots per scheduler.
pub const NUM_POLICIES: usize = 2;
/// Policy index for kernel/system threads (served first).
pub const POLICY_SYSTEM: usize = 0;
/// Policy index for driver service threads.
pub const POLICY_DRIVER: usize = 1;

/// A scheduling policy instance owned by one CPU's scheduler.
pub trait SchedPolicy: Send + Sync {
    /// Called when a thread first joins this policy on this CPU.
    fn init_thread(&self, td: &Arc<Thread>);
    /// Called when a thread leaves this policy (termination or policy
    /// change).
    fn deinit_thread(&self, td: &Arc<Thread>);
    /// Enqueues a READY thread.
    fn add_thread(&self, td: Arc<Thread>);
    /// Removes a specific thread from the ready structure.
    fn remove_thread(&self, td: &Arc<Thread>);
    /// Dequeues the next thread to run, if any.
    fn next_thread(&self) -> Option<Arc<Thread>>;
    /// The thread is starting a timeslice.
    fn on_timeslice_start(&self, td: &Arc<Thread>);
    /// The thread finished a timeslice.
    fn on_timeslice_end(&self, td: &Arc<Thread>);
    /// The thread is migrating to another CPU.
    fn on_migrate(&self, td: &Arc<Thread>, new_cpu: u32);
    /// Statistics update after a reschedule decision.
    fn on_update_stats(&self, td: &Arc<Thread>, reason: SchedCause);
    /// Whether `td` should preempt `active` when both share this policy.
    fn should_preempt_same_policy(&self, active: &Arc<Thread>, td: &Arc<Thread>) -> bool {
        td.priority() > active.priority()
    }
    /// Number of queued ready threads.
    fn queue_size(&self) -> usize;
}
