//! Per-CPU scheduler core.
//!
//! State transitions take the scheduler lock, then the thread lock, then
//! the policy lock. Counters are updated in pairs with queue membership
//! (ready_count with the policy queues, blocked_count with the blocked
//! list). Cross-CPU preemption drops every lock before delivering a
//! reschedule IPI through the installed hook.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use lepton_core::clock::clock_nanos;
use lepton_core::cpu::{self, MAX_CPUS};
use lepton_core::cpu_local::CpuLocal;
use lepton_core::sync::SpinLock;
use lepton_core::{kdebug, kinfo};

use crate::fprr::Fprr;
use crate::policy::{NUM_POLICIES, SchedPolicy};
use crate::thread::{Thread, ThreadFlags, ThreadState};

/// After this many schedulings a thread is considered cache-hot on its
/// last CPU and re-homed there absent an explicit affinity.
const CACHE_AFFINITY_SCHED_COUNT: u64 = 4;

/// Why a reschedule was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedCause {
    /// The current thread blocked on a lock or event.
    Blocked,
    /// A higher-urgency thread is ready.
    Preempted,
    /// The current thread started a timed sleep.
    Sleeping,
    /// The current thread exited.
    Terminated,
    /// Scheduling parameters changed (policy, priority, affinity).
    Updated,
    /// The current thread yielded voluntarily.
    Yielded,
}

fn state_for_cause(cause: SchedCause) -> ThreadState {
    match cause {
        SchedCause::Blocked => ThreadState::Blocked,
        SchedCause::Preempted => ThreadState::Ready,
        SchedCause::Sleeping => ThreadState::Sleeping,
        SchedCause::Terminated => ThreadState::Exited,
        SchedCause::Updated => ThreadState::Ready,
        SchedCause::Yielded => ThreadState::Ready,
    }
}

// ---------------------------------------------------------------------------
// Hooks: context switch and IPI delivery
// ---------------------------------------------------------------------------

/// Architecture context-switch hook. `prev` is `None` on the very first
/// dispatch of a CPU.
pub type SwitchFn = fn(prev: Option<&Arc<Thread>>, next: &Arc<Thread>);

fn default_switch(_prev: Option<&Arc<Thread>>, _next: &Arc<Thread>) {}

static SWITCH_FN: AtomicPtr<()> = AtomicPtr::new(default_switch as *mut ());

/// Installs the context-switch hook.
///
/// # Safety
///
/// On bare metal the hook performs the actual stack switch and may not
/// return until the previous thread is rescheduled; it must be called
/// with interrupts disabled and no locks held.
pub unsafe fn set_switch_fn(f: SwitchFn) {
    SWITCH_FN.store(f as *mut (), Ordering::Release);
}

fn context_switch(prev: Option<&Arc<Thread>>, next: &Arc<Thread>) {
    let ptr = SWITCH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `SwitchFn` pointers are ever stored.
    let f: SwitchFn = unsafe { core::mem::transmute(ptr) };
    f(prev, next)
}

/// Cross-CPU reschedule request hook.
pub type IpiFn = fn(cpu: u32, cause: SchedCause);

fn default_ipi(_cpu: u32, _cause: SchedCause) {}

static IPI_FN: AtomicPtr<()> = AtomicPtr::new(default_ipi as *mut ());

/// Installs the IPI delivery hook.
///
/// # Safety
///
/// The hook must deliver asynchronously and never block.
pub unsafe fn set_ipi_fn(f: IpiFn) {
    IPI_FN.store(f as *mut (), Ordering::Release);
}

fn deliver_ipi(cpu: u32, cause: SchedCause) {
    let ptr = IPI_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `IpiFn` pointers are ever stored.
    let f: IpiFn = unsafe { core::mem::transmute(ptr) };
    f(cpu, cause)
}

// ---------------------------------------------------------------------------
// Deferred preemption flag
// ---------------------------------------------------------------------------

static PREEMPT_PENDING: CpuLocal<AtomicBool> =
    CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);

/// Sets or clears the current CPU's deferred-preemption flag (called from
/// the tick interrupt).
pub fn set_preempt_pending(v: bool) {
    PREEMPT_PENDING.get().store(v, Ordering::Release);
}

/// Consumes the deferred-preemption flag, returning its previous value.
pub fn take_preempt_pending() -> bool {
    PREEMPT_PENDING.get().swap(false, Ordering::AcqRel)
}

/// Timeslice check consulted by the alarm tick handler.
pub fn timeslice_check(now_ns: u64) -> bool {
    match curthread() {
        Some(td) => {
            let noprempt = td.lock().preempt_count > 0;
            !noprempt && td.timeslice_expired(now_ns)
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct SchedInner {
    active: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    ready_count: usize,
    blocked_count: usize,
    total_count: usize,
    idle_time_ns: u64,
    blocked: Vec<Arc<Thread>>,
}

/// One CPU's scheduler.
pub struct Scheduler {
    /// The CPU this scheduler runs.
    pub cpu_id: u32,
    inner: SpinLock<SchedInner>,
    policies: Vec<Box<dyn SchedPolicy>>,
}

impl Scheduler {
    /// Creates a scheduler for `cpu_id` with the default policy set
    /// (FPRR in both slots).
    pub fn new(cpu_id: u32) -> Arc<Scheduler> {
        let mut policies: Vec<Box<dyn SchedPolicy>> = Vec::with_capacity(NUM_POLICIES);
        for _ in 0..NUM_POLICIES {
            policies.push(Box::new(Fprr::new()));
        }
        Arc::new(Scheduler {
            cpu_id,
            inner: SpinLock::new(SchedInner {
                active: None,
                idle: None,
                ready_count: 0,
                blocked_count: 0,
                total_count: 0,
                idle_time_ns: 0,
                blocked: Vec::new(),
            }),
            policies,
        })
    }

    /// Installs the CPU's idle thread. It never joins a ready queue.
    pub fn set_idle(&self, td: Arc<Thread>) {
        {
            let mut g = td.lock();
            g.state = ThreadState::Ready;
            g.cpu_id = self.cpu_id;
        }
        self.inner.lock().idle = Some(td);
    }

    /// Returns the currently active thread.
    pub fn active(&self) -> Option<Arc<Thread>> {
        self.inner.lock().active.clone()
    }

    /// Returns the idle thread.
    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.inner.lock().idle.clone()
    }

    /// Number of ready (queued) threads.
    pub fn ready_count(&self) -> usize {
        self.inner.lock().ready_count
    }

    /// Number of blocked/sleeping threads parked on this scheduler.
    pub fn blocked_count(&self) -> usize {
        self.inner.lock().blocked_count
    }

    /// Total threads homed on this scheduler.
    pub fn total_count(&self) -> usize {
        self.inner.lock().total_count
    }

    /// Accumulated idle time in nanoseconds.
    pub fn idle_time_ns(&self) -> u64 {
        self.inner.lock().idle_time_ns
    }

    /// Verifies the counter invariants (`ready_count` matches the policy
    /// queues, `blocked_count` matches the blocked list).
    pub fn check_counters(&self) {
        let inner = self.inner.lock();
        let queued: usize = self.policies.iter().map(|p| p.queue_size()).sum();
        assert_eq!(inner.ready_count, queued, "ready_count/queue mismatch");
        assert_eq!(
            inner.blocked_count,
            inner.blocked.len(),
            "blocked_count/list mismatch"
        );
    }

    /// Adds a thread in the EMPTY or READY state to this scheduler's
    /// ready structure.
    pub fn add_thread(&self, td: &Arc<Thread>) {
        let flags = cpu::irq_save();
        let policy_idx = {
            let mut inner = self.inner.lock();
            let mut g = td.lock();
            g.cpu_id = self.cpu_id;
            g.state = ThreadState::Ready;
            let policy_idx = g.policy;
            drop(g);
            inner.total_count += 1;
            inner.ready_count += 1;
            self.policies[policy_idx].add_thread(td.clone());
            policy_idx
        };
        self.policies[policy_idx].init_thread(td);
        cpu::irq_restore(flags);
    }

    /// Decides whether `td` should preempt this scheduler's active
    /// thread.
    pub fn should_preempt(&self, td: &Arc<Thread>) -> bool {
        let active = self.inner.lock().active.clone();
        let Some(active) = active else {
            return false;
        };
        if Arc::ptr_eq(&active, td) {
            return false;
        }

        // The preempt_count gate is universal, idle thread included: a
        // critical section on the idle path must not be switched out.
        let (a_policy, a_preempt) = {
            let g = active.lock();
            (g.policy, g.preempt_count)
        };
        if a_preempt > 0 {
            return false;
        }
        if active.flags.contains(ThreadFlags::IDLE) {
            return true;
        }
        let t_policy = td.lock().policy;

        if t_policy < a_policy {
            true
        } else if t_policy == a_policy {
            // Policy hook; the FPRR default compares priorities.
            self.policies[t_policy].should_preempt_same_policy(&active, td)
        } else {
            false
        }
    }

    /// Removes a READY thread from its policy queue.
    fn remove_ready(&self, td: &Arc<Thread>) {
        let policy_idx = td.lock().policy;
        let mut inner = self.inner.lock();
        self.policies[policy_idx].remove_thread(td);
        assert!(inner.ready_count > 0);
        inner.ready_count -= 1;
    }

    fn add_blocked(&self, td: &Arc<Thread>) {
        let mut inner = self.inner.lock();
        if !td.flags.contains(ThreadFlags::OWN_BLOCKQ) {
            inner.blocked.push(td.clone());
        }
        inner.blocked_count += 1;
    }

    fn remove_blocked(&self, td: &Arc<Thread>) {
        let mut inner = self.inner.lock();
        if !td.flags.contains(ThreadFlags::OWN_BLOCKQ) {
            if let Some(pos) = inner.blocked.iter().position(|t| Arc::ptr_eq(t, td)) {
                inner.blocked.remove(pos);
            }
        }
        assert!(inner.blocked_count > 0);
        inner.blocked_count -= 1;
    }

    /// Transitions a non-running thread into the BLOCKED state.
    pub fn block_thread(&self, td: &Arc<Thread>) {
        let flags = cpu::irq_save();
        assert_eq!(td.state(), ThreadState::Ready, "blocking a non-ready thread");
        self.remove_ready(td);
        td.lock().state = ThreadState::Blocked;
        self.add_blocked(td);
        cpu::irq_restore(flags);
    }

    /// Moves a BLOCKED/SLEEPING/WAITING thread back to READY.
    pub fn unblock_thread(&self, td: &Arc<Thread>) {
        let flags = cpu::irq_save();
        assert!(td.is_blocked(), "unblocking a non-blocked thread");
        self.remove_blocked(td);
        let policy_idx = {
            let mut g = td.lock();
            g.state = ThreadState::Ready;
            g.policy
        };
        {
            let mut inner = self.inner.lock();
            inner.ready_count += 1;
            self.policies[policy_idx].add_thread(td.clone());
        }
        cpu::irq_restore(flags);
    }

    /// Removes a non-running thread from the scheduler entirely and marks
    /// it EXITED.
    pub fn terminate_thread(&self, td: &Arc<Thread>) {
        let flags = cpu::irq_save();
        match td.state() {
            ThreadState::Ready => self.remove_ready(td),
            ThreadState::Blocked | ThreadState::Waiting => self.remove_blocked(td),
            ThreadState::Sleeping => {
                let alarm_id = td.lock().alarm_id;
                if alarm_id != 0 {
                    let _ = lepton_alarm::alarms().unregister(alarm_id);
                }
                self.remove_blocked(td);
            }
            state => panic!("sched: terminate from state {state:?} not supported"),
        }
        let policy_idx = {
            let mut g = td.lock();
            g.state = ThreadState::Exited;
            g.policy
        };
        {
            let mut inner = self.inner.lock();
            assert!(inner.total_count > 0);
            inner.total_count -= 1;
        }
        self.policies[policy_idx].deinit_thread(td);
        cpu::irq_restore(flags);
    }

    /// Re-homes a READY thread onto `dest`.
    pub fn migrate_thread(&self, dest: &Arc<Scheduler>, td: &Arc<Thread>) {
        assert!(self.cpu_id != dest.cpu_id, "migrating to the same CPU");
        kdebug!(
            "sched: migrating thread {}.{} from CPU#{} to CPU#{}",
            td.pid,
            td.tid,
            self.cpu_id,
            dest.cpu_id
        );

        let flags = cpu::irq_save();
        let policy_idx = {
            let mut g = td.lock();
            g.cpu_id = dest.cpu_id;
            g.policy
        };
        self.policies[policy_idx].on_migrate(td, dest.cpu_id);
        {
            let mut inner = self.inner.lock();
            assert!(inner.total_count > 0);
            inner.total_count -= 1;
        }
        {
            let mut inner = dest.inner.lock();
            inner.total_count += 1;
            inner.ready_count += 1;
            dest.policies[policy_idx].add_thread(td.clone());
        }
        cpu::irq_restore(flags);
    }

    fn pick_next(&self) -> Arc<Thread> {
        let mut inner = self.inner.lock();
        if inner.ready_count == 0 {
            return inner.idle.clone().expect("scheduler has no idle thread");
        }
        for policy in &self.policies {
            if let Some(td) = policy.next_thread() {
                inner.ready_count -= 1;
                return td;
            }
        }
        panic!(
            "sched: CPU#{} ready_count={} but no thread queued",
            self.cpu_id, inner.ready_count
        );
    }

    /// Performs a full reschedule of this CPU for the given cause and
    /// invokes the context-switch hook.
    pub fn reschedule(&self, cause: SchedCause) {
        let flags = cpu::irq_save();
        let prev = self.inner.lock().active.clone();

        if let Some(curr) = prev.clone() {
            if cause == SchedCause::Preempted {
                {
                    let mut g = curr.lock();
                    if g.preempt_count > 0 {
                        g.preempt_count -= 1;
                        cpu::irq_restore(flags);
                        return;
                    }
                }
                if self.inner.lock().ready_count == 0 {
                    cpu::irq_restore(flags);
                    return;
                }
            }

            let now = clock_nanos();
            let is_idle = curr.flags.contains(ThreadFlags::IDLE);
            let policy_idx = {
                let mut g = curr.lock();
                g.stats.last_active = now;
                g.stats.total_time_ns += now.saturating_sub(g.stats.last_scheduled);
                match cause {
                    SchedCause::Preempted => g.stats.preempt_count += 1,
                    SchedCause::Sleeping => g.stats.sleep_count += 1,
                    SchedCause::Yielded => g.stats.yield_count += 1,
                    _ => {}
                }
                g.state = if is_idle {
                    ThreadState::Ready
                } else {
                    state_for_cause(cause)
                };
                g.timeslice_end_ns = 0;
                g.policy
            };
            if !is_idle {
                self.policies[policy_idx].on_timeslice_end(&curr);
                self.policies[policy_idx].on_update_stats(&curr, cause);
            }

            // Affinity migration.
            let mut migrated = false;
            if cause == SchedCause::Updated && !is_idle {
                let affinity = curr.lock().affinity;
                if let Some(aff) = affinity {
                    if aff != self.cpu_id {
                        if let Some(dest) = scheduler(aff) {
                            self.migrate_thread(&dest, &curr);
                            migrated = true;
                        }
                    }
                }
            }

            if !migrated {
                if is_idle {
                    let (start, end) = {
                        let g = curr.lock();
                        (g.stats.last_scheduled, g.stats.last_active)
                    };
                    self.inner.lock().idle_time_ns += end.saturating_sub(start);
                } else {
                    match curr.state() {
                        ThreadState::Blocked | ThreadState::Sleeping | ThreadState::Waiting => {
                            self.add_blocked(&curr)
                        }
                        ThreadState::Exited => {
                            {
                                let mut inner = self.inner.lock();
                                assert!(inner.total_count > 0);
                                inner.total_count -= 1;
                            }
                            self.policies[policy_idx].deinit_thread(&curr);
                        }
                        ThreadState::Ready => {
                            let mut inner = self.inner.lock();
                            inner.ready_count += 1;
                            self.policies[policy_idx].add_thread(curr.clone());
                        }
                        state => panic!("sched: unexpected outgoing state {state:?}"),
                    }
                }
            }
        }

        let next = self.pick_next();
        let now = clock_nanos();
        {
            let mut g = next.lock();
            g.state = ThreadState::Running;
        }
        next.start_timeslice(now);
        self.inner.lock().active = Some(next.clone());
        if !next.flags.contains(ThreadFlags::IDLE) {
            let policy_idx = next.policy();
            self.policies[policy_idx].on_timeslice_start(&next);
        }

        cpu::irq_restore(flags);
        context_switch(prev.as_ref(), &next);
    }
}

// ---------------------------------------------------------------------------
// Global scheduler table and cross-CPU operations
// ---------------------------------------------------------------------------

static SCHEDULERS: SpinLock<Vec<Option<Arc<Scheduler>>>> = SpinLock::new(Vec::new());
static NUM_SCHEDULERS: AtomicUsize = AtomicUsize::new(0);

/// Creates and registers the scheduler for `cpu_id` with its idle
/// thread.
pub fn sched_init_cpu(cpu_id: u32, idle: Arc<Thread>) -> Arc<Scheduler> {
    let sched = Scheduler::new(cpu_id);
    sched.set_idle(idle);
    {
        let mut table = SCHEDULERS.lock();
        if table.len() <= cpu_id as usize {
            table.resize(cpu_id as usize + 1, None);
        }
        assert!(
            table[cpu_id as usize].is_none(),
            "scheduler for CPU#{cpu_id} already initialized"
        );
        table[cpu_id as usize] = Some(sched.clone());
    }
    NUM_SCHEDULERS.fetch_add(1, Ordering::Release);
    kinfo!("sched: CPU#{cpu_id} initialized");
    sched
}

/// Returns the scheduler for a CPU.
pub fn scheduler(cpu: u32) -> Option<Arc<Scheduler>> {
    SCHEDULERS.lock().get(cpu as usize).cloned().flatten()
}

/// Returns the number of initialized schedulers.
pub fn num_schedulers() -> usize {
    NUM_SCHEDULERS.load(Ordering::Acquire)
}

/// Returns the current CPU's scheduler.
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    scheduler(cpu::current_cpu_id())
}

/// Returns the thread running on the current CPU.
pub fn curthread() -> Option<Arc<Thread>> {
    current_scheduler().and_then(|s| s.active())
}

fn find_cpu_for_thread(td: &Arc<Thread>) -> Option<Arc<Scheduler>> {
    let (affinity, cpu_id, sched_count) = {
        let g = td.lock();
        (g.affinity, g.cpu_id, g.stats.sched_count)
    };
    if let Some(aff) = affinity {
        return scheduler(aff);
    }
    if sched_count >= CACHE_AFFINITY_SCHED_COUNT {
        if let Some(s) = scheduler(cpu_id) {
            return Some(s);
        }
    }

    // Least-loaded by homed thread count.
    let table = SCHEDULERS.lock();
    table
        .iter()
        .flatten()
        .min_by_key(|s| s.total_count())
        .cloned()
}

/// Submits a thread to the best scheduler and preempts if warranted.
pub fn sched_add(td: &Arc<Thread>) {
    let sched = find_cpu_for_thread(td).expect("no scheduler initialized");
    kdebug!(
        "sched: adding thread {}.{} [{}] to CPU#{}",
        td.pid,
        td.tid,
        td.name(),
        sched.cpu_id
    );
    sched.add_thread(td);

    if sched.should_preempt(td) {
        if sched.cpu_id == cpu::current_cpu_id() {
            sched.reschedule(SchedCause::Preempted);
        } else {
            deliver_ipi(sched.cpu_id, SchedCause::Preempted);
        }
    }
}

/// Blocks a thread. A thread running on another CPU gets a reschedule
/// IPI; the current thread reschedules immediately.
pub fn sched_block(td: &Arc<Thread>) {
    let sched = scheduler(td.cpu_id()).expect("thread has no scheduler");
    match td.state() {
        ThreadState::Running => {
            if td.cpu_id() == cpu::current_cpu_id() {
                sched.reschedule(SchedCause::Blocked);
            } else {
                deliver_ipi(td.cpu_id(), SchedCause::Blocked);
            }
        }
        _ => sched.block_thread(td),
    }
}

/// Unblocks a thread and preempts its CPU if warranted.
pub fn sched_unblock(td: &Arc<Thread>) {
    let sched = scheduler(td.cpu_id()).expect("thread has no scheduler");
    sched.unblock_thread(td);
    if sched.should_preempt(td) {
        if sched.cpu_id == cpu::current_cpu_id() {
            sched.reschedule(SchedCause::Preempted);
        } else {
            deliver_ipi(sched.cpu_id, SchedCause::Preempted);
        }
    }
}

/// Wakes a SLEEPING thread (alarm callback path).
pub fn sched_wakeup(td: &Arc<Thread>) {
    debug_assert_eq!(td.state(), ThreadState::Sleeping);
    sched_unblock(td);
}

/// Terminates a thread from any state. Running threads are terminated
/// through a reschedule (local) or IPI (remote).
pub fn sched_terminate(td: &Arc<Thread>) {
    match td.state() {
        ThreadState::Running => {
            if td.cpu_id() == cpu::current_cpu_id() {
                let sched = scheduler(td.cpu_id()).expect("thread has no scheduler");
                sched.reschedule(SchedCause::Terminated);
            } else {
                deliver_ipi(td.cpu_id(), SchedCause::Terminated);
            }
        }
        ThreadState::Exited => {}
        _ => {
            let sched = scheduler(td.cpu_id()).expect("thread has no scheduler");
            sched.terminate_thread(td);
        }
    }
}

/// Yields the current thread.
pub fn sched_yield() {
    if let Some(sched) = current_scheduler() {
        sched.reschedule(SchedCause::Yielded);
    }
}

/// Puts the current thread to sleep for `ns` nanoseconds via the alarm
/// subsystem.
pub fn sched_sleep(ns: u64) {
    let Some(td) = curthread() else {
        return;
    };
    debug_assert_eq!(td.state(), ThreadState::Running);

    let target = td.clone();
    let alarm = lepton_alarm::Alarm::new_relative(
        ns,
        Box::new(move |_a| {
            sched_wakeup(&target);
        }),
    );
    let id = lepton_alarm::alarms()
        .register(alarm)
        .expect("sleep alarm registration failed");
    td.lock().alarm_id = id;

    let sched = current_scheduler().expect("sleeping without a scheduler");
    sched.reschedule(SchedCause::Sleeping);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadFlags;

    fn idle_thread() -> Arc<Thread> {
        Thread::new_stackless(0, ThreadFlags::IDLE | ThreadFlags::KTHREAD, "idle.t")
    }

    fn worker(priority: u8) -> Arc<Thread> {
        let td = Thread::new_stackless(1, ThreadFlags::KTHREAD, "worker");
        td.lock().priority = priority;
        td
    }

    /// Builds an unregistered scheduler (not visible to the global
    /// table) for isolated state-machine tests.
    fn isolated_sched() -> Arc<Scheduler> {
        let sched = Scheduler::new(0);
        sched.set_idle(idle_thread());
        sched
    }

    #[test]
    fn add_makes_thread_ready() {
        let sched = isolated_sched();
        let td = worker(100);
        sched.add_thread(&td);
        assert_eq!(td.state(), ThreadState::Ready);
        assert_eq!(sched.ready_count(), 1);
        assert_eq!(sched.total_count(), 1);
        sched.check_counters();
    }

    #[test]
    fn first_reschedule_runs_highest_priority() {
        let sched = isolated_sched();
        let low = worker(10);
        let high = worker(200);
        sched.add_thread(&low);
        sched.add_thread(&high);

        sched.reschedule(SchedCause::Updated);
        let active = sched.active().unwrap();
        assert!(Arc::ptr_eq(&active, &high));
        assert_eq!(high.state(), ThreadState::Running);
        assert_eq!(low.state(), ThreadState::Ready);
        assert_eq!(sched.ready_count(), 1);
        sched.check_counters();
    }

    #[test]
    fn idle_runs_when_no_thread_ready() {
        let sched = isolated_sched();
        sched.reschedule(SchedCause::Updated);
        let active = sched.active().unwrap();
        assert!(active.flags.contains(ThreadFlags::IDLE));
        assert_eq!(active.state(), ThreadState::Running);
    }

    #[test]
    fn yield_round_robins_equal_priority() {
        let sched = isolated_sched();
        let a = worker(50);
        let b = worker(50);
        sched.add_thread(&a);
        sched.add_thread(&b);

        sched.reschedule(SchedCause::Updated);
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &a));
        sched.reschedule(SchedCause::Yielded);
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &b));
        assert_eq!(a.state(), ThreadState::Ready);
        sched.reschedule(SchedCause::Yielded);
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &a));
        sched.check_counters();
    }

    #[test]
    fn blocking_moves_to_blocked_list() {
        let sched = isolated_sched();
        let td = worker(50);
        sched.add_thread(&td);
        sched.reschedule(SchedCause::Updated);
        assert_eq!(td.state(), ThreadState::Running);

        sched.reschedule(SchedCause::Blocked);
        assert_eq!(td.state(), ThreadState::Blocked);
        assert_eq!(sched.blocked_count(), 1);
        assert!(sched.active().unwrap().flags.contains(ThreadFlags::IDLE));
        sched.check_counters();

        sched.unblock_thread(&td);
        assert_eq!(td.state(), ThreadState::Ready);
        assert_eq!(sched.blocked_count(), 0);
        assert_eq!(sched.ready_count(), 1);
        sched.check_counters();
    }

    #[test]
    fn terminate_removes_from_total() {
        let sched = isolated_sched();
        let td = worker(50);
        sched.add_thread(&td);
        assert_eq!(sched.total_count(), 1);

        sched.terminate_thread(&td);
        assert_eq!(td.state(), ThreadState::Exited);
        assert_eq!(sched.total_count(), 0);
        assert_eq!(sched.ready_count(), 0);
        sched.check_counters();
    }

    #[test]
    fn terminated_running_thread_reaps_on_reschedule() {
        let sched = isolated_sched();
        let td = worker(50);
        sched.add_thread(&td);
        sched.reschedule(SchedCause::Updated);
        assert_eq!(td.state(), ThreadState::Running);

        sched.reschedule(SchedCause::Terminated);
        assert_eq!(td.state(), ThreadState::Exited);
        assert_eq!(sched.total_count(), 0);
        sched.check_counters();
    }

    #[test]
    fn preempted_with_no_ready_thread_noops() {
        let sched = isolated_sched();
        let td = worker(50);
        sched.add_thread(&td);
        sched.reschedule(SchedCause::Updated);

        // No other ready thread: request is a no-op.
        sched.reschedule(SchedCause::Preempted);
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &td));
        assert_eq!(td.state(), ThreadState::Running);
    }

    #[test]
    fn preempt_count_defers_preemption() {
        let sched = isolated_sched();
        let a = worker(50);
        let b = worker(200);
        sched.add_thread(&a);
        sched.reschedule(SchedCause::Updated);
        a.lock().preempt_count = 1;
        sched.add_thread(&b);

        sched.reschedule(SchedCause::Preempted);
        // The request consumed the preempt_count instead of switching.
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &a));
        assert_eq!(a.lock().preempt_count, 0);

        sched.reschedule(SchedCause::Preempted);
        assert!(Arc::ptr_eq(&sched.active().unwrap(), &b));
    }

    #[test]
    fn should_preempt_honors_policy_order() {
        let sched = isolated_sched();
        let active = worker(100);
        sched.add_thread(&active);
        sched.reschedule(SchedCause::Updated);

        let higher_pri = worker(150);
        let lower_pri = worker(50);
        let driver = worker(200);
        driver.lock().policy = crate::policy::POLICY_DRIVER;

        assert!(sched.should_preempt(&higher_pri));
        assert!(!sched.should_preempt(&lower_pri));
        // Driver policy is lower-urgency than system.
        assert!(!sched.should_preempt(&driver));
    }

    #[test]
    fn stats_accumulate() {
        let sched = isolated_sched();
        let td = worker(50);
        sched.add_thread(&td);
        sched.reschedule(SchedCause::Updated);
        sched.reschedule(SchedCause::Yielded);
        sched.reschedule(SchedCause::Yielded);

        let g = td.lock();
        assert_eq!(g.stats.yield_count, 1);
        assert!(g.stats.sched_count >= 2);
    }

    #[test]
    fn migrate_rehomes_thread() {
        let src = isolated_sched();
        let dst = {
            let s = Scheduler::new(1);
            s.set_idle(idle_thread());
            s
        };
        let td = worker(50);
        src.add_thread(&td);
        assert_eq!(src.total_count(), 1);

        src.remove_ready(&td);
        src.migrate_thread(&dst, &td);
        assert_eq!(td.cpu_id(), 1);
        assert_eq!(src.total_count(), 0);
        assert_eq!(dst.total_count(), 1);
        assert_eq!(dst.ready_count(), 1);
        dst.check_counters();
    }

    #[test]
    fn preempt_pending_flag_roundtrip() {
        set_preempt_pending(true);
        assert!(take_preempt_pending());
        assert!(!take_preempt_pending());
    }
}
