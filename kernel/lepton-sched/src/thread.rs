//! Kernel thread objects.
//!
//! A [`Thread`] carries its scheduling state machine
//! (EMPTY → READY → {RUNNING, BLOCKED, SLEEPING, WAITING} → READY → … →
//! EXITED), policy/priority/affinity, per-thread statistics, a pinned
//! kernel stack, and the machine context block used by the context
//! switch. Every transition is made under the thread lock by the owning
//! scheduler.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use lepton_core::clock::MS_TO_NS;
use lepton_core::id::IdAllocator;
use lepton_core::sync::{SpinLock, SpinLockGuard, WaitQueue};
use lepton_mm::page::PageRegion;

/// Thread identifier. Unique for the lifetime of the system.
pub type Tid = u64;

/// Default kernel stack size: 16 KiB.
pub const KSTACK_PAGES: usize = 4;

/// Default timeslice granted per scheduling.
pub const DEFAULT_TIMESLICE_NS: u64 = 10 * MS_TO_NS;

static NEXT_TID: IdAllocator = IdAllocator::new(1);

bitflags! {
    /// Static thread attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Kernel-only thread (never enters userspace).
        const KTHREAD = 1 << 0;
        /// A CPU's idle thread.
        const IDLE = 1 << 1;
        /// Thread sits on a subsystem-private block queue rather than the
        /// scheduler's blocked list.
        const OWN_BLOCKQ = 1 << 2;
    }
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Under construction; not yet visible to any scheduler.
    Empty,
    /// On a ready queue.
    Ready,
    /// The active thread of some CPU.
    Running,
    /// Waiting on a lock or event.
    Blocked,
    /// Waiting on a timer.
    Sleeping,
    /// Waiting on a wait queue (interruptible).
    Waiting,
    /// Terminated; awaiting reaping.
    Exited,
}

/// Per-thread scheduling statistics, updated under the thread lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadStats {
    /// Total on-CPU time in nanoseconds.
    pub total_time_ns: u64,
    /// Timestamp of the last timeslice start.
    pub last_scheduled: u64,
    /// Timestamp of the last timeslice end.
    pub last_active: u64,
    /// Number of times scheduled.
    pub sched_count: u64,
    /// Involuntary context switches.
    pub preempt_count: u64,
    /// Timer sleeps.
    pub sleep_count: u64,
    /// Voluntary yields.
    pub yield_count: u64,
}

/// First-run body of a kernel thread, invoked by the architecture
/// start wrapper on the thread's own stack.
pub type ThreadEntry = alloc::boxed::Box<dyn FnOnce() + Send>;

/// Saved callee-context for the architecture switch. The layout is fixed
/// so the assembly stub can address it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ContextBlock {
    /// Stack pointer to resume from.
    pub rsp: u64,
    /// Entry point for first-run threads.
    pub rip: u64,
    /// Saved flags.
    pub rflags: u64,
}

/// Mutable thread state, guarded by the thread lock.
pub struct ThreadInner {
    /// Current lifecycle state.
    pub state: ThreadState,
    /// Scheduling policy index (lower = served first).
    pub policy: usize,
    /// Priority within the policy (higher = more urgent).
    pub priority: u8,
    /// Pinned CPU, or `None` for any.
    pub affinity: Option<u32>,
    /// CPU whose scheduler currently owns the thread.
    pub cpu_id: u32,
    /// Nested preemption-disable count.
    pub preempt_count: u32,
    /// Absolute end of the current timeslice (0 = none).
    pub timeslice_end_ns: u64,
    /// Pending sleep alarm, if any.
    pub alarm_id: u64,
    /// Statistics.
    pub stats: ThreadStats,
    /// Machine context block.
    pub ctx: ContextBlock,
}

/// A kernel thread.
pub struct Thread {
    /// Thread id.
    pub tid: Tid,
    /// Owning process id.
    pub pid: u32,
    /// Static attributes.
    pub flags: ThreadFlags,
    name: SpinLock<String>,
    inner: SpinLock<ThreadInner>,
    kstack: Option<PageRegion>,
    /// Private wait queue for subsystems parking this specific thread.
    pub own_waitq: WaitQueue,
    /// One-permit wake token: a wake that raced ahead of the block it
    /// was meant for is consumed by the next block instead of being
    /// lost.
    pending_wake: AtomicBool,
    /// First-run body, taken by the start wrapper.
    entry_fn: SpinLock<Option<ThreadEntry>>,
}

impl Thread {
    /// Allocates a thread in the EMPTY state with a fresh kernel stack.
    ///
    /// Returns `None` if the stack allocation fails.
    pub fn new(pid: u32, flags: ThreadFlags, name: &str) -> Option<Arc<Thread>> {
        let kstack = PageRegion::alloc(KSTACK_PAGES)?;
        Some(Self::with_stack(pid, flags, name, Some(kstack)))
    }

    /// Allocates a thread without a kernel stack (tests, or threads whose
    /// stack is provided externally).
    pub fn new_stackless(pid: u32, flags: ThreadFlags, name: &str) -> Arc<Thread> {
        Self::with_stack(pid, flags, name, None)
    }

    fn with_stack(
        pid: u32,
        flags: ThreadFlags,
        name: &str,
        kstack: Option<PageRegion>,
    ) -> Arc<Thread> {
        let base_priority = if flags.contains(ThreadFlags::IDLE) { 0 } else { 128 };
        Arc::new(Thread {
            tid: NEXT_TID.next(),
            pid,
            flags,
            name: SpinLock::new(String::from(name)),
            inner: SpinLock::new(ThreadInner {
                state: ThreadState::Empty,
                policy: crate::policy::POLICY_SYSTEM,
                priority: base_priority,
                affinity: None,
                cpu_id: 0,
                preempt_count: 0,
                timeslice_end_ns: 0,
                alarm_id: 0,
                stats: ThreadStats::default(),
                ctx: ContextBlock::default(),
            }),
            kstack,
            own_waitq: WaitQueue::new(),
            pending_wake: AtomicBool::new(false),
            entry_fn: SpinLock::new(None),
        })
    }

    /// Installs the thread's first-run body.
    pub fn set_entry_fn(&self, f: ThreadEntry) {
        *self.entry_fn.lock() = Some(f);
    }

    /// Takes the first-run body (the architecture start wrapper calls
    /// this exactly once on first dispatch).
    pub fn take_entry_fn(&self) -> Option<ThreadEntry> {
        self.entry_fn.lock().take()
    }

    /// Posts a wake permit (a wake racing ahead of its block).
    pub fn post_wake(&self) {
        self.pending_wake.store(true, Ordering::Release);
    }

    /// Consumes a pending wake permit, returning whether one was
    /// posted.
    pub fn take_wake(&self) -> bool {
        self.pending_wake.swap(false, Ordering::AcqRel)
    }

    /// Locks and returns the mutable state.
    pub fn lock(&self) -> SpinLockGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    /// Returns the thread's name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the thread.
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    /// Returns the scheduling policy index.
    pub fn policy(&self) -> usize {
        self.inner.lock().policy
    }

    /// Returns the priority.
    pub fn priority(&self) -> u8 {
        self.inner.lock().priority
    }

    /// Returns the owning CPU id.
    pub fn cpu_id(&self) -> u32 {
        self.inner.lock().cpu_id
    }

    /// Returns the kernel stack region, if any.
    pub fn kstack(&self) -> Option<&PageRegion> {
        self.kstack.as_ref()
    }

    /// Returns `true` if the thread is blocked or sleeping.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Blocked | ThreadState::Sleeping | ThreadState::Waiting
        )
    }

    /// Sets the entry context for a first run.
    pub fn setup_entry(&self, entry: u64) {
        let mut inner = self.inner.lock();
        inner.ctx.rip = entry;
        if let Some(stack) = &self.kstack {
            inner.ctx.rsp = (stack.base() + stack.len()) as u64;
        }
    }

    /// Grants a fresh timeslice starting at `now`.
    pub(crate) fn start_timeslice(&self, now: u64) {
        let mut inner = self.inner.lock();
        inner.stats.last_scheduled = now;
        inner.stats.sched_count += 1;
        inner.timeslice_end_ns = now + DEFAULT_TIMESLICE_NS;
    }

    /// Returns `true` if the thread has exhausted its timeslice.
    pub fn timeslice_expired(&self, now: u64) -> bool {
        let inner = self.inner.lock();
        inner.timeslice_end_ns != 0 && now >= inner.timeslice_end_ns
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_is_empty() {
        let td = Thread::new_stackless(1, ThreadFlags::KTHREAD, "worker");
        assert_eq!(td.state(), ThreadState::Empty);
        assert_eq!(td.name(), "worker");
        assert!(!td.is_blocked());
    }

    #[test]
    fn tids_are_unique() {
        let a = Thread::new_stackless(1, ThreadFlags::KTHREAD, "a");
        let b = Thread::new_stackless(1, ThreadFlags::KTHREAD, "b");
        assert_ne!(a.tid, b.tid);
    }

    #[test]
    fn idle_thread_has_lowest_priority() {
        let idle = Thread::new_stackless(0, ThreadFlags::IDLE | ThreadFlags::KTHREAD, "idle.0");
        let worker = Thread::new_stackless(1, ThreadFlags::KTHREAD, "w");
        assert!(idle.priority() < worker.priority());
    }

    #[test]
    fn timeslice_tracking() {
        let td = Thread::new_stackless(1, ThreadFlags::KTHREAD, "t");
        assert!(!td.timeslice_expired(1));
        td.start_timeslice(1_000);
        assert!(!td.timeslice_expired(1_001));
        assert!(td.timeslice_expired(1_000 + DEFAULT_TIMESLICE_NS));
    }

    #[test]
    fn entry_points_at_stack_top() {
        let td = Thread::new(1, ThreadFlags::KTHREAD, "t").unwrap();
        td.setup_entry(0xDEAD_B000);
        let inner = td.lock();
        assert_eq!(inner.ctx.rip, 0xDEAD_B000);
        let stack = td.kstack().unwrap();
        assert_eq!(inner.ctx.rsp, (stack.base() + stack.len()) as u64);
    }
}
