//! Process and thread lifecycle.
//!
//! Processes move one way through EMPTY → ACTIVE → EXITED. EMPTY is the
//! setup window: callers populate threads, environment, arguments, and
//! file descriptors without runtime locks, then
//! [`Process::finish_setup_and_submit_all`] atomically flips the
//! process ACTIVE and submits every thread to its scheduler.
//!
//! The process table is sharded by `pid % PTABLE_BUCKETS` with a spin
//! lock per bucket; pids come from a bitmap set. Pid 0 is the reserved
//! kernel process hosting the idle threads.

pub mod exec;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use lepton_core::clock::TimeVal;
use lepton_core::id::IdSet;
use lepton_core::sched::Tid;
use lepton_core::sync::SpinLock;
use lepton_core::{Errno, KResult, kdebug, kinfo};
use lepton_fs::{FdTable, Ventry};
use lepton_sched::{Thread, ThreadFlags, ThreadState, sched_add, sched_terminate};

/// Process identifier.
pub type Pid = u32;

/// Maximum live processes.
pub const PROCS_MAX: u32 = 4096;
/// Process table shard count.
const PTABLE_BUCKETS: usize = 64;
/// Signal numbers supported by the action table.
pub const NSIG: usize = 64;
/// SIGALRM signal number.
pub const SIGALRM: u32 = 14;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Reference-counted process credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Creds {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Effective group id.
    pub egid: u32,
}

impl Creds {
    /// Root credentials.
    pub const fn root() -> Creds {
        Creds {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Packed string buffers (argv / envp)
// ---------------------------------------------------------------------------

/// A packed, immutable block of NUL-terminated strings. Shared
/// copy-on-write across fork by cloning the [`Arc`].
pub struct PStrings {
    data: Vec<u8>,
    offsets: Vec<usize>,
}

impl PStrings {
    /// Packs a string slice.
    pub fn new(strings: &[&str]) -> Arc<PStrings> {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(strings.len());
        for s in strings {
            offsets.push(data.len());
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        }
        Arc::new(PStrings { data, offsets })
    }

    /// Empty block.
    pub fn empty() -> Arc<PStrings> {
        Self::new(&[])
    }

    /// Number of strings.
    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    /// Returns string `i` (without the NUL).
    pub fn get(&self, i: usize) -> Option<&str> {
        let start = *self.offsets.get(i)?;
        let end = self.data[start..].iter().position(|&b| b == 0)? + start;
        core::str::from_utf8(&self.data[start..end]).ok()
    }

    /// Total packed size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The raw packed bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

// ---------------------------------------------------------------------------
// Signals (action table + pending set)
// ---------------------------------------------------------------------------

/// A signal disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigAction {
    /// Default behavior.
    #[default]
    Default,
    /// Ignore.
    Ignore,
    /// User handler at the given address.
    Handler(u64),
}

// ---------------------------------------------------------------------------
// Process groups and sessions
// ---------------------------------------------------------------------------

/// A login session.
pub struct Session {
    /// Session id (pid of the leader).
    pub sid: Pid,
}

/// A process group within a session.
pub struct PGroup {
    /// Group id (pid of the leader).
    pub pgid: Pid,
    /// Owning session.
    pub session: Arc<Session>,
    members: SpinLock<Vec<Pid>>,
}

impl PGroup {
    /// Creates an empty group in `session`.
    pub fn new(pgid: Pid, session: Arc<Session>) -> Arc<PGroup> {
        Arc::new(PGroup {
            pgid,
            session,
            members: SpinLock::new(Vec::new()),
        })
    }

    /// Adds a process to the group.
    pub fn add(&self, pid: Pid) {
        self.members.lock().push(pid);
    }

    /// Removes a process from the group.
    pub fn remove(&self, pid: Pid) {
        self.members.lock().retain(|&p| p != pid);
    }

    /// Returns the member pids.
    pub fn members(&self) -> Vec<Pid> {
        self.members.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Process lifecycle states. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Setup window; not yet scheduled.
    Empty,
    /// Running.
    Active,
    /// Terminated, awaiting reaping.
    Exited,
}

/// The heap range of a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrkRange {
    /// Range start.
    pub start: u64,
    /// Current end.
    pub end: u64,
    /// Hard ceiling.
    pub max: u64,
}

/// Interval-timer value (ITIMER_REAL).
#[derive(Debug, Clone, Copy, Default)]
pub struct ITimerVal {
    /// Reload interval.
    pub interval: TimeVal,
    /// Time until next expiry.
    pub value: TimeVal,
}

/// A process.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    name: SpinLock<String>,
    state: SpinLock<ProcState>,
    creds: SpinLock<Arc<Creds>>,
    cwd: SpinLock<Option<Arc<Ventry>>>,
    /// Open files.
    pub files: FdTable,
    sigactions: SpinLock<[SigAction; NSIG]>,
    sigpending: AtomicU64,
    binpath: SpinLock<String>,
    brk: SpinLock<BrkRange>,
    args: SpinLock<Arc<PStrings>>,
    env: SpinLock<Arc<PStrings>>,
    threads: SpinLock<Vec<Arc<Thread>>>,
    pgroup: SpinLock<Option<Arc<PGroup>>>,
    /// Pending alarm(2) id (0 = none).
    pub pending_alarm: SpinLock<u64>,
    /// ITIMER_REAL state.
    pub itimer: SpinLock<ITimerVal>,
    /// Alarm backing ITIMER_REAL (0 = none).
    pub itimer_alarm: SpinLock<u64>,
    /// set_tid_address pointer.
    pub tid_address: AtomicU64,
    exit_code: AtomicI32,
}

// -- global tables ----------------------------------------------------------

struct Ptable {
    buckets: [SpinLock<Vec<Arc<Process>>>; PTABLE_BUCKETS],
}

static PTABLE: Ptable = Ptable {
    buckets: [const { SpinLock::new(Vec::new()) }; PTABLE_BUCKETS],
};

static PIDSET: SpinLock<Option<IdSet>> = SpinLock::new(None);

/// Live threads by tid, for the scheduler-hook unblock path.
static THREADS: SpinLock<BTreeMap<Tid, Weak<Thread>>> = SpinLock::new(BTreeMap::new());

fn with_pidset<R>(f: impl FnOnce(&IdSet) -> R) -> R {
    let mut guard = PIDSET.lock();
    let set = guard.get_or_insert_with(|| {
        let set = IdSet::new(PROCS_MAX);
        // pid 0 is the kernel process.
        set.reserve(0);
        set
    });
    f(set)
}

/// Allocates a pid.
pub fn alloc_pid() -> KResult<Pid> {
    with_pidset(|set| set.alloc()).ok_or(Errno::Again)
}

/// Releases a pid for reuse.
pub fn free_pid(pid: Pid) {
    with_pidset(|set| set.free(pid));
}

fn ptable_bucket(pid: Pid) -> &'static SpinLock<Vec<Arc<Process>>> {
    &PTABLE.buckets[pid as usize % PTABLE_BUCKETS]
}

fn ptable_add(proc: Arc<Process>) {
    ptable_bucket(proc.pid).lock().push(proc);
}

fn ptable_remove(pid: Pid) {
    ptable_bucket(pid).lock().retain(|p| p.pid != pid);
}

/// Looks up a process by pid.
pub fn proc_lookup(pid: Pid) -> Option<Arc<Process>> {
    ptable_bucket(pid)
        .lock()
        .iter()
        .find(|p| p.pid == pid)
        .cloned()
}

/// Looks up a live thread by tid.
pub fn thread_by_tid(tid: Tid) -> Option<Arc<Thread>> {
    THREADS.lock().get(&tid).and_then(Weak::upgrade)
}

fn threads_register(td: &Arc<Thread>) {
    THREADS.lock().insert(td.tid, Arc::downgrade(td));
}

fn threads_unregister(tid: Tid) {
    THREADS.lock().remove(&tid);
}

/// Returns the current process (owner of the running thread).
pub fn curproc() -> Option<Arc<Process>> {
    let td = lepton_sched::curthread()?;
    proc_lookup(td.pid)
}

// -- lifecycle --------------------------------------------------------------

impl Process {
    /// Allocates an EMPTY process with a fresh pid and registers it in
    /// the table.
    pub fn alloc_empty(creds: Arc<Creds>) -> KResult<Arc<Process>> {
        let pid = alloc_pid()?;
        Ok(Self::alloc_with_pid(pid, creds))
    }

    fn alloc_with_pid(pid: Pid, creds: Arc<Creds>) -> Arc<Process> {
        let proc = Arc::new(Process {
            pid,
            name: SpinLock::new(String::new()),
            state: SpinLock::new(ProcState::Empty),
            creds: SpinLock::new(creds),
            cwd: SpinLock::new(None),
            files: FdTable::new(),
            sigactions: SpinLock::new([SigAction::Default; NSIG]),
            sigpending: AtomicU64::new(0),
            binpath: SpinLock::new(String::new()),
            brk: SpinLock::new(BrkRange::default()),
            args: SpinLock::new(PStrings::empty()),
            env: SpinLock::new(PStrings::empty()),
            threads: SpinLock::new(Vec::new()),
            pgroup: SpinLock::new(None),
            pending_alarm: SpinLock::new(0),
            itimer: SpinLock::new(ITimerVal::default()),
            itimer_alarm: SpinLock::new(0),
            tid_address: AtomicU64::new(0),
            exit_code: AtomicI32::new(0),
        });
        ptable_add(proc.clone());
        proc
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ProcState {
        *self.state.lock()
    }

    /// Returns the process name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Returns the credentials.
    pub fn creds(&self) -> Arc<Creds> {
        self.creds.lock().clone()
    }

    /// Returns the current working directory entry.
    pub fn cwd(&self) -> Option<Arc<Ventry>> {
        self.cwd.lock().clone()
    }

    /// Replaces the current working directory.
    pub fn set_cwd(&self, ve: Arc<Ventry>) {
        *self.cwd.lock() = Some(ve);
    }

    /// Returns the executable path.
    pub fn binpath(&self) -> String {
        self.binpath.lock().clone()
    }

    /// Returns the argument block.
    pub fn args(&self) -> Arc<PStrings> {
        self.args.lock().clone()
    }

    /// Returns the environment block.
    pub fn env(&self) -> Arc<PStrings> {
        self.env.lock().clone()
    }

    /// Returns a snapshot of the thread list.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    /// Returns the main (first) thread.
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    fn assert_setup(&self) {
        assert_eq!(
            self.state(),
            ProcState::Empty,
            "process {} mutated outside the setup window",
            self.pid
        );
    }

    /// Setup: creates and attaches a kernel thread.
    pub fn setup_new_thread(&self, flags: ThreadFlags, name: &str) -> KResult<Arc<Thread>> {
        self.assert_setup();
        let td = Thread::new(self.pid, flags, name).ok_or(Errno::NoMem)?;
        threads_register(&td);
        self.threads.lock().push(td.clone());
        Ok(td)
    }

    /// Setup: attaches an externally built thread.
    pub fn setup_add_thread(&self, td: Arc<Thread>) {
        self.assert_setup();
        assert_eq!(td.pid, self.pid, "thread belongs to another process");
        threads_register(&td);
        self.threads.lock().push(td);
    }

    /// Setup: sets the entry point of the main thread.
    pub fn setup_entry(&self, entry: u64) {
        self.assert_setup();
        let td = self.main_thread().expect("setup_entry before any thread");
        td.setup_entry(entry);
    }

    /// Setup: names the process (and its main thread).
    pub fn setup_name(&self, name: &str) {
        self.assert_setup();
        *self.name.lock() = String::from(name);
        if let Some(td) = self.main_thread() {
            td.set_name(name);
        }
    }

    /// Setup: installs a fresh environment block.
    pub fn setup_env(&self, env: &[&str]) {
        self.assert_setup();
        *self.env.lock() = PStrings::new(env);
    }

    /// Setup: shares an existing environment block (fork).
    pub fn setup_copy_env(&self, env: Arc<PStrings>) {
        self.assert_setup();
        *self.env.lock() = env;
    }

    /// Setup: installs the argument block.
    pub fn setup_args(&self, args: &[&str]) {
        self.assert_setup();
        *self.args.lock() = PStrings::new(args);
    }

    /// Setup: records the executable path.
    pub fn setup_binpath(&self, path: &str) {
        self.assert_setup();
        *self.binpath.lock() = String::from(path);
    }

    /// Setup: initializes the heap range.
    pub fn setup_brk(&self, start: u64, max: u64) {
        self.assert_setup();
        *self.brk.lock() = BrkRange {
            start,
            end: start,
            max,
        };
    }

    /// Ends the setup window: flips ACTIVE and submits every thread to
    /// the scheduler.
    pub fn finish_setup_and_submit_all(&self) {
        {
            let mut state = self.state.lock();
            assert_eq!(*state, ProcState::Empty, "double finish_setup");
            *state = ProcState::Active;
        }
        for td in self.threads() {
            sched_add(&td);
        }
        kdebug!("proc: {} [{}] active", self.pid, self.name());
    }

    /// Attaches a thread to an ACTIVE process and schedules it.
    pub fn add_thread(&self, td: Arc<Thread>) {
        assert_eq!(self.state(), ProcState::Active);
        threads_register(&td);
        self.threads.lock().push(td.clone());
        sched_add(&td);
    }

    // -- heap ----------------------------------------------------------

    /// Returns the heap range.
    pub fn brk_range(&self) -> BrkRange {
        *self.brk.lock()
    }

    /// Adjusts the heap end. Addresses outside `[start, max]` are
    /// ignored and the current end is returned.
    pub fn brk(&self, addr: u64) -> u64 {
        let mut brk = self.brk.lock();
        if addr >= brk.start && addr <= brk.max {
            brk.end = addr;
        }
        brk.end
    }

    // -- signals -------------------------------------------------------

    /// Returns the action for a signal.
    pub fn sigaction(&self, sig: u32) -> SigAction {
        self.sigactions.lock()[sig as usize % NSIG]
    }

    /// Installs an action for a signal.
    pub fn set_sigaction(&self, sig: u32, action: SigAction) {
        self.sigactions.lock()[sig as usize % NSIG] = action;
    }

    /// Posts a signal to the process (recorded pending; delivery is the
    /// userspace-return path's concern).
    pub fn post_signal(&self, sig: u32) {
        self.sigpending.fetch_or(1 << (sig % 64), Ordering::Release);
        kdebug!("proc: signal {sig} posted to {}", self.pid);
    }

    /// Consumes the pending-signal set.
    pub fn take_pending_signals(&self) -> u64 {
        self.sigpending.swap(0, Ordering::AcqRel)
    }

    // -- teardown ------------------------------------------------------

    /// Stops every thread and marks the process EXITED. Invoked by
    /// `exit_group`; also the final step of a fatal fault.
    pub fn exit_all(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
        {
            let mut state = self.state.lock();
            if *state == ProcState::Exited {
                return;
            }
            *state = ProcState::Exited;
        }

        // Cancel outstanding timers before the threads go away.
        let pending = core::mem::take(&mut *self.pending_alarm.lock());
        if pending != 0 {
            let _ = lepton_alarm::alarms().unregister(pending);
        }
        let itimer = core::mem::take(&mut *self.itimer_alarm.lock());
        if itimer != 0 {
            let _ = lepton_alarm::alarms().unregister(itimer);
        }

        for td in self.threads() {
            thread_stop(&td);
        }
        self.files.close_all();
        if let Some(pg) = self.pgroup.lock().take() {
            pg.remove(self.pid);
        }
        kinfo!("proc: {} [{}] exited with {code}", self.pid, self.name());
    }

    /// Returns the recorded exit code.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Reaps an EXITED process: frees its pid and drops it from the
    /// table.
    pub fn reap(&self) {
        assert_eq!(self.state(), ProcState::Exited, "reaping a live process");
        for td in self.threads.lock().drain(..) {
            threads_unregister(td.tid);
        }
        ptable_remove(self.pid);
        if self.pid != 0 {
            free_pid(self.pid);
        }
    }
}

/// Universal thread termination: running threads terminate through
/// their scheduler (reschedule locally, IPI remotely); queued threads
/// are dequeued. Idempotent once EXITED.
pub fn thread_stop(td: &Arc<Thread>) {
    if td.state() == ThreadState::Exited {
        return;
    }
    if td.state() == ThreadState::Empty {
        // Never submitted: just mark it.
        td.lock().state = ThreadState::Exited;
        threads_unregister(td.tid);
        return;
    }
    sched_terminate(td);
    threads_unregister(td.tid);
}

// ---------------------------------------------------------------------------
// Kernel process (pid 0)
// ---------------------------------------------------------------------------

/// Creates the reserved kernel process (pid 0). Idle threads are added
/// per CPU during scheduler bring-up.
pub fn proc0_init() -> Arc<Process> {
    let proc = Process::alloc_with_pid(0, Arc::new(Creds::root()));
    *proc.name.lock() = String::from("kernel");
    proc
}

/// Allocates an idle thread for `cpu` under pid 0.
pub fn proc0_alloc_idle(proc0: &Arc<Process>, cpu: u32) -> KResult<Arc<Thread>> {
    assert_eq!(proc0.pid, 0);
    let name = alloc::format!("idle.{cpu}");
    let td = Thread::new(0, ThreadFlags::KTHREAD | ThreadFlags::IDLE, &name)
        .ok_or(Errno::NoMem)?;
    threads_register(&td);
    proc0.threads.lock().push(td.clone());
    Ok(td)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pstrings_pack_and_get() {
        let ps = PStrings::new(&["one", "two", "three"]);
        assert_eq!(ps.count(), 3);
        assert_eq!(ps.get(0), Some("one"));
        assert_eq!(ps.get(2), Some("three"));
        assert_eq!(ps.get(3), None);
        // Three strings plus NULs.
        assert_eq!(ps.size(), 3 + 1 + 3 + 1 + 5 + 1);
    }

    #[test]
    fn process_setup_window() {
        let proc = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        assert_eq!(proc.state(), ProcState::Empty);

        proc.setup_args(&["prog", "-v"]);
        proc.setup_env(&["PATH=/bin"]);
        proc.setup_binpath("/bin/prog");
        proc.setup_brk(0x4000_0000, 0x4100_0000);
        proc.setup_name("prog");

        assert_eq!(proc.args().count(), 2);
        assert_eq!(proc.env().get(0), Some("PATH=/bin"));
        assert_eq!(proc.binpath(), "/bin/prog");

        // Cleanup without scheduling anything.
        *proc.state.lock() = ProcState::Exited;
        proc.reap();
    }

    #[test]
    fn pid_allocation_recycles() {
        let a = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        let pid = a.pid;
        assert!(proc_lookup(pid).is_some());
        *a.state.lock() = ProcState::Exited;
        a.reap();
        assert!(proc_lookup(pid).is_none());

        let b = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        assert!(proc_lookup(b.pid).is_some());
        *b.state.lock() = ProcState::Exited;
        b.reap();
    }

    #[test]
    fn brk_contract() {
        let proc = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        proc.setup_brk(0x1000, 0x9000);

        // Valid adjustment moves the end.
        assert_eq!(proc.brk(0x2000), 0x2000);
        // Below start: ignored, current end returned.
        assert_eq!(proc.brk(0x500), 0x2000);
        // Above max: ignored.
        assert_eq!(proc.brk(0xA000), 0x2000);
        // Shrink back to start is allowed.
        assert_eq!(proc.brk(0x1000), 0x1000);

        *proc.state.lock() = ProcState::Exited;
        proc.reap();
    }

    #[test]
    fn signal_actions_and_pending() {
        let proc = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        assert_eq!(proc.sigaction(SIGALRM), SigAction::Default);
        proc.set_sigaction(SIGALRM, SigAction::Handler(0xF000));
        assert_eq!(proc.sigaction(SIGALRM), SigAction::Handler(0xF000));

        proc.post_signal(SIGALRM);
        let pending = proc.take_pending_signals();
        assert!(pending & (1 << SIGALRM) != 0);
        assert_eq!(proc.take_pending_signals(), 0);

        *proc.state.lock() = ProcState::Exited;
        proc.reap();
    }

    #[test]
    fn thread_registry_tracks_threads() {
        let proc = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        let td = proc.setup_new_thread(ThreadFlags::KTHREAD, "worker").unwrap();
        assert!(thread_by_tid(td.tid).is_some());

        thread_stop(&td);
        assert_eq!(td.state(), ThreadState::Exited);
        assert!(thread_by_tid(td.tid).is_none());
        // Idempotent.
        thread_stop(&td);

        *proc.state.lock() = ProcState::Exited;
        proc.reap();
    }

    #[test]
    fn pgroup_membership() {
        let session = Arc::new(Session { sid: 100 });
        let pg = PGroup::new(100, session);
        pg.add(100);
        pg.add(101);
        assert_eq!(pg.members(), vec![100, 101]);
        pg.remove(100);
        assert_eq!(pg.members(), vec![101]);
    }
}
