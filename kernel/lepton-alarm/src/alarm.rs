//! Pending-alarm registry and expiry processing.
//!
//! Every pending alarm appears exactly once in the expiry-ordered
//! multimap and once in the id→expiry map, both guarded by a single spin
//! lock. Callbacks run with the lock dropped; a callback that pushes
//! `expires_ns` forward is re-inserted (periodic behavior), otherwise the
//! alarm is freed.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use lepton_core::clock::{MS_TO_NS, clock_nanos};
use lepton_core::id::IdAllocator;
use lepton_core::sched;
use lepton_core::sync::{SpinLock, WaitQueue};
use lepton_core::{Errno, KResult, kdebug, kerror};

use crate::source::{self, AlarmCaps, AlarmSource};

/// Identifier of a registered alarm. 0 is never a valid id.
pub type AlarmId = u64;

/// Extra slop added when reprogramming the tickless source, so several
/// near-simultaneous expiries coalesce into one interrupt.
const REARM_SLOP_NS: u64 = 2 * MS_TO_NS;

static NEXT_ALARM_ID: IdAllocator = IdAllocator::new(1);

/// Callback invoked when an alarm expires. Runs with the registry lock
/// dropped; may reprogram the alarm by raising `expires_ns`.
pub type AlarmCallback = Box<dyn FnMut(&mut Alarm) + Send>;

/// A one-shot (or callback-reprogrammed periodic) timer.
pub struct Alarm {
    /// Registry id, allocated at construction.
    pub id: AlarmId,
    /// Absolute monotonic expiry, nanoseconds. Never 0 for a pending
    /// alarm.
    pub expires_ns: u64,
    callback: Option<AlarmCallback>,
}

impl Alarm {
    /// Creates an alarm expiring at an absolute monotonic time.
    pub fn new_absolute(expires_ns: u64, callback: AlarmCallback) -> Self {
        Self {
            id: NEXT_ALARM_ID.next(),
            expires_ns,
            callback: Some(callback),
        }
    }

    /// Creates an alarm expiring `offset_ns` from now.
    pub fn new_relative(offset_ns: u64, callback: AlarmCallback) -> Self {
        Self::new_absolute(clock_nanos() + offset_ns, callback)
    }

    fn fire(&mut self) {
        // Take the callback out so it can borrow the alarm mutably.
        if let Some(mut cb) = self.callback.take() {
            cb(self);
            self.callback = Some(cb);
        }
    }
}

// ---------------------------------------------------------------------------
// AlarmQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    /// Expiry-ordered multimap; same-expiry alarms drain FIFO.
    pending: BTreeMap<u64, VecDeque<Alarm>>,
    /// id → expiry, for O(log n) unregistration.
    expiries: BTreeMap<AlarmId, u64>,
}

/// The pending-alarm registry.
pub struct AlarmQueue {
    inner: SpinLock<QueueInner>,
}

impl AlarmQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(QueueInner {
                pending: BTreeMap::new(),
                expiries: BTreeMap::new(),
            }),
        }
    }

    /// Registers an alarm. Returns its id.
    ///
    /// # Errors
    ///
    /// `EINVAL` if `expires_ns` is 0.
    pub fn register(&self, alarm: Alarm) -> KResult<AlarmId> {
        if alarm.expires_ns == 0 {
            kdebug!("alarm: alarm {} has an invalid expiry time", alarm.id);
            return Err(Errno::Inval);
        }
        let id = alarm.id;
        let min_expiry = {
            let mut inner = self.inner.lock();
            inner.expiries.insert(id, alarm.expires_ns);
            inner
                .pending
                .entry(alarm.expires_ns)
                .or_default()
                .push_back(alarm);
            *inner.pending.keys().next().expect("just inserted")
        };
        maybe_rearm_tickless(min_expiry + REARM_SLOP_NS, clock_nanos());
        Ok(id)
    }

    /// Cancels a pending alarm.
    ///
    /// # Errors
    ///
    /// `ENOENT` if the id is not pending (already fired or never
    /// registered).
    pub fn unregister(&self, id: AlarmId) -> KResult<()> {
        let mut inner = self.inner.lock();
        let expires_ns = *inner.expiries.get(&id).ok_or(Errno::NoEnt)?;

        // Same-expiry bucket: locate the exact alarm.
        let bucket = inner.pending.get_mut(&expires_ns).ok_or(Errno::NoEnt)?;
        let pos = bucket
            .iter()
            .position(|a| a.id == id)
            .ok_or(Errno::NoEnt)?;
        bucket.remove(pos);
        if bucket.is_empty() {
            inner.pending.remove(&expires_ns);
        }
        inner.expiries.remove(&id);
        Ok(())
    }

    /// Drains every alarm with `expires_ns <= now` (FIFO among equal
    /// expiries), firing callbacks with the lock dropped. Returns the next
    /// pending expiry, or 0 if the queue is empty.
    pub fn handle_expired(&self, now: u64) -> u64 {
        let mut min_expiry = 0;
        loop {
            let mut alarm = {
                let mut inner = self.inner.lock();
                let Some((&key, _)) = inner.pending.iter().next() else {
                    break;
                };
                if key > now {
                    min_expiry = key;
                    break;
                }
                let bucket = inner.pending.get_mut(&key).expect("key from iter");
                let alarm = bucket.pop_front().expect("bucket is non-empty");
                if bucket.is_empty() {
                    inner.pending.remove(&key);
                }
                inner.expiries.remove(&alarm.id);
                alarm
            };

            let old_expiry = alarm.expires_ns;
            alarm.fire();

            if alarm.expires_ns > old_expiry {
                // The callback reprogrammed the alarm to fire again.
                let mut inner = self.inner.lock();
                inner.expiries.insert(alarm.id, alarm.expires_ns);
                inner
                    .pending
                    .entry(alarm.expires_ns)
                    .or_default()
                    .push_back(alarm);
            }
            // One-shot alarms are freed here by drop.
        }
        min_expiry
    }

    /// Returns the number of pending alarms.
    pub fn len(&self) -> usize {
        self.inner.lock().expiries.len()
    }

    /// Returns `true` if no alarms are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expiries.is_empty()
    }

    /// Returns the pending expiry for an id, if any.
    pub fn expiry_of(&self, id: AlarmId) -> Option<u64> {
        self.inner.lock().expiries.get(&id).copied()
    }

    /// Returns the earliest pending expiry, or `None` if empty.
    pub fn next_expiry(&self) -> Option<u64> {
        self.inner.lock().pending.keys().next().copied()
    }
}

impl Default for AlarmQueue {
    fn default() -> Self {
        Self::new()
    }
}

static ALARMS: AlarmQueue = AlarmQueue::new();

/// Returns the global pending-alarm registry.
pub fn alarms() -> &'static AlarmQueue {
    &ALARMS
}

// ---------------------------------------------------------------------------
// Tick / tickless interrupt handling
// ---------------------------------------------------------------------------

static LAST_TICK_NS: AtomicU64 = AtomicU64::new(0);
static NEXT_TICKLESS_EXPIRY: AtomicU64 = AtomicU64::new(0);
/// 0 means pure tickless operation.
static TICK_PERIOD_NS: AtomicU64 = AtomicU64::new(0);

/// Hook deciding whether the current thread's timeslice has expired.
pub type TimesliceCheckFn = fn(now_ns: u64) -> bool;

fn default_timeslice_check(_now: u64) -> bool {
    false
}

static TIMESLICE_CHECK_FN: AtomicPtr<()> =
    AtomicPtr::new(default_timeslice_check as *mut ());

/// Installs the scheduler's timeslice-expiry check, consulted from the
/// tick interrupt.
///
/// # Safety
///
/// The function must be callable from interrupt context.
pub unsafe fn set_timeslice_check_fn(f: TimesliceCheckFn) {
    TIMESLICE_CHECK_FN.store(f as *mut (), Ordering::Release);
}

fn timeslice_expired(now: u64) -> bool {
    let ptr = TIMESLICE_CHECK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `TimesliceCheckFn` pointers are ever stored.
    let f: TimesliceCheckFn = unsafe { core::mem::transmute(ptr) };
    f(now)
}

/// Configures the periodic tick cadence (0 = tickless only).
pub fn set_tick_period_ns(period: u64) {
    TICK_PERIOD_NS.store(period, Ordering::Release);
}

/// Reprograms the tickless source if `expiry` is sooner than both the
/// currently programmed expiry and (when a tick is configured) the next
/// tick.
fn maybe_rearm_tickless(expiry: u64, clock_now: u64) {
    let tick_period = TICK_PERIOD_NS.load(Ordering::Acquire);
    let wait_for_tick = if tick_period != 0 {
        let next_tick = LAST_TICK_NS.load(Ordering::Acquire) + tick_period;
        expiry > next_tick
    } else {
        false
    };

    let programmed = NEXT_TICKLESS_EXPIRY.load(Ordering::Acquire);
    if !wait_for_tick && expiry > clock_now && (programmed == 0 || expiry < programmed) {
        let Some(source) = try_tickless_source() else {
            // Bring-up order allows registrations before the sources are
            // selected; the init path rearms afterwards.
            return;
        };
        if let Err(e) = source.setval_abs_ns(expiry) {
            panic!(
                "alarm: failed to set tickless source value: {} value={expiry} [{e}]",
                source.name()
            );
        }
        if let Err(e) = source.enable() {
            panic!("alarm: failed to enable tickless source: {} [{e}]", source.name());
        }
        NEXT_TICKLESS_EXPIRY.store(expiry, Ordering::Release);
    }
}

fn try_tickless_source() -> Option<Arc<AlarmSource>> {
    // tickless_source() panics before init; probe gently instead.
    source::tickless_probe()
}

/// Periodic tick interrupt: drains expired alarms, rearms the tickless
/// source, and flags preemption if the running thread's timeslice is up.
pub fn handle_tick_irq() {
    let now = clock_nanos();
    LAST_TICK_NS.store(now, Ordering::Release);

    let next_expiry = ALARMS.handle_expired(now);
    if next_expiry != 0 {
        maybe_rearm_tickless(next_expiry + REARM_SLOP_NS, now);
    }

    if timeslice_expired(now) {
        // Defer the preemption to interrupt exit.
        sched::set_preempted(true);
    }
}

/// Tickless (one-shot) interrupt: drains expired alarms and rearms for
/// the next pending expiry. No preemption check.
pub fn handle_tickless_irq() {
    let now = clock_nanos();
    let next_expiry = ALARMS.handle_expired(now);
    NEXT_TICKLESS_EXPIRY.store(0, Ordering::Release);
    if next_expiry != 0 {
        maybe_rearm_tickless(next_expiry + REARM_SLOP_NS, now);
    }
}

/// Reprograms the tickless source for the earliest pending expiry, if
/// any. Used defensively by the idle loop when a programmed expiry may
/// have been lost.
pub fn reschedule_source() {
    NEXT_TICKLESS_EXPIRY.store(0, Ordering::Release);
    if let Some(expiry) = ALARMS.next_expiry() {
        maybe_rearm_tickless(expiry + REARM_SLOP_NS, clock_nanos());
    }
}

/// Selects and initializes the alarm sources.
///
/// `tickless` names the mandatory one-shot source; `tick` optionally
/// names a periodic source driving preemption at `tick_period_ns`.
///
/// # Panics
///
/// Panics if a named source is missing or refuses its mode — the kernel
/// cannot keep time without them.
pub fn init(tickless: &str, tick: Option<(&str, u64)>) {
    let source = source_get_or_panic(tickless);
    source
        .init(AlarmCaps::ONE_SHOT, handle_tickless_irq)
        .unwrap_or_else(|e| panic!("alarm: failed to initialize source '{tickless}' [{e}]"));
    source::set_tickless_source(source);

    if let Some((name, period)) = tick {
        let source = source_get_or_panic(name);
        source
            .init(AlarmCaps::PERIODIC, handle_tick_irq)
            .unwrap_or_else(|e| panic!("alarm: failed to initialize source '{name}' [{e}]"));
        source
            .setval_rel_ns(period)
            .unwrap_or_else(|e| panic!("alarm: failed to set source value '{name}' [{e}]"));
        set_tick_period_ns(period);
        source::set_tick_source(source);
        // The tick source is enabled at the end of kernel bring-up.
    }
}

fn source_get_or_panic(name: &str) -> Arc<AlarmSource> {
    source::source_get(name).unwrap_or_else(|| panic!("alarm: no source named '{name}'"))
}

// ---------------------------------------------------------------------------
// Sleep
// ---------------------------------------------------------------------------

static SLEEP_QUEUES: SpinLock<BTreeMap<AlarmId, Arc<WaitQueue>>> =
    SpinLock::new(BTreeMap::new());

/// Puts the calling thread to sleep for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) -> KResult<()> {
    let now = clock_nanos();
    let (_id, wq) = register_sleep_alarm(now + ms * MS_TO_NS)?;
    wq.wait("sleeping");
    Ok(())
}

/// Registers a wakeup alarm and returns its wait queue (split out of
/// [`sleep_ms`] so the wakeup plumbing is testable without blocking).
pub(crate) fn register_sleep_alarm(expires_ns: u64) -> KResult<(AlarmId, Arc<WaitQueue>)> {
    let wq = Arc::new(WaitQueue::new());
    let alarm = Alarm::new_absolute(expires_ns, Box::new(sleep_wakeup_callback));
    let id = alarm.id;
    SLEEP_QUEUES.lock().insert(id, wq.clone());

    if let Err(e) = ALARMS.register(alarm) {
        kerror!("alarm: failed to register sleep alarm [{e}]");
        SLEEP_QUEUES.lock().remove(&id);
        return Err(Errno::Inval);
    }
    Ok((id, wq))
}

fn sleep_wakeup_callback(alarm: &mut Alarm) {
    let wq = SLEEP_QUEUES.lock().remove(&alarm.id);
    match wq {
        Some(wq) => wq.wake_all(),
        None => kdebug!("alarm: wakeup for {} has no waitqueue", alarm.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::sync::Mutex as StdMutex;

    fn noop_alarm(expires: u64) -> Alarm {
        Alarm::new_absolute(expires, Box::new(|_| {}))
    }

    #[test]
    fn register_unregister_roundtrip() {
        let q = AlarmQueue::new();
        let alarm = noop_alarm(1_000);
        let id = alarm.id;
        q.register(alarm).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.expiry_of(id), Some(1_000));

        q.unregister(id).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.unregister(id), Err(Errno::NoEnt));
    }

    #[test]
    fn zero_expiry_is_rejected() {
        let q = AlarmQueue::new();
        assert_eq!(q.register(noop_alarm(0)).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn unregister_picks_correct_alarm_among_ties() {
        let q = AlarmQueue::new();
        let a = noop_alarm(500);
        let b = noop_alarm(500);
        let c = noop_alarm(500);
        let (ida, idb, idc) = (a.id, b.id, c.id);
        q.register(a).unwrap();
        q.register(b).unwrap();
        q.register(c).unwrap();

        q.unregister(idb).unwrap();
        assert_eq!(q.len(), 2);
        assert!(q.expiry_of(ida).is_some());
        assert!(q.expiry_of(idb).is_none());
        assert!(q.expiry_of(idc).is_some());
    }

    #[test]
    fn burst_drains_in_nondecreasing_order() {
        let q = AlarmQueue::new();
        let fired: StdArc<StdMutex<Vec<u64>>> = StdArc::new(StdMutex::new(Vec::new()));

        // Interleaved expiries, registered out of order.
        let mut expiries = Vec::new();
        for i in 0..10_000u64 {
            expiries.push((i * 7919) % 100_000 + 1);
        }
        for &e in &expiries {
            let fired = fired.clone();
            let alarm = Alarm::new_absolute(
                e,
                Box::new(move |a| fired.lock().unwrap().push(a.expires_ns)),
            );
            q.register(alarm).unwrap();
        }

        let next = q.handle_expired(100_001);
        assert_eq!(next, 0);
        assert!(q.is_empty());

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), expiries.len());
        assert!(fired.windows(2).all(|w| w[0] <= w[1]), "out-of-order drain");
    }

    #[test]
    fn partial_drain_returns_next_expiry() {
        let q = AlarmQueue::new();
        q.register(noop_alarm(100)).unwrap();
        q.register(noop_alarm(200)).unwrap();
        q.register(noop_alarm(300)).unwrap();

        let next = q.handle_expired(150);
        assert_eq!(next, 200);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn callback_reprogram_reinserts() {
        let q = AlarmQueue::new();
        let alarm = Alarm::new_absolute(
            100,
            Box::new(|a| {
                // Behave periodically until expiry 300.
                if a.expires_ns < 300 {
                    a.expires_ns += 100;
                }
            }),
        );
        let id = alarm.id;
        q.register(alarm).unwrap();

        assert_eq!(q.handle_expired(100), 200);
        assert_eq!(q.expiry_of(id), Some(200));
        assert_eq!(q.handle_expired(200), 300);
        assert_eq!(q.handle_expired(300), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn ties_fire_fifo() {
        let q = AlarmQueue::new();
        let order: StdArc<StdMutex<Vec<AlarmId>>> = StdArc::new(StdMutex::new(Vec::new()));
        let mut ids = Vec::new();
        for _ in 0..5 {
            let order = order.clone();
            let alarm = Alarm::new_absolute(
                777,
                Box::new(move |a| order.lock().unwrap().push(a.id)),
            );
            ids.push(alarm.id);
            q.register(alarm).unwrap();
        }
        q.handle_expired(777);
        assert_eq!(*order.lock().unwrap(), ids);
    }

    #[test]
    fn sleep_alarm_wakes_queue() {
        let (id, wq) = register_sleep_alarm(clock_nanos() + 1_000_000).unwrap();
        let waiter = wq.prepare();
        assert!(alarms().expiry_of(id).is_some());

        // Fire everything pending far in the future.
        alarms().handle_expired(u64::MAX);
        assert!(waiter.is_woken());
        assert!(alarms().expiry_of(id).is_none());
    }
}
