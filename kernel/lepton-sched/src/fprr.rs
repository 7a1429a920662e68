//! Fixed-priority round-robin policy.
//!
//! One FIFO ring per priority level; dispatch always serves the highest
//! non-empty priority and rotates within it. The default policy for both
//! the SYSTEM and DRIVER slots.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use lepton_core::sync::SpinLock;

use crate::policy::SchedPolicy;
use crate::scheduler::SchedCause;
use crate::thread::Thread;

struct FprrInner {
    /// priority → FIFO of ready threads.
    queues: BTreeMap<u8, VecDeque<Arc<Thread>>>,
    count: usize,
}

/// Fixed-priority round-robin ready queue.
pub struct Fprr {
    inner: SpinLock<FprrInner>,
}

impl Fprr {
    /// Creates an empty policy instance.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(FprrInner {
                queues: BTreeMap::new(),
                count: 0,
            }),
        }
    }
}

impl Default for Fprr {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedPolicy for Fprr {
    fn init_thread(&self, _td: &Arc<Thread>) {}

    fn deinit_thread(&self, _td: &Arc<Thread>) {}

    fn add_thread(&self, td: Arc<Thread>) {
        let priority = td.priority();
        let mut inner = self.inner.lock();
        inner.queues.entry(priority).or_default().push_back(td);
        inner.count += 1;
    }

    fn remove_thread(&self, td: &Arc<Thread>) {
        let mut inner = self.inner.lock();
        let mut removed = false;
        let mut empty_key = None;
        for (&prio, queue) in inner.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|t| Arc::ptr_eq(t, td)) {
                queue.remove(pos);
                removed = true;
                if queue.is_empty() {
                    empty_key = Some(prio);
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            inner.queues.remove(&key);
        }
        if removed {
            inner.count -= 1;
        }
    }

    fn next_thread(&self) -> Option<Arc<Thread>> {
        let mut inner = self.inner.lock();
        // Highest priority value is served first.
        let (&prio, _) = inner.queues.iter().next_back()?;
        let queue = inner.queues.get_mut(&prio).expect("key from iter");
        let td = queue.pop_front();
        if queue.is_empty() {
            inner.queues.remove(&prio);
        }
        if td.is_some() {
            inner.count -= 1;
        }
        td
    }

    fn on_timeslice_start(&self, _td: &Arc<Thread>) {}

    fn on_timeslice_end(&self, _td: &Arc<Thread>) {}

    fn on_migrate(&self, _td: &Arc<Thread>, _new_cpu: u32) {}

    fn on_update_stats(&self, _td: &Arc<Thread>, _reason: SchedCause) {}

    fn queue_size(&self) -> usize {
        self.inner.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadFlags;

    fn thread_with_priority(priority: u8) -> Arc<Thread> {
        let td = Thread::new_stackless(1, ThreadFlags::KTHREAD, "t");
        td.lock().priority = priority;
        td
    }

    #[test]
    fn serves_highest_priority_first() {
        let fprr = Fprr::new();
        let low = thread_with_priority(10);
        let high = thread_with_priority(200);
        let mid = thread_with_priority(100);
        fprr.add_thread(low.clone());
        fprr.add_thread(high.clone());
        fprr.add_thread(mid.clone());

        assert_eq!(fprr.queue_size(), 3);
        assert!(Arc::ptr_eq(&fprr.next_thread().unwrap(), &high));
        assert!(Arc::ptr_eq(&fprr.next_thread().unwrap(), &mid));
        assert!(Arc::ptr_eq(&fprr.next_thread().unwrap(), &low));
        assert!(fprr.next_thread().is_none());
        assert_eq!(fprr.queue_size(), 0);
    }

    #[test]
    fn round_robin_within_priority() {
        let fprr = Fprr::new();
        let a = thread_with_priority(50);
        let b = thread_with_priority(50);
        fprr.add_thread(a.clone());
        fprr.add_thread(b.clone());

        let first = fprr.next_thread().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        // Re-queue at the back: b runs next.
        fprr.add_thread(first);
        assert!(Arc::ptr_eq(&fprr.next_thread().unwrap(), &b));
    }

    #[test]
    fn remove_specific_thread() {
        let fprr = Fprr::new();
        let a = thread_with_priority(50);
        let b = thread_with_priority(50);
        fprr.add_thread(a.clone());
        fprr.add_thread(b.clone());

        fprr.remove_thread(&a);
        assert_eq!(fprr.queue_size(), 1);
        assert!(Arc::ptr_eq(&fprr.next_thread().unwrap(), &b));
    }
}
