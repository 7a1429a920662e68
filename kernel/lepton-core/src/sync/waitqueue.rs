//! Wait queue for thread-blocking primitives.
//!
//! A [`WaitQueue`] is a FIFO of parked threads. Waiters register a
//! [`Waiter`] entry and park through the scheduler hooks; wakers mark the
//! entry and unblock the thread. The woken flag makes the protocol robust
//! against wakeups racing with the park itself: a waiter always rechecks
//! the flag before and after blocking.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sched::{self, Tid};
use crate::sync::SpinLock;

/// A single parked-thread entry on a [`WaitQueue`].
pub struct Waiter {
    tid: Tid,
    woken: AtomicBool,
}

impl Waiter {
    /// Returns `true` once this waiter has been woken.
    #[inline]
    pub fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    /// Parks the current thread until the waiter is woken.
    pub fn park(&self, reason: &'static str) {
        while !self.is_woken() {
            sched::block_current(reason);
        }
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        sched::unblock(self.tid);
    }
}

/// A FIFO queue of threads waiting for an event.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Registers the current thread on the queue and returns its entry.
    ///
    /// Callers must either [`Waiter::park`] on the entry or [`cancel`]
    /// (`Self::cancel`) it after deciding not to wait; abandoned entries
    /// are harmlessly drained by the next wake.
    pub fn prepare(&self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            tid: sched::current_tid(),
            woken: AtomicBool::new(false),
        });
        self.waiters.lock().push_back(waiter.clone());
        waiter
    }

    /// Removes a not-yet-woken entry from the queue (the caller acquired
    /// its resource without sleeping).
    pub fn cancel(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            waiters.remove(pos);
        }
    }

    /// Blocks the current thread until woken.
    pub fn wait(&self, reason: &'static str) {
        let waiter = self.prepare();
        waiter.park(reason);
    }

    /// Wakes the oldest waiter. Returns `true` if one was woken.
    pub fn wake_one(&self) -> bool {
        let waiter = self.waiters.lock().pop_front();
        match waiter {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter currently on the queue.
    pub fn wake_all(&self) {
        let drained: VecDeque<_> = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut *waiters)
        };
        for w in drained {
            w.wake();
        }
    }

    /// Returns the number of queued waiters.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Returns `true` if no thread is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_one_is_fifo() {
        let wq = WaitQueue::new();
        let a = wq.prepare();
        let b = wq.prepare();
        assert_eq!(wq.len(), 2);

        wq.wake_one();
        assert!(a.is_woken());
        assert!(!b.is_woken());

        wq.wake_one();
        assert!(b.is_woken());
        assert!(wq.is_empty());
    }

    #[test]
    fn wake_all_drains() {
        let wq = WaitQueue::new();
        let waiters: Vec<_> = (0..5).map(|_| wq.prepare()).collect();
        wq.wake_all();
        assert!(wq.is_empty());
        assert!(waiters.iter().all(|w| w.is_woken()));
    }

    #[test]
    fn cancel_removes_entry() {
        let wq = WaitQueue::new();
        let a = wq.prepare();
        let b = wq.prepare();
        wq.cancel(&a);
        wq.wake_one();
        assert!(!a.is_woken());
        assert!(b.is_woken());
    }

    #[test]
    fn park_returns_after_cross_thread_wake() {
        // Under the host default hooks, park() degrades to a spin loop,
        // so a wake from another OS thread must release it.
        let wq = StdArc::new(WaitQueue::new());
        let wq2 = wq.clone();
        let handle = thread::spawn(move || {
            wq2.wait("test_wait");
        });
        // Give the waiter time to enqueue itself, then wake it.
        while wq.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        wq.wake_one();
        handle.join().unwrap();
    }
}
