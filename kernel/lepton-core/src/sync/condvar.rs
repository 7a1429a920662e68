//! Condition variable over [`SpinLock`].
//!
//! [`CondVar::wait`] atomically releases the caller's lock guard, parks
//! the thread, and re-acquires the lock before returning. Waiters must
//! re-test their predicate after waking (wakeups may be spurious when a
//! signal races a cancel).

use super::{SpinLock, SpinLockGuard, WaitQueue};

/// A condition variable for threads sleeping on a predicate guarded by a
/// [`SpinLock`].
pub struct CondVar {
    waiters: WaitQueue,
}

impl CondVar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Releases `guard`, blocks until signalled, then re-acquires the lock.
    pub fn wait<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let lock: &'a SpinLock<T> = guard.source();
        // Register before releasing the lock so a signal between the
        // release and the park cannot be lost.
        let waiter = self.waiters.prepare();
        drop(guard);
        waiter.park("cond_wait");
        lock.lock()
    }

    /// Wakes one waiting thread.
    pub fn signal(&self) {
        self.waiters.wake_one();
    }

    /// Wakes every waiting thread.
    pub fn broadcast(&self) {
        self.waiters.wake_all();
    }

    /// Returns `true` if no thread is waiting.
    pub fn is_idle(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_then_signal() {
        let lock = Arc::new(SpinLock::new(false));
        let cond = Arc::new(CondVar::new());

        let (lock2, cond2) = (lock.clone(), cond.clone());
        let handle = thread::spawn(move || {
            let mut ready = lock2.lock();
            while !*ready {
                ready = cond2.wait(ready);
            }
        });

        while cond.is_idle() {
            thread::sleep(Duration::from_millis(1));
        }
        {
            let mut ready = lock.lock();
            *ready = true;
        }
        cond.signal();
        handle.join().unwrap();
    }

    #[test]
    fn broadcast_wakes_everyone() {
        let lock = Arc::new(SpinLock::new(0u32));
        let cond = Arc::new(CondVar::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (lock, cond) = (lock.clone(), cond.clone());
            handles.push(thread::spawn(move || {
                let mut n = lock.lock();
                while *n == 0 {
                    n = cond.wait(n);
                }
            }));
        }
        while cond.waiters.len() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        *lock.lock() = 1;
        cond.broadcast();
        for h in handles {
            h.join().unwrap();
        }
    }
}
