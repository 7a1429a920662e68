//! Counting semaphore.
//!
//! [`Semaphore::down`] blocks the calling thread while the count is zero;
//! [`Semaphore::up`] releases one waiter. Used as the event-signal
//! primitive between interrupt top halves and their service threads
//! (the ISR calls `up`, the thread parks in `down`).

use super::{SpinLock, WaitQueue};

/// A counting semaphore.
pub struct Semaphore {
    count: SpinLock<u64>,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count.
    pub const fn new(count: u64) -> Self {
        Self {
            count: SpinLock::new(count),
            waiters: WaitQueue::new(),
        }
    }

    /// Decrements the count, blocking while it is zero.
    pub fn down(&self) {
        loop {
            let waiter = {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return;
                }
                // Register under the count lock so an `up` racing with the
                // unlock cannot miss us.
                self.waiters.prepare()
            };
            waiter.park("sem_down");
        }
    }

    /// Attempts to decrement without blocking. Returns `false` if the
    /// count was zero.
    pub fn try_down(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the count and wakes one waiter.
    ///
    /// Safe to call from interrupt context: never blocks.
    pub fn up(&self) {
        {
            let mut count = self.count.lock();
            *count += 1;
        }
        self.waiters.wake_one();
    }

    /// Returns the current count (racy, diagnostics only).
    pub fn value(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn down_up_counts() {
        let sem = Semaphore::new(2);
        sem.down();
        sem.down();
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn up_releases_blocked_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.down();
            sem2.down();
        });
        sem.up();
        sem.up();
        handle.join().unwrap();
        assert_eq!(sem.value(), 0);
    }
}
