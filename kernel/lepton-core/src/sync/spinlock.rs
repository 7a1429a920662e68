//! Busy-wait mutual exclusion.
//!
//! The lock word is a single flag taken with an atomic swap; losers spin
//! on plain loads with the CPU pause hint until the flag clears, then
//! race for the swap again. Critical sections must stay short — anything
//! that can sleep belongs under [`Mutex`](super::Mutex). Sharing data
//! with interrupt handlers additionally requires
//! [`IrqSpinLock`](super::IrqSpinLock), which masks interrupts for the
//! hold duration.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::cpu_pause;

/// A busy-waiting mutual exclusion lock.
///
/// Const-constructable, so it can guard `static` state from the first
/// instruction of boot.
pub struct SpinLock<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the `held` flag serializes all access to `value`, so moving
// the protected data between threads is as safe as the data itself.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unheld lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Busy-waits until the lock is taken, returning the guard that
    /// releases it on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // swap() both tests and claims; a true result means someone
        // else holds it, so wait on cheap loads before retrying the
        // claiming write.
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                cpu_pause();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Takes the lock only if it is free right now.
    ///
    /// The non-waiting path for contexts that must not spin, such as
    /// panic reporting.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }

    /// Reports whether the lock is currently held (racy; diagnostics
    /// only).
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

/// Exclusive access to a [`SpinLock`]'s data; releases on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Returns the lock this guard came from, so a sleeping primitive
    /// (see [`CondVar`](super::CondVar)) can release and later
    /// re-acquire it.
    pub fn source(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the flag; no other
        // reference to the data can exist.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for Deref, plus the guard itself is borrowed
        // mutably.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_scopes_access() {
        let lock = SpinLock::new(vec![1, 2, 3]);
        lock.lock().push(4);
        assert_eq!(lock.lock().len(), 4);
    }

    #[test]
    fn held_flag_follows_guard() {
        let lock = SpinLock::new(());
        assert!(!lock.is_held());
        let guard = lock.lock();
        assert!(lock.is_held());
        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn try_lock_refuses_contended() {
        let lock = SpinLock::new(5);
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        // A failed try_lock must not have poisoned the flag.
        assert_eq!(*lock.try_lock().expect("lock is free"), 5);
    }

    #[test]
    fn serializes_across_threads() {
        let lock = Arc::new(SpinLock::new((0u64, 0u64)));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let mut pair = lock.lock();
                        // Both halves move together only if the section
                        // is exclusive.
                        pair.0 += 1;
                        pair.1 += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let pair = lock.lock();
        assert_eq!(*pair, (40_000, 40_000));
    }
}
