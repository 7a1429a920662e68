//! Busy-wait shared/exclusive lock.
//!
//! One atomic word encodes both roles: bit 31 is the writer flag, the
//! low 31 bits count active readers. Readers join by incrementing the
//! count while the writer bit is clear; a writer claims the whole word
//! only when it reads zero. The vnode data lock is the main customer:
//! many concurrent readers, short exclusive windows for mutation.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::cpu::cpu_pause;

/// Writer flag in the state word; everything below it is the reader
/// count.
const WRITER: u32 = 1 << 31;

/// A busy-waiting reader-writer lock.
///
/// Const-constructable for `static` items. Writers do not get priority:
/// a steady stream of readers can delay a writer, which is acceptable
/// for the short windows this lock is used for.
pub struct RwLock<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: the state word admits either one exclusive holder (`T: Send`
// suffices) or many shared readers, which hand out `&T` concurrently
// and therefore require `T: Sync`.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates an unheld lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Joins the reader side, waiting out any active writer.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let seen = self.state.load(Ordering::Relaxed);
            if seen & WRITER == 0 {
                // Claim a reader slot; fails if a writer slipped in or
                // another reader moved the count.
                if self
                    .state
                    .compare_exchange_weak(seen, seen + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
            }
            cpu_pause();
        }
    }

    /// Takes the writer side, waiting for every reader to leave.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwLockWriteGuard { lock: self };
            }
            // Wait for the word to drain before contending again.
            while self.state.load(Ordering::Relaxed) != 0 {
                cpu_pause();
            }
        }
    }

    /// Current reader count (racy; diagnostics only).
    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & !WRITER
    }

    /// Whether a writer currently holds the lock (racy; diagnostics
    /// only).
    pub fn writer_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

/// Shared access to an [`RwLock`]'s data; leaves the reader side on
/// drop.
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a reader slot in the state word excludes writers, so
        // shared references are valid for the guard's lifetime.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive access to an [`RwLock`]'s data; clears the writer flag on
/// drop.
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer flag excludes every other holder.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as for Deref, with the guard borrowed mutably.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_share() {
        let lock = RwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!((*a, *b), (7, 7));
        assert_eq!(lock.reader_count(), 2);
        assert!(!lock.writer_held());
    }

    #[test]
    fn writer_drains_to_zero() {
        let lock = RwLock::new(String::new());
        {
            let mut guard = lock.write();
            guard.push_str("written");
            assert!(lock.writer_held());
            assert_eq!(lock.reader_count(), 0);
        }
        assert!(!lock.writer_held());
        assert_eq!(&*lock.read(), "written");
    }

    #[test]
    fn state_word_encoding() {
        let lock = RwLock::new(());
        let readers: Vec<_> = (0..5).map(|_| lock.read()).collect();
        assert_eq!(lock.reader_count(), 5);
        drop(readers);
        assert_eq!(lock.reader_count(), 0);

        let w = lock.write();
        // The writer bit is not mistaken for readers.
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.writer_held());
        drop(w);
    }

    #[test]
    fn writers_are_exclusive_across_threads() {
        let lock = Arc::new(RwLock::new(0u64));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        *lock.write() += 1;
                    }
                })
            })
            .collect();

        // Concurrent readers only ever observe settled values.
        let reader = {
            let lock = lock.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    let seen = *lock.read();
                    assert!(seen <= 20_000);
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(*lock.read(), 20_000);
    }
}
