//! Synchronization primitives for the kernel.
//!
//! Spin-based locks ([`SpinLock`], [`IrqSpinLock`], [`RwLock`]) are usable
//! from any context including interrupt handlers. Sleeping primitives
//! ([`Mutex`], [`Semaphore`], [`WaitQueue`], [`CondVar`], [`Channel`])
//! suspend the calling thread through the scheduler hooks in
//! [`crate::sched`].

mod channel;
mod condvar;
mod irq_spinlock;
mod mutex;
mod rwlock;
mod semaphore;
mod spinlock;
mod waitqueue;

pub use channel::{ChanFlags, Channel};
pub use condvar::CondVar;
pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use waitqueue::{WaitQueue, Waiter};
