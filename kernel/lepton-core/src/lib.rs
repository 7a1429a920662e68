//! Core types and synchronization primitives for the Lepton kernel.
//!
//! This crate contains host-testable abstractions shared by every other
//! kernel crate: spin locks, sleepable mutexes, wait queues, semaphores,
//! bounded channels, the logging macros, errno values, ID allocators, and
//! the clock/CPU/scheduler hook points.
//!
//! Hardware and scheduler interaction goes through registered function
//! hooks so the crate can be tested with `cargo test` on the host without
//! a kernel target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod cpu;
pub mod cpu_local;
pub mod errno;
pub mod id;
pub mod log;
pub mod sched;
pub mod sync;

pub use errno::{Errno, KResult};
