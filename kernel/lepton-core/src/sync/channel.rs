//! Bounded inter-thread channel.
//!
//! The kernel's event plumbing: interrupt top halves push fixed-size
//! records with [`Channel::send`] (non-blocking when the channel was
//! created with [`ChanFlags::NOBLOCK`]) and service threads drain them
//! with [`Channel::recv`] / [`Channel::recv_noblock`]. Closing a channel
//! wakes all blocked peers with an error, which is how subsystem teardown
//! cancels in-flight waits.

use alloc::collections::VecDeque;
use bitflags::bitflags;

use crate::errno::{Errno, KResult};
use crate::sync::{SpinLock, WaitQueue};

bitflags! {
    /// Channel behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChanFlags: u32 {
        /// `send` fails with `EAGAIN` when full instead of blocking.
        /// Required for channels fed from interrupt handlers.
        const NOBLOCK = 1 << 0;
    }
}

struct ChanInner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A bounded multi-producer multi-consumer channel.
pub struct Channel<T> {
    inner: SpinLock<ChanInner<T>>,
    capacity: usize,
    flags: ChanFlags,
    name: &'static str,
    send_wq: WaitQueue,
    recv_wq: WaitQueue,
}

impl<T> Channel<T> {
    /// Creates a channel holding at most `capacity` elements.
    pub fn new(capacity: usize, flags: ChanFlags, name: &'static str) -> Self {
        Self {
            inner: SpinLock::new(ChanInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            flags,
            name,
            send_wq: WaitQueue::new(),
            recv_wq: WaitQueue::new(),
        }
    }

    /// Returns the channel's diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sends a value.
    ///
    /// Blocks while the channel is full unless created with
    /// [`ChanFlags::NOBLOCK`], in which case a full channel yields
    /// `EAGAIN`. A closed channel yields `ENXIO`.
    pub fn send(&self, value: T) -> KResult<()> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(Errno::Nxio);
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(value);
                    drop(inner);
                    self.recv_wq.wake_one();
                    return Ok(());
                }
                if self.flags.contains(ChanFlags::NOBLOCK) {
                    return Err(Errno::Again);
                }
                self.send_wq.prepare()
            };
            waiter.park("chan_send");
        }
    }

    /// Receives a value, blocking while the channel is empty.
    ///
    /// Returns `ENXIO` once the channel is closed and drained.
    pub fn recv(&self) -> KResult<T> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                if let Some(v) = inner.queue.pop_front() {
                    drop(inner);
                    self.send_wq.wake_one();
                    return Ok(v);
                }
                if inner.closed {
                    return Err(Errno::Nxio);
                }
                self.recv_wq.prepare()
            };
            waiter.park("chan_recv");
        }
    }

    /// Receives a value without blocking.
    ///
    /// Returns `EAGAIN` if the channel is empty, `ENXIO` if it is closed
    /// and drained.
    pub fn recv_noblock(&self) -> KResult<T> {
        let mut inner = self.inner.lock();
        if let Some(v) = inner.queue.pop_front() {
            drop(inner);
            self.send_wq.wake_one();
            return Ok(v);
        }
        if inner.closed {
            Err(Errno::Nxio)
        } else {
            Err(Errno::Again)
        }
    }

    /// Blocks until the channel is non-empty (without consuming) or
    /// closed. Returns `ENXIO` if closed.
    pub fn wait(&self) -> KResult<()> {
        loop {
            let waiter = {
                let inner = self.inner.lock();
                if !inner.queue.is_empty() {
                    return Ok(());
                }
                if inner.closed {
                    return Err(Errno::Nxio);
                }
                self.recv_wq.prepare()
            };
            waiter.park("chan_wait");
        }
    }

    /// Closes the channel, waking all blocked senders and receivers.
    /// Queued values remain receivable via [`recv_noblock`]
    /// (`Self::recv_noblock`) until drained.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.recv_wq.wake_all();
        self.send_wq.wake_all();
    }

    /// Returns the number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns `true` if no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Returns `true` if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn send_recv_fifo() {
        let ch = Channel::new(4, ChanFlags::empty(), "test");
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        assert_eq!(ch.recv().unwrap(), 1);
        assert_eq!(ch.recv().unwrap(), 2);
    }

    #[test]
    fn noblock_full_returns_again() {
        let ch = Channel::new(2, ChanFlags::NOBLOCK, "test");
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        assert_eq!(ch.send(3), Err(Errno::Again));
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn recv_noblock_empty_returns_again() {
        let ch: Channel<u8> = Channel::new(2, ChanFlags::empty(), "test");
        assert_eq!(ch.recv_noblock(), Err(Errno::Again));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let ch: Arc<Channel<u8>> = Arc::new(Channel::new(1, ChanFlags::empty(), "test"));
        let ch2 = ch.clone();
        let handle = thread::spawn(move || ch2.recv());
        // Let the receiver block, then close.
        while ch.recv_wq.is_empty() {
            thread::yield_now();
        }
        ch.close();
        assert_eq!(handle.join().unwrap(), Err(Errno::Nxio));
    }

    #[test]
    fn close_drains_then_errors() {
        let ch = Channel::new(4, ChanFlags::NOBLOCK, "test");
        ch.send(9).unwrap();
        ch.close();
        assert_eq!(ch.recv_noblock().unwrap(), 9);
        assert_eq!(ch.recv_noblock(), Err(Errno::Nxio));
        assert_eq!(ch.send(1), Err(Errno::Nxio));
    }

    #[test]
    fn cross_thread_transfer() {
        let ch: Arc<Channel<u32>> = Arc::new(Channel::new(8, ChanFlags::empty(), "xfer"));
        let ch2 = ch.clone();
        let producer = thread::spawn(move || {
            for i in 0..100 {
                ch2.send(i).unwrap();
            }
        });
        let mut got = Vec::new();
        for _ in 0..100 {
            got.push(ch.recv().unwrap());
        }
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }
}
