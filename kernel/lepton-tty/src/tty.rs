//! Tty objects and the minimal line discipline.
//!
//! A [`Tty`] owns an input queue fed by the driver's receive path and an
//! output queue drained by the driver's transmit pump. The discipline is
//! raw-with-echo: received characters are queued for readers verbatim
//! and echoed back to the output queue when echo is enabled.

use alloc::collections::VecDeque;

use bitflags::bitflags;
use lepton_core::sync::{SpinLock, WaitQueue};
use lepton_core::{Errno, KResult};

/// Capacity of the input and output byte queues.
const TTY_QUEUE_CAPACITY: usize = 8192;

/// Word length for serial framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordLength {
    /// 5 data bits.
    Cs5,
    /// 6 data bits.
    Cs6,
    /// 7 data bits.
    Cs7,
    /// 8 data bits.
    Cs8,
}

/// Line settings (termios subset used by the serial layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
    /// Line speed in baud.
    pub baud: u32,
    /// Data bits per word.
    pub word_length: WordLength,
    /// Two stop bits instead of one.
    pub two_stop_bits: bool,
    /// Parity generation/checking enabled.
    pub parity: bool,
    /// Odd parity (with `parity`).
    pub parity_odd: bool,
    /// Echo received characters.
    pub echo: bool,
}

impl Default for Termios {
    fn default() -> Self {
        // 115200-8N1, no echo.
        Self {
            baud: 115_200,
            word_length: WordLength::Cs8,
            two_stop_bits: false,
            parity: false,
            parity_odd: false,
            echo: false,
        }
    }
}

bitflags! {
    /// Tty state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TtyFlags: u32 {
        /// Data carrier detected.
        const DCD_READY = 1 << 0;
    }
}

bitflags! {
    /// Receive-side condition flags passed into the discipline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        /// Parity error on this character.
        const PARITY = 1 << 0;
        /// Framing error on this character.
        const FRAMING = 1 << 1;
        /// Break condition.
        const BREAK = 1 << 2;
    }
}

struct ByteQueue {
    buf: VecDeque<u8>,
}

/// A tty: line settings plus input/output byte queues with their wait
/// queues.
pub struct Tty {
    termios: SpinLock<Termios>,
    flags: SpinLock<TtyFlags>,
    inq: SpinLock<ByteQueue>,
    outq: SpinLock<ByteQueue>,
    /// Readers waiting for input.
    in_wait: WaitQueue,
    /// The transmit pump waiting for output.
    pub out_wait: WaitQueue,
    /// Waiters for carrier-detect changes.
    pub dcd_wait: WaitQueue,
    /// Dropped input characters (queue overflow or line errors).
    overruns: SpinLock<u64>,
}

impl Tty {
    /// Creates a tty with default line settings.
    pub fn new() -> Tty {
        Self::with_termios(Termios::default())
    }

    /// Creates a tty with explicit line settings.
    pub fn with_termios(termios: Termios) -> Tty {
        Tty {
            termios: SpinLock::new(termios),
            flags: SpinLock::new(TtyFlags::empty()),
            inq: SpinLock::new(ByteQueue {
                buf: VecDeque::new(),
            }),
            outq: SpinLock::new(ByteQueue {
                buf: VecDeque::new(),
            }),
            in_wait: WaitQueue::new(),
            out_wait: WaitQueue::new(),
            dcd_wait: WaitQueue::new(),
            overruns: SpinLock::new(0),
        }
    }

    /// Returns the current line settings.
    pub fn termios(&self) -> Termios {
        *self.termios.lock()
    }

    /// Replaces the line settings.
    pub fn set_termios(&self, termios: Termios) {
        *self.termios.lock() = termios;
    }

    /// Returns the state flags.
    pub fn flags(&self) -> TtyFlags {
        *self.flags.lock()
    }

    /// Sets or clears carrier-detect and signals waiters.
    pub fn set_dcd(&self, ready: bool) {
        {
            let mut flags = self.flags.lock();
            if ready {
                flags.insert(TtyFlags::DCD_READY);
            } else {
                flags.remove(TtyFlags::DCD_READY);
            }
        }
        self.dcd_wait.wake_all();
    }

    // -- discipline input (driver receive path) ------------------------

    /// Feeds one received character into the discipline.
    ///
    /// Characters carrying break or framing conditions are dropped and
    /// counted; parity errors are dropped as well. Echo (when enabled)
    /// copies the character to the output queue.
    pub fn rint(&self, ch: u8, flags: InputFlags) -> KResult<()> {
        if flags.intersects(InputFlags::BREAK | InputFlags::FRAMING | InputFlags::PARITY) {
            *self.overruns.lock() += 1;
            return Ok(());
        }

        {
            let mut inq = self.inq.lock();
            if inq.buf.len() >= TTY_QUEUE_CAPACITY {
                *self.overruns.lock() += 1;
                return Err(Errno::Again);
            }
            inq.buf.push_back(ch);
        }

        if self.termios.lock().echo {
            let mut outq = self.outq.lock();
            if outq.buf.len() < TTY_QUEUE_CAPACITY {
                outq.buf.push_back(ch);
            }
            drop(outq);
            self.out_wait.wake_all();
        }
        Ok(())
    }

    /// Marks the end of a burst of received characters, waking readers.
    pub fn rint_done(&self) {
        self.in_wait.wake_all();
    }

    // -- reader side ----------------------------------------------------

    /// Reads available input, blocking until at least one byte arrives.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let waiter = {
                let mut inq = self.inq.lock();
                if !inq.buf.is_empty() {
                    let mut n = 0;
                    while n < buf.len() {
                        match inq.buf.pop_front() {
                            Some(b) => {
                                buf[n] = b;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    return Ok(n);
                }
                self.in_wait.prepare()
            };
            waiter.park("tty_read");
        }
    }

    /// Non-blocking read.
    pub fn read_noblock(&self, buf: &mut [u8]) -> KResult<usize> {
        let mut inq = self.inq.lock();
        if inq.buf.is_empty() {
            return Err(Errno::Again);
        }
        let mut n = 0;
        while n < buf.len() {
            match inq.buf.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    // -- writer side ----------------------------------------------------

    /// Queues bytes for transmission and wakes the transmit pump.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        let n = {
            let mut outq = self.outq.lock();
            let room = TTY_QUEUE_CAPACITY - outq.buf.len();
            let n = room.min(buf.len());
            outq.buf.extend(&buf[..n]);
            n
        };
        if n > 0 {
            self.out_wait.wake_all();
        }
        if n == 0 { Err(Errno::Again) } else { Ok(n) }
    }

    /// Pops one byte from the output queue (transmit pump side).
    pub fn outq_get(&self) -> Option<u8> {
        self.outq.lock().buf.pop_front()
    }

    /// Peeks the output queue without consuming.
    pub fn outq_peek(&self) -> Option<u8> {
        self.outq.lock().buf.front().copied()
    }

    /// Number of bytes waiting for transmission.
    pub fn outq_len(&self) -> usize {
        self.outq.lock().buf.len()
    }

    /// Input characters dropped so far.
    pub fn overruns(&self) -> u64 {
        *self.overruns.lock()
    }
}

impl Default for Tty {
    fn default() -> Self {
        Self::new()
    }
}
