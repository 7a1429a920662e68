//! 16550 UART driver.
//!
//! The four standard COM ports share two IRQ lines (IRQ4 for COM1/COM3,
//! IRQ3 for COM2/COM4). The top half inspects each sibling port's
//! interrupt-identification register, reads the relevant status register
//! to clear the latch, classifies the event, and posts a record onto a
//! 128-slot non-blocking channel; a softirq thread dispatches records to
//! the per-port tty handlers. Transmission is a per-port pump draining
//! the tty output queue against the transmitter-holding-register-empty
//! bit.

use alloc::sync::Arc;

use bitflags::bitflags;
use lepton_core::sync::{ChanFlags, Channel, SpinLock};
use lepton_core::{Errno, KResult, kdebug, kerror, kwarn};

use crate::tty::{InputFlags, Termios, Tty, WordLength};

/// COM1 base I/O port.
pub const COM1: u16 = 0x3F8;
/// COM2 base I/O port.
pub const COM2: u16 = 0x2F8;
/// COM3 base I/O port.
pub const COM3: u16 = 0x3E8;
/// COM4 base I/O port.
pub const COM4: u16 = 0x2E8;

/// IRQ line shared by COM1 and COM3.
pub const UART_COM13_IRQ: u32 = 4;
/// IRQ line shared by COM2 and COM4.
pub const UART_COM24_IRQ: u32 = 3;

/// Register offsets from the port base.
mod reg {
    /// Data register (RBR read / THR write, DLAB=0) and divisor LSB
    /// (DLAB=1).
    pub const DATA: u16 = 0;
    /// Interrupt enable (DLAB=0), divisor MSB (DLAB=1).
    pub const INTR_EN: u16 = 1;
    /// FIFO control (write) / interrupt identification (read).
    pub const FIFO_CTRL: u16 = 2;
    /// Line control.
    pub const LINE_CTRL: u16 = 3;
    /// Modem control.
    pub const MODEM_CTRL: u16 = 4;
    /// Line status.
    pub const LINE_STATUS: u16 = 5;
    /// Modem status.
    pub const MODEM_STATUS: u16 = 6;
}

bitflags! {
    /// Line Status Register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lsr: u8 {
        /// Received data available.
        const DATA_READY = 1 << 0;
        /// Overrun error.
        const OVERRUN = 1 << 1;
        /// Parity error.
        const PARITY = 1 << 2;
        /// Framing error.
        const FRAMING = 1 << 3;
        /// Break interrupt.
        const BREAK = 1 << 4;
        /// Transmitter holding register empty.
        const THR_EMPTY = 1 << 5;
        /// Transmitter fully idle.
        const TX_IDLE = 1 << 6;
        /// Error in receive FIFO.
        const FIFO_ERROR = 1 << 7;
    }
}

bitflags! {
    /// Modem Status Register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Msr: u8 {
        /// DCD changed since last read.
        const DCD_DELTA = 1 << 3;
        /// Clear to send.
        const CTS = 1 << 4;
        /// Data set ready.
        const DSR = 1 << 5;
        /// Ring indicator.
        const RI = 1 << 6;
        /// Data carrier detect.
        const DCD = 1 << 7;
    }
}

bitflags! {
    /// Modem control bits exposed to the tty layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModemBits: u32 {
        /// Clear to send.
        const CTS = 1 << 0;
        /// Data set ready.
        const DSR = 1 << 1;
        /// Data carrier detect.
        const DCD = 1 << 2;
        /// Ring indicator.
        const RI = 1 << 3;
    }
}

/// Returns `true` for one of the four standard ports.
fn is_valid_port(port: u16) -> bool {
    matches!(port, COM1 | COM2 | COM3 | COM4)
}

/// Handler slot index for a port (COM1..COM4 → 0..3).
fn port_index(port: u16) -> usize {
    match port {
        COM1 => 0,
        COM2 => 1,
        COM3 => 2,
        COM4 => 3,
        _ => unreachable!("invalid uart port {port:#x}"),
    }
}

// ---------------------------------------------------------------------------
// Hardware access
// ---------------------------------------------------------------------------

/// Byte-wide port I/O, mockable for tests.
pub trait UartIo: Send + Sync {
    /// Writes a byte to an I/O port.
    fn outb(&self, port: u16, value: u8);
    /// Reads a byte from an I/O port.
    fn inb(&self, port: u16) -> u8;
}

/// Real x86 port I/O.
pub struct PortIo;

impl UartIo for PortIo {
    #[allow(unused_variables)]
    fn outb(&self, port: u16, value: u8) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: port I/O to the UART register block.
        unsafe {
            core::arch::asm!("out dx, al", in("dx") port, in("al") value,
                             options(nomem, nostack, preserves_flags));
        }
    }

    #[allow(unused_variables)]
    fn inb(&self, port: u16) -> u8 {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let value: u8;
            // SAFETY: port I/O from the UART register block.
            unsafe {
                core::arch::asm!("in al, dx", out("al") value, in("dx") port,
                                 options(nomem, nostack, preserves_flags));
            }
            value
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            0xFF
        }
    }
}

// ---------------------------------------------------------------------------
// Probe and configuration
// ---------------------------------------------------------------------------

/// Probes a port: programs 115200-8N1, loops a test byte back, and
/// restores normal operation. Returns `true` if the hardware responded.
pub fn uart_hw_init_probe(io: &dyn UartIo, port: u16) -> bool {
    if !is_valid_port(port) {
        kerror!("uart: invalid port: {port:#x}");
        return false;
    }

    io.outb(port + reg::INTR_EN, 0x00); // disable interrupts

    // DLAB on, divisor 1 (115200 baud).
    io.outb(port + reg::LINE_CTRL, 0x80);
    io.outb(port + reg::DATA, 0x01);
    io.outb(port + reg::INTR_EN, 0x00);

    io.outb(port + reg::LINE_CTRL, 0x03); // 8N1, DLAB off
    io.outb(port + reg::FIFO_CTRL, 0xC7); // FIFO on, clear, 14-byte trigger
    io.outb(port + reg::MODEM_CTRL, 0x1E); // loopback + OUT2

    io.outb(port + reg::DATA, 0xAE);
    let present = io.inb(port + reg::DATA) == 0xAE;

    io.outb(port + reg::MODEM_CTRL, 0x0F); // normal operation
    present
}

/// Programs line settings from a termios. Returns `EINVAL` for
/// unsupported speeds.
pub fn uart_hw_configure(io: &dyn UartIo, port: u16, tio: &Termios) -> KResult<()> {
    let lcr = termios_to_lcr(tio);

    const SUPPORTED: [u32; 9] = [1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600, 115_200];
    if !SUPPORTED.contains(&tio.baud) {
        kerror!("uart: unsupported baud rate {}", tio.baud);
        return Err(Errno::Inval);
    }
    let divisor = (115_200 / tio.baud) as u16;

    // DLAB on, program divisor, restore.
    io.outb(port + reg::LINE_CTRL, lcr | 0x80);
    io.outb(port + reg::DATA, (divisor & 0xFF) as u8);
    io.outb(port + reg::INTR_EN, (divisor >> 8) as u8);
    io.outb(port + reg::LINE_CTRL, lcr);

    io.outb(port + reg::FIFO_CTRL, 0x00); // FIFO off
    io.outb(port + reg::MODEM_CTRL, 0x0F); // DTR + RTS + OUT1 + OUT2
    Ok(())
}

/// Computes the LCR byte for a termios (shared with tests).
pub fn termios_to_lcr(tio: &Termios) -> u8 {
    let mut lcr: u8 = match tio.word_length {
        WordLength::Cs5 => 0x00,
        WordLength::Cs6 => 0x01,
        WordLength::Cs7 => 0x02,
        WordLength::Cs8 => 0x03,
    };
    if tio.two_stop_bits {
        lcr |= 0x04;
    }
    if tio.parity {
        lcr |= 0x08;
        if !tio.parity_odd {
            lcr |= 0x10;
        }
    }
    lcr
}

// ---------------------------------------------------------------------------
// Busy-wait data path
// ---------------------------------------------------------------------------

/// Bounded retries for the busy-wait register paths.
const BUSY_RETRIES: u32 = 1_000_000;

/// Reads one character, busy-waiting (bounded) for data.
pub fn uart_hw_busy_read_ch(io: &dyn UartIo, port: u16) -> KResult<u8> {
    for _ in 0..BUSY_RETRIES {
        if io.inb(port + reg::LINE_STATUS) & Lsr::DATA_READY.bits() != 0 {
            return Ok(io.inb(port + reg::DATA));
        }
        core::hint::spin_loop();
    }
    Err(Errno::TimedOut)
}

/// Writes one character, busy-waiting (bounded) for the transmitter.
pub fn uart_hw_busy_write_ch(io: &dyn UartIo, port: u16, c: u8) -> KResult<()> {
    for _ in 0..BUSY_RETRIES {
        if io.inb(port + reg::LINE_STATUS) & Lsr::THR_EMPTY.bits() != 0 {
            io.outb(port + reg::DATA, c);
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(Errno::TimedOut)
}

/// Returns `true` if receive data is available.
pub fn uart_hw_can_read(io: &dyn UartIo, port: u16) -> bool {
    io.inb(port + reg::LINE_STATUS) & Lsr::DATA_READY.bits() != 0
}

/// Returns `true` if the transmitter can accept a byte.
pub fn uart_hw_can_write(io: &dyn UartIo, port: u16) -> bool {
    io.inb(port + reg::LINE_STATUS) & Lsr::THR_EMPTY.bits() != 0
}

/// Reads the modem status lines.
pub fn uart_hw_modem_query(io: &dyn UartIo, port: u16) -> ModemBits {
    let status = Msr::from_bits_truncate(io.inb(port + reg::MODEM_STATUS));
    let mut bits = ModemBits::empty();
    if status.contains(Msr::CTS) {
        bits |= ModemBits::CTS;
    }
    if status.contains(Msr::DSR) {
        bits |= ModemBits::DSR;
    }
    if status.contains(Msr::DCD) {
        bits |= ModemBits::DCD;
    }
    if status.contains(Msr::RI) {
        bits |= ModemBits::RI;
    }
    bits
}

/// Modem-control outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemLine {
    /// Data terminal ready.
    Dtr,
    /// Request to send.
    Rts,
}

/// Sets or clears a modem-control output.
pub fn uart_hw_modem_set(io: &dyn UartIo, port: u16, line: ModemLine, on: bool) {
    let bit = match line {
        ModemLine::Dtr => 0x01,
        ModemLine::Rts => 0x02,
    };
    let mcr = io.inb(port + reg::MODEM_CTRL);
    if on {
        io.outb(port + reg::MODEM_CTRL, mcr | bit);
    } else {
        io.outb(port + reg::MODEM_CTRL, mcr & !bit);
    }
}

// ---------------------------------------------------------------------------
// Interrupt demultiplexing
// ---------------------------------------------------------------------------

/// Classified UART interrupt events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartEvent {
    /// Received data (possibly with a line-error condition in `data`).
    Rx,
    /// Transmitter ready for more data.
    Tx,
    /// Data-carrier-detect change (`data` = new state).
    Dcd,
}

/// One demultiplexed interrupt record.
#[derive(Debug, Clone, Copy)]
pub struct UartIrq {
    /// Originating port base.
    pub port: u16,
    /// Handler slot index (0..3).
    pub index: usize,
    /// Classified event.
    pub event: UartEvent,
    /// Event payload: line-error [`InputFlags`] bits for `Rx`, DCD state
    /// for `Dcd`.
    pub data: u32,
}

/// Classifies a pending interrupt for `port` from its IIR value,
/// reading the status register needed to clear the latch. Returns
/// `None` when the condition carries no event.
fn classify_irq(io: &dyn UartIo, port: u16, iir: u8) -> Option<UartIrq> {
    let index = port_index(port);
    match (iir >> 1) & 0x3 {
        0 => {
            // Modem status change: read MSR to clear.
            let status = Msr::from_bits_truncate(io.inb(port + reg::MODEM_STATUS));
            if status.contains(Msr::DCD_DELTA) {
                Some(UartIrq {
                    port,
                    index,
                    event: UartEvent::Dcd,
                    data: u32::from(status.contains(Msr::DCD)),
                })
            } else {
                None
            }
        }
        1 => Some(UartIrq {
            port,
            index,
            event: UartEvent::Tx,
            data: 0,
        }),
        2 => Some(UartIrq {
            port,
            index,
            event: UartEvent::Rx,
            data: 0,
        }),
        3 => {
            // Line status change: read LSR to clear, map the error.
            let status = Lsr::from_bits_truncate(io.inb(port + reg::LINE_STATUS));
            let mut flags = InputFlags::empty();
            if status.contains(Lsr::PARITY) {
                flags |= InputFlags::PARITY;
            }
            if status.contains(Lsr::FRAMING) {
                flags |= InputFlags::FRAMING;
            }
            if status.contains(Lsr::BREAK) {
                flags |= InputFlags::BREAK;
            }
            if status.contains(Lsr::OVERRUN) || !flags.is_empty() {
                Some(UartIrq {
                    port,
                    index,
                    event: UartEvent::Rx,
                    data: flags.bits(),
                })
            } else {
                None
            }
        }
        _ => unreachable!(),
    }
}

/// A per-port softirq handler: invoked with each classified event.
pub type PortHandler = Arc<dyn Fn(UartEvent, u32) + Send + Sync>;

struct IrqState {
    handlers: [Option<PortHandler>; 4],
}

static IRQ_STATE: SpinLock<IrqState> = SpinLock::new(IrqState {
    handlers: [None, None, None, None],
});

/// The softirq channel: 128 slots, non-blocking producer (the top half
/// must never sleep).
static SOFTIRQ_CHAN: SpinLock<Option<Arc<Channel<UartIrq>>>> = SpinLock::new(None);

/// Allocates the softirq channel. Called once at driver init; returns
/// the consumer handle for the softirq thread.
pub fn uart_softirq_init() -> Arc<Channel<UartIrq>> {
    let chan = Arc::new(Channel::new(128, ChanFlags::NOBLOCK, "uart_softirq"));
    *SOFTIRQ_CHAN.lock() = Some(chan.clone());
    chan
}

fn softirq_send(irq: UartIrq) {
    let chan = SOFTIRQ_CHAN.lock().clone();
    match chan {
        Some(chan) => {
            if chan.send(irq).is_err() {
                kerror!("uart: failed to send uart irq to softirq handler");
            }
        }
        None => kwarn!("uart: irq before softirq init"),
    }
}

/// Top-half IRQ handler for one shared line (1 = COM1/COM3,
/// 2 = COM2/COM4). IIR bit 0 is clear when an interrupt is pending.
pub fn uart_irq_handler(io: &dyn UartIo, line: u32) {
    let ports: [u16; 2] = match line {
        1 => [COM1, COM3],
        2 => [COM2, COM4],
        _ => unreachable!("invalid uart irq line {line}"),
    };

    for port in ports {
        let iir = io.inb(port + reg::FIFO_CTRL);
        if iir & 0x01 == 0 {
            if let Some(irq) = classify_irq(io, port, iir) {
                softirq_send(irq);
            }
            // One pending port per line assertion; the sibling keeps its
            // latch until the next interrupt.
            break;
        }
    }
}

/// Registers a port's softirq handler and unmasks its interrupts.
pub fn uart_set_irq_handler(io: &dyn UartIo, port: u16, handler: PortHandler) -> KResult<()> {
    if !is_valid_port(port) {
        return Err(Errno::Inval);
    }
    let mut state = IRQ_STATE.lock();
    state.handlers[port_index(port)] = Some(handler);
    // Enable data-available + modem-status interrupts on the port.
    io.outb(port + reg::INTR_EN, 0x09);
    Ok(())
}

/// Unregisters a port's handler, masking the IRQ line only when the
/// sibling port sharing it has no handler either.
pub fn uart_unset_irq_handler(io: &dyn UartIo, port: u16) {
    if !is_valid_port(port) {
        return;
    }
    let index = port_index(port);
    let sibling = match port {
        COM1 => port_index(COM3),
        COM3 => port_index(COM1),
        COM2 => port_index(COM4),
        COM4 => port_index(COM2),
        _ => unreachable!(),
    };

    let mut state = IRQ_STATE.lock();
    state.handlers[index] = None;
    io.outb(port + reg::INTR_EN, 0x00);
    if state.handlers[sibling].is_none() {
        // Both ports quiet: the shared line can be masked by the
        // platform interrupt controller (done by the caller).
        kdebug!("uart: both ports on shared line idle");
    }
}

/// Softirq service body: drains the channel and dispatches to the
/// registered per-port handlers. Returns when the channel is closed.
pub fn uart_softirq_loop(chan: &Channel<UartIrq>) {
    kdebug!("uart: starting softirq handler");
    while let Ok(irq) = chan.recv() {
        let handler = IRQ_STATE.lock().handlers[irq.index].clone();
        if let Some(handler) = handler {
            handler(irq.event, irq.data);
        }
    }
    kdebug!("uart: softirq channel closed, exiting handler");
}

// ---------------------------------------------------------------------------
// Tty device glue
// ---------------------------------------------------------------------------

/// A UART-backed tty device.
pub struct UartDevice {
    /// Port base address.
    pub port: u16,
    io: Arc<dyn UartIo>,
    tty: Arc<Tty>,
    self_weak: lepton_core::sync::SpinLock<alloc::sync::Weak<UartDevice>>,
}

impl UartDevice {
    /// Probes and configures the port, binding it to a fresh tty.
    /// Returns `ENXIO` when the probe fails (that port is skipped).
    pub fn attach(io: Arc<dyn UartIo>, port: u16, termios: Termios) -> KResult<Arc<UartDevice>> {
        if !uart_hw_init_probe(io.as_ref(), port) {
            kwarn!("uart: port {port:#x} probe failed");
            return Err(Errno::Nxio);
        }
        uart_hw_configure(io.as_ref(), port, &termios)?;

        let dev = Arc::new(UartDevice {
            port,
            io,
            tty: Arc::new(Tty::with_termios(termios)),
            self_weak: lepton_core::sync::SpinLock::new(alloc::sync::Weak::new()),
        });
        *dev.self_weak.lock() = Arc::downgrade(&dev);
        kdebug!("uart: attached port {port:#x}");
        Ok(dev)
    }

    /// Returns the bound tty.
    pub fn tty(&self) -> &Arc<Tty> {
        &self.tty
    }

    /// Hooks the port's interrupts into the tty input discipline and
    /// raises DTR.
    pub fn open(&self) -> KResult<()> {
        let dev = self
            .self_weak
            .lock()
            .upgrade()
            .expect("opening a dead uart device");
        uart_set_irq_handler(
            self.io.as_ref(),
            self.port,
            Arc::new(move |event, data| dev.input_event(event, data)),
        )?;
        uart_hw_modem_set(self.io.as_ref(), self.port, ModemLine::Dtr, true);

        let modem = uart_hw_modem_query(self.io.as_ref(), self.port);
        if modem.contains(ModemBits::DCD) {
            self.tty.set_dcd(true);
        }
        Ok(())
    }

    /// Softirq-context input handler: may block.
    fn input_event(&self, event: UartEvent, data: u32) {
        match event {
            UartEvent::Rx => {
                let flags = InputFlags::from_bits_truncate(data);
                while uart_hw_can_read(self.io.as_ref(), self.port) {
                    match uart_hw_busy_read_ch(self.io.as_ref(), self.port) {
                        Ok(ch) => {
                            if self.tty.rint(ch, flags).is_err() {
                                kerror!("uart: input overrun on port {:#x}", self.port);
                                break;
                            }
                        }
                        Err(e) => {
                            kerror!("uart: error reading port {:#x} [{e}]", self.port);
                            break;
                        }
                    }
                }
                self.tty.rint_done();
            }
            UartEvent::Tx => {
                // Transmitter ready: the pump polls THR-empty itself.
            }
            UartEvent::Dcd => {
                self.tty.set_dcd(data != 0);
            }
        }
    }

    /// Drains whatever the tty output queue currently holds into the
    /// transmitter. One step of the transmit-pump thread.
    pub fn pump_output(&self) -> KResult<usize> {
        let mut sent = 0;
        while let Some(ch) = self.tty.outq_get() {
            uart_hw_busy_write_ch(self.io.as_ref(), self.port, ch)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Transmit-pump thread body: drains the output queue, sleeping on
    /// the tty's output wait when it runs dry. Returns on pump error.
    pub fn transmit_pump(&self) -> KResult<()> {
        kdebug!("uart: transmit pump started for port {:#x}", self.port);
        loop {
            if self.tty.outq_peek().is_none() {
                self.tty.out_wait.wait("uart_tx");
                continue;
            }
            self.pump_output()?;
        }
    }
}

// ---------------------------------------------------------------------------
// Console port selection
// ---------------------------------------------------------------------------

static CONSOLE_PORT: SpinLock<u16> = SpinLock::new(COM4);

/// Applies the `console.uart.port` kernel parameter value.
pub fn set_console_port_param(value: &str) {
    let port = match value {
        "com1" => COM1,
        "com2" => COM2,
        "com3" => COM3,
        "com4" => COM4,
        other => {
            kerror!("uart: invalid console uart port: {other}");
            COM4
        }
    };
    *CONSOLE_PORT.lock() = port;
}

/// Returns the selected console port (default COM4).
pub fn console_port() -> u16 {
    *CONSOLE_PORT.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    /// A loopback-capable 16550 model: per-port registers, an RX FIFO,
    /// and a TX capture buffer.
    #[derive(Default)]
    struct PortModel {
        mcr: u8,
        lcr: u8,
        ier: u8,
        divisor: [u8; 2],
        iir: u8,
        lsr_extra: u8,
        msr: u8,
        rx: std::collections::VecDeque<u8>,
        tx: Vec<u8>,
        broken: bool,
    }

    struct MockUart {
        ports: StdMutex<std::collections::HashMap<u16, PortModel>>,
    }

    impl MockUart {
        fn new() -> Arc<MockUart> {
            Arc::new(MockUart {
                ports: StdMutex::new(std::collections::HashMap::new()),
            })
        }

        fn with_port<R>(&self, base: u16, f: impl FnOnce(&mut PortModel) -> R) -> R {
            let mut ports = self.ports.lock().unwrap();
            f(ports.entry(base).or_default())
        }

        fn push_rx(&self, base: u16, bytes: &[u8]) {
            self.with_port(base, |p| p.rx.extend(bytes.iter().copied()));
        }

        fn tx_bytes(&self, base: u16) -> Vec<u8> {
            self.with_port(base, |p| p.tx.clone())
        }

        fn set_iir(&self, base: u16, iir: u8) {
            self.with_port(base, |p| p.iir = iir);
        }
    }

    impl UartIo for MockUart {
        fn outb(&self, port: u16, value: u8) {
            let base = port & !0x7;
            let offset = port & 0x7;
            self.with_port(base, |p| match offset {
                0 => {
                    if p.lcr & 0x80 != 0 {
                        p.divisor[0] = value;
                    } else if p.mcr & 0x10 != 0 {
                        // Loopback: transmitted byte appears on RX.
                        p.rx.push_back(value);
                    } else {
                        p.tx.push(value);
                    }
                }
                1 => {
                    if p.lcr & 0x80 != 0 {
                        p.divisor[1] = value;
                    } else {
                        p.ier = value;
                    }
                }
                2 => {} // FCR write
                3 => p.lcr = value,
                4 => p.mcr = value,
                _ => {}
            });
        }

        fn inb(&self, port: u16) -> u8 {
            let base = port & !0x7;
            let offset = port & 0x7;
            self.with_port(base, |p| match offset {
                0 => {
                    if p.broken {
                        0x00
                    } else {
                        p.rx.pop_front().unwrap_or(0)
                    }
                }
                2 => p.iir,
                3 => p.lcr,
                4 => p.mcr,
                5 => {
                    let mut lsr = Lsr::THR_EMPTY.bits() | p.lsr_extra;
                    if !p.rx.is_empty() {
                        lsr |= Lsr::DATA_READY.bits();
                    }
                    lsr
                }
                6 => p.msr,
                _ => 0,
            })
        }
    }

    #[test]
    fn probe_succeeds_with_loopback() {
        let io = MockUart::new();
        assert!(uart_hw_init_probe(io.as_ref(), COM1));
        // Probe restores normal (non-loopback) operation.
        assert_eq!(io.with_port(COM1, |p| p.mcr), 0x0F);
    }

    #[test]
    fn probe_fails_on_dead_port() {
        let io = MockUart::new();
        io.with_port(COM2, |p| p.broken = true);
        assert!(!uart_hw_init_probe(io.as_ref(), COM2));
        // Invalid port numbers are rejected outright.
        assert!(!uart_hw_init_probe(io.as_ref(), 0x1234));
    }

    #[test]
    fn configure_programs_divisor_and_lcr() {
        let io = MockUart::new();
        let mut tio = Termios::default();
        tio.baud = 9600;
        tio.word_length = WordLength::Cs7;
        tio.parity = true;
        uart_hw_configure(io.as_ref(), COM1, &tio).unwrap();

        // 115200 / 9600 = 12.
        assert_eq!(io.with_port(COM1, |p| p.divisor), [12, 0]);
        // CS7 | PARENB | even parity.
        assert_eq!(io.with_port(COM1, |p| p.lcr), 0x02 | 0x08 | 0x10);

        tio.baud = 12345;
        assert_eq!(uart_hw_configure(io.as_ref(), COM1, &tio), Err(Errno::Inval));
    }

    #[test]
    fn lcr_encoding_matrix() {
        let mut tio = Termios::default();
        assert_eq!(termios_to_lcr(&tio), 0x03); // 8N1
        tio.two_stop_bits = true;
        assert_eq!(termios_to_lcr(&tio), 0x07);
        tio.parity = true;
        tio.parity_odd = true;
        assert_eq!(termios_to_lcr(&tio), 0x0F); // odd parity: no EPS bit
        tio.parity_odd = false;
        assert_eq!(termios_to_lcr(&tio), 0x1F);
    }

    #[test]
    fn classify_rx_and_line_errors() {
        let io = MockUart::new();
        // IIR code 2 (bits 2:1 = 10): received data available.
        let irq = classify_irq(io.as_ref(), COM1, 0b100).unwrap();
        assert_eq!(irq.event, UartEvent::Rx);
        assert_eq!(irq.data, 0);

        // IIR code 3 (bits 2:1 = 11): line status with framing error.
        io.with_port(COM3, |p| p.lsr_extra = Lsr::FRAMING.bits());
        let irq = classify_irq(io.as_ref(), COM3, 0b110).unwrap();
        assert_eq!(irq.event, UartEvent::Rx);
        assert_eq!(irq.data, InputFlags::FRAMING.bits());
        assert_eq!(irq.index, 2);
    }

    #[test]
    fn classify_modem_dcd_change() {
        let io = MockUart::new();
        io.with_port(COM2, |p| p.msr = (Msr::DCD_DELTA | Msr::DCD).bits());
        let irq = classify_irq(io.as_ref(), COM2, 0b000).unwrap();
        assert_eq!(irq.event, UartEvent::Dcd);
        assert_eq!(irq.data, 1);

        // Delta without DCD set reports a carrier loss.
        io.with_port(COM2, |p| p.msr = Msr::DCD_DELTA.bits());
        let irq = classify_irq(io.as_ref(), COM2, 0b000).unwrap();
        assert_eq!(irq.data, 0);

        // No delta: no event.
        io.with_port(COM2, |p| p.msr = 0);
        assert!(classify_irq(io.as_ref(), COM2, 0b000).is_none());
    }

    #[test]
    fn modem_query_and_set() {
        let io = MockUart::new();
        io.with_port(COM1, |p| p.msr = (Msr::CTS | Msr::DCD).bits());
        let bits = uart_hw_modem_query(io.as_ref(), COM1);
        assert_eq!(bits, ModemBits::CTS | ModemBits::DCD);

        uart_hw_modem_set(io.as_ref(), COM1, ModemLine::Dtr, true);
        assert_eq!(io.with_port(COM1, |p| p.mcr) & 0x01, 0x01);
        uart_hw_modem_set(io.as_ref(), COM1, ModemLine::Dtr, false);
        assert_eq!(io.with_port(COM1, |p| p.mcr) & 0x01, 0x00);
    }

    #[test]
    fn console_param_selection() {
        set_console_port_param("com1");
        assert_eq!(console_port(), COM1);
        set_console_port_param("bogus");
        assert_eq!(console_port(), COM4);
    }

    #[test]
    fn echo_roundtrip_through_device() {
        // Console on COM1, 115200-8N1, loopback at the wire level: bytes
        // written to the tty come back through the receive path.
        let io = MockUart::new();
        let dev = UartDevice::attach(io.clone(), COM1, Termios::default()).unwrap();

        // Write "PING\n" to the tty and pump the transmitter.
        assert_eq!(dev.tty().write(b"PING\n").unwrap(), 5);
        assert_eq!(dev.pump_output().unwrap(), 5);
        assert_eq!(io.tx_bytes(COM1), b"PING\n");

        // Wire the transmitted bytes back as received data and deliver
        // an RX interrupt through the demux path.
        io.push_rx(COM1, b"PING\n");
        dev.input_event(UartEvent::Rx, 0);

        let mut buf = [0u8; 16];
        let n = dev.tty().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING\n");
        assert_eq!(n, 5);
    }

    #[test]
    fn irq_demux_routes_to_channel() {
        let io = MockUart::new();
        let chan = uart_softirq_init();

        // COM1 pending (IIR bit0 clear, RX code), COM3 idle (bit0 set).
        io.set_iir(COM1, 0b100);
        io.set_iir(COM3, 0b001);
        io.push_rx(COM1, b"a");
        uart_irq_handler(io.as_ref(), 1);

        let irq = chan.recv_noblock().unwrap();
        assert_eq!(irq.port, COM1);
        assert_eq!(irq.event, UartEvent::Rx);
        assert_eq!(irq.index, 0);
    }
}
