//! Terminal subsystem: tty objects and the 16550 UART driver.
//!
//! The UART top half demultiplexes the two shared IRQ lines, classifies
//! each port's interrupt-identification register, and posts event
//! records onto a bounded channel drained by a softirq thread. Received
//! characters feed the tty input discipline; transmission is pumped by a
//! per-port thread draining the tty output queue.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod tty;
pub mod uart;

pub use tty::{InputFlags, Termios, Tty, TtyFlags, WordLength};
pub use uart::{
    COM1, COM2, COM3, COM4, ModemBits, ModemLine, PortIo, UartDevice, UartEvent, UartIo,
    UartIrq, console_port, set_console_port_param, uart_hw_configure, uart_hw_init_probe,
    uart_hw_modem_query, uart_hw_modem_set, uart_irq_handler, uart_set_irq_handler,
    uart_softirq_init, uart_softirq_loop, uart_unset_irq_handler,
};
