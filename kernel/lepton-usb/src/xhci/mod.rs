//! xHCI host-controller engine.
//!
//! Ring-based command/event/transfer DMA plumbing, slot and endpoint
//! state, and interrupter multiplexing per the xHCI 1.2 register model.

pub mod context;
pub mod controller;
pub mod device;
pub mod regs;
pub mod ring;
pub mod trb;

pub use context::{DeviceContext, InputContext, MAX_ENDPOINTS, XhciEpType, ep_ctx_index};
pub use controller::{
    Controller, Interrupter, Port, Protocol, set_msi_fns, set_port_notify_fn,
};
pub use device::{DeviceIoHandle, Endpoint, XhciDevice, enumerate_port};
pub use regs::MmioSpace;
pub use ring::{CMD_RING_SIZE, EVT_RING_SIZE, TrbRing, XFER_RING_SIZE};
pub use trb::Trb;
