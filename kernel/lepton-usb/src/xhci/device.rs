//! xHCI devices and endpoints.
//!
//! Attach flow per port: enable the port, ENABLE_SLOT for a slot id,
//! allocate input/device contexts and a control-endpoint transfer ring,
//! install the DCBAA entry, ADDRESS_DEVICE. FULL_SPEED devices get an
//! 8-byte device-descriptor prefetch to learn the control endpoint's
//! max packet size, an EVALUATE_CONTEXT, and then the full descriptor
//! read.
//!
//! Control transfers assemble SETUP/[DATA]/STATUS stages on the control
//! ring; bulk/interrupt transfers queue NORMAL TRBs. Producers ring the
//! slot doorbell with the endpoint index + 1 and block on the
//! endpoint's transfer channel for the completion event.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use lepton_core::sync::{ChanFlags, Channel, CondVar, SpinLock};
use lepton_core::{Errno, KResult, kdebug, kerror};
use lepton_mm::page::DmaBuffer;

use crate::usb::{
    DeviceDescriptor, SetupPacket, UsbDeviceIo, UsbDir, UsbEvent, UsbEventType, UsbStatus,
    XferFlags,
};

use super::context::{DeviceContext, InputContext, MAX_ENDPOINTS, XhciEpType, ep_ctx_index};
use super::controller::{Controller, Interrupter, Port};
use super::regs;
use super::ring::{EVT_RING_SIZE, TrbRing, XFER_RING_SIZE};
use super::trb::{
    SETUP_DATA_IN, SETUP_DATA_NONE, SETUP_DATA_OUT, TRB_TRANSFER_EVT, TransferEvent, Trb,
};

/// Base IRQ vector for per-device interrupters.
const DEVICE_IRQ_BASE: u32 = 0x48;

/// One device endpoint: context slot, transfer ring, and completion
/// channel.
pub struct Endpoint {
    /// Endpoint number (0 = default control).
    pub number: u8,
    /// xHCI endpoint type.
    pub ep_type: XhciEpType,
    /// Index into the endpoint-context array.
    pub index: usize,
    /// The transfer ring (producer side).
    pub xfer_ring: SpinLock<TrbRing>,
    /// Completion events routed from the device event loop.
    pub xfer_ch: Channel<Trb>,
}

impl Endpoint {
    fn new(number: u8, ep_type: XhciEpType) -> KResult<Arc<Endpoint>> {
        Ok(Arc::new(Endpoint {
            number,
            ep_type,
            index: ep_ctx_index(number, ep_type),
            xfer_ring: SpinLock::new(TrbRing::new(XFER_RING_SIZE).ok_or(Errno::NoMem)?),
            xfer_ch: Channel::new(EVT_RING_SIZE, ChanFlags::NOBLOCK, "xhci_endpoint_xfer_ch"),
        }))
    }

    /// Doorbell target for this endpoint.
    pub fn doorbell_target(&self) -> u32 {
        self.index as u32 + 1
    }

    /// Closes the transfer channel, failing any blocked waiter with an
    /// I/O error (endpoint teardown).
    pub fn close(&self) {
        self.xfer_ch.close();
    }
}

/// An addressed xHCI device.
pub struct XhciDevice {
    /// Slot id assigned by ENABLE_SLOT.
    pub slot_id: u8,
    /// The port the device hangs off.
    pub port: Arc<Port>,
    /// Input context for commands.
    pub ictx: InputContext,
    /// Controller-owned device context.
    pub dctx: DeviceContext,
    endpoints: SpinLock<Vec<Option<Arc<Endpoint>>>>,
    /// The device's dedicated interrupter.
    pub interrupter: Arc<Interrupter>,
    /// Signalled on device-level state changes.
    pub event: CondVar,
    controller: Arc<Controller>,
}

impl XhciDevice {
    /// Allocates device state for a slot: contexts, a per-device
    /// interrupter, and the default control endpoint.
    pub fn new(
        controller: &Arc<Controller>,
        port: Arc<Port>,
        slot_id: u8,
    ) -> KResult<Arc<XhciDevice>> {
        let intr_index = controller.intr_ids.alloc().ok_or(Errno::NoSpc)?;
        let interrupter = Interrupter::new(intr_index, DEVICE_IRQ_BASE + intr_index)?;

        let ictx = InputContext::new(controller.ctx64).ok_or(Errno::NoMem)?;
        let dctx = DeviceContext::new(controller.ctx64).ok_or(Errno::NoMem)?;

        let speed = port.speed.load(Ordering::Acquire);
        // Evaluate the slot context and endpoint 0.
        ictx.set_add_flags(0x3);
        ictx.setup_slot(port.number, 0, speed, 1);
        ictx.set_interrupter_target(interrupter.index);

        let device = Arc::new(XhciDevice {
            slot_id,
            port,
            ictx,
            dctx,
            endpoints: SpinLock::new({
                let mut v = Vec::new();
                v.resize_with(MAX_ENDPOINTS, || None);
                v
            }),
            interrupter,
            event: CondVar::new(),
            controller: controller.clone(),
        });

        // Default control endpoint with the speed-derived packet size.
        let ep0 = device.add_endpoint(0, XhciEpType::CtrlBi, regs::default_ep0_packet_size(speed))?;
        debug_assert_eq!(ep0.index, 0);

        // Publish the device context to the controller.
        controller.dcbaa.set(slot_id, device.dctx.phys());
        Ok(device)
    }

    /// Creates and installs an endpoint, programming its context.
    pub fn add_endpoint(
        &self,
        number: u8,
        ep_type: XhciEpType,
        max_packet_size: u16,
    ) -> KResult<Arc<Endpoint>> {
        let ep = Endpoint::new(number, ep_type)?;
        {
            let ring = ep.xfer_ring.lock();
            self.ictx.setup_endpoint(
                ep.index,
                ep_type,
                max_packet_size,
                ring.base_phys(),
                ring.cycle(),
            )?;
        }
        let mut endpoints = self.endpoints.lock();
        if endpoints[ep.index].is_some() {
            return Err(Errno::Exist);
        }
        endpoints[ep.index] = Some(ep.clone());
        Ok(ep)
    }

    /// Returns the endpoint at context index `index`.
    pub fn endpoint(&self, index: usize) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(index).cloned().flatten()
    }

    /// Returns the first non-control endpoint in the given direction.
    pub fn find_endpoint(&self, dir: UsbDir) -> Option<Arc<Endpoint>> {
        let want_in = dir == UsbDir::In;
        self.endpoints
            .lock()
            .iter()
            .flatten()
            .find(|ep| ep.number != 0 && ep.ep_type.is_in() == want_in)
            .cloned()
    }

    /// Addresses the device: enables its interrupter and runs
    /// ADDRESS_DEVICE with the prepared input context.
    pub fn setup(&self) -> KResult<()> {
        self.controller.enable_interrupter(&self.interrupter)?;
        self.controller
            .run_address_device_cmd(self.slot_id, self.ictx.phys())
    }

    /// Adds endpoint `ep` to the device's context via EVALUATE_CONTEXT.
    pub fn evaluate_endpoint(&self, ep: &Endpoint) -> KResult<()> {
        self.ictx.set_drop_flags(0);
        self.ictx.set_add_flags(1);
        self.ictx.add_endpoint_flag(ep.index);
        self.controller
            .run_evaluate_ctx_cmd(self.slot_id, self.ictx.phys())
    }

    /// Configures endpoints via CONFIGURE_ENDPOINT.
    pub fn configure_endpoints(&self) -> KResult<()> {
        self.controller
            .run_configure_ep_cmd(self.slot_id, self.ictx.phys())
    }

    // -- transfer construction -----------------------------------------

    /// Queues a SETUP stage TRB on the control ring.
    pub fn queue_setup(&self, setup: SetupPacket, transfer_type: u32) -> KResult<()> {
        if !matches!(
            transfer_type,
            SETUP_DATA_NONE | SETUP_DATA_OUT | SETUP_DATA_IN
        ) {
            kerror!("xhci: invalid setup data type {transfer_type}");
            return Err(Errno::Inval);
        }
        let ep0 = self.endpoint(0).ok_or(Errno::Nxio)?;
        ep0.xfer_ring.lock().enqueue(Trb::setup_stage(
            setup,
            transfer_type,
            self.interrupter.index,
        ));
        Ok(())
    }

    /// Queues a DATA stage TRB on the control ring.
    pub fn queue_data(&self, buffer: u64, length: u16, dir: UsbDir) -> KResult<()> {
        let ep0 = self.endpoint(0).ok_or(Errno::Nxio)?;
        ep0.xfer_ring.lock().enqueue(Trb::data_stage(
            buffer,
            length,
            dir == UsbDir::In,
            self.interrupter.index,
            true,
        ));
        Ok(())
    }

    /// Queues a STATUS stage TRB on the control ring.
    pub fn queue_status(&self, dir: UsbDir, ioc: bool) -> KResult<()> {
        let ep0 = self.endpoint(0).ok_or(Errno::Nxio)?;
        ep0.xfer_ring.lock().enqueue(Trb::status_stage(
            dir == UsbDir::In,
            self.interrupter.index,
            ioc,
        ));
        Ok(())
    }

    /// Queues a NORMAL TRB on a data endpoint. [`XferFlags::PART`]
    /// suppresses the completion interrupt for all but the final TRB of
    /// a multi-TRB transfer.
    pub fn queue_transfer(
        &self,
        ep: &Endpoint,
        buffer: u64,
        length: u16,
        flags: XferFlags,
    ) -> KResult<()> {
        let ioc = !flags.contains(XferFlags::PART);
        ep.xfer_ring.lock().enqueue(Trb::normal(
            buffer,
            length,
            self.interrupter.index,
            ioc,
        ));
        Ok(())
    }

    /// Rings the slot doorbell for an endpoint, starting queued work.
    pub fn start_transfer(&self, ep: &Endpoint) {
        self.controller
            .ring_doorbell(self.slot_id as usize, ep.doorbell_target());
    }

    /// Blocks for the next completion on an endpoint. Returns the
    /// decoded event.
    pub fn await_transfer(&self, ep: &Endpoint) -> KResult<TransferEvent> {
        let trb = ep.xfer_ch.recv().map_err(|e| {
            kerror!("xhci: failed to await transfer [{e}]");
            Errno::Io
        })?;
        trb.as_transfer_event().ok_or(Errno::Io)
    }

    /// Runs a complete control transfer: SETUP, optional DATA, STATUS,
    /// doorbell, and completion wait.
    pub fn control_transfer(
        &self,
        setup: SetupPacket,
        buffer: u64,
        length: u16,
    ) -> KResult<TransferEvent> {
        if buffer == 0 {
            self.queue_setup(setup, SETUP_DATA_NONE)?;
            self.queue_status(UsbDir::Out, true)?;
        } else {
            let is_in = setup.is_device_to_host();
            let trt = if is_in { SETUP_DATA_IN } else { SETUP_DATA_OUT };
            let dir = if is_in { UsbDir::In } else { UsbDir::Out };
            self.queue_setup(setup, trt)?;
            self.queue_data(buffer, length, dir)?;
            self.queue_status(UsbDir::Out, false)?;
        }

        let ep0 = self.endpoint(0).ok_or(Errno::Nxio)?;
        self.start_transfer(&ep0);
        self.await_transfer(&ep0)
    }

    // -- enumeration ----------------------------------------------------

    /// Reads the device descriptor. FULL_SPEED devices get the 8-byte
    /// prefetch + EVALUATE_CONTEXT dance to fix up the control
    /// endpoint's max packet size first.
    pub fn read_device_descriptor(&self) -> KResult<DeviceDescriptor> {
        if self.port.speed.load(Ordering::Acquire) == regs::XHCI_FULL_SPEED {
            let mut prefix = DmaBuffer::alloc(8).ok_or(Errno::NoMem)?;
            let setup = SetupPacket::get_descriptor(crate::usb::DESC_DEVICE, 0, 8);
            let event = self.control_transfer(setup, prefix.phys(), 8)?;
            if !event.is_success() {
                kerror!("xhci: failed to read descriptor prefix");
                return Err(Errno::Io);
            }
            let partial = DeviceDescriptor::parse(prefix.as_mut_slice())?;

            // Fix up ep0's max packet size and re-evaluate the context.
            self.ictx.set_add_flags(self.ictx.add_flags() | 1);
            self.ictx
                .set_ep_max_packet_size(0, partial.max_packet_size0 as u16);
            self.controller
                .run_evaluate_ctx_cmd(self.slot_id, self.ictx.phys())?;
        }

        let mut full = DmaBuffer::alloc(18).ok_or(Errno::NoMem)?;
        let setup = SetupPacket::get_descriptor(crate::usb::DESC_DEVICE, 0, 18);
        let event = self.control_transfer(setup, full.phys(), 18)?;
        if !event.is_success() {
            kerror!("xhci: failed to read device descriptor");
            return Err(Errno::Io);
        }
        DeviceDescriptor::parse(full.as_mut_slice())
    }

    // -- event handling -------------------------------------------------

    /// Drains the device's event ring once: transfer events are routed
    /// to their endpoint's channel and ERDP is advanced with EH_BUSY.
    /// A full endpoint channel halts the controller (fatal).
    pub fn drain_device_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let trb = self.interrupter.ring.lock().dequeue();
            let Some(trb) = trb else { break };
            handled += 1;

            if trb.trb_type() != TRB_TRANSFER_EVT {
                kdebug!("xhci: device event of type {} ignored", trb.trb_type());
                continue;
            }
            let Some(event) = trb.as_transfer_event() else {
                continue;
            };
            let ep_index = event.endpoint_id.saturating_sub(1) as usize;
            let Some(ep) = self.endpoint(ep_index) else {
                kerror!("xhci: event for unknown endpoint {}", event.endpoint_id);
                continue;
            };
            if ep.xfer_ch.send(trb).is_err() {
                let _ = self.controller.halt();
                panic!("xhci: endpoint event channel full, controller halted");
            }
        }

        let n = self.interrupter.index as usize;
        let new_erdp = self.interrupter.ring.lock().device_ptr();
        let erdp = (new_erdp & regs::A64_MASK) | regs::ERDP_EH_BUSY;
        self.controller.rt_write64(regs::xhci_intr_erdp(n), erdp);
        handled
    }

    /// Device event loop body, run on a dedicated kernel thread.
    pub fn event_loop(&self) -> ! {
        kdebug!("xhci: starting device event loop (slot {})", self.slot_id);
        loop {
            self.interrupter.wait_events();
            self.drain_device_events();
        }
    }

    /// Tears down the device's endpoints, closing their channels so
    /// blocked callers fail with an I/O error.
    pub fn teardown(&self) {
        for ep in self.endpoints.lock().iter().flatten() {
            ep.close();
        }
        self.controller.dcbaa.set(self.slot_id, 0);
    }
}

/// Per-device handle implementing the class-driver transfer interface
/// over one interrupt IN endpoint.
pub struct DeviceIoHandle {
    /// The device.
    pub device: Arc<XhciDevice>,
    /// The interrupt IN endpoint used for class input.
    pub in_ep: Arc<Endpoint>,
}

impl UsbDeviceIo for DeviceIoHandle {
    fn control_transfer(&self, setup: SetupPacket, buf_phys: u64, len: u16) -> KResult<UsbEvent> {
        let event = self.device.control_transfer(setup, buf_phys, len)?;
        Ok(UsbEvent {
            event_type: UsbEventType::Control,
            status: if event.is_success() {
                UsbStatus::Success
            } else {
                UsbStatus::Error
            },
        })
    }

    fn submit_in_transfer(&self, buf_phys: u64, len: u16) -> KResult<()> {
        self.device
            .queue_transfer(&self.in_ep, buf_phys, len, XferFlags::empty())?;
        self.device.start_transfer(&self.in_ep);
        Ok(())
    }

    fn wait_in_event(&self) -> KResult<UsbEvent> {
        let event = self.device.await_transfer(&self.in_ep)?;
        Ok(UsbEvent {
            event_type: UsbEventType::DataIn,
            status: if event.is_success() {
                UsbStatus::Success
            } else {
                UsbStatus::Error
            },
        })
    }

    fn poll_in_event(&self) -> KResult<UsbEvent> {
        match self.in_ep.xfer_ch.recv_noblock() {
            Ok(trb) => {
                let event = trb.as_transfer_event().ok_or(Errno::Io)?;
                Ok(UsbEvent {
                    event_type: UsbEventType::DataIn,
                    status: if event.is_success() {
                        UsbStatus::Success
                    } else {
                        UsbStatus::Error
                    },
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Full attach flow for a connected port: enable the port, allocate a
/// slot, build the device, address it, and read its descriptor.
pub fn enumerate_port(
    controller: &Arc<Controller>,
    port: &Arc<Port>,
) -> KResult<(Arc<XhciDevice>, DeviceDescriptor)> {
    controller.enable_port(port)?;

    let slot_id = controller.run_enable_slot_cmd(port.protocol.slot_type)?;
    kdebug!("xhci: port {} assigned slot {slot_id}", port.number);

    let device = XhciDevice::new(controller, port.clone(), slot_id)?;
    device.setup()?;
    let descriptor = device.read_device_descriptor()?;
    Ok((device, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhci::controller::tests::fake_controller;
    use crate::xhci::trb::{
        CC_SUCCESS, TRB_DATA_STAGE, TRB_NORMAL, TRB_SETUP_STAGE, TRB_STATUS_STAGE,
    };

    fn fake_device() -> (Arc<Controller>, Arc<XhciDevice>, Box<[u8]>) {
        let (hc, mem) = fake_controller();
        let port = hc.port(1).unwrap();
        port.speed
            .store(regs::XHCI_FULL_SPEED, Ordering::Release);
        let device = XhciDevice::new(&hc, port, 1).unwrap();
        (hc, device, mem)
    }

    #[test]
    fn device_installs_dcbaa_entry() {
        let (hc, device, _mem) = fake_device();
        assert_eq!(hc.dcbaa.get(1), device.dctx.phys());
        // ep0 exists at context index 0 with FULL_SPEED packet size.
        assert!(device.endpoint(0).is_some());
        assert_eq!(device.ictx.ep_max_packet_size(0), 8);
        assert_eq!(device.ictx.slot_root_hub_port(), 1);
    }

    #[test]
    fn control_transfer_assembles_three_stages() {
        let (_hc, device, _mem) = fake_device();
        let setup = SetupPacket::get_descriptor(crate::usb::DESC_DEVICE, 0, 18);

        device.queue_setup(setup, SETUP_DATA_IN).unwrap();
        device.queue_data(0x9000, 18, UsbDir::In).unwrap();
        device.queue_status(UsbDir::Out, false).unwrap();

        let ep0 = device.endpoint(0).unwrap();
        let ring = ep0.xfer_ring.lock();
        assert_eq!(ring.read_trb(0).trb_type(), TRB_SETUP_STAGE);
        assert_eq!(ring.read_trb(1).trb_type(), TRB_DATA_STAGE);
        assert_eq!(ring.read_trb(2).trb_type(), TRB_STATUS_STAGE);
        // Data stage IOC set, status stage IOC clear.
        assert!(ring.read_trb(1).dw[3] & (1 << 5) != 0);
        assert!(ring.read_trb(2).dw[3] & (1 << 5) == 0);
    }

    #[test]
    fn part_flag_suppresses_ioc() {
        let (_hc, device, _mem) = fake_device();
        let ep = device
            .add_endpoint(1, XhciEpType::IntrIn, 8)
            .unwrap();
        assert_eq!(ep.index, 2);
        assert_eq!(ep.doorbell_target(), 3);

        device
            .queue_transfer(&ep, 0x8000, 8, XferFlags::PART)
            .unwrap();
        device
            .queue_transfer(&ep, 0x8008, 8, XferFlags::empty())
            .unwrap();

        let ring = ep.xfer_ring.lock();
        assert_eq!(ring.read_trb(0).trb_type(), TRB_NORMAL);
        assert!(ring.read_trb(0).dw[3] & (1 << 5) == 0);
        assert!(ring.read_trb(1).dw[3] & (1 << 5) != 0);
    }

    #[test]
    fn await_transfer_decodes_event() {
        let (_hc, device, _mem) = fake_device();
        let ep0 = device.endpoint(0).unwrap();
        ep0.xfer_ch
            .send(Trb::transfer_event(CC_SUCCESS, 0, 1, 1))
            .unwrap();
        let event = device.await_transfer(&ep0).unwrap();
        assert!(event.is_success());
    }

    #[test]
    fn device_event_routing() {
        let (_hc, device, _mem) = fake_device();
        let ep = device.add_endpoint(1, XhciEpType::IntrIn, 8).unwrap();

        // Controller posts a transfer event for endpoint id = index+1.
        {
            let mut hw = crate::xhci::ring::tests::HwProducer::new();
            let mut ring = device.interrupter.ring.lock();
            hw.post(
                &mut ring,
                Trb::transfer_event(CC_SUCCESS, 0, ep.index as u32 + 1, device.slot_id),
            );
        }

        assert_eq!(device.drain_device_events(), 1);
        assert_eq!(ep.xfer_ch.len(), 1);
    }

    #[test]
    fn teardown_closes_channels() {
        let (_hc, device, _mem) = fake_device();
        let ep0 = device.endpoint(0).unwrap();
        device.teardown();
        assert_eq!(ep0.xfer_ch.recv_noblock().unwrap_err(), Errno::Nxio);
    }

    #[test]
    fn invalid_setup_type_rejected() {
        let (_hc, device, _mem) = fake_device();
        let setup = SetupPacket::get_descriptor(crate::usb::DESC_DEVICE, 0, 18);
        assert_eq!(device.queue_setup(setup, 0).unwrap_err(), Errno::Inval);
    }
}
