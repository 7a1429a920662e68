//! HID class driver.
//!
//! Device bring-up fetches and parses the report descriptor, selects a
//! keyboard or mouse driver from the top-level collection's usage, sets
//! the idle rate to 0 (report only on change), and starts the input
//! loop: an 8-slot buffer ring keeps IN transfers outstanding, and each
//! completion is diffed/emitted by the class driver while the freed slot
//! is immediately resubmitted.

pub mod keyboard;
pub mod mouse;
pub mod report;
pub mod usage;

use alloc::boxed::Box;

use lepton_core::{Errno, KResult, kdebug, kerror, kinfo};
use lepton_mm::page::{DmaBuffer, PAGE_SIZE};

use crate::usb::{DESC_HID_REPORT, SetupPacket, UsbDeviceIo, UsbStatus};
use keyboard::HidKeyboard;
use mouse::HidMouse;
use report::{ReportFormat, parse_report_descriptor};

/// HID class request: GET_REPORT.
pub const HID_GET_REPORT: u8 = 0x01;
/// HID class request: GET_IDLE.
pub const HID_GET_IDLE: u8 = 0x02;
/// HID class request: SET_REPORT.
pub const HID_SET_REPORT: u8 = 0x09;
/// HID class request: SET_IDLE.
pub const HID_SET_IDLE: u8 = 0x0A;

/// Slots kept in flight on the interrupt IN endpoint.
pub const HID_RING_SLOTS: usize = 8;

/// The class descriptor that follows the interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidDescriptor {
    /// bcdHID version.
    pub hid_version: u16,
    /// Number of class descriptors.
    pub num_descriptors: u8,
    /// Type of the first class descriptor (report = 0x22).
    pub class_desc_type: u8,
    /// Length of the report descriptor.
    pub report_length: u16,
}

impl HidDescriptor {
    /// Parses the 9-byte HID descriptor.
    pub fn parse(bytes: &[u8]) -> KResult<HidDescriptor> {
        if bytes.len() < 9 || bytes[1] != crate::usb::DESC_HID {
            return Err(Errno::Inval);
        }
        Ok(HidDescriptor {
            hid_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            num_descriptors: bytes[5],
            class_desc_type: bytes[6],
            report_length: u16::from_le_bytes([bytes[7], bytes[8]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Transfer buffer ring
// ---------------------------------------------------------------------------

/// A ring of fixed-size DMA slots for outstanding IN transfers.
///
/// The allocator cursor hands out slots for submission; the read cursor
/// trails it, consuming completed reports in submission order.
pub struct HidBufferRing {
    buffer: DmaBuffer,
    slot_size: usize,
    slots: usize,
    alloc_index: usize,
    read_index: usize,
}

impl HidBufferRing {
    /// Creates a ring of [`HID_RING_SLOTS`] slots of `report_size`
    /// bytes each.
    pub fn new(report_size: usize) -> Option<HidBufferRing> {
        let slot_size = report_size.max(8);
        debug_assert!(slot_size * HID_RING_SLOTS <= PAGE_SIZE);
        let buffer = DmaBuffer::alloc(PAGE_SIZE)?;
        Some(HidBufferRing {
            buffer,
            slot_size,
            slots: HID_RING_SLOTS,
            alloc_index: 0,
            read_index: 0,
        })
    }

    /// Returns the physical address of the next submission slot and
    /// advances the cursor.
    pub fn alloc_phys(&mut self) -> u64 {
        let phys = self.buffer.phys() + (self.alloc_index * self.slot_size) as u64;
        self.alloc_index = (self.alloc_index + 1) % self.slots;
        phys
    }

    /// Returns the oldest completed slot's contents and advances the
    /// read cursor.
    pub fn read(&mut self) -> &[u8] {
        let start = self.read_index * self.slot_size;
        self.read_index = (self.read_index + 1) % self.slots;
        &self.buffer.as_slice()[start..start + self.slot_size]
    }

    /// Slot size in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

enum HidHandler {
    Keyboard(HidKeyboard),
    Mouse(HidMouse),
}

impl HidHandler {
    fn handle_input(&mut self, report: &[u8]) {
        match self {
            HidHandler::Keyboard(kb) => kb.handle_input(report),
            HidHandler::Mouse(m) => m.handle_input(report),
        }
    }
}

/// An initialized HID device.
pub struct HidDevice {
    /// The class descriptor.
    pub descriptor: HidDescriptor,
    /// Parsed report format.
    pub format: ReportFormat,
    /// Input-report size in bytes.
    pub report_size: usize,
    ring: HidBufferRing,
    handler: HidHandler,
}

/// Fetches the report descriptor over the control endpoint.
fn fetch_report_descriptor(io: &dyn UsbDeviceIo, desc: &HidDescriptor) -> KResult<Box<[u8]>> {
    let mut dma = DmaBuffer::alloc(desc.report_length as usize).ok_or(Errno::NoMem)?;
    let setup = SetupPacket::get_interface_descriptor(DESC_HID_REPORT, 0, desc.report_length);
    let event = io.control_transfer(setup, dma.phys(), desc.report_length)?;
    if event.status != UsbStatus::Success {
        kerror!("hid: failed to get report descriptor");
        return Err(Errno::Io);
    }
    Ok(dma.as_mut_slice().to_vec().into_boxed_slice())
}

/// Sets the device idle rate (0 = report only on change).
fn set_idle(io: &dyn UsbDeviceIo, duration: u8) -> KResult<()> {
    let setup =
        SetupPacket::class_interface(HID_SET_IDLE, (duration as u16) << 8, 0, 0, false);
    let event = io.control_transfer(setup, 0, 0)?;
    if event.status != UsbStatus::Success {
        kerror!("hid: failed to set idle rate");
        return Err(Errno::Io);
    }
    Ok(())
}

impl HidDevice {
    /// Initializes a HID device: reads and parses the report
    /// descriptor, selects the class driver, and programs idle.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` for devices that are neither keyboards nor mice.
    pub fn init(io: &dyn UsbDeviceIo, descriptor: HidDescriptor) -> KResult<HidDevice> {
        let raw = fetch_report_descriptor(io, &descriptor)?;
        let format = parse_report_descriptor(&raw)?;

        let top = format.top_collection().ok_or(Errno::Inval)?;
        let handler = if let Some(mouse) = HidMouse::new(&format) {
            kinfo!("hid: mouse");
            HidHandler::Mouse(mouse)
        } else if let Some(kb) = HidKeyboard::new(&format) {
            kinfo!("hid: keyboard");
            HidHandler::Keyboard(kb)
        } else {
            kinfo!(
                "hid: device not supported: {}",
                usage::usage_name(top.usage_page, top.usage)
            );
            return Err(Errno::NotSup);
        };

        // Report only on state change.
        set_idle(io, 0)?;

        let report_size = format.size;
        let ring = HidBufferRing::new(report_size).ok_or(Errno::NoMem)?;
        Ok(HidDevice {
            descriptor,
            format,
            report_size,
            ring,
            handler,
        })
    }

    /// Submits the initial set of IN transfers.
    pub fn prime_transfers(&mut self, io: &dyn UsbDeviceIo) -> KResult<()> {
        for _ in 0..HID_RING_SLOTS {
            let phys = self.ring.alloc_phys();
            io.submit_in_transfer(phys, self.report_size as u16)?;
        }
        Ok(())
    }

    /// Consumes one completed report: dispatches it to the class driver
    /// and resubmits the freed slot.
    pub fn consume_report(&mut self, io: &dyn UsbDeviceIo) -> KResult<()> {
        let report = {
            let bytes = self.ring.read();
            let mut copy = [0u8; 64];
            let n = bytes.len().min(64);
            copy[..n].copy_from_slice(&bytes[..n]);
            (copy, n)
        };
        let phys = self.ring.alloc_phys();
        io.submit_in_transfer(phys, self.report_size as u16)?;
        self.handler.handle_input(&report.0[..self.report_size.min(report.1)]);
        Ok(())
    }

    /// Input service loop: waits for completions and consumes every
    /// pending report. Returns when the endpoint channel closes.
    pub fn event_loop(&mut self, io: &dyn UsbDeviceIo) -> KResult<()> {
        kdebug!("hid: starting device event loop");
        self.prime_transfers(io)?;

        loop {
            if io.wait_in_event().is_err() {
                kdebug!("hid: event channel closed");
                return Ok(());
            }
            while io.poll_in_event().is_ok() {
                self.consume_report(io)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::EventType;
    use crate::input::tests::{CAPTURED, install_capture, lock_sink};
    use crate::usb::{UsbEvent, UsbEventType};
    use lepton_core::sync::SpinLock;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[test]
    fn hid_descriptor_parse() {
        // length, type 0x21, bcdHID 1.11, country, 1 descriptor,
        // report type 0x22, report length 52.
        let raw = [9, 0x21, 0x11, 0x01, 0, 1, 0x22, 52, 0];
        let desc = HidDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.hid_version, 0x0111);
        assert_eq!(desc.class_desc_type, 0x22);
        assert_eq!(desc.report_length, 52);
        assert!(HidDescriptor::parse(&raw[..5]).is_err());
    }

    #[test]
    fn buffer_ring_wraps() {
        let mut ring = HidBufferRing::new(3).unwrap();
        assert_eq!(ring.slot_size(), 8);
        let first = ring.alloc_phys();
        for _ in 0..HID_RING_SLOTS - 1 {
            ring.alloc_phys();
        }
        // Ninth allocation wraps to the first slot.
        assert_eq!(ring.alloc_phys(), first);
    }

    /// A scripted fake device: answers control transfers with a boot
    /// mouse report descriptor and feeds motion reports into submitted
    /// IN buffers.
    struct FakeMouseIo {
        state: SpinLock<FakeState>,
    }

    struct FakeState {
        submitted: VecDeque<u64>,
        pending_reports: VecDeque<[u8; 3]>,
        events: VecDeque<UsbEvent>,
        control_log: Vec<u8>,
    }

    impl FakeMouseIo {
        fn new() -> Self {
            FakeMouseIo {
                state: SpinLock::new(FakeState {
                    submitted: VecDeque::new(),
                    pending_reports: VecDeque::new(),
                    events: VecDeque::new(),
                    control_log: Vec::new(),
                }),
            }
        }

        /// Simulates device motion: writes the report into the oldest
        /// outstanding buffer and queues a completion event.
        fn motion(&self, buttons: u8, dx: i8, dy: i8) {
            let mut state = self.state.lock();
            let phys = state.submitted.pop_front().expect("no outstanding transfer");
            // Host tests run with identity phys translation.
            let ptr = phys as usize as *mut u8;
            let report = [buttons, dx as u8, dy as u8];
            unsafe {
                core::ptr::copy_nonoverlapping(report.as_ptr(), ptr, 3);
            }
            state.pending_reports.push_back(report);
            state.events.push_back(UsbEvent {
                event_type: UsbEventType::DataIn,
                status: UsbStatus::Success,
            });
        }
    }

    impl UsbDeviceIo for FakeMouseIo {
        fn control_transfer(
            &self,
            setup: SetupPacket,
            buf_phys: u64,
            len: u16,
        ) -> lepton_core::KResult<UsbEvent> {
            self.state.lock().control_log.push(setup.request);
            if setup.request == crate::usb::USB_GET_DESCRIPTOR && buf_phys != 0 {
                let desc = report::BOOT_MOUSE_DESCRIPTOR;
                let n = desc.len().min(len as usize);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        desc.as_ptr(),
                        buf_phys as usize as *mut u8,
                        n,
                    );
                }
            }
            Ok(UsbEvent {
                event_type: UsbEventType::Control,
                status: UsbStatus::Success,
            })
        }

        fn submit_in_transfer(&self, buf_phys: u64, _len: u16) -> lepton_core::KResult<()> {
            self.state.lock().submitted.push_back(buf_phys);
            Ok(())
        }

        fn wait_in_event(&self) -> lepton_core::KResult<UsbEvent> {
            self.state.lock().events.pop_front().ok_or(Errno::Nxio)
        }

        fn poll_in_event(&self) -> lepton_core::KResult<UsbEvent> {
            self.state
                .lock()
                .events
                .pop_front()
                .ok_or(Errno::Again)
        }
    }

    fn mouse_descriptor() -> HidDescriptor {
        HidDescriptor {
            hid_version: 0x0111,
            num_descriptors: 1,
            class_desc_type: 0x22,
            report_length: report::BOOT_MOUSE_DESCRIPTOR.len() as u16,
        }
    }

    #[test]
    fn init_selects_mouse_and_sets_idle() {
        let io = FakeMouseIo::new();
        let dev = HidDevice::init(&io, mouse_descriptor()).unwrap();
        assert_eq!(dev.report_size, 3);
        // GET_DESCRIPTOR then SET_IDLE.
        let log = io.state.lock().control_log.clone();
        assert_eq!(log, vec![crate::usb::USB_GET_DESCRIPTOR, HID_SET_IDLE]);
    }

    #[test]
    fn motion_reports_emit_pointer_deltas() {
        let _guard = lock_sink();
        install_capture();

        let io = FakeMouseIo::new();
        let mut dev = HidDevice::init(&io, mouse_descriptor()).unwrap();
        dev.prime_transfers(&io).unwrap();
        assert_eq!(io.state.lock().submitted.len(), HID_RING_SLOTS);

        // Two motion events from the "device".
        io.motion(0, 7, -2);
        io.motion(0b001, 1, 0);

        // Service them the way the event loop does.
        while io.poll_in_event().is_ok() {
            dev.consume_report(&io).unwrap();
        }

        let events = CAPTURED.lock().unwrap().clone();
        assert_eq!(events, vec![
            (EventType::Relative, crate::input::rel::REL_X, 7),
            (EventType::Relative, crate::input::rel::REL_Y, -2),
            (EventType::Relative, crate::input::rel::REL_X, 1),
            (EventType::Key, crate::input::btn::BTN_LEFT, 1),
        ]);

        // Every consumed report was replaced with a fresh transfer, so
        // the ring is fully primed again.
        assert_eq!(io.state.lock().submitted.len(), HID_RING_SLOTS);
    }
}
