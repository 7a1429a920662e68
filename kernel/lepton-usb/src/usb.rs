//! Core USB protocol types.
//!
//! Setup packets, the standard descriptors the enumeration path reads,
//! and the event/status types flowing between the host engine and class
//! drivers.

use lepton_core::{Errno, KResult};

/// Transfer/endpoint direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDir {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// USB endpoint transfer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEpType {
    /// Control endpoint.
    Control,
    /// Isochronous endpoint.
    Isochronous,
    /// Bulk endpoint.
    Bulk,
    /// Interrupt endpoint.
    Interrupt,
}

// Standard requests.
/// GET_DESCRIPTOR standard request.
pub const USB_GET_DESCRIPTOR: u8 = 0x06;
/// SET_CONFIGURATION standard request.
pub const USB_SET_CONFIGURATION: u8 = 0x09;

// Descriptor types.
/// Device descriptor type.
pub const DESC_DEVICE: u8 = 1;
/// Configuration descriptor type.
pub const DESC_CONFIG: u8 = 2;
/// Interface descriptor type.
pub const DESC_INTERFACE: u8 = 4;
/// Endpoint descriptor type.
pub const DESC_ENDPOINT: u8 = 5;
/// HID class descriptor type.
pub const DESC_HID: u8 = 0x21;
/// HID report descriptor type.
pub const DESC_HID_REPORT: u8 = 0x22;

// Class codes.
/// HID interface class.
pub const USB_CLASS_HID: u8 = 3;

/// An 8-byte control-transfer setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SetupPacket {
    /// bmRequestType.
    pub request_type: u8,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// wLength.
    pub length: u16,
}

impl SetupPacket {
    /// Builds a standard GET_DESCRIPTOR request.
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        SetupPacket {
            request_type: 0x80, // device-to-host, standard, device
            request: USB_GET_DESCRIPTOR,
            value: (desc_type as u16) << 8 | desc_index as u16,
            index: 0,
            length,
        }
    }

    /// Builds an interface-directed GET_DESCRIPTOR (report descriptors).
    pub const fn get_interface_descriptor(desc_type: u8, interface: u16, length: u16) -> Self {
        SetupPacket {
            request_type: 0x81, // device-to-host, standard, interface
            request: USB_GET_DESCRIPTOR,
            value: (desc_type as u16) << 8,
            index: interface,
            length,
        }
    }

    /// Builds a class-specific interface request (HID SET_IDLE etc.).
    pub const fn class_interface(request: u8, value: u16, index: u16, length: u16, to_host: bool) -> Self {
        SetupPacket {
            request_type: if to_host { 0xA1 } else { 0x21 },
            request,
            value,
            index,
            length,
        }
    }

    /// Returns `true` for device-to-host requests.
    pub const fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// The standard 18-byte device descriptor (parsed form; the wire
/// layout is decoded field by field).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// bLength (18).
    pub length: u8,
    /// bDescriptorType (1).
    pub desc_type: u8,
    /// bcdUSB.
    pub usb_version: u16,
    /// bDeviceClass.
    pub dev_class: u8,
    /// bDeviceSubClass.
    pub dev_subclass: u8,
    /// bDeviceProtocol.
    pub dev_protocol: u8,
    /// bMaxPacketSize0 (or its log2 for USB3).
    pub max_packet_size0: u8,
    /// idVendor.
    pub vendor_id: u16,
    /// idProduct.
    pub product_id: u16,
    /// bcdDevice.
    pub dev_version: u16,
    /// iManufacturer.
    pub manufacturer_idx: u8,
    /// iProduct.
    pub product_idx: u8,
    /// iSerialNumber.
    pub serial_idx: u8,
    /// bNumConfigurations.
    pub num_configs: u8,
}

impl DeviceDescriptor {
    /// Parses from raw bytes (at least `len` = 18, or the 8-byte
    /// prefix).
    pub fn parse(bytes: &[u8]) -> KResult<DeviceDescriptor> {
        if bytes.len() < 8 {
            return Err(Errno::Inval);
        }
        let mut desc = DeviceDescriptor {
            length: bytes[0],
            desc_type: bytes[1],
            usb_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            dev_class: bytes[4],
            dev_subclass: bytes[5],
            dev_protocol: bytes[6],
            max_packet_size0: bytes[7],
            ..Default::default()
        };
        if bytes.len() >= 18 {
            desc.vendor_id = u16::from_le_bytes([bytes[8], bytes[9]]);
            desc.product_id = u16::from_le_bytes([bytes[10], bytes[11]]);
            desc.dev_version = u16::from_le_bytes([bytes[12], bytes[13]]);
            desc.manufacturer_idx = bytes[14];
            desc.product_idx = bytes[15];
            desc.serial_idx = bytes[16];
            desc.num_configs = bytes[17];
        }
        Ok(desc)
    }
}

/// The 9-byte interface descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// bInterfaceNumber.
    pub number: u8,
    /// bNumEndpoints.
    pub num_endpoints: u8,
    /// bInterfaceClass.
    pub class: u8,
    /// bInterfaceSubClass.
    pub subclass: u8,
    /// bInterfaceProtocol.
    pub protocol: u8,
}

impl InterfaceDescriptor {
    /// Parses from a 9-byte descriptor body.
    pub fn parse(bytes: &[u8]) -> KResult<InterfaceDescriptor> {
        if bytes.len() < 9 || bytes[1] != DESC_INTERFACE {
            return Err(Errno::Inval);
        }
        Ok(InterfaceDescriptor {
            number: bytes[2],
            num_endpoints: bytes[4],
            class: bytes[5],
            subclass: bytes[6],
            protocol: bytes[7],
        })
    }
}

/// The 7-byte endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint number (1..15).
    pub number: u8,
    /// Direction.
    pub dir: UsbDir,
    /// Transfer type.
    pub ep_type: UsbEpType,
    /// wMaxPacketSize.
    pub max_packet_size: u16,
    /// bInterval.
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Parses from a 7-byte descriptor body.
    pub fn parse(bytes: &[u8]) -> KResult<EndpointDescriptor> {
        if bytes.len() < 7 || bytes[1] != DESC_ENDPOINT {
            return Err(Errno::Inval);
        }
        let addr = bytes[2];
        let ep_type = match bytes[3] & 0x3 {
            0 => UsbEpType::Control,
            1 => UsbEpType::Isochronous,
            2 => UsbEpType::Bulk,
            _ => UsbEpType::Interrupt,
        };
        Ok(EndpointDescriptor {
            number: addr & 0x0F,
            dir: if addr & 0x80 != 0 { UsbDir::In } else { UsbDir::Out },
            ep_type,
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            interval: bytes[6],
        })
    }
}

/// Outcome of a completed transfer as seen by class drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    /// Transfer completed (including short packets).
    Success,
    /// The controller reported a failure completion code.
    Error,
}

/// Event type delivered on an endpoint's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEventType {
    /// Control transfer completion.
    Control,
    /// IN data transfer completion.
    DataIn,
    /// OUT data transfer completion.
    DataOut,
}

/// A completed-transfer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbEvent {
    /// What completed.
    pub event_type: UsbEventType,
    /// How it went.
    pub status: UsbStatus,
}

bitflags::bitflags! {
    /// Caller-facing transfer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferFlags: u32 {
        /// More transfers follow: suppress the completion interrupt on
        /// this one.
        const PART = 1 << 0;
    }
}

/// Host-side transfer operations a class driver needs from the USB
/// core. Implemented by the xHCI device layer; mocked in driver tests.
pub trait UsbDeviceIo: Send + Sync {
    /// Runs a control transfer to completion. `buf_phys` of 0 means no
    /// data stage.
    fn control_transfer(&self, setup: SetupPacket, buf_phys: u64, len: u16) -> KResult<UsbEvent>;

    /// Queues an IN transfer on the device's interrupt IN endpoint and
    /// rings the doorbell.
    fn submit_in_transfer(&self, buf_phys: u64, len: u16) -> KResult<()>;

    /// Blocks until a completion event arrives on the interrupt IN
    /// endpoint. An error means the endpoint channel was closed.
    fn wait_in_event(&self) -> KResult<UsbEvent>;

    /// Non-blocking poll for the next completion event (`EAGAIN` when
    /// none is pending).
    fn poll_in_event(&self) -> KResult<UsbEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_parse_full() {
        // Typical full-speed HID mouse device descriptor.
        let raw: [u8; 18] = [
            18, 1, 0x00, 0x02, 0, 0, 0, 8, 0x27, 0x06, 0x01, 0xC0, 0x00, 0x01, 1, 2, 0, 1,
        ];
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.length, 18);
        assert_eq!(desc.desc_type, 1);
        assert_eq!(desc.dev_class, 0);
        assert_eq!(desc.max_packet_size0, 8);
        assert_eq!(desc.vendor_id, 0x0627);
        assert_eq!(desc.num_configs, 1);
    }

    #[test]
    fn device_descriptor_parse_prefix() {
        let raw: [u8; 8] = [18, 1, 0x00, 0x02, 0, 0, 0, 64];
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.max_packet_size0, 64);
        assert_eq!(desc.num_configs, 0);
        assert!(DeviceDescriptor::parse(&raw[..4]).is_err());
    }

    #[test]
    fn endpoint_descriptor_parse() {
        // Interrupt IN endpoint 1, max packet 8, interval 10.
        let raw = [7, DESC_ENDPOINT, 0x81, 0x03, 8, 0, 10];
        let ep = EndpointDescriptor::parse(&raw).unwrap();
        assert_eq!(ep.number, 1);
        assert_eq!(ep.dir, UsbDir::In);
        assert_eq!(ep.ep_type, UsbEpType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
    }

    #[test]
    fn setup_packet_builders() {
        let pkt = SetupPacket::get_descriptor(DESC_DEVICE, 0, 18);
        assert_eq!(pkt.request_type, 0x80);
        assert_eq!(pkt.value, 0x0100);
        assert_eq!(pkt.length, 18);
        assert!(pkt.is_device_to_host());

        let idle = SetupPacket::class_interface(0x0A, 0, 0, 0, false);
        assert_eq!(idle.request_type, 0x21);
        assert!(!idle.is_device_to_host());
    }
}
