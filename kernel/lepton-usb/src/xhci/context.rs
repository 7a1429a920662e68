//! Device, input, and endpoint contexts.
//!
//! Contexts live in their own DMA pages and are read by the controller.
//! The layout supports both 32- and 64-byte context sizes
//! (`HCCPARAMS1.CSZ`). Endpoint contexts inside the software arrays are
//! indexed the xHCI way: control = 0, OUT endpoint N = 2N−1, IN
//! endpoint N = 2N.

use lepton_core::KResult;
use lepton_mm::page::{DmaBuffer, PAGE_SIZE};

use crate::usb::{UsbDir, UsbEpType};

/// Endpoint slots per device (beyond the slot context).
pub const MAX_ENDPOINTS: usize = 31;

/// xHCI endpoint context types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum XhciEpType {
    /// Isochronous OUT.
    IsochOut = 1,
    /// Bulk OUT.
    BulkOut = 2,
    /// Interrupt OUT.
    IntrOut = 3,
    /// Bidirectional control.
    CtrlBi = 4,
    /// Isochronous IN.
    IsochIn = 5,
    /// Bulk IN.
    BulkIn = 6,
    /// Interrupt IN.
    IntrIn = 7,
}

impl XhciEpType {
    /// Maps a USB endpoint type + direction to the xHCI encoding.
    pub fn from_usb(ep_type: UsbEpType, dir: UsbDir) -> XhciEpType {
        match (ep_type, dir) {
            (UsbEpType::Control, _) => XhciEpType::CtrlBi,
            (UsbEpType::Isochronous, UsbDir::In) => XhciEpType::IsochIn,
            (UsbEpType::Isochronous, UsbDir::Out) => XhciEpType::IsochOut,
            (UsbEpType::Bulk, UsbDir::In) => XhciEpType::BulkIn,
            (UsbEpType::Bulk, UsbDir::Out) => XhciEpType::BulkOut,
            (UsbEpType::Interrupt, UsbDir::In) => XhciEpType::IntrIn,
            (UsbEpType::Interrupt, UsbDir::Out) => XhciEpType::IntrOut,
        }
    }

    /// Returns `true` for IN-direction types.
    pub fn is_in(self) -> bool {
        matches!(self, XhciEpType::IsochIn | XhciEpType::BulkIn | XhciEpType::IntrIn)
    }
}

/// Endpoint-array index for an endpoint number and type: control = 0,
/// OUT = 2N−1, IN = 2N.
pub fn ep_ctx_index(ep_number: u8, ep_type: XhciEpType) -> usize {
    match ep_type {
        XhciEpType::CtrlBi => 0,
        XhciEpType::IsochOut | XhciEpType::BulkOut | XhciEpType::IntrOut => {
            (ep_number as usize) * 2 - 1
        }
        XhciEpType::IsochIn | XhciEpType::BulkIn | XhciEpType::IntrIn => (ep_number as usize) * 2,
    }
}

// ---------------------------------------------------------------------------
// Raw context access
// ---------------------------------------------------------------------------

struct CtxArea {
    buf: DmaBuffer,
    ctx_size: usize,
}

impl CtxArea {
    fn new(use_64byte: bool) -> Option<CtxArea> {
        Some(CtxArea {
            buf: DmaBuffer::alloc(PAGE_SIZE)?,
            ctx_size: if use_64byte { 64 } else { 32 },
        })
    }

    #[inline]
    fn read(&self, ctx: usize, dword: usize) -> u32 {
        let offset = ctx * self.ctx_size + dword * 4;
        debug_assert!(offset + 4 <= self.buf.len());
        // SAFETY: bounds-checked read inside the owned DMA page.
        unsafe {
            core::ptr::read_volatile((self.buf.addr() + offset) as *const u32)
        }
    }

    #[inline]
    fn write(&self, ctx: usize, dword: usize, value: u32) {
        let offset = ctx * self.ctx_size + dword * 4;
        debug_assert!(offset + 4 <= self.buf.len());
        // SAFETY: bounds-checked write inside the owned DMA page.
        unsafe {
            core::ptr::write_volatile((self.buf.addr() + offset) as *mut u32, value);
        }
    }

    fn update(&self, ctx: usize, dword: usize, mask: u32, value: u32) {
        let old = self.read(ctx, dword);
        self.write(ctx, dword, (old & !mask) | (value & mask));
    }
}

// ---------------------------------------------------------------------------
// Input context
// ---------------------------------------------------------------------------

/// The input context: control context at slot 0, slot context at 1,
/// endpoint contexts from 2.
pub struct InputContext {
    area: CtxArea,
}

impl InputContext {
    /// Allocates a zeroed input context.
    pub fn new(use_64byte: bool) -> Option<InputContext> {
        Some(InputContext {
            area: CtxArea::new(use_64byte)?,
        })
    }

    /// Physical address for ADDRESS_DEVICE / EVALUATE_CONTEXT commands.
    pub fn phys(&self) -> u64 {
        self.area.buf.phys()
    }

    /// Drop-flags dword.
    pub fn drop_flags(&self) -> u32 {
        self.area.read(0, 0)
    }

    /// Add-flags dword: bit 0 = evaluate slot context, bit i+1 = add
    /// endpoint context i.
    pub fn add_flags(&self) -> u32 {
        self.area.read(0, 1)
    }

    /// Replaces the drop flags.
    pub fn set_drop_flags(&self, flags: u32) {
        self.area.write(0, 0, flags);
    }

    /// Replaces the add flags.
    pub fn set_add_flags(&self, flags: u32) {
        self.area.write(0, 1, flags);
    }

    /// Sets add-flag bit `i + 1` for endpoint context `i`.
    pub fn add_endpoint_flag(&self, ep_index: usize) {
        self.set_add_flags(self.add_flags() | 1 << (ep_index + 1));
    }

    // -- slot context (context 1) --------------------------------------

    /// Programs the slot context route/speed/entries fields.
    pub fn setup_slot(&self, root_hub_port: u8, route_string: u32, speed: u32, ctx_entries: u32) {
        self.area
            .write(1, 0, (route_string & 0xF_FFFF) | (speed & 0xF) << 20 | (ctx_entries & 0x1F) << 27);
        self.area.update(1, 1, 0xFF << 16, (root_hub_port as u32) << 16);
    }

    /// Sets the slot's interrupter target.
    pub fn set_interrupter_target(&self, target: u32) {
        self.area.update(1, 2, 0x3FF << 22, (target & 0x3FF) << 22);
    }

    /// Reads back the slot speed field.
    pub fn slot_speed(&self) -> u32 {
        (self.area.read(1, 0) >> 20) & 0xF
    }

    /// Reads back the slot context-entries field.
    pub fn slot_ctx_entries(&self) -> u32 {
        (self.area.read(1, 0) >> 27) & 0x1F
    }

    /// Reads back the root hub port.
    pub fn slot_root_hub_port(&self) -> u8 {
        ((self.area.read(1, 1) >> 16) & 0xFF) as u8
    }

    // -- endpoint contexts (context i + 2) -----------------------------

    /// Programs endpoint context `index` with type, max packet size, and
    /// transfer ring dequeue pointer (DCS = producer cycle).
    pub fn setup_endpoint(
        &self,
        index: usize,
        ep_type: XhciEpType,
        max_packet_size: u16,
        tr_dequeue: u64,
        dcs: bool,
    ) -> KResult<()> {
        let ctx = index + 2;
        // EP type bits 5:3, CErr 2:1 = 3, max packet 31:16.
        self.area.write(
            ctx,
            1,
            (3 << 1) | (ep_type as u32) << 3 | (max_packet_size as u32) << 16,
        );
        let ptr = tr_dequeue | u64::from(dcs);
        self.area.write(ctx, 2, ptr as u32);
        self.area.write(ctx, 3, (ptr >> 32) as u32);
        // Average TRB length.
        self.area.write(ctx, 4, 8);
        Ok(())
    }

    /// Updates only the max-packet-size of endpoint context `index`
    /// (FULL_SPEED descriptor prefetch path).
    pub fn set_ep_max_packet_size(&self, index: usize, max_packet_size: u16) {
        self.area
            .update(index + 2, 1, 0xFFFF_u32 << 16, (max_packet_size as u32) << 16);
    }

    /// Reads back an endpoint's max packet size.
    pub fn ep_max_packet_size(&self, index: usize) -> u16 {
        (self.area.read(index + 2, 1) >> 16) as u16
    }

    /// Reads back an endpoint's type field.
    pub fn ep_type(&self, index: usize) -> u32 {
        (self.area.read(index + 2, 1) >> 3) & 0x7
    }
}

// ---------------------------------------------------------------------------
// Device context
// ---------------------------------------------------------------------------

/// The controller-owned device context: slot context at 0, endpoint
/// contexts from 1.
pub struct DeviceContext {
    area: CtxArea,
}

impl DeviceContext {
    /// Allocates a zeroed device context.
    pub fn new(use_64byte: bool) -> Option<DeviceContext> {
        Some(DeviceContext {
            area: CtxArea::new(use_64byte)?,
        })
    }

    /// Physical address installed into the DCBAA.
    pub fn phys(&self) -> u64 {
        self.area.buf.phys()
    }

    /// Slot state as maintained by the controller (slot context dword 3
    /// bits 31:27).
    pub fn slot_state(&self) -> u32 {
        self.area.read(0, 3) >> 27
    }

    /// Device address assigned by the controller.
    pub fn device_address(&self) -> u8 {
        (self.area.read(0, 3) & 0xFF) as u8
    }
}

// ---------------------------------------------------------------------------
// DCBAA
// ---------------------------------------------------------------------------

/// The device context base address array, indexed by slot id.
pub struct Dcbaa {
    buf: DmaBuffer,
    slots: usize,
}

impl Dcbaa {
    /// Allocates an array for `max_slots` slots (entry 0 is the
    /// scratchpad pointer and stays 0 here).
    pub fn new(max_slots: usize) -> Option<Dcbaa> {
        let buf = DmaBuffer::alloc((max_slots + 1) * 8)?;
        Some(Dcbaa {
            buf,
            slots: max_slots,
        })
    }

    /// Physical address programmed into DCBAAP.
    pub fn phys(&self) -> u64 {
        self.buf.phys()
    }

    /// Installs a device context pointer for `slot_id`.
    pub fn set(&self, slot_id: u8, ctx_phys: u64) {
        assert!(slot_id as usize <= self.slots, "slot id out of range");
        // SAFETY: bounds-asserted write inside the owned array.
        unsafe {
            core::ptr::write_volatile(
                (self.buf.addr() as *mut u64).add(slot_id as usize),
                ctx_phys,
            );
        }
    }

    /// Reads the entry for `slot_id`.
    pub fn get(&self, slot_id: u8) -> u64 {
        assert!(slot_id as usize <= self.slots, "slot id out of range");
        // SAFETY: bounds-asserted read inside the owned array.
        unsafe { core::ptr::read_volatile((self.buf.addr() as *const u64).add(slot_id as usize)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ep_index_mapping() {
        assert_eq!(ep_ctx_index(0, XhciEpType::CtrlBi), 0);
        assert_eq!(ep_ctx_index(1, XhciEpType::BulkOut), 1);
        assert_eq!(ep_ctx_index(1, XhciEpType::BulkIn), 2);
        assert_eq!(ep_ctx_index(2, XhciEpType::IntrOut), 3);
        assert_eq!(ep_ctx_index(2, XhciEpType::IntrIn), 4);
        assert_eq!(ep_ctx_index(15, XhciEpType::IsochIn), 30);
    }

    #[test]
    fn usb_to_xhci_type_mapping() {
        assert_eq!(
            XhciEpType::from_usb(UsbEpType::Control, UsbDir::Out),
            XhciEpType::CtrlBi
        );
        assert_eq!(
            XhciEpType::from_usb(UsbEpType::Interrupt, UsbDir::In),
            XhciEpType::IntrIn
        );
        assert!(XhciEpType::IntrIn.is_in());
        assert!(!XhciEpType::BulkOut.is_in());
    }

    #[test]
    fn add_flags_encoding() {
        let ictx = InputContext::new(false).unwrap();
        ictx.set_add_flags(0x1); // evaluate slot context
        ictx.add_endpoint_flag(0); // add endpoint context 0
        assert_eq!(ictx.add_flags(), 0b11);
        ictx.add_endpoint_flag(3);
        assert_eq!(ictx.add_flags(), 0b1_0011);
        assert_eq!(ictx.drop_flags(), 0);
    }

    #[test]
    fn slot_context_fields_roundtrip() {
        let ictx = InputContext::new(false).unwrap();
        ictx.setup_slot(3, 0, 4, 1);
        ictx.set_interrupter_target(5);
        assert_eq!(ictx.slot_root_hub_port(), 3);
        assert_eq!(ictx.slot_speed(), 4);
        assert_eq!(ictx.slot_ctx_entries(), 1);
    }

    #[test]
    fn endpoint_context_fields() {
        let ictx = InputContext::new(false).unwrap();
        ictx.setup_endpoint(0, XhciEpType::CtrlBi, 8, 0x1000, true).unwrap();
        assert_eq!(ictx.ep_type(0), XhciEpType::CtrlBi as u32);
        assert_eq!(ictx.ep_max_packet_size(0), 8);

        ictx.set_ep_max_packet_size(0, 64);
        assert_eq!(ictx.ep_max_packet_size(0), 64);
        // Type bits survive the max-packet update.
        assert_eq!(ictx.ep_type(0), XhciEpType::CtrlBi as u32);
    }

    #[test]
    fn contexts_64byte_layout() {
        let ictx = InputContext::new(true).unwrap();
        ictx.setup_endpoint(2, XhciEpType::IntrIn, 16, 0x2000, true).unwrap();
        assert_eq!(ictx.ep_max_packet_size(2), 16);
        // Neighbors are untouched.
        assert_eq!(ictx.ep_max_packet_size(1), 0);
        assert_eq!(ictx.ep_max_packet_size(3), 0);
    }

    #[test]
    fn dcbaa_entries() {
        let dcbaa = Dcbaa::new(8).unwrap();
        dcbaa.set(3, 0xAB_C000);
        assert_eq!(dcbaa.get(3), 0xAB_C000);
        assert_eq!(dcbaa.get(1), 0);
    }

    #[test]
    #[should_panic(expected = "slot id out of range")]
    fn dcbaa_bounds() {
        let dcbaa = Dcbaa::new(4).unwrap();
        dcbaa.set(5, 1);
    }
}
