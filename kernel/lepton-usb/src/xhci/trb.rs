//! Transfer Request Blocks.
//!
//! A TRB is 16 bytes: two parameter dwords, a status dword, and a
//! control dword carrying the cycle bit (bit 0) and the TRB type
//! (bits 15:10). Constructors build command/transfer TRBs; parsers
//! decode the event TRBs the controller posts.

use crate::usb::SetupPacket;

// TRB types.
/// Normal transfer TRB.
pub const TRB_NORMAL: u32 = 1;
/// Setup stage TRB.
pub const TRB_SETUP_STAGE: u32 = 2;
/// Data stage TRB.
pub const TRB_DATA_STAGE: u32 = 3;
/// Status stage TRB.
pub const TRB_STATUS_STAGE: u32 = 4;
/// Link TRB.
pub const TRB_LINK: u32 = 6;
/// Enable slot command.
pub const TRB_ENABLE_SLOT_CMD: u32 = 9;
/// Disable slot command.
pub const TRB_DISABLE_SLOT_CMD: u32 = 10;
/// Address device command.
pub const TRB_ADDRESS_DEVICE_CMD: u32 = 11;
/// Configure endpoint command.
pub const TRB_CONFIGURE_EP_CMD: u32 = 12;
/// Evaluate context command.
pub const TRB_EVALUATE_CTX_CMD: u32 = 13;
/// No-op command.
pub const TRB_NOOP_CMD: u32 = 23;
/// Transfer event.
pub const TRB_TRANSFER_EVT: u32 = 32;
/// Command completion event.
pub const TRB_CMD_COMPLETION_EVT: u32 = 33;
/// Port status change event.
pub const TRB_PORT_STATUS_EVT: u32 = 34;

// Completion codes.
/// Success.
pub const CC_SUCCESS: u32 = 1;
/// TRB error.
pub const CC_TRB_ERROR: u32 = 5;
/// Short packet.
pub const CC_SHORT_PACKET: u32 = 13;

// Setup-stage transfer types (TRT field).
/// No data stage.
pub const SETUP_DATA_NONE: u32 = 1;
/// OUT data stage.
pub const SETUP_DATA_OUT: u32 = 2;
/// IN data stage.
pub const SETUP_DATA_IN: u32 = 3;

/// A 16-byte Transfer Request Block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Trb {
    /// The four raw dwords.
    pub dw: [u32; 4],
}

impl Trb {
    /// An all-zero TRB.
    pub const fn zeroed() -> Trb {
        Trb { dw: [0; 4] }
    }

    /// TRB type (control dword bits 15:10).
    #[inline]
    pub fn trb_type(&self) -> u32 {
        (self.dw[3] >> 10) & 0x3F
    }

    #[inline]
    fn set_trb_type(&mut self, t: u32) {
        self.dw[3] = (self.dw[3] & !(0x3F << 10)) | ((t & 0x3F) << 10);
    }

    /// Cycle bit.
    #[inline]
    pub fn cycle(&self) -> bool {
        self.dw[3] & 1 != 0
    }

    /// Sets the cycle bit.
    #[inline]
    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.dw[3] |= 1;
        } else {
            self.dw[3] &= !1;
        }
    }

    /// 64-bit parameter (dwords 0..1).
    #[inline]
    pub fn parameter(&self) -> u64 {
        (self.dw[1] as u64) << 32 | self.dw[0] as u64
    }

    #[inline]
    fn set_parameter(&mut self, v: u64) {
        self.dw[0] = v as u32;
        self.dw[1] = (v >> 32) as u32;
    }

    // -- transfer TRBs --------------------------------------------------

    /// Builds a Normal TRB for bulk/interrupt data.
    pub fn normal(buf: u64, length: u16, intr_target: u32, ioc: bool) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(buf);
        trb.dw[2] = length as u32 | (intr_target & 0x3FF) << 22;
        trb.set_trb_type(TRB_NORMAL);
        if ioc {
            trb.dw[3] |= 1 << 5;
        }
        trb
    }

    /// Builds a Setup Stage TRB. The 8 setup bytes travel immediate
    /// (IDT set); `trt` is one of the `SETUP_DATA_*` values.
    pub fn setup_stage(setup: SetupPacket, trt: u32, intr_target: u32) -> Trb {
        let mut trb = Trb::zeroed();
        trb.dw[0] = setup.request_type as u32
            | (setup.request as u32) << 8
            | (setup.value as u32) << 16;
        trb.dw[1] = setup.index as u32 | (setup.length as u32) << 16;
        trb.dw[2] = 8 | (intr_target & 0x3FF) << 22;
        trb.set_trb_type(TRB_SETUP_STAGE);
        trb.dw[3] |= 1 << 6; // IDT: immediate data
        trb.dw[3] |= (trt & 0x3) << 16;
        trb
    }

    /// Builds a Data Stage TRB.
    pub fn data_stage(buf: u64, length: u16, dir_in: bool, intr_target: u32, ioc: bool) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(buf);
        trb.dw[2] = length as u32 | (intr_target & 0x3FF) << 22;
        trb.set_trb_type(TRB_DATA_STAGE);
        if dir_in {
            trb.dw[3] |= 1 << 16;
        }
        if ioc {
            trb.dw[3] |= 1 << 5;
        }
        trb
    }

    /// Builds a Status Stage TRB.
    pub fn status_stage(dir_in: bool, intr_target: u32, ioc: bool) -> Trb {
        let mut trb = Trb::zeroed();
        trb.dw[2] = (intr_target & 0x3FF) << 22;
        trb.set_trb_type(TRB_STATUS_STAGE);
        if dir_in {
            trb.dw[3] |= 1 << 16;
        }
        if ioc {
            trb.dw[3] |= 1 << 5;
        }
        trb
    }

    /// Builds a Link TRB pointing back at `ring_base`, toggling the
    /// cycle.
    pub fn link(ring_base: u64) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(ring_base);
        trb.set_trb_type(TRB_LINK);
        trb.dw[3] |= 1 << 1; // toggle cycle
        trb
    }

    /// Returns `true` if this is a Link TRB with the toggle-cycle bit.
    pub fn is_link_toggle(&self) -> bool {
        self.trb_type() == TRB_LINK && self.dw[3] & (1 << 1) != 0
    }

    // -- command TRBs ---------------------------------------------------

    /// No Op command.
    pub fn noop_cmd() -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_trb_type(TRB_NOOP_CMD);
        trb
    }

    /// Enable Slot command.
    pub fn enable_slot_cmd(slot_type: u32) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_trb_type(TRB_ENABLE_SLOT_CMD);
        trb.dw[3] |= (slot_type & 0x1F) << 16;
        trb
    }

    /// Address Device command.
    pub fn address_device_cmd(input_ctx: u64, slot_id: u8) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(input_ctx);
        trb.set_trb_type(TRB_ADDRESS_DEVICE_CMD);
        trb.dw[3] |= (slot_id as u32) << 24;
        trb
    }

    /// Configure Endpoint command.
    pub fn configure_ep_cmd(input_ctx: u64, slot_id: u8) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(input_ctx);
        trb.set_trb_type(TRB_CONFIGURE_EP_CMD);
        trb.dw[3] |= (slot_id as u32) << 24;
        trb
    }

    /// Evaluate Context command.
    pub fn evaluate_ctx_cmd(input_ctx: u64, slot_id: u8) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(input_ctx);
        trb.set_trb_type(TRB_EVALUATE_CTX_CMD);
        trb.dw[3] |= (slot_id as u32) << 24;
        trb
    }

    // -- event TRB parsing ---------------------------------------------

    /// Decodes a Transfer Event.
    pub fn as_transfer_event(&self) -> Option<TransferEvent> {
        if self.trb_type() != TRB_TRANSFER_EVT {
            return None;
        }
        Some(TransferEvent {
            trb_ptr: self.parameter(),
            remaining: self.dw[2] & 0xFF_FFFF,
            completion_code: self.dw[2] >> 24,
            endpoint_id: (self.dw[3] >> 16) & 0x1F,
            slot_id: (self.dw[3] >> 24) as u8,
        })
    }

    /// Decodes a Command Completion Event.
    pub fn as_command_completion(&self) -> Option<CommandCompletion> {
        if self.trb_type() != TRB_CMD_COMPLETION_EVT {
            return None;
        }
        Some(CommandCompletion {
            cmd_trb_ptr: self.parameter(),
            completion_code: self.dw[2] >> 24,
            slot_id: (self.dw[3] >> 24) as u8,
        })
    }

    /// Decodes a Port Status Change Event.
    pub fn as_port_status(&self) -> Option<PortStatusChange> {
        if self.trb_type() != TRB_PORT_STATUS_EVT {
            return None;
        }
        Some(PortStatusChange {
            port_id: (self.dw[0] >> 24) as u8,
        })
    }

    /// Builds a Transfer Event (host tests simulate the controller).
    pub fn transfer_event(
        completion_code: u32,
        remaining: u32,
        endpoint_id: u32,
        slot_id: u8,
    ) -> Trb {
        let mut trb = Trb::zeroed();
        trb.dw[2] = (remaining & 0xFF_FFFF) | completion_code << 24;
        trb.set_trb_type(TRB_TRANSFER_EVT);
        trb.dw[3] |= (endpoint_id & 0x1F) << 16;
        trb.dw[3] |= (slot_id as u32) << 24;
        trb
    }

    /// Builds a Command Completion Event.
    pub fn command_completion_event(completion_code: u32, slot_id: u8, cmd_ptr: u64) -> Trb {
        let mut trb = Trb::zeroed();
        trb.set_parameter(cmd_ptr);
        trb.dw[2] = completion_code << 24;
        trb.set_trb_type(TRB_CMD_COMPLETION_EVT);
        trb.dw[3] |= (slot_id as u32) << 24;
        trb
    }

    /// Builds a Port Status Change Event.
    pub fn port_status_event(port_id: u8) -> Trb {
        let mut trb = Trb::zeroed();
        trb.dw[0] = (port_id as u32) << 24;
        trb.dw[2] = CC_SUCCESS << 24;
        trb.set_trb_type(TRB_PORT_STATUS_EVT);
        trb
    }
}

/// Decoded Transfer Event fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// Physical address of the completed transfer TRB.
    pub trb_ptr: u64,
    /// Bytes not transferred.
    pub remaining: u32,
    /// Completion code.
    pub completion_code: u32,
    /// Endpoint context index + 1.
    pub endpoint_id: u32,
    /// Device slot.
    pub slot_id: u8,
}

impl TransferEvent {
    /// Returns `true` for codes the USB stack treats as success.
    pub fn is_success(&self) -> bool {
        self.completion_code == CC_SUCCESS || self.completion_code == CC_SHORT_PACKET
    }
}

/// Decoded Command Completion Event fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompletion {
    /// Physical address of the completed command TRB.
    pub cmd_trb_ptr: u64,
    /// Completion code.
    pub completion_code: u32,
    /// Slot id (Enable Slot results).
    pub slot_id: u8,
}

impl CommandCompletion {
    /// Returns `true` on success.
    pub fn is_success(&self) -> bool {
        self.completion_code == CC_SUCCESS
    }
}

/// Decoded Port Status Change fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatusChange {
    /// 1-based port number.
    pub port_id: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_cycle_encoding() {
        let mut trb = Trb::noop_cmd();
        assert_eq!(trb.trb_type(), TRB_NOOP_CMD);
        assert!(!trb.cycle());
        trb.set_cycle(true);
        assert!(trb.cycle());
        assert_eq!(trb.trb_type(), TRB_NOOP_CMD);
        trb.set_cycle(false);
        assert!(!trb.cycle());
    }

    #[test]
    fn setup_stage_is_immediate() {
        let setup = SetupPacket::get_descriptor(crate::usb::DESC_DEVICE, 0, 18);
        let trb = Trb::setup_stage(setup, SETUP_DATA_IN, 2);
        assert_eq!(trb.trb_type(), TRB_SETUP_STAGE);
        // IDT bit.
        assert!(trb.dw[3] & (1 << 6) != 0);
        // TRT = IN.
        assert_eq!((trb.dw[3] >> 16) & 0x3, SETUP_DATA_IN);
        // 8 immediate bytes, interrupter target 2.
        assert_eq!(trb.dw[2] & 0x1FFFF, 8);
        assert_eq!(trb.dw[2] >> 22, 2);
        // Packet fields round-trip.
        assert_eq!(trb.dw[0] & 0xFF, 0x80);
        assert_eq!((trb.dw[0] >> 16) as u16, 0x0100);
        assert_eq!((trb.dw[1] >> 16) as u16, 18);
    }

    #[test]
    fn data_and_status_direction_bits() {
        let data = Trb::data_stage(0x1000, 64, true, 0, true);
        assert!(data.dw[3] & (1 << 16) != 0);
        assert!(data.dw[3] & (1 << 5) != 0);
        assert_eq!(data.parameter(), 0x1000);

        let status = Trb::status_stage(false, 0, false);
        assert_eq!(status.trb_type(), TRB_STATUS_STAGE);
        assert!(status.dw[3] & (1 << 16) == 0);
        assert!(status.dw[3] & (1 << 5) == 0);
    }

    #[test]
    fn link_toggles_cycle() {
        let link = Trb::link(0xA000);
        assert!(link.is_link_toggle());
        assert_eq!(link.parameter(), 0xA000);
    }

    #[test]
    fn event_parsers_roundtrip() {
        let ev = Trb::transfer_event(CC_SHORT_PACKET, 4, 3, 7);
        let parsed = ev.as_transfer_event().unwrap();
        assert_eq!(parsed.completion_code, CC_SHORT_PACKET);
        assert_eq!(parsed.remaining, 4);
        assert_eq!(parsed.endpoint_id, 3);
        assert_eq!(parsed.slot_id, 7);
        assert!(parsed.is_success());
        assert!(ev.as_command_completion().is_none());

        let cc = Trb::command_completion_event(CC_SUCCESS, 5, 0x2000);
        let parsed = cc.as_command_completion().unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.slot_id, 5);
        assert_eq!(parsed.cmd_trb_ptr, 0x2000);

        let ps = Trb::port_status_event(2);
        assert_eq!(ps.as_port_status().unwrap().port_id, 2);
    }

    #[test]
    fn error_codes_are_not_success() {
        let ev = Trb::transfer_event(CC_TRB_ERROR, 0, 1, 1);
        assert!(!ev.as_transfer_event().unwrap().is_success());
    }
}
