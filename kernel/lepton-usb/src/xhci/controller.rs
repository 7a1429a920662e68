//! xHCI controller: bring-up, interrupters, commands, event demux.
//!
//! Bring-up order: reset, program max slots, publish the DCBAA,
//! publish the command ring (RCS=1), enable the root interrupter, set
//! RUN|INT_EN|HSE_EN, wait for NOT_READY to clear, then run a NOOP
//! command as a smoke test.
//!
//! The event loop semaphore-waits on the root interrupter, drains its
//! ring, and routes TRBs: transfer events to the transfer channel,
//! command completions to the command channel, port-status events to
//! the port channel (updating the cached port speed and invoking the
//! attach-notify hook). A full event channel is a fatal invariant
//! violation: the controller is halted before panicking.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use lepton_core::cpu::cpu_pause;
use lepton_core::id::IdSet;
use lepton_core::sync::{ChanFlags, Channel, SpinLock};
use lepton_core::{Errno, KResult, kdebug, kerror, kinfo};
use lepton_mm::page::DmaBuffer;

use super::regs::{self, MmioSpace};
use super::ring::{CMD_RING_SIZE, ERST_SIZE, EVT_RING_SIZE, TrbRing};
use super::trb::{CommandCompletion, Trb};

/// Bounded spin iterations for register-polling waits.
const SPIN_WAIT_LIMIT: u32 = 1_000_000;

// ---------------------------------------------------------------------------
// Supplied-primitive hooks (MSI routing, attach notification)
// ---------------------------------------------------------------------------

/// Enables an MSI vector for interrupter `index`.
pub type MsiEnableFn = fn(vector: u32, index: u32) -> i32;
/// Disables an MSI vector.
pub type MsiDisableFn = fn(vector: u32, index: u32) -> i32;

fn default_msi_enable(_vector: u32, _index: u32) -> i32 {
    0
}

fn default_msi_disable(_vector: u32, _index: u32) -> i32 {
    0
}

static MSI_ENABLE_FN: AtomicPtr<()> = AtomicPtr::new(default_msi_enable as *mut ());
static MSI_DISABLE_FN: AtomicPtr<()> = AtomicPtr::new(default_msi_disable as *mut ());

/// Installs the platform MSI routing hooks.
///
/// # Safety
///
/// Both functions must be callable from thread context with the
/// controller lock held.
pub unsafe fn set_msi_fns(enable: MsiEnableFn, disable: MsiDisableFn) {
    MSI_ENABLE_FN.store(enable as *mut (), Ordering::Release);
    MSI_DISABLE_FN.store(disable as *mut (), Ordering::Release);
}

fn msi_enable(vector: u32, index: u32) -> i32 {
    let ptr = MSI_ENABLE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `MsiEnableFn` pointers are ever stored.
    let f: MsiEnableFn = unsafe { core::mem::transmute(ptr) };
    f(vector, index)
}

fn msi_disable(vector: u32, index: u32) -> i32 {
    let ptr = MSI_DISABLE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `MsiDisableFn` pointers are ever stored.
    let f: MsiDisableFn = unsafe { core::mem::transmute(ptr) };
    f(vector, index)
}

/// Attach-notification hook invoked from the port-status path.
pub type PortNotifyFn = fn(port: u8, connected: bool);

fn default_port_notify(_port: u8, _connected: bool) {}

static PORT_NOTIFY_FN: AtomicPtr<()> = AtomicPtr::new(default_port_notify as *mut ());

/// Installs the USB-stack attach/detach notification hook.
///
/// # Safety
///
/// The hook runs on the controller event thread and must not re-enter
/// the event loop.
pub unsafe fn set_port_notify_fn(f: PortNotifyFn) {
    PORT_NOTIFY_FN.store(f as *mut (), Ordering::Release);
}

fn port_notify(port: u8, connected: bool) {
    let ptr = PORT_NOTIFY_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `PortNotifyFn` pointers are ever stored.
    let f: PortNotifyFn = unsafe { core::mem::transmute(ptr) };
    f(port, connected)
}

// ---------------------------------------------------------------------------
// Interrupters, protocols, ports
// ---------------------------------------------------------------------------

/// An xHCI interrupter: event ring, segment table, IRQ vector, and the
/// semaphore its ISR signals.
pub struct Interrupter {
    /// Interrupter index (0 = root).
    pub index: u32,
    /// Platform IRQ vector.
    pub vector: u32,
    erst: DmaBuffer,
    /// The event ring (consumer side).
    pub ring: SpinLock<TrbRing>,
    /// Signalled from the ISR when events are pending.
    pub events: lepton_core::sync::Semaphore,
}

impl Interrupter {
    pub(crate) fn new(index: u32, vector: u32) -> KResult<Arc<Interrupter>> {
        let ring = TrbRing::new(EVT_RING_SIZE).ok_or(Errno::NoMem)?;
        let erst = DmaBuffer::alloc(ERST_SIZE * 16).ok_or(Errno::NoMem)?;

        // Single-segment ERST entry: {base, size, reserved}.
        // SAFETY: writes inside the owned ERST buffer.
        unsafe {
            let p = erst.addr() as *mut u64;
            p.write_volatile(ring.base_phys());
            (erst.addr() as *mut u32)
                .add(2)
                .write_volatile(ring.capacity() as u32);
        }

        Ok(Arc::new(Interrupter {
            index,
            vector,
            erst,
            ring: SpinLock::new(ring),
            events: lepton_core::sync::Semaphore::new(0),
        }))
    }

    /// Physical address of the event ring segment table.
    pub fn erst_phys(&self) -> u64 {
        self.erst.phys()
    }

    /// Signals the interrupter's event semaphore (ISR bottom half).
    pub fn signal(&self) {
        self.events.up();
    }

    /// Blocks until the ISR signals events.
    pub fn wait_events(&self) {
        self.events.down();
    }
}

/// A supported-protocol extended capability (one USB revision's ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    /// Major revision (2 or 3).
    pub rev_major: u8,
    /// Minor revision (BCD).
    pub rev_minor: u8,
    /// First port (1-based).
    pub port_offset: u8,
    /// Number of ports.
    pub port_count: u8,
    /// Slot type for ENABLE_SLOT commands.
    pub slot_type: u8,
}

impl Protocol {
    /// Returns `true` for USB 3.x ports.
    pub fn is_usb3(&self) -> bool {
        self.rev_major == 3
    }
}

/// A root-hub port.
pub struct Port {
    /// 1-based port number.
    pub number: u8,
    /// The protocol the port belongs to.
    pub protocol: Protocol,
    /// Last observed speed field.
    pub speed: AtomicU32,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// An xHCI host controller instance.
pub struct Controller {
    mmio: MmioSpace,
    /// Operational register base offset.
    pub op_base: usize,
    /// Runtime register base offset.
    pub rt_base: usize,
    /// Doorbell array base offset.
    pub db_base: usize,
    /// Extended capabilities base offset.
    pub xcap_base: usize,
    /// 64-byte context support.
    pub ctx64: bool,
    /// Max device slots.
    pub max_slots: u32,

    /// Device context base address array.
    pub dcbaa: super::context::Dcbaa,
    cmd_ring: SpinLock<TrbRing>,
    /// The root interrupter (#0): host events.
    pub interrupter: Arc<Interrupter>,
    /// Supported protocols.
    pub protocols: Vec<Protocol>,
    /// Root-hub ports.
    pub ports: Vec<Arc<Port>>,
    /// Interrupter index allocator.
    pub intr_ids: IdSet,

    /// Command-completion events.
    pub cmd_compl_ch: Channel<Trb>,
    /// Transfer events routed through the root interrupter.
    pub xfer_evt_ch: Channel<Trb>,
    /// Port status-change events.
    pub port_sts_ch: Channel<Trb>,

    /// Driver process id hosting the event threads (0 until spawned).
    pub pid: AtomicU32,
}

impl Controller {
    /// Builds a controller over a mapped register window, discovering
    /// bases, protocols, and ports.
    pub fn new(mmio: MmioSpace) -> KResult<Arc<Controller>> {
        let cap_length = regs::cap_length(mmio.read32(regs::XHCI_CAP_LENGTH));
        let hcsparams1 = mmio.read32(regs::XHCI_CAP_HCSPARAMS1);
        let hccparams1 = mmio.read32(regs::XHCI_CAP_HCCPARAMS1);

        let op_base = cap_length;
        let rt_base = regs::rtsoff_offset(mmio.read32(regs::XHCI_CAP_RTSOFF));
        let db_base = regs::dboff_offset(mmio.read32(regs::XHCI_CAP_DBOFF));
        let xcap_base = regs::hccparams1_xecp(hccparams1);

        let max_slots = regs::cap_max_slots(hcsparams1);
        let max_intrs = regs::cap_max_intrs(hcsparams1).max(1);

        let intr_ids = IdSet::new(max_intrs);
        assert!(intr_ids.reserve(0), "root interrupter id");
        let interrupter = Interrupter::new(0, 0)?;

        let protocols = discover_protocols(&mmio, xcap_base);
        let mut ports = Vec::new();
        for protocol in &protocols {
            for n in protocol.port_offset..protocol.port_offset + protocol.port_count {
                ports.push(Arc::new(Port {
                    number: n,
                    protocol: *protocol,
                    speed: AtomicU32::new(0),
                }));
            }
        }

        let controller = Arc::new(Controller {
            mmio,
            op_base,
            rt_base,
            db_base,
            xcap_base,
            ctx64: regs::hccparams1_csz(hccparams1),
            max_slots,
            dcbaa: super::context::Dcbaa::new(max_slots as usize).ok_or(Errno::NoMem)?,
            cmd_ring: SpinLock::new(TrbRing::new(CMD_RING_SIZE).ok_or(Errno::NoMem)?),
            interrupter,
            protocols,
            ports,
            intr_ids,
            cmd_compl_ch: Channel::new(EVT_RING_SIZE, ChanFlags::NOBLOCK, "xhci_cmd_compl_ch"),
            xfer_evt_ch: Channel::new(EVT_RING_SIZE, ChanFlags::NOBLOCK, "xhci_xfer_evt_ch"),
            port_sts_ch: Channel::new(EVT_RING_SIZE, ChanFlags::NOBLOCK, "xhci_port_sts_ch"),
            pid: AtomicU32::new(0),
        });
        kinfo!(
            "xhci: controller: {} slots, {} ports, {} protocols",
            controller.max_slots,
            controller.ports.len(),
            controller.protocols.len()
        );
        Ok(controller)
    }

    // -- register helpers ----------------------------------------------

    /// Reads an operational register.
    pub fn op_read32(&self, offset: usize) -> u32 {
        self.mmio.read32(self.op_base + offset)
    }

    /// Writes an operational register.
    pub fn op_write32(&self, offset: usize, value: u32) {
        self.mmio.write32(self.op_base + offset, value)
    }

    fn op_write64(&self, offset: usize, value: u64) {
        self.mmio.write64(self.op_base + offset, value)
    }

    fn op_read64(&self, offset: usize) -> u64 {
        self.mmio.read64(self.op_base + offset)
    }

    fn rt_read32(&self, offset: usize) -> u32 {
        self.mmio.read32(self.rt_base + offset)
    }

    fn rt_write32(&self, offset: usize, value: u32) {
        self.mmio.write32(self.rt_base + offset, value)
    }

    pub(crate) fn rt_read64(&self, offset: usize) -> u64 {
        self.mmio.read64(self.rt_base + offset)
    }

    pub(crate) fn rt_write64(&self, offset: usize, value: u64) {
        self.mmio.write64(self.rt_base + offset, value)
    }

    /// Rings a doorbell: 0 for the host controller, otherwise a slot id
    /// with the endpoint target.
    pub fn ring_doorbell(&self, slot: usize, target: u32) {
        self.mmio.write32(self.db_base + regs::xhci_db(slot), target);
    }

    fn wait_ready(&self) -> KResult<()> {
        for _ in 0..SPIN_WAIT_LIMIT {
            if self.op_read32(regs::XHCI_OP_USBSTS) & regs::USBSTS_NOT_READY == 0 {
                return Ok(());
            }
            cpu_pause();
        }
        kerror!("xhci: timed out waiting for controller ready");
        Err(Errno::TimedOut)
    }

    // -- bring-up -------------------------------------------------------

    /// Resets the controller and waits for it to become ready.
    pub fn reset(&self) -> KResult<()> {
        kdebug!("xhci: resetting controller");
        let mut usbcmd = self.op_read32(regs::XHCI_OP_USBCMD);
        usbcmd &= !regs::USBCMD_RUN;
        usbcmd |= regs::USBCMD_HC_RESET;
        self.op_write32(regs::XHCI_OP_USBCMD, usbcmd);
        self.wait_ready()
    }

    /// Programs max slots, the DCBAA pointer, and the command ring.
    pub fn setup(&self) -> KResult<()> {
        self.op_write32(regs::XHCI_OP_CONFIG, self.max_slots & 0xFF);
        self.op_write64(regs::XHCI_OP_DCBAAP, self.dcbaa.phys() & regs::A64_MASK);

        let cmd_ring = self.cmd_ring.lock();
        let mut crcr = cmd_ring.device_ptr() & regs::A64_MASK;
        if cmd_ring.cycle() {
            crcr |= regs::CRCR_RCS;
        }
        self.op_write64(regs::XHCI_OP_CRCR, crcr);
        Ok(())
    }

    /// Enables an interrupter: MSI routing, moderation, ERST, ERDP, and
    /// IMAN.IE.
    pub fn enable_interrupter(&self, intr: &Interrupter) -> KResult<()> {
        let n = intr.index as usize;
        if msi_enable(intr.vector, intr.index) < 0 {
            kerror!("xhci: failed to enable msi interrupt");
            return Err(Errno::Io);
        }

        let ring = intr.ring.lock();
        self.rt_write32(regs::xhci_intr_imod(n), 4000);
        self.rt_write32(regs::xhci_intr_erstsz(n), ERST_SIZE as u32);
        self.rt_write64(regs::xhci_intr_erstba(n), intr.erst.phys() & regs::A64_MASK);
        self.rt_write64(regs::xhci_intr_erdp(n), ring.device_ptr());
        drop(ring);

        let iman = self.rt_read32(regs::xhci_intr_iman(n));
        self.rt_write32(regs::xhci_intr_iman(n), iman | regs::IMAN_IE);
        Ok(())
    }

    /// Disables an interrupter.
    pub fn disable_interrupter(&self, intr: &Interrupter) -> KResult<()> {
        let n = intr.index as usize;
        if msi_disable(intr.vector, intr.index) < 0 {
            kerror!("xhci: failed to disable msi interrupt");
            return Err(Errno::Io);
        }
        let iman = self.rt_read32(regs::xhci_intr_iman(n));
        self.rt_write32(regs::xhci_intr_iman(n), iman & !regs::IMAN_IE);
        Ok(())
    }

    /// Starts the controller and smoke-tests the command ring with a
    /// NOOP command.
    pub fn run(&self) -> KResult<()> {
        self.enable_interrupter(&self.interrupter)?;

        let usbcmd = self.op_read32(regs::XHCI_OP_USBCMD)
            | regs::USBCMD_RUN
            | regs::USBCMD_INT_EN
            | regs::USBCMD_HSE_EN;
        self.op_write32(regs::XHCI_OP_USBCMD, usbcmd);
        self.wait_ready()?;

        if self.run_noop_cmd().is_err() {
            kerror!("xhci: failed to execute no-op command");
            return Err(Errno::Io);
        }
        Ok(())
    }

    /// Halts the controller: disables the root interrupter, aborts the
    /// command ring, clears RUN/INT_EN/HSE_EN, and waits for the halt.
    pub fn halt(&self) -> KResult<()> {
        if self.disable_interrupter(&self.interrupter).is_err() {
            kerror!("xhci: failed to disable root interrupter");
        }

        // Abort the command ring.
        let crcr = self.op_read64(regs::XHCI_OP_CRCR) | regs::CRCR_CA;
        self.op_write64(regs::XHCI_OP_CRCR, crcr);
        for _ in 0..SPIN_WAIT_LIMIT {
            if self.op_read64(regs::XHCI_OP_CRCR) & regs::CRCR_CRR == 0 {
                break;
            }
            cpu_pause();
        }

        let mut usbcmd = self.op_read32(regs::XHCI_OP_USBCMD);
        usbcmd &= !(regs::USBCMD_RUN | regs::USBCMD_INT_EN | regs::USBCMD_HSE_EN);
        self.op_write32(regs::XHCI_OP_USBCMD, usbcmd);

        for _ in 0..SPIN_WAIT_LIMIT {
            if self.op_read32(regs::XHCI_OP_USBSTS) & regs::USBSTS_HC_HALTED != 0 {
                return Ok(());
            }
            cpu_pause();
        }
        Err(Errno::TimedOut)
    }

    // -- ports ----------------------------------------------------------

    /// Enables wake events on a port.
    pub fn setup_port(&self, port: &Port) {
        let n = port.number as usize - 1;
        let portsc = self.op_read32(regs::xhci_port_sc(n))
            | regs::PORTSC_WCE
            | regs::PORTSC_WDE
            | regs::PORTSC_WOE;
        self.op_write32(regs::xhci_port_sc(n), portsc);
    }

    /// Returns `true` if a device is connected to the port.
    pub fn port_connected(&self, port: &Port) -> bool {
        let n = port.number as usize - 1;
        self.op_read32(regs::xhci_port_sc(n)) & regs::PORTSC_CCS != 0
    }

    /// Brings a port to the Enabled state. USB3 ports auto-advance on
    /// attach; USB2 ports are reset and polled for the reset-change
    /// latch.
    pub fn enable_port(&self, port: &Port) -> KResult<()> {
        let n = port.number as usize - 1;
        let mut portsc = self.op_read32(regs::xhci_port_sc(n));

        if !port.protocol.is_usb3() {
            // Clear any pending reset-change latch, then reset.
            self.op_write32(
                regs::xhci_port_sc(n),
                (portsc & regs::PORTSC_MASK) | regs::PORTSC_PRC,
            );
            let v = self.op_read32(regs::xhci_port_sc(n)) & regs::PORTSC_MASK;
            self.op_write32(regs::xhci_port_sc(n), v | regs::PORTSC_RESET);

            let mut ok = false;
            for _ in 0..SPIN_WAIT_LIMIT {
                if self.op_read32(regs::xhci_port_sc(n)) & regs::PORTSC_PRC != 0 {
                    ok = true;
                    break;
                }
                cpu_pause();
            }
            if !ok {
                kerror!("xhci: timed out while resetting port {}", port.number);
                return Err(Errno::TimedOut);
            }
            portsc = self.op_read32(regs::xhci_port_sc(n));
        }

        if portsc & regs::PORTSC_EN == 0 {
            return Err(Errno::Io);
        }
        port.speed
            .store(regs::portsc_speed(portsc), Ordering::Release);
        Ok(())
    }

    /// Returns the port object for a 1-based port id.
    pub fn port(&self, number: u8) -> Option<Arc<Port>> {
        self.ports.iter().find(|p| p.number == number).cloned()
    }

    // -- commands -------------------------------------------------------

    /// Enqueues a command TRB, rings the host doorbell, and waits for
    /// its completion event.
    pub fn run_command(&self, trb: Trb) -> KResult<CommandCompletion> {
        self.cmd_ring.lock().enqueue(trb);
        self.ring_doorbell(0, 0);

        let evt = self.cmd_compl_ch.recv().map_err(|e| {
            kerror!("xhci: failed to await command completion [{e}]");
            Errno::Io
        })?;
        evt.as_command_completion().ok_or(Errno::Io)
    }

    /// NOOP command smoke test.
    pub fn run_noop_cmd(&self) -> KResult<()> {
        let compl = self.run_command(Trb::noop_cmd())?;
        if compl.is_success() { Ok(()) } else { Err(Errno::Io) }
    }

    /// ENABLE_SLOT: returns the allocated slot id.
    pub fn run_enable_slot_cmd(&self, slot_type: u8) -> KResult<u8> {
        let compl = self.run_command(Trb::enable_slot_cmd(slot_type as u32))?;
        if compl.is_success() {
            Ok(compl.slot_id)
        } else {
            Err(Errno::Io)
        }
    }

    /// ADDRESS_DEVICE for a slot's input context.
    pub fn run_address_device_cmd(&self, slot_id: u8, input_ctx: u64) -> KResult<()> {
        let compl = self.run_command(Trb::address_device_cmd(input_ctx, slot_id))?;
        if compl.is_success() { Ok(()) } else { Err(Errno::Io) }
    }

    /// CONFIGURE_ENDPOINT for a slot's input context.
    pub fn run_configure_ep_cmd(&self, slot_id: u8, input_ctx: u64) -> KResult<()> {
        let compl = self.run_command(Trb::configure_ep_cmd(input_ctx, slot_id))?;
        if compl.is_success() { Ok(()) } else { Err(Errno::Io) }
    }

    /// EVALUATE_CONTEXT for a slot's input context.
    pub fn run_evaluate_ctx_cmd(&self, slot_id: u8, input_ctx: u64) -> KResult<()> {
        let compl = self.run_command(Trb::evaluate_ctx_cmd(input_ctx, slot_id))?;
        if compl.is_success() { Ok(()) } else { Err(Errno::Io) }
    }

    // -- interrupt handling and event demux -----------------------------

    /// Top-half interrupt handler for the root interrupter: clears the
    /// latches and signals the event loop. On a host-controller error
    /// the controller is halted.
    pub fn host_irq(&self) {
        let usbsts = self.op_read32(regs::XHCI_OP_USBSTS);
        self.op_write32(regs::XHCI_OP_USBSTS, usbsts | regs::USBSTS_EVT_INT);
        let iman = self.rt_read32(regs::xhci_intr_iman(0));
        self.rt_write32(regs::xhci_intr_iman(0), iman | regs::IMAN_IP);

        if usbsts & regs::USBSTS_HC_ERR != 0 {
            kerror!("xhci: host controller error");
            let _ = self.halt();
            return;
        }
        if usbsts & regs::USBSTS_HS_ERR != 0 {
            kerror!("xhci: host system error");
            return;
        }

        self.interrupter.signal();
    }

    fn route_event(&self, trb: Trb) {
        let result = match trb.trb_type() {
            super::trb::TRB_TRANSFER_EVT => self.xfer_evt_ch.send(trb),
            super::trb::TRB_CMD_COMPLETION_EVT => self.cmd_compl_ch.send(trb),
            super::trb::TRB_PORT_STATUS_EVT => {
                let res = self.port_sts_ch.send(trb);
                if let Some(change) = trb.as_port_status() {
                    self.reconcile_port(change.port_id);
                }
                res
            }
            other => {
                kdebug!("xhci: ignoring event type {other}");
                Ok(())
            }
        };

        if result.is_err() {
            // A full event channel means the service thread is gone or
            // wedged; the ring can no longer drain safely.
            let _ = self.halt();
            panic!("xhci: event channel full, controller halted");
        }
    }

    /// Port-status reconciliation: refresh the cached speed and notify
    /// the USB stack of connects/disconnects.
    fn reconcile_port(&self, port_id: u8) {
        let Some(port) = self.port(port_id) else {
            kerror!("xhci: port {port_id} not initialized");
            return;
        };
        let portsc = self.op_read32(regs::xhci_port_sc(port_id as usize - 1));
        port.speed
            .store(regs::portsc_speed(portsc), Ordering::Release);
        port_notify(port_id, portsc & regs::PORTSC_CCS != 0);
    }

    /// Drains the root interrupter's event ring once, routing every
    /// pending TRB and advancing ERDP with EH_BUSY. Returns the number
    /// of events handled.
    pub fn drain_root_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let trb = self.interrupter.ring.lock().dequeue();
            match trb {
                Some(trb) => {
                    self.route_event(trb);
                    handled += 1;
                }
                None => break,
            }
        }

        let new_erdp = self.interrupter.ring.lock().device_ptr();
        let mut erdp = self.rt_read64(regs::xhci_intr_erdp(0));
        erdp &= regs::ERDP_MASK;
        erdp |= new_erdp & regs::A64_MASK;
        erdp |= regs::ERDP_EH_BUSY;
        self.rt_write64(regs::xhci_intr_erdp(0), erdp);
        handled
    }

    /// Controller event loop body: waits on the root interrupter and
    /// drains its ring. Runs on a dedicated kernel thread.
    pub fn event_loop(&self) -> ! {
        kdebug!("xhci: starting controller event loop");
        loop {
            self.interrupter.wait_events();
            self.drain_root_events();
        }
    }

    /// Discovery pass: invokes the attach hook for every port with a
    /// connected device.
    pub fn discover_ports(&self) {
        for port in &self.ports {
            if self.port_connected(port) {
                kdebug!("xhci: device connected to port {}", port.number);
                port_notify(port.number, true);
            }
        }
    }
}

/// Walks the extended capabilities for supported-protocol entries.
fn discover_protocols(mmio: &MmioSpace, xcap_base: usize) -> Vec<Protocol> {
    let mut protocols = Vec::new();
    if xcap_base == 0 {
        return protocols;
    }

    let mut offset = xcap_base;
    loop {
        let header = mmio.read32(offset);
        if regs::xcap_id(header) == regs::XHCI_XCAP_PROTOCOL {
            let ports = mmio.read32(offset + 8);
            let slot = mmio.read32(offset + 12);
            protocols.push(Protocol {
                rev_minor: (header >> 16) as u8,
                rev_major: (header >> 24) as u8,
                port_offset: (ports & 0xFF) as u8,
                port_count: ((ports >> 8) & 0xFF) as u8,
                slot_type: (slot & 0x1F) as u8,
            });
        }
        let next = regs::xcap_next(header);
        if next == 0 {
            break;
        }
        offset += next;
    }
    protocols
}
