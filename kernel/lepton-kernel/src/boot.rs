//! Boot sequencing.
//!
//! Registers the subsystem initializers with their dependencies and
//! drives them in order. Architecture bring-up (paging, interrupt
//! controllers, CPU enumeration) happens before [`kernel_main_init`]
//! and installs the CPU/clock/IRQ hooks; everything here is
//! architecture-independent.

use alloc::sync::Arc;

use lepton_core::{kinfo, KResult};
use lepton_fs::FsType;
use lepton_sched::ThreadFlags;

use crate::init;
use crate::proc;

/// Registers the core initializers. Called once from the boot path
/// after the heap is live.
pub fn register_initializers() {
    init::register("hooks", &[], || {
        crate::install_hooks();
    });
    init::register("params", &["hooks"], || {
        crate::apply_params();
    });
    init::register("fs-types", &["hooks"], || {
        lepton_fs::fs_register_type(FsType {
            name: "ramfs",
            ops: Arc::new(lepton_fs::ramfs::RamfsType),
        })
        .expect("ramfs type registration");
        lepton_fs::fs_register_type(FsType {
            name: "procfs",
            ops: Arc::new(lepton_fs::procfs::ProcfsType),
        })
        .expect("procfs type registration");
    });
    init::register("rootfs", &["fs-types"], || {
        lepton_fs::fs_init_root("ramfs").expect("root filesystem");
    });
    init::register("proc0", &["hooks"], || {
        let proc0 = proc::proc0_init();
        kinfo!("proc: kernel process {} ready", proc0.pid);
    });
}

/// Runs every registered initializer.
pub fn kernel_main_init() {
    init::run_all();
}

/// Brings up one CPU's scheduler with its idle thread and returns it.
/// Called on every CPU during SMP bring-up (BSP first).
pub fn cpu_sched_init(cpu: u32) -> KResult<Arc<lepton_sched::Scheduler>> {
    let proc0 = proc::proc_lookup(0).expect("proc0 before schedulers");
    let idle = proc::proc0_alloc_idle(&proc0, cpu)?;
    idle.set_entry_fn(alloc::boxed::Box::new(|| lepton_sched::idle_loop()));
    Ok(lepton_sched::sched_init_cpu(cpu, idle))
}

/// Spawns a single-thread kernel process running `body`.
pub fn spawn_kthread(
    name: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> KResult<Arc<proc::Process>> {
    let kproc = proc::Process::alloc_empty(Arc::new(proc::Creds::root()))?;
    let td = kproc.setup_new_thread(ThreadFlags::KTHREAD, name)?;
    td.set_entry_fn(alloc::boxed::Box::new(body));
    kproc.setup_name(name);
    kproc.finish_setup_and_submit_all();
    Ok(kproc)
}

/// Attaches the console UART (per the `console.uart.port` parameter)
/// and starts its service threads: the shared softirq dispatcher and
/// the per-port transmit pump.
pub fn start_console_uart(io: Arc<dyn lepton_tty::UartIo>) -> KResult<Arc<lepton_tty::UartDevice>> {
    let port = lepton_tty::console_port();
    let dev = lepton_tty::UartDevice::attach(io, port, lepton_tty::Termios::default())?;

    let chan = lepton_tty::uart_softirq_init();
    spawn_kthread("uart_softirq", move || {
        lepton_tty::uart_softirq_loop(&chan);
    })?;

    let pump_dev = dev.clone();
    spawn_kthread("uart_tx", move || {
        let _ = pump_dev.transmit_pump();
    })?;

    dev.open()?;
    kinfo!("uart: console on port {:#x}", dev.port);
    Ok(dev)
}

/// Spawns the xHCI controller's event thread and performs initial port
/// discovery.
pub fn start_xhci(controller: Arc<lepton_usb::xhci::Controller>) -> KResult<()> {
    let hc = controller.clone();
    let kproc = spawn_kthread("xhci_events", move || hc.event_loop())?;
    controller
        .pid
        .store(kproc.pid, core::sync::atomic::Ordering::Release);
    controller.discover_ports();
    Ok(())
}
