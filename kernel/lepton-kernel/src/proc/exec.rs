//! Executable setup.
//!
//! The ELF loader itself is a supplied primitive behind [`ExecLoader`];
//! this module owns what wraps it: building the initial user stack
//! (argv, envp, auxv), reserving the heap after the last data segment,
//! and pointing the main thread's user context at the entry.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lepton_core::{Errno, KResult, kdebug};
use lepton_mm::page::PAGE_SIZE;

use super::{PStrings, Process};

/// Heap reservation placed after the last data segment: 16 MiB.
pub const BRK_RESERVE: u64 = 16 * 1024 * 1024;

/// Auxiliary vector types passed to userspace.
pub mod auxv {
    /// End of vector.
    pub const AT_NULL: u64 = 0;
    /// Program entry point.
    pub const AT_ENTRY: u64 = 9;
    /// Page size.
    pub const AT_PAGESZ: u64 = 6;
}

/// A loaded executable image.
pub struct ExecImage {
    /// Entry point.
    pub entry: u64,
    /// End of the highest data segment.
    pub last_data_end: u64,
    /// Top of the initial user stack mapping.
    pub stack_top: u64,
}

/// The supplied image loader: maps segments into the process address
/// space and reports the layout.
pub trait ExecLoader: Send + Sync {
    /// Loads `path` into the process, returning the image layout.
    fn load(&self, proc: &Arc<Process>, path: &str) -> KResult<ExecImage>;
}

/// The initial user stack image: bytes to copy below `stack_top` and
/// the resulting stack pointer.
#[derive(Debug)]
pub struct StackImage {
    /// Raw bytes, ending at `stack_top`.
    pub data: Vec<u8>,
    /// User stack pointer (offset of the frame start within `data`,
    /// measured back from the top).
    pub rsp_offset_from_top: usize,
}

/// Builds the System-V style process stack: strings at the top, then
/// the auxv, the NULL-terminated envp and argv pointer arrays, and argc
/// at the final stack pointer.
pub fn build_stack(
    stack_top: u64,
    args: &PStrings,
    env: &PStrings,
    entry: u64,
) -> KResult<StackImage> {
    if stack_top % 16 != 0 {
        return Err(Errno::Inval);
    }

    // Lay strings out from the top down, remembering each string's
    // final user address.
    let mut data: Vec<u8> = Vec::new();
    let mut arg_addrs: Vec<u64> = Vec::new();
    let mut env_addrs: Vec<u64> = Vec::new();

    let mut cursor = stack_top;
    let mut push_string = |data: &mut Vec<u8>, cursor: &mut u64, s: &str| -> u64 {
        let bytes = s.len() + 1;
        *cursor -= bytes as u64;
        let mut chunk = Vec::with_capacity(bytes);
        chunk.extend_from_slice(s.as_bytes());
        chunk.push(0);
        // Prepend: data vector grows downward from the top.
        chunk.extend_from_slice(data);
        *data = chunk;
        *cursor
    };

    for i in (0..env.count()).rev() {
        let s = env.get(i).ok_or(Errno::Inval)?;
        env_addrs.push(push_string(&mut data, &mut cursor, s));
    }
    env_addrs.reverse();
    for i in (0..args.count()).rev() {
        let s = args.get(i).ok_or(Errno::Inval)?;
        arg_addrs.push(push_string(&mut data, &mut cursor, s));
    }
    arg_addrs.reverse();

    // Align the pointer area to 16 bytes.
    let align_pad = (cursor % 16) as usize;
    cursor -= align_pad as u64;
    let mut padded = alloc::vec![0u8; align_pad];
    padded.extend_from_slice(&data);
    data = padded;

    // Pointer frame, built top-down: auxv, envp + NULL, argv + NULL,
    // argc.
    let mut frame: Vec<u64> = Vec::new();
    frame.push(args.count() as u64); // argc
    frame.extend(arg_addrs.iter());
    frame.push(0); // argv NULL
    frame.extend(env_addrs.iter());
    frame.push(0); // envp NULL
    frame.extend([auxv::AT_PAGESZ, PAGE_SIZE as u64]);
    frame.extend([auxv::AT_ENTRY, entry]);
    frame.extend([auxv::AT_NULL, 0]);

    // Keep the final rsp 16-byte aligned.
    if frame.len() % 2 != 0 {
        frame.push(0);
    }

    let frame_bytes = frame.len() * 8;
    cursor -= frame_bytes as u64;
    let mut image: Vec<u8> = Vec::with_capacity(frame_bytes + data.len());
    for v in &frame {
        image.extend_from_slice(&v.to_le_bytes());
    }
    image.extend_from_slice(&data);

    Ok(StackImage {
        rsp_offset_from_top: image.len(),
        data: image,
    })
}

/// Loads `path` into `proc` during the setup window: maps the image,
/// builds the stack descriptor, reserves the heap, and points the main
/// thread at the entry.
pub fn setup_exec(
    proc: &Arc<Process>,
    loader: &dyn ExecLoader,
    path: &str,
    args: &[&str],
    env: &[&str],
) -> KResult<()> {
    proc.setup_args(args);
    proc.setup_env(env);
    proc.setup_binpath(path);

    let image = loader.load(proc, path)?;

    let stack = build_stack(image.stack_top, &proc.args(), &proc.env(), image.entry)?;
    let rsp = image.stack_top - stack.rsp_offset_from_top as u64;

    // Heap: page-aligned reservation immediately after the last data
    // segment.
    let brk_start = image.last_data_end.next_multiple_of(PAGE_SIZE as u64);
    proc.setup_brk(brk_start, brk_start + BRK_RESERVE);

    let td = proc.main_thread().ok_or(Errno::Inval)?;
    {
        let mut inner = td.lock();
        inner.ctx.rip = image.entry;
        inner.ctx.rsp = rsp;
        inner.ctx.rflags = 0x202; // IF set
    }

    kdebug!(
        "exec: {} entry={:#x} rsp={:#x} brk={:#x}",
        path,
        image.entry,
        rsp,
        brk_start
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Creds;
    use lepton_sched::ThreadFlags;

    #[test]
    fn stack_layout_is_well_formed() {
        let args = PStrings::new(&["prog", "arg1"]);
        let env = PStrings::new(&["A=1"]);
        let top = 0x7FFF_FFFF_0000u64;

        let stack = build_stack(top, &args, &env, 0x40_1000).unwrap();
        let rsp = top - stack.rsp_offset_from_top as u64;
        assert_eq!(rsp % 16, 0);

        // argc sits at rsp.
        let argc = u64::from_le_bytes(stack.data[0..8].try_into().unwrap());
        assert_eq!(argc, 2);

        // argv[0] points into the string area below the top.
        let argv0 = u64::from_le_bytes(stack.data[8..16].try_into().unwrap());
        assert!(argv0 > rsp && argv0 < top);

        // argv terminator.
        let argv_null = u64::from_le_bytes(stack.data[24..32].try_into().unwrap());
        assert_eq!(argv_null, 0);

        // The string bytes land at the very top of the image.
        let strings = &stack.data[stack.data.len() - (5 + 5 + 4)..];
        assert_eq!(strings, b"prog\0arg1\0A=1\0");
    }

    #[test]
    fn unaligned_stack_top_rejected() {
        let args = PStrings::new(&["p"]);
        let env = PStrings::empty();
        assert_eq!(
            build_stack(0x1001, &args, &env, 0).unwrap_err(),
            Errno::Inval
        );
    }

    struct FakeLoader;
    impl ExecLoader for FakeLoader {
        fn load(&self, _proc: &Arc<Process>, _path: &str) -> KResult<ExecImage> {
            Ok(ExecImage {
                entry: 0x40_1000,
                last_data_end: 0x60_1234,
                stack_top: 0x7FFF_FF00_0000,
            })
        }
    }

    #[test]
    fn setup_exec_reserves_heap_and_entry() {
        let proc = Process::alloc_empty(Arc::new(Creds::root())).unwrap();
        proc.setup_new_thread(ThreadFlags::empty(), "main").unwrap();

        setup_exec(&proc, &FakeLoader, "/bin/prog", &["prog"], &["HOME=/"]).unwrap();

        let brk = proc.brk_range();
        assert_eq!(brk.start, 0x60_2000); // page-aligned after data end
        assert_eq!(brk.max, brk.start + BRK_RESERVE);
        assert_eq!(proc.binpath(), "/bin/prog");

        let td = proc.main_thread().unwrap();
        let inner = td.lock();
        assert_eq!(inner.ctx.rip, 0x40_1000);
        assert!(inner.ctx.rsp < 0x7FFF_FF00_0000);
        assert_eq!(inner.ctx.rflags, 0x202);
        drop(inner);

        crate::proc::thread_stop(&td);
        proc.exit_all(0);
        proc.reap();
    }
}
