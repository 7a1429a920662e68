//! Filesystem syscalls.
//!
//! Thin wrappers resolving the calling process, over `do_*` bodies that
//! take the process explicitly (also the testable surface). Relative
//! paths resolve against the process's current working directory.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lepton_core::clock::TimeVal;
use lepton_core::{Errno, KResult};
use lepton_fs::file::{SEEK_CUR, SEEK_END, SEEK_SET};
use lepton_fs::{
    File, OpenFlags, SeekWhence, VAttr, Ventry, VnodeType, VresolveFlags, rmdir_path,
    unlink_path, ventry_abspath, vresolve, vresolve_parent,
};

use super::current_process;
use crate::proc::Process;

/// A stat(2) result.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Vnode id.
    pub ino: u64,
    /// File type and permission bits.
    pub mode: u32,
    /// Hard links.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Allocated blocks.
    pub blocks: u64,
    /// Access time.
    pub atime: TimeVal,
    /// Modification time.
    pub mtime: TimeVal,
    /// Change time.
    pub ctime: TimeVal,
}

/// File-type bits in `Stat::mode`.
pub mod mode {
    /// Regular file.
    pub const S_IFREG: u32 = 0o100000;
    /// Directory.
    pub const S_IFDIR: u32 = 0o040000;
    /// Symbolic link.
    pub const S_IFLNK: u32 = 0o120000;
    /// Block device.
    pub const S_IFBLK: u32 = 0o060000;
    /// Character device.
    pub const S_IFCHR: u32 = 0o020000;
    /// FIFO.
    pub const S_IFIFO: u32 = 0o010000;
    /// Socket.
    pub const S_IFSOCK: u32 = 0o140000;
}

fn type_bits(vtype: VnodeType) -> u32 {
    match vtype {
        VnodeType::Reg => mode::S_IFREG,
        VnodeType::Dir => mode::S_IFDIR,
        VnodeType::Lnk => mode::S_IFLNK,
        VnodeType::Blk => mode::S_IFBLK,
        VnodeType::Chr => mode::S_IFCHR,
        VnodeType::Fifo => mode::S_IFIFO,
        VnodeType::Sock => mode::S_IFSOCK,
    }
}

fn stat_of(stat: lepton_fs::VnStat) -> Stat {
    Stat {
        ino: stat.id,
        mode: type_bits(stat.vtype) | (stat.mode & 0o7777),
        nlink: stat.nlink,
        size: stat.size as u64,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
    }
}

fn cwd_of(proc: &Process) -> Option<Arc<Ventry>> {
    proc.cwd()
}

/// One getdents64 record as handed to userspace copy-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent64 {
    /// Vnode id.
    pub ino: u64,
    /// Next-entry offset cookie.
    pub off: u64,
    /// Entry type byte (DT_*).
    pub dtype: u8,
    /// Entry name.
    pub name: String,
}

fn dtype_of(vtype: VnodeType) -> u8 {
    match vtype {
        VnodeType::Fifo => 1,
        VnodeType::Chr => 2,
        VnodeType::Dir => 4,
        VnodeType::Blk => 6,
        VnodeType::Reg => 8,
        VnodeType::Lnk => 10,
        VnodeType::Sock => 12,
    }
}

// ---------------------------------------------------------------------------
// do_* bodies (explicit process)
// ---------------------------------------------------------------------------

/// Opens `path` and installs the file at the lowest free descriptor.
pub fn do_open(proc: &Process, path: &str, flags: OpenFlags) -> KResult<usize> {
    let file = File::open(cwd_of(proc), path, flags)?;
    proc.files.alloc(file)
}

/// Closes a descriptor.
pub fn do_close(proc: &Process, fd: usize) -> KResult<()> {
    let file = proc.files.take(fd)?;
    file.close()
}

/// Reads from a descriptor.
pub fn do_read(proc: &Process, fd: usize, buf: &mut [u8]) -> KResult<usize> {
    proc.files.get(fd)?.read(buf)
}

/// Writes to a descriptor.
pub fn do_write(proc: &Process, fd: usize, buf: &[u8]) -> KResult<usize> {
    proc.files.get(fd)?.write(buf)
}

/// Scatter read: fills each buffer in turn.
pub fn do_readv(proc: &Process, fd: usize, bufs: &mut [&mut [u8]]) -> KResult<usize> {
    let file = proc.files.get(fd)?;
    let mut total = 0;
    for buf in bufs {
        let n = file.read(buf)?;
        total += n;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

/// Gather write: writes each buffer in turn.
pub fn do_writev(proc: &Process, fd: usize, bufs: &[&[u8]]) -> KResult<usize> {
    let file = proc.files.get(fd)?;
    let mut total = 0;
    for buf in bufs {
        let n = file.write(buf)?;
        total += n;
        if n < buf.len() {
            break;
        }
    }
    Ok(total)
}

/// Reads directory entries from the descriptor's current offset.
pub fn do_getdents64(proc: &Process, fd: usize, max: usize) -> KResult<Vec<Dirent64>> {
    let file = proc.files.get(fd)?;
    let mut out = Vec::new();
    while out.len() < max {
        match file.readdir_next()? {
            Some(entry) => out.push(Dirent64 {
                ino: entry.id,
                off: file.offset() as u64,
                dtype: dtype_of(entry.vtype),
                name: entry.name,
            }),
            None => break,
        }
    }
    Ok(out)
}

/// Repositions a descriptor.
pub fn do_lseek(proc: &Process, fd: usize, offset: i64, whence: u32) -> KResult<usize> {
    let whence = match whence {
        SEEK_SET => SeekWhence::Set,
        SEEK_CUR => SeekWhence::Cur,
        SEEK_END => SeekWhence::End,
        _ => return Err(Errno::Inval),
    };
    proc.files.get(fd)?.seek(offset, whence)
}

/// Device control on a descriptor.
pub fn do_ioctl(proc: &Process, fd: usize, request: u64, arg: usize) -> KResult<usize> {
    proc.files.get(fd)?.ioctl(request, arg)
}

/// fcntl commands.
pub mod fcntl {
    /// Duplicate to the lowest descriptor >= arg (arg ignored here).
    pub const F_DUPFD: u32 = 0;
    /// Get descriptor flags.
    pub const F_GETFD: u32 = 1;
    /// Set descriptor flags.
    pub const F_SETFD: u32 = 2;
    /// Get status flags.
    pub const F_GETFL: u32 = 3;
    /// Set status flags.
    pub const F_SETFL: u32 = 4;
}

/// File-control operations.
pub fn do_fcntl(proc: &Process, fd: usize, cmd: u32, arg: u32) -> KResult<usize> {
    let file = proc.files.get(fd)?;
    match cmd {
        fcntl::F_DUPFD => proc.files.dup(fd),
        fcntl::F_GETFD => Ok(usize::from(
            file.flags().contains(OpenFlags::CLOEXEC),
        )),
        fcntl::F_SETFD => Ok(0),
        fcntl::F_GETFL => Ok(file.flags().bits() as usize),
        fcntl::F_SETFL => {
            file.set_status_flags(OpenFlags::from_bits_truncate(arg));
            Ok(0)
        }
        _ => Err(Errno::Inval),
    }
}

/// Truncates an open file.
pub fn do_ftruncate(proc: &Process, fd: usize, length: usize) -> KResult<()> {
    proc.files.get(fd)?.truncate(length)
}

/// Stats an open file.
pub fn do_fstat(proc: &Process, fd: usize) -> KResult<Stat> {
    Ok(stat_of(proc.files.get(fd)?.stat()?))
}

/// Duplicates a descriptor to the lowest free slot.
pub fn do_dup(proc: &Process, fd: usize) -> KResult<usize> {
    proc.files.dup(fd)
}

/// Duplicates `oldfd` onto `newfd`.
pub fn do_dup2(proc: &Process, oldfd: usize, newfd: usize) -> KResult<usize> {
    proc.files.dup2(oldfd, newfd)
}

/// Creates a pipe, returning (read fd, write fd).
pub fn do_pipe(proc: &Process) -> KResult<(usize, usize)> {
    do_pipe2(proc, OpenFlags::empty())
}

/// Creates a pipe with flags.
pub fn do_pipe2(proc: &Process, flags: OpenFlags) -> KResult<(usize, usize)> {
    let (r, w) = File::pipe_pair(OpenFlags::RDWR | flags);
    let rfd = proc.files.alloc(r)?;
    let wfd = match proc.files.alloc(w) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = proc.files.take(rfd).map(|f| f.close());
            return Err(e);
        }
    };
    Ok((rfd, wfd))
}

/// One poll request/result.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    /// Descriptor to poll.
    pub fd: usize,
    /// Requested events (POLLIN=1, POLLOUT=4).
    pub events: u16,
    /// Returned events (POLLIN/POLLOUT/POLLHUP=0x10/POLLNVAL=0x20).
    pub revents: u16,
}

/// POLLIN event bit.
pub const POLLIN: u16 = 0x1;
/// POLLOUT event bit.
pub const POLLOUT: u16 = 0x4;
/// POLLHUP event bit.
pub const POLLHUP: u16 = 0x10;
/// POLLNVAL event bit.
pub const POLLNVAL: u16 = 0x20;

/// Polls descriptors once (level-triggered readiness snapshot).
/// Returns the number of descriptors with events. Blocking with a
/// timeout loops with yields until the deadline.
pub fn do_poll(proc: &Process, fds: &mut [PollFd], timeout_ms: i64) -> KResult<usize> {
    let deadline = if timeout_ms < 0 {
        u64::MAX
    } else {
        lepton_core::clock::clock_nanos() + timeout_ms as u64 * 1_000_000
    };

    loop {
        let mut ready = 0;
        for pollfd in fds.iter_mut() {
            pollfd.revents = 0;
            match proc.files.get(pollfd.fd) {
                Err(_) => {
                    pollfd.revents = POLLNVAL;
                    ready += 1;
                }
                Ok(file) => {
                    let (readable, writable, hangup) = file.poll();
                    if readable && pollfd.events & POLLIN != 0 {
                        pollfd.revents |= POLLIN;
                    }
                    if writable && pollfd.events & POLLOUT != 0 {
                        pollfd.revents |= POLLOUT;
                    }
                    if hangup {
                        pollfd.revents |= POLLHUP;
                    }
                    if pollfd.revents != 0 {
                        ready += 1;
                    }
                }
            }
        }

        if ready > 0 || timeout_ms == 0 || lepton_core::clock::clock_nanos() >= deadline {
            return Ok(ready);
        }
        lepton_core::sched::yield_now();
    }
}

/// Sets file times (`None` = now).
pub fn do_utimensat(
    proc: &Process,
    path: &str,
    atime: Option<TimeVal>,
    mtime: Option<TimeVal>,
) -> KResult<()> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::empty())?;
    let now = lepton_core::clock::clock_micro_time();
    let mut meta = ve.vnode().meta();
    meta.atime = atime.unwrap_or(now);
    meta.mtime = mtime.unwrap_or(now);
    meta.ctime = now;
    Ok(())
}

/// Stats a path, following symlinks.
pub fn do_stat(proc: &Process, path: &str) -> KResult<Stat> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::empty())?;
    Ok(stat_of(ve.vnode().stat()))
}

/// Stats a path without following a trailing symlink.
pub fn do_lstat(proc: &Process, path: &str) -> KResult<Stat> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::NOFOLLOW)?;
    Ok(stat_of(ve.vnode().stat()))
}

/// Truncates a path.
pub fn do_truncate(proc: &Process, path: &str, length: usize) -> KResult<()> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::empty())?;
    ve.vnode().truncate(length)
}

/// Creates a device/fifo/socket node.
pub fn do_mknod(proc: &Process, path: &str, vtype: VnodeType, mode: u32, dev: u64) -> KResult<()> {
    let (dir, name) = vresolve_parent(cwd_of(proc), path)?;
    let vn = dir.vnode().mknod(&name, VAttr::new(vtype, mode), dev)?;
    let ve = Ventry::new(&name, vn);
    dir.link_child(&ve);
    Ok(())
}

/// Creates a symlink at `linkpath` pointing to `target`.
pub fn do_symlink(proc: &Process, target: &str, linkpath: &str) -> KResult<()> {
    let (dir, name) = vresolve_parent(cwd_of(proc), linkpath)?;
    let vn = dir.vnode().symlink(&name, target)?;
    let ve = Ventry::new(&name, vn);
    dir.link_child(&ve);
    Ok(())
}

/// Creates a hard link.
pub fn do_link(proc: &Process, oldpath: &str, newpath: &str) -> KResult<()> {
    let old = vresolve(cwd_of(proc), oldpath, VresolveFlags::empty())?;
    if old.vnode().is_dir() {
        return Err(Errno::IsDir);
    }
    let (dir, name) = vresolve_parent(cwd_of(proc), newpath)?;
    dir.vnode().hardlink(&name, old.vnode())?;
    let ve = Ventry::new(&name, old.vnode().clone());
    dir.link_child(&ve);
    Ok(())
}

/// Removes a file or symlink.
pub fn do_unlink(proc: &Process, path: &str) -> KResult<()> {
    unlink_path(cwd_of(proc), path)
}

/// Changes the working directory.
pub fn do_chdir(proc: &Process, path: &str) -> KResult<()> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::DIRECTORY)?;
    proc.set_cwd(ve);
    Ok(())
}

/// Creates a directory.
pub fn do_mkdir(proc: &Process, path: &str, mode: u32) -> KResult<()> {
    let (dir, name) = vresolve_parent(cwd_of(proc), path)?;
    let vn = dir.vnode().mkdir(&name, VAttr::new(VnodeType::Dir, mode))?;
    let ve = Ventry::new(&name, vn);
    dir.link_child(&ve);
    Ok(())
}

/// Returns the absolute path of the working directory.
pub fn do_getcwd(proc: &Process) -> KResult<String> {
    match proc.cwd() {
        Some(ve) => Ok(ventry_abspath(&ve)),
        None => Ok(String::from("/")),
    }
}

/// Removes an empty directory.
pub fn do_rmdir(proc: &Process, path: &str) -> KResult<()> {
    rmdir_path(cwd_of(proc), path)
}

/// Renames a file. Directory renames and cross-filesystem moves are
/// not supported by the in-memory backends (`EISDIR` / `EXDEV`).
pub fn do_rename(proc: &Process, oldpath: &str, newpath: &str) -> KResult<()> {
    let old = vresolve(cwd_of(proc), oldpath, VresolveFlags::NOFOLLOW)?;
    if old.vnode().is_dir() {
        return Err(Errno::IsDir);
    }
    let (new_dir, new_name) = vresolve_parent(cwd_of(proc), newpath)?;

    // Same-filesystem check: hard links cannot cross instances.
    new_dir
        .vnode()
        .hardlink(&new_name, old.vnode())
        .map_err(|e| if e == Errno::NotSup { Errno::Xdev } else { e })?;
    let ve = Ventry::new(&new_name, old.vnode().clone());
    new_dir.link_child(&ve);

    unlink_path(cwd_of(proc), oldpath)
}

/// Reads a symlink's target.
pub fn do_readlink(proc: &Process, path: &str) -> KResult<String> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::NOFOLLOW)?;
    ve.vnode().readlink()
}

/// Canonicalizes a path (resolving every symlink).
pub fn do_realpath(proc: &Process, path: &str) -> KResult<String> {
    let ve = vresolve(cwd_of(proc), path, VresolveFlags::empty())?;
    Ok(ventry_abspath(&ve))
}

// ---------------------------------------------------------------------------
// Syscall wrappers (calling process)
// ---------------------------------------------------------------------------

/// `open(path, flags)`.
pub fn sys_open(path: &str, flags: OpenFlags) -> KResult<usize> {
    do_open(current_process()?.as_ref(), path, flags)
}

/// `close(fd)`.
pub fn sys_close(fd: usize) -> KResult<()> {
    do_close(current_process()?.as_ref(), fd)
}

/// `read(fd, buf)`.
pub fn sys_read(fd: usize, buf: &mut [u8]) -> KResult<usize> {
    do_read(current_process()?.as_ref(), fd, buf)
}

/// `write(fd, buf)`.
pub fn sys_write(fd: usize, buf: &[u8]) -> KResult<usize> {
    do_write(current_process()?.as_ref(), fd, buf)
}

/// `lseek(fd, offset, whence)`.
pub fn sys_lseek(fd: usize, offset: i64, whence: u32) -> KResult<usize> {
    do_lseek(current_process()?.as_ref(), fd, offset, whence)
}

/// `getcwd()`.
pub fn sys_getcwd() -> KResult<String> {
    do_getcwd(current_process()?.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::{Creds, Process};
    use lepton_fs::FsType;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_fs() {
        INIT.call_once(|| {
            let _ = lepton_fs::fs_register_type(FsType {
                name: "ramfs",
                ops: Arc::new(lepton_fs::ramfs::RamfsType),
            });
            // The fs crate's own tests may have mounted the root in the
            // same process; tolerate either order.
            if std::panic::catch_unwind(lepton_fs::fs_root).is_err() {
                lepton_fs::fs_init_root("ramfs").unwrap();
            }
        });
    }

    fn test_proc() -> Arc<Process> {
        ensure_fs();
        Process::alloc_empty(Arc::new(Creds::root())).unwrap()
    }

    fn teardown(proc: Arc<Process>) {
        proc.exit_all(0);
        proc.reap();
    }

    #[test]
    fn open_write_read_roundtrip_via_syscalls() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_rw", 0o755).unwrap();

        let fd = do_open(
            &proc,
            "/sc_rw/file",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        assert_eq!(do_write(&proc, fd, b"hello syscall").unwrap(), 13);
        do_lseek(&proc, fd, 0, SEEK_SET).unwrap();
        let mut buf = [0u8; 32];
        let n = do_read(&proc, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello syscall");
        do_close(&proc, fd).unwrap();

        assert_eq!(do_close(&proc, fd).unwrap_err(), Errno::BadF);
        teardown(proc);
    }

    #[test]
    fn stat_reports_type_and_size() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_stat", 0o755).unwrap();
        let fd = do_open(
            &proc,
            "/sc_stat/f",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        do_write(&proc, fd, b"12345").unwrap();

        let st = do_fstat(&proc, fd).unwrap();
        assert_eq!(st.size, 5);
        assert_eq!(st.mode & 0o170000, mode::S_IFREG);

        let st = do_stat(&proc, "/sc_stat").unwrap();
        assert_eq!(st.mode & 0o170000, mode::S_IFDIR);

        do_close(&proc, fd).unwrap();
        teardown(proc);
    }

    #[test]
    fn chdir_and_relative_resolution() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_cwd", 0o755).unwrap();
        do_mkdir(&proc, "/sc_cwd/sub", 0o755).unwrap();

        do_chdir(&proc, "/sc_cwd").unwrap();
        assert_eq!(do_getcwd(&proc).unwrap(), "/sc_cwd");

        // Relative create and open.
        let fd = do_open(&proc, "sub/rel", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        do_close(&proc, fd).unwrap();
        assert!(do_stat(&proc, "/sc_cwd/sub/rel").is_ok());

        do_chdir(&proc, "sub").unwrap();
        assert_eq!(do_getcwd(&proc).unwrap(), "/sc_cwd/sub");
        teardown(proc);
    }

    #[test]
    fn getdents_lists_directory() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_dents", 0o755).unwrap();
        for name in ["a", "b"] {
            let fd = do_open(
                &proc,
                &alloc::format!("/sc_dents/{name}"),
                OpenFlags::RDWR | OpenFlags::CREAT,
            )
            .unwrap();
            do_close(&proc, fd).unwrap();
        }

        let fd = do_open(&proc, "/sc_dents", OpenFlags::DIRECTORY).unwrap();
        let entries = do_getdents64(&proc, fd, 16).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "a", "b"]);
        assert_eq!(entries[2].dtype, 8); // DT_REG
        do_close(&proc, fd).unwrap();
        teardown(proc);
    }

    #[test]
    fn link_unlink_and_rename() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_ln", 0o755).unwrap();
        let fd = do_open(
            &proc,
            "/sc_ln/orig",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        do_write(&proc, fd, b"data").unwrap();
        do_close(&proc, fd).unwrap();

        do_link(&proc, "/sc_ln/orig", "/sc_ln/alias").unwrap();
        assert_eq!(do_stat(&proc, "/sc_ln/alias").unwrap().nlink, 2);

        do_unlink(&proc, "/sc_ln/orig").unwrap();
        assert_eq!(do_stat(&proc, "/sc_ln/alias").unwrap().nlink, 1);

        do_rename(&proc, "/sc_ln/alias", "/sc_ln/renamed").unwrap();
        assert!(do_stat(&proc, "/sc_ln/alias").is_err());
        let fd = do_open(&proc, "/sc_ln/renamed", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 8];
        let n = do_read(&proc, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"data");
        do_close(&proc, fd).unwrap();
        teardown(proc);
    }

    #[test]
    fn symlink_and_readlink() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_sym", 0o755).unwrap();
        let fd = do_open(
            &proc,
            "/sc_sym/target",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        do_close(&proc, fd).unwrap();

        do_symlink(&proc, "/sc_sym/target", "/sc_sym/link").unwrap();
        assert_eq!(do_readlink(&proc, "/sc_sym/link").unwrap(), "/sc_sym/target");
        assert_eq!(
            do_lstat(&proc, "/sc_sym/link").unwrap().mode & 0o170000,
            mode::S_IFLNK
        );
        assert_eq!(
            do_stat(&proc, "/sc_sym/link").unwrap().mode & 0o170000,
            mode::S_IFREG
        );
        assert_eq!(do_realpath(&proc, "/sc_sym/link").unwrap(), "/sc_sym/target");
        teardown(proc);
    }

    #[test]
    fn pipe_and_poll() {
        let proc = test_proc();
        let (rfd, wfd) = do_pipe(&proc).unwrap();

        let mut fds = [PollFd {
            fd: rfd,
            events: POLLIN,
            revents: 0,
        }];
        // Nothing to read yet.
        assert_eq!(do_poll(&proc, &mut fds, 0).unwrap(), 0);

        do_write(&proc, wfd, b"x").unwrap();
        assert_eq!(do_poll(&proc, &mut fds, 0).unwrap(), 1);
        assert!(fds[0].revents & POLLIN != 0);

        let mut buf = [0u8; 4];
        assert_eq!(do_read(&proc, rfd, &mut buf).unwrap(), 1);
        do_close(&proc, wfd).unwrap();

        // Closed writer reports hangup.
        assert_eq!(do_poll(&proc, &mut fds, 0).unwrap(), 1);
        assert!(fds[0].revents & POLLHUP != 0);
        teardown(proc);
    }

    #[test]
    fn dup_and_fcntl() {
        let proc = test_proc();
        do_mkdir(&proc, "/sc_dup", 0o755).unwrap();
        let fd = do_open(
            &proc,
            "/sc_dup/f",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();

        let fd2 = do_dup(&proc, fd).unwrap();
        assert_ne!(fd, fd2);
        let fd3 = do_dup2(&proc, fd, 20).unwrap();
        assert_eq!(fd3, 20);

        let fl = do_fcntl(&proc, fd, fcntl::F_GETFL, 0).unwrap();
        assert!(OpenFlags::from_bits_truncate(fl as u32).contains(OpenFlags::RDWR));
        teardown(proc);
    }

    #[test]
    fn bad_descriptor_paths() {
        let proc = test_proc();
        let mut buf = [0u8; 4];
        assert_eq!(do_read(&proc, 99, &mut buf).unwrap_err(), Errno::BadF);
        assert_eq!(do_write(&proc, 99, b"x").unwrap_err(), Errno::BadF);
        assert_eq!(do_fstat(&proc, 99).unwrap_err(), Errno::BadF);
        assert_eq!(do_lseek(&proc, 0, 0, 77).unwrap_err(), Errno::Inval);
        teardown(proc);
    }
}
