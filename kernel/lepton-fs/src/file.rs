//! Open-file objects and descriptor tables.
//!
//! A [`File`] pairs a backing object (vnode or pipe) with an offset and
//! open flags. The file lock covers the offset and flags only; data
//! operations drop it in favor of the vnode's data lock so a file can be
//! concurrently stat'ed or closed while a slow read is in flight.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use lepton_core::sync::{Mutex, SpinLock, WaitQueue};
use lepton_core::{Errno, KResult};

use crate::mount::{VresolveFlags, vcache_remove, vresolve, vresolve_parent};
use crate::ventry::Ventry;
use crate::vnode::{DirEntry, FileHandle, VAttr, VnodeType};

bitflags! {
    /// open(2)-style flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for writing (without this, read-only).
        const WRONLY = 1 << 0;
        /// Open for reading and writing.
        const RDWR = 1 << 1;
        /// Create if missing.
        const CREAT = 1 << 6;
        /// With CREAT, fail if the file exists.
        const EXCL = 1 << 7;
        /// Truncate on open.
        const TRUNC = 1 << 9;
        /// All writes append.
        const APPEND = 1 << 10;
        /// Fail unless the target is a directory.
        const DIRECTORY = 1 << 16;
        /// Do not follow a trailing symlink.
        const NOFOLLOW = 1 << 17;
        /// Non-blocking I/O.
        const NONBLOCK = 1 << 11;
        /// Close on exec.
        const CLOEXEC = 1 << 19;
    }
}

impl OpenFlags {
    /// Returns `true` if the flags permit reading.
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    /// Returns `true` if the flags permit writing.
    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// From the start of the file.
    Set,
    /// From the current offset.
    Cur,
    /// From the end of the file.
    End,
}

/// Seek origin wire values (lseek whence argument).
pub const SEEK_SET: u32 = 0;
/// From the current position.
pub const SEEK_CUR: u32 = 1;
/// From the end.
pub const SEEK_END: u32 = 2;

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// Pipe buffer capacity in bytes.
const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeInner {
    buf: VecDeque<u8>,
    readers: u32,
    writers: u32,
}

/// An anonymous pipe shared by a read end and a write end.
pub struct Pipe {
    inner: SpinLock<PipeInner>,
    read_wq: WaitQueue,
    write_wq: WaitQueue,
}

impl Pipe {
    fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            inner: SpinLock::new(PipeInner {
                buf: VecDeque::new(),
                readers: 1,
                writers: 1,
            }),
            read_wq: WaitQueue::new(),
            write_wq: WaitQueue::new(),
        })
    }

    fn read(&self, buf: &mut [u8], nonblock: bool) -> KResult<usize> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                if !inner.buf.is_empty() {
                    let mut n = 0;
                    while n < buf.len() {
                        match inner.buf.pop_front() {
                            Some(b) => {
                                buf[n] = b;
                                n += 1;
                            }
                            None => break,
                        }
                    }
                    drop(inner);
                    self.write_wq.wake_all();
                    return Ok(n);
                }
                if inner.writers == 0 {
                    return Ok(0); // EOF
                }
                if nonblock {
                    return Err(Errno::Again);
                }
                self.read_wq.prepare()
            };
            waiter.park("pipe_read");
        }
    }

    fn write(&self, buf: &[u8], nonblock: bool) -> KResult<usize> {
        let mut written = 0;
        while written < buf.len() {
            let waiter = {
                let mut inner = self.inner.lock();
                if inner.readers == 0 {
                    // Broken pipe; signal delivery is the caller's concern.
                    return if written > 0 { Ok(written) } else { Err(Errno::SPipe) };
                }
                let room = PIPE_CAPACITY - inner.buf.len();
                if room > 0 {
                    let n = room.min(buf.len() - written);
                    inner.buf.extend(&buf[written..written + n]);
                    written += n;
                    drop(inner);
                    self.read_wq.wake_all();
                    continue;
                }
                if nonblock {
                    return if written > 0 { Ok(written) } else { Err(Errno::Again) };
                }
                self.write_wq.prepare()
            };
            waiter.park("pipe_write");
        }
        Ok(written)
    }

    fn close_end(&self, writer: bool) {
        let mut inner = self.inner.lock();
        if writer {
            inner.writers = inner.writers.saturating_sub(1);
        } else {
            inner.readers = inner.readers.saturating_sub(1);
        }
        drop(inner);
        self.read_wq.wake_all();
        self.write_wq.wake_all();
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Returns `true` if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

enum FileBacking {
    Vnode { ventry: Arc<Ventry> },
    Pipe { pipe: Arc<Pipe>, writer: bool },
}

struct FileState {
    offset: usize,
    flags: OpenFlags,
    closed: bool,
}

/// An open-file object.
pub struct File {
    backing: FileBacking,
    state: Mutex<FileState>,
    /// Per-open filesystem handle (seqfile iterators live here).
    handle: SpinLock<Option<FileHandle>>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

impl File {
    /// Opens the file at `path` relative to `at`.
    pub fn open(at: Option<Arc<Ventry>>, path_str: &str, flags: OpenFlags) -> KResult<Arc<File>> {
        let mut resolve_flags = VresolveFlags::empty();
        if flags.contains(OpenFlags::NOFOLLOW) {
            resolve_flags |= VresolveFlags::NOFOLLOW;
        }
        if flags.contains(OpenFlags::DIRECTORY) {
            resolve_flags |= VresolveFlags::DIRECTORY;
        }

        let ventry = match vresolve(at.clone(), path_str, resolve_flags) {
            Ok(ve) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(Errno::Exist);
                }
                ve
            }
            Err(Errno::NoEnt) if flags.contains(OpenFlags::CREAT) => {
                let (dir, name) = vresolve_parent(at, path_str)?;
                let vn = dir
                    .vnode()
                    .create(&name, VAttr::new(VnodeType::Reg, 0o644))?;
                let ve = Ventry::new(&name, vn);
                dir.link_child(&ve);
                ve
            }
            Err(e) => return Err(e),
        };

        let vnode = ventry.vnode().clone();
        if vnode.is_dir() && flags.writable() {
            return Err(Errno::IsDir);
        }

        vnode.open(flags.bits())?;
        let handle = match vnode.ops().open_file(&vnode, flags.bits()) {
            Ok(h) => h,
            Err(e) => {
                let _ = vnode.close();
                return Err(e);
            }
        };

        if flags.contains(OpenFlags::TRUNC) && flags.writable() && !vnode.is_dir() {
            vnode.truncate(0)?;
        }

        Ok(Arc::new(File {
            backing: FileBacking::Vnode { ventry },
            state: Mutex::new(FileState {
                offset: 0,
                flags,
                closed: false,
            }),
            handle: SpinLock::new(handle),
        }))
    }

    /// Creates a connected (read, write) pipe pair.
    pub fn pipe_pair(flags: OpenFlags) -> (Arc<File>, Arc<File>) {
        let pipe = Pipe::new();
        let mk = |writer: bool| {
            Arc::new(File {
                backing: FileBacking::Pipe {
                    pipe: pipe.clone(),
                    writer,
                },
                state: Mutex::new(FileState {
                    offset: 0,
                    flags,
                    closed: false,
                }),
                handle: SpinLock::new(None),
            })
        };
        (mk(false), mk(true))
    }

    /// Returns the backing ventry for vnode files.
    pub fn ventry(&self) -> Option<Arc<Ventry>> {
        match &self.backing {
            FileBacking::Vnode { ventry } => Some(ventry.clone()),
            FileBacking::Pipe { .. } => None,
        }
    }

    /// Returns the open flags.
    pub fn flags(&self) -> OpenFlags {
        self.state.lock().flags
    }

    /// Updates the status flags (fcntl F_SETFL subset).
    pub fn set_status_flags(&self, flags: OpenFlags) {
        let mut state = self.state.lock();
        let keep = state.flags & (OpenFlags::WRONLY | OpenFlags::RDWR | OpenFlags::CLOEXEC);
        state.flags = keep | (flags & (OpenFlags::APPEND | OpenFlags::NONBLOCK));
    }

    /// Returns the current offset.
    pub fn offset(&self) -> usize {
        self.state.lock().offset
    }

    fn check_open(&self) -> KResult<()> {
        if self.state.lock().closed {
            return Err(Errno::BadF);
        }
        Ok(())
    }

    /// Reads at the current offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        self.check_open()?;
        let (offset, flags) = {
            let state = self.state.lock();
            (state.offset, state.flags)
        };
        if !flags.readable() {
            return Err(Errno::BadF);
        }

        let n = match &self.backing {
            FileBacking::Pipe { pipe, writer } => {
                if *writer {
                    return Err(Errno::BadF);
                }
                return pipe.read(buf, flags.contains(OpenFlags::NONBLOCK));
            }
            FileBacking::Vnode { ventry } => {
                let vnode = ventry.vnode();
                let mut handle = self.handle.lock();
                match handle.as_mut() {
                    Some(h) => vnode.ops().read_file(vnode, h, offset, buf)?,
                    None => vnode.read(offset, buf)?,
                }
            }
        };

        self.state.lock().offset = offset + n;
        Ok(n)
    }

    /// Reads at an explicit offset without moving the file offset.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize> {
        self.check_open()?;
        match &self.backing {
            FileBacking::Vnode { ventry } => ventry.vnode().read(offset, buf),
            FileBacking::Pipe { .. } => Err(Errno::SPipe),
        }
    }

    /// Writes at the current offset (or the end under `APPEND`),
    /// advancing it.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        self.check_open()?;
        let flags = self.state.lock().flags;
        if !flags.writable() {
            return Err(Errno::BadF);
        }

        match &self.backing {
            FileBacking::Pipe { pipe, writer } => {
                if !*writer {
                    return Err(Errno::BadF);
                }
                pipe.write(buf, flags.contains(OpenFlags::NONBLOCK))
            }
            FileBacking::Vnode { ventry } => {
                let vnode = ventry.vnode();
                let offset = if flags.contains(OpenFlags::APPEND) {
                    vnode.size()
                } else {
                    self.state.lock().offset
                };

                let mut handle = self.handle.lock();
                let n = match handle.as_mut() {
                    Some(h) => vnode.ops().write_file(vnode, h, offset, buf)?,
                    None => vnode.write(offset, buf)?,
                };
                drop(handle);
                self.state.lock().offset = offset + n;
                Ok(n)
            }
        }
    }

    /// Returns the next directory entry, advancing the offset.
    pub fn readdir_next(&self) -> KResult<Option<DirEntry>> {
        self.check_open()?;
        let FileBacking::Vnode { ventry } = &self.backing else {
            return Err(Errno::NotDir);
        };
        let offset = self.state.lock().offset;
        let entry = ventry.vnode().readdir(offset)?;
        if entry.is_some() {
            self.state.lock().offset = offset + 1;
        }
        Ok(entry)
    }

    /// Repositions the file offset.
    pub fn seek(&self, offset: i64, whence: SeekWhence) -> KResult<usize> {
        self.check_open()?;
        let FileBacking::Vnode { ventry } = &self.backing else {
            return Err(Errno::SPipe);
        };
        let vnode = ventry.vnode();

        // Filesystems with per-open handles control their own seeking.
        {
            let mut handle = self.handle.lock();
            if let Some(h) = handle.as_mut() {
                let whence_raw = match whence {
                    SeekWhence::Set => SEEK_SET,
                    SeekWhence::Cur => SEEK_CUR,
                    SeekWhence::End => SEEK_END,
                };
                let new = vnode.ops().seek_file(vnode, h, offset, whence_raw)?;
                self.state.lock().offset = new;
                return Ok(new);
            }
        }

        let mut state = self.state.lock();
        let base = match whence {
            SeekWhence::Set => 0i64,
            SeekWhence::Cur => state.offset as i64,
            SeekWhence::End => vnode.size() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(Errno::Inval);
        }
        state.offset = target as usize;
        Ok(state.offset)
    }

    /// Returns a stat snapshot of the backing vnode.
    pub fn stat(&self) -> KResult<crate::vnode::VnStat> {
        self.check_open()?;
        match &self.backing {
            FileBacking::Vnode { ventry } => Ok(ventry.vnode().stat()),
            FileBacking::Pipe { .. } => Err(Errno::BadF),
        }
    }

    /// Truncates the backing file.
    pub fn truncate(&self, len: usize) -> KResult<()> {
        self.check_open()?;
        if !self.state.lock().flags.writable() {
            return Err(Errno::BadF);
        }
        match &self.backing {
            FileBacking::Vnode { ventry } => ventry.vnode().truncate(len),
            FileBacking::Pipe { .. } => Err(Errno::Inval),
        }
    }

    /// Device control. No common requests are implemented at this layer.
    pub fn ioctl(&self, _request: u64, _arg: usize) -> KResult<usize> {
        self.check_open()?;
        Err(Errno::NotSup)
    }

    /// Closes the file. Idempotent: the second close is an error but has
    /// no effect.
    pub fn close(&self) -> KResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Errno::BadF);
            }
            state.closed = true;
        }
        match &self.backing {
            FileBacking::Pipe { pipe, writer } => {
                pipe.close_end(*writer);
                Ok(())
            }
            FileBacking::Vnode { ventry } => {
                let vnode = ventry.vnode();
                if let Some(handle) = self.handle.lock().take() {
                    vnode.ops().close_file(vnode, handle)?;
                }
                vnode.close()
            }
        }
    }

    /// Poll readiness: (readable, writable, hangup).
    pub fn poll(&self) -> (bool, bool, bool) {
        match &self.backing {
            FileBacking::Pipe { pipe, writer } => {
                let inner = pipe.inner.lock();
                if *writer {
                    (false, inner.buf.len() < PIPE_CAPACITY, inner.readers == 0)
                } else {
                    (!inner.buf.is_empty(), false, inner.writers == 0)
                }
            }
            FileBacking::Vnode { ventry } => {
                let offset = self.state.lock().offset;
                let (readable, eof) = ventry.vnode().read_ready(offset);
                (readable > 0 || eof, true, false)
            }
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let closed = self.state.lock().closed;
        if !closed {
            let _ = self.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Unlink helper used by the syscall layer
// ---------------------------------------------------------------------------

/// Removes the directory entry at `path` (files and symlinks).
pub fn unlink_path(at: Option<Arc<Ventry>>, path_str: &str) -> KResult<()> {
    let ve = vresolve(at.clone(), path_str, VresolveFlags::NOFOLLOW)?;
    if ve.vnode().is_dir() {
        return Err(Errno::IsDir);
    }
    let parent = ve.parent().ok_or(Errno::Busy)?;
    parent.vnode().unlink(&ve.name(), ve.vnode())?;
    vcache_remove(&parent, &ve.name());
    parent.unlink_child(&ve);
    Ok(())
}

/// Removes the empty directory at `path`.
pub fn rmdir_path(at: Option<Arc<Ventry>>, path_str: &str) -> KResult<()> {
    let ve = vresolve(at.clone(), path_str, VresolveFlags::NOFOLLOW)?;
    if !ve.vnode().is_dir() {
        return Err(Errno::NotDir);
    }
    if ve.flags().contains(crate::ventry::VeFlags::FSROOT)
        || ve.flags().contains(crate::ventry::VeFlags::MOUNT)
    {
        return Err(Errno::Busy);
    }
    let parent = ve.parent().ok_or(Errno::Busy)?;
    parent.vnode().rmdir(&ve.name(), ve.vnode())?;
    vcache_remove(&parent, &ve.name());
    parent.unlink_child(&ve);
    Ok(())
}

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

/// Maximum descriptors per process.
pub const FD_MAX: usize = 1024;

/// A process's file-descriptor table.
pub struct FdTable {
    files: SpinLock<Vec<Option<Arc<File>>>>,
}

impl FdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            files: SpinLock::new(Vec::new()),
        }
    }

    /// Installs a file at the lowest free descriptor.
    pub fn alloc(&self, file: Arc<File>) -> KResult<usize> {
        let mut files = self.files.lock();
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        if files.len() >= FD_MAX {
            return Err(Errno::MFile);
        }
        files.push(Some(file));
        Ok(files.len() - 1)
    }

    /// Returns the file for a descriptor.
    pub fn get(&self, fd: usize) -> KResult<Arc<File>> {
        self.files
            .lock()
            .get(fd)
            .cloned()
            .flatten()
            .ok_or(Errno::BadF)
    }

    /// Removes and returns the file for a descriptor.
    pub fn take(&self, fd: usize) -> KResult<Arc<File>> {
        let mut files = self.files.lock();
        files
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(Errno::BadF)
    }

    /// Duplicates `fd` onto the lowest free descriptor.
    pub fn dup(&self, fd: usize) -> KResult<usize> {
        let file = self.get(fd)?;
        self.alloc(file)
    }

    /// Duplicates `oldfd` onto `newfd`, closing `newfd` first if open.
    pub fn dup2(&self, oldfd: usize, newfd: usize) -> KResult<usize> {
        if newfd >= FD_MAX {
            return Err(Errno::BadF);
        }
        let file = self.get(oldfd)?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        let old = {
            let mut files = self.files.lock();
            if files.len() <= newfd {
                files.resize(newfd + 1, None);
            }
            files[newfd].replace(file)
        };
        if let Some(old) = old {
            let _ = old.close();
        }
        Ok(newfd)
    }

    /// Closes every descriptor (process exit).
    pub fn close_all(&self) {
        let files = core::mem::take(&mut *self.files.lock());
        for file in files.into_iter().flatten() {
            let _ = file.close();
        }
    }

    /// Returns a snapshot of open descriptors (fork support).
    pub fn clone_files(&self) -> Vec<(usize, Arc<File>)> {
        self.files
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(fd, f)| f.clone().map(|f| (fd, f)))
            .collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::tests::ensure_root;
    use crate::mount::{VresolveFlags, vresolve};
    use crate::ventry::Ventry;
    use crate::vnode::{VAttr, VnodeType};

    fn mkdir_at(path: &str) {
        let (dir, name) = vresolve_parent(None, path).unwrap();
        let vn = dir
            .vnode()
            .mkdir(&name, VAttr::new(VnodeType::Dir, 0o755))
            .unwrap();
        let ve = Ventry::new(&name, vn);
        dir.link_child(&ve);
    }

    #[test]
    fn open_write_seek_read_roundtrip() {
        ensure_root();
        mkdir_at("/file_test");
        let file = File::open(
            None,
            "/file_test/data",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();

        let payload = b"the quick brown fox";
        assert_eq!(file.write(payload).unwrap(), payload.len());
        assert_eq!(file.offset(), payload.len());

        file.seek(0, SeekWhence::Set).unwrap();
        let mut buf = [0u8; 32];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
        file.close().unwrap();
    }

    #[test]
    fn exclusive_create_fails_on_existing() {
        ensure_root();
        mkdir_at("/file_excl");
        let f = File::open(
            None,
            "/file_excl/x",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        f.close().unwrap();

        assert_eq!(
            File::open(
                None,
                "/file_excl/x",
                OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL
            )
            .unwrap_err(),
            Errno::Exist
        );
    }

    #[test]
    fn append_writes_at_end() {
        ensure_root();
        mkdir_at("/file_append");
        let f = File::open(
            None,
            "/file_append/log",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        f.write(b"aaa").unwrap();
        f.close().unwrap();

        let f = File::open(
            None,
            "/file_append/log",
            OpenFlags::RDWR | OpenFlags::APPEND,
        )
        .unwrap();
        f.write(b"bbb").unwrap();
        f.seek(0, SeekWhence::Set).unwrap();
        let mut buf = [0u8; 16];
        let n = f.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"aaabbb");
        f.close().unwrap();
    }

    #[test]
    fn truncate_on_open() {
        ensure_root();
        mkdir_at("/file_trunc");
        let f = File::open(
            None,
            "/file_trunc/t",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        f.write(b"0123456789").unwrap();
        f.close().unwrap();

        let f = File::open(
            None,
            "/file_trunc/t",
            OpenFlags::RDWR | OpenFlags::TRUNC,
        )
        .unwrap();
        assert_eq!(f.stat().unwrap().size, 0);
        f.close().unwrap();
    }

    #[test]
    fn closed_file_rejects_io() {
        ensure_root();
        mkdir_at("/file_closed");
        let f = File::open(
            None,
            "/file_closed/c",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        f.close().unwrap();
        assert_eq!(f.close(), Err(Errno::BadF));
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf), Err(Errno::BadF));
    }

    #[test]
    fn unlink_then_resolve_fails() {
        ensure_root();
        mkdir_at("/file_unlink");
        let f = File::open(
            None,
            "/file_unlink/gone",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        f.close().unwrap();

        unlink_path(None, "/file_unlink/gone").unwrap();
        assert_eq!(
            vresolve(None, "/file_unlink/gone", VresolveFlags::empty()).unwrap_err(),
            Errno::NoEnt
        );
    }

    #[test]
    fn pipe_transfers_bytes() {
        let (r, w) = File::pipe_pair(OpenFlags::RDWR);
        assert_eq!(w.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        // Closing the writer yields EOF on the reader.
        w.close().unwrap();
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        r.close().unwrap();
    }

    #[test]
    fn fd_table_lowest_free_and_dup() {
        ensure_root();
        mkdir_at("/fd_test");
        let table = FdTable::new();
        let f = File::open(
            None,
            "/fd_test/a",
            OpenFlags::RDWR | OpenFlags::CREAT,
        )
        .unwrap();
        let fd0 = table.alloc(f.clone()).unwrap();
        let fd1 = table.alloc(f.clone()).unwrap();
        assert_eq!((fd0, fd1), (0, 1));

        table.take(0).unwrap();
        assert_eq!(table.alloc(f.clone()).unwrap(), 0);

        let fd = table.dup(1).unwrap();
        assert_eq!(fd, 2);
        assert_eq!(table.dup2(1, 10).unwrap(), 10);
        assert!(table.get(10).is_ok());
        assert_eq!(table.get(55).unwrap_err(), Errno::BadF);
        table.close_all();
    }
}
