//! In-core file objects.
//!
//! A [`Vnode`] is the per-file kernel object: one per distinct file,
//! shared across every link. Filesystem behavior is supplied through the
//! [`VnodeOps`] vtable; the wrapper methods here enforce the locking
//! discipline (metadata under the vnode lock, filesystem calls under the
//! data read/write lock) and the reference rules (`nlink`, `nopen`,
//! cleanup on last drop).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use lepton_core::clock::{TimeVal, clock_micro_time};
use lepton_core::sync::{RwLock, SpinLock, WaitQueue};
use lepton_core::{Errno, KResult};

/// Vnode identifier, unique within a filesystem instance.
pub type VnodeId = u64;

/// Per-open file handle state produced by [`VnodeOps::open_file`].
pub type FileHandle = Box<dyn Any + Send>;

/// File object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Symbolic link.
    Lnk,
    /// Block device.
    Blk,
    /// Character device.
    Chr,
    /// Named pipe.
    Fifo,
    /// Socket.
    Sock,
}

bitflags! {
    /// Vnode state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnFlags: u32 {
        /// Backing data has been loaded.
        const LOADED = 1 << 0;
        /// In-core state is newer than backing store.
        const DIRTY = 1 << 1;
        /// At least one open file references the vnode.
        const OPEN = 1 << 2;
    }
}

/// Attributes for node creation.
#[derive(Debug, Clone, Copy)]
pub struct VAttr {
    /// Node type.
    pub vtype: VnodeType,
    /// Permission bits.
    pub mode: u32,
}

impl VAttr {
    /// Creates attributes for the given type and mode.
    pub const fn new(vtype: VnodeType, mode: u32) -> Self {
        Self { vtype, mode }
    }
}

/// A directory entry as produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Vnode id of the entry.
    pub id: VnodeId,
    /// Entry type.
    pub vtype: VnodeType,
    /// Entry name.
    pub name: String,
}

/// A point-in-time stat snapshot.
#[derive(Debug, Clone, Copy)]
pub struct VnStat {
    /// Vnode id.
    pub id: VnodeId,
    /// Node type.
    pub vtype: VnodeType,
    /// Permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: usize,
    /// Hard link count.
    pub nlink: u32,
    /// Allocated blocks.
    pub blocks: u64,
    /// Last access time.
    pub atime: TimeVal,
    /// Last modification time.
    pub mtime: TimeVal,
    /// Last status change time.
    pub ctime: TimeVal,
}

/// Mutable vnode metadata, guarded by the vnode lock.
pub struct VnodeMeta {
    /// Permission bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: usize,
    /// Hard link count.
    pub nlink: u32,
    /// Open file count.
    pub nopen: u32,
    /// Allocated blocks.
    pub blocks: u64,
    /// State flags.
    pub flags: VnFlags,
    /// Last access time.
    pub atime: TimeVal,
    /// Last modification time.
    pub mtime: TimeVal,
    /// Last status change time.
    pub ctime: TimeVal,
}

/// Filesystem operations on a vnode.
///
/// The `*_file` hooks let a filesystem attach per-open handle state and
/// override the common file paths (procfs seqfiles use this); the
/// defaults fall through to the plain vnode operations.
pub trait VnodeOps: Send + Sync {
    /// Called when an open file starts referencing the vnode.
    fn open(&self, vn: &Vnode, flags: u32) -> KResult<()> {
        let _ = (vn, flags);
        Ok(())
    }

    /// Called when an open file stops referencing the vnode.
    fn close(&self, vn: &Vnode) -> KResult<()> {
        let _ = vn;
        Ok(())
    }

    /// Reads from the file at `off` into `buf`, returning bytes read.
    fn read(&self, vn: &Vnode, off: usize, buf: &mut [u8]) -> KResult<usize> {
        let _ = (vn, off, buf);
        Err(Errno::NotSup)
    }

    /// Writes `buf` at `off`, returning bytes written.
    fn write(&self, vn: &Vnode, off: usize, buf: &[u8]) -> KResult<usize> {
        let _ = (vn, off, buf);
        Err(Errno::NotSup)
    }

    /// Returns the directory entry at ordinal `off`, or `None` at EOF.
    fn readdir(&self, vn: &Vnode, off: usize) -> KResult<Option<DirEntry>> {
        let _ = (vn, off);
        Err(Errno::NotDir)
    }

    /// Looks up `name` in a directory, returning the child vnode.
    fn lookup(&self, vn: &Vnode, name: &str) -> KResult<Arc<Vnode>> {
        let _ = (vn, name);
        Err(Errno::NotDir)
    }

    /// Creates a regular file.
    fn create(&self, vn: &Vnode, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        let _ = (vn, name, attr);
        Err(Errno::NotSup)
    }

    /// Creates a device/fifo/socket node.
    fn mknod(&self, vn: &Vnode, name: &str, attr: VAttr, dev: u64) -> KResult<Arc<Vnode>> {
        let _ = (vn, name, attr, dev);
        Err(Errno::NotSup)
    }

    /// Creates a symbolic link containing `target`.
    fn symlink(&self, vn: &Vnode, name: &str, target: &str) -> KResult<Arc<Vnode>> {
        let _ = (vn, name, target);
        Err(Errno::NotSup)
    }

    /// Links an existing vnode under a new name.
    fn hardlink(&self, vn: &Vnode, name: &str, target: &Arc<Vnode>) -> KResult<()> {
        let _ = (vn, name, target);
        Err(Errno::NotSup)
    }

    /// Removes a non-directory entry.
    fn unlink(&self, vn: &Vnode, name: &str, child: &Arc<Vnode>) -> KResult<()> {
        let _ = (vn, name, child);
        Err(Errno::NotSup)
    }

    /// Creates a directory.
    fn mkdir(&self, vn: &Vnode, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        let _ = (vn, name, attr);
        Err(Errno::NotSup)
    }

    /// Removes an empty directory.
    fn rmdir(&self, vn: &Vnode, name: &str, child: &Arc<Vnode>) -> KResult<()> {
        let _ = (vn, name, child);
        Err(Errno::NotSup)
    }

    /// Reads a symlink's target.
    fn readlink(&self, vn: &Vnode) -> KResult<String> {
        let _ = vn;
        Err(Errno::Inval)
    }

    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, vn: &Vnode, len: usize) -> KResult<()> {
        let _ = (vn, len);
        Err(Errno::NotSup)
    }

    /// Last-reference cleanup hook. Must tolerate any calling context.
    fn cleanup(&self, vn: &Vnode) {
        let _ = vn;
    }

    // -- per-open file hooks -------------------------------------------

    /// Opens per-file handle state (e.g., a seqfile iterator).
    fn open_file(&self, vn: &Vnode, flags: u32) -> KResult<Option<FileHandle>> {
        let _ = (vn, flags);
        Ok(None)
    }

    /// Releases per-file handle state.
    fn close_file(&self, vn: &Vnode, handle: FileHandle) -> KResult<()> {
        let _ = (vn, handle);
        Ok(())
    }

    /// Reads through a per-file handle. Only called when `open_file`
    /// returned a handle.
    fn read_file(
        &self,
        vn: &Vnode,
        handle: &mut FileHandle,
        off: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let _ = (vn, handle, off, buf);
        Err(Errno::NotSup)
    }

    /// Writes through a per-file handle.
    fn write_file(
        &self,
        vn: &Vnode,
        handle: &mut FileHandle,
        off: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        let _ = (vn, handle, off, buf);
        Err(Errno::NotSup)
    }

    /// Seeks through a per-file handle, returning the new offset.
    fn seek_file(
        &self,
        vn: &Vnode,
        handle: &mut FileHandle,
        offset: i64,
        whence: u32,
    ) -> KResult<usize> {
        let _ = (vn, handle, offset, whence);
        Err(Errno::NotSup)
    }
}

static NEXT_VNODE_SEQ: AtomicU64 = AtomicU64::new(1);

/// The in-core file object.
pub struct Vnode {
    /// Filesystem-assigned id.
    pub id: VnodeId,
    /// Node type (immutable after creation).
    pub vtype: VnodeType,
    meta: SpinLock<VnodeMeta>,
    /// Serializes filesystem data operations: shared for readers,
    /// exclusive for writers.
    data_lock: RwLock<()>,
    ops: Arc<dyn VnodeOps>,
    /// Filesystem-private node state.
    data: SpinLock<Option<Arc<dyn Any + Send + Sync>>>,
    /// Hint flags for ventries linking this vnode (procfs ephemerals set
    /// NOCACHE | NOSAVE).
    pub ve_hint: crate::ventry::VeFlags,
    /// kevent listeners interested in this vnode.
    knotes: SpinLock<alloc::vec::Vec<Arc<WaitQueue>>>,
    /// Global sequence for diagnostics.
    pub seq: u64,
}

impl Vnode {
    /// Creates a vnode with the given identity, attributes, and ops.
    pub fn new(id: VnodeId, attr: VAttr, ops: Arc<dyn VnodeOps>) -> Arc<Vnode> {
        Self::with_hint(id, attr, ops, crate::ventry::VeFlags::empty())
    }

    /// Creates a vnode whose ventries should carry the given flags.
    pub fn with_hint(
        id: VnodeId,
        attr: VAttr,
        ops: Arc<dyn VnodeOps>,
        ve_hint: crate::ventry::VeFlags,
    ) -> Arc<Vnode> {
        let now = clock_micro_time();
        Arc::new(Vnode {
            id,
            vtype: attr.vtype,
            meta: SpinLock::new(VnodeMeta {
                mode: attr.mode,
                size: 0,
                nlink: 1,
                nopen: 0,
                blocks: 0,
                flags: VnFlags::LOADED,
                atime: now,
                mtime: now,
                ctime: now,
            }),
            data_lock: RwLock::new(()),
            ops,
            data: SpinLock::new(None),
            ve_hint,
            knotes: SpinLock::new(alloc::vec::Vec::new()),
            seq: NEXT_VNODE_SEQ.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Returns the ops vtable.
    pub fn ops(&self) -> &Arc<dyn VnodeOps> {
        &self.ops
    }

    /// Attaches filesystem-private node state.
    pub fn set_private(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.data.lock() = Some(data);
    }

    /// Returns the filesystem-private node state downcast to `T`.
    pub fn private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Locks and returns the metadata.
    pub fn meta(&self) -> lepton_core::sync::SpinLockGuard<'_, VnodeMeta> {
        self.meta.lock()
    }

    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.vtype == VnodeType::Dir
    }

    /// Returns the current size.
    pub fn size(&self) -> usize {
        self.meta.lock().size
    }

    /// Returns a stat snapshot.
    pub fn stat(&self) -> VnStat {
        let meta = self.meta.lock();
        VnStat {
            id: self.id,
            vtype: self.vtype,
            mode: meta.mode,
            size: meta.size,
            nlink: meta.nlink,
            blocks: meta.blocks,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        }
    }

    /// Opens the vnode for an open-file reference.
    pub fn open(&self, flags: u32) -> KResult<()> {
        self.ops.open(self, flags)?;
        let mut meta = self.meta.lock();
        meta.nopen += 1;
        meta.flags.insert(VnFlags::OPEN);
        Ok(())
    }

    /// Drops an open-file reference.
    pub fn close(&self) -> KResult<()> {
        self.ops.close(self)?;
        let mut meta = self.meta.lock();
        assert!(meta.nopen > 0, "vnode close without open");
        meta.nopen -= 1;
        if meta.nopen == 0 {
            meta.flags.remove(VnFlags::OPEN);
        }
        Ok(())
    }

    /// Reads at `off` under the data read lock.
    pub fn read(&self, off: usize, buf: &mut [u8]) -> KResult<usize> {
        if self.is_dir() {
            return Err(Errno::IsDir);
        }
        let _guard = self.data_lock.read();
        let n = self.ops.read(self, off, buf)?;
        self.meta.lock().atime = clock_micro_time();
        Ok(n)
    }

    /// Writes at `off` under the data write lock, updating size/mtime.
    pub fn write(&self, off: usize, buf: &[u8]) -> KResult<usize> {
        if self.is_dir() {
            return Err(Errno::IsDir);
        }
        let _guard = self.data_lock.write();
        let n = self.ops.write(self, off, buf)?;
        let mut meta = self.meta.lock();
        meta.size = meta.size.max(off + n);
        meta.mtime = clock_micro_time();
        meta.flags.insert(VnFlags::DIRTY);
        drop(meta);
        self.notify_knotes();
        Ok(n)
    }

    /// Returns the directory entry at ordinal `off`.
    pub fn readdir(&self, off: usize) -> KResult<Option<DirEntry>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.read();
        self.ops.readdir(self, off)
    }

    /// Looks up a child under the data read lock.
    pub fn lookup(&self, name: &str) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.read();
        self.ops.lookup(self, name)
    }

    /// Creates a regular file under the data write lock.
    pub fn create(&self, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.create(self, name, attr)
    }

    /// Creates a device node under the data write lock.
    pub fn mknod(&self, name: &str, attr: VAttr, dev: u64) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.mknod(self, name, attr, dev)
    }

    /// Creates a symlink under the data write lock.
    pub fn symlink(&self, name: &str, target: &str) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.symlink(self, name, target)
    }

    /// Adds a hard link to `target` under the data write lock.
    pub fn hardlink(&self, name: &str, target: &Arc<Vnode>) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.hardlink(self, name, target)?;
        target.meta.lock().nlink += 1;
        Ok(())
    }

    /// Removes an entry under the data write lock.
    pub fn unlink(&self, name: &str, child: &Arc<Vnode>) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        if child.is_dir() {
            return Err(Errno::IsDir);
        }
        let _guard = self.data_lock.write();
        self.ops.unlink(self, name, child)?;
        let mut meta = child.meta.lock();
        meta.nlink = meta.nlink.saturating_sub(1);
        drop(meta);
        child.notify_knotes();
        Ok(())
    }

    /// Creates a directory under the data write lock.
    pub fn mkdir(&self, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.mkdir(self, name, attr)
    }

    /// Removes an empty directory under the data write lock.
    pub fn rmdir(&self, name: &str, child: &Arc<Vnode>) -> KResult<()> {
        if !self.is_dir() {
            return Err(Errno::NotDir);
        }
        if !child.is_dir() {
            return Err(Errno::NotDir);
        }
        let _guard = self.data_lock.write();
        self.ops.rmdir(self, name, child)
    }

    /// Reads a symlink target.
    pub fn readlink(&self) -> KResult<String> {
        if self.vtype != VnodeType::Lnk {
            return Err(Errno::Inval);
        }
        let _guard = self.data_lock.read();
        self.ops.readlink(self)
    }

    /// Truncates the file to `len`.
    pub fn truncate(&self, len: usize) -> KResult<()> {
        if self.is_dir() {
            return Err(Errno::IsDir);
        }
        let _guard = self.data_lock.write();
        self.ops.truncate(self, len)?;
        let mut meta = self.meta.lock();
        meta.size = len;
        meta.mtime = clock_micro_time();
        Ok(())
    }

    // -- kevent integration --------------------------------------------

    /// Registers a listener queue notified on data-changing events.
    pub fn knote_attach(&self, wq: Arc<WaitQueue>) {
        self.knotes.lock().push(wq);
    }

    fn notify_knotes(&self) {
        for wq in self.knotes.lock().iter() {
            wq.wake_all();
        }
    }

    /// `EVFILT_READ` readiness: readable bytes past `offset`, and
    /// whether the reader is at EOF of an unlinked file.
    pub fn read_ready(&self, offset: usize) -> (usize, bool) {
        let meta = self.meta.lock();
        let readable = meta.size.saturating_sub(offset);
        let eof = meta.nlink == 0;
        (readable, eof)
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        self.ops.cleanup(self);
    }
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("type", &self.vtype)
            .finish()
    }
}
