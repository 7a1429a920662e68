//! Process information filesystem.
//!
//! procfs is a modified ramfs: static directories are plain ramfs nodes,
//! dynamic files and directories carry a [`ProcfsObject`] whose
//! [`ProcfsOps`] are consulted on open/read/readdir/lookup. Objects are
//! registered into a global tree that is reconstructed into a private
//! ramfs instance at every mount; later registrations are propagated
//! into already-mounted instances eagerly. Dynamic directory lookups
//! produce *ephemeral* objects destroyed when their vnode is cleaned up.

pub mod seqfile;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;

use alloc::collections::BTreeMap;
use lepton_core::sync::SpinLock;
use lepton_core::{Errno, KResult, kdebug, kerror};

use crate::mount::VfsOps;
use crate::path;
use crate::ramfs::{Ramfs, RamfsNode};
use crate::ventry::VeFlags;
use crate::vnode::{DirEntry, FileHandle, VAttr, Vnode, VnodeOps, VnodeType};

use seqfile::{SeqFile, SeqSource};

// ---------------------------------------------------------------------------
// Objects and operations
// ---------------------------------------------------------------------------

/// Operations of a dynamic procfs object.
///
/// Files implement `read` (and optionally `write`/`lseek`/`open`/
/// `close`); directories implement `lookup` and `readdir`. Handles
/// returned by `open` ride on the open file and are passed back to every
/// subsequent operation.
pub trait ProcfsOps: Send + Sync {
    /// Opens per-file state.
    fn open(&self, obj: &Arc<ProcfsObject>, flags: u32) -> KResult<Option<Box<dyn Any + Send>>> {
        let _ = (obj, flags);
        Ok(None)
    }

    /// Releases per-file state.
    fn close(
        &self,
        obj: &Arc<ProcfsObject>,
        handle: Option<Box<dyn Any + Send>>,
    ) -> KResult<()> {
        let _ = (obj, handle);
        Ok(())
    }

    /// Reads file content at `off`.
    fn read(
        &self,
        obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        off: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let _ = (obj, handle, off, buf);
        Err(Errno::NotSup)
    }

    /// Writes file content at `off`.
    fn write(
        &self,
        obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        off: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        let _ = (obj, handle, off, buf);
        Err(Errno::NotSup)
    }

    /// Repositions a per-file handle.
    fn lseek(
        &self,
        obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        offset: i64,
        whence: u32,
    ) -> KResult<usize> {
        let _ = (obj, handle, offset, whence);
        Err(Errno::NotSup)
    }

    /// Returns directory entry `index` as `(name, is_dir)`, or `None` at
    /// the end.
    fn readdir(&self, obj: &Arc<ProcfsObject>, index: usize) -> KResult<Option<(String, bool)>> {
        let _ = (obj, index);
        Err(Errno::NotSup)
    }

    /// Resolves `name` in a dynamic directory to an ephemeral object.
    fn lookup(&self, obj: &Arc<ProcfsObject>, name: &str) -> KResult<Arc<ProcfsObject>> {
        let _ = (obj, name);
        Err(Errno::NoEnt)
    }

    /// Called when an ephemeral object's vnode is cleaned up.
    fn cleanup(&self, obj: &Arc<ProcfsObject>) {
        let _ = obj;
    }
}

/// A registered (or ephemeral) procfs entry.
pub struct ProcfsObject {
    /// Registration path, or the bare name for ephemeral objects.
    pub path: String,
    ops: Option<Arc<dyn ProcfsOps>>,
    data: SpinLock<Option<Arc<dyn Any + Send + Sync>>>,
    /// Permission bits.
    pub mode: u32,
    /// Directory object.
    pub is_dir: bool,
    /// Pure ramfs directory with no dynamic ops.
    pub is_static: bool,
    /// Created by a dynamic lookup; freed on vnode cleanup.
    pub is_ephemeral: bool,
    /// Backing nodes in mounted instances: (instance, parent node, node).
    nodes: SpinLock<Vec<(Weak<Ramfs>, Arc<RamfsNode>, Arc<RamfsNode>)>>,
}

impl ProcfsObject {
    fn new(
        path: &str,
        ops: Option<Arc<dyn ProcfsOps>>,
        data: Option<Arc<dyn Any + Send + Sync>>,
        mode: u32,
        is_dir: bool,
        is_static: bool,
    ) -> Arc<ProcfsObject> {
        Arc::new(ProcfsObject {
            path: String::from(path),
            ops,
            data: SpinLock::new(data),
            mode,
            is_dir,
            is_static,
            is_ephemeral: false,
            nodes: SpinLock::new(Vec::new()),
        })
    }

    /// Returns the final path component.
    pub fn name(&self) -> &str {
        path::basename(&self.path)
    }

    /// Returns the registration-time private data downcast to `T`.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    fn ops(&self) -> KResult<&Arc<dyn ProcfsOps>> {
        self.ops.as_ref().ok_or(Errno::NotSup)
    }
}

/// Creates an ephemeral object, as returned by a dynamic directory's
/// `lookup`.
pub fn procfs_ephemeral_object(
    name: &str,
    ops: Arc<dyn ProcfsOps>,
    data: Option<Arc<dyn Any + Send + Sync>>,
    mode: u32,
    is_dir: bool,
) -> Arc<ProcfsObject> {
    Arc::new(ProcfsObject {
        path: String::from(name),
        ops: Some(ops),
        data: SpinLock::new(data),
        mode,
        is_dir,
        is_static: false,
        is_ephemeral: true,
        nodes: SpinLock::new(Vec::new()),
    })
}

/// Copies `text[off..]` into `buf` — the common body of static-text
/// `read` implementations.
pub fn procfs_read_string(text: &str, off: usize, buf: &mut [u8]) -> usize {
    let bytes = text.as_bytes();
    if off >= bytes.len() {
        return 0;
    }
    let n = buf.len().min(bytes.len() - off);
    buf[..n].copy_from_slice(&bytes[off..off + n]);
    n
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct DirEnt {
    name: String,
    obj: Arc<ProcfsObject>,
}

struct DirReg {
    obj: Arc<ProcfsObject>,
    entries: Vec<DirEnt>,
}

struct Registry {
    /// path → directory (including "/").
    dirs: BTreeMap<String, Arc<SpinLock<DirReg>>>,
}

static REGISTRY: SpinLock<Option<Registry>> = SpinLock::new(None);

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    let registry = guard.get_or_insert_with(|| {
        let root_obj = ProcfsObject::new("/", None, None, 0o755, true, true);
        let mut dirs = BTreeMap::new();
        dirs.insert(
            String::from("/"),
            Arc::new(SpinLock::new(DirReg {
                obj: root_obj,
                entries: Vec::new(),
            })),
        );
        Registry { dirs }
    });
    f(registry)
}

fn node_attr(obj: &ProcfsObject) -> VAttr {
    let vtype = if obj.is_dir { VnodeType::Dir } else { VnodeType::Reg };
    VAttr::new(vtype, obj.mode)
}

/// Creates the backing ramfs node for `obj` under `parent` in one
/// mounted instance.
fn create_node_in(
    fs: &Arc<Ramfs>,
    parent: &Arc<RamfsNode>,
    obj: &Arc<ProcfsObject>,
) -> KResult<Arc<RamfsNode>> {
    let node = fs.alloc_node(node_attr(obj));
    *node.data.lock() = Some(obj.clone() as Arc<dyn Any + Send + Sync>);
    // procfs entries are never cached: unregistration must not leave
    // stale resolutions behind.
    *node.ve_hint.lock() = VeFlags::NOCACHE;
    fs.add_dirent(parent, obj.name(), node.clone())?;
    obj.nodes
        .lock()
        .push((Arc::downgrade(fs), parent.clone(), node.clone()));
    Ok(node)
}

fn register_object(obj: Arc<ProcfsObject>) -> KResult<()> {
    let dirpath = path::dirname(&obj.path).to_string();
    let name = obj.name().to_string();
    if name == "." || name == ".." {
        return Err(Errno::Inval);
    }

    let dir = with_registry(|reg| reg.dirs.get(&dirpath).cloned())
        .ok_or_else(|| {
            kerror!("procfs: parent directory does not exist: {dirpath}");
            Errno::NoEnt
        })?;

    {
        let mut dir_guard = dir.lock();
        if dir_guard.entries.iter().any(|e| e.name == name) {
            kerror!("procfs: object already exists: {}", obj.path);
            return Err(Errno::Exist);
        }
        dir_guard.entries.push(DirEnt {
            name: name.clone(),
            obj: obj.clone(),
        });
    }

    if obj.is_dir {
        with_registry(|reg| {
            reg.dirs.insert(
                obj.path.clone(),
                Arc::new(SpinLock::new(DirReg {
                    obj: obj.clone(),
                    entries: Vec::new(),
                })),
            );
        });
    }

    // Already-mounted instances get the node eagerly.
    let parent_obj = dir.lock().obj.clone();
    let backing: Vec<_> = parent_obj.nodes.lock().clone();
    for (fs, _parent_of_parent, dirnode) in backing {
        if let Some(fs) = fs.upgrade() {
            if let Err(e) = create_node_in(&fs, &dirnode, &obj) {
                kerror!("procfs: failed to materialize {}: {e}", obj.path);
            }
        }
    }

    kdebug!("procfs: registered {}", obj.path);
    Ok(())
}

fn validate_path(p: &str) -> KResult<()> {
    if !path::is_absolute(p) || path::is_root(p) {
        kerror!("procfs: path must be absolute and non-root: {p}");
        return Err(Errno::Inval);
    }
    Ok(())
}

/// Registers a dynamic file. The object's ops must implement `read`;
/// directory operations are never consulted on file nodes.
pub fn procfs_register_file(
    p: &str,
    ops: Arc<dyn ProcfsOps>,
    data: Option<Arc<dyn Any + Send + Sync>>,
    mode: u32,
) -> KResult<()> {
    validate_path(p)?;
    register_object(ProcfsObject::new(p, Some(ops), data, mode, false, false))
}

/// Registers a dynamic directory. The object's ops must implement
/// `lookup` and `readdir`.
pub fn procfs_register_dir(
    p: &str,
    ops: Arc<dyn ProcfsOps>,
    data: Option<Arc<dyn Any + Send + Sync>>,
    mode: u32,
) -> KResult<()> {
    validate_path(p)?;
    register_object(ProcfsObject::new(p, Some(ops), data, mode, true, false))
}

/// Registers a persistent directory backed purely by ramfs nodes.
pub fn procfs_register_static_dir(p: &str, mode: u32) -> KResult<()> {
    validate_path(p)?;
    register_object(ProcfsObject::new(p, None, None, mode, true, true))
}

/// Removes a registered object. Directories must be empty.
pub fn procfs_unregister(p: &str) -> KResult<()> {
    validate_path(p)?;
    let dirpath = path::dirname(p).to_string();
    let name = path::basename(p).to_string();

    let dir = with_registry(|reg| reg.dirs.get(&dirpath).cloned()).ok_or(Errno::NoEnt)?;
    let obj = {
        let mut dir_guard = dir.lock();
        let pos = dir_guard
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(Errno::NoEnt)?;
        let obj = dir_guard.entries[pos].obj.clone();
        if obj.is_dir {
            let empty = with_registry(|reg| {
                reg.dirs
                    .get(&obj.path)
                    .map_or(true, |d| d.lock().entries.is_empty())
            });
            if !empty {
                return Err(Errno::Busy);
            }
        }
        dir_guard.entries.remove(pos);
        obj
    };

    if obj.is_dir {
        with_registry(|reg| {
            reg.dirs.remove(&obj.path);
        });
    }

    // Drop the backing nodes from every mounted instance.
    let backing = core::mem::take(&mut *obj.nodes.lock());
    for (fs, parent, _node) in backing {
        if let Some(fs) = fs.upgrade() {
            let _ = fs.remove_dirent(&parent, &name);
        }
    }

    kdebug!("procfs: unregistered {p}");
    Ok(())
}

/// Looks up a registered object by path (diagnostics and tests).
pub fn procfs_lookup_object(p: &str) -> Option<Arc<ProcfsObject>> {
    if path::is_root(p) {
        return with_registry(|reg| reg.dirs.get("/").map(|d| d.lock().obj.clone()));
    }
    let dirpath = path::dirname(p).to_string();
    let name = path::basename(p);
    let dir = with_registry(|reg| reg.dirs.get(&dirpath).cloned())?;
    let guard = dir.lock();
    guard
        .entries
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.obj.clone())
}

// ---------------------------------------------------------------------------
// Vnode operations (ramfs overlay)
// ---------------------------------------------------------------------------

struct ProcfsHandle {
    obj: Arc<ProcfsObject>,
    inner: Option<Box<dyn Any + Send>>,
}

struct ProcfsVnops {
    fs: Weak<Ramfs>,
}

impl ProcfsVnops {
    fn ramfs(&self) -> KResult<Arc<Ramfs>> {
        self.fs.upgrade().ok_or(Errno::Nxio)
    }

    /// Returns the dynamic object behind a vnode, if any.
    fn object_of(vn: &Vnode) -> Option<Arc<ProcfsObject>> {
        let node = vn.private::<RamfsNode>()?;
        let data = node.data.lock().clone()?;
        let obj = data.downcast::<ProcfsObject>().ok()?;
        if obj.is_static { None } else { Some(obj) }
    }
}

impl VnodeOps for ProcfsVnops {
    fn read(&self, vn: &Vnode, off: usize, buf: &mut [u8]) -> KResult<usize> {
        match Self::object_of(vn) {
            Some(obj) => obj.ops()?.read(&obj, None, off, buf),
            None => self.ramfs()?.read(vn, off, buf),
        }
    }

    fn write(&self, vn: &Vnode, off: usize, buf: &[u8]) -> KResult<usize> {
        match Self::object_of(vn) {
            Some(obj) => obj.ops()?.write(&obj, None, off, buf),
            None => self.ramfs()?.write(vn, off, buf),
        }
    }

    fn readdir(&self, vn: &Vnode, off: usize) -> KResult<Option<DirEntry>> {
        let Some(obj) = Self::object_of(vn) else {
            return self.ramfs()?.readdir(vn, off);
        };

        // Dynamic directory: synthesize `.` and `..`, then delegate.
        match off {
            0 => Ok(Some(DirEntry {
                id: vn.id,
                vtype: VnodeType::Dir,
                name: String::from("."),
            })),
            1 => Ok(Some(DirEntry {
                id: vn.id,
                vtype: VnodeType::Dir,
                name: String::from(".."),
            })),
            _ => {
                let entry = obj.ops()?.readdir(&obj, off - 2)?;
                Ok(entry.map(|(name, is_dir)| DirEntry {
                    id: 0,
                    vtype: if is_dir { VnodeType::Dir } else { VnodeType::Reg },
                    name,
                }))
            }
        }
    }

    fn lookup(&self, vn: &Vnode, name: &str) -> KResult<Arc<Vnode>> {
        let Some(obj) = Self::object_of(vn) else {
            return self.ramfs()?.lookup(vn, name);
        };

        // Dynamic directory: manufacture an ephemeral node.
        let child = obj.ops()?.lookup(&obj, name)?;
        let fs = self.ramfs()?;
        let node = fs.alloc_node(node_attr(&child));
        *node.data.lock() = Some(child.clone() as Arc<dyn Any + Send + Sync>);
        *node.ve_hint.lock() = VeFlags::NOCACHE | VeFlags::NOSAVE;
        Ok(fs.get_vnode(&node))
    }

    fn readlink(&self, vn: &Vnode) -> KResult<String> {
        self.ramfs()?.readlink(vn)
    }

    fn cleanup(&self, vn: &Vnode) {
        let Some(node) = vn.private::<RamfsNode>() else {
            return;
        };
        let obj = {
            let data = node.data.lock().clone();
            data.and_then(|d| d.downcast::<ProcfsObject>().ok())
        };
        if let Some(obj) = obj {
            if obj.is_ephemeral {
                node.data.lock().take();
                if let Ok(ops) = obj.ops() {
                    ops.cleanup(&obj);
                }
            }
        }
    }

    // Creation through the filesystem interface is disallowed; the
    // `VnodeOps` defaults already reject create/mkdir/unlink/... with
    // ENOTSUP.

    fn open_file(&self, vn: &Vnode, flags: u32) -> KResult<Option<FileHandle>> {
        let Some(obj) = Self::object_of(vn) else {
            return Ok(None);
        };
        if obj.is_dir {
            return Ok(None);
        }
        let inner = obj.ops()?.open(&obj, flags)?;
        Ok(Some(Box::new(ProcfsHandle { obj, inner })))
    }

    fn close_file(&self, _vn: &Vnode, handle: FileHandle) -> KResult<()> {
        let mut handle = handle
            .downcast::<ProcfsHandle>()
            .map_err(|_| Errno::Io)?;
        let inner = handle.inner.take();
        let obj = handle.obj.clone();
        obj.ops()?.close(&obj, inner)
    }

    fn read_file(
        &self,
        _vn: &Vnode,
        handle: &mut FileHandle,
        off: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let h = handle.downcast_mut::<ProcfsHandle>().ok_or(Errno::Io)?;
        let obj = h.obj.clone();
        let inner = h.inner.as_mut().map(|b| b.as_mut());
        obj.ops()?.read(&obj, inner, off, buf)
    }

    fn write_file(
        &self,
        _vn: &Vnode,
        handle: &mut FileHandle,
        off: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        let h = handle.downcast_mut::<ProcfsHandle>().ok_or(Errno::Io)?;
        let obj = h.obj.clone();
        let inner = h.inner.as_mut().map(|b| b.as_mut());
        obj.ops()?.write(&obj, inner, off, buf)
    }

    fn seek_file(
        &self,
        _vn: &Vnode,
        handle: &mut FileHandle,
        offset: i64,
        whence: u32,
    ) -> KResult<usize> {
        let h = handle.downcast_mut::<ProcfsHandle>().ok_or(Errno::Io)?;
        let obj = h.obj.clone();
        let inner = h.inner.as_mut().map(|b| b.as_mut());
        obj.ops()?.lseek(&obj, inner, offset, whence)
    }
}

// ---------------------------------------------------------------------------
// Filesystem type
// ---------------------------------------------------------------------------

fn reconstruct_dir(fs: &Arc<Ramfs>, dir: &Arc<SpinLock<DirReg>>, dirnode: &Arc<RamfsNode>) {
    let entries: Vec<(String, Arc<ProcfsObject>)> = {
        let guard = dir.lock();
        guard
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.obj.clone()))
            .collect()
    };
    for (_name, obj) in entries {
        let Ok(node) = create_node_in(fs, dirnode, &obj) else {
            continue;
        };
        if obj.is_dir {
            let subdir = with_registry(|reg| reg.dirs.get(&obj.path).cloned());
            if let Some(subdir) = subdir {
                reconstruct_dir(fs, &subdir, &node);
            }
        }
    }
}

/// The registered `procfs` filesystem type.
pub struct ProcfsType;

impl VfsOps for ProcfsType {
    fn mount(&self) -> KResult<Arc<Vnode>> {
        let fs = Ramfs::new();
        fs.set_ops_override(Arc::new(ProcfsVnops {
            fs: Arc::downgrade(&fs),
        }));

        // Rebuild the registered tree into this instance and track the
        // root node on the root object for eager propagation.
        let root_dir = with_registry(|reg| reg.dirs.get("/").cloned()).expect("registry root");
        {
            let root_obj = root_dir.lock().obj.clone();
            root_obj.nodes.lock().push((
                Arc::downgrade(&fs),
                fs.root_node().clone(),
                fs.root_node().clone(),
            ));
        }
        let root_node = fs.root_node().clone();
        reconstruct_dir(&fs, &root_dir, &root_node);

        // Keep the instance alive for the lifetime of the mount.
        MOUNTED.lock().push(fs.clone());
        kdebug!("procfs: mounted");
        Ok(fs.root_vnode())
    }

    fn unmount(&self, root: &Arc<Vnode>) -> KResult<()> {
        let Some(root_node) = root.private::<RamfsNode>() else {
            return Ok(());
        };
        let mut mounted = MOUNTED.lock();
        if let Some(pos) = mounted
            .iter()
            .position(|fs| Arc::ptr_eq(fs.root_node(), &root_node))
        {
            mounted.remove(pos);
        }
        Ok(())
    }
}

static MOUNTED: SpinLock<Vec<Arc<Ramfs>>> = SpinLock::new(Vec::new());

// ---------------------------------------------------------------------------
// Seqfile adapter
// ---------------------------------------------------------------------------

/// [`ProcfsOps`] adapter exposing a [`SeqSource`] factory as a dynamic
/// file: each open gets its own [`SeqFile`] iterator state.
pub struct SeqFileOps {
    factory: Box<dyn Fn() -> Box<dyn SeqSource> + Send + Sync>,
}

impl SeqFileOps {
    /// Wraps a source factory.
    pub fn new(factory: impl Fn() -> Box<dyn SeqSource> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            factory: Box::new(factory),
        })
    }
}

impl ProcfsOps for SeqFileOps {
    fn open(
        &self,
        _obj: &Arc<ProcfsObject>,
        _flags: u32,
    ) -> KResult<Option<Box<dyn Any + Send>>> {
        Ok(Some(Box::new(SeqFile::new((self.factory)()))))
    }

    fn read(
        &self,
        _obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        off: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let sf = handle
            .and_then(|h| h.downcast_mut::<SeqFile>())
            .ok_or(Errno::Io)?;
        let mut pos = off;
        sf.read(&mut pos, buf)
    }

    fn write(
        &self,
        _obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        off: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        let sf = handle
            .and_then(|h| h.downcast_mut::<SeqFile>())
            .ok_or(Errno::Io)?;
        sf.write(off, buf)
    }

    fn lseek(
        &self,
        _obj: &Arc<ProcfsObject>,
        handle: Option<&mut (dyn Any + Send)>,
        offset: i64,
        whence: u32,
    ) -> KResult<usize> {
        let sf = handle
            .and_then(|h| h.downcast_mut::<SeqFile>())
            .ok_or(Errno::Io)?;
        sf.lseek(offset, whence)
    }
}

/// Registers a seqfile-backed dynamic file at `p`.
pub fn procfs_register_seqfile(
    p: &str,
    factory: impl Fn() -> Box<dyn SeqSource> + Send + Sync + 'static,
    mode: u32,
) -> KResult<()> {
    procfs_register_file(p, SeqFileOps::new(factory), None, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{File, OpenFlags};
    use crate::mount::tests::ensure_root;
    use crate::mount::{VresolveFlags, fs_mount, vresolve, vresolve_parent};
    use crate::procfs::seqfile::SeqBuffer;
    use crate::ventry::Ventry;
    use std::sync::Once;

    /// Static-text file ops: read returns `"{name}\n"`.
    struct NameEcho;
    impl ProcfsOps for NameEcho {
        fn read(
            &self,
            obj: &Arc<ProcfsObject>,
            _handle: Option<&mut (dyn Any + Send)>,
            off: usize,
            buf: &mut [u8],
        ) -> KResult<usize> {
            let text = alloc::format!("{}\n", obj.name());
            Ok(procfs_read_string(&text, off, buf))
        }
    }

    /// Dynamic directory listing three fixed entries.
    struct TestDir;
    const TESTDIR_ENTRIES: [&str; 3] = ["file1", "file2", "recursive"];
    impl ProcfsOps for TestDir {
        fn readdir(
            &self,
            _obj: &Arc<ProcfsObject>,
            index: usize,
        ) -> KResult<Option<(String, bool)>> {
            Ok(TESTDIR_ENTRIES
                .get(index)
                .map(|n| (String::from(*n), *n == "recursive")))
        }
        fn lookup(&self, _obj: &Arc<ProcfsObject>, name: &str) -> KResult<Arc<ProcfsObject>> {
            if !TESTDIR_ENTRIES.contains(&name) {
                return Err(Errno::NoEnt);
            }
            if name == "recursive" {
                Ok(procfs_ephemeral_object(name, Arc::new(TestDir), None, 0o555, true))
            } else {
                Ok(procfs_ephemeral_object(name, Arc::new(NameEcho), None, 0o444, false))
            }
        }
    }

    struct Items {
        count: usize,
        prefix: &'static str,
    }
    impl SeqSource for Items {
        fn start(&mut self, pos: usize) -> Option<usize> {
            (pos < self.count).then_some(pos)
        }
        fn next(&mut self, item: usize, pos: &mut usize) -> Option<usize> {
            *pos = item + 1;
            (item + 1 < self.count).then_some(item + 1)
        }
        fn show(&mut self, buf: &mut SeqBuffer, item: usize) -> KResult<()> {
            let _ = crate::seq_printf!(buf, "{}{}\n", self.prefix, item);
            Ok(())
        }
    }

    static SETUP: Once = Once::new();

    /// Registers the test tree and mounts procfs at /proc once.
    fn ensure_procfs() {
        ensure_root();
        SETUP.call_once(|| {
            procfs_register_static_dir("/sys", 0o755).unwrap();
            procfs_register_static_dir("/sys/kernel", 0o755).unwrap();
            procfs_register_dir("/sys/kernel/testdir", Arc::new(TestDir), None, 0o555).unwrap();

            // Mount point in the root ramfs.
            let (dir, name) = vresolve_parent(None, "/proc").unwrap();
            let vn = dir
                .vnode()
                .mkdir(&name, VAttr::new(VnodeType::Dir, 0o755))
                .unwrap();
            let ve = Ventry::new(&name, vn);
            dir.link_child(&ve);
            fs_mount("/proc", "procfs").unwrap();
        });
    }

    #[test]
    fn dynamic_dir_lookup_reads_ephemeral_file() {
        ensure_procfs();
        let file = File::open(None, "/proc/sys/kernel/testdir/file1", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"file1\n");
        assert_eq!(n, 6);
        file.close().unwrap();
    }

    #[test]
    fn dynamic_dir_readdir_lists_entries() {
        ensure_procfs();
        let dir = File::open(
            None,
            "/proc/sys/kernel/testdir",
            OpenFlags::DIRECTORY,
        )
        .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir.readdir_next().unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, [".", "..", "file1", "file2", "recursive"]);
        dir.close().unwrap();
    }

    #[test]
    fn recursive_ephemeral_directories() {
        ensure_procfs();
        let file = File::open(
            None,
            "/proc/sys/kernel/testdir/recursive/file2",
            OpenFlags::empty(),
        )
        .unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"file2\n");
        file.close().unwrap();
    }

    #[test]
    fn seqfile_multi_item_renders_70_bytes() {
        ensure_procfs();
        procfs_register_seqfile(
            "/test_items",
            || {
                Box::new(Items {
                    count: 10,
                    prefix: "item_",
                })
            },
            0o444,
        )
        .unwrap();

        // Registered after mount: the eager path materialized the node.
        let file = File::open(None, "/proc/test_items", OpenFlags::empty()).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 17];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out.len(), 70);
        assert_eq!(
            out,
            b"item_0\nitem_1\nitem_2\nitem_3\nitem_4\nitem_5\nitem_6\nitem_7\nitem_8\nitem_9\n"
        );
        file.close().unwrap();
    }

    #[test]
    fn register_open_close_unregister_is_idempotent() {
        ensure_procfs();
        for _ in 0..3 {
            procfs_register_file("/idem", Arc::new(NameEcho), None, 0o444).unwrap();
            assert!(procfs_lookup_object("/idem").is_some());

            let file = File::open(None, "/proc/idem", OpenFlags::empty()).unwrap();
            let mut buf = [0u8; 8];
            let n = file.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"idem\n");
            file.close().unwrap();
            // Release the open file's entry reference so the uncached
            // entry dies with it.
            drop(file);

            procfs_unregister("/idem").unwrap();
            assert!(procfs_lookup_object("/idem").is_none());
            assert_eq!(
                vresolve(None, "/proc/idem", VresolveFlags::empty()).unwrap_err(),
                Errno::NoEnt
            );
        }
    }

    #[test]
    fn registration_validation() {
        ensure_procfs();
        assert_eq!(
            procfs_register_file("relative", Arc::new(NameEcho), None, 0o444).unwrap_err(),
            Errno::Inval
        );
        assert_eq!(
            procfs_register_file("/", Arc::new(NameEcho), None, 0o444).unwrap_err(),
            Errno::Inval
        );
        assert_eq!(
            procfs_register_file("/no_parent_dir/x", Arc::new(NameEcho), None, 0o444)
                .unwrap_err(),
            Errno::NoEnt
        );

        procfs_register_file("/dup_check", Arc::new(NameEcho), None, 0o444).unwrap();
        assert_eq!(
            procfs_register_file("/dup_check", Arc::new(NameEcho), None, 0o444).unwrap_err(),
            Errno::Exist
        );
        procfs_unregister("/dup_check").unwrap();
    }

    #[test]
    fn missing_dynamic_entry_is_enoent() {
        ensure_procfs();
        assert_eq!(
            File::open(None, "/proc/sys/kernel/testdir/absent", OpenFlags::empty())
                .unwrap_err(),
            Errno::NoEnt
        );
    }
}
