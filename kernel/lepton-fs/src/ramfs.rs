//! In-memory filesystem backend.
//!
//! Nodes live entirely on the heap: regular files are byte vectors,
//! directories are entry vectors, symlinks store their target string.
//! One [`Vnode`] is materialized per node on demand and deduplicated
//! through a weak map so every hard link shares it.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use lepton_core::sync::SpinLock;
use lepton_core::{Errno, KResult};

use crate::mount::VfsOps;
use crate::ventry::VeFlags;
use crate::vnode::{DirEntry, VAttr, Vnode, VnodeOps, VnodeType};

enum RamfsContent {
    File(Vec<u8>),
    Dir(Vec<RamfsDirent>),
    Symlink(String),
}

struct RamfsDirent {
    name: String,
    node: Arc<RamfsNode>,
}

/// A ramfs node: the backing object behind one file, directory, or
/// symlink.
pub struct RamfsNode {
    /// Node id within the instance.
    pub id: u64,
    /// Node type.
    pub vtype: VnodeType,
    /// Permission bits.
    pub mode: u32,
    content: SpinLock<RamfsContent>,
    /// Overlay-private state (procfs attaches its object here).
    pub data: SpinLock<Option<Arc<dyn Any + Send + Sync>>>,
    /// Flags for ventries linking this node's vnode.
    pub ve_hint: SpinLock<VeFlags>,
}

impl RamfsNode {
    fn new(id: u64, attr: VAttr) -> Arc<RamfsNode> {
        let content = match attr.vtype {
            VnodeType::Dir => RamfsContent::Dir(Vec::new()),
            VnodeType::Lnk => RamfsContent::Symlink(String::new()),
            _ => RamfsContent::File(Vec::new()),
        };
        Arc::new(RamfsNode {
            id,
            vtype: attr.vtype,
            mode: attr.mode,
            content: SpinLock::new(content),
            data: SpinLock::new(None),
            ve_hint: SpinLock::new(VeFlags::empty()),
        })
    }

    /// Returns the content size in bytes (files and symlinks).
    pub fn size(&self) -> usize {
        match &*self.content.lock() {
            RamfsContent::File(data) => data.len(),
            RamfsContent::Symlink(target) => target.len(),
            RamfsContent::Dir(entries) => entries.len(),
        }
    }

    fn find(&self, name: &str) -> Option<Arc<RamfsNode>> {
        match &*self.content.lock() {
            RamfsContent::Dir(entries) => entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.node.clone()),
            _ => None,
        }
    }
}

/// A ramfs instance.
pub struct Ramfs {
    next_id: AtomicU64,
    root: Arc<RamfsNode>,
    /// node id → live vnode, so links share one vnode.
    vnodes: SpinLock<BTreeMap<u64, Weak<Vnode>>>,
    /// When set, every vnode of this instance uses these ops instead of
    /// the plain ramfs ops (procfs overlays itself this way).
    ops_override: SpinLock<Option<Arc<dyn VnodeOps>>>,
    self_ref: Weak<Ramfs>,
}

impl Ramfs {
    /// Creates an empty instance with a root directory.
    pub fn new() -> Arc<Ramfs> {
        Arc::new_cyclic(|me| Ramfs {
            next_id: AtomicU64::new(2),
            root: RamfsNode::new(1, VAttr::new(VnodeType::Dir, 0o755)),
            vnodes: SpinLock::new(BTreeMap::new()),
            ops_override: SpinLock::new(None),
            self_ref: me.clone(),
        })
    }

    /// Installs an ops override for overlay filesystems.
    pub fn set_ops_override(&self, ops: Arc<dyn VnodeOps>) {
        *self.ops_override.lock() = Some(ops);
    }

    /// Returns the root node.
    pub fn root_node(&self) -> &Arc<RamfsNode> {
        &self.root
    }

    /// Returns (creating if needed) the root vnode.
    pub fn root_vnode(&self) -> Arc<Vnode> {
        self.get_vnode(&self.root.clone())
    }

    /// Allocates a detached node.
    pub fn alloc_node(&self, attr: VAttr) -> Arc<RamfsNode> {
        RamfsNode::new(self.next_id.fetch_add(1, Ordering::Relaxed), attr)
    }

    /// Links `node` into `dir` under `name`.
    pub fn add_dirent(&self, dir: &Arc<RamfsNode>, name: &str, node: Arc<RamfsNode>) -> KResult<()> {
        let mut content = dir.content.lock();
        let RamfsContent::Dir(entries) = &mut *content else {
            return Err(Errno::NotDir);
        };
        if entries.iter().any(|e| e.name == name) {
            return Err(Errno::Exist);
        }
        entries.push(RamfsDirent {
            name: name.to_string(),
            node,
        });
        Ok(())
    }

    /// Removes the entry `name` from `dir`, returning its node.
    pub fn remove_dirent(&self, dir: &Arc<RamfsNode>, name: &str) -> KResult<Arc<RamfsNode>> {
        let mut content = dir.content.lock();
        let RamfsContent::Dir(entries) = &mut *content else {
            return Err(Errno::NotDir);
        };
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or(Errno::NoEnt)?;
        Ok(entries.remove(pos).node)
    }

    /// Returns (creating and caching if needed) the vnode for `node`.
    pub fn get_vnode(&self, node: &Arc<RamfsNode>) -> Arc<Vnode> {
        let mut vnodes = self.vnodes.lock();
        if let Some(vn) = vnodes.get(&node.id).and_then(Weak::upgrade) {
            return vn;
        }

        let ops: Arc<dyn VnodeOps> = match self.ops_override.lock().clone() {
            Some(ops) => ops,
            None => self
                .self_ref
                .upgrade()
                .expect("ramfs instance dropped while in use"),
        };
        let vn = Vnode::with_hint(
            node.id,
            VAttr::new(node.vtype, node.mode),
            ops,
            *node.ve_hint.lock(),
        );
        vn.set_private(node.clone());
        vn.meta().size = node.size();
        vnodes.insert(node.id, Arc::downgrade(&vn));
        vn
    }

    fn node_of(vn: &Vnode) -> KResult<Arc<RamfsNode>> {
        vn.private::<RamfsNode>().ok_or(Errno::Io)
    }
}

impl VnodeOps for Ramfs {
    fn read(&self, vn: &Vnode, off: usize, buf: &mut [u8]) -> KResult<usize> {
        let node = Self::node_of(vn)?;
        let content = node.content.lock();
        let RamfsContent::File(data) = &*content else {
            return Err(Errno::Inval);
        };
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write(&self, vn: &Vnode, off: usize, buf: &[u8]) -> KResult<usize> {
        let node = Self::node_of(vn)?;
        let mut content = node.content.lock();
        let RamfsContent::File(data) = &mut *content else {
            return Err(Errno::Inval);
        };
        if data.len() < off + buf.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, vn: &Vnode, len: usize) -> KResult<()> {
        let node = Self::node_of(vn)?;
        let mut content = node.content.lock();
        let RamfsContent::File(data) = &mut *content else {
            return Err(Errno::Inval);
        };
        data.resize(len, 0);
        Ok(())
    }

    fn readdir(&self, vn: &Vnode, off: usize) -> KResult<Option<DirEntry>> {
        let node = Self::node_of(vn)?;
        match off {
            0 => {
                return Ok(Some(DirEntry {
                    id: node.id,
                    vtype: VnodeType::Dir,
                    name: String::from("."),
                }));
            }
            1 => {
                return Ok(Some(DirEntry {
                    id: node.id,
                    vtype: VnodeType::Dir,
                    name: String::from(".."),
                }));
            }
            _ => {}
        }
        let content = node.content.lock();
        let RamfsContent::Dir(entries) = &*content else {
            return Err(Errno::NotDir);
        };
        Ok(entries.get(off - 2).map(|e| DirEntry {
            id: e.node.id,
            vtype: e.node.vtype,
            name: e.name.clone(),
        }))
    }

    fn lookup(&self, vn: &Vnode, name: &str) -> KResult<Arc<Vnode>> {
        let node = Self::node_of(vn)?;
        let child = node.find(name).ok_or(Errno::NoEnt)?;
        Ok(self.get_vnode(&child))
    }

    fn create(&self, vn: &Vnode, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        let node = Self::node_of(vn)?;
        let child = self.alloc_node(attr);
        self.add_dirent(&node, name, child.clone())?;
        Ok(self.get_vnode(&child))
    }

    fn mknod(&self, vn: &Vnode, name: &str, attr: VAttr, _dev: u64) -> KResult<Arc<Vnode>> {
        self.create(vn, name, attr)
    }

    fn symlink(&self, vn: &Vnode, name: &str, target: &str) -> KResult<Arc<Vnode>> {
        let node = Self::node_of(vn)?;
        let child = self.alloc_node(VAttr::new(VnodeType::Lnk, 0o777));
        *child.content.lock() = RamfsContent::Symlink(String::from(target));
        self.add_dirent(&node, name, child.clone())?;
        Ok(self.get_vnode(&child))
    }

    fn hardlink(&self, vn: &Vnode, name: &str, target: &Arc<Vnode>) -> KResult<()> {
        let node = Self::node_of(vn)?;
        let target_node = target.private::<RamfsNode>().ok_or(Errno::Xdev)?;
        if target_node.vtype == VnodeType::Dir {
            return Err(Errno::IsDir);
        }
        self.add_dirent(&node, name, target_node)
    }

    fn unlink(&self, vn: &Vnode, name: &str, child: &Arc<Vnode>) -> KResult<()> {
        let node = Self::node_of(vn)?;
        let removed = self.remove_dirent(&node, name)?;
        debug_assert_eq!(removed.id, child.id);
        Ok(())
    }

    fn mkdir(&self, vn: &Vnode, name: &str, attr: VAttr) -> KResult<Arc<Vnode>> {
        let node = Self::node_of(vn)?;
        let child = self.alloc_node(VAttr::new(VnodeType::Dir, attr.mode));
        self.add_dirent(&node, name, child.clone())?;
        Ok(self.get_vnode(&child))
    }

    fn rmdir(&self, vn: &Vnode, name: &str, _child: &Arc<Vnode>) -> KResult<()> {
        let node = Self::node_of(vn)?;
        let target = node.find(name).ok_or(Errno::NoEnt)?;
        {
            let content = target.content.lock();
            let RamfsContent::Dir(entries) = &*content else {
                return Err(Errno::NotDir);
            };
            if !entries.is_empty() {
                return Err(Errno::Busy);
            }
        }
        self.remove_dirent(&node, name)?;
        Ok(())
    }

    fn readlink(&self, vn: &Vnode) -> KResult<String> {
        let node = Self::node_of(vn)?;
        let content = node.content.lock();
        let RamfsContent::Symlink(target) = &*content else {
            return Err(Errno::Inval);
        };
        Ok(target.clone())
    }
}

/// The registered `ramfs` filesystem type.
pub struct RamfsType;

impl VfsOps for RamfsType {
    fn mount(&self) -> KResult<Arc<Vnode>> {
        let fs = Ramfs::new();
        Ok(fs.root_vnode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        let file = root
            .create("hello", VAttr::new(VnodeType::Reg, 0o644))
            .unwrap();

        assert_eq!(file.write(0, b"world").unwrap(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(file.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        // Reading past EOF returns 0.
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        let file = root
            .create("sparse", VAttr::new(VnodeType::Reg, 0o644))
            .unwrap();
        file.write(4, b"x").unwrap();
        let mut buf = [0xFFu8; 5];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn lookup_shares_vnode_across_links() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        let file = root
            .create("orig", VAttr::new(VnodeType::Reg, 0o644))
            .unwrap();
        root.hardlink("alias", &file).unwrap();

        let via_orig = root.lookup("orig").unwrap();
        let via_alias = root.lookup("alias").unwrap();
        assert!(Arc::ptr_eq(&via_orig, &via_alias));
        assert_eq!(via_alias.meta().nlink, 2);
    }

    #[test]
    fn readdir_synthesizes_dot_entries() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        root.create("a", VAttr::new(VnodeType::Reg, 0o644)).unwrap();
        root.create("b", VAttr::new(VnodeType::Reg, 0o644)).unwrap();

        assert_eq!(root.readdir(0).unwrap().unwrap().name, ".");
        assert_eq!(root.readdir(1).unwrap().unwrap().name, "..");
        assert_eq!(root.readdir(2).unwrap().unwrap().name, "a");
        assert_eq!(root.readdir(3).unwrap().unwrap().name, "b");
        assert!(root.readdir(4).unwrap().is_none());
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        let dir = root.mkdir("d", VAttr::new(VnodeType::Dir, 0o755)).unwrap();
        dir.create("f", VAttr::new(VnodeType::Reg, 0o644)).unwrap();

        assert_eq!(root.rmdir("d", &dir).unwrap_err(), Errno::Busy);
        let node = dir.private::<RamfsNode>().unwrap();
        let inner = fs.remove_dirent(&node, "f").unwrap();
        drop(inner);
        root.rmdir("d", &dir).unwrap();
        assert_eq!(root.lookup("d").unwrap_err(), Errno::NoEnt);
    }

    #[test]
    fn symlink_roundtrip() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        let link = root.symlink("l", "/target/path").unwrap();
        assert_eq!(link.readlink().unwrap(), "/target/path");
    }

    #[test]
    fn duplicate_names_rejected() {
        let fs = Ramfs::new();
        let root = fs.root_vnode();
        root.create("dup", VAttr::new(VnodeType::Reg, 0o644)).unwrap();
        assert_eq!(
            root.create("dup", VAttr::new(VnodeType::Reg, 0o644))
                .unwrap_err(),
            Errno::Exist
        );
    }
}
