//! Named directory entries.
//!
//! A [`Ventry`] is a (name, parent, vnode) triple with a list of child
//! links. Reference discipline: strong references go *up* (a child keeps
//! its parent and its vnode alive), the parent's child list holds weak
//! links only — owning references to children are held by whoever looked
//! them up (the entry cache, an open file, path resolution in flight).

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;
use lepton_core::sync::SpinLock;

use crate::mount::Vfs;
use crate::vnode::Vnode;

bitflags! {
    /// Ventry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VeFlags: u32 {
        /// The root entry of a mounted filesystem.
        const FSROOT = 1 << 0;
        /// A mount point covered by another filesystem.
        const MOUNT = 1 << 1;
        /// Never keep this entry in the entry cache.
        const NOCACHE = 1 << 2;
        /// Never write this entry back to the backing store.
        const NOSAVE = 1 << 3;
    }
}

/// Ventry lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VeState {
    /// Allocated but not yet linked.
    Empty,
    /// Linked into the tree.
    Alive,
    /// Unlinked; waiting for the last reference to drop.
    Dead,
}

struct VentryInner {
    state: VeState,
    flags: VeFlags,
    parent: Option<Arc<Ventry>>,
    children: Vec<Weak<Ventry>>,
    /// Filesystem mounted on top of this entry, when `MOUNT` is set.
    mounted: Option<Arc<Vfs>>,
}

/// A named directory-entry slot.
pub struct Ventry {
    name: SpinLock<String>,
    /// FNV-1a hash of the name at creation, for fast negative compares.
    pub name_hash: u64,
    vnode: Arc<Vnode>,
    inner: SpinLock<VentryInner>,
    self_weak: Weak<Ventry>,
}

fn fnv1a(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in name.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

impl Ventry {
    /// Creates an entry linked to `vnode`, in the EMPTY state until
    /// [`link_child`](Self::link_child) attaches it to a parent.
    pub fn new(name: &str, vnode: Arc<Vnode>) -> Arc<Ventry> {
        let flags = vnode.ve_hint;
        Arc::new_cyclic(|me| Ventry {
            name: SpinLock::new(String::from(name)),
            name_hash: fnv1a(name),
            vnode,
            inner: SpinLock::new(VentryInner {
                state: VeState::Empty,
                flags,
                parent: None,
                children: Vec::new(),
                mounted: None,
            }),
            self_weak: me.clone(),
        })
    }

    /// Creates a filesystem root entry (named `/`, FSROOT, ALIVE).
    pub fn new_root(vnode: Arc<Vnode>) -> Arc<Ventry> {
        let ve = Self::new("/", vnode);
        let mut inner = ve.inner.lock();
        inner.flags.insert(VeFlags::FSROOT);
        inner.state = VeState::Alive;
        drop(inner);
        ve
    }

    /// Returns the entry's name.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the entry (rename(2) support).
    pub fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    /// Returns the linked vnode.
    pub fn vnode(&self) -> &Arc<Vnode> {
        &self.vnode
    }

    /// Returns the current flags.
    pub fn flags(&self) -> VeFlags {
        self.inner.lock().flags
    }

    /// Inserts flags.
    pub fn add_flags(&self, flags: VeFlags) {
        self.inner.lock().flags.insert(flags);
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> VeState {
        self.inner.lock().state
    }

    /// Returns the parent entry, if linked.
    pub fn parent(&self) -> Option<Arc<Ventry>> {
        self.inner.lock().parent.clone()
    }

    /// Links `child` under `self`: the child takes a strong parent
    /// reference, the parent records a weak link, and the child becomes
    /// ALIVE.
    pub fn link_child(&self, child: &Arc<Ventry>) {
        let me = self.self_weak.upgrade().expect("linking under a dead ventry");
        {
            let mut child_inner = child.inner.lock();
            child_inner.parent = Some(me);
            child_inner.state = VeState::Alive;
        }
        let mut inner = self.inner.lock();
        inner.children.retain(|w| w.strong_count() > 0);
        inner.children.push(Arc::downgrade(child));
    }

    /// Finds a live child by name.
    pub fn find_child(&self, name: &str) -> Option<Arc<Ventry>> {
        let hash = fnv1a(name);
        let inner = self.inner.lock();
        for weak in &inner.children {
            if let Some(child) = weak.upgrade() {
                if child.name_hash == hash
                    && child.state() == VeState::Alive
                    && *child.name.lock() == name
                {
                    return Some(child);
                }
            }
        }
        None
    }

    /// Returns every live child.
    pub fn live_children(&self) -> Vec<Arc<Ventry>> {
        let inner = self.inner.lock();
        inner.children.iter().filter_map(Weak::upgrade).collect()
    }

    /// Unlinks `child`: removes the weak link and marks the child DEAD.
    /// The child keeps its parent reference until dropped so `..` stays
    /// valid for open files.
    pub fn unlink_child(&self, child: &Arc<Ventry>) {
        {
            let mut inner = self.inner.lock();
            inner
                .children
                .retain(|w| w.upgrade().map_or(false, |c| !Arc::ptr_eq(&c, child)));
        }
        child.inner.lock().state = VeState::Dead;
    }

    /// Covers this entry with a mounted filesystem.
    pub fn set_mounted(&self, vfs: Arc<Vfs>) {
        let mut inner = self.inner.lock();
        inner.flags.insert(VeFlags::MOUNT);
        inner.mounted = Some(vfs);
    }

    /// Removes the mount cover.
    pub fn clear_mounted(&self) {
        let mut inner = self.inner.lock();
        inner.flags.remove(VeFlags::MOUNT);
        inner.mounted = None;
    }

    /// Returns the filesystem mounted on this entry.
    pub fn mounted(&self) -> Option<Arc<Vfs>> {
        self.inner.lock().mounted.clone()
    }
}

impl Drop for Ventry {
    fn drop(&mut self) {
        // The parent's weak link is pruned lazily; nothing to do here
        // beyond letting the vnode reference drop (which runs the
        // filesystem cleanup hook on the last release).
    }
}

impl core::fmt::Debug for Ventry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ventry")
            .field("name", &*self.name.lock())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnode::{VAttr, VnodeOps, VnodeType};

    struct NullOps;
    impl VnodeOps for NullOps {}

    fn dir_vnode(id: u64) -> Arc<Vnode> {
        Vnode::new(id, VAttr::new(VnodeType::Dir, 0o755), Arc::new(NullOps))
    }

    fn file_vnode(id: u64) -> Arc<Vnode> {
        Vnode::new(id, VAttr::new(VnodeType::Reg, 0o644), Arc::new(NullOps))
    }

    #[test]
    fn link_and_find() {
        let root = Ventry::new_root(dir_vnode(1));
        let child = Ventry::new("etc", dir_vnode(2));
        root.link_child(&child);

        assert_eq!(child.state(), VeState::Alive);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &root));
        let found = root.find_child("etc").unwrap();
        assert!(Arc::ptr_eq(&found, &child));
        assert!(root.find_child("missing").is_none());
    }

    #[test]
    fn children_links_are_weak() {
        let root = Ventry::new_root(dir_vnode(1));
        {
            let child = Ventry::new("tmp", file_vnode(2));
            root.link_child(&child);
            assert!(root.find_child("tmp").is_some());
        }
        // The owning reference is gone; the weak link no longer resolves.
        assert!(root.find_child("tmp").is_none());
    }

    #[test]
    fn unlink_marks_dead() {
        let root = Ventry::new_root(dir_vnode(1));
        let child = Ventry::new("a", file_vnode(2));
        root.link_child(&child);

        root.unlink_child(&child);
        assert_eq!(child.state(), VeState::Dead);
        assert!(root.find_child("a").is_none());
        // The dead child still reaches its parent for `..`.
        assert!(child.parent().is_some());
    }

    #[test]
    fn vnode_refcount_covers_links() {
        let vn = file_vnode(7);
        let a = Ventry::new("one", vn.clone());
        let b = Ventry::new("two", vn.clone());
        // Two ventries plus the local handle.
        assert!(Arc::strong_count(&vn) >= 3);
        drop(a);
        drop(b);
        assert_eq!(Arc::strong_count(&vn), 1);
    }
}
