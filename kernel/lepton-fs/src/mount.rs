//! Filesystem types, mounts, and path resolution.
//!
//! Mounting links a fresh filesystem instance's root entry over a
//! covered directory entry: the new root's parent becomes the covered
//! entry, which gains the `MOUNT` flag. Resolution walks entry children
//! (with a global entry cache holding the owning references), calls into
//! the filesystem on misses, crosses mount points downward, and follows
//! symlinks unless asked not to.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use lepton_core::sync::SpinLock;
use lepton_core::{Errno, KResult, kinfo, kwarn};

use alloc::collections::BTreeMap;

use crate::path;
use crate::ventry::{VeFlags, Ventry};
use crate::vnode::{Vnode, VnodeType};

/// Maximum symlink traversals in one resolution.
const MAX_SYMLINK_DEPTH: usize = 10;

bitflags! {
    /// Path-resolution flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VresolveFlags: u32 {
        /// Do not follow a trailing symlink.
        const NOFOLLOW = 1 << 0;
        /// Require the final component to be a directory.
        const DIRECTORY = 1 << 1;
    }
}

// ---------------------------------------------------------------------------
// Filesystem types
// ---------------------------------------------------------------------------

/// Operations of a filesystem type.
pub trait VfsOps: Send + Sync {
    /// Creates a fresh filesystem instance, returning its root vnode.
    fn mount(&self) -> KResult<Arc<Vnode>>;

    /// Tears an instance down.
    fn unmount(&self, root: &Arc<Vnode>) -> KResult<()> {
        let _ = root;
        Ok(())
    }
}

/// A registered filesystem type.
pub struct FsType {
    /// Type name used in mount calls.
    pub name: &'static str,
    /// Type operations.
    pub ops: Arc<dyn VfsOps>,
}

static FS_TYPES: SpinLock<Vec<Arc<FsType>>> = SpinLock::new(Vec::new());

/// Registers a filesystem type.
///
/// # Errors
///
/// `EEXIST` if the name is already registered.
pub fn fs_register_type(fs_type: FsType) -> KResult<()> {
    let mut types = FS_TYPES.lock();
    if types.iter().any(|t| t.name == fs_type.name) {
        return Err(Errno::Exist);
    }
    types.push(Arc::new(fs_type));
    Ok(())
}

/// Looks up a filesystem type by name.
pub fn fs_get_type(name: &str) -> Option<Arc<FsType>> {
    FS_TYPES.lock().iter().find(|t| t.name == name).cloned()
}

// ---------------------------------------------------------------------------
// Mounted filesystems
// ---------------------------------------------------------------------------

/// A mounted filesystem instance.
pub struct Vfs {
    /// The filesystem type name.
    pub fstype: &'static str,
    root: SpinLock<Option<Arc<Ventry>>>,
    mount_point: SpinLock<Option<Arc<Ventry>>>,
    /// Write-operation gate (read-only mounts reject modification).
    readonly: core::sync::atomic::AtomicBool,
    ops: Arc<dyn VfsOps>,
}

impl Vfs {
    /// Returns the root entry.
    ///
    /// # Panics
    ///
    /// Panics if called on a dead (unmounted) vfs — a thread resuming
    /// into one is an invariant violation.
    pub fn root(&self) -> Arc<Ventry> {
        self.root.lock().clone().expect("vfs is dead")
    }

    /// Returns the covered mount-point entry (None for the root mount).
    pub fn mount_point(&self) -> Option<Arc<Ventry>> {
        self.mount_point.lock().clone()
    }

    /// Returns `true` if modification is gated off.
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Sets the read-only gate.
    pub fn set_readonly(&self, ro: bool) {
        self.readonly.store(ro, core::sync::atomic::Ordering::Release);
    }
}

static MOUNTS: SpinLock<Vec<Arc<Vfs>>> = SpinLock::new(Vec::new());
static ROOT_VENTRY: SpinLock<Option<Arc<Ventry>>> = SpinLock::new(None);

/// Entry cache: owning references keyed by (parent identity, name).
/// Entries flagged `NOCACHE` never enter.
static VCACHE: SpinLock<BTreeMap<(usize, String), Arc<Ventry>>> =
    SpinLock::new(BTreeMap::new());

fn vcache_key(parent: &Arc<Ventry>, name: &str) -> (usize, String) {
    (Arc::as_ptr(parent) as usize, name.to_string())
}

fn vcache_insert(parent: &Arc<Ventry>, name: &str, child: &Arc<Ventry>) {
    if child.flags().contains(VeFlags::NOCACHE) {
        return;
    }
    VCACHE.lock().insert(vcache_key(parent, name), child.clone());
}

pub(crate) fn vcache_remove(parent: &Arc<Ventry>, name: &str) {
    VCACHE.lock().remove(&vcache_key(parent, name));
}

/// Drops every cached entry below `parent` (unmount support).
fn vcache_purge_subtree(parent: &Arc<Ventry>) {
    let mut stack = alloc::vec![parent.clone()];
    let mut cache = VCACHE.lock();
    while let Some(ve) = stack.pop() {
        let key_base = Arc::as_ptr(&ve) as usize;
        let keys: Vec<_> = cache
            .range((key_base, String::new())..)
            .take_while(|((p, _), _)| *p == key_base)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, child) in keys {
            cache.remove(&key);
            stack.push(child);
        }
    }
}

/// Returns the global filesystem root entry.
///
/// # Panics
///
/// Panics if no root filesystem is mounted.
pub fn fs_root() -> Arc<Ventry> {
    ROOT_VENTRY.lock().clone().expect("no root filesystem mounted")
}

/// Mounts the root filesystem. Must be called exactly once, before any
/// resolution.
pub fn fs_init_root(fstype: &str) -> KResult<()> {
    let fs_type = fs_get_type(fstype).ok_or(Errno::NoEnt)?;
    let root_vn = fs_type.ops.mount()?;
    let root_ve = Ventry::new_root(root_vn);
    let vfs = Arc::new(Vfs {
        fstype: fs_type.name,
        root: SpinLock::new(Some(root_ve.clone())),
        mount_point: SpinLock::new(None),
        readonly: core::sync::atomic::AtomicBool::new(false),
        ops: fs_type.ops.clone(),
    });
    MOUNTS.lock().push(vfs);
    let mut root = ROOT_VENTRY.lock();
    assert!(root.is_none(), "root filesystem already mounted");
    *root = Some(root_ve);
    kinfo!("fs: mounted {fstype} at /");
    Ok(())
}

/// Mounts a filesystem instance of `fstype` over the directory at
/// `mount_path`.
pub fn fs_mount(mount_path: &str, fstype: &str) -> KResult<()> {
    let fs_type = fs_get_type(fstype).ok_or(Errno::NoEnt)?;
    let covered = vresolve(None, mount_path, VresolveFlags::DIRECTORY)?;
    if covered.flags().contains(VeFlags::MOUNT) {
        return Err(Errno::Busy);
    }

    let root_vn = fs_type.ops.mount()?;
    let root_ve = Ventry::new_root(root_vn);
    let vfs = Arc::new(Vfs {
        fstype: fs_type.name,
        root: SpinLock::new(Some(root_ve.clone())),
        mount_point: SpinLock::new(Some(covered.clone())),
        readonly: core::sync::atomic::AtomicBool::new(false),
        ops: fs_type.ops.clone(),
    });

    // Link: the new root's parent is the covered entry; the covered
    // entry is flagged as a mount point referencing the new vfs.
    covered.link_child(&root_ve);
    covered.set_mounted(vfs.clone());
    MOUNTS.lock().push(vfs);
    kinfo!("fs: mounted {fstype} at {mount_path}");
    Ok(())
}

/// Unmounts the filesystem covering `mount_path`.
///
/// # Errors
///
/// `EBUSY` if any vnode of the instance is still open or externally
/// referenced.
pub fn fs_unmount(mount_path: &str) -> KResult<()> {
    // Resolution crosses the mount: the result is the mounted root, and
    // its parent is the covered entry.
    let root = vresolve(None, mount_path, VresolveFlags::DIRECTORY)?;
    if !root.flags().contains(VeFlags::FSROOT) {
        return Err(Errno::Inval);
    }
    let covered = root.parent().ok_or(Errno::Busy)?;
    let vfs = covered.mounted().ok_or(Errno::Inval)?;

    // Busy check: open vnodes anywhere under the mounted root.
    if mount_busy(&root) {
        kwarn!("fs: unmount of {mount_path} rejected: filesystem busy");
        return Err(Errno::Busy);
    }

    vcache_purge_subtree(&root);
    covered.unlink_child(&root);
    covered.clear_mounted();
    vfs.ops.unmount(root.vnode())?;
    *vfs.root.lock() = None;
    MOUNTS.lock().retain(|m| !Arc::ptr_eq(m, &vfs));
    kinfo!("fs: unmounted {mount_path}");
    Ok(())
}

fn mount_busy(root: &Arc<Ventry>) -> bool {
    let mut stack = alloc::vec![root.clone()];
    while let Some(ve) = stack.pop() {
        if ve.vnode().meta().nopen > 0 {
            return true;
        }
        stack.extend(ve.live_children());
    }
    false
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Resolves one child component of a directory entry: entry-cache scan
/// first, then the filesystem's lookup; crosses a mount point downward.
pub fn lookup_child(dir: &Arc<Ventry>, name: &str) -> KResult<Arc<Ventry>> {
    if !dir.vnode().is_dir() {
        return Err(Errno::NotDir);
    }

    let child = match dir.find_child(name) {
        Some(child) => child,
        None => {
            let child_vn = dir.vnode().lookup(name)?;
            let child = Ventry::new(name, child_vn);
            dir.link_child(&child);
            vcache_insert(dir, name, &child);
            child
        }
    };

    // A covered entry resolves to the mounted filesystem's root.
    if child.flags().contains(VeFlags::MOUNT) {
        if let Some(vfs) = child.mounted() {
            return Ok(vfs.root());
        }
    }
    Ok(child)
}

fn parent_of(ve: &Arc<Ventry>) -> Arc<Ventry> {
    // Walking up from a filesystem root lands on the covered entry's
    // parent in the outer filesystem.
    if ve.flags().contains(VeFlags::FSROOT) {
        if let Some(parent) = ve.parent() {
            return parent.parent().unwrap_or(parent);
        }
        return ve.clone();
    }
    ve.parent().unwrap_or_else(|| ve.clone())
}

/// Resolves `path` to a directory entry.
///
/// Relative paths start at `at` (or the process root when `None` and the
/// path is absolute). Symlinks are followed except for a trailing link
/// under [`VresolveFlags::NOFOLLOW`].
pub fn vresolve(
    at: Option<Arc<Ventry>>,
    path_str: &str,
    flags: VresolveFlags,
) -> KResult<Arc<Ventry>> {
    vresolve_depth(at, path_str, flags, 0)
}

fn vresolve_depth(
    at: Option<Arc<Ventry>>,
    path_str: &str,
    flags: VresolveFlags,
    depth: usize,
) -> KResult<Arc<Ventry>> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(Errno::Loop);
    }
    if path_str.is_empty() {
        return Err(Errno::NoEnt);
    }

    let mut current = if path::is_absolute(path_str) {
        fs_root()
    } else {
        at.ok_or(Errno::NoEnt)?
    };

    let parts: Vec<&str> = path::components(path_str).collect();
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        match *part {
            "." => continue,
            ".." => {
                current = parent_of(&current);
                continue;
            }
            name => {
                let child = lookup_child(&current, name)?;

                // Symlink traversal.
                if child.vnode().vtype == VnodeType::Lnk
                    && !(is_last && flags.contains(VresolveFlags::NOFOLLOW))
                {
                    let target = child.vnode().readlink()?;
                    let base = if path::is_absolute(&target) {
                        None
                    } else {
                        Some(current.clone())
                    };
                    current = vresolve_depth(base, &target, VresolveFlags::empty(), depth + 1)?;
                    continue;
                }
                current = child;
            }
        }
    }

    if flags.contains(VresolveFlags::DIRECTORY) && !current.vnode().is_dir() {
        return Err(Errno::NotDir);
    }
    Ok(current)
}

/// Resolves the parent directory of `path`, returning it with the final
/// component name.
pub fn vresolve_parent(
    at: Option<Arc<Ventry>>,
    path_str: &str,
) -> KResult<(Arc<Ventry>, String)> {
    if path::is_root(path_str) {
        return Err(Errno::Exist);
    }
    let name = path::basename(path_str);
    if name == "." || name == ".." {
        return Err(Errno::Inval);
    }
    let dir = vresolve(at, path::dirname(path_str), VresolveFlags::DIRECTORY)?;
    Ok((dir, name.to_string()))
}

/// Builds the absolute path of an entry by walking parents (getcwd and
/// realpath support).
pub fn ventry_abspath(ve: &Arc<Ventry>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cur = ve.clone();
    loop {
        if cur.flags().contains(VeFlags::FSROOT) {
            match cur.parent() {
                Some(covered) => {
                    // Continue from the covered entry in the outer fs.
                    cur = covered;
                    continue;
                }
                None => break,
            }
        }
        parts.push(cur.name());
        match cur.parent() {
            Some(p) => cur = p,
            None => break,
        }
    }

    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for part in parts.iter().rev() {
        out.push('/');
        out.push_str(part);
    }
    out
}
