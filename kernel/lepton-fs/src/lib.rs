//! Virtual filesystem layer.
//!
//! The VFS is a reference-counted graph of [`Ventry`] (named directory
//! entries) linking [`Vnode`] (in-core file objects). Filesystem backends
//! implement [`VnodeOps`]; mounts are tracked in a global table with path
//! resolution crossing mount points and following symlinks. `ramfs` is
//! the in-memory backend; `procfs` layers dynamic files and seqfile
//! iterators on top of it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod file;
pub mod mount;
pub mod path;
pub mod procfs;
pub mod ramfs;
pub mod ventry;
pub mod vnode;

pub use file::{FdTable, File, OpenFlags, Pipe, SeekWhence, rmdir_path, unlink_path};
pub use mount::{
    FsType, Vfs, VfsOps, VresolveFlags, fs_get_type, fs_init_root, fs_mount, fs_register_type,
    fs_root, fs_unmount, ventry_abspath, vresolve, vresolve_parent,
};
pub use ventry::{VeFlags, VeState, Ventry};
pub use vnode::{DirEntry, VAttr, Vnode, VnFlags, VnStat, VnodeId, VnodeOps, VnodeType};
