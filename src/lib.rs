//! aegisvfs: a filesystem-agnostic VFS layer.
//!
//! Concrete backends implement the capability traits in [`ops`]; the core
//! provides path resolution over a dentry cache with negative entries and an
//! unused-entry LRU, an inode cache, a mount tree with namespaces, open-file
//! objects, and the mutating operations (create, link, unlink, mkdir, rmdir,
//! rename, truncate). Everything is reference-counted with an explicit usage
//! count per object; cached entries with no users park on an LRU and can be
//! resurrected by later lookups or evicted under pressure.
//!
//! The concurrency model is threads and short uncontended critical sections;
//! backend calls may block but never run under a cache lock.
//!
//! ```
//! use std::sync::Arc;
//! use aegisvfs::{MemFsType, OpenFlags, Vfs};
//!
//! let vfs = Vfs::new();
//! vfs.register_fs(Arc::new(MemFsType));
//! vfs.mount("memfs", "mem0", None).unwrap();
//!
//! vfs.mkdir("/etc", 0o755).unwrap();
//! let f = vfs
//!     .open("/etc/motd", OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
//!     .unwrap();
//! f.write(b"hello").unwrap();
//! f.put();
//!
//! assert_eq!(vfs.resolve("/etc/motd").unwrap().inode().unwrap().size(), 5);
//! ```

#![warn(rust_2018_idioms)]

pub mod dcache;
pub mod dentry;
pub mod error;
pub mod file;
pub mod icache;
pub mod inode;
pub mod memfs;
pub mod mount;
pub mod ops;
pub mod sb;
pub mod vfs;
pub mod walk;

pub use dcache::CacheStats;
pub use dentry::Dentry;
pub use error::{Result, VfsError};
pub use file::{File, OpenFlags};
pub use inode::Inode;
pub use memfs::{MemFs, MemFsType, MEMFS_ROOT_INO};
pub use mount::{Namespace, VfsMount};
pub use ops::{
    generic_name_hash, DentryOps, DirEntry, FileOps, FilesystemType, GenericDentryOps, InodeInit,
    InodeOps, Intent, NodeKind, SuperOps,
};
pub use sb::{init_sb, SuperBlock};
pub use vfs::{FsContext, Vfs};
pub use walk::{LookupFlags, PathRef, MAX_SYMLINK_DEPTH};
