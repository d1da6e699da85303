//! Capability traits implemented by concrete filesystem backends.
//!
//! The VFS core never knows how a backend stores anything; it drives these
//! traits and keeps the caches and reference counts coherent around them.
//! All methods are synchronous and may block on backend I/O. They are called
//! with no VFS spinlock held.
//!
//! Every mutating method has a default body returning
//! [`VfsError::Unsupported`], so a read-only backend implements only what it
//! supports instead of installing dummy stand-ins.

use std::sync::Arc;

use crate::dentry::Dentry;
use crate::error::{Result, VfsError};
use crate::file::File;
use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::sb::SuperBlock;

/// What an inode is. The VFS only distinguishes these three; device nodes and
/// pipes are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
}

impl NodeKind {
    /// True for directories.
    pub fn is_dir(self) -> bool {
        matches!(self, NodeKind::Dir)
    }

    /// True for symbolic links.
    pub fn is_symlink(self) -> bool {
        matches!(self, NodeKind::Symlink)
    }
}

/// Why a path is being walked; passed to [`InodeOps::permission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Opening an existing object for I/O.
    Open,
    /// Creating the final component.
    Create,
    /// Metadata access only (stat, chdir, resolve).
    Access,
}

/// Metadata a backend hands to the VFS when an inode is loaded.
#[derive(Debug, Clone)]
pub struct InodeInit {
    /// Object kind.
    pub kind: NodeKind,
    /// Permission bits (carried, not enforced).
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
}

/// One directory entry as returned by [`FileOps::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, a single path component.
    pub name: String,
    /// Inode number within the entry's superblock.
    pub ino: u64,
    /// Entry kind.
    pub kind: NodeKind,
}

/// A mountable filesystem implementation, registered with the VFS by name.
pub trait FilesystemType: Send + Sync {
    /// Filesystem type name, e.g. `"memfs"`.
    fn name(&self) -> &str;

    /// Build a superblock for a new mount of this filesystem. The
    /// implementation constructs its [`SuperBlock`] and calls
    /// [`crate::sb::init_sb`] to wire the root dentry/inode into `mnt`.
    fn mount(&self, device: &str, mnt: &Arc<VfsMount>) -> Result<Arc<SuperBlock>>;
}

/// Whole-filesystem operations: inode load, write-back, and deletion.
pub trait SuperOps: Send + Sync {
    /// Load the metadata for inode `ino` from the backend.
    fn read_inode(&self, ino: u64) -> Result<InodeInit>;

    /// Flush a dirty inode's metadata back to the backend.
    fn write_inode(&self, inode: &Inode) -> Result<()> {
        let _ = inode;
        Ok(())
    }

    /// Remove the backing object of an inode whose link count reached zero.
    fn delete_inode(&self, inode: &Inode) -> Result<()> {
        let _ = inode;
        Err(VfsError::Unsupported)
    }
}

/// Per-directory-entry (name resolution) operations.
///
/// `dir` is always a directory inode; the VFS checks that before calling.
pub trait InodeOps: Send + Sync {
    /// Find `name` in directory `dir`. `Ok(None)` means the name does not
    /// exist (a cacheable miss); errors are reserved for backend failure.
    fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<u64>>;

    /// Create a regular file and return its inode number.
    fn create(&self, dir: &Inode, name: &str, mode: u32) -> Result<u64> {
        let _ = (dir, name, mode);
        Err(VfsError::Unsupported)
    }

    /// Add a second directory entry for an existing inode on the same
    /// superblock.
    fn link(&self, old: &Inode, dir: &Inode, name: &str) -> Result<()> {
        let _ = (old, dir, name);
        Err(VfsError::Unsupported)
    }

    /// Remove the directory entry `name`.
    fn unlink(&self, dir: &Inode, name: &str) -> Result<()> {
        let _ = (dir, name);
        Err(VfsError::Unsupported)
    }

    /// Create a symbolic link holding `target` and return its inode number.
    fn symlink(&self, dir: &Inode, name: &str, target: &str) -> Result<u64> {
        let _ = (dir, name, target);
        Err(VfsError::Unsupported)
    }

    /// Create a directory and return its inode number.
    fn mkdir(&self, dir: &Inode, name: &str, mode: u32) -> Result<u64> {
        let _ = (dir, name, mode);
        Err(VfsError::Unsupported)
    }

    /// Remove an empty directory entry `name`.
    fn rmdir(&self, dir: &Inode, name: &str) -> Result<()> {
        let _ = (dir, name);
        Err(VfsError::Unsupported)
    }

    /// Move a directory entry, same superblock only. The VFS has already
    /// unlinked any pre-existing destination.
    fn rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
    ) -> Result<()> {
        let _ = (old_dir, old_name, new_dir, new_name);
        Err(VfsError::Unsupported)
    }

    /// Read a symlink's target.
    fn readlink(&self, inode: &Inode) -> Result<String> {
        let _ = inode;
        Err(VfsError::Unsupported)
    }

    /// Resize a regular file.
    fn truncate(&self, inode: &Inode, len: u64) -> Result<()> {
        let _ = (inode, len);
        Err(VfsError::Unsupported)
    }

    /// Access check. The default allows everything; permission models are a
    /// backend concern.
    fn permission(&self, inode: &Inode, intent: Intent) -> Result<()> {
        let _ = (inode, intent);
        Ok(())
    }
}

/// Dentry-cache hooks. Backends with case folding or non-trivial hashing
/// override `hash`/`compare`; everyone else uses [`GenericDentryOps`].
pub trait DentryOps: Send + Sync {
    /// Hash a component name. Must agree with `compare`.
    fn hash(&self, name: &str) -> u64 {
        generic_name_hash(name)
    }

    /// Compare a cached name against a probe.
    fn compare(&self, cached: &str, probe: &str) -> bool {
        cached == probe
    }

    /// Decide whether a cached entry is still valid. Returning `false` makes
    /// the lookup fall through to the backend.
    fn revalidate(&self, dentry: &Dentry) -> bool {
        let _ = dentry;
        true
    }

    /// Called once when a dentry is torn down.
    fn release(&self, dentry: &Dentry) {
        let _ = dentry;
    }

    /// Called when the dentry's inode reference is dropped during teardown.
    fn detach_inode(&self, dentry: &Dentry, inode: &Inode) {
        let _ = (dentry, inode);
    }
}

/// Default dentry hooks: djb2 hash, byte-equality compare.
pub struct GenericDentryOps;

impl DentryOps for GenericDentryOps {}

/// Open-file operations.
pub trait FileOps: Send + Sync {
    /// Called once when the file object is created.
    fn open(&self, inode: &Inode, file: &File) -> Result<()> {
        let _ = (inode, file);
        Ok(())
    }

    /// Called exactly once when the file's last reference is dropped.
    fn release(&self, inode: &Inode, file: &File) -> Result<()> {
        let _ = (inode, file);
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `off`. Returns bytes read; 0 at EOF.
    fn read(&self, file: &File, buf: &mut [u8], off: u64) -> Result<usize> {
        let _ = (file, buf, off);
        Err(VfsError::Unsupported)
    }

    /// Write `buf` at `off`. Returns bytes written.
    fn write(&self, file: &File, buf: &[u8], off: u64) -> Result<usize> {
        let _ = (file, buf, off);
        Err(VfsError::Unsupported)
    }

    /// List a directory's entries.
    fn readdir(&self, file: &File) -> Result<Vec<DirEntry>> {
        let _ = file;
        Err(VfsError::Unsupported)
    }
}

/// djb2 over the component bytes. Stable across runs, cheap, and good enough
/// for the dcache buckets.
pub fn generic_name_hash(name: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(u64::from(b));
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_is_stable_and_distinguishes() {
        assert_eq!(generic_name_hash("a"), generic_name_hash("a"));
        assert_ne!(generic_name_hash("a"), generic_name_hash("b"));
        assert_ne!(generic_name_hash("ab"), generic_name_hash("ba"));
    }
}
