//! Open files.
//!
//! A `File` pins a resolved dentry and mount for as long as it is open,
//! which is what keeps an unlinked-but-open file's inode alive. The file's
//! own count works like the other objects': the last `release` runs the
//! backend's release hook exactly once and drops the pins.

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::dentry::Dentry;
use crate::error::{Result, VfsError};
use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::ops::{DirEntry, FileOps, NodeKind};

bitflags! {
    /// Open mode and creation switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// With CREATE: fail if it already exists.
        const EXCL = 1 << 3;
        /// Truncate to zero length on open.
        const TRUNC = 1 << 4;
        /// Every write lands at the current end of file.
        const APPEND = 1 << 5;
    }
}

/// One open file.
pub struct File {
    dentry: Arc<Dentry>,
    mnt: Arc<VfsMount>,
    /// Convenience alias; the dentry owns the counted inode reference.
    inode: Arc<Inode>,
    flags: OpenFlags,
    pos: Mutex<u64>,
    count: Mutex<u32>,
    ops: Arc<dyn FileOps>,
}

impl File {
    /// The file's inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The dentry the file was opened through.
    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    /// Flags the file was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Current file position.
    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    /// Reposition the file.
    pub fn seek(&self, pos: u64) {
        *self.pos.lock() = pos;
    }

    /// Read at the current position, advancing it. Returns bytes read, 0 at
    /// end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(VfsError::PermissionDenied(
                "file not open for reading".to_string(),
            ));
        }
        let mut pos = self.pos.lock();
        let n = self.ops.read(self, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write at the current position (end of file in append mode),
    /// advancing it. The in-core size is extended under the inode lock after
    /// the backend accepts the bytes.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(VfsError::PermissionDenied(
                "file not open for writing".to_string(),
            ));
        }
        let mut pos = self.pos.lock();
        if self.flags.contains(OpenFlags::APPEND) {
            *pos = self.inode.size();
        }
        let n = self.ops.write(self, buf, *pos)?;
        let end = *pos + n as u64;
        if end > self.inode.size() {
            let _guard = self.inode.size_lock();
            if end > self.inode.size() {
                self.inode.set_size(end);
                self.inode.mark_dirty();
            }
        }
        *pos = end;
        Ok(n)
    }

    /// List the entries of an open directory.
    pub fn readdir(&self) -> Result<Vec<DirEntry>> {
        if !self.inode.kind().is_dir() {
            return Err(VfsError::NotADirectory(self.dentry.name()));
        }
        self.ops.readdir(self)
    }

    /// Take another reference to the open file.
    pub fn grab(&self) {
        *self.count.lock() += 1;
    }

    /// Drop one reference. The last one runs the backend release hook and
    /// unpins the dentry and mount.
    pub fn put(self: &Arc<Self>) {
        let remaining = {
            let mut count = self.count.lock();
            debug_assert!(*count > 0, "file count underflow");
            *count -= 1;
            *count
        };
        if remaining > 0 {
            return;
        }
        debug!("releasing file '{}'", self.dentry.name());
        if let Err(e) = self.ops.release(&self.inode, self) {
            warn!("backend release of '{}' failed: {}", self.dentry.name(), e);
        }
        self.dentry.sb().unregister_file(self);
        self.dentry.put();
        self.mnt.put();
    }
}

/// Open a resolved dentry. Directories may only be opened read-only.
pub(crate) fn dentry_open(
    dentry: &Arc<Dentry>,
    mnt: &Arc<VfsMount>,
    flags: OpenFlags,
) -> Result<Arc<File>> {
    let inode = dentry.d_inode();
    if inode.kind().is_dir() && flags.contains(OpenFlags::WRITE) {
        return Err(VfsError::IsADirectory(dentry.name()));
    }
    dentry.grab();
    mnt.grab();
    let pos = if flags.contains(OpenFlags::APPEND) {
        inode.size()
    } else {
        0
    };
    let file = Arc::new(File {
        dentry: dentry.clone(),
        mnt: mnt.clone(),
        inode: inode.clone(),
        flags,
        pos: Mutex::new(pos),
        count: Mutex::new(1),
        ops: inode.fops().clone(),
    });
    dentry.sb().register_file(&file);
    if let Err(e) = file.ops.open(&inode, &file) {
        dentry.sb().unregister_file(&file);
        dentry.put();
        mnt.put();
        return Err(e);
    }
    Ok(file)
}

/// Truncate a file's inode to `len`. The backend commits first; the in-core
/// size changes only once it has, under the inode lock, so a failed backend
/// resize never leaves the in-core size diverged from the store.
pub(crate) fn truncate_inode(inode: &Arc<Inode>, len: u64) -> Result<()> {
    if inode.kind() != NodeKind::File {
        return Err(VfsError::IsADirectory(format!("ino {}", inode.ino())));
    }
    let _guard = inode.size_lock();
    inode.ops().truncate(inode, len)?;
    inode.set_size(len);
    inode.mark_dirty();
    Ok(())
}
