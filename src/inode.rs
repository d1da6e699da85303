//! In-core inodes.
//!
//! An `Inode` is the in-core image of one filesystem object, shared by every
//! dentry aliasing it. Size and link count are atomics so readers never take
//! a lock; size-extending writes and truncate serialize on the per-inode
//! lock. The usage count works like the dentry's: the inode cache holds the
//! `Arc` for memory safety, but only a nonzero usage count keeps the entry
//! alive in the cache.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::dentry::Dentry;
use crate::error::Result;
use crate::ops::{FileOps, InodeOps, NodeKind};
use crate::sb::SuperBlock;

struct InodeState {
    count: u32,
    dirty: bool,
}

/// One in-core filesystem object.
pub struct Inode {
    ino: u64,
    kind: NodeKind,
    mode: u32,
    size: AtomicU64,
    nlink: AtomicU32,
    state: Mutex<InodeState>,
    /// Serializes size-extending writes and truncates.
    i_lock: Mutex<()>,
    /// Dentries naming this inode.
    aliases: Mutex<Vec<Weak<Dentry>>>,
    sb: Arc<SuperBlock>,
    ops: Arc<dyn InodeOps>,
    fops: Arc<dyn FileOps>,
}

impl Inode {
    /// Get a counted reference to inode `ino`: from the cache if a live copy
    /// exists, otherwise loaded from the backend and inserted. Concurrent
    /// loaders reconcile to a single cached copy.
    pub(crate) fn iget(sb: &Arc<SuperBlock>, ino: u64) -> Result<Arc<Inode>> {
        if let Some(inode) = sb.icache().get(ino) {
            trace!("icache hit for ino {}", ino);
            return Ok(inode);
        }
        let init = sb.sops().read_inode(ino)?;
        debug!("loaded ino {} ({:?})", ino, init.kind);
        let inode = Arc::new(Inode {
            ino,
            kind: init.kind,
            mode: init.mode,
            size: AtomicU64::new(init.size),
            nlink: AtomicU32::new(init.nlink),
            state: Mutex::new(InodeState {
                count: 1,
                dirty: false,
            }),
            i_lock: Mutex::new(()),
            aliases: Mutex::new(Vec::new()),
            sb: sb.clone(),
            ops: sb.iops().clone(),
            fops: sb.fops().clone(),
        });
        sb.register_inode(&inode);
        Ok(sb.icache().insert(inode))
    }

    /// Inode number within the owning superblock.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Object kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Permission bits as loaded.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Size in bytes, read without a lock.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    /// Hard link count.
    pub fn nlink(&self) -> u32 {
        self.nlink.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_nlink(&self) {
        self.nlink.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_nlink(&self) {
        let prev = self.nlink.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "nlink underflow on ino {}", self.ino);
    }

    /// Owning superblock.
    pub fn sb(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    pub(crate) fn ops(&self) -> &Arc<dyn InodeOps> {
        &self.ops
    }

    pub(crate) fn fops(&self) -> &Arc<dyn FileOps> {
        &self.fops
    }

    /// Current usage count (not the `Arc` count).
    pub fn usage_count(&self) -> u32 {
        self.state.lock().count
    }

    /// Guard for size-changing operations.
    pub(crate) fn size_lock(&self) -> MutexGuard<'_, ()> {
        self.i_lock.lock()
    }

    pub(crate) fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Acquire one usage count. Caller must hold one already, or the icache
    /// table lock.
    pub(crate) fn grab(&self) {
        self.state.lock().count += 1;
    }

    /// Release one usage count. On the last release the inode leaves the
    /// cache and is deleted from the backend (link count zero) or written
    /// back (dirty).
    pub(crate) fn put(self: &Arc<Self>) {
        let dirty = {
            let mut st = self.state.lock();
            debug_assert!(st.count > 0, "inode usage count underflow");
            st.count -= 1;
            if st.count > 0 {
                return;
            }
            st.dirty
        };
        // Count is zero: the cache will refuse to resurrect us, so the
        // backend calls below run on a doomed inode.
        self.sb.icache().remove(self.ino, self);
        if self.nlink() == 0 {
            debug!("last reference to unlinked ino {}, deleting", self.ino);
            if let Err(e) = self.sb.sops().delete_inode(self) {
                error!("backend failed to delete ino {}: {}", self.ino, e);
            }
        } else if dirty {
            if let Err(e) = self.sb.sops().write_inode(self) {
                warn!("write-back of ino {} failed: {}", self.ino, e);
            }
        }
    }

    /// Resurrection hook for the icache: take a count only if one is already
    /// held somewhere. Returns false for an inode on its way out.
    pub(crate) fn grab_not_zero(&self) -> bool {
        let mut st = self.state.lock();
        if st.count == 0 {
            return false;
        }
        st.count += 1;
        true
    }

    pub(crate) fn add_alias(&self, d: &Arc<Dentry>) {
        let mut aliases = self.aliases.lock();
        aliases.retain(|w| w.strong_count() > 0);
        aliases.push(Arc::downgrade(d));
    }

    pub(crate) fn drop_alias(&self, d: &Dentry) {
        self.aliases
            .lock()
            .retain(|w| w.as_ptr() != d as *const Dentry);
    }
}
