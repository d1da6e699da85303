//! The inode cache: a per-superblock ino → inode table.
//!
//! Unlike the dentry cache there is no LRU; an inode lives in the table
//! exactly as long as something holds a usage count on it. `get` refuses an
//! inode whose count already hit zero, since its releaser is committed to
//! tearing it down.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::inode::Inode;

pub struct InodeCache {
    table: Mutex<HashMap<u64, Arc<Inode>>>,
}

impl InodeCache {
    pub(crate) fn new() -> Self {
        InodeCache {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live inode, taking a usage count. Returns `None` for a
    /// missing entry or one whose count has already reached zero.
    pub(crate) fn get(&self, ino: u64) -> Option<Arc<Inode>> {
        let table = self.table.lock();
        let inode = table.get(&ino)?;
        if !inode.grab_not_zero() {
            trace!("icache: ino {} is being released, missing on purpose", ino);
            return None;
        }
        Some(inode.clone())
    }

    /// Insert a freshly loaded inode (usage count 1). If a concurrent loader
    /// won the race, that copy is returned with a count taken and the
    /// caller's copy is dropped; either way the returned reference is
    /// counted. A mapped inode whose count reached zero is displaced; its
    /// releaser removes by identity and will skip the new entry.
    pub(crate) fn insert(&self, inode: Arc<Inode>) -> Arc<Inode> {
        let ino = inode.ino();
        let mut table = self.table.lock();
        if let Some(existing) = table.get(&ino) {
            if existing.grab_not_zero() {
                trace!("icache: lost load race for ino {}", ino);
                return existing.clone();
            }
        }
        table.insert(ino, inode.clone());
        inode
    }

    /// Drop `inode` from the table, by identity: if the slot was already
    /// displaced by a reloaded copy, leave it alone.
    pub(crate) fn remove(&self, ino: u64, inode: &Inode) {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(&ino) {
            if Arc::as_ptr(existing) == inode as *const Inode {
                table.remove(&ino);
            }
        }
    }

    /// Number of cached inodes.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
