//! Directory entries and their usage-count lifecycle.
//!
//! A `Dentry` names one component under one parent. Besides the `Arc` that
//! keeps its memory alive, every dentry carries an explicit usage count under
//! its own lock; that count is the ownership protocol. Count zero without the
//! DYING flag parks the entry on its superblock's LRU list, where a later
//! lookup can resurrect it; count zero with DYING tears it down.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::ops::DentryOps;
use crate::sb::SuperBlock;

bitflags! {
    /// Dentry state bits, guarded by the per-dentry state lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DentryFlags: u32 {
        /// Usage count is nonzero; the entry is not on the LRU.
        const USED = 1 << 0;
        /// Cached miss: the name is known not to exist.
        const NEGATIVE = 1 << 1;
        /// On the way out; the last `put` frees instead of parking.
        const DYING = 1 << 2;
        /// A filesystem is mounted on this entry.
        const MOUNT_POINT = 1 << 3;
    }
}

pub(crate) struct DentryState {
    pub(crate) count: u32,
    pub(crate) flags: DentryFlags,
}

/// Parent link and name, re-keyed together on rename.
struct DentryLinks {
    /// `None` means the entry is its own parent (the global root).
    parent: Option<Arc<Dentry>>,
    name: String,
    hash: u64,
}

/// One cached (parent, name) binding, positive or negative.
pub struct Dentry {
    sb: Arc<SuperBlock>,
    ops: Arc<dyn DentryOps>,
    links: RwLock<DentryLinks>,
    /// `None` for negative entries.
    inode: RwLock<Option<Arc<Inode>>>,
    pub(crate) state: Mutex<DentryState>,
    /// Filesystem mounted on this entry, if any.
    mounted: RwLock<Option<Arc<VfsMount>>>,
    /// Weak bookkeeping of child directories.
    subdirs: Mutex<Vec<Weak<Dentry>>>,
}

impl Dentry {
    /// New positive skeleton under `parent`, usage count 1, no inode yet.
    /// Takes a counted reference on the parent.
    pub(crate) fn new(parent: &Arc<Dentry>, name: &str, hash: u64) -> Arc<Dentry> {
        parent.grab();
        Arc::new(Dentry {
            sb: parent.sb.clone(),
            ops: parent.ops.clone(),
            links: RwLock::new(DentryLinks {
                parent: Some(parent.clone()),
                name: name.to_string(),
                hash,
            }),
            inode: RwLock::new(None),
            state: Mutex::new(DentryState {
                count: 1,
                flags: DentryFlags::USED,
            }),
            mounted: RwLock::new(None),
            subdirs: Mutex::new(Vec::new()),
        })
    }

    /// New negative entry: a cached miss for `name` under `parent`.
    pub(crate) fn new_negative(parent: &Arc<Dentry>, name: &str, hash: u64) -> Arc<Dentry> {
        let d = Dentry::new(parent, name, hash);
        d.state.lock().flags.insert(DentryFlags::NEGATIVE);
        d
    }

    /// Root dentry for a superblock. A root mounted on another filesystem
    /// stores the mountpoint as its parent; the namespace root has none and
    /// is its own parent.
    pub(crate) fn new_root(
        sb: &Arc<SuperBlock>,
        ops: Arc<dyn DentryOps>,
        mountpoint: Option<&Arc<Dentry>>,
    ) -> Arc<Dentry> {
        if let Some(pt) = mountpoint {
            pt.grab();
        }
        let hash = ops.hash("/");
        Arc::new(Dentry {
            sb: sb.clone(),
            ops,
            links: RwLock::new(DentryLinks {
                parent: mountpoint.cloned(),
                name: "/".to_string(),
                hash,
            }),
            inode: RwLock::new(None),
            state: Mutex::new(DentryState {
                count: 1,
                flags: DentryFlags::USED,
            }),
            mounted: RwLock::new(None),
            subdirs: Mutex::new(Vec::new()),
        })
    }

    /// Component name.
    pub fn name(&self) -> String {
        self.links.read().name.clone()
    }

    /// Precomputed hash of the name, the dcache bucket key.
    pub(crate) fn name_hash(&self) -> u64 {
        self.links.read().hash
    }

    /// Parent entry; the global root is its own parent.
    pub fn parent(self: &Arc<Self>) -> Arc<Dentry> {
        match &self.links.read().parent {
            Some(p) => p.clone(),
            None => self.clone(),
        }
    }

    pub(crate) fn is_self_parent(&self) -> bool {
        self.links.read().parent.is_none()
    }

    /// Owning superblock.
    pub fn sb(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    pub(crate) fn ops(&self) -> &Arc<dyn DentryOps> {
        &self.ops
    }

    /// The entry's inode; `None` for negative entries.
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.read().clone()
    }

    /// Inode of a positive entry. Positive entries keep their inode until
    /// teardown, so a holder of a usage count may rely on it.
    pub(crate) fn d_inode(&self) -> Arc<Inode> {
        self.inode
            .read()
            .clone()
            .expect("positive dentry lost its inode")
    }

    /// True for a cached miss.
    pub fn is_negative(&self) -> bool {
        self.inode.read().is_none()
    }

    /// Current usage count (not the `Arc` count).
    pub fn usage_count(&self) -> u32 {
        self.state.lock().count
    }

    /// Bind an inode to a fresh skeleton, consuming a counted inode ref.
    pub(crate) fn attach(self: &Arc<Self>, inode: Arc<Inode>) {
        inode.add_alias(self);
        let prev = self.inode.write().replace(inode);
        debug_assert!(prev.is_none(), "dentry attached twice");
    }

    /// Acquire one usage count. The caller must already hold one, or hold a
    /// lock (the dcache table lock) that pins the entry.
    pub(crate) fn grab(&self) {
        let mut st = self.state.lock();
        st.count += 1;
        st.flags.insert(DentryFlags::USED);
    }

    /// Release one usage count. The last release parks the entry on the LRU,
    /// or frees it when it is DYING.
    pub(crate) fn put(self: &Arc<Self>) {
        let mut st = self.state.lock();
        debug_assert!(st.count > 0, "dentry usage count underflow");
        st.count -= 1;
        if st.count > 0 {
            return;
        }
        if st.flags.contains(DentryFlags::DYING) {
            drop(st);
            self.free();
            return;
        }
        // Unused but cached: park for resurrection. LRU lock nests inside
        // the state lock.
        st.flags.remove(DentryFlags::USED);
        self.sb.dcache().lru_insert(self);
    }

    /// Mark for teardown; the final `put` frees instead of parking.
    pub(crate) fn mark_dying(&self) {
        self.state.lock().flags.insert(DentryFlags::DYING);
    }

    /// Tear down an entry whose usage count is zero and which is no longer
    /// reachable from the cache. Runs with no VFS lock held and unwinds the
    /// counted links: mount, inode, parent.
    pub(crate) fn free(self: &Arc<Self>) {
        debug_assert_eq!(self.state.lock().count, 0, "freeing a referenced dentry");
        trace!("freeing dentry '{}'", self.name());
        self.ops.release(self);
        if let Some(mnt) = self.mounted.write().take() {
            mnt.put();
        }
        let inode = self.inode.write().take();
        if let Some(ino) = inode {
            ino.drop_alias(self);
            self.ops.detach_inode(self, &ino);
            ino.put();
        }
        let parent = self.links.write().parent.take();
        if let Some(p) = parent {
            p.forget_subdir(self);
            p.put();
        }
    }

    /// True when both entries name the same (parent, name) key.
    pub(crate) fn same_key(&self, other: &Dentry, ops: &dyn DentryOps) -> bool {
        let a = self.links.read();
        let b = other.links.read();
        match (&a.parent, &b.parent) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y) && ops.compare(&a.name, &b.name),
            _ => false,
        }
    }

    /// True when this cached entry answers a probe for `name` under `parent`.
    pub(crate) fn matches(&self, parent: &Arc<Dentry>, name: &str) -> bool {
        let l = self.links.read();
        match &l.parent {
            Some(p) => Arc::ptr_eq(p, parent) && self.ops.compare(&l.name, name),
            None => false,
        }
    }

    /// Move the entry to a new (parent, name) key. Only called on an entry
    /// that has been removed from the cache table.
    pub(crate) fn rekey(&self, new_parent: &Arc<Dentry>, name: &str, hash: u64) {
        new_parent.grab();
        let old = {
            let mut l = self.links.write();
            let old = l.parent.replace(new_parent.clone());
            l.name = name.to_string();
            l.hash = hash;
            old
        };
        if let Some(p) = old {
            p.put();
        }
    }

    /// Filesystem mounted here, if any.
    pub(crate) fn mounted(&self) -> Option<Arc<VfsMount>> {
        self.mounted.read().clone()
    }

    /// True when a filesystem is mounted on this entry.
    pub fn is_mount_point(&self) -> bool {
        self.mounted.read().is_some()
    }

    /// Install a mount on this entry, consuming a counted mount ref.
    pub(crate) fn set_mounted(&self, mnt: Arc<VfsMount>) {
        self.state.lock().flags.insert(DentryFlags::MOUNT_POINT);
        *self.mounted.write() = Some(mnt);
    }

    /// Remove the mount from this entry, returning the counted ref it held.
    pub(crate) fn clear_mounted(&self) -> Option<Arc<VfsMount>> {
        self.state.lock().flags.remove(DentryFlags::MOUNT_POINT);
        self.mounted.write().take()
    }

    pub(crate) fn add_subdir(&self, child: &Arc<Dentry>) {
        let mut subs = self.subdirs.lock();
        subs.retain(|w| w.strong_count() > 0);
        subs.push(Arc::downgrade(child));
    }

    pub(crate) fn forget_subdir(&self, child: &Dentry) {
        self.subdirs
            .lock()
            .retain(|w| w.as_ptr() != child as *const Dentry);
    }
}
