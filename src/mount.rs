//! Mounts and namespaces.
//!
//! A `VfsMount` ties one superblock's root into the tree at a mountpoint
//! dentry. The mountpoint holds a counted reference to the mount and the
//! mount holds counted references back to the mountpoint, its parent mount,
//! and its root dentry; an attached mount is therefore pinned until the
//! namespace goes away, which is the intended lifetime.

use std::sync::{Arc, OnceLock, Weak};

use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::dentry::Dentry;
use crate::sb::SuperBlock;

/// One mounted instance of a filesystem in a namespace.
pub struct VfsMount {
    /// Mount this one is attached under; `None` for the namespace root.
    parent: Option<Arc<VfsMount>>,
    /// Dentry this mount covers; `None` for the namespace root.
    mountpoint: Option<Arc<Dentry>>,
    root: OnceLock<Arc<Dentry>>,
    sb: OnceLock<Arc<SuperBlock>>,
    ns: Weak<Namespace>,
    children: Mutex<Vec<Weak<VfsMount>>>,
    count: Mutex<u32>,
}

impl VfsMount {
    /// New mount with count 1 for the creator. Takes ownership of counted
    /// references to the parent mount and mountpoint dentry.
    pub(crate) fn new(
        ns: &Arc<Namespace>,
        parent: Option<Arc<VfsMount>>,
        mountpoint: Option<Arc<Dentry>>,
    ) -> Arc<VfsMount> {
        Arc::new(VfsMount {
            parent,
            mountpoint,
            root: OnceLock::new(),
            sb: OnceLock::new(),
            ns: Arc::downgrade(ns),
            children: Mutex::new(Vec::new()),
            count: Mutex::new(1),
        })
    }

    /// Root dentry of the mounted filesystem. Only valid once the
    /// superblock has been initialized.
    pub fn root(&self) -> Arc<Dentry> {
        self.root
            .get()
            .cloned()
            .expect("mount root not initialized")
    }

    /// The superblock this mount serves.
    pub fn sb(&self) -> Arc<SuperBlock> {
        self.sb
            .get()
            .cloned()
            .expect("mount superblock not initialized")
    }

    /// Dentry this mount covers, if attached.
    pub fn mountpoint(&self) -> Option<Arc<Dentry>> {
        self.mountpoint.clone()
    }

    /// Parent mount, if attached.
    pub fn parent(&self) -> Option<Arc<VfsMount>> {
        self.parent.clone()
    }

    /// Namespace this mount belongs to, while it still exists.
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.ns.upgrade()
    }

    /// Takes ownership of a counted root-dentry reference.
    pub(crate) fn set_root(&self, root: Arc<Dentry>) {
        if self.root.set(root).is_err() {
            panic!("mount root set twice");
        }
    }

    pub(crate) fn set_sb(&self, sb: Arc<SuperBlock>) {
        if self.sb.set(sb).is_err() {
            panic!("mount superblock set twice");
        }
    }

    pub(crate) fn add_child(&self, child: &Arc<VfsMount>) {
        let mut children = self.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(child));
    }

    /// Number of mounts attached under this one.
    pub fn child_count(&self) -> usize {
        let mut children = self.children.lock();
        children.retain(|w| w.strong_count() > 0);
        children.len()
    }

    pub(crate) fn grab(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn put(self: &Arc<Self>) {
        let remaining = {
            let mut count = self.count.lock();
            debug_assert!(*count > 0, "mount count underflow");
            *count -= 1;
            *count
        };
        if remaining > 0 {
            return;
        }
        trace!("freeing mount of '{}'", self.sb.get().map(|s| s.name().to_string()).unwrap_or_default());
        if let Some(root) = self.root.get() {
            root.mark_dying();
            root.put();
        }
        if let Some(pt) = &self.mountpoint {
            pt.put();
        }
        if let Some(parent) = &self.parent {
            parent.put();
        }
    }
}

/// A mount namespace: the root mount plus every mount attached beneath it.
pub struct Namespace {
    root: RwLock<Option<Arc<VfsMount>>>,
    mounts: Mutex<Vec<Arc<VfsMount>>>,
}

impl Namespace {
    pub(crate) fn new() -> Arc<Namespace> {
        Arc::new(Namespace {
            root: RwLock::new(None),
            mounts: Mutex::new(Vec::new()),
        })
    }

    /// The namespace's root mount, once one is set.
    pub fn root(&self) -> Option<Arc<VfsMount>> {
        self.root.read().clone()
    }

    pub(crate) fn set_root(&self, mnt: Arc<VfsMount>) {
        *self.root.write() = Some(mnt);
    }

    /// Register a mount; the list's reference is the one the creator made.
    pub(crate) fn add_mount(&self, mnt: Arc<VfsMount>) {
        self.mounts.lock().push(mnt);
    }

    /// Number of mounts in the namespace.
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }
}
