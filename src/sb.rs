//! Superblocks: one per mounted filesystem instance.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::dcache::{CacheStats, DentryCache};
use crate::dentry::Dentry;
use crate::error::Result;
use crate::file::File;
use crate::icache::InodeCache;
use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::ops::{DentryOps, FileOps, InodeOps, SuperOps};

/// One mounted filesystem instance: its caches, its capability handles, and
/// bookkeeping of live inodes and open files.
pub struct SuperBlock {
    name: String,
    sops: Arc<dyn SuperOps>,
    iops: Arc<dyn InodeOps>,
    fops: Arc<dyn FileOps>,
    dops: Arc<dyn DentryOps>,
    dcache: DentryCache,
    icache: InodeCache,
    root: OnceLock<Arc<Dentry>>,
    mount: RwLock<Weak<VfsMount>>,
    inodes: Mutex<Vec<Weak<Inode>>>,
    files: Mutex<Vec<Weak<File>>>,
    /// Serializes renames within this superblock.
    rename_lock: Mutex<()>,
}

impl SuperBlock {
    /// Build a superblock around a backend's capability handles. The root is
    /// wired in afterwards by [`init_sb`].
    pub fn new(
        name: &str,
        sops: Arc<dyn SuperOps>,
        iops: Arc<dyn InodeOps>,
        fops: Arc<dyn FileOps>,
        dops: Arc<dyn DentryOps>,
    ) -> Arc<SuperBlock> {
        Arc::new(SuperBlock {
            name: name.to_string(),
            sops,
            iops,
            fops,
            dcache: DentryCache::new(dops.clone()),
            icache: InodeCache::new(),
            dops,
            root: OnceLock::new(),
            mount: RwLock::new(Weak::new()),
            inodes: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            rename_lock: Mutex::new(()),
        })
    }

    /// Device or source name given at mount time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root dentry. Only valid after [`init_sb`].
    pub fn root(&self) -> Arc<Dentry> {
        self.root
            .get()
            .cloned()
            .expect("superblock root not initialized")
    }

    pub(crate) fn sops(&self) -> &Arc<dyn SuperOps> {
        &self.sops
    }

    pub(crate) fn iops(&self) -> &Arc<dyn InodeOps> {
        &self.iops
    }

    pub(crate) fn fops(&self) -> &Arc<dyn FileOps> {
        &self.fops
    }

    pub(crate) fn dops(&self) -> &Arc<dyn DentryOps> {
        &self.dops
    }

    pub(crate) fn dcache(&self) -> &DentryCache {
        &self.dcache
    }

    pub(crate) fn icache(&self) -> &InodeCache {
        &self.icache
    }

    /// The mount this superblock serves.
    pub(crate) fn mount(&self) -> Option<Arc<VfsMount>> {
        self.mount.read().upgrade()
    }

    pub(crate) fn set_mount(&self, mnt: &Arc<VfsMount>) {
        *self.mount.write() = Arc::downgrade(mnt);
    }

    pub(crate) fn rename_lock(&self) -> MutexGuard<'_, ()> {
        self.rename_lock.lock()
    }

    pub(crate) fn register_inode(&self, inode: &Arc<Inode>) {
        let mut inodes = self.inodes.lock();
        inodes.retain(|w| w.strong_count() > 0);
        inodes.push(Arc::downgrade(inode));
    }

    pub(crate) fn register_file(&self, file: &Arc<File>) {
        let mut files = self.files.lock();
        files.retain(|w| w.strong_count() > 0);
        files.push(Arc::downgrade(file));
    }

    pub(crate) fn unregister_file(&self, file: &File) {
        self.files
            .lock()
            .retain(|w| w.as_ptr() != file as *const File);
    }

    /// Number of in-core inodes still allocated.
    pub fn live_inodes(&self) -> usize {
        let mut inodes = self.inodes.lock();
        inodes.retain(|w| w.strong_count() > 0);
        inodes.len()
    }

    /// Number of open files on this superblock.
    pub fn open_files(&self) -> usize {
        let mut files = self.files.lock();
        files.retain(|w| w.strong_count() > 0);
        files.len()
    }

    /// Dentry-cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.dcache.stats()
    }

    /// Number of cached inodes.
    pub fn cached_inodes(&self) -> usize {
        self.icache.len()
    }
}

/// Wire a superblock into its mount: load the root inode, build the root
/// dentry (parented on the mountpoint when there is one), and hand the mount
/// its counted root reference.
pub fn init_sb(sb: &Arc<SuperBlock>, mnt: &Arc<VfsMount>, root_ino: u64) -> Result<Arc<Dentry>> {
    sb.set_mount(mnt);
    mnt.set_sb(sb.clone());
    let root = Dentry::new_root(sb, sb.dops().clone(), mnt.mountpoint().as_ref());
    let inode = Inode::iget(sb, root_ino)?;
    root.attach(inode);
    let root = sb.dcache().put(root);
    if sb.root.set(root.clone()).is_err() {
        panic!("superblock '{}' initialized twice", sb.name());
    }
    // The creation count moves to the mount, which pins the root for the
    // life of the superblock.
    mnt.set_root(root.clone());
    Ok(root)
}
