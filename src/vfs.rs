//! The VFS instance: filesystem-type registry, mount entry point, and the
//! path-based operations.
//!
//! A `Vfs` is self-contained; tests build a fresh one per case and nothing
//! here is process-global. The mutating operations all follow the same
//! shape: parent-walk the path, look up the final component, drive the
//! backend capability, then fix up the caches and counts.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};

use crate::dentry::Dentry;
use crate::error::{Result, VfsError};
use crate::file::{dentry_open, truncate_inode, File, OpenFlags};
use crate::inode::Inode;
use crate::mount::{Namespace, VfsMount};
use crate::ops::{FilesystemType, Intent, NodeKind};
use crate::sb::SuperBlock;
use crate::walk::{do_lookup, path_lookup, LookupFlags, Nameidata, PathRef};

/// Per-caller root and working directory, each held with usage counts.
pub struct FsContext {
    root: RwLock<(Arc<Dentry>, Arc<VfsMount>)>,
    pwd: RwLock<(Arc<Dentry>, Arc<VfsMount>)>,
}

impl FsContext {
    fn new(root_d: &Arc<Dentry>, root_m: &Arc<VfsMount>) -> FsContext {
        // One count each for the root slot and the pwd slot.
        root_d.grab();
        root_m.grab();
        root_d.grab();
        root_m.grab();
        FsContext {
            root: RwLock::new((root_d.clone(), root_m.clone())),
            pwd: RwLock::new((root_d.clone(), root_m.clone())),
        }
    }

    fn root_ref(&self) -> (Arc<Dentry>, Arc<VfsMount>) {
        let guard = self.root.read();
        guard.0.grab();
        guard.1.grab();
        (guard.0.clone(), guard.1.clone())
    }

    fn pwd_ref(&self) -> (Arc<Dentry>, Arc<VfsMount>) {
        let guard = self.pwd.read();
        guard.0.grab();
        guard.1.grab();
        (guard.0.clone(), guard.1.clone())
    }

    fn set_pwd(&self, d: &Arc<Dentry>, m: &Arc<VfsMount>) {
        d.grab();
        m.grab();
        let (old_d, old_m) = {
            let mut guard = self.pwd.write();
            std::mem::replace(&mut *guard, (d.clone(), m.clone()))
        };
        old_d.put();
        old_m.put();
    }
}

/// A counted dentry reference that is released when the scope ends, so every
/// error return inside a mutating operation unwinds its lookup reference.
struct HeldDentry(Arc<Dentry>);

impl Deref for HeldDentry {
    type Target = Arc<Dentry>;

    fn deref(&self) -> &Arc<Dentry> {
        &self.0
    }
}

impl Drop for HeldDentry {
    fn drop(&mut self) {
        self.0.put();
    }
}

/// One VFS instance.
pub struct Vfs {
    fs_types: RwLock<HashMap<String, Arc<dyn FilesystemType>>>,
    superblocks: Mutex<Vec<Arc<SuperBlock>>>,
    ns: Arc<Namespace>,
    ctx: OnceLock<Arc<FsContext>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Vfs::new()
    }
}

impl Vfs {
    /// Empty instance: no filesystem types, nothing mounted.
    pub fn new() -> Vfs {
        Vfs {
            fs_types: RwLock::new(HashMap::new()),
            superblocks: Mutex::new(Vec::new()),
            ns: Namespace::new(),
            ctx: OnceLock::new(),
        }
    }

    /// Make a filesystem type mountable by name.
    pub fn register_fs(&self, fs: Arc<dyn FilesystemType>) {
        let name = fs.name().to_string();
        debug!("registered filesystem type '{}'", name);
        self.fs_types.write().insert(name, fs);
    }

    /// The instance's mount namespace.
    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    fn context(&self) -> Result<&Arc<FsContext>> {
        self.ctx
            .get()
            .ok_or_else(|| VfsError::InvalidPath("no root filesystem mounted".to_string()))
    }

    fn walk(&self, path: &str, flags: LookupFlags, intent: Intent) -> Result<Nameidata> {
        let ctx = self.context()?;
        let root = ctx.root_ref();
        let start = if path.starts_with('/') {
            ctx.root_ref()
        } else {
            ctx.pwd_ref()
        };
        path_lookup(root, start, path, flags, intent)
    }

    /// Mount a registered filesystem. `target` of `None` mounts the
    /// namespace root (allowed once); otherwise the target must resolve to a
    /// directory, which becomes the mountpoint.
    pub fn mount(&self, fstype: &str, device: &str, target: Option<&str>) -> Result<Arc<VfsMount>> {
        let fs = self
            .fs_types
            .read()
            .get(fstype)
            .cloned()
            .ok_or(VfsError::Unsupported)?;
        let (mountpoint, parent_mnt) = match target {
            Some(path) => {
                let at = self.resolve_with(
                    path,
                    LookupFlags::FOLLOW | LookupFlags::DIRECTORY,
                )?;
                let (d, m) = at.into_parts();
                (Some(d), Some(m))
            }
            None => {
                if self.ctx.get().is_some() {
                    return Err(VfsError::Busy("a root filesystem is already mounted".to_string()));
                }
                (None, None)
            }
        };
        let mnt = VfsMount::new(&self.ns, parent_mnt.clone(), mountpoint.clone());
        if let Some(pt) = &mountpoint {
            // The mountpoint holds a counted mount reference.
            mnt.grab();
            pt.set_mounted(mnt.clone());
        }
        if let Some(parent) = &parent_mnt {
            parent.add_child(&mnt);
        }
        let sb = match fs.mount(device, &mnt) {
            Ok(sb) => sb,
            Err(e) => {
                if let Some(pt) = &mountpoint {
                    if let Some(m) = pt.clear_mounted() {
                        m.put();
                    }
                }
                mnt.put();
                return Err(e);
            }
        };
        self.superblocks.lock().push(sb.clone());
        self.ns.add_mount(mnt.clone());
        if mountpoint.is_none() {
            self.ns.set_root(mnt.clone());
            let root = mnt.root();
            let _ = self.ctx.set(Arc::new(FsContext::new(&root, &mnt)));
        }
        info!(
            "mounted {} ({}) at {}",
            fstype,
            device,
            target.unwrap_or("/")
        );
        Ok(mnt)
    }

    /// Resolve a path, following symlinks and mounts.
    pub fn resolve(&self, path: &str) -> Result<PathRef> {
        self.resolve_with(path, LookupFlags::FOLLOW)
    }

    /// Resolve with explicit walk flags. An empty flag set leaves a final
    /// symlink unfollowed.
    pub fn resolve_with(&self, path: &str, flags: LookupFlags) -> Result<PathRef> {
        let nd = self.walk(path, flags, Intent::Access)?;
        Ok(nd.into_path_ref())
    }

    /// Open a file, creating it when asked to.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Arc<File>> {
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(VfsError::InvalidPath(
                "open requires read or write access".to_string(),
            ));
        }
        match self.walk(path, LookupFlags::FOLLOW, Intent::Open) {
            Ok(nd) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(VfsError::AlreadyExists(path.to_string()));
                }
                finish_open(nd.dentry(), nd.mnt(), flags)
            }
            Err(VfsError::NotFound(_)) if flags.contains(OpenFlags::CREATE) => {
                let nd = self.walk(
                    path,
                    LookupFlags::PARENT | LookupFlags::FOLLOW,
                    Intent::Create,
                )?;
                if nd.wants_directory() {
                    return Err(VfsError::IsADirectory(path.to_string()));
                }
                let (name, hash) = nd.last();
                match do_lookup(nd.dentry(), name)? {
                    Some(existing) => {
                        // Another creator got in between the two walks.
                        let existing = HeldDentry(existing);
                        if flags.contains(OpenFlags::EXCL) {
                            return Err(VfsError::AlreadyExists(path.to_string()));
                        }
                        if existing.d_inode().kind().is_symlink() {
                            // A dangling link: the FOLLOW walk already failed
                            // on its target, and the link object itself is
                            // not openable.
                            return Err(VfsError::NotFound(path.to_string()));
                        }
                        finish_open(&existing, nd.mnt(), flags)
                    }
                    None => {
                        let dir = nd.dentry().d_inode();
                        let ino = dir.ops().create(&dir, name, mode)?;
                        let inode = Inode::iget(nd.dentry().sb(), ino)?;
                        let d = HeldDentry(instantiate(nd.dentry(), name, hash, inode));
                        debug!("created '{}'", path);
                        finish_open(&d, nd.mnt(), flags)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let nd = self.walk(
            path,
            LookupFlags::PARENT | LookupFlags::FOLLOW,
            Intent::Create,
        )?;
        let (name, hash) = nd.last();
        if let Some(existing) = do_lookup(nd.dentry(), name)? {
            existing.put();
            return Err(VfsError::AlreadyExists(path.to_string()));
        }
        let dir = nd.dentry().d_inode();
        let ino = dir.ops().mkdir(&dir, name, mode)?;
        // The child's ".." is a new link on the parent.
        dir.inc_nlink();
        dir.mark_dirty();
        let inode = Inode::iget(nd.dentry().sb(), ino)?;
        let d = HeldDentry(instantiate(nd.dentry(), name, hash, inode));
        nd.dentry().add_subdir(&d);
        debug!("mkdir '{}'", path);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let nd = self.walk(path, LookupFlags::PARENT, Intent::Access)?;
        let (name, _) = nd.last();
        let victim = HeldDentry(
            do_lookup(nd.dentry(), name)?
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?,
        );
        let vino = victim.d_inode();
        if !vino.kind().is_dir() {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        if victim.is_mount_point() {
            return Err(VfsError::Busy(path.to_string()));
        }
        let dir = nd.dentry().d_inode();
        dir.ops().rmdir(&dir, name)?;
        victim.mark_dying();
        nd.dentry().sb().dcache().remove(&victim);
        vino.dec_nlink();
        vino.mark_dirty();
        dir.dec_nlink();
        dir.mark_dirty();
        nd.dentry().forget_subdir(&victim);
        debug!("rmdir '{}'", path);
        Ok(())
    }

    /// Remove a non-directory name. The object itself survives while other
    /// links or open files keep it alive.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let nd = self.walk(path, LookupFlags::PARENT, Intent::Access)?;
        let (name, _) = nd.last();
        let victim = HeldDentry(
            do_lookup(nd.dentry(), name)?
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?,
        );
        let vino = victim.d_inode();
        if vino.kind().is_dir() {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        let dir = nd.dentry().d_inode();
        dir.ops().unlink(&dir, name)?;
        victim.mark_dying();
        nd.dentry().sb().dcache().remove(&victim);
        vino.dec_nlink();
        vino.mark_dirty();
        debug!("unlinked '{}'", path);
        Ok(())
    }

    /// Create a hard link to an existing regular file on the same
    /// superblock.
    pub fn link(&self, existing: &str, new_path: &str) -> Result<()> {
        let src = self.walk(existing, LookupFlags::FOLLOW, Intent::Access)?;
        let src_inode = src.dentry().d_inode();
        if src_inode.kind() != NodeKind::File {
            return Err(VfsError::PermissionDenied(
                "hard links must target regular files".to_string(),
            ));
        }
        let nd = self.walk(
            new_path,
            LookupFlags::PARENT | LookupFlags::FOLLOW,
            Intent::Create,
        )?;
        if !Arc::ptr_eq(src.dentry().sb(), nd.dentry().sb()) {
            return Err(VfsError::CrossDevice);
        }
        let (name, hash) = nd.last();
        if let Some(d) = do_lookup(nd.dentry(), name)? {
            d.put();
            return Err(VfsError::AlreadyExists(new_path.to_string()));
        }
        let dir = nd.dentry().d_inode();
        dir.ops().link(&src_inode, &dir, name)?;
        src_inode.inc_nlink();
        src_inode.mark_dirty();
        // The new alias shares the inode; take its counted reference.
        src_inode.grab();
        let _d = HeldDentry(instantiate(nd.dentry(), name, hash, src_inode.clone()));
        debug!("linked '{}' -> '{}'", new_path, existing);
        Ok(())
    }

    /// Create a symbolic link holding `target`.
    pub fn symlink(&self, path: &str, target: &str) -> Result<()> {
        let nd = self.walk(path, LookupFlags::PARENT, Intent::Create)?;
        let (name, hash) = nd.last();
        if let Some(d) = do_lookup(nd.dentry(), name)? {
            d.put();
            return Err(VfsError::AlreadyExists(path.to_string()));
        }
        let dir = nd.dentry().d_inode();
        let ino = dir.ops().symlink(&dir, name, target)?;
        let inode = Inode::iget(nd.dentry().sb(), ino)?;
        let _d = HeldDentry(instantiate(nd.dentry(), name, hash, inode));
        debug!("symlinked '{}' -> '{}'", path, target);
        Ok(())
    }

    /// Move `old_path` to `new_path` on the same superblock, replacing an
    /// existing destination. The destination is unlinked before the backend
    /// rename; if the backend then fails, the source is restored under its
    /// old name and the already-removed destination stays gone.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let nd_old = self.walk(old_path, LookupFlags::PARENT, Intent::Access)?;
        let nd_new = self.walk(new_path, LookupFlags::PARENT, Intent::Create)?;
        let sb = nd_old.dentry().sb().clone();
        if !Arc::ptr_eq(&sb, nd_new.dentry().sb()) {
            return Err(VfsError::CrossDevice);
        }
        let _serialized = sb.rename_lock();
        let (old_name, _) = nd_old.last();
        let (new_name, new_hash) = nd_new.last();
        let src = HeldDentry(
            do_lookup(nd_old.dentry(), old_name)?
                .ok_or_else(|| VfsError::NotFound(old_path.to_string()))?,
        );
        let src_inode = src.d_inode();
        let old_dir = nd_old.dentry().d_inode();
        let new_dir = nd_new.dentry().d_inode();

        if let Some(dst) = do_lookup(nd_new.dentry(), new_name)? {
            let dst = HeldDentry(dst);
            if Arc::ptr_eq(&dst.0, &src.0) {
                return Ok(());
            }
            let dst_inode = dst.d_inode();
            if dst_inode.kind().is_dir() && !src_inode.kind().is_dir() {
                return Err(VfsError::IsADirectory(new_path.to_string()));
            }
            if !dst_inode.kind().is_dir() && src_inode.kind().is_dir() {
                return Err(VfsError::NotADirectory(new_path.to_string()));
            }
            if dst.is_mount_point() {
                return Err(VfsError::Busy(new_path.to_string()));
            }
            if dst_inode.kind().is_dir() {
                new_dir.ops().rmdir(&new_dir, new_name)?;
                dst_inode.dec_nlink();
                new_dir.dec_nlink();
                new_dir.mark_dirty();
                nd_new.dentry().forget_subdir(&dst);
            } else {
                new_dir.ops().unlink(&new_dir, new_name)?;
                dst_inode.dec_nlink();
            }
            dst_inode.mark_dirty();
            dst.mark_dying();
            sb.dcache().remove(&dst);
            debug!("rename: unlinked existing destination '{}'", new_path);
        }

        sb.dcache().remove(&src);
        match old_dir.ops().rename(&old_dir, old_name, &new_dir, new_name) {
            Ok(()) => {
                src.rekey(nd_new.dentry(), new_name, new_hash);
                if src_inode.kind().is_dir() && !Arc::ptr_eq(nd_old.dentry(), nd_new.dentry()) {
                    // The child's ".." moved with it.
                    nd_old.dentry().forget_subdir(&src);
                    nd_new.dentry().add_subdir(&src);
                    old_dir.dec_nlink();
                    old_dir.mark_dirty();
                    new_dir.inc_nlink();
                    new_dir.mark_dirty();
                }
                let winner = sb.dcache().put(src.0.clone());
                if !Arc::ptr_eq(&winner, &src.0) {
                    src.mark_dying();
                    winner.put();
                }
                info!("renamed '{}' -> '{}'", old_path, new_path);
                Ok(())
            }
            Err(e) => {
                // Keep the source reachable under its old key. The unlinked
                // destination cannot be brought back.
                let winner = sb.dcache().put(src.0.clone());
                if !Arc::ptr_eq(&winner, &src.0) {
                    src.mark_dying();
                    winner.put();
                }
                error!(
                    "rename '{}' -> '{}' failed after unlinking the destination: {}",
                    old_path, new_path, e
                );
                Err(e)
            }
        }
    }

    /// Resize a regular file.
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let at = self.resolve(path)?;
        let inode = at.dentry().d_inode();
        match inode.kind() {
            NodeKind::Dir => Err(VfsError::IsADirectory(path.to_string())),
            NodeKind::Symlink => Err(VfsError::InvalidPath(format!(
                "{path} is not a regular file"
            ))),
            NodeKind::File => truncate_inode(&inode, len),
        }
    }

    /// Read a symlink's target without following it.
    pub fn read_link(&self, path: &str) -> Result<String> {
        let nd = self.walk(path, LookupFlags::empty(), Intent::Access)?;
        let inode = nd.dentry().d_inode();
        if !inode.kind().is_symlink() {
            return Err(VfsError::InvalidPath(format!(
                "{path} is not a symbolic link"
            )));
        }
        inode.ops().readlink(&inode)
    }

    /// Change the working directory used by relative paths.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let nd = self.walk(
            path,
            LookupFlags::FOLLOW | LookupFlags::DIRECTORY,
            Intent::Access,
        )?;
        let ctx = self.context()?;
        ctx.set_pwd(nd.dentry(), nd.mnt());
        debug!("chdir '{}'", path);
        Ok(())
    }

    /// Evict unused dentries on every superblock; returns entries freed.
    pub fn prune_caches(&self, negative_only: bool) -> usize {
        let sbs: Vec<Arc<SuperBlock>> = self.superblocks.lock().clone();
        sbs.iter()
            .map(|sb| sb.dcache().prune(negative_only))
            .sum()
    }
}

/// Bind a freshly created backend object into the caches: build the dentry,
/// attach the counted inode, insert, and reconcile a concurrent insert.
/// Returns a counted dentry.
fn instantiate(parent: &Arc<Dentry>, name: &str, hash: u64, inode: Arc<Inode>) -> Arc<Dentry> {
    let d = Dentry::new(parent, name, hash);
    d.attach(inode);
    let winner = parent.sb().dcache().put(d.clone());
    if !Arc::ptr_eq(&winner, &d) {
        d.mark_dying();
        d.put();
    }
    winner
}

/// Open a dentry, applying truncate-on-open.
fn finish_open(dentry: &Arc<Dentry>, mnt: &Arc<VfsMount>, flags: OpenFlags) -> Result<Arc<File>> {
    let file = dentry_open(dentry, mnt, flags)?;
    if flags.contains(OpenFlags::TRUNC)
        && file.inode().kind() == NodeKind::File
        && file.inode().size() > 0
    {
        if let Err(e) = truncate_inode(file.inode(), 0) {
            file.put();
            return Err(e);
        }
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::memfs::{MemFs, MEMFS_ROOT_INO};
    use crate::ops::{DirEntry, FileOps, GenericDentryOps, InodeInit, InodeOps, SuperOps};
    use crate::sb::init_sb;

    /// Forwards every capability to an inner memfs, with switches to make
    /// rename and truncate fail; exercises the backend-failure recovery
    /// paths that a healthy backend never reaches.
    struct FlakyFs {
        inner: Arc<MemFs>,
        fail_rename: AtomicBool,
        fail_truncate: AtomicBool,
    }

    impl FlakyFs {
        fn new() -> Arc<FlakyFs> {
            Arc::new(FlakyFs {
                inner: Arc::new(MemFs::new_store()),
                fail_rename: AtomicBool::new(false),
                fail_truncate: AtomicBool::new(false),
            })
        }
    }

    impl SuperOps for FlakyFs {
        fn read_inode(&self, ino: u64) -> Result<InodeInit> {
            self.inner.read_inode(ino)
        }

        fn write_inode(&self, inode: &Inode) -> Result<()> {
            self.inner.write_inode(inode)
        }

        fn delete_inode(&self, inode: &Inode) -> Result<()> {
            self.inner.delete_inode(inode)
        }
    }

    impl InodeOps for FlakyFs {
        fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<u64>> {
            self.inner.lookup(dir, name)
        }

        fn create(&self, dir: &Inode, name: &str, mode: u32) -> Result<u64> {
            self.inner.create(dir, name, mode)
        }

        fn unlink(&self, dir: &Inode, name: &str) -> Result<()> {
            self.inner.unlink(dir, name)
        }

        fn rename(
            &self,
            old_dir: &Inode,
            old_name: &str,
            new_dir: &Inode,
            new_name: &str,
        ) -> Result<()> {
            if self.fail_rename.load(Ordering::SeqCst) {
                return Err(VfsError::Busy("injected backend failure".to_string()));
            }
            self.inner.rename(old_dir, old_name, new_dir, new_name)
        }

        fn truncate(&self, inode: &Inode, len: u64) -> Result<()> {
            if self.fail_truncate.load(Ordering::SeqCst) {
                return Err(VfsError::Busy("injected backend failure".to_string()));
            }
            self.inner.truncate(inode, len)
        }
    }

    impl FileOps for FlakyFs {
        fn read(&self, file: &File, buf: &mut [u8], off: u64) -> Result<usize> {
            self.inner.read(file, buf, off)
        }

        fn write(&self, file: &File, buf: &[u8], off: u64) -> Result<usize> {
            self.inner.write(file, buf, off)
        }

        fn readdir(&self, file: &File) -> Result<Vec<DirEntry>> {
            self.inner.readdir(file)
        }
    }

    struct FlakyFsType(Arc<FlakyFs>);

    impl FilesystemType for FlakyFsType {
        fn name(&self) -> &str {
            "flakyfs"
        }

        fn mount(&self, device: &str, mnt: &Arc<VfsMount>) -> Result<Arc<SuperBlock>> {
            let sb = SuperBlock::new(
                device,
                self.0.clone(),
                self.0.clone(),
                self.0.clone(),
                Arc::new(GenericDentryOps),
            );
            init_sb(&sb, mnt, MEMFS_ROOT_INO)?;
            Ok(sb)
        }
    }

    fn flaky_vfs() -> (Vfs, Arc<FlakyFs>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let fs = FlakyFs::new();
        let vfs = Vfs::new();
        vfs.register_fs(Arc::new(FlakyFsType(fs.clone())));
        vfs.mount("flakyfs", "flaky0", None).unwrap();
        (vfs, fs)
    }

    fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
        let f = vfs
            .open(path, OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
            .unwrap();
        f.write(data).unwrap();
        f.put();
    }

    fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
        let f = vfs.open(path, OpenFlags::READ, 0).unwrap();
        let mut buf = [0u8; 64];
        let n = f.read(&mut buf).unwrap();
        f.put();
        buf[..n].to_vec()
    }

    #[test]
    fn failed_rename_keeps_the_source_reachable() {
        let (vfs, fs) = flaky_vfs();
        write_file(&vfs, "/src", b"survivor");
        write_file(&vfs, "/dst", b"casualty");

        fs.fail_rename.store(true, Ordering::SeqCst);
        assert!(matches!(vfs.rename("/src", "/dst"), Err(VfsError::Busy(_))));
        fs.fail_rename.store(false, Ordering::SeqCst);

        // The source is back under its old name, intact.
        assert_eq!(read_file(&vfs, "/src"), b"survivor");
        // The destination was unlinked before the backend call; it cannot be
        // brought back.
        assert!(matches!(vfs.resolve("/dst"), Err(VfsError::NotFound(_))));

        // A retry against a healthy backend goes through.
        vfs.rename("/src", "/dst").unwrap();
        assert_eq!(read_file(&vfs, "/dst"), b"survivor");
        assert!(matches!(vfs.resolve("/src"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn failed_truncate_leaves_the_size_alone() {
        let (vfs, fs) = flaky_vfs();
        write_file(&vfs, "/f", b"hello");

        fs.fail_truncate.store(true, Ordering::SeqCst);
        assert!(matches!(vfs.truncate("/f", 2), Err(VfsError::Busy(_))));
        fs.fail_truncate.store(false, Ordering::SeqCst);

        // In-core size and contents still agree with the backing store.
        assert_eq!(vfs.resolve("/f").unwrap().inode().unwrap().size(), 5);
        assert_eq!(read_file(&vfs, "/f"), b"hello");

        vfs.truncate("/f", 2).unwrap();
        assert_eq!(read_file(&vfs, "/f"), b"he");
    }
}
