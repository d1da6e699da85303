//! Iterative path resolution.
//!
//! `path_lookup` walks a path one component at a time over the dentry cache,
//! falling through to the backend on misses, crossing mount boundaries in
//! both directions and following symlinks up to [`MAX_SYMLINK_DEPTH`]. The
//! walk state lives in a `Nameidata`, which owns usage counts on the current
//! dentry and mount and releases them when dropped, so every early error
//! return unwinds correctly.

use std::sync::Arc;

use bitflags::bitflags;
use log::trace;

use crate::dentry::Dentry;
use crate::error::{Result, VfsError};
use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::ops::Intent;

/// Most symlinks a single resolution will follow before giving up.
pub const MAX_SYMLINK_DEPTH: u32 = 8;

bitflags! {
    /// Walk behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Follow a symlink in the final component.
        const FOLLOW = 1 << 0;
        /// The final component must resolve to a directory. Implied by a
        /// trailing slash.
        const DIRECTORY = 1 << 1;
        /// Stop at the parent directory and stash the final component
        /// instead of resolving it.
        const PARENT = 1 << 2;
    }
}

/// A resolved path position: a dentry and the mount it was reached through,
/// each with a usage count that is released exactly once, on drop.
pub struct PathRef {
    dentry: Option<Arc<Dentry>>,
    mnt: Option<Arc<VfsMount>>,
}

impl PathRef {
    pub(crate) fn new(dentry: Arc<Dentry>, mnt: Arc<VfsMount>) -> PathRef {
        PathRef {
            dentry: Some(dentry),
            mnt: Some(mnt),
        }
    }

    /// The resolved dentry.
    pub fn dentry(&self) -> &Arc<Dentry> {
        self.dentry.as_ref().expect("path reference already released")
    }

    /// The mount the dentry was reached through.
    pub fn mount(&self) -> &Arc<VfsMount> {
        self.mnt.as_ref().expect("path reference already released")
    }

    /// The resolved inode; `None` never happens for a successful resolve,
    /// but negative results are representable for internal callers.
    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.dentry().inode()
    }

    /// Dismantle into raw counted references; the caller takes over both.
    pub(crate) fn into_parts(mut self) -> (Arc<Dentry>, Arc<VfsMount>) {
        let d = self.dentry.take().expect("path reference already released");
        let m = self.mnt.take().expect("path reference already released");
        (d, m)
    }
}

impl Drop for PathRef {
    fn drop(&mut self) {
        if let Some(d) = self.dentry.take() {
            d.put();
        }
        if let Some(m) = self.mnt.take() {
            m.put();
        }
    }
}

/// Walk state. All `Arc` fields carry usage counts owned by the walk.
pub(crate) struct Nameidata {
    dentry: Arc<Dentry>,
    mnt: Arc<VfsMount>,
    flags: LookupFlags,
    intent: Intent,
    /// Symlinks followed so far; never decremented within one walk.
    depth: u32,
    /// Most recent symlink followed, pinned until the walk ends.
    last_sym: Option<Arc<Dentry>>,
    /// Final component stashed by a PARENT walk.
    last: Option<(String, u64)>,
    root_dentry: Arc<Dentry>,
    root_mnt: Arc<VfsMount>,
}

impl Drop for Nameidata {
    fn drop(&mut self) {
        self.dentry.put();
        self.mnt.put();
        self.root_dentry.put();
        self.root_mnt.put();
        if let Some(sym) = self.last_sym.take() {
            sym.put();
        }
    }
}

impl Nameidata {
    /// Current position.
    pub(crate) fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    pub(crate) fn mnt(&self) -> &Arc<VfsMount> {
        &self.mnt
    }

    /// Final component of a successful PARENT walk.
    pub(crate) fn last(&self) -> (&str, u64) {
        match &self.last {
            Some((name, hash)) => (name, *hash),
            None => panic!("parent walk did not stash a final component"),
        }
    }

    pub(crate) fn wants_directory(&self) -> bool {
        self.flags.contains(LookupFlags::DIRECTORY)
    }

    /// Convert into a caller-owned position, releasing the walk's own
    /// references.
    pub(crate) fn into_path_ref(self) -> PathRef {
        self.dentry.grab();
        self.mnt.grab();
        PathRef::new(self.dentry.clone(), self.mnt.clone())
    }

    /// Move the walk to `d`, swapping usage counts and tracking the mount
    /// the destination's superblock belongs to.
    fn step_to(&mut self, d: &Arc<Dentry>) {
        d.grab();
        let prev = std::mem::replace(&mut self.dentry, d.clone());
        prev.put();
        let mnt = d
            .sb()
            .mount()
            .expect("dentry's superblock has no live mount");
        if !Arc::ptr_eq(&mnt, &self.mnt) {
            mnt.grab();
            let prev_mnt = std::mem::replace(&mut self.mnt, mnt);
            prev_mnt.put();
        }
    }

    fn restart_at_root(&mut self) {
        let root = self.root_dentry.clone();
        self.step_to(&root);
    }
}

/// Resolve `path` from `start` (the caller picks the root or the working
/// directory based on the leading slash). `root` anchors absolute symlink
/// targets. Both pairs are counted references; the walk consumes them.
pub(crate) fn path_lookup(
    root: (Arc<Dentry>, Arc<VfsMount>),
    start: (Arc<Dentry>, Arc<VfsMount>),
    path: &str,
    mut flags: LookupFlags,
    intent: Intent,
) -> Result<Nameidata> {
    if path.is_empty() {
        root.0.put();
        root.1.put();
        start.0.put();
        start.1.put();
        return Err(VfsError::InvalidPath("empty path".to_string()));
    }
    if path.len() > 1 && path.ends_with('/') {
        flags |= LookupFlags::DIRECTORY;
    }
    let mut nd = Nameidata {
        dentry: start.0,
        mnt: start.1,
        flags,
        intent,
        depth: 0,
        last_sym: None,
        last: None,
        root_dentry: root.0,
        root_mnt: root.1,
    };
    trace!("path_lookup '{}' flags {:?}", path, flags);
    walk_components(&mut nd, path)?;
    Ok(nd)
}

/// Walk every component of `path` from the current position. Recurses (via
/// `enter_symlink`) for symlink targets; recursion depth is bounded by the
/// symlink budget.
fn walk_components(nd: &mut Nameidata, path: &str) -> Result<()> {
    let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if comps.is_empty() {
        // "/", ".", or an empty symlink remainder: the current position is
        // the answer.
        return finish_current(nd);
    }
    let n = comps.len();
    for (i, comp) in comps.iter().enumerate() {
        let last = i + 1 == n;
        let dir = nd.dentry().d_inode();
        if !dir.kind().is_dir() {
            return Err(VfsError::NotADirectory(nd.dentry().name()));
        }
        dir.ops().permission(&dir, nd.intent)?;
        match *comp {
            "." => {
                if last {
                    return finish_current(nd);
                }
            }
            ".." => {
                if last && nd.flags.contains(LookupFlags::PARENT) {
                    return Err(VfsError::InvalidPath(
                        "'..' cannot be the operated-on component".to_string(),
                    ));
                }
                climb_up(nd);
                follow_mount(nd);
                if last {
                    return finish_current(nd);
                }
            }
            name => {
                if last && nd.flags.contains(LookupFlags::PARENT) {
                    let hash = nd.dentry().ops().hash(name);
                    nd.last = Some((name.to_string(), hash));
                    return Ok(());
                }
                let next = do_lookup(nd.dentry(), name)?
                    .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
                let inode = next.d_inode();
                let follow = !last || nd.flags.contains(LookupFlags::FOLLOW);
                if inode.kind().is_symlink() && follow {
                    let entered = enter_symlink(nd, &next, last);
                    next.put();
                    entered?;
                    if last {
                        return finish_current(nd);
                    }
                } else {
                    nd.step_to(&next);
                    next.put();
                    follow_mount(nd);
                    if last {
                        return finish_current(nd);
                    }
                }
            }
        }
    }
    unreachable!("component loop always returns on the last component")
}

/// Final-position checks shared by every way a walk can end on an existing
/// object.
fn finish_current(nd: &mut Nameidata) -> Result<()> {
    if nd.flags.contains(LookupFlags::PARENT) {
        // The path names its own parent; nothing to operate on.
        return Err(VfsError::NotFound(nd.dentry().name()));
    }
    if nd.flags.contains(LookupFlags::DIRECTORY) {
        let inode = nd.dentry().d_inode();
        if !inode.kind().is_dir() {
            return Err(VfsError::NotADirectory(nd.dentry().name()));
        }
    }
    Ok(())
}

/// Step to the parent, crossing mount boundaries upward: at a mount root,
/// `..` means the mountpoint's parent. A climb at the global root is a
/// no-op, so `/..` resolves to `/`.
fn climb_up(nd: &mut Nameidata) {
    if nd.dentry.is_self_parent() {
        trace!("climb at the global root ignored");
        return;
    }
    loop {
        let mnt_root = nd.mnt.root();
        if !Arc::ptr_eq(&mnt_root, &nd.dentry) {
            break;
        }
        match nd.mnt.mountpoint() {
            Some(pt) => {
                trace!("crossing mount boundary up to '{}'", pt.name());
                nd.step_to(&pt);
            }
            None => {
                // Root mount of the namespace; nowhere further up.
                return;
            }
        }
    }
    let parent = nd.dentry.parent();
    nd.step_to(&parent);
}

/// Cross downward onto whatever is mounted on the current dentry; loops to
/// handle stacked mounts.
fn follow_mount(nd: &mut Nameidata) {
    while let Some(mnt) = nd.dentry.mounted() {
        let root = mnt.root();
        trace!("crossing mount boundary down into '{}'", root.sb().name());
        nd.step_to(&root);
    }
}

/// Follow a symlink: bound the depth, pin the link, and walk its target —
/// from the root for absolute targets, from the link's directory otherwise.
fn enter_symlink(nd: &mut Nameidata, link: &Arc<Dentry>, last: bool) -> Result<()> {
    if nd.depth >= MAX_SYMLINK_DEPTH {
        return Err(VfsError::SymlinkLoop);
    }
    nd.depth += 1;
    let inode = link.d_inode();
    let target = inode.ops().readlink(&inode)?;
    trace!("following symlink '{}' -> '{}'", link.name(), target);
    // Pin the symlink for the rest of the walk.
    link.grab();
    if let Some(prev) = nd.last_sym.replace(link.clone()) {
        prev.put();
    }
    let saved = nd.flags;
    nd.flags = LookupFlags::FOLLOW
        | if last {
            saved & LookupFlags::DIRECTORY
        } else {
            LookupFlags::empty()
        };
    let remainder = match target.strip_prefix('/') {
        Some(stripped) => {
            nd.restart_at_root();
            stripped.to_string()
        }
        None => target,
    };
    let walked = if remainder.is_empty() {
        Ok(())
    } else {
        walk_components(nd, &remainder)
    };
    nd.flags = saved;
    walked
}

/// Resolve one component under `parent`: dentry cache first, then the
/// backend. A backend miss caches a negative entry. Returns a counted
/// dentry, or `None` when the name does not exist.
pub(crate) fn do_lookup(parent: &Arc<Dentry>, name: &str) -> Result<Option<Arc<Dentry>>> {
    use crate::dcache::Probe;

    let sb = parent.sb();
    let hash = parent.ops().hash(name);
    match sb.dcache().get(parent, name, hash) {
        Probe::Found(d) => return Ok(Some(d)),
        Probe::Negative => return Ok(None),
        Probe::Miss => {}
    }
    let dir = parent.d_inode();
    match dir.ops().lookup(&dir, name)? {
        None => {
            let neg = Dentry::new_negative(parent, name, hash);
            let winner = sb.dcache().put(neg.clone());
            if Arc::ptr_eq(&winner, &neg) {
                // Park the cached miss on the LRU.
                neg.put();
                Ok(None)
            } else {
                // A concurrent creation got there first; use it.
                neg.mark_dying();
                neg.put();
                Ok(Some(winner))
            }
        }
        Some(ino) => {
            let inode = Inode::iget(sb, ino)?;
            let d = Dentry::new(parent, name, hash);
            d.attach(inode);
            let winner = sb.dcache().put(d.clone());
            if !Arc::ptr_eq(&winner, &d) {
                d.mark_dying();
                d.put();
            }
            Ok(Some(winner))
        }
    }
}
