//! In-memory reference backend.
//!
//! `memfs` keeps every object in one node map guarded by a single lock; it
//! exists to exercise the VFS layer and as the smallest example of the
//! capability traits. Each mount gets its own store, so two memfs mounts
//! never share state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::{Result, VfsError};
use crate::file::File;
use crate::inode::Inode;
use crate::mount::VfsMount;
use crate::ops::{
    DirEntry, FileOps, FilesystemType, GenericDentryOps, InodeInit, InodeOps, NodeKind, SuperOps,
};
use crate::sb::{init_sb, SuperBlock};

/// Inode number of every memfs root.
pub const MEMFS_ROOT_INO: u64 = 1;

struct MemNode {
    kind: NodeKind,
    mode: u32,
    nlink: u32,
    data: Vec<u8>,
    target: String,
    children: BTreeMap<String, u64>,
}

impl MemNode {
    fn file(mode: u32) -> MemNode {
        MemNode {
            kind: NodeKind::File,
            mode,
            nlink: 1,
            data: Vec::new(),
            target: String::new(),
            children: BTreeMap::new(),
        }
    }

    fn dir(mode: u32) -> MemNode {
        MemNode {
            kind: NodeKind::Dir,
            mode,
            nlink: 1,
            data: Vec::new(),
            target: String::new(),
            children: BTreeMap::new(),
        }
    }

    fn symlink(target: &str) -> MemNode {
        MemNode {
            kind: NodeKind::Symlink,
            mode: 0o777,
            nlink: 1,
            data: Vec::new(),
            target: target.to_string(),
            children: BTreeMap::new(),
        }
    }

    fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File => self.data.len() as u64,
            NodeKind::Symlink => self.target.len() as u64,
            NodeKind::Dir => 0,
        }
    }
}

/// One memfs store; also the implementation of every capability trait.
pub struct MemFs {
    nodes: Mutex<HashMap<u64, MemNode>>,
    next_ino: AtomicU64,
}

impl MemFs {
    pub(crate) fn new_store() -> MemFs {
        let mut nodes = HashMap::new();
        nodes.insert(MEMFS_ROOT_INO, MemNode::dir(0o755));
        MemFs {
            nodes: Mutex::new(nodes),
            next_ino: AtomicU64::new(MEMFS_ROOT_INO + 1),
        }
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }
}

/// The mountable type; register this with the VFS.
pub struct MemFsType;

impl FilesystemType for MemFsType {
    fn name(&self) -> &str {
        "memfs"
    }

    fn mount(&self, device: &str, mnt: &Arc<VfsMount>) -> Result<Arc<SuperBlock>> {
        let fs = Arc::new(MemFs::new_store());
        let sb = SuperBlock::new(
            device,
            fs.clone(),
            fs.clone(),
            fs,
            Arc::new(GenericDentryOps),
        );
        init_sb(&sb, mnt, MEMFS_ROOT_INO)?;
        debug!("memfs '{}' mounted", device);
        Ok(sb)
    }
}

impl SuperOps for MemFs {
    fn read_inode(&self, ino: u64) -> Result<InodeInit> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&ino)
            .ok_or_else(|| VfsError::NotFound(format!("ino {ino}")))?;
        Ok(InodeInit {
            kind: node.kind,
            mode: node.mode,
            size: node.size(),
            nlink: node.nlink,
        })
    }

    fn write_inode(&self, _inode: &Inode) -> Result<()> {
        // The node map is the authoritative copy already.
        Ok(())
    }

    fn delete_inode(&self, inode: &Inode) -> Result<()> {
        debug!("memfs: deleting ino {}", inode.ino());
        self.nodes.lock().remove(&inode.ino());
        Ok(())
    }
}

impl InodeOps for MemFs {
    fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<u64>> {
        let nodes = self.nodes.lock();
        let parent = nodes
            .get(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        debug_assert!(parent.kind.is_dir());
        Ok(parent.children.get(name).copied())
    }

    fn create(&self, dir: &Inode, name: &str, mode: u32) -> Result<u64> {
        let ino = self.alloc_ino();
        let mut nodes = self.nodes.lock();
        let parent = nodes
            .get_mut(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        if parent.children.contains_key(name) {
            panic!(
                "memfs: '{}' already exists in directory inode {}",
                name,
                dir.ino()
            );
        }
        parent.children.insert(name.to_string(), ino);
        nodes.insert(ino, MemNode::file(mode));
        Ok(ino)
    }

    fn link(&self, old: &Inode, dir: &Inode, name: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let parent = nodes
            .get_mut(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        if parent.children.contains_key(name) {
            return Err(VfsError::AlreadyExists(name.to_string()));
        }
        parent.children.insert(name.to_string(), old.ino());
        if let Some(node) = nodes.get_mut(&old.ino()) {
            node.nlink += 1;
        }
        Ok(())
    }

    fn unlink(&self, dir: &Inode, name: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let parent = nodes
            .get_mut(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        let ino = parent
            .children
            .remove(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        if let Some(node) = nodes.get_mut(&ino) {
            debug_assert!(node.nlink > 0);
            node.nlink -= 1;
        }
        // The node itself goes away in delete_inode, once the VFS drops the
        // last in-core reference.
        Ok(())
    }

    fn symlink(&self, dir: &Inode, name: &str, target: &str) -> Result<u64> {
        let ino = self.alloc_ino();
        let mut nodes = self.nodes.lock();
        let parent = nodes
            .get_mut(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        if parent.children.contains_key(name) {
            panic!(
                "memfs: '{}' already exists in directory inode {}",
                name,
                dir.ino()
            );
        }
        parent.children.insert(name.to_string(), ino);
        nodes.insert(ino, MemNode::symlink(target));
        Ok(ino)
    }

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32) -> Result<u64> {
        let ino = self.alloc_ino();
        let mut nodes = self.nodes.lock();
        let parent = nodes
            .get_mut(&dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
        if parent.children.contains_key(name) {
            panic!(
                "memfs: '{}' already exists in directory inode {}",
                name,
                dir.ino()
            );
        }
        parent.children.insert(name.to_string(), ino);
        parent.nlink += 1;
        nodes.insert(ino, MemNode::dir(mode));
        Ok(ino)
    }

    fn rmdir(&self, dir: &Inode, name: &str) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let ino = {
            let parent = nodes
                .get_mut(&dir.ino())
                .ok_or_else(|| VfsError::NotFound(format!("ino {}", dir.ino())))?;
            *parent
                .children
                .get(name)
                .ok_or_else(|| VfsError::NotFound(name.to_string()))?
        };
        let child = nodes
            .get_mut(&ino)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        if !child.children.is_empty() {
            return Err(VfsError::NotEmpty(name.to_string()));
        }
        child.nlink = 0;
        if let Some(parent) = nodes.get_mut(&dir.ino()) {
            parent.children.remove(name);
            debug_assert!(parent.nlink > 0);
            parent.nlink -= 1;
        }
        Ok(())
    }

    fn rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let ino = {
            let old_parent = nodes
                .get_mut(&old_dir.ino())
                .ok_or_else(|| VfsError::NotFound(format!("ino {}", old_dir.ino())))?;
            old_parent
                .children
                .remove(old_name)
                .ok_or_else(|| VfsError::NotFound(old_name.to_string()))?
        };
        let is_dir = nodes.get(&ino).map(|n| n.kind.is_dir()).unwrap_or(false);
        let new_parent = nodes
            .get_mut(&new_dir.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", new_dir.ino())))?;
        new_parent.children.insert(new_name.to_string(), ino);
        if is_dir && old_dir.ino() != new_dir.ino() {
            new_parent.nlink += 1;
            if let Some(old_parent) = nodes.get_mut(&old_dir.ino()) {
                debug_assert!(old_parent.nlink > 0);
                old_parent.nlink -= 1;
            }
        }
        Ok(())
    }

    fn readlink(&self, inode: &Inode) -> Result<String> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&inode.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", inode.ino())))?;
        Ok(node.target.clone())
    }

    fn truncate(&self, inode: &Inode, len: u64) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(&inode.ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", inode.ino())))?;
        node.data.resize(len as usize, 0);
        Ok(())
    }
}

impl FileOps for MemFs {
    fn read(&self, file: &File, buf: &mut [u8], off: u64) -> Result<usize> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&file.inode().ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", file.inode().ino())))?;
        let off = off as usize;
        if off >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - off);
        buf[..n].copy_from_slice(&node.data[off..off + n]);
        Ok(n)
    }

    fn write(&self, file: &File, buf: &[u8], off: u64) -> Result<usize> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(&file.inode().ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", file.inode().ino())))?;
        let off = off as usize;
        let end = off + buf.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[off..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn readdir(&self, file: &File) -> Result<Vec<DirEntry>> {
        let nodes = self.nodes.lock();
        let dir = nodes
            .get(&file.inode().ino())
            .ok_or_else(|| VfsError::NotFound(format!("ino {}", file.inode().ino())))?;
        Ok(dir
            .children
            .iter()
            .map(|(name, ino)| DirEntry {
                name: name.clone(),
                ino: *ino,
                kind: nodes.get(ino).map(|n| n.kind).unwrap_or(NodeKind::File),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<SuperBlock>, Arc<Inode>) {
        let fs = Arc::new(MemFs::new_store());
        let sb = SuperBlock::new(
            "test",
            fs.clone(),
            fs.clone(),
            fs,
            Arc::new(GenericDentryOps),
        );
        let root = Inode::iget(&sb, MEMFS_ROOT_INO).unwrap();
        (sb, root)
    }

    #[test]
    fn create_then_lookup() {
        let (sb, root) = store();
        let ino = sb.iops().create(&root, "a", 0o644).unwrap();
        assert_eq!(sb.iops().lookup(&root, "a").unwrap(), Some(ino));
        assert_eq!(sb.iops().lookup(&root, "b").unwrap(), None);
    }

    #[test]
    fn rmdir_refuses_non_empty() {
        let (sb, root) = store();
        let dir_ino = sb.iops().mkdir(&root, "d", 0o755).unwrap();
        let dir = Inode::iget(&sb, dir_ino).unwrap();
        sb.iops().create(&dir, "f", 0o644).unwrap();
        assert!(matches!(
            sb.iops().rmdir(&root, "d"),
            Err(VfsError::NotEmpty(_))
        ));
        sb.iops().unlink(&dir, "f").unwrap();
        sb.iops().rmdir(&root, "d").unwrap();
        assert_eq!(sb.iops().lookup(&root, "d").unwrap(), None);
    }

    #[test]
    fn mkdir_bumps_parent_nlink() {
        let (sb, root) = store();
        let before = sb.sops().read_inode(MEMFS_ROOT_INO).unwrap().nlink;
        sb.iops().mkdir(&root, "d", 0o755).unwrap();
        let after = sb.sops().read_inode(MEMFS_ROOT_INO).unwrap().nlink;
        assert_eq!(after, before + 1);
    }

    #[test]
    fn symlink_roundtrip() {
        let (sb, root) = store();
        let ino = sb.iops().symlink(&root, "l", "/target").unwrap();
        let link = Inode::iget(&sb, ino).unwrap();
        assert_eq!(sb.iops().readlink(&link).unwrap(), "/target");
    }
}
