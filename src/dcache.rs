//! The dentry cache: a hash table keyed by (parent, name) plus an LRU list
//! of unused entries.
//!
//! The table holds `Arc<Dentry>` so entries stay allocated, but table
//! membership grants no usage count; `get` is the only way to turn a cached
//! entry back into an owned reference, and it does so under the table lock,
//! which is what makes resurrection sound. Lock order: table, then per-entry
//! state, then LRU.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};
use lru::LruCache;
use parking_lot::Mutex;

use crate::dentry::{Dentry, DentryFlags};
use crate::ops::DentryOps;

/// Outcome of a cache probe.
pub(crate) enum Probe {
    /// Positive entry, returned with one usage count taken.
    Found(Arc<Dentry>),
    /// Cached miss; no reference is handed out.
    Negative,
    /// Nothing cached; ask the backend.
    Miss,
}

/// Counters exposed for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the table, positive and negative.
    pub entries: usize,
    /// Entries parked on the LRU (usage count zero).
    pub unused: usize,
    /// Negative entries in the table.
    pub negative: usize,
}

fn lru_key(d: &Arc<Dentry>) -> usize {
    Arc::as_ptr(d) as usize
}

/// Per-superblock dentry cache.
pub struct DentryCache {
    table: Mutex<HashMap<u64, Vec<Arc<Dentry>>>>,
    /// Unused entries, least recently used first to go. Unbounded; eviction
    /// is explicit via `prune`.
    lru: Mutex<LruCache<usize, Arc<Dentry>>>,
    ops: Arc<dyn DentryOps>,
}

impl DentryCache {
    pub(crate) fn new(ops: Arc<dyn DentryOps>) -> Self {
        DentryCache {
            table: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruCache::unbounded()),
            ops,
        }
    }

    /// Probe for `name` under `parent`. A positive hit takes a usage count
    /// and, if the entry was parked, pulls it off the LRU; that transition
    /// happens under the table lock, so a resurrected entry can never be
    /// freed out from under the caller. An entry the backend's `revalidate`
    /// rejects is unhooked here, so the reload's insert cannot reconcile
    /// back to the stale entry.
    pub(crate) fn get(&self, parent: &Arc<Dentry>, name: &str, hash: u64) -> Probe {
        let mut stale: Option<Arc<Dentry>> = None;
        let probe = {
            let mut table = self.table.lock();
            let bucket = match table.get_mut(&hash) {
                Some(b) => b,
                None => return Probe::Miss,
            };
            match bucket.iter().position(|d| d.matches(parent, name)) {
                None => Probe::Miss,
                Some(pos) => {
                    let d = bucket[pos].clone();
                    if !self.ops.revalidate(&d) {
                        debug!("dcache: dropping invalidated '{}'", name);
                        let mut st = d.state.lock();
                        st.flags.insert(DentryFlags::DYING);
                        let idle = st.count == 0;
                        if idle && !st.flags.contains(DentryFlags::USED) {
                            self.lru.lock().pop(&lru_key(&d));
                        }
                        drop(st);
                        bucket.swap_remove(pos);
                        if bucket.is_empty() {
                            table.remove(&hash);
                        }
                        if idle {
                            stale = Some(d);
                        }
                        Probe::Miss
                    } else {
                        let mut st = d.state.lock();
                        if st.flags.contains(DentryFlags::NEGATIVE) {
                            trace!("dcache: negative hit for '{}'", name);
                            Probe::Negative
                        } else {
                            st.count += 1;
                            if !st.flags.contains(DentryFlags::USED) {
                                st.flags.insert(DentryFlags::USED);
                                debug!("dcache: resurrecting '{}'", name);
                                self.lru.lock().pop(&lru_key(&d));
                            }
                            drop(st);
                            Probe::Found(d)
                        }
                    }
                }
            }
        };
        if let Some(d) = stale {
            d.free();
        }
        probe
    }

    /// Insert `d`, reconciling collisions on its key:
    ///
    /// - a cached negative entry is evicted (a real object now exists);
    /// - a cached positive entry means a concurrent insert won; it is
    ///   returned with a usage count taken and the caller discards its own.
    ///
    /// Returns the entry that is now cached for the key.
    pub(crate) fn put(&self, d: Arc<Dentry>) -> Arc<Dentry> {
        let hash = d.name_hash();
        let mut stale: Option<Arc<Dentry>> = None;
        let winner = {
            let mut table = self.table.lock();
            let bucket = table.entry(hash).or_default();
            match bucket.iter().position(|e| e.same_key(&d, &*self.ops)) {
                Some(pos) => {
                    let existing = bucket[pos].clone();
                    let mut st = existing.state.lock();
                    if st.flags.contains(DentryFlags::NEGATIVE) {
                        debug!("dcache: evicting negative '{}'", d.name());
                        st.flags.insert(DentryFlags::DYING);
                        let idle = st.count == 0;
                        if idle && !st.flags.contains(DentryFlags::USED) {
                            self.lru.lock().pop(&lru_key(&existing));
                        }
                        drop(st);
                        bucket.swap_remove(pos);
                        bucket.push(d.clone());
                        if idle {
                            stale = Some(existing);
                        }
                        d.clone()
                    } else {
                        st.count += 1;
                        if !st.flags.contains(DentryFlags::USED) {
                            st.flags.insert(DentryFlags::USED);
                            self.lru.lock().pop(&lru_key(&existing));
                        }
                        drop(st);
                        trace!("dcache: lost insert race for '{}'", d.name());
                        existing
                    }
                }
                None => {
                    bucket.push(d.clone());
                    d.clone()
                }
            }
        };
        if let Some(neg) = stale {
            neg.free();
        }
        winner
    }

    /// Unhook `d` from the table. The caller owns a usage count and decides
    /// the entry's fate via DYING and `put`.
    pub(crate) fn remove(&self, d: &Arc<Dentry>) {
        let hash = d.name_hash();
        let mut table = self.table.lock();
        if let Some(bucket) = table.get_mut(&hash) {
            if let Some(pos) = bucket.iter().position(|e| Arc::ptr_eq(e, d)) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                table.remove(&hash);
            }
        }
    }

    /// Park an unused entry on the LRU. Called with the entry's state lock
    /// held, which is the nesting order.
    pub(crate) fn lru_insert(&self, d: &Arc<Dentry>) {
        self.lru.lock().put(lru_key(d), d.clone());
    }

    /// Evict unused entries, oldest first. Victims are unhooked from the
    /// table and the LRU in one critical section, then freed outside all
    /// locks; freeing re-enters the cache (parent puts can park entries), so
    /// it must not run under the locks it needs.
    pub fn prune(&self, negative_only: bool) -> usize {
        let mut victims: Vec<Arc<Dentry>> = Vec::new();
        {
            let mut table = self.table.lock();
            let mut lru = self.lru.lock();
            let keys: Vec<usize> = lru.iter().map(|(k, _)| *k).collect();
            for key in keys {
                let d = match lru.peek(&key) {
                    Some(d) => d.clone(),
                    None => continue,
                };
                if negative_only && !d.is_negative() {
                    continue;
                }
                lru.pop(&key);
                if let Some(bucket) = table.get_mut(&d.name_hash()) {
                    if let Some(pos) = bucket.iter().position(|e| Arc::ptr_eq(e, &d)) {
                        bucket.swap_remove(pos);
                    }
                    if bucket.is_empty() {
                        table.remove(&d.name_hash());
                    }
                }
                victims.push(d);
            }
        }
        let n = victims.len();
        for d in victims {
            trace!("dcache: pruning '{}'", d.name());
            d.free();
        }
        if n > 0 {
            debug!("dcache: pruned {} entries (negative_only={})", n, negative_only);
        }
        n
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        let mut entries = 0;
        let mut negative = 0;
        for bucket in table.values() {
            for d in bucket {
                entries += 1;
                if d.is_negative() {
                    negative += 1;
                }
            }
        }
        let unused = self.lru.lock().len();
        CacheStats {
            entries,
            unused,
            negative,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::Dentry;
    use crate::inode::Inode;
    use crate::memfs::{MemFs, MEMFS_ROOT_INO};
    use crate::ops::GenericDentryOps;
    use crate::sb::SuperBlock;
    use crate::walk::do_lookup;

    fn setup() -> (Arc<crate::sb::SuperBlock>, Arc<Dentry>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let fs = Arc::new(MemFs::new_store());
        let sb = SuperBlock::new(
            "dcache-test",
            fs.clone(),
            fs.clone(),
            fs,
            Arc::new(GenericDentryOps),
        );
        let root = Dentry::new_root(&sb, sb.dops().clone(), None);
        let inode = Inode::iget(&sb, MEMFS_ROOT_INO).unwrap();
        root.attach(inode);
        let root = sb.dcache().put(root);
        (sb, root)
    }

    /// Create a backing file and a cached dentry for it; count 1 for the
    /// caller.
    fn make_child(sb: &Arc<SuperBlock>, parent: &Arc<Dentry>, name: &str) -> Arc<Dentry> {
        let dir = parent.d_inode();
        let ino = sb.iops().create(&dir, name, 0o644).unwrap();
        let inode = Inode::iget(sb, ino).unwrap();
        let d = Dentry::new(parent, name, sb.dops().hash(name));
        d.attach(inode);
        sb.dcache().put(d)
    }

    #[test]
    fn park_and_resurrect() {
        let (sb, root) = setup();
        let d = make_child(&sb, &root, "a");
        assert_eq!(d.usage_count(), 1);
        assert_eq!(sb.dcache().stats().unused, 0);

        d.put();
        assert_eq!(d.usage_count(), 0);
        assert_eq!(sb.dcache().stats().unused, 1);

        let hash = sb.dops().hash("a");
        match sb.dcache().get(&root, "a", hash) {
            Probe::Found(found) => {
                assert!(Arc::ptr_eq(&found, &d));
                assert_eq!(found.usage_count(), 1);
                assert_eq!(sb.dcache().stats().unused, 0);
                found.put();
            }
            _ => panic!("expected a positive hit"),
        }
    }

    #[test]
    fn negative_entry_evicted_by_real_one() {
        let (sb, root) = setup();
        assert!(do_lookup(&root, "ghost").unwrap().is_none());
        let stats = sb.dcache().stats();
        assert_eq!(stats.negative, 1);
        assert_eq!(stats.unused, 1);

        // A second lookup is answered from the cache.
        assert!(do_lookup(&root, "ghost").unwrap().is_none());

        // Creating the real thing displaces the cached miss.
        let d = make_child(&sb, &root, "ghost");
        let stats = sb.dcache().stats();
        assert_eq!(stats.negative, 0);
        let found = do_lookup(&root, "ghost").unwrap().expect("now exists");
        assert!(Arc::ptr_eq(&found, &d));
        found.put();
        d.put();
    }

    #[test]
    fn prune_spares_used_entries_and_is_idempotent() {
        let (sb, root) = setup();
        let parked = make_child(&sb, &root, "parked");
        let held = make_child(&sb, &root, "held");
        parked.put();

        assert_eq!(sb.dcache().prune(false), 1);
        let stats = sb.dcache().stats();
        assert_eq!(stats.unused, 0);
        // Root and the held child survive.
        assert_eq!(stats.entries, 2);
        assert_eq!(held.usage_count(), 1);

        assert_eq!(sb.dcache().prune(false), 0);
        held.put();
    }

    #[test]
    fn invalidated_entry_is_unhooked_not_reconciled() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct SwitchableOps {
            valid: AtomicBool,
        }

        impl DentryOps for SwitchableOps {
            fn revalidate(&self, _dentry: &Dentry) -> bool {
                self.valid.load(Ordering::SeqCst)
            }
        }

        let _ = env_logger::builder().is_test(true).try_init();
        let ops = Arc::new(SwitchableOps {
            valid: AtomicBool::new(true),
        });
        let fs = Arc::new(MemFs::new_store());
        let sb = SuperBlock::new("dcache-test", fs.clone(), fs.clone(), fs, ops.clone());
        let root = Dentry::new_root(&sb, sb.dops().clone(), None);
        root.attach(Inode::iget(&sb, MEMFS_ROOT_INO).unwrap());
        let root = sb.dcache().put(root);

        let d = make_child(&sb, &root, "a");
        d.put();

        ops.valid.store(false, Ordering::SeqCst);
        assert!(matches!(
            sb.dcache().get(&root, "a", sb.dops().hash("a")),
            Probe::Miss
        ));
        // The rejected entry left the table and the LRU.
        let stats = sb.dcache().stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.unused, 0);

        // The reload builds a fresh entry instead of handing back the one
        // revalidate rejected.
        ops.valid.store(true, Ordering::SeqCst);
        let reloaded = do_lookup(&root, "a").unwrap().expect("backend still has it");
        assert!(!Arc::ptr_eq(&reloaded, &d));
        reloaded.put();
    }

    #[test]
    fn negative_only_prune_leaves_positives_parked() {
        let (sb, root) = setup();
        assert!(do_lookup(&root, "missing").unwrap().is_none());
        let d = make_child(&sb, &root, "real");
        d.put();

        assert_eq!(sb.dcache().prune(true), 1);
        let stats = sb.dcache().stats();
        assert_eq!(stats.negative, 0);
        assert_eq!(stats.unused, 1);

        assert_eq!(sb.dcache().prune(true), 0);
    }
}
