//! In-memory ordered-map driver: the reference engine.
//!
//! Each collection is a `BTreeMap` of version chains. A chain is a
//! newest-first list of `(SeqNo, value)` pairs; a `None` value is a
//! tombstone. Visibility is purely stamp-based: a reader at sequence `s`
//! observes the newest version with stamp `<= s`, so a batch stamped above
//! the published sequence is invisible until the stamp is published. That
//! gives atomic batch visibility without a global write lock.
//!
//! Snapshots are refcounted sequence numbers; the minimum live snapshot is
//! the garbage watermark below which version chains are pruned.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use kite_common::error::{Result, StorageError};
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};

use crate::driver::{DriverCaps, KvDriver, ReadView};

/// Newest-first list of stamped versions for one key.
#[derive(Debug, Default)]
struct VersionChain {
    versions: Vec<(SeqNo, Option<Vec<u8>>)>,
}

impl VersionChain {
    /// Newest version visible at `at`, if any.
    fn visible(&self, at: SeqNo) -> Option<&Option<Vec<u8>>> {
        self.versions
            .iter()
            .find(|(seq, _)| *seq <= at)
            .map(|(_, value)| value)
    }

    fn push(&mut self, seq: SeqNo, value: Option<Vec<u8>>) {
        // A batch may address the same key twice; the later op wins.
        if let Some((head_seq, head_value)) = self.versions.first_mut() {
            if *head_seq == seq {
                *head_value = value;
                return;
            }
            debug_assert!(
                *head_seq < seq,
                "version stamps must be pushed in increasing order"
            );
        }
        self.versions.insert(0, (seq, value));
    }

    /// Drop versions no snapshot at or above `watermark` can observe.
    /// Returns true when the chain holds nothing a future reader could see.
    fn prune(&mut self, watermark: SeqNo) -> bool {
        if let Some(idx) = self.versions.iter().position(|(seq, _)| *seq <= watermark) {
            self.versions.truncate(idx + 1);
            // A lone tombstone at or below the watermark is indistinguishable
            // from absence.
            if idx == 0 && self.versions[0].1.is_none() {
                self.versions.clear();
            }
        }
        self.versions.is_empty()
    }
}

struct MemCollection {
    name: String,
    map: RwLock<BTreeMap<Key, VersionChain>>,
}

impl MemCollection {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            map: RwLock::new(BTreeMap::new()),
        })
    }
}

/// The in-memory driver.
pub struct MemDriver {
    collections: DashMap<CollectionId, Arc<MemCollection>>,
    names: DashMap<String, CollectionId>,
    next_col: AtomicU64,
    /// Highest published (visible) sequence number.
    applied: AtomicU64,
    /// Live snapshot refcounts, keyed by pinned sequence.
    snapshots: Mutex<BTreeMap<u64, usize>>,
}

impl MemDriver {
    pub fn open() -> Arc<Self> {
        let driver = Self {
            collections: DashMap::new(),
            names: DashMap::new(),
            next_col: AtomicU64::new(CollectionId::DEFAULT.0 + 1),
            applied: AtomicU64::new(SeqNo::ZERO.0),
            snapshots: Mutex::new(BTreeMap::new()),
        };
        driver
            .collections
            .insert(CollectionId::DEFAULT, MemCollection::new(String::new()));
        Arc::new(driver)
    }

    fn collection(&self, col: CollectionId) -> Result<Arc<MemCollection>> {
        self.collections
            .get(&col)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::UnknownCollection(col).into())
    }

    fn resolve(&self, view: ReadView) -> SeqNo {
        match view {
            ReadView::Head => SeqNo(self.applied.load(Ordering::Acquire)),
            ReadView::Snapshot(seq) => seq,
        }
    }

    /// Sequence below which no live snapshot can read.
    fn gc_watermark(&self) -> SeqNo {
        let snapshots = self.snapshots.lock();
        let oldest = snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.applied.load(Ordering::Acquire));
        SeqNo(oldest)
    }

    /// Prune version chains below the garbage watermark.
    fn gc(&self) {
        let watermark = self.gc_watermark();
        let mut visited = 0usize;
        for entry in self.collections.iter() {
            let mut map = entry.value().map.write();
            map.retain(|_, chain| {
                visited += 1;
                !chain.prune(watermark)
            });
        }
        tracing::trace!(watermark = watermark.0, chains = visited, "mem driver version gc");
    }
}

impl KvDriver for MemDriver {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCaps {
            snapshots: true,
            snapshot_scans: true,
            durable: false,
        }
    }

    fn sequence_floor(&self) -> SeqNo {
        SeqNo::ZERO
    }

    fn get(&self, col: CollectionId, key: Key, view: ReadView) -> Result<Option<Vec<u8>>> {
        let at = self.resolve(view);
        let collection = self.collection(col)?;
        let map = collection.map.read();
        Ok(map
            .get(&key)
            .and_then(|chain| chain.visible(at))
            .and_then(|value| value.clone()))
    }

    fn multi_get(
        &self,
        tasks: &[(CollectionId, Key)],
        view: ReadView,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        // Resolve the view once so every lookup in the batch observes the
        // same state even while writers publish new stamps.
        let at = self.resolve(view);
        let mut out = Vec::with_capacity(tasks.len());
        for &(col, key) in tasks {
            let collection = self.collection(col)?;
            let map = collection.map.read();
            out.push(
                map.get(&key)
                    .and_then(|chain| chain.visible(at))
                    .and_then(|value| value.clone()),
            );
        }
        Ok(out)
    }

    fn write_batch(&self, seq: SeqNo, ops: &[WriteOp], _flush: bool) -> Result<()> {
        // Validate all handles before touching any chain: the batch must
        // fail atomically on an unknown collection.
        for op in ops {
            if !self.collections.contains_key(&op.col) {
                return Err(StorageError::UnknownCollection(op.col).into());
            }
        }
        for op in ops {
            let collection = self.collection(op.col)?;
            let mut map = collection.map.write();
            map.entry(op.key)
                .or_default()
                .push(seq, op.value.clone());
        }
        // Publish: stamped versions become visible to Head readers only now.
        self.applied.fetch_max(seq.0, Ordering::AcqRel);
        Ok(())
    }

    fn scan(
        &self,
        col: CollectionId,
        from: Key,
        limit: usize,
        view: ReadView,
        _fill_cache: bool,
    ) -> Result<Vec<(Key, u32)>> {
        let at = self.resolve(view);
        let collection = self.collection(col)?;
        let map = collection.map.read();
        let mut out = Vec::with_capacity(limit.min(64));
        for (key, chain) in map.range(from..) {
            if out.len() == limit {
                break;
            }
            if let Some(Some(value)) = chain.visible(at) {
                out.push((*key, value.len() as u32));
            }
        }
        Ok(out)
    }

    fn snapshot(&self) -> Result<SeqNo> {
        let seq = self.applied.load(Ordering::Acquire);
        *self.snapshots.lock().entry(seq).or_insert(0) += 1;
        Ok(SeqNo(seq))
    }

    fn release_snapshot(&self, seq: SeqNo) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&seq.0) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&seq.0);
            }
        }
        drop(snapshots);
        self.gc();
    }

    fn create_collection(&self, name: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(CollectionId::DEFAULT);
        }
        if let Some(existing) = self.names.get(name) {
            return Ok(*existing.value());
        }
        let id = CollectionId(self.next_col.fetch_add(1, Ordering::SeqCst));
        self.collections
            .insert(id, MemCollection::new(name.to_string()));
        self.names.insert(name.to_string(), id);
        tracing::debug!(collection = name, id = id.0, "mem driver created collection");
        Ok(id)
    }

    fn find_collection(&self, name: &str) -> Option<CollectionId> {
        if name.is_empty() {
            return Some(CollectionId::DEFAULT);
        }
        self.names.get(name).map(|entry| *entry.value())
    }

    fn drop_collection(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            // The default collection is emptied, never destroyed.
            let collection = self.collection(CollectionId::DEFAULT)?;
            collection.map.write().clear();
            return Ok(());
        }
        let (_, id) = self
            .names
            .remove(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))?;
        self.collections.remove(&id);
        tracing::debug!(collection = name, id = id.0, "mem driver dropped collection");
        Ok(())
    }

    fn list_collections(&self) -> Vec<(CollectionId, String)> {
        let mut out: Vec<_> = self
            .collections
            .iter()
            .map(|entry| (*entry.key(), entry.value().name.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    fn has_collection(&self, col: CollectionId) -> bool {
        self.collections.contains_key(&col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(driver: &MemDriver, seq: u64, key: u64, value: &[u8]) {
        driver
            .write_batch(
                SeqNo(seq),
                &[WriteOp::put(CollectionId::DEFAULT, Key(key), value.to_vec())],
                false,
            )
            .unwrap();
    }

    #[test]
    fn test_write_then_read_head() {
        let driver = MemDriver::open();
        put(&driver, 1, 42, b"purpose of life");
        let value = driver
            .get(CollectionId::DEFAULT, Key(42), ReadView::Head)
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"purpose of life"[..]));
    }

    #[test]
    fn test_missing_and_empty_are_distinct() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"");
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(1), ReadView::Head).unwrap(),
            Some(vec![])
        );
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(2), ReadView::Head).unwrap(),
            None
        );
    }

    #[test]
    fn test_tombstone_hides_older_version() {
        let driver = MemDriver::open();
        put(&driver, 1, 7, b"v1");
        driver
            .write_batch(
                SeqNo(2),
                &[WriteOp::delete(CollectionId::DEFAULT, Key(7))],
                false,
            )
            .unwrap();
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(7), ReadView::Head).unwrap(),
            None
        );
        // The old version is still visible at its own stamp.
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(7), ReadView::Snapshot(SeqNo(1)))
                .unwrap()
                .as_deref(),
            Some(&b"v1"[..])
        );
    }

    #[test]
    fn test_snapshot_read_ignores_later_commits() {
        let driver = MemDriver::open();
        put(&driver, 1, 5, b"old");
        let snap = driver.snapshot().unwrap();
        put(&driver, 2, 5, b"new");
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(5), ReadView::Snapshot(snap))
                .unwrap()
                .as_deref(),
            Some(&b"old"[..])
        );
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(5), ReadView::Head)
                .unwrap()
                .as_deref(),
            Some(&b"new"[..])
        );
        driver.release_snapshot(snap);
    }

    #[test]
    fn test_unpublished_stamp_is_invisible() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"a");
        // Read at a snapshot below a stamp that was never published.
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(1), ReadView::Snapshot(SeqNo::ZERO))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_scan_ascending_with_lengths() {
        let driver = MemDriver::open();
        for (i, key) in [5u64, 10, 12, 20, 25, 30].iter().enumerate() {
            put(&driver, i as u64 + 1, *key, &vec![b'x'; *key as usize]);
        }
        let hits = driver
            .scan(CollectionId::DEFAULT, Key(10), 5, ReadView::Head, true)
            .unwrap();
        let keys: Vec<u64> = hits.iter().map(|(k, _)| k.0).collect();
        assert_eq!(keys, vec![10, 12, 20, 25, 30]);
        let lens: Vec<u32> = hits.iter().map(|(_, len)| *len).collect();
        assert_eq!(lens, vec![10, 12, 20, 25, 30]);
    }

    #[test]
    fn test_scan_skips_tombstones() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"a");
        put(&driver, 2, 2, b"b");
        driver
            .write_batch(SeqNo(3), &[WriteOp::delete(CollectionId::DEFAULT, Key(1))], false)
            .unwrap();
        let hits = driver
            .scan(CollectionId::DEFAULT, Key(0), 10, ReadView::Head, true)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, Key(2));
    }

    #[test]
    fn test_collection_isolation() {
        let driver = MemDriver::open();
        let sub = driver.create_collection("sub").unwrap();
        driver
            .write_batch(SeqNo(1), &[WriteOp::put(sub, Key(0), b"x".to_vec())], false)
            .unwrap();
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(0), ReadView::Head).unwrap(),
            None
        );
        assert_eq!(
            driver.get(sub, Key(0), ReadView::Head).unwrap().as_deref(),
            Some(&b"x"[..])
        );
    }

    #[test]
    fn test_create_collection_is_get_or_create() {
        let driver = MemDriver::open();
        let a = driver.create_collection("sub").unwrap();
        let b = driver.create_collection("sub").unwrap();
        assert_eq!(a, b);
        assert_eq!(driver.find_collection("sub"), Some(a));
        assert_eq!(driver.find_collection(""), Some(CollectionId::DEFAULT));
    }

    #[test]
    fn test_drop_default_empties_but_keeps_handle() {
        let driver = MemDriver::open();
        put(&driver, 1, 9, b"v");
        driver.drop_collection("").unwrap();
        assert!(driver.has_collection(CollectionId::DEFAULT));
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(9), ReadView::Head).unwrap(),
            None
        );
    }

    #[test]
    fn test_drop_named_invalidates_handle() {
        let driver = MemDriver::open();
        let sub = driver.create_collection("sub").unwrap();
        driver.drop_collection("sub").unwrap();
        assert!(!driver.has_collection(sub));
        assert!(driver.get(sub, Key(0), ReadView::Head).is_err());
        assert!(driver.drop_collection("sub").is_err());
    }

    #[test]
    fn test_unknown_collection_fails_batch_atomically() {
        let driver = MemDriver::open();
        let err = driver.write_batch(
            SeqNo(1),
            &[
                WriteOp::put(CollectionId::DEFAULT, Key(1), b"a".to_vec()),
                WriteOp::put(CollectionId(999), Key(2), b"b".to_vec()),
            ],
            false,
        );
        assert!(err.is_err());
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(1), ReadView::Head).unwrap(),
            None
        );
    }

    #[test]
    fn test_gc_prunes_old_versions() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"v1");
        put(&driver, 2, 1, b"v2");
        put(&driver, 3, 1, b"v3");
        // No snapshots live: releasing one pinned at head prunes to the
        // newest version.
        let snap = driver.snapshot().unwrap();
        driver.release_snapshot(snap);
        let collection = driver.collection(CollectionId::DEFAULT).unwrap();
        let map = collection.map.read();
        assert_eq!(map.get(&Key(1)).unwrap().versions.len(), 1);
    }

    #[test]
    fn test_gc_removes_dead_tombstones() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"v1");
        driver
            .write_batch(SeqNo(2), &[WriteOp::delete(CollectionId::DEFAULT, Key(1))], false)
            .unwrap();
        let snap = driver.snapshot().unwrap();
        driver.release_snapshot(snap);
        let collection = driver.collection(CollectionId::DEFAULT).unwrap();
        assert!(collection.map.read().is_empty());
    }

    #[test]
    fn test_gc_respects_live_snapshot() {
        let driver = MemDriver::open();
        put(&driver, 1, 1, b"v1");
        let snap = driver.snapshot().unwrap();
        put(&driver, 2, 1, b"v2");
        let later = driver.snapshot().unwrap();
        driver.release_snapshot(later);
        // The older snapshot still pins version 1.
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(1), ReadView::Snapshot(snap))
                .unwrap()
                .as_deref(),
            Some(&b"v1"[..])
        );
        driver.release_snapshot(snap);
    }
}
