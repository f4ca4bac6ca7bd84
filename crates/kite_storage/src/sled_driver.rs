//! External embedded-KV driver backed by sled.
//!
//! One `sled::Tree` per collection, keys in big-endian so sled's
//! lexicographic order matches the numeric key order. A metadata tree
//! carries the name→id registry, the id counter, and the persisted
//! sequence floor. The floor is advanced *before* a batch is applied, so
//! after a crash the recovered floor sits at or above every persisted
//! write and the commit counter rebases safely.
//!
//! `sled::Batch` is per-tree: a multi-collection batch is applied
//! tree-by-tree. All KiteKV writers are serialized through the commit
//! path, so readers through this driver never observe a torn batch; a
//! crash between trees can persist a prefix, which the sequence-floor
//! overshoot accounts for.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use kite_common::error::{Result, StorageError};
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};

use crate::driver::{DriverCaps, KvDriver, ReadView};

const META_TREE: &str = "kite-meta";
const META_NEXT_COLLECTION: &[u8] = b"next-collection";
const META_SEQUENCE_FLOOR: &[u8] = b"sequence-floor";
const META_NAME_PREFIX: &str = "name:";

fn map_sled(e: sled::Error) -> StorageError {
    match e {
        sled::Error::Io(io) => StorageError::Io(io),
        sled::Error::Corruption { .. } => StorageError::Corruption(e.to_string()),
        sled::Error::Unsupported(what) => {
            StorageError::Serialization(format!("sled unsupported: {what}"))
        }
        other => StorageError::Corruption(other.to_string()),
    }
}

fn tree_name(col: CollectionId) -> String {
    format!("col-{}", col.0)
}

/// The sled driver.
pub struct SledDriver {
    db: sled::Db,
    meta: sled::Tree,
    trees: DashMap<CollectionId, sled::Tree>,
    names: DashMap<String, CollectionId>,
    next_col: AtomicU64,
    floor: AtomicU64,
}

impl SledDriver {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let db = sled::open(path).map_err(map_sled)?;
        let meta = db.open_tree(META_TREE).map_err(map_sled)?;

        let next_col = meta
            .get(META_NEXT_COLLECTION)
            .map_err(map_sled)?
            .map(|v| decode_u64(&v))
            .transpose()?
            .unwrap_or(CollectionId::DEFAULT.0 + 1);
        let floor = meta
            .get(META_SEQUENCE_FLOOR)
            .map_err(map_sled)?
            .map(|v| decode_u64(&v))
            .transpose()?
            .unwrap_or(SeqNo::ZERO.0);

        let trees = DashMap::new();
        let names = DashMap::new();
        trees.insert(
            CollectionId::DEFAULT,
            db.open_tree(tree_name(CollectionId::DEFAULT)).map_err(map_sled)?,
        );
        for item in meta.scan_prefix(META_NAME_PREFIX.as_bytes()) {
            let (key, value) = item.map_err(map_sled)?;
            let name = String::from_utf8(key[META_NAME_PREFIX.len()..].to_vec())
                .map_err(|e| StorageError::Corruption(format!("collection name: {e}")))?;
            let id = CollectionId(decode_u64(&value)?);
            trees.insert(id, db.open_tree(tree_name(id)).map_err(map_sled)?);
            names.insert(name, id);
        }

        tracing::info!(
            path = %path.display(),
            collections = trees.len(),
            sequence_floor = floor,
            "sled driver opened"
        );
        Ok(Arc::new(Self {
            db,
            meta,
            trees,
            names,
            next_col: AtomicU64::new(next_col),
            floor: AtomicU64::new(floor),
        }))
    }

    fn tree(&self, col: CollectionId) -> Result<sled::Tree> {
        self.trees
            .get(&col)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::UnknownCollection(col).into())
    }
}

fn decode_u64(bytes: &[u8]) -> std::result::Result<u64, StorageError> {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StorageError::Corruption("metadata value is not 8 bytes".into()))
}

impl KvDriver for SledDriver {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCaps {
            snapshots: false,
            snapshot_scans: false,
            durable: true,
        }
    }

    fn sequence_floor(&self) -> SeqNo {
        SeqNo(self.floor.load(Ordering::SeqCst))
    }

    fn get(&self, col: CollectionId, key: Key, view: ReadView) -> Result<Option<Vec<u8>>> {
        if let ReadView::Snapshot(_) = view {
            return Err(StorageError::Unsupported("snapshot reads").into());
        }
        let tree = self.tree(col)?;
        Ok(tree
            .get(key.to_be_bytes())
            .map_err(map_sled)?
            .map(|v| v.to_vec()))
    }

    fn write_batch(&self, seq: SeqNo, ops: &[WriteOp], flush: bool) -> Result<()> {
        for op in ops {
            if !self.trees.contains_key(&op.col) {
                return Err(StorageError::UnknownCollection(op.col).into());
            }
        }
        // Advance the floor first: overshooting after a crash is safe,
        // undershooting would break sequence monotonicity at reopen.
        if seq.0 > self.floor.load(Ordering::SeqCst) {
            self.meta
                .insert(META_SEQUENCE_FLOOR, &seq.0.to_be_bytes())
                .map_err(map_sled)?;
            self.floor.fetch_max(seq.0, Ordering::SeqCst);
        }

        // Group per tree so each collection gets one atomic sled batch.
        let mut per_tree: Vec<(CollectionId, sled::Batch)> = Vec::new();
        for op in ops {
            let at = match per_tree.iter().position(|(col, _)| *col == op.col) {
                Some(at) => at,
                None => {
                    per_tree.push((op.col, sled::Batch::default()));
                    per_tree.len() - 1
                }
            };
            let batch = &mut per_tree[at].1;
            match &op.value {
                Some(value) => batch.insert(&op.key.to_be_bytes(), value.clone()),
                None => batch.remove(&op.key.to_be_bytes()),
            }
        }
        for (col, batch) in per_tree {
            self.tree(col)?.apply_batch(batch).map_err(map_sled)?;
        }
        if flush {
            self.db.flush().map_err(map_sled)?;
        }
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
        if let ReadView::Snapshot(_) = view {
            return Err(StorageError::Unsupported("snapshot scans").into());
        }
        let tree = self.tree(col)?;
        let mut out = Vec::with_capacity(limit.min(64));
        for item in tree.range(from.to_be_bytes()..) {
            if out.len() == limit {
                break;
            }
            let (key, value) = item.map_err(map_sled)?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corruption("key is not 8 bytes".into()))?;
            out.push((Key::from_be_bytes(key), value.len() as u32));
        }
        Ok(out)
    }

    fn create_collection(&self, name: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(CollectionId::DEFAULT);
        }
        if let Some(existing) = self.names.get(name) {
            return Ok(*existing.value());
        }
        let id = CollectionId(self.next_col.fetch_add(1, Ordering::SeqCst));
        let tree = self.db.open_tree(tree_name(id)).map_err(map_sled)?;
        self.meta
            .insert(
                format!("{META_NAME_PREFIX}{name}").into_bytes(),
                &id.0.to_be_bytes(),
            )
            .map_err(map_sled)?;
        self.meta
            .insert(
                META_NEXT_COLLECTION,
                &self.next_col.load(Ordering::SeqCst).to_be_bytes(),
            )
            .map_err(map_sled)?;
        self.trees.insert(id, tree);
        self.names.insert(name.to_string(), id);
        tracing::debug!(collection = name, id = id.0, "sled driver created collection");
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
            let tree = self.tree(CollectionId::DEFAULT)?;
            tree.clear().map_err(map_sled)?;
            return Ok(());
        }
        let (_, id) = self
            .names
            .remove(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))?;
        self.trees.remove(&id);
        self.meta
            .remove(format!("{META_NAME_PREFIX}{name}").into_bytes())
            .map_err(map_sled)?;
        self.db.drop_tree(tree_name(id)).map_err(map_sled)?;
        tracing::debug!(collection = name, id = id.0, "sled driver dropped collection");
        Ok(())
    }

    fn list_collections(&self) -> Vec<(CollectionId, String)> {
        let mut out = vec![(CollectionId::DEFAULT, String::new())];
        for entry in self.names.iter() {
            out.push((*entry.value(), entry.key().clone()));
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }

    fn has_collection(&self, col: CollectionId) -> bool {
        self.trees.contains_key(&col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(driver: &SledDriver, seq: u64, key: u64, value: &[u8]) {
        driver
            .write_batch(
                SeqNo(seq),
                &[WriteOp::put(CollectionId::DEFAULT, Key(key), value.to_vec())],
                false,
            )
            .unwrap();
    }

    #[test]
    fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let driver = SledDriver::open(dir.path()).unwrap();
        put(&driver, 1, 42, b"purpose of life");
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(42), ReadView::Head)
                .unwrap()
                .as_deref(),
            Some(&b"purpose of life"[..])
        );
        driver
            .write_batch(SeqNo(2), &[WriteOp::delete(CollectionId::DEFAULT, Key(42))], false)
            .unwrap();
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(42), ReadView::Head).unwrap(),
            None
        );
    }

    #[test]
    fn test_scan_numeric_order() {
        let dir = TempDir::new().unwrap();
        let driver = SledDriver::open(dir.path()).unwrap();
        // 256 > 255 numerically; big-endian keeps that order in sled.
        for (seq, key) in [(1u64, 255u64), (2, 256), (3, 5), (4, 1 << 40)] {
            put(&driver, seq, key, b"v");
        }
        let hits = driver
            .scan(CollectionId::DEFAULT, Key(0), 10, ReadView::Head, false)
            .unwrap();
        let keys: Vec<u64> = hits.iter().map(|(k, _)| k.0).collect();
        assert_eq!(keys, vec![5, 255, 256, 1 << 40]);
    }

    #[test]
    fn test_persistence_and_floor_recovery() {
        let dir = TempDir::new().unwrap();
        let sub;
        {
            let driver = SledDriver::open(dir.path()).unwrap();
            sub = driver.create_collection("sub").unwrap();
            driver
                .write_batch(SeqNo(9), &[WriteOp::put(sub, Key(1), b"x".to_vec())], true)
                .unwrap();
        }
        let driver = SledDriver::open(dir.path()).unwrap();
        assert!(driver.sequence_floor() >= SeqNo(9));
        assert_eq!(driver.find_collection("sub"), Some(sub));
        assert_eq!(
            driver.get(sub, Key(1), ReadView::Head).unwrap().as_deref(),
            Some(&b"x"[..])
        );
    }

    #[test]
    fn test_multi_collection_batch() {
        let dir = TempDir::new().unwrap();
        let driver = SledDriver::open(dir.path()).unwrap();
        let sub = driver.create_collection("sub").unwrap();
        driver
            .write_batch(
                SeqNo(1),
                &[
                    WriteOp::put(CollectionId::DEFAULT, Key(1), b"a".to_vec()),
                    WriteOp::put(sub, Key(1), b"b".to_vec()),
                ],
                false,
            )
            .unwrap();
        assert_eq!(
            driver
                .get(CollectionId::DEFAULT, Key(1), ReadView::Head)
                .unwrap()
                .as_deref(),
            Some(&b"a"[..])
        );
        assert_eq!(
            driver.get(sub, Key(1), ReadView::Head).unwrap().as_deref(),
            Some(&b"b"[..])
        );
    }

    #[test]
    fn test_drop_collection_forms() {
        let dir = TempDir::new().unwrap();
        let driver = SledDriver::open(dir.path()).unwrap();
        put(&driver, 1, 1, b"keep-handle");
        driver.drop_collection("").unwrap();
        assert!(driver.has_collection(CollectionId::DEFAULT));
        assert_eq!(
            driver.get(CollectionId::DEFAULT, Key(1), ReadView::Head).unwrap(),
            None
        );

        let sub = driver.create_collection("sub").unwrap();
        driver.drop_collection("sub").unwrap();
        assert!(!driver.has_collection(sub));
        assert!(driver.drop_collection("sub").is_err());
    }

    #[test]
    fn test_snapshot_views_refused() {
        let dir = TempDir::new().unwrap();
        let driver = SledDriver::open(dir.path()).unwrap();
        assert!(driver
            .get(CollectionId::DEFAULT, Key(1), ReadView::Snapshot(SeqNo(1)))
            .is_err());
        assert!(driver
            .scan(CollectionId::DEFAULT, Key(0), 1, ReadView::Snapshot(SeqNo(1)), false)
            .is_err());
    }
}
