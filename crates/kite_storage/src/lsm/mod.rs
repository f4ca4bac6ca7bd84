//! Bundled log-structured merge driver.
//!
//! Write path: WAL → active memtable → (freeze + flush) → SST.
//! Read path:  active memtable → frozen memtables → SSTs, newest first.
//!
//! The engine is head-only: it keeps no version history, so it reports
//! `snapshots: false` and the transaction layer only admits transparent
//! reads against it. Durability: every batch is framed into the WAL before
//! it touches the memtable; flushed SSTs carry the highest covered commit
//! sequence in their footer, and the WAL is truncated only after the SST
//! is on disk. Collections live in a JSON manifest; collection ids are
//! never reused, so entries of a dropped collection become unaddressable
//! and are discarded by the next full compaction.

pub mod memtable;
pub mod sst;
pub mod wal;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use kite_common::config::LsmSection;
use kite_common::error::{Result, StorageError};
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};

use crate::driver::{DriverCaps, KvDriver, ReadView};
use memtable::{ComposedKey, MemTable};
use sst::SstReader;
use wal::{WalOp, WalRecord, WalWriter};

const MANIFEST_FILENAME: &str = "MANIFEST.json";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestCollection {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    next_collection: u64,
    collections: Vec<ManifestCollection>,
}

/// The LSM driver.
pub struct LsmDriver {
    dir: PathBuf,
    opts: LsmSection,
    wal: WalWriter,
    /// Mutable sorted run receiving writes.
    active: RwLock<MemTable>,
    /// Immutable runs awaiting flush, newest first.
    frozen: RwLock<Vec<Arc<MemTable>>>,
    /// On-disk tables, newest first.
    tables: RwLock<Vec<Arc<SstReader>>>,
    names: DashMap<String, CollectionId>,
    cols: DashMap<CollectionId, String>,
    next_col: AtomicU64,
    next_sst: AtomicU64,
    /// Highest sequence applied (and, after open, recovered).
    applied: AtomicU64,
    /// Prevents concurrent freeze/flush cycles.
    flush_lock: Mutex<()>,
}

impl LsmDriver {
    /// Open or create an LSM database under `dir`.
    pub fn open(dir: &Path, opts: LsmSection) -> Result<Arc<Self>> {
        fs::create_dir_all(dir).map_err(StorageError::Io)?;

        // Collections come from the manifest; a fresh directory gets one
        // with only the default collection.
        let manifest_path = dir.join(MANIFEST_FILENAME);
        let manifest: Manifest = if manifest_path.exists() {
            let data = fs::read(&manifest_path).map_err(StorageError::Io)?;
            serde_json::from_slice(&data)
                .map_err(|e| StorageError::Corruption(format!("manifest: {e}")))?
        } else {
            Manifest {
                next_collection: CollectionId::DEFAULT.0 + 1,
                collections: vec![ManifestCollection {
                    id: CollectionId::DEFAULT.0,
                    name: String::new(),
                }],
            }
        };

        let names = DashMap::new();
        let cols = DashMap::new();
        for collection in &manifest.collections {
            let id = CollectionId(collection.id);
            cols.insert(id, collection.name.clone());
            if !collection.name.is_empty() {
                names.insert(collection.name.clone(), id);
            }
        }

        // Recover SSTs, newest (highest file id) first.
        let mut sst_ids = Vec::new();
        for entry in fs::read_dir(dir).map_err(StorageError::Io)? {
            let entry = entry.map_err(StorageError::Io)?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".sst") {
                if let Ok(id) = stem.parse::<u64>() {
                    sst_ids.push(id);
                }
            }
        }
        sst_ids.sort_unstable_by(|a, b| b.cmp(a));
        let next_sst = sst_ids.first().map_or(0, |id| id + 1);
        let mut tables = Vec::with_capacity(sst_ids.len());
        let mut applied = 0u64;
        for id in sst_ids {
            let reader = SstReader::open(&dir.join(format!("{id:06}.sst")))?;
            applied = applied.max(reader.max_seq());
            tables.push(Arc::new(reader));
        }

        // Replay the WAL into a fresh memtable. Records already covered by
        // a flushed SST may replay after a crash in the flush window; the
        // memtable apply is idempotent, so that is harmless.
        let mut active = MemTable::new();
        for record in WalWriter::read_all(dir)? {
            match record {
                WalRecord::Batch { seq, ops } => {
                    applied = applied.max(seq);
                    for op in ops {
                        active.apply(op.col, op.key, op.value);
                    }
                }
            }
        }

        let driver = Arc::new(Self {
            dir: dir.to_path_buf(),
            opts,
            wal: WalWriter::open(dir)?,
            active: RwLock::new(active),
            frozen: RwLock::new(Vec::new()),
            tables: RwLock::new(tables),
            names,
            cols,
            next_col: AtomicU64::new(manifest.next_collection),
            next_sst: AtomicU64::new(next_sst),
            applied: AtomicU64::new(applied),
            flush_lock: Mutex::new(()),
        });
        if !manifest_path.exists() {
            driver.save_manifest()?;
        }
        tracing::info!(
            dir = %dir.display(),
            collections = driver.cols.len(),
            tables = driver.tables.read().len(),
            sequence_floor = applied,
            "LSM driver opened"
        );
        Ok(driver)
    }

    fn save_manifest(&self) -> Result<()> {
        let mut collections: Vec<ManifestCollection> = self
            .cols
            .iter()
            .map(|entry| ManifestCollection {
                id: entry.key().0,
                name: entry.value().clone(),
            })
            .collect();
        collections.sort_by_key(|c| c.id);
        let manifest = Manifest {
            next_collection: self.next_col.load(Ordering::SeqCst),
            collections,
        };
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        // Write-then-rename so a crash never leaves a half-written manifest.
        let tmp = self.dir.join(format!("{MANIFEST_FILENAME}.tmp"));
        fs::write(&tmp, &data).map_err(StorageError::Io)?;
        fs::rename(&tmp, self.dir.join(MANIFEST_FILENAME)).map_err(StorageError::Io)?;
        Ok(())
    }

    fn check_collection(&self, col: CollectionId) -> Result<()> {
        if self.cols.contains_key(&col) {
            Ok(())
        } else {
            Err(StorageError::UnknownCollection(col).into())
        }
    }

    fn refuse_snapshot(view: ReadView) -> Result<()> {
        match view {
            ReadView::Head => Ok(()),
            ReadView::Snapshot(_) => Err(StorageError::Unsupported("snapshot reads").into()),
        }
    }

    /// Freeze the active memtable and flush every frozen run into one SST.
    fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        {
            let mut active = self.active.write();
            if active.is_empty() && self.frozen.read().is_empty() {
                return Ok(());
            }
            if !active.is_empty() {
                let run = std::mem::take(&mut *active);
                self.frozen.write().insert(0, Arc::new(run));
            }
        }

        let frozen: Vec<Arc<MemTable>> = self.frozen.read().clone();
        // Oldest first so newer runs overwrite on insert.
        let mut merged: BTreeMap<ComposedKey, Option<Vec<u8>>> = BTreeMap::new();
        for run in frozen.iter().rev() {
            for (key, value) in run.iter() {
                merged.insert(*key, value.clone());
            }
        }

        let id = self.next_sst.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{id:06}.sst"));
        let mut writer = sst::SstWriter::create(&path).map_err(StorageError::Io)?;
        for (key, value) in &merged {
            // Tombstones are kept: they mask entries in older tables.
            writer.add(*key, value.as_deref()).map_err(StorageError::Io)?;
        }
        writer
            .finish(self.applied.load(Ordering::SeqCst), self.opts.sync_flush)
            .map_err(StorageError::Io)?;
        let reader = Arc::new(SstReader::open(&path)?);

        // Publish the table before dropping the frozen runs so readers
        // always find the data in at least one place.
        self.tables.write().insert(0, reader);
        self.frozen.write().clear();
        self.wal.reset()?;

        if self.tables.read().len() >= self.opts.l0_compaction_trigger {
            self.compact()?;
        }
        Ok(())
    }

    /// Full merge of every on-disk table into one. Tombstones and entries
    /// of dropped collections are discarded: after a full merge there is
    /// nothing older left to mask.
    fn compact(&self) -> Result<()> {
        let old: Vec<Arc<SstReader>> = self.tables.read().clone();
        if old.len() < 2 {
            return Ok(());
        }
        let mut merged: BTreeMap<ComposedKey, Vec<u8>> = BTreeMap::new();
        for reader in old.iter().rev() {
            for entry in reader.iter() {
                let composed = (entry.col, entry.key);
                if !self.cols.contains_key(&CollectionId(entry.col)) {
                    merged.remove(&composed);
                    continue;
                }
                match reader.read_value(entry)? {
                    Some(value) => {
                        merged.insert(composed, value);
                    }
                    None => {
                        merged.remove(&composed);
                    }
                }
            }
        }

        let max_seq = old.iter().map(|r| r.max_seq()).max().unwrap_or(0);
        let id = self.next_sst.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{id:06}.sst"));
        let mut writer = sst::SstWriter::create(&path).map_err(StorageError::Io)?;
        for (key, value) in &merged {
            writer.add(*key, Some(value.as_slice())).map_err(StorageError::Io)?;
        }
        writer
            .finish(max_seq, self.opts.sync_flush)
            .map_err(StorageError::Io)?;
        let reader = Arc::new(SstReader::open(&path)?);

        let removed: Vec<PathBuf> = {
            let mut tables = self.tables.write();
            let removed = tables.iter().map(|t| t.path().to_path_buf()).collect();
            *tables = vec![reader];
            removed
        };
        for path in removed {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove compacted SST");
            }
        }
        tracing::debug!(merged_from = old.len(), entries = merged.len(), "LSM compaction");
        Ok(())
    }

    /// Merge scan sources with newest-first precedence.
    fn merge_scan(sources: Vec<Vec<(u64, Option<u32>)>>, limit: usize) -> Vec<(Key, u32)> {
        let mut heads = vec![0usize; sources.len()];
        let mut out = Vec::new();
        while out.len() < limit {
            let mut min_key: Option<u64> = None;
            for (source, &at) in sources.iter().zip(heads.iter()) {
                if let Some(&(key, _)) = source.get(at) {
                    min_key = Some(min_key.map_or(key, |m: u64| m.min(key)));
                }
            }
            let Some(key) = min_key else { break };
            let mut verdict: Option<Option<u32>> = None;
            for (source, at) in sources.iter().zip(heads.iter_mut()) {
                if let Some(&(head_key, len)) = source.get(*at) {
                    if head_key == key {
                        // Sources are ordered newest first; the first one
                        // holding the key decides.
                        if verdict.is_none() {
                            verdict = Some(len);
                        }
                        *at += 1;
                    }
                }
            }
            if let Some(Some(len)) = verdict {
                out.push((Key(key), len));
            }
        }
        out
    }
}

impl KvDriver for LsmDriver {
    fn name(&self) -> &'static str {
        "lsm"
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCaps {
            snapshots: false,
            snapshot_scans: false,
            durable: true,
        }
    }

    fn sequence_floor(&self) -> SeqNo {
        SeqNo(self.applied.load(Ordering::SeqCst))
    }

    fn get(&self, col: CollectionId, key: Key, view: ReadView) -> Result<Option<Vec<u8>>> {
        Self::refuse_snapshot(view)?;
        self.check_collection(col)?;

        if let Some(value) = self.active.read().get(col.0, key.0) {
            return Ok(value.clone());
        }
        for run in self.frozen.read().iter() {
            if let Some(value) = run.get(col.0, key.0) {
                return Ok(value.clone());
            }
        }
        for reader in self.tables.read().iter() {
            if let Some(value) = reader.get(col.0, key.0)? {
                return Ok(value);
            }
        }
        Ok(None)
    }

    fn write_batch(&self, seq: SeqNo, ops: &[WriteOp], flush: bool) -> Result<()> {
        for op in ops {
            self.check_collection(op.col)?;
        }
        let record = WalRecord::Batch {
            seq: seq.0,
            ops: ops
                .iter()
                .map(|op| WalOp {
                    col: op.col.0,
                    key: op.key.0,
                    value: op.value.clone(),
                })
                .collect(),
        };
        self.wal.append(&record, flush)?;

        let needs_flush = {
            let mut active = self.active.write();
            for op in ops {
                active.apply(op.col.0, op.key.0, op.value.clone());
            }
            active.approx_bytes() as u64 >= self.opts.memtable_budget_bytes
        };
        self.applied.fetch_max(seq.0, Ordering::SeqCst);

        if needs_flush {
            self.flush()?;
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
        Self::refuse_snapshot(view)?;
        self.check_collection(col)?;

        let mut sources: Vec<Vec<(u64, Option<u32>)>> = Vec::new();
        sources.push(self.active.read().scan(col.0, from.0).collect());
        for run in self.frozen.read().iter() {
            sources.push(run.scan(col.0, from.0).collect());
        }
        for reader in self.tables.read().iter() {
            sources.push(reader.scan(col.0, from.0).collect());
        }
        Ok(Self::merge_scan(sources, limit))
    }

    fn create_collection(&self, name: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(CollectionId::DEFAULT);
        }
        if let Some(existing) = self.names.get(name) {
            return Ok(*existing.value());
        }
        let id = CollectionId(self.next_col.fetch_add(1, Ordering::SeqCst));
        self.cols.insert(id, name.to_string());
        self.names.insert(name.to_string(), id);
        self.save_manifest()?;
        tracing::debug!(collection = name, id = id.0, "LSM driver created collection");
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
            // Default collection: emptied, never destroyed. Tombstone every
            // visible key; the stamp repeats the current sequence, which
            // replays idempotently.
            let live = self.scan(
                CollectionId::DEFAULT,
                Key(0),
                usize::MAX,
                ReadView::Head,
                false,
            )?;
            if live.is_empty() {
                return Ok(());
            }
            let ops: Vec<WriteOp> = live
                .into_iter()
                .map(|(key, _)| WriteOp::delete(CollectionId::DEFAULT, key))
                .collect();
            let seq = SeqNo(self.applied.load(Ordering::SeqCst));
            return self.write_batch(seq, &ops, false);
        }
        let (_, id) = self
            .names
            .remove(name)
            .ok_or_else(|| StorageError::CollectionNotFound(name.to_string()))?;
        self.cols.remove(&id);
        self.save_manifest()?;
        tracing::debug!(collection = name, id = id.0, "LSM driver dropped collection");
        Ok(())
    }

    fn list_collections(&self) -> Vec<(CollectionId, String)> {
        let mut out: Vec<_> = self
            .cols
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    fn has_collection(&self, col: CollectionId) -> bool {
        self.cols.contains_key(&col)
    }
}
