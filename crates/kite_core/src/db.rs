//! The database facade.
//!
//! A `Database` owns one storage driver and the transaction manager wired
//! to it, and exposes the batch read / write / scan surface over strided
//! task inputs with arena-marshalled results. Handles are plain values:
//! collections are ids, transactions are single-owner structs, and
//! dropping the database releases everything.

use std::sync::Arc;

use kite_common::config::{DatabaseConfig, DriverChoice};
use kite_common::error::{KiteError, Result};
use kite_common::options::Options;
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};
use kite_storage::driver::{KvDriver, ReadView};
use kite_storage::lsm::LsmDriver;
use kite_storage::mem::MemDriver;
use kite_storage::sled_driver::SledDriver;
use kite_txn::{Transaction, TxnManager, TxnStatsSnapshot};

use crate::arena::{Arena, ContainsTape, ReadTape, ScanTape};
use crate::tasks::{ReadTasks, ScanTasks, WriteTasks};

/// Point-in-time database status, for logging and support tooling.
#[derive(Debug, Clone)]
pub struct DatabaseStatus {
    pub driver: &'static str,
    pub durable: bool,
    pub collections: usize,
    pub active_transactions: u64,
    pub current_seq: SeqNo,
    pub txn_stats: TxnStatsSnapshot,
}

/// An open KiteKV database.
pub struct Database {
    driver: Arc<dyn KvDriver>,
    manager: TxnManager,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open a database at a location string: empty or `mem:` for the
    /// in-memory engine, `lsm://<path>` or a bare path for the bundled
    /// LSM engine, `sled://<path>` for the sled engine.
    pub fn open(location: &str) -> Result<Self> {
        Self::open_with_config(DatabaseConfig::parse(location)?)
    }

    pub fn open_with_config(config: DatabaseConfig) -> Result<Self> {
        let driver: Arc<dyn KvDriver> = match &config.driver {
            DriverChoice::Mem => MemDriver::open(),
            DriverChoice::Lsm { path } => LsmDriver::open(path, config.lsm.clone())
                .map_err(|e| KiteError::Open(format!("lsm at {}: {e}", path.display())))?,
            DriverChoice::Sled { path } => SledDriver::open(path)
                .map_err(|e| KiteError::Open(format!("sled at {}: {e}", path.display())))?,
        };
        let manager = TxnManager::new(driver.clone());
        tracing::info!(
            driver = driver.name(),
            sequence_floor = manager.current_seq().0,
            "database opened"
        );
        Ok(Self { driver, manager })
    }

    pub fn status(&self) -> DatabaseStatus {
        let caps = self.driver.capabilities();
        DatabaseStatus {
            driver: self.driver.name(),
            durable: caps.durable,
            collections: self.driver.list_collections().len(),
            active_transactions: self.manager.active_count(),
            current_seq: self.manager.current_seq(),
            txn_stats: self.manager.stats_snapshot(),
        }
    }

    /// Latest committed sequence number.
    pub fn current_seq(&self) -> SeqNo {
        self.manager.current_seq()
    }

    pub fn driver(&self) -> &Arc<dyn KvDriver> {
        &self.driver
    }

    // ── Collections ──────────────────────────────────────────────────────

    /// Get-or-create a collection. `None` or an empty name addresses the
    /// default collection.
    pub fn collection_open(&self, name: Option<&str>) -> Result<CollectionId> {
        self.driver.create_collection(name.unwrap_or(""))
    }

    /// Remove a collection: the default collection is emptied but kept,
    /// named collections lose handle and entries.
    pub fn collection_remove(&self, name: Option<&str>) -> Result<()> {
        self.driver.drop_collection(name.unwrap_or(""))
    }

    pub fn list_collections(&self) -> Vec<(CollectionId, String)> {
        self.driver.list_collections()
    }

    // ── Transactions ─────────────────────────────────────────────────────

    pub fn begin(&self) -> Result<Transaction> {
        self.manager.begin()
    }

    /// Re-arm an existing handle with a fresh snapshot.
    pub fn txn_reset(&self, txn: &mut Transaction) -> Result<()> {
        self.manager.reset(txn)
    }

    pub fn commit(&self, txn: &mut Transaction, opts: Options) -> Result<SeqNo> {
        self.manager.commit(txn, opts)
    }

    pub fn abort(&self, txn: &mut Transaction) {
        self.manager.abort(txn)
    }

    /// Register keys in a transaction's read-set without reading them.
    pub fn watch(&self, txn: &mut Transaction, tasks: &ReadTasks<'_>) -> Result<()> {
        let decoded = tasks.decode()?;
        self.manager.watch(txn, &decoded)
    }

    // ── Read path ────────────────────────────────────────────────────────

    /// Batch point read. Results land on the arena tape: a `u32` length
    /// per task (with `LEN_MISSING` for absent keys) followed by the
    /// concatenated value bytes.
    pub fn read<'a>(
        &self,
        txn: Option<&mut Transaction>,
        tasks: &ReadTasks<'_>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<ReadTape<'a>> {
        let values = self.read_values(txn, tasks, opts)?;
        Ok(arena.write_read_tape(&values))
    }

    /// Batch presence check: same inputs as `read`, boolean results, no
    /// value bytes copied out.
    pub fn contains<'a>(
        &self,
        txn: Option<&mut Transaction>,
        tasks: &ReadTasks<'_>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<ContainsTape<'a>> {
        let values = self.read_values(txn, tasks, opts)?;
        let present: Vec<bool> = values.iter().map(|v| v.is_some()).collect();
        Ok(arena.write_contains_tape(&present))
    }

    fn read_values(
        &self,
        txn: Option<&mut Transaction>,
        tasks: &ReadTasks<'_>,
        opts: Options,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let decoded = tasks.decode()?;
        match txn {
            Some(txn) => self.manager.read(txn, &decoded, opts),
            None => {
                // Singleton fast path: skip vector assembly for N = 1.
                if let [(col, key)] = decoded[..] {
                    Ok(vec![self.driver.get(col, key, ReadView::Head)?])
                } else {
                    self.driver.multi_get(&decoded, ReadView::Head)
                }
            }
        }
    }

    // ── Write path ───────────────────────────────────────────────────────

    /// Batch upsert/delete. Inside a transaction the writes are buffered;
    /// otherwise the batch is applied atomically and sequenced against
    /// transactional commits.
    pub fn write(
        &self,
        txn: Option<&mut Transaction>,
        tasks: &WriteTasks<'_>,
        opts: Options,
    ) -> Result<()> {
        let decoded = tasks.decode()?;
        let ops: Vec<WriteOp> = decoded
            .iter()
            .map(|task| WriteOp {
                col: task.col,
                key: task.key,
                value: task.value.map(|v| v.to_vec()),
            })
            .collect();
        match txn {
            Some(txn) => self.manager.write(txn, ops, opts),
            None => {
                self.manager.apply(&ops, opts.write_flush)?;
                Ok(())
            }
        }
    }

    /// Apply an owned batch outside any transaction, returning the
    /// assigned sequence number.
    pub fn write_ops(&self, ops: &[WriteOp], opts: Options) -> Result<SeqNo> {
        self.manager.apply(ops, opts.write_flush)
    }

    /// Buffer an owned batch into a transaction.
    pub fn write_buffered(
        &self,
        txn: &mut Transaction,
        ops: Vec<WriteOp>,
        opts: Options,
    ) -> Result<()> {
        self.manager.write(txn, ops, opts)
    }

    // ── Scan path ────────────────────────────────────────────────────────

    /// Batch forward range scan. Keys and value-lengths land on the arena
    /// tape; values are not materialized. Each task occupies exactly its
    /// requested span, padded with `Key::UNKNOWN` / `LEN_MISSING`.
    pub fn scan<'a>(
        &self,
        mut txn: Option<&mut Transaction>,
        tasks: &ScanTasks<'_>,
        opts: Options,
        arena: &'a mut Arena,
    ) -> Result<ScanTape<'a>> {
        let decoded: Vec<(CollectionId, Key, u32)> = tasks.decode()?;
        let mut results = Vec::with_capacity(decoded.len());
        for (col, min_key, count) in decoded {
            let hits = match txn.as_deref_mut() {
                Some(txn) => self.manager.scan(txn, col, min_key, count as usize, opts)?,
                // Scans bypass the engine's block cache by default.
                None => self
                    .driver
                    .scan(col, min_key, count as usize, ReadView::Head, false)?,
            };
            results.push((count, hits));
        }
        Ok(arena.write_scan_tape(&results))
    }
}
