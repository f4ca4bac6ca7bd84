//! Optimistic concurrency control with snapshot reads.
//!
//! Every transaction reads at a pinned snapshot sequence and buffers its
//! writes. Commit is validate-and-apply under a short critical section:
//! a per-key index of the most recent committing write is checked against
//! the transaction's read-set, and on success the write-set is applied as
//! one atomic driver batch stamped with the next sequence number.
//!
//! Sequence numbers track applied writes: an aborted commit consumes no
//! sequence, so replaying committed batches in ascending order from an
//! empty database reproduces the observable state exactly.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use kite_common::error::{Result, TxnError};
use kite_common::options::Options;
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};
use kite_storage::driver::{KvDriver, ReadView};

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    Aborted,
}

impl TxnState {
    fn as_str(&self) -> &'static str {
        match self {
            TxnState::Open => "open",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        }
    }
}

/// How a key entered the read-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Present,
    Absent,
    /// Registered by `watch` or by a write; value never retrieved.
    Watched,
}

/// A single-owner transaction handle.
///
/// Not for concurrent use by multiple threads; all access goes through
/// `&mut self`. A handle is reusable: `TxnManager::reset` re-arms it with
/// a fresh snapshot after commit, abort or conflict.
#[derive(Debug)]
pub struct Transaction {
    snapshot: SeqNo,
    /// Whether the snapshot is pinned inside the driver.
    pinned: bool,
    state: TxnState,
    reads: HashMap<(CollectionId, Key), Presence>,
    writes: HashMap<(CollectionId, Key), Option<Vec<u8>>>,
    /// First-write order of keys, for deterministic batch layout.
    write_order: Vec<(CollectionId, Key)>,
}

impl Transaction {
    pub fn snapshot(&self) -> SeqNo {
        self.snapshot
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }

    /// Number of keys currently watched.
    pub fn read_set_len(&self) -> usize {
        self.reads.len()
    }

    /// Number of keys with buffered writes.
    pub fn write_set_len(&self) -> usize {
        self.writes.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TxnState::Open {
            Ok(())
        } else {
            Err(TxnError::NotOpen(self.state.as_str()).into())
        }
    }

    fn buffer_write(&mut self, op: WriteOp) {
        let addr = (op.col, op.key);
        if self.writes.insert(addr, op.value).is_none() {
            self.write_order.push(addr);
        }
    }

    /// Materialize the write-set as a driver batch, in first-write order
    /// with final values.
    fn build_batch(&self) -> Vec<WriteOp> {
        self.write_order
            .iter()
            .map(|&(col, key)| WriteOp {
                col,
                key,
                value: self.writes[&(col, key)].clone(),
            })
            .collect()
    }

    fn clear_sets(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.write_order.clear();
    }
}

/// Atomic counters for transaction statistics.
#[derive(Debug, Default)]
struct TxnStatsCollector {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    active: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub conflicts: u64,
    pub active: u64,
}

/// Manages snapshots, conflict detection and commit sequencing for one
/// database.
pub struct TxnManager {
    driver: Arc<dyn KvDriver>,
    /// Current applied sequence. Advances only when a batch lands.
    seq: AtomicU64,
    /// Serialization point for validate-and-apply.
    commit_lock: Mutex<()>,
    /// Most recent committing write per key.
    last_committed: DashMap<(CollectionId, Key), SeqNo>,
    /// Live snapshot refcounts; the minimum bounds conflict-index GC.
    live_snapshots: Mutex<BTreeMap<u64, usize>>,
    stats: TxnStatsCollector,
}

impl TxnManager {
    /// The commit counter is rebased above the driver's persisted floor so
    /// recovered databases keep allocating monotonic sequence numbers.
    pub fn new(driver: Arc<dyn KvDriver>) -> Self {
        let floor = driver.sequence_floor();
        Self {
            driver,
            seq: AtomicU64::new(floor.0),
            commit_lock: Mutex::new(()),
            last_committed: DashMap::new(),
            live_snapshots: Mutex::new(BTreeMap::new()),
            stats: TxnStatsCollector::default(),
        }
    }

    /// Latest applied sequence number.
    pub fn current_seq(&self) -> SeqNo {
        SeqNo(self.seq.load(Ordering::SeqCst))
    }

    pub fn stats_snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.stats.begun.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
        }
    }

    /// Number of transactions currently open.
    pub fn active_count(&self) -> u64 {
        self.stats.active.load(Ordering::Relaxed)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Begin a new transaction at the current sequence.
    pub fn begin(&self) -> Result<Transaction> {
        let (snapshot, pinned) = self.acquire_snapshot()?;
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(snapshot = snapshot.0, "txn begin");
        Ok(Transaction {
            snapshot,
            pinned,
            state: TxnState::Open,
            reads: HashMap::new(),
            writes: HashMap::new(),
            write_order: Vec::new(),
        })
    }

    /// Re-arm an existing handle: the previous transaction is aborted, its
    /// read and write sets cleared, and a fresh snapshot acquired.
    pub fn reset(&self, txn: &mut Transaction) -> Result<()> {
        if txn.state == TxnState::Open {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.finish(txn, TxnState::Aborted);
        let (snapshot, pinned) = self.acquire_snapshot()?;
        txn.snapshot = snapshot;
        txn.pinned = pinned;
        txn.state = TxnState::Open;
        txn.clear_sets();
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(snapshot = snapshot.0, "txn reset");
        Ok(())
    }

    /// Abort: discard both sets and release the snapshot.
    pub fn abort(&self, txn: &mut Transaction) {
        if txn.state == TxnState::Open {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.finish(txn, TxnState::Aborted);
        txn.clear_sets();
    }

    fn acquire_snapshot(&self) -> Result<(SeqNo, bool)> {
        let caps = self.driver.capabilities();
        let snapshot = if caps.snapshots {
            self.driver.snapshot()?
        } else {
            self.current_seq()
        };
        self.live_snapshots
            .lock()
            .entry(snapshot.0)
            .and_modify(|count| *count += 1)
            .or_insert(1);
        Ok((snapshot, caps.snapshots))
    }

    /// Transition out of `Open`, releasing the snapshot exactly once.
    fn finish(&self, txn: &mut Transaction, state: TxnState) {
        if txn.state == TxnState::Open {
            self.release_snapshot(txn.snapshot, txn.pinned);
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
        }
        txn.state = state;
    }

    fn release_snapshot(&self, snapshot: SeqNo, pinned: bool) {
        let mut live = self.live_snapshots.lock();
        if let Some(count) = live.get_mut(&snapshot.0) {
            *count -= 1;
            if *count == 0 {
                live.remove(&snapshot.0);
            }
        }
        drop(live);
        if pinned {
            self.driver.release_snapshot(snapshot);
        }
        self.gc_conflict_index();
    }

    /// Drop conflict-index entries no live or future snapshot can observe
    /// as a conflict: anything stamped at or below the oldest live
    /// snapshot (or the current sequence when none is live).
    fn gc_conflict_index(&self) {
        let watermark = {
            let live = self.live_snapshots.lock();
            live.keys()
                .next()
                .copied()
                .unwrap_or_else(|| self.seq.load(Ordering::SeqCst))
        };
        self.last_committed
            .retain(|_, committed| committed.0 > watermark);
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Batch read inside a transaction: local writes win; everything else
    /// is read at the snapshot. Records each key's presence in the
    /// read-set unless the read is transparent.
    pub fn read(
        &self,
        txn: &mut Transaction,
        tasks: &[(CollectionId, Key)],
        opts: Options,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        txn.ensure_open()?;
        let view = self.transactional_view(txn, opts)?;

        let mut out: Vec<Option<Option<Vec<u8>>>> = vec![None; tasks.len()];
        let mut misses = Vec::new();
        let mut miss_slots = Vec::new();
        for (slot, task) in tasks.iter().enumerate() {
            if let Some(pending) = txn.writes.get(task) {
                out[slot] = Some(pending.clone());
            } else {
                misses.push(*task);
                miss_slots.push(slot);
            }
        }
        if !misses.is_empty() {
            let fetched = self.driver.multi_get(&misses, view)?;
            for (slot, value) in miss_slots.into_iter().zip(fetched) {
                out[slot] = Some(value);
            }
        }

        let values: Vec<Option<Vec<u8>>> = out
            .into_iter()
            .map(|v| v.expect("every slot is filled by a local hit or the driver read"))
            .collect();
        if !opts.read_transparent {
            for (task, value) in tasks.iter().zip(values.iter()) {
                let presence = if value.is_some() {
                    Presence::Present
                } else {
                    Presence::Absent
                };
                txn.reads.insert(*task, presence);
            }
        }
        Ok(values)
    }

    /// Register keys in the read-set without retrieving values.
    pub fn watch(&self, txn: &mut Transaction, tasks: &[(CollectionId, Key)]) -> Result<()> {
        txn.ensure_open()?;
        for task in tasks {
            txn.reads.entry(*task).or_insert(Presence::Watched);
        }
        Ok(())
    }

    fn transactional_view(&self, txn: &Transaction, opts: Options) -> Result<ReadView> {
        let caps = self.driver.capabilities();
        if caps.snapshots {
            Ok(ReadView::Snapshot(txn.snapshot))
        } else if opts.read_transparent {
            // The engine keeps no history; transparent reads observe head.
            Ok(ReadView::Head)
        } else {
            Err(TxnError::SnapshotUnsupported.into())
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Buffer writes. Each written key also joins the read-set, so blind
    /// writes still conflict with concurrent writers; `txn_dont_watch`
    /// opts out of that and leaves the write unverified at commit.
    pub fn write(&self, txn: &mut Transaction, ops: Vec<WriteOp>, opts: Options) -> Result<()> {
        txn.ensure_open()?;
        // Validate every handle up front so a bad task leaves the
        // transaction untouched.
        for op in &ops {
            if !self.driver.has_collection(op.col) {
                return Err(kite_common::error::StorageError::UnknownCollection(op.col).into());
            }
        }
        for op in ops {
            if !opts.txn_dont_watch {
                txn.reads.entry((op.col, op.key)).or_insert(Presence::Watched);
            }
            txn.buffer_write(op);
        }
        Ok(())
    }

    // ── Scans ────────────────────────────────────────────────────────────

    /// Snapshotted range scan merged with the transaction's own pending
    /// writes. Refused when the driver cannot scan at a snapshot.
    pub fn scan(
        &self,
        txn: &mut Transaction,
        col: CollectionId,
        from: Key,
        limit: usize,
        _opts: Options,
    ) -> Result<Vec<(Key, u32)>> {
        txn.ensure_open()?;
        if !self.driver.capabilities().snapshot_scans {
            return Err(TxnError::ScanUnsupported.into());
        }

        // Local tombstones can erase driver hits; over-fetch by that many
        // so the limit stays honest.
        let local_deletes = txn
            .writes
            .iter()
            .filter(|(&(c, key), value)| c == col && key >= from && value.is_none())
            .count();
        let fetch = limit.saturating_add(local_deletes);
        let hits = self.driver.scan(
            col,
            from,
            fetch,
            ReadView::Snapshot(txn.snapshot),
            // Scans bypass the engine's block cache by default.
            false,
        )?;

        let mut merged: BTreeMap<Key, u32> = hits.into_iter().collect();
        for (&(c, key), value) in &txn.writes {
            if c != col || key < from {
                continue;
            }
            match value {
                Some(bytes) => {
                    merged.insert(key, bytes.len() as u32);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_iter().take(limit).collect())
    }

    // ── Commit ───────────────────────────────────────────────────────────

    /// Validate-and-apply. On success the assigned commit sequence is
    /// returned and the handle transitions to `Committed`. On conflict the
    /// handle transitions to `Aborted` with both sets preserved for
    /// inspection; the sequence is not consumed.
    pub fn commit(&self, txn: &mut Transaction, opts: Options) -> Result<SeqNo> {
        txn.ensure_open()?;

        // A transaction that wrote nothing serializes at its snapshot.
        if txn.write_order.is_empty() {
            let snapshot = txn.snapshot;
            self.finish(txn, TxnState::Committed);
            txn.clear_sets();
            self.stats.committed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(seq = snapshot.0, "txn read-only commit");
            return Ok(snapshot);
        }

        let commit_guard = self.commit_lock.lock();
        let tentative = SeqNo(self.seq.load(Ordering::SeqCst) + 1);

        // Validation: nobody may have committed to a watched key after our
        // snapshot. All commits so far are below `tentative` because we
        // hold the commit lock.
        let mut conflict = None;
        for &(col, key) in txn.reads.keys() {
            if let Some(entry) = self.last_committed.get(&(col, key)) {
                let committed = *entry.value();
                if committed > txn.snapshot {
                    conflict = Some((col, key, committed));
                    break;
                }
            }
        }
        if let Some((col, key, committed)) = conflict {
            drop(commit_guard);
            let snapshot = txn.snapshot;
            self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            // Sets stay intact so the caller can inspect or retry.
            self.finish(txn, TxnState::Aborted);
            tracing::warn!(
                col = col.0,
                key = key.0,
                committed = committed.0,
                snapshot = snapshot.0,
                "txn conflict"
            );
            return Err(TxnError::Conflict {
                col,
                key,
                committed,
                snapshot,
            }
            .into());
        }

        let batch = txn.build_batch();
        if let Err(e) = self.driver.write_batch(tentative, &batch, opts.write_flush) {
            drop(commit_guard);
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            self.finish(txn, TxnState::Aborted);
            txn.clear_sets();
            return Err(e);
        }
        self.seq.store(tentative.0, Ordering::SeqCst);
        for op in &batch {
            self.last_committed.insert((op.col, op.key), tentative);
        }
        drop(commit_guard);

        self.finish(txn, TxnState::Committed);
        txn.clear_sets();
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(seq = tentative.0, writes = batch.len(), "txn commit");
        Ok(tentative)
    }

    // ── Non-transactional writes ─────────────────────────────────────────

    /// Apply a batch outside any transaction. The batch is sequenced
    /// through the same commit path, so it is linearizable against
    /// transactional commits and participates in conflict detection.
    pub fn apply(&self, ops: &[WriteOp], flush: bool) -> Result<SeqNo> {
        let commit_guard = self.commit_lock.lock();
        let tentative = SeqNo(self.seq.load(Ordering::SeqCst) + 1);
        self.driver.write_batch(tentative, ops, flush)?;
        self.seq.store(tentative.0, Ordering::SeqCst);
        for op in ops {
            self.last_committed.insert((op.col, op.key), tentative);
        }
        drop(commit_guard);
        Ok(tentative)
    }

    /// Size of the conflict index, for observability and tests.
    pub fn conflict_index_len(&self) -> usize {
        self.last_committed.len()
    }

    pub fn driver(&self) -> &Arc<dyn KvDriver> {
        &self.driver
    }
}
