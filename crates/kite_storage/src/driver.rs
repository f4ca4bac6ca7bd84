//! The engine driver contract.
//!
//! A driver binds the database core to one underlying ordered key-value
//! engine. The contract is fixed here; drivers vary. Every driver must keep
//! identical observable semantics for the operations it supports and report
//! the capabilities it lacks through [`DriverCaps`], so the transaction
//! layer can fall back or refuse with `UNSUPPORTED` at call time rather
//! than at link time.

use kite_common::error::Result;
use kite_common::types::{CollectionId, Key, SeqNo, WriteOp};

/// Which state a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadView {
    /// The latest committed state.
    Head,
    /// The state as of the given sequence number. Requires
    /// `DriverCaps::snapshots`.
    Snapshot(SeqNo),
}

/// Optional capabilities a driver may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverCaps {
    /// Point reads at a pinned sequence number.
    pub snapshots: bool,
    /// Range scans at a pinned sequence number.
    pub snapshot_scans: bool,
    /// Committed state survives restart; `sequence_floor` is meaningful.
    pub durable: bool,
}

/// Contract every storage engine binding implements.
///
/// Construction is driver-specific (each driver has its own `open`); the
/// rest of the surface is uniform. Implementations are internally
/// synchronized: all methods take `&self` and are safe to call from
/// concurrent threads.
pub trait KvDriver: Send + Sync {
    /// Short engine name for diagnostics.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> DriverCaps;

    /// Highest sequence number the driver has persisted. The database
    /// rebases its commit counter strictly above this at open so that
    /// recovered sequence numbers stay monotonic. Volatile drivers return
    /// `SeqNo::ZERO`.
    fn sequence_floor(&self) -> SeqNo;

    // ── Point reads ──────────────────────────────────────────────────────

    /// Point lookup. `Ok(None)` means the key is absent; an empty vector is
    /// a present empty value.
    fn get(&self, col: CollectionId, key: Key, view: ReadView) -> Result<Option<Vec<u8>>>;

    /// Vectorized lookup. Must be no worse than N independent `get` calls;
    /// drivers with batched reads override this.
    fn multi_get(
        &self,
        tasks: &[(CollectionId, Key)],
        view: ReadView,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        tasks
            .iter()
            .map(|&(col, key)| self.get(col, key, view))
            .collect()
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Atomic multi-write: either all entries are applied or none. `seq` is
    /// the commit stamp; version-tracking drivers stamp the written entries
    /// with it, durable drivers persist it as their sequence floor.
    fn write_batch(&self, seq: SeqNo, ops: &[WriteOp], flush: bool) -> Result<()>;

    // ── Scans ────────────────────────────────────────────────────────────

    /// Forward range scan from the first key `>= from`, at most `limit`
    /// entries, in strictly ascending key order. Yields `(key, value_len)`;
    /// values are fetched lazily by a follow-up read. `fill_cache = false`
    /// asks the engine not to pollute its block cache, where it has one.
    fn scan(
        &self,
        col: CollectionId,
        from: Key,
        limit: usize,
        view: ReadView,
        fill_cache: bool,
    ) -> Result<Vec<(Key, u32)>>;

    // ── Snapshots (optional) ─────────────────────────────────────────────

    /// Pin the current state and return its sequence number. Only drivers
    /// with `DriverCaps::snapshots`; the default refuses.
    fn snapshot(&self) -> Result<SeqNo> {
        Err(kite_common::error::StorageError::Unsupported("snapshots").into())
    }

    /// Release a snapshot previously pinned by `snapshot`. Unpinning the
    /// oldest snapshot may advance the driver's garbage watermark.
    fn release_snapshot(&self, _seq: SeqNo) {}

    // ── Collections ──────────────────────────────────────────────────────

    /// Get-or-create the collection with the given name.
    fn create_collection(&self, name: &str) -> Result<CollectionId>;

    /// Handle of an existing collection, if any.
    fn find_collection(&self, name: &str) -> Option<CollectionId>;

    /// Remove the named collection. The default collection is emptied but
    /// never destroyed; named collections lose their handle and entries.
    fn drop_collection(&self, name: &str) -> Result<()>;

    /// All collections, default included, as `(handle, name)` pairs. The
    /// default collection reports an empty name.
    fn list_collections(&self) -> Vec<(CollectionId, String)>;

    /// Whether a handle is currently valid.
    fn has_collection(&self, col: CollectionId) -> bool;
}
