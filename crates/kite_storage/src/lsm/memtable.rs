//! Mutable sorted run over composite `(collection, key)` pairs.
//!
//! The LSM driver is head-only: the memtable keeps the latest value per
//! key, with `None` as a tombstone that masks older entries in the SSTs
//! below. Byte accounting drives memtable rotation.

use std::collections::BTreeMap;

/// `(collection id, key)`, ordered first by collection then by key, so a
/// per-collection range scan is a contiguous slice of the map.
pub type ComposedKey = (u64, u64);

/// Per-entry bookkeeping overhead added to the byte estimate.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Default)]
pub struct MemTable {
    map: BTreeMap<ComposedKey, Option<Vec<u8>>>,
    bytes: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert or tombstone one entry.
    pub fn apply(&mut self, col: u64, key: u64, value: Option<Vec<u8>>) {
        let added = value.as_ref().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;
        if let Some(old) = self.map.insert((col, key), value) {
            self.bytes = self
                .bytes
                .saturating_sub(old.map_or(0, |v| v.len()) + ENTRY_OVERHEAD);
        }
        self.bytes += added;
    }

    /// Lookup. Outer `None`: this run knows nothing about the key.
    /// `Some(None)`: tombstoned here.
    pub fn get(&self, col: u64, key: u64) -> Option<&Option<Vec<u8>>> {
        self.map.get(&(col, key))
    }

    /// Entries of one collection with keys `>= from`, ascending, as
    /// `(key, value_len)` where `None` is a tombstone.
    pub fn scan(&self, col: u64, from: u64) -> impl Iterator<Item = (u64, Option<u32>)> + '_ {
        self.map
            .range((col, from)..)
            .take_while(move |((c, _), _)| *c == col)
            .map(|((_, key), value)| (*key, value.as_ref().map(|v| v.len() as u32)))
    }

    /// All entries in composite order, for SST building.
    pub fn iter(&self) -> impl Iterator<Item = (&ComposedKey, &Option<Vec<u8>>)> {
        self.map.iter()
    }

    pub fn approx_bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_get() {
        let mut table = MemTable::new();
        table.apply(0, 42, Some(b"v".to_vec()));
        assert_eq!(table.get(0, 42), Some(&Some(b"v".to_vec())));
        assert_eq!(table.get(0, 43), None);
        table.apply(0, 42, None);
        assert_eq!(table.get(0, 42), Some(&None));
    }

    #[test]
    fn test_byte_accounting_on_overwrite() {
        let mut table = MemTable::new();
        table.apply(0, 1, Some(vec![0u8; 100]));
        let after_first = table.approx_bytes();
        table.apply(0, 1, Some(vec![0u8; 10]));
        assert!(table.approx_bytes() < after_first);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_scan_is_collection_bounded() {
        let mut table = MemTable::new();
        table.apply(0, 10, Some(b"a".to_vec()));
        table.apply(0, 20, None);
        table.apply(1, 15, Some(b"other".to_vec()));
        let hits: Vec<_> = table.scan(0, 0).collect();
        assert_eq!(hits, vec![(10, Some(1)), (20, None)]);
        let hits: Vec<_> = table.scan(1, 0).collect();
        assert_eq!(hits, vec![(15, Some(5))]);
    }

    #[test]
    fn test_scan_from_lower_bound() {
        let mut table = MemTable::new();
        for key in [5u64, 10, 12, 20] {
            table.apply(0, key, Some(vec![]));
        }
        let keys: Vec<u64> = table.scan(0, 10).map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 12, 20]);
    }
}
