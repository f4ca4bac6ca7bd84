//! Core value types shared across the KiteKV crates.
//!
//! Keys are fixed-width 64-bit integers: comparisons, hashing and on-disk
//! encoding stay trivial and allocation-free. Variable-length identifiers
//! belong to higher layers, not this engine.

use serde::{Deserialize, Serialize};

/// Sentinel length marking an absent value on a result tape.
/// A present-but-empty value reports length 0 instead.
pub const LEN_MISSING: u32 = u32::MAX;

/// A key inside a collection. Total order is numeric.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Key(pub u64);

impl Key {
    /// Reserved sentinel; never stored.
    pub const UNKNOWN: Key = Key(u64::MAX);

    /// Big-endian encoding, ordered the same as the numeric key order.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Key(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit sequence number. Strictly monotonic across committed transactions;
/// replaying commits in ascending `SeqNo` order from an empty database
/// reproduces the observable state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct SeqNo(pub u64);

impl SeqNo {
    /// State of the empty database, before any commit.
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }
}

impl std::fmt::Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a named collection. Stable for the lifetime of the database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct CollectionId(pub u64);

impl CollectionId {
    /// The unnamed default collection. Always exists; cannot be destroyed.
    pub const DEFAULT: CollectionId = CollectionId(0);
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry of an atomic write batch. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub col: CollectionId,
    pub key: Key,
    pub value: Option<Vec<u8>>,
}

impl WriteOp {
    pub fn put(col: CollectionId, key: Key, value: Vec<u8>) -> Self {
        Self {
            col,
            key,
            value: Some(value),
        }
    }

    pub fn delete(col: CollectionId, key: Key) -> Self {
        Self {
            col,
            key,
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_be_encoding_preserves_order() {
        let keys = [Key(0), Key(1), Key(255), Key(256), Key(u64::MAX - 1)];
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_be_bytes() < pair[1].to_be_bytes());
        }
    }

    #[test]
    fn test_key_be_round_trip() {
        let k = Key(0xDEAD_BEEF_0000_0042);
        assert_eq!(Key::from_be_bytes(k.to_be_bytes()), k);
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(Key::UNKNOWN.0, u64::MAX);
        assert_eq!(LEN_MISSING, u32::MAX);
        assert_eq!(SeqNo::ZERO.next(), SeqNo(1));
    }

    #[test]
    fn test_write_op_tombstone() {
        let op = WriteOp::delete(CollectionId::DEFAULT, Key(7));
        assert!(op.is_delete());
        let op = WriteOp::put(CollectionId::DEFAULT, Key(7), vec![]);
        assert!(!op.is_delete());
    }
}
