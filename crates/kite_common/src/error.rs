use thiserror::Error;

use crate::types::{CollectionId, Key, SeqNo};

/// Convenience alias for `Result<T, KiteError>`.
pub type Result<T> = std::result::Result<T, KiteError>;

/// Error classification for retry decisions and ABI string prefixes.
///
/// Every diagnostic string crossing the ABI starts with the corresponding
/// `prefix()` so callers can classify without parsing the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Engine could not initialize.
    OpenFailure,
    /// Malformed inputs: stride/length mismatch, unknown collection, bad name.
    InvalidArgument,
    /// A named resource was addressed that does not exist. Missing keys are
    /// NOT errors on the read path; they are encoded as `LEN_MISSING`.
    NotFound,
    /// Serialization conflict detected at commit. Retryable.
    Conflict,
    /// The driver lacks a requested capability.
    Unsupported,
    /// Underlying storage I/O failure.
    Io,
    /// The engine reports data damage.
    Corruption,
    /// Arena or internal allocation failed.
    OutOfMemory,
    /// Unexpected condition.
    Internal,
}

impl ErrorKind {
    /// Short uppercase prefix leading every ABI diagnostic string.
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorKind::OpenFailure => "OPEN_FAILURE",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Io => "IO",
            ErrorKind::Corruption => "CORRUPTION",
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KiteError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Open failure: {0}")]
    Open(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage / driver layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Collection not found: {0:?}")]
    CollectionNotFound(String),

    #[error("Unknown collection handle: {0}")]
    UnknownCollection(CollectionId),

    #[error("Collection name must be non-empty UTF-8")]
    InvalidCollectionName,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Allocation failed: {0}")]
    OutOfMemory(String),

    #[error("Driver does not support {0}")]
    Unsupported(&'static str),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Serialization conflict on key {key} in collection {col}: \
             committed at {committed}, snapshot was {snapshot}")]
    Conflict {
        col: CollectionId,
        key: Key,
        committed: SeqNo,
        snapshot: SeqNo,
    },

    #[error("Transaction is not open (state: {0})")]
    NotOpen(&'static str),

    #[error("Snapshot reads are not supported by this driver; \
             pass the transparent-read option or use a snapshotting engine")]
    SnapshotUnsupported,

    #[error("Snapshotted scans are not supported by this driver")]
    ScanUnsupported,
}

impl KiteError {
    /// Classify this error into the fixed taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KiteError::Open(_) => ErrorKind::OpenFailure,
            KiteError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KiteError::Unsupported(_) => ErrorKind::Unsupported,
            KiteError::Internal(_) => ErrorKind::Internal,

            KiteError::Storage(StorageError::CollectionNotFound(_)) => ErrorKind::NotFound,
            KiteError::Storage(StorageError::UnknownCollection(_)) => ErrorKind::InvalidArgument,
            KiteError::Storage(StorageError::InvalidCollectionName) => ErrorKind::InvalidArgument,
            KiteError::Storage(StorageError::Io(_)) => ErrorKind::Io,
            KiteError::Storage(StorageError::Corruption(_)) => ErrorKind::Corruption,
            KiteError::Storage(StorageError::Serialization(_)) => ErrorKind::Corruption,
            KiteError::Storage(StorageError::OutOfMemory(_)) => ErrorKind::OutOfMemory,
            KiteError::Storage(StorageError::Unsupported(_)) => ErrorKind::Unsupported,

            KiteError::Txn(TxnError::Conflict { .. }) => ErrorKind::Conflict,
            KiteError::Txn(TxnError::NotOpen(_)) => ErrorKind::InvalidArgument,
            KiteError::Txn(TxnError::SnapshotUnsupported) => ErrorKind::Unsupported,
            KiteError::Txn(TxnError::ScanUnsupported) => ErrorKind::Unsupported,
        }
    }

    /// True when the client should retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict)
    }

    /// Render the prefixed diagnostic string used at the ABI boundary.
    pub fn to_abi_string(&self) -> String {
        format!("{}: {}", self.kind().prefix(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let e = KiteError::Txn(TxnError::Conflict {
            col: CollectionId::DEFAULT,
            key: Key(42),
            committed: SeqNo(9),
            snapshot: SeqNo(3),
        });
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert!(e.is_retryable());
        assert!(e.to_abi_string().starts_with("CONFLICT: "));
    }

    #[test]
    fn test_missing_collection_is_not_found() {
        let e = KiteError::Storage(StorageError::CollectionNotFound("graph".into()));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_io_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e = KiteError::Storage(StorageError::Io(io));
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(e.to_abi_string().starts_with("IO: "));
    }

    #[test]
    fn test_unsupported_snapshot_reads() {
        let e = KiteError::Txn(TxnError::SnapshotUnsupported);
        assert_eq!(e.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_from_storage_error() {
        let e: KiteError = StorageError::InvalidCollectionName.into();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_kind_prefixes_are_stable() {
        assert_eq!(ErrorKind::OpenFailure.prefix(), "OPEN_FAILURE");
        assert_eq!(ErrorKind::Corruption.prefix(), "CORRUPTION");
        assert_eq!(ErrorKind::OutOfMemory.prefix(), "OUT_OF_MEMORY");
    }
}
