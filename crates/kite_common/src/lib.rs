pub mod config;
pub mod error;
pub mod options;
pub mod types;

pub use error::{ErrorKind, KiteError, Result, StorageError, TxnError};
pub use options::Options;
pub use types::{CollectionId, Key, SeqNo, WriteOp, LEN_MISSING};
