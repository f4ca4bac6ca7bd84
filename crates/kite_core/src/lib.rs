pub mod arena;
pub mod db;
pub mod strided;
pub mod tasks;

pub use arena::{Arena, ContainsTape, ReadTape, ScanTape};
pub use db::{Database, DatabaseStatus};
pub use strided::Strided;
pub use tasks::{ReadTasks, ScanTasks, WriteTask, WriteTasks};

pub use kite_common::config::{DatabaseConfig, DriverChoice};
pub use kite_common::error::{ErrorKind, KiteError, Result};
pub use kite_common::options::Options;
pub use kite_common::types::{CollectionId, Key, SeqNo, WriteOp, LEN_MISSING};
pub use kite_txn::{Transaction, TxnState};
