//! Redo log for the LSM driver.
//!
//! Record format: `[len:4][checksum:4][bincode payload]`, little-endian,
//! after an 8-byte segment header (`magic + format version`). Recovery
//! replays records until the first torn or corrupt frame; everything past
//! a bad checksum is discarded, since a crash mid-append can only damage
//! the tail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kite_common::error::StorageError;

pub const WAL_MAGIC: &[u8; 4] = b"KITE";
pub const WAL_FORMAT_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 8;

const WAL_FILENAME: &str = "kite.wal";

/// One entry of a redo batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalOp {
    pub col: u64,
    pub key: u64,
    /// `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

/// A single WAL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalRecord {
    /// An atomic write batch stamped with its commit sequence.
    Batch { seq: u64, ops: Vec<WalOp> },
}

struct WalWriterInner {
    writer: BufWriter<File>,
}

/// Appender over the single active WAL file.
pub struct WalWriter {
    path: PathBuf,
    inner: Mutex<WalWriterInner>,
}

impl WalWriter {
    /// Open the WAL in `dir`, creating it (with a header) if absent.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILENAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if is_new {
            writer.write_all(WAL_MAGIC)?;
            writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
        }
        Ok(Self {
            path,
            inner: Mutex::new(WalWriterInner { writer }),
        })
    }

    /// Append a record. With `sync`, the record is durable when this
    /// returns; otherwise it is buffered and flushed to the OS.
    pub fn append(&self, record: &WalRecord, sync: bool) -> Result<(), StorageError> {
        let data =
            bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        let len = data.len() as u32;

        let mut inner = self.inner.lock();
        inner.writer.write_all(&len.to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.writer.flush()?;
        if sync {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Truncate to an empty log after the memtable it covered was flushed.
    /// A crash between SST sync and this truncation replays records that
    /// are already in the SST; replay is idempotent, so that is harmless.
    pub fn reset(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(WAL_MAGIC)?;
        writer.write_all(&WAL_FORMAT_VERSION.to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        inner.writer = writer;
        Ok(())
    }

    /// Replay every intact record in `dir`'s WAL, oldest first.
    pub fn read_all(dir: &Path) -> Result<Vec<WalRecord>, StorageError> {
        let path = dir.join(WAL_FILENAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        if data.len() < WAL_HEADER_SIZE {
            return Ok(Vec::new());
        }
        if &data[0..4] != WAL_MAGIC {
            return Err(StorageError::Corruption(format!(
                "bad WAL magic in {}",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != WAL_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported WAL format version {version}"
            )));
        }

        let mut records = Vec::new();
        let mut pos = WAL_HEADER_SIZE;
        while pos + 8 <= data.len() {
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let checksum = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
            let body_start = pos + 8;
            let body_end = body_start + len;
            if body_end > data.len() {
                // Torn tail from a crash mid-append.
                tracing::warn!(offset = pos, "WAL ends in a torn record; truncating replay");
                break;
            }
            let body = &data[body_start..body_end];
            if crc32fast::hash(body) != checksum {
                tracing::warn!(offset = pos, "WAL checksum mismatch; truncating replay");
                break;
            }
            match bincode::deserialize::<WalRecord>(body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(offset = pos, error = %e, "undecodable WAL record; truncating replay");
                    break;
                }
            }
            pos = body_end;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(seq: u64, key: u64, value: Option<&[u8]>) -> WalRecord {
        WalRecord::Batch {
            seq,
            ops: vec![WalOp {
                col: 0,
                key,
                value: value.map(|v| v.to_vec()),
            }],
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path()).unwrap();
        wal.append(&batch(1, 10, Some(b"a")), false).unwrap();
        wal.append(&batch(2, 20, None), true).unwrap();
        drop(wal);

        let records = WalWriter::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        match &records[1] {
            WalRecord::Batch { seq, ops } => {
                assert_eq!(*seq, 2);
                assert_eq!(ops[0].key, 20);
                assert!(ops[0].value.is_none());
            }
        }
    }

    #[test]
    fn test_reset_empties_log() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path()).unwrap();
        wal.append(&batch(1, 1, Some(b"x")), false).unwrap();
        wal.reset().unwrap();
        wal.append(&batch(2, 2, Some(b"y")), false).unwrap();
        drop(wal);

        let records = WalWriter::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            WalRecord::Batch { seq, .. } => assert_eq!(*seq, 2),
        }
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path()).unwrap();
        wal.append(&batch(1, 1, Some(b"keep")), true).unwrap();
        drop(wal);

        // Simulate a crash mid-append: a frame header with no body.
        let path = dir.path().join(WAL_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();

        let records = WalWriter::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_corrupt_checksum_truncates_replay() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(dir.path()).unwrap();
        wal.append(&batch(1, 1, Some(b"good")), true).unwrap();
        wal.append(&batch(2, 2, Some(b"flipped")), true).unwrap();
        drop(wal);

        let path = dir.path().join(WAL_FILENAME);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let records = WalWriter::read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(WAL_FILENAME), b"NOPE0000").unwrap();
        assert!(matches!(
            WalWriter::read_all(dir.path()),
            Err(StorageError::Corruption(_))
        ));
    }
}
