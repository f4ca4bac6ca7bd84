//! Sorted table files.
//!
//! Layout:
//! ```text
//!   [magic "KSST"(4)] [format version: u32]
//!   [value bytes, concatenated in entry order]          <- data region
//!   [entry index: count + fixed-width entries]          <- index region
//!   [footer: 36 bytes]
//! ```
//!
//! Index entry layout (28 bytes, little-endian):
//! ```text
//!   [col: u64] [key: u64] [offset: u64] [vlen: u32]
//! ```
//! `vlen == u32::MAX` marks a tombstone (no data bytes). Keys are
//! fixed-width, so the whole index loads into memory at open and point
//! lookups binary-search it; scans never touch the data region at all.
//!
//! Footer layout:
//! ```text
//!   [index_offset: u64] [index_len: u32] [index_crc: u32]
//!   [data_crc: u32] [max_seq: u64] [magic "KSST"(4)]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use kite_common::error::StorageError;
use kite_common::types::LEN_MISSING;

use super::memtable::ComposedKey;

const SST_MAGIC: &[u8; 4] = b"KSST";
const SST_FORMAT_VERSION: u32 = 1;
const SST_HEADER_SIZE: u64 = 8;
const FOOTER_SIZE: u64 = 36;
const INDEX_ENTRY_SIZE: usize = 28;

fn corrupt(path: &Path, detail: impl std::fmt::Display) -> StorageError {
    StorageError::Corruption(format!("{}: {}", path.display(), detail))
}

/// One index entry: a key and where its value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub col: u64,
    pub key: u64,
    offset: u64,
    /// `LEN_MISSING` for tombstones.
    vlen: u32,
}

impl IndexEntry {
    /// `None` for tombstones, `Some(len)` for present values.
    pub fn value_len(&self) -> Option<u32> {
        (self.vlen != LEN_MISSING).then_some(self.vlen)
    }
}

/// Streaming writer; entries must be added in ascending composite-key order.
pub struct SstWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    index: Vec<IndexEntry>,
    data_crc: crc32fast::Hasher,
    data_len: u64,
    last_key: Option<ComposedKey>,
}

impl SstWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SST_MAGIC)?;
        writer.write_all(&SST_FORMAT_VERSION.to_le_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            index: Vec::new(),
            data_crc: crc32fast::Hasher::new(),
            data_len: 0,
            last_key: None,
        })
    }

    /// Add one entry. `None` writes a tombstone that masks older tables.
    pub fn add(&mut self, composed: ComposedKey, value: Option<&[u8]>) -> io::Result<()> {
        debug_assert!(
            self.last_key.map_or(true, |last| last < composed),
            "SST entries must be added in ascending order"
        );
        self.last_key = Some(composed);
        let (col, key) = composed;
        let entry = match value {
            Some(bytes) => {
                let offset = self.data_len;
                self.writer.write_all(bytes)?;
                self.data_crc.update(bytes);
                self.data_len += bytes.len() as u64;
                IndexEntry {
                    col,
                    key,
                    offset,
                    vlen: bytes.len() as u32,
                }
            }
            None => IndexEntry {
                col,
                key,
                offset: 0,
                vlen: LEN_MISSING,
            },
        };
        self.index.push(entry);
        Ok(())
    }

    /// Write index and footer; optionally fsync before returning.
    pub fn finish(mut self, max_seq: u64, sync: bool) -> io::Result<()> {
        let index_offset = SST_HEADER_SIZE + self.data_len;
        let mut index_bytes = Vec::with_capacity(4 + self.index.len() * INDEX_ENTRY_SIZE);
        index_bytes.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for entry in &self.index {
            index_bytes.extend_from_slice(&entry.col.to_le_bytes());
            index_bytes.extend_from_slice(&entry.key.to_le_bytes());
            index_bytes.extend_from_slice(&entry.offset.to_le_bytes());
            index_bytes.extend_from_slice(&entry.vlen.to_le_bytes());
        }
        let index_crc = crc32fast::hash(&index_bytes);
        let data_crc = self.data_crc.finalize();

        self.writer.write_all(&index_bytes)?;
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&(index_bytes.len() as u32).to_le_bytes())?;
        self.writer.write_all(&index_crc.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&max_seq.to_le_bytes())?;
        self.writer.write_all(SST_MAGIC)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_all()?;
        }
        tracing::debug!(
            path = %self.path.display(),
            entries = self.index.len(),
            data_bytes = self.data_len,
            max_seq,
            "SST written"
        );
        Ok(())
    }
}

/// Immutable reader. The index lives in memory; the data region is read on
/// demand through a shared file handle.
pub struct SstReader {
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<IndexEntry>,
    max_seq: u64,
}

impl SstReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < SST_HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(path, "file shorter than header + footer"));
        }

        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if &header[0..4] != SST_MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != SST_FORMAT_VERSION {
            return Err(corrupt(path, format!("unsupported format version {version}")));
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;
        if &footer[32..36] != SST_MAGIC {
            return Err(corrupt(path, "bad footer magic"));
        }
        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let index_len = u32::from_le_bytes(footer[8..12].try_into().unwrap()) as usize;
        let index_crc = u32::from_le_bytes(footer[12..16].try_into().unwrap());
        let data_crc = u32::from_le_bytes(footer[16..20].try_into().unwrap());
        let max_seq = u64::from_le_bytes(footer[20..28].try_into().unwrap());

        if index_offset + index_len as u64 + FOOTER_SIZE != file_len {
            return Err(corrupt(path, "footer does not span the file"));
        }

        let mut index_bytes = vec![0u8; index_len];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_bytes)?;
        if crc32fast::hash(&index_bytes) != index_crc {
            return Err(corrupt(path, "index checksum mismatch"));
        }

        let mut data_bytes = vec![0u8; (index_offset - SST_HEADER_SIZE) as usize];
        file.seek(SeekFrom::Start(SST_HEADER_SIZE))?;
        file.read_exact(&mut data_bytes)?;
        if crc32fast::hash(&data_bytes) != data_crc {
            return Err(corrupt(path, "data checksum mismatch"));
        }
        drop(data_bytes);

        let index = Self::parse_index(path, &index_bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            max_seq,
        })
    }

    fn parse_index(path: &Path, bytes: &[u8]) -> Result<Vec<IndexEntry>, StorageError> {
        if bytes.len() < 4 {
            return Err(corrupt(path, "index truncated"));
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() != 4 + count * INDEX_ENTRY_SIZE {
            return Err(corrupt(path, "index length mismatch"));
        }
        let mut index: Vec<IndexEntry> = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * INDEX_ENTRY_SIZE;
            let entry = IndexEntry {
                col: u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()),
                key: u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap()),
                offset: u64::from_le_bytes(bytes[at + 16..at + 24].try_into().unwrap()),
                vlen: u32::from_le_bytes(bytes[at + 24..at + 28].try_into().unwrap()),
            };
            if let Some(prev) = index.last() {
                if (prev.col, prev.key) >= (entry.col, entry.key) {
                    return Err(corrupt(path, "index keys out of order"));
                }
            }
            index.push(entry);
        }
        Ok(index)
    }

    /// Highest commit sequence covered by this table.
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    fn lower_bound(&self, composed: ComposedKey) -> usize {
        self.index
            .partition_point(|entry| (entry.col, entry.key) < composed)
    }

    /// Lookup. Outer `None`: key not in this table. `Some(None)`: tombstone.
    pub fn get(&self, col: u64, key: u64) -> Result<Option<Option<Vec<u8>>>, StorageError> {
        let at = self.lower_bound((col, key));
        let Some(entry) = self.index.get(at) else {
            return Ok(None);
        };
        if (entry.col, entry.key) != (col, key) {
            return Ok(None);
        }
        match entry.value_len() {
            None => Ok(Some(None)),
            Some(0) => Ok(Some(Some(Vec::new()))),
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(SST_HEADER_SIZE + entry.offset))?;
                file.read_exact(&mut buf).map_err(|e| {
                    corrupt(&self.path, format!("short value read at {}: {e}", entry.offset))
                })?;
                Ok(Some(Some(buf)))
            }
        }
    }

    /// Index-only scan of one collection from `from`, ascending.
    pub fn scan(&self, col: u64, from: u64) -> impl Iterator<Item = (u64, Option<u32>)> + '_ {
        self.index[self.lower_bound((col, from))..]
            .iter()
            .take_while(move |entry| entry.col == col)
            .map(|entry| (entry.key, entry.value_len()))
    }

    /// Every entry, for compaction merges.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.index.iter()
    }

    /// Materialize one indexed entry's value (compaction path).
    pub fn read_value(&self, entry: &IndexEntry) -> Result<Option<Vec<u8>>, StorageError> {
        match entry.value_len() {
            None => Ok(None),
            Some(0) => Ok(Some(Vec::new())),
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(SST_HEADER_SIZE + entry.offset))?;
                file.read_exact(&mut buf)?;
                Ok(Some(buf))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
