//! Task decoding: strided inputs → iterable task records.
//!
//! Collection arguments follow the 0/1/N convention: an empty view means
//! the default collection for every task, a single element broadcasts,
//! and otherwise the view must match the task count exactly. The write
//! path extends the convention to value pointers, offsets and lengths: a
//! null value pointer encodes deletion.

use kite_common::error::{KiteError, Result};
use kite_common::types::{CollectionId, Key};

use crate::strided::Strided;

fn resolve_col(cols: &Strided<'_, CollectionId>, i: usize, count: usize) -> Result<CollectionId> {
    match cols.len() {
        0 => Ok(CollectionId::DEFAULT),
        1 => Ok(cols.get(0)),
        n if n == count => Ok(cols.get(i)),
        n => Err(KiteError::InvalidArgument(format!(
            "collections argument must have 0, 1 or {count} elements, got {n}"
        ))),
    }
}

/// Batch point-read (or presence-check) input.
#[derive(Debug, Clone, Copy)]
pub struct ReadTasks<'a> {
    pub cols: Strided<'a, CollectionId>,
    pub keys: Strided<'a, Key>,
}

impl<'a> ReadTasks<'a> {
    pub fn new(cols: Strided<'a, CollectionId>, keys: Strided<'a, Key>) -> Self {
        Self { cols, keys }
    }

    /// Every task addressed at the default collection.
    pub fn keys_only(keys: &'a [Key]) -> Self {
        Self {
            cols: Strided::empty(),
            keys: Strided::from_slice(keys),
        }
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn task(&self, i: usize) -> Result<(CollectionId, Key)> {
        Ok((resolve_col(&self.cols, i, self.count())?, self.keys.get(i)))
    }

    /// Decode the whole batch, validating the argument shape once.
    pub fn decode(&self) -> Result<Vec<(CollectionId, Key)>> {
        (0..self.count()).map(|i| self.task(i)).collect()
    }
}

/// One decoded write task.
#[derive(Debug, Clone, Copy)]
pub struct WriteTask<'a> {
    pub col: CollectionId,
    pub key: Key,
    /// `None` deletes the key.
    pub value: Option<&'a [u8]>,
}

/// Batch write input. Values arrive as per-task pointers plus offset and
/// length columns; a broadcast base pointer with per-task offsets carries
/// contiguous payloads without copying.
#[derive(Debug, Clone, Copy)]
pub struct WriteTasks<'a> {
    pub cols: Strided<'a, CollectionId>,
    pub keys: Strided<'a, Key>,
    pub vals: Strided<'a, *const u8>,
    pub offs: Strided<'a, u32>,
    pub lens: Strided<'a, u32>,
}

impl<'a> WriteTasks<'a> {
    /// Delete every keyed entry (the all-null values form).
    pub fn deletes(cols: Strided<'a, CollectionId>, keys: Strided<'a, Key>) -> Self {
        Self {
            cols,
            keys,
            vals: Strided::empty(),
            offs: Strided::empty(),
            lens: Strided::empty(),
        }
    }

    /// One pointer and length per task.
    pub fn from_pointers(
        cols: Strided<'a, CollectionId>,
        keys: Strided<'a, Key>,
        vals: &'a [*const u8],
        lens: &'a [u32],
    ) -> Self {
        Self {
            cols,
            keys,
            vals: Strided::from_slice(vals),
            offs: Strided::empty(),
            lens: Strided::from_slice(lens),
        }
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn task(&self, i: usize) -> Result<WriteTask<'a>> {
        let count = self.count();
        let col = resolve_col(&self.cols, i, count)?;
        let key = self.keys.get(i);

        let ptr = match self.vals.len() {
            0 => std::ptr::null(),
            1 => self.vals.get(0),
            n if n == count => self.vals.get(i),
            n => {
                return Err(KiteError::InvalidArgument(format!(
                    "values argument must have 0, 1 or {count} elements, got {n}"
                )))
            }
        };
        if ptr.is_null() {
            return Ok(WriteTask {
                col,
                key,
                value: None,
            });
        }

        let off = match self.offs.len() {
            0 => 0,
            1 => self.offs.get(0),
            n if n == count => self.offs.get(i),
            n => {
                return Err(KiteError::InvalidArgument(format!(
                    "offsets argument must have 0, 1 or {count} elements, got {n}"
                )))
            }
        };
        let len = match self.lens.len() {
            1 => self.lens.get(0),
            n if n == count => self.lens.get(i),
            n => {
                return Err(KiteError::InvalidArgument(format!(
                    "lengths argument must have 1 or {count} elements, got {n}"
                )))
            }
        };

        // Safety: the caller contract of the batch write requires ptr+off
        // to address len readable bytes for the call's duration.
        let value = unsafe { std::slice::from_raw_parts(ptr.add(off as usize), len as usize) };
        Ok(WriteTask {
            col,
            key,
            value: Some(value),
        })
    }

    pub fn decode(&self) -> Result<Vec<WriteTask<'a>>> {
        (0..self.count()).map(|i| self.task(i)).collect()
    }
}

/// Batch range-scan input: per task a collection, a minimum key and a
/// maximum hit count.
#[derive(Debug, Clone, Copy)]
pub struct ScanTasks<'a> {
    pub cols: Strided<'a, CollectionId>,
    pub min_keys: Strided<'a, Key>,
    pub counts: Strided<'a, u32>,
}

impl<'a> ScanTasks<'a> {
    pub fn new(
        cols: Strided<'a, CollectionId>,
        min_keys: Strided<'a, Key>,
        counts: Strided<'a, u32>,
    ) -> Self {
        Self {
            cols,
            min_keys,
            counts,
        }
    }

    pub fn count(&self) -> usize {
        self.min_keys.len()
    }

    pub fn task(&self, i: usize) -> Result<(CollectionId, Key, u32)> {
        let count = self.count();
        let col = resolve_col(&self.cols, i, count)?;
        let min_key = self.min_keys.get(i);
        let limit = match self.counts.len() {
            1 => self.counts.get(0),
            n if n == count => self.counts.get(i),
            n => {
                return Err(KiteError::InvalidArgument(format!(
                    "counts argument must have 1 or {count} elements, got {n}"
                )))
            }
        };
        Ok((col, min_key, limit))
    }

    pub fn decode(&self) -> Result<Vec<(CollectionId, Key, u32)>> {
        (0..self.count()).map(|i| self.task(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_tasks_default_collection() {
        let keys = [Key(1), Key(2)];
        let tasks = ReadTasks::keys_only(&keys);
        assert_eq!(
            tasks.decode().unwrap(),
            vec![
                (CollectionId::DEFAULT, Key(1)),
                (CollectionId::DEFAULT, Key(2))
            ]
        );
    }

    #[test]
    fn test_read_tasks_broadcast_collection() {
        let col = CollectionId(3);
        let keys = [Key(1), Key(2), Key(3)];
        let tasks = ReadTasks::new(Strided::broadcast(&col, keys.len()), Strided::from_slice(&keys));
        for i in 0..3 {
            assert_eq!(tasks.task(i).unwrap().0, CollectionId(3));
        }
    }

    #[test]
    fn test_read_tasks_shape_mismatch() {
        let cols = [CollectionId(1), CollectionId(2)];
        let keys = [Key(1), Key(2), Key(3)];
        let tasks = ReadTasks::new(Strided::from_slice(&cols), Strided::from_slice(&keys));
        assert!(tasks.decode().is_err());
    }

    #[test]
    fn test_write_tasks_dense_values() {
        let keys = [Key(1), Key(2)];
        let ptrs: [*const u8; 2] = [b"alpha".as_ptr(), b"xy".as_ptr()];
        let lens = [5u32, 2];
        let tasks = WriteTasks::from_pointers(
            Strided::empty(),
            Strided::from_slice(&keys),
            &ptrs,
            &lens,
        );
        let decoded = tasks.decode().unwrap();
        assert_eq!(decoded[0].value, Some(&b"alpha"[..]));
        assert_eq!(decoded[1].value, Some(&b"xy"[..]));
    }

    #[test]
    fn test_write_tasks_null_values_delete() {
        let keys = [Key(1), Key(2)];
        let tasks = WriteTasks::deletes(Strided::empty(), Strided::from_slice(&keys));
        let decoded = tasks.decode().unwrap();
        assert!(decoded.iter().all(|task| task.value.is_none()));
    }

    #[test]
    fn test_write_tasks_broadcast_base_with_offsets() {
        // Contiguous payload addressed by one base pointer + offsets, the
        // columnar form batch writers use for fixed-width values.
        let payload: &[u8] = b"aabbcc";
        let base = payload.as_ptr();
        let keys = [Key(1), Key(2), Key(3)];
        let offs = [0u32, 2, 4];
        let len = [2u32];
        let tasks = WriteTasks {
            cols: Strided::empty(),
            keys: Strided::from_slice(&keys),
            vals: Strided::broadcast(&base, keys.len()),
            offs: Strided::from_slice(&offs),
            lens: Strided::from_slice(&len),
        };
        let decoded = tasks.decode().unwrap();
        assert_eq!(decoded[0].value, Some(&b"aa"[..]));
        assert_eq!(decoded[1].value, Some(&b"bb"[..]));
        assert_eq!(decoded[2].value, Some(&b"cc"[..]));
    }

    #[test]
    fn test_scan_tasks_broadcast_count() {
        let keys = [Key(0), Key(100)];
        let count = [5u32];
        let tasks = ScanTasks::new(
            Strided::empty(),
            Strided::from_slice(&keys),
            Strided::from_slice(&count),
        );
        assert_eq!(
            tasks.decode().unwrap(),
            vec![
                (CollectionId::DEFAULT, Key(0), 5),
                (CollectionId::DEFAULT, Key(100), 5)
            ]
        );
    }
}
