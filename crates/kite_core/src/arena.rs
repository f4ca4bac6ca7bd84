//! Request-scoped result memory.
//!
//! An arena is owned by the caller, grows on demand, and is reused across
//! requests so a steady-state workload returns variable-length results
//! without per-call allocation. Each request resets the arena and lays its
//! results out as a tape of typed regions; the returned tape views borrow
//! the arena, so the results live exactly as long as the caller keeps it.
//!
//! Read tape: `lens[N]` then concatenated value bytes, with value offsets
//! implicit as the prefix sum over present lengths and `LEN_MISSING`
//! marking absent keys. Scan tape: per-task spans, then keys and lengths,
//! with unused slots padded with `Key::UNKNOWN` / `LEN_MISSING`.

use kite_common::types::{Key, LEN_MISSING};

/// Caller-owned scratch holding one request's results.
#[derive(Debug, Default)]
pub struct Arena {
    lens: Vec<u32>,
    keys: Vec<Key>,
    bytes: Vec<u8>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.lens.clear();
        self.keys.clear();
        self.bytes.clear();
    }

    /// Marshal batch read results: the length array first, then the
    /// concatenated bytes of present values in task order.
    pub(crate) fn write_read_tape(&mut self, values: &[Option<Vec<u8>>]) -> ReadTape<'_> {
        self.reset();
        self.lens.reserve(values.len());
        for value in values {
            self.lens.push(match value {
                Some(bytes) => bytes.len() as u32,
                None => LEN_MISSING,
            });
        }
        for value in values.iter().flatten() {
            self.bytes.extend_from_slice(value);
        }
        ReadTape {
            lens: &self.lens,
            bytes: &self.bytes,
        }
    }

    /// Marshal presence flags.
    pub(crate) fn write_contains_tape(&mut self, present: &[bool]) -> ContainsTape<'_> {
        self.reset();
        self.bytes.extend(present.iter().map(|&p| p as u8));
        ContainsTape { flags: &self.bytes }
    }

    /// Marshal batch scan results. `tasks` holds, per task, the requested
    /// slot count and the hits; every task occupies exactly its requested
    /// span, padded with `Key::UNKNOWN` / `LEN_MISSING`.
    pub(crate) fn write_scan_tape(&mut self, tasks: &[(u32, Vec<(Key, u32)>)]) -> ScanTape<'_> {
        self.reset();
        for &(span, _) in tasks {
            self.lens.push(span);
        }
        for (span, hits) in tasks {
            debug_assert!(hits.len() <= *span as usize);
            for &(key, len) in hits {
                self.keys.push(key);
                self.lens.push(len);
            }
            for _ in hits.len()..*span as usize {
                self.keys.push(Key::UNKNOWN);
                self.lens.push(LEN_MISSING);
            }
        }
        let task_count = tasks.len();
        ScanTape {
            spans: &self.lens[..task_count],
            lens: &self.lens[task_count..],
            keys: &self.keys,
        }
    }
}

/// Borrowed view over a batch read result.
#[derive(Debug, Clone, Copy)]
pub struct ReadTape<'a> {
    lens: &'a [u32],
    bytes: &'a [u8],
}

impl<'a> ReadTape<'a> {
    pub fn len(&self) -> usize {
        self.lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    /// The raw length array; `LEN_MISSING` marks absence, `0` a present
    /// empty value.
    pub fn lens(&self) -> &'a [u32] {
        self.lens
    }

    /// The concatenated value bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Value of task `i`: `None` for absent keys.
    pub fn value(&self, i: usize) -> Option<&'a [u8]> {
        if self.lens[i] == LEN_MISSING {
            return None;
        }
        let offset: usize = self.lens[..i]
            .iter()
            .filter(|&&len| len != LEN_MISSING)
            .map(|&len| len as usize)
            .sum();
        Some(&self.bytes[offset..offset + self.lens[i] as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a [u8]>> + '_ {
        (0..self.len()).map(|i| self.value(i))
    }
}

/// Borrowed view over a batch presence check.
#[derive(Debug, Clone, Copy)]
pub struct ContainsTape<'a> {
    flags: &'a [u8],
}

impl<'a> ContainsTape<'a> {
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// One byte per task; 0 marks absence.
    pub fn flags(&self) -> &'a [u8] {
        self.flags
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn contains(&self, i: usize) -> bool {
        self.flags[i] != 0
    }
}

/// Borrowed view over a batch scan result.
#[derive(Debug, Clone, Copy)]
pub struct ScanTape<'a> {
    /// Requested slot count per task.
    spans: &'a [u32],
    keys: &'a [Key],
    lens: &'a [u32],
}

impl<'a> ScanTape<'a> {
    pub fn task_count(&self) -> usize {
        self.spans.len()
    }

    /// All key slots, padding included.
    pub fn keys(&self) -> &'a [Key] {
        self.keys
    }

    /// All length slots, padding included.
    pub fn lens(&self) -> &'a [u32] {
        self.lens
    }

    /// Found `(keys, lens)` of task `i`, with padding trimmed.
    pub fn task(&self, i: usize) -> (&'a [Key], &'a [u32]) {
        let start: usize = self.spans[..i].iter().map(|&s| s as usize).sum();
        let span = self.spans[i] as usize;
        let keys = &self.keys[start..start + span];
        let found = keys
            .iter()
            .position(|&key| key == Key::UNKNOWN)
            .unwrap_or(span);
        (&keys[..found], &self.lens[start..start + found])
    }
}
