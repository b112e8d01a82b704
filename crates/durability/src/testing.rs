//! Crash-injection and reference-model helpers for exercising recovery.
//!
//! Mirrors the teacher crate's `durability::testing` module: a small
//! crash harness that tears or corrupts on-disk WAL state the way a
//! real process crash would, and a reference model that tracks the
//! expected last-writer-wins view independently of [`crate::scan`], so
//! integration tests can check recovered output against it rather than
//! re-deriving expectations from the same merge code under test.
//!
//! Gated behind `#[cfg(test)]` for this crate's own unit tests and
//! behind the `testing` feature for integration tests and downstream
//! crash harnesses.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use epochwal_core::{StorageId, WriteVersion};

/// A point in the write path at which a simulated crash can be injected
/// by a test driving the harness directly (truncating or corrupting the
/// file the channel under test is writing to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After `marker_begin` is written, before any entries.
    AfterSessionBegin,
    /// After the last entry of a session, before `marker_end`.
    AfterLastEntry,
    /// After `marker_end` is written but before its fsync.
    BeforeEndFsync,
    /// After the compaction catalog backup is written, before the main
    /// catalog is replaced.
    DuringCatalogSwap,
}

/// Truncate `path` to simulate a process crash mid-write: drops the
/// last `drop_bytes` bytes, leaving a torn tail that the codec's
/// decoder must treat as end-of-file, never as corruption.
pub fn truncate_tail(path: impl AsRef<Path>, drop_bytes: u64) -> std::io::Result<()> {
    let path = path.as_ref();
    let len = fs::metadata(path)?.len();
    let file = File::options().write(true).open(path)?;
    file.set_len(len.saturating_sub(drop_bytes))
}

/// Flip one byte inside `path` at `offset`, simulating bitrot or a torn
/// write landing mid-record; the codec's CRC32 must catch this as a
/// `ChecksumMismatch`, not silently accept the record.
pub fn corrupt_byte(path: impl AsRef<Path>, offset: u64) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut bytes = fs::read(path)?;
    if let Some(b) = bytes.get_mut(offset as usize) {
        *b ^= 0xFF;
    }
    let mut file = File::create(path)?;
    file.write_all(&bytes)
}

/// An in-memory reference model of last-writer-wins state, built
/// independently of `scan::merge_put_only`, so crash-recovery tests can
/// assert the recovered snapshot against it instead of against the same
/// merge logic they're trying to validate.
#[derive(Debug, Default)]
pub struct ReferenceModel {
    rows: BTreeMap<(StorageId, Vec<u8>), (WriteVersion, Vec<u8>)>,
}

impl ReferenceModel {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `put`, keeping the existing row unless `version` is
    /// strictly greater than the one already recorded for this key.
    pub fn put(&mut self, storage_id: StorageId, key: &[u8], value: &[u8], version: WriteVersion) {
        let entry = (storage_id, key.to_vec());
        match self.rows.get(&entry) {
            Some((existing, _)) if *existing >= version => {}
            _ => {
                self.rows.insert(entry, (version, value.to_vec()));
            }
        }
    }

    /// Apply a `remove` at `version`: drops the key only if `version`
    /// is at least as great as whatever is currently recorded for it
    /// (an out-of-order remove for an already-overwritten key is a
    /// no-op, matching `scan`'s write_version-ordered merge).
    pub fn remove(&mut self, storage_id: StorageId, key: &[u8], version: WriteVersion) {
        let entry = (storage_id, key.to_vec());
        if matches!(self.rows.get(&entry), Some((existing, _)) if *existing <= version) {
            self.rows.remove(&entry);
        }
    }

    /// Apply a `clear_storage`: every key in `storage_id` with a version
    /// at or below `threshold` is dropped.
    pub fn clear_storage(&mut self, storage_id: StorageId, threshold: WriteVersion) {
        self.rows
            .retain(|(sid, _), (version, _)| *sid != storage_id || *version > threshold);
    }

    /// The value currently recorded for `(storage_id, key)`, if any.
    pub fn get(&self, storage_id: StorageId, key: &[u8]) -> Option<&[u8]> {
        self.rows
            .get(&(storage_id, key.to_vec()))
            .map(|(_, value)| value.as_slice())
    }

    /// Number of live rows across all storages.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the model has no live rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
