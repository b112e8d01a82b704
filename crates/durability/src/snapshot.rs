//! Snapshot builder and cursor (component H, §4.8).
//!
//! The snapshot builder writes `data/snapshot`, a WAL-shaped file
//! wrapping the surviving entries from a scan in a single epoch-0
//! session. The cursor types here give higher layers (the datastore
//! facade, the partitioned-cursor distributor) a uniform way to walk
//! `(snapshot, compacted?)` without re-parsing either file themselves.

use std::cmp::Ordering as CmpOrdering;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use epochwal_core::{BlobId, Entry, EpochId, PathIoError, StorageId};

use crate::codec;

/// Failures building or walking a snapshot (§7).
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// An I/O failure touched the snapshot or compacted file.
    #[error(transparent)]
    Io(#[from] PathIoError),

    /// A record failed to decode as anything but truncation.
    #[error("snapshot-shaped file {path} is malformed: {reason}")]
    Malformed {
        /// The file the corruption was found in.
        path: PathBuf,
        /// Human-readable detail.
        reason: String,
    },
}

/// Write `data/snapshot`: a single session at epoch 0 wrapping `entries`
/// (§4.8). `Remove` survivors are written only when `compacted_file_exists`
/// is true, so a later compaction can still see and override them;
/// otherwise they are absorbed by omission.
pub fn write_snapshot(
    path: &Path,
    entries: &[Entry],
    compacted_file_exists: bool,
) -> Result<(), PathIoError> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = tmp_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PathIoError::new(parent, e))?;
    }
    {
        let mut file = File::create(&tmp_path).map_err(|e| PathIoError::new(&tmp_path, e))?;
        codec::write_begin(&mut file, EpochId::ZERO).map_err(|e| PathIoError::new(&tmp_path, e))?;
        for entry in entries {
            match entry {
                Entry::Normal {
                    storage_id,
                    key,
                    value,
                    write_version,
                } => codec::write_normal(&mut file, *storage_id, key, value, *write_version)
                    .map_err(|e| PathIoError::new(&tmp_path, e))?,
                Entry::NormalWithBlob {
                    storage_id,
                    key,
                    value,
                    write_version,
                    blob_ids,
                } => codec::write_normal_with_blob(
                    &mut file,
                    *storage_id,
                    key,
                    value,
                    *write_version,
                    blob_ids,
                )
                .map_err(|e| PathIoError::new(&tmp_path, e))?,
                Entry::Remove {
                    storage_id,
                    key,
                    write_version,
                } => {
                    if compacted_file_exists {
                        codec::write_remove(&mut file, *storage_id, key, *write_version)
                            .map_err(|e| PathIoError::new(&tmp_path, e))?;
                    }
                }
                _ => unreachable!("scan only yields sortable mutation entries"),
            }
        }
        codec::write_end(&mut file, EpochId::ZERO).map_err(|e| PathIoError::new(&tmp_path, e))?;
        use std::io::Write as _;
        file.flush().map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&tmp_path, e))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| PathIoError::new(path, e))?;
    Ok(())
}

/// Which of the three cursor-visible kinds the current position holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// `normal_entry`.
    Normal,
    /// `normal_with_blob`.
    NormalWithBlob,
    /// `remove_entry`.
    Remove,
}

/// The record a cursor is positioned on (§4.8 method set).
#[derive(Debug, Clone)]
pub struct CursorEntry {
    /// The key's storage space.
    pub storage_id: StorageId,
    /// The key bytes.
    pub key: Vec<u8>,
    /// The value bytes (empty for `Remove`).
    pub value: Vec<u8>,
    /// Which kind of record this is.
    pub entry_type: EntryType,
    /// BLOB ids referenced, if `entry_type == NormalWithBlob`.
    pub blob_ids: Vec<BlobId>,
}

fn key_sid(storage_id: StorageId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&storage_id.get().to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn to_cursor_entry(entry: Entry) -> Option<CursorEntry> {
    match entry {
        Entry::Normal {
            storage_id,
            key,
            value,
            ..
        } => Some(CursorEntry {
            storage_id,
            key,
            value,
            entry_type: EntryType::Normal,
            blob_ids: Vec::new(),
        }),
        Entry::NormalWithBlob {
            storage_id,
            key,
            value,
            blob_ids,
            ..
        } => Some(CursorEntry {
            storage_id,
            key,
            value,
            entry_type: EntryType::NormalWithBlob,
            blob_ids,
        }),
        Entry::Remove {
            storage_id, key, ..
        } => Some(CursorEntry {
            storage_id,
            key,
            value: Vec::new(),
            entry_type: EntryType::Remove,
            blob_ids: Vec::new(),
        }),
        _ => None,
    }
}

/// A cursor over a single WAL-shaped file (snapshot or compacted),
/// skipping markers and surfacing only the three key-carrying kinds.
pub struct FileCursor {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    current: Option<CursorEntry>,
}

impl FileCursor {
    /// Open `path`. A missing file yields an already-exhausted cursor,
    /// since the snapshot/compacted file is optional (§4.8).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(FileCursor {
                path,
                reader: None,
                current: None,
            });
        }
        let file = File::open(&path).map_err(|e| PathIoError::new(&path, e))?;
        Ok(FileCursor {
            path,
            reader: Some(BufReader::new(file)),
            current: None,
        })
    }

    /// Advance to the next key-carrying record, returning whether one
    /// was found.
    pub fn next(&mut self) -> Result<bool, SnapshotError> {
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => {
                self.current = None;
                return Ok(false);
            }
        };
        loop {
            match codec::read(reader) {
                Ok(Some(entry)) => {
                    if let Some(cursor_entry) = to_cursor_entry(entry) {
                        self.current = Some(cursor_entry);
                        return Ok(true);
                    }
                    // A marker record; keep scanning.
                }
                Ok(None) => {
                    self.current = None;
                    return Ok(false);
                }
                Err(e) => {
                    return Err(SnapshotError::Malformed {
                        path: self.path.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// `storage()`.
    pub fn storage(&self) -> Option<StorageId> {
        self.current.as_ref().map(|e| e.storage_id)
    }

    /// `key(buf)`.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.key.as_slice())
    }

    /// `value(buf)`.
    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.value.as_slice())
    }

    /// `type()`.
    pub fn entry_type(&self) -> Option<EntryType> {
        self.current.as_ref().map(|e| e.entry_type)
    }

    /// `blob_ids()`.
    pub fn blob_ids(&self) -> &[BlobId] {
        self.current
            .as_ref()
            .map(|e| e.blob_ids.as_slice())
            .unwrap_or(&[])
    }

    /// `close()`.
    pub fn close(&mut self) {
        self.reader = None;
        self.current = None;
    }

    fn current_key_sid(&self) -> Option<Vec<u8>> {
        self.current.as_ref().map(|e| key_sid(e.storage_id, &e.key))
    }
}

/// Which side a merging cursor last served a record from.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Snapshot,
    Compacted,
}

/// The ordinary `get_cursor()`: a merging iterator over `(snapshot,
/// compacted?)` that dedups by `key_sid`, with the snapshot winning
/// ties (§4.8).
pub struct MergingCursor {
    snapshot: FileCursor,
    compacted: Option<FileCursor>,
    snapshot_has: bool,
    compacted_has: bool,
    last_served: Option<Side>,
}

impl MergingCursor {
    /// Open a merging cursor over `snapshot_path` and, if present,
    /// `compacted_path`.
    pub fn open(
        snapshot_path: impl AsRef<Path>,
        compacted_path: impl AsRef<Path>,
    ) -> Result<Self, SnapshotError> {
        let mut snapshot = FileCursor::open(snapshot_path)?;
        let snapshot_has = snapshot.next()?;

        let compacted_path = compacted_path.as_ref();
        let mut compacted = if compacted_path.exists() {
            Some(FileCursor::open(compacted_path)?)
        } else {
            None
        };
        let compacted_has = match compacted.as_mut() {
            Some(c) => c.next()?,
            None => false,
        };

        Ok(MergingCursor {
            snapshot,
            compacted,
            snapshot_has,
            compacted_has,
            last_served: None,
        })
    }

    /// Advance the merge, returning whether a record is now current.
    pub fn next(&mut self) -> Result<bool, SnapshotError> {
        if !self.snapshot_has && !self.compacted_has {
            self.last_served = None;
            return Ok(false);
        }

        let take_snapshot = if self.snapshot_has && self.compacted_has {
            let snapshot_key = self.snapshot.current_key_sid();
            let compacted_key = self.compacted.as_ref().unwrap().current_key_sid();
            match snapshot_key.cmp(&compacted_key) {
                CmpOrdering::Less => true,
                CmpOrdering::Greater => false,
                CmpOrdering::Equal => {
                    // Snapshot wins the tie; the compacted side is still
                    // consumed so the duplicate key isn't seen twice.
                    self.compacted_has = self.compacted.as_mut().unwrap().next()?;
                    true
                }
            }
        } else {
            self.snapshot_has
        };

        if take_snapshot {
            self.last_served = Some(Side::Snapshot);
            self.snapshot_has = self.snapshot.next()?;
        } else {
            self.last_served = Some(Side::Compacted);
            self.compacted_has = self.compacted.as_mut().unwrap().next()?;
        }
        Ok(true)
    }

    fn current_cursor(&self) -> Option<&FileCursor> {
        match self.last_served? {
            Side::Snapshot => Some(&self.snapshot),
            Side::Compacted => self.compacted.as_ref(),
        }
    }

    /// `storage()` on the currently active side.
    pub fn storage(&self) -> Option<StorageId> {
        self.current_cursor().and_then(FileCursor::storage)
    }

    /// `key(buf)` on the currently active side.
    pub fn key(&self) -> Option<&[u8]> {
        self.current_cursor().and_then(FileCursor::key)
    }

    /// `value(buf)` on the currently active side.
    pub fn value(&self) -> Option<&[u8]> {
        self.current_cursor().and_then(FileCursor::value)
    }

    /// `type()` on the currently active side.
    pub fn entry_type(&self) -> Option<EntryType> {
        self.current_cursor().and_then(FileCursor::entry_type)
    }

    /// `blob_ids()` on the currently active side.
    pub fn blob_ids(&self) -> &[BlobId] {
        self.current_cursor().map(FileCursor::blob_ids).unwrap_or(&[])
    }

    /// `close()`.
    pub fn close(&mut self) {
        self.snapshot.close();
        if let Some(c) = self.compacted.as_mut() {
            c.close();
        }
        self.last_served = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochwal_core::WriteVersion;
    use tempfile::tempdir;

    #[test]
    fn snapshot_roundtrips_through_a_file_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let entries = vec![
            Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"a".to_vec(),
                value: b"va".to_vec(),
                write_version: WriteVersion::new(1, 0),
            },
            Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"b".to_vec(),
                value: b"vb".to_vec(),
                write_version: WriteVersion::new(1, 1),
            },
        ];
        write_snapshot(&path, &entries, false).unwrap();

        let mut cursor = FileCursor::open(&path).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push((cursor.key().unwrap().to_vec(), cursor.value().unwrap().to_vec()));
        }
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), b"va".to_vec()), (b"b".to_vec(), b"vb".to_vec())]
        );
    }

    #[test]
    fn remove_entry_omitted_without_a_compacted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let entries = vec![Entry::Remove {
            storage_id: StorageId::new(1),
            key: b"a".to_vec(),
            write_version: WriteVersion::new(1, 0),
        }];
        write_snapshot(&path, &entries, false).unwrap();
        let mut cursor = FileCursor::open(&path).unwrap();
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn remove_entry_kept_when_compacted_file_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let entries = vec![Entry::Remove {
            storage_id: StorageId::new(1),
            key: b"a".to_vec(),
            write_version: WriteVersion::new(1, 0),
        }];
        write_snapshot(&path, &entries, true).unwrap();
        let mut cursor = FileCursor::open(&path).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.entry_type(), Some(EntryType::Remove));
    }

    #[test]
    fn missing_snapshot_file_is_an_exhausted_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let mut cursor = FileCursor::open(&path).unwrap();
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn merging_cursor_snapshot_wins_ties_and_consumes_both_sides() {
        let dir = tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot");
        let compacted_path = dir.path().join("compacted");

        write_snapshot(
            &snapshot_path,
            &[Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"a".to_vec(),
                value: b"new".to_vec(),
                write_version: WriteVersion::new(2, 0),
            }],
            true,
        )
        .unwrap();
        write_snapshot(
            &compacted_path,
            &[
                Entry::Normal {
                    storage_id: StorageId::new(1),
                    key: b"a".to_vec(),
                    value: b"old".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                Entry::Normal {
                    storage_id: StorageId::new(1),
                    key: b"z".to_vec(),
                    value: b"zval".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
            ],
            false,
        )
        .unwrap();

        let mut cursor = MergingCursor::open(&snapshot_path, &compacted_path).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push((
                cursor.key().unwrap().to_vec(),
                cursor.value().unwrap().to_vec(),
            ));
        }
        assert_eq!(
            seen,
            vec![(b"a".to_vec(), b"new".to_vec()), (b"z".to_vec(), b"zval".to_vec())]
        );
    }

    #[test]
    fn merging_cursor_without_compacted_file_just_serves_snapshot() {
        let dir = tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot");
        let compacted_path = dir.path().join("compacted");
        write_snapshot(
            &snapshot_path,
            &[Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"a".to_vec(),
                value: b"v".to_vec(),
                write_version: WriteVersion::new(1, 0),
            }],
            false,
        )
        .unwrap();

        let mut cursor = MergingCursor::open(&snapshot_path, &compacted_path).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.key().unwrap(), b"a");
        assert!(!cursor.next().unwrap());
    }
}
