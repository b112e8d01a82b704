//! The log alphabet (§3.2): the ten record kinds every WAL file is built
//! from, plus the logical (decoded) representation of a record.
//!
//! This module defines the *data model* only — encoding/decoding to bytes
//! is owned by `epochwal_durability::codec` (component A). Keeping the two
//! separate means the sort/merge stage (component G) and the snapshot
//! cursor (component H) can operate on [`Entry`] values without depending
//! on the wire format.

use crate::ids::{BlobId, StorageId, WriteVersion};

/// One-byte tag identifying a record kind on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// Opens a session for an epoch on a channel.
    MarkerBegin = 1,
    /// Closes a session; preceding records are durable iff the file is fsynced.
    MarkerEnd = 2,
    /// Advisory: epoch <= X is persistently durable (file-level).
    MarkerDurable = 3,
    /// A begin whose end never appeared; recovery must discard the tail.
    MarkerInvalidatedBegin = 4,
    /// Point upsert.
    Normal = 5,
    /// Upsert referencing BLOBs.
    NormalWithBlob = 6,
    /// Point delete (tombstone).
    Remove = 7,
    /// Range delete: drop all keys of storage_id with write_version < this.
    ClearStorage = 8,
    /// Declare storage existence (advisory; may be ignored on recovery).
    AddStorage = 9,
    /// Equivalent to clear_storage for this core.
    RemoveStorage = 10,
}

impl EntryKind {
    /// Decode a raw tag byte, if it names a known record kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => EntryKind::MarkerBegin,
            2 => EntryKind::MarkerEnd,
            3 => EntryKind::MarkerDurable,
            4 => EntryKind::MarkerInvalidatedBegin,
            5 => EntryKind::Normal,
            6 => EntryKind::NormalWithBlob,
            7 => EntryKind::Remove,
            8 => EntryKind::ClearStorage,
            9 => EntryKind::AddStorage,
            10 => EntryKind::RemoveStorage,
            _ => return None,
        })
    }

    /// The on-disk tag byte for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether this kind carries a `storage_id` + `key` + `value` payload
    /// that participates in the key-ordered sort (component G).
    pub fn is_sortable_mutation(self) -> bool {
        matches!(
            self,
            EntryKind::Normal | EntryKind::NormalWithBlob | EntryKind::Remove
        )
    }

    /// Whether this kind is a range-delete that updates `clear_storage_map`.
    pub fn is_range_delete(self) -> bool {
        matches!(self, EntryKind::ClearStorage | EntryKind::RemoveStorage)
    }
}

/// A fully decoded WAL record (§3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// `marker_begin(epoch)`
    Begin { epoch: crate::ids::EpochId },
    /// `marker_end(epoch)`
    End { epoch: crate::ids::EpochId },
    /// `marker_durable(epoch)`
    Durable { epoch: crate::ids::EpochId },
    /// `marker_invalidated_begin(epoch)`
    InvalidatedBegin { epoch: crate::ids::EpochId },
    /// `normal_entry(storage_id, key, value, write_version)`
    Normal {
        storage_id: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
    },
    /// `normal_with_blob(storage_id, key, value, write_version, blob_ids[])`
    NormalWithBlob {
        storage_id: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
        blob_ids: Vec<BlobId>,
    },
    /// `remove_entry(storage_id, key, write_version)`
    Remove {
        storage_id: StorageId,
        key: Vec<u8>,
        write_version: WriteVersion,
    },
    /// `clear_storage(storage_id, write_version)`
    ClearStorage {
        storage_id: StorageId,
        write_version: WriteVersion,
    },
    /// `add_storage(storage_id, write_version)`
    AddStorage {
        storage_id: StorageId,
        write_version: WriteVersion,
    },
    /// `remove_storage(storage_id, write_version)`
    RemoveStorage {
        storage_id: StorageId,
        write_version: WriteVersion,
    },
}

impl Entry {
    /// The one-byte tag this entry would be written with.
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Begin { .. } => EntryKind::MarkerBegin,
            Entry::End { .. } => EntryKind::MarkerEnd,
            Entry::Durable { .. } => EntryKind::MarkerDurable,
            Entry::InvalidatedBegin { .. } => EntryKind::MarkerInvalidatedBegin,
            Entry::Normal { .. } => EntryKind::Normal,
            Entry::NormalWithBlob { .. } => EntryKind::NormalWithBlob,
            Entry::Remove { .. } => EntryKind::Remove,
            Entry::ClearStorage { .. } => EntryKind::ClearStorage,
            Entry::AddStorage { .. } => EntryKind::AddStorage,
            Entry::RemoveStorage { .. } => EntryKind::RemoveStorage,
        }
    }

    /// `key_sid(entry)`: the concatenation `storage_id (big-endian) ++ key`,
    /// used by the sort stage to group entries of the same `(storage, key)`
    /// (§4.1). Returns `None` for records that carry no key (markers).
    pub fn key_sid(&self) -> Option<Vec<u8>> {
        let (storage_id, key) = match self {
            Entry::Normal {
                storage_id, key, ..
            }
            | Entry::NormalWithBlob {
                storage_id, key, ..
            }
            | Entry::Remove {
                storage_id, key, ..
            } => (*storage_id, key.as_slice()),
            _ => return None,
        };
        let mut out = Vec::with_capacity(8 + key.len());
        out.extend_from_slice(&storage_id.get().to_be_bytes());
        out.extend_from_slice(key);
        Some(out)
    }

    /// `value_etc(entry)`: `write_version.major (be) ++ write_version.minor
    /// (be) ++ value`. Storing the version first lets the PUT-ONLY merge
    /// back-end sort descending by version within a key group (§4.1).
    pub fn value_etc(&self) -> Option<Vec<u8>> {
        let (write_version, value) = match self {
            Entry::Normal {
                write_version,
                value,
                ..
            }
            | Entry::NormalWithBlob {
                write_version,
                value,
                ..
            } => (*write_version, value.as_slice()),
            Entry::Remove { write_version, .. } => (*write_version, &b""[..]),
            _ => return None,
        };
        let mut out = Vec::with_capacity(16 + value.len());
        out.extend_from_slice(&write_version.major.get().to_be_bytes());
        out.extend_from_slice(&write_version.minor.to_be_bytes());
        out.extend_from_slice(value);
        Some(out)
    }

    /// The `storage_id` carried by this entry, for every variant that has one.
    pub fn storage_id(&self) -> Option<StorageId> {
        match self {
            Entry::Normal { storage_id, .. }
            | Entry::NormalWithBlob { storage_id, .. }
            | Entry::Remove { storage_id, .. }
            | Entry::ClearStorage { storage_id, .. }
            | Entry::AddStorage { storage_id, .. }
            | Entry::RemoveStorage { storage_id, .. } => Some(*storage_id),
            _ => None,
        }
    }

    /// The `write_version` carried by this entry, for every variant that has one.
    pub fn write_version(&self) -> Option<WriteVersion> {
        match self {
            Entry::Normal { write_version, .. }
            | Entry::NormalWithBlob { write_version, .. }
            | Entry::Remove { write_version, .. }
            | Entry::ClearStorage { write_version, .. }
            | Entry::AddStorage { write_version, .. }
            | Entry::RemoveStorage { write_version, .. } => Some(*write_version),
            _ => None,
        }
    }

    /// The epoch carried by a marker entry.
    pub fn marker_epoch(&self) -> Option<crate::ids::EpochId> {
        match self {
            Entry::Begin { epoch }
            | Entry::End { epoch }
            | Entry::Durable { epoch }
            | Entry::InvalidatedBegin { epoch } => Some(*epoch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EpochId;

    #[test]
    fn entry_kind_tag_roundtrip() {
        for tag in 1..=10u8 {
            let kind = EntryKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert!(EntryKind::from_tag(0).is_none());
        assert!(EntryKind::from_tag(11).is_none());
    }

    #[test]
    fn key_sid_groups_by_storage_then_key() {
        let a = Entry::Normal {
            storage_id: StorageId::new(1),
            key: b"a".to_vec(),
            value: b"v".to_vec(),
            write_version: WriteVersion::new(1, 0),
        };
        let b = Entry::Remove {
            storage_id: StorageId::new(1),
            key: b"a".to_vec(),
            write_version: WriteVersion::new(2, 0),
        };
        assert_eq!(a.key_sid(), b.key_sid());
    }

    #[test]
    fn marker_entries_have_no_key_sid() {
        let e = Entry::Begin {
            epoch: EpochId::new(1),
        };
        assert!(e.key_sid().is_none());
        assert!(e.value_etc().is_none());
    }
}
