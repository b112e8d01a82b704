//! WAL scan and sort (component G, §4.7).
//!
//! Given a directory and a list of input files, produces an ordered
//! sequence of surviving entries: every `pwal_*` file is parsed, records
//! are grouped by `key_sid`, and for each key only the entry with the
//! greatest `write_version` survives, further filtered by any
//! `clear_storage`/`remove_storage` range-delete seen for its
//! `storage_id`.
//!
//! Two interchangeable merge back-ends are provided (§4.7 step 3):
//! [`MergeBackend::PutOnly`] sorts the full entry set once and is safe
//! to feed from multiple worker threads; [`MergeBackend::UpdateToMax`]
//! folds incrementally into a map and requires single-threaded insertion
//! (used by the compactor, which already serializes its input through
//! rotation).

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::warn;

use epochwal_core::{BlobId, Entry, EntryKind, EpochId, PathIoError, StorageId, WriteVersion};

use crate::codec;

/// Failures aborting a scan (§7: `DirectoryCorruption`).
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// A WAL file could not be opened or read.
    #[error(transparent)]
    Io(#[from] PathIoError),

    /// A record failed to decode as anything but a clean/truncated EOF.
    #[error("corrupt WAL file {path}: {reason}")]
    DirectoryCorruption {
        /// The file the corruption was found in.
        path: PathBuf,
        /// Human-readable detail.
        reason: String,
    },
}

/// Which merge back-end to run the sort/dedup with (§4.7 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBackend {
    /// Sort-then-take-first-of-group. Safe with concurrent inserts from
    /// multiple worker threads because it never mutates in place.
    PutOnly,
    /// Fold-to-a-map keeping the max `write_version` per key. Requires
    /// single-threaded insertion.
    UpdateToMax,
}

/// The result of a completed scan (§4.7 step 4 "output pass").
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Surviving entries (`Normal`, `NormalWithBlob`, `Remove`), sorted
    /// ascending by `key_sid`. Entries whose `write_version` fell below
    /// their storage's `clear_storage_map` threshold are dropped.
    pub entries: Vec<Entry>,
    /// The greatest epoch observed in any closed session across every
    /// input file.
    pub max_epoch_seen: EpochId,
    /// The greatest `blob_id` observed in any `normal_with_blob` record,
    /// closed session or not — used to advance the blob high-water mark
    /// past every id this directory could possibly have handed out.
    pub max_blob_id: Option<BlobId>,
    /// `blob_id`s referenced by a *surviving* `normal_with_blob` record.
    pub persistent_blob_ids: Vec<BlobId>,
}

struct WorkerOutput {
    sortable: Vec<Entry>,
    clears: HashMap<u64, WriteVersion>,
    max_epoch: EpochId,
    max_blob_id: Option<BlobId>,
}

/// Scan `files` under `layout`'s directory and produce a [`ScanResult`].
pub fn scan_files(files: &[PathBuf], backend: MergeBackend) -> Result<ScanResult, ScanError> {
    let outputs: Vec<Result<WorkerOutput, ScanError>> =
        files.par_iter().map(|f| scan_one_file(f)).collect();

    let mut all_sortable = Vec::new();
    let mut clear_storage_map: HashMap<u64, WriteVersion> = HashMap::new();
    let mut max_epoch_seen = EpochId::ZERO;
    let mut max_blob_id: Option<BlobId> = None;

    for out in outputs {
        let out = out?;
        all_sortable.extend(out.sortable);
        for (sid, wv) in out.clears {
            let entry = clear_storage_map.entry(sid).or_insert(wv);
            if wv > *entry {
                *entry = wv;
            }
        }
        if out.max_epoch > max_epoch_seen {
            max_epoch_seen = out.max_epoch;
        }
        max_blob_id = match (max_blob_id, out.max_blob_id) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
    }

    let merged = match backend {
        MergeBackend::PutOnly => merge_put_only(all_sortable)?,
        MergeBackend::UpdateToMax => merge_update_to_max(all_sortable)?,
    };

    let mut entries = Vec::with_capacity(merged.len());
    let mut persistent_blob_ids = Vec::new();
    for entry in merged {
        let storage_id = entry.storage_id().expect("sortable entries carry a storage_id");
        if let Some(threshold) = clear_storage_map.get(&storage_id.get()) {
            if let Some(wv) = entry.write_version() {
                if wv < *threshold {
                    continue;
                }
            }
        }
        if let Entry::NormalWithBlob { blob_ids, .. } = &entry {
            persistent_blob_ids.extend(blob_ids.iter().copied());
        }
        entries.push(entry);
    }

    Ok(ScanResult {
        entries,
        max_epoch_seen,
        max_blob_id,
        persistent_blob_ids,
    })
}

fn scan_one_file(path: &Path) -> Result<WorkerOutput, ScanError> {
    let file = File::open(path).map_err(|e| PathIoError::new(path, e))?;
    let mut reader = BufReader::new(file);

    let mut sortable = Vec::new();
    let mut clears: HashMap<u64, WriteVersion> = HashMap::new();
    let mut max_epoch = EpochId::ZERO;
    let mut max_blob_id: Option<BlobId> = None;

    let mut session: Option<(EpochId, Vec<Entry>)> = None;

    loop {
        let entry = match codec::read(&mut reader) {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(codec::DecodeError::ChecksumMismatch { .. }) | Err(codec::DecodeError::Malformed(_)) => {
                // A structurally invalid record invalidates the rest of
                // this file's tail, same as a missing marker_end.
                warn!(path = %path.display(), "discarding tail after invalid record");
                session = None;
                break;
            }
            Err(codec::DecodeError::Io(e)) => {
                return Err(ScanError::DirectoryCorruption {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        match &entry {
            Entry::Begin { epoch } => {
                if session.is_some() {
                    return Err(ScanError::DirectoryCorruption {
                        path: path.to_path_buf(),
                        reason: "nested marker_begin without matching marker_end".to_string(),
                    });
                }
                session = Some((*epoch, Vec::new()));
            }
            Entry::End { epoch } => {
                match session.take() {
                    Some((open_epoch, buffered)) if open_epoch == *epoch => {
                        for e in &buffered {
                            if let Entry::NormalWithBlob { blob_ids, .. } = e {
                                for id in blob_ids {
                                    max_blob_id = Some(max_blob_id.map_or(*id, |m| m.max(*id)));
                                }
                            }
                            if let EntryKind::ClearStorage | EntryKind::RemoveStorage =
                                e.kind()
                            {
                                let sid = e.storage_id().unwrap().get();
                                let wv = e.write_version().unwrap();
                                let slot = clears.entry(sid).or_insert(wv);
                                if wv > *slot {
                                    *slot = wv;
                                }
                            } else if e.kind().is_sortable_mutation() {
                                sortable.push(e.clone());
                            }
                        }
                        if *epoch > max_epoch {
                            max_epoch = *epoch;
                        }
                    }
                    _ => {
                        return Err(ScanError::DirectoryCorruption {
                            path: path.to_path_buf(),
                            reason: "marker_end without matching open session".to_string(),
                        });
                    }
                }
            }
            Entry::InvalidatedBegin { .. } => {
                // An explicit abort marker: whatever was buffered for the
                // open session (if any) is discarded.
                session = None;
            }
            Entry::Durable { .. } => {}
            _ => {
                if let Some((_, buffered)) = session.as_mut() {
                    buffered.push(entry);
                } else {
                    // A mutation record outside any session bracket: the
                    // reference implementation treats this as corruption
                    // rather than silently dropping it.
                    return Err(ScanError::DirectoryCorruption {
                        path: path.to_path_buf(),
                        reason: "mutation record outside an open session".to_string(),
                    });
                }
            }
        }
    }
    // An unterminated trailing session (no marker_end / marker_invalidated_begin
    // before EOF) is the normal crash-tail shape; its buffered records are
    // simply dropped (§3.4: recovery trusts only bracketed sessions).

    Ok(WorkerOutput {
        sortable,
        clears,
        max_epoch,
        max_blob_id,
    })
}

fn merge_put_only(mut entries: Vec<Entry>) -> Result<Vec<Entry>, ScanError> {
    entries.sort_by(|a, b| {
        let ka = a.key_sid().expect("sortable");
        let kb = b.key_sid().expect("sortable");
        ka.cmp(&kb).then_with(|| {
            // Descending by write_version within a key group.
            b.write_version().cmp(&a.write_version())
        })
    });

    let mut out: Vec<Entry> = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;
    for entry in entries {
        let key = entry.key_sid().expect("sortable");
        if Some(&key) == last_key.as_ref() {
            continue; // not the greatest write_version for this key
        }
        if let Some(prev) = &last_key {
            if key < *prev {
                return Err(ScanError::DirectoryCorruption {
                    path: PathBuf::new(),
                    reason: "key-order violation during PUT-ONLY merge".to_string(),
                });
            }
        }
        last_key = Some(key);
        out.push(entry);
    }
    Ok(out)
}

fn merge_update_to_max(entries: Vec<Entry>) -> Result<Vec<Entry>, ScanError> {
    let mut map: HashMap<Vec<u8>, Entry> = HashMap::new();
    for entry in entries {
        let key = entry.key_sid().expect("sortable");
        match map.get(&key) {
            Some(existing) if existing.write_version() >= entry.write_version() => {}
            _ => {
                map.insert(key, entry);
            }
        }
    }
    let mut out: Vec<Entry> = map.into_values().collect();
    out.sort_by(|a, b| a.key_sid().unwrap().cmp(&b.key_sid().unwrap()));
    Ok(out)
}

/// Read the durable-epoch marker file (`epoch`, §3.3/§6.1) and return
/// `ld_epoch`, the last epoch known durable before this scan. A missing
/// file means nothing has ever been made durable.
pub fn read_epoch_file(path: &Path) -> Result<EpochId, ScanError> {
    if !path.exists() {
        return Ok(EpochId::ZERO);
    }
    let file = File::open(path).map_err(|e| PathIoError::new(path, e))?;
    let mut reader = BufReader::new(file);
    match codec::read(&mut reader) {
        Ok(Some(Entry::Durable { epoch })) => Ok(epoch),
        Ok(Some(_)) | Ok(None) => Err(ScanError::DirectoryCorruption {
            path: path.to_path_buf(),
            reason: "epoch file does not contain a single marker_durable record".to_string(),
        }),
        Err(e) => Err(ScanError::DirectoryCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Write the durable-epoch marker file atomically (open-write-fsync-rename).
pub fn write_epoch_file(path: &Path, epoch: EpochId) -> Result<(), PathIoError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|e| PathIoError::new(&tmp_path, e))?;
        codec::write_durable(&mut file, epoch).map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&tmp_path, e))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| PathIoError::new(path, e))?;
    Ok(())
}

/// A `clear_storage_map` guarded for concurrent access by the scan
/// worker threads (§4.7 step 2: "protected by a mutex").
#[derive(Default)]
pub struct ClearStorageMap(Mutex<HashMap<u64, WriteVersion>>);

impl ClearStorageMap {
    /// Record a `clear_storage`/`remove_storage` boundary, keeping the max.
    pub fn update(&self, storage_id: StorageId, write_version: WriteVersion) {
        let mut guard = self.0.lock();
        let slot = guard.entry(storage_id.get()).or_insert(write_version);
        if write_version > *slot {
            *slot = write_version;
        }
    }

    /// The threshold for `storage_id`, if any boundary has been seen.
    pub fn threshold(&self, storage_id: StorageId) -> Option<WriteVersion> {
        self.0.lock().get(&storage_id.get()).copied()
    }
}
