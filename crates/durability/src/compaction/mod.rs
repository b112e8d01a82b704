//! Compactor (component I, §4.9) and the compaction catalog text format
//! (§6.1).
//!
//! Produces `pwal_0000.compacted` from a set of rotated WAL files plus
//! any existing compacted file, via the same sort core the recovery
//! path uses (component G) with the PUT-ONLY back-end. The catalog
//! update and the compacted-file replacement are meant to be performed
//! together so a reader only ever observes the pre- or post-compaction
//! pair, never a mixture (§4.9, §8 scenario 5).

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use epochwal_core::{Entry, EpochId, PathIoError};

use crate::codec;
use crate::manifest::LogDirLayout;
use crate::scan::{self, MergeBackend};

const HEADER: &str = "COMPACTION_CATALOG_HEADER";
const FOOTER: &str = "COMPACTION_CATALOG_FOOTER";

/// Parsed contents of `compaction_catalog` (§6.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionCatalog {
    /// The greatest epoch absorbed by any compacted file so far.
    pub max_epoch_id: EpochId,
    /// `(file_name, version)` pairs naming the compacted files in effect.
    pub compacted_files: Vec<(String, u32)>,
    /// Rotated `pwal_*` files whose content has been absorbed and should
    /// be excluded from snapshot assembly at recovery time.
    pub migrated_pwals: Vec<String>,
}

impl CompactionCatalog {
    fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');
        out.push_str(&format!("MAX_EPOCH_ID {}\n", self.max_epoch_id.get()));
        for (name, version) in &self.compacted_files {
            out.push_str(&format!("COMPACTED_FILE {} {}\n", name, version));
        }
        for name in &self.migrated_pwals {
            out.push_str(&format!("MIGRATED_PWAL {}\n", name));
        }
        out.push_str(FOOTER);
        out.push('\n');
        out
    }
}

/// Errors touching the catalog or a compaction run.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    /// A line in the catalog used an unrecognized key or couldn't parse.
    #[error("compaction catalog at {path} is malformed: {reason}")]
    Malformed {
        /// The catalog path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The catalog text has no `COMPACTION_CATALOG_FOOTER` line.
    #[error("compaction catalog at {path} is missing its footer")]
    MissingFooter {
        /// The catalog path.
        path: PathBuf,
    },

    /// An I/O failure touched the catalog or a compacted file.
    #[error(transparent)]
    Io(#[from] PathIoError),

    /// The merge/sort stage failed while assembling a compacted file.
    #[error(transparent)]
    Scan(#[from] scan::ScanError),
}

fn parse_catalog_text(path: &Path, text: &str) -> Result<CompactionCatalog, CompactionError> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or("").trim();
    if header != HEADER {
        return Err(CompactionError::Malformed {
            path: path.to_path_buf(),
            reason: "missing or invalid header".to_string(),
        });
    }

    let rest: Vec<&str> = lines.collect();
    let footer_idx = match rest.iter().rposition(|l| l.trim() == FOOTER) {
        Some(i) => i,
        None => {
            return Err(CompactionError::MissingFooter {
                path: path.to_path_buf(),
            })
        }
    };

    let mut catalog = CompactionCatalog::default();
    let mut seen_max_epoch = false;
    for line in &rest[..footer_idx] {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or("");
        let malformed = |reason: &str| CompactionError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        match key {
            "MAX_EPOCH_ID" => {
                if seen_max_epoch {
                    return Err(malformed("duplicate MAX_EPOCH_ID"));
                }
                let value: u64 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed("MAX_EPOCH_ID missing its value"))?;
                catalog.max_epoch_id = EpochId::new(value);
                seen_max_epoch = true;
            }
            "COMPACTED_FILE" => {
                let name = parts
                    .next()
                    .ok_or_else(|| malformed("COMPACTED_FILE missing its name"))?
                    .to_string();
                let version: u32 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| malformed("COMPACTED_FILE missing its version"))?;
                catalog.compacted_files.push((name, version));
            }
            // `DETACHED_PWAL` is the historical name for the same key.
            "MIGRATED_PWAL" | "DETACHED_PWAL" => {
                let name = parts
                    .next()
                    .ok_or_else(|| malformed("MIGRATED_PWAL missing its name"))?
                    .to_string();
                catalog.migrated_pwals.push(name);
            }
            other => return Err(malformed(&format!("unknown catalog key {other}"))),
        }
    }
    if !seen_max_epoch {
        return Err(CompactionError::Malformed {
            path: path.to_path_buf(),
            reason: "catalog has no MAX_EPOCH_ID line".to_string(),
        });
    }
    Ok(catalog)
}

fn read_catalog_file(path: &Path) -> Result<CompactionCatalog, CompactionError> {
    let mut file = File::open(path).map_err(|e| PathIoError::new(path, e))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| PathIoError::new(path, e))?;
    parse_catalog_text(path, &text)
}

fn write_catalog_text(path: &Path, catalog: &CompactionCatalog) -> Result<(), PathIoError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.write_all(catalog.to_text().as_bytes())
            .map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.flush().map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| PathIoError::new(path, e))?;
    Ok(())
}

/// Write a fresh, empty catalog (`MAX_EPOCH_ID 0`, no files) — used by
/// `ManifestHandle::create_initial` (§4.2) when a log directory is first
/// created.
pub fn write_empty_catalog(path: &Path) -> Result<(), PathIoError> {
    write_catalog_text(path, &CompactionCatalog::default())
}

/// Load the catalog, promoting `compaction_catalog.back` to
/// `compaction_catalog` if the main file is missing or lacks its
/// footer (§4.9: "on recovery, if `<catalog>` is missing but
/// `<catalog>.back` exists, the backup is promoted").
pub fn load_catalog(layout: &LogDirLayout) -> Result<CompactionCatalog, CompactionError> {
    let main = layout.compaction_catalog();
    let main_result = if main.exists() {
        Some(read_catalog_file(&main))
    } else {
        None
    };

    if let Some(Ok(catalog)) = main_result {
        return Ok(catalog);
    }

    let backup = layout.compaction_catalog_backup();
    if backup.exists() {
        let catalog = read_catalog_file(&backup)?;
        warn!(path = %main.display(), "promoting compaction catalog backup to main");
        fs::rename(&backup, &main).map_err(|e| PathIoError::new(&backup, e))?;
        return Ok(catalog);
    }

    match main_result {
        Some(Err(e)) => Err(e),
        _ => Ok(CompactionCatalog::default()),
    }
}

/// Replace the catalog with `catalog`'s contents via the two-phase
/// write: write the backup, write main with identical contents, then
/// remove the backup (same "write-backup-then-replace" discipline the
/// manifest's format migration uses).
pub fn replace_catalog(layout: &LogDirLayout, catalog: &CompactionCatalog) -> Result<(), PathIoError> {
    write_catalog_text(&layout.compaction_catalog_backup(), catalog)?;
    write_catalog_text(&layout.compaction_catalog(), catalog)?;
    let _ = fs::remove_file(layout.compaction_catalog_backup());
    Ok(())
}

/// Outcome metrics from one [`compact`] run.
#[derive(Debug, Clone)]
pub struct CompactionInfo {
    /// Number of rotated files absorbed by this run.
    pub wal_files_absorbed: usize,
    /// Number of surviving key entries written to the new compacted file.
    pub entries_written: usize,
    /// The catalog's `max_epoch_id` after this run.
    pub new_max_epoch_id: EpochId,
}

/// Produce a new `pwal_0000.compacted` from `rotated_files` plus any
/// compacted file already present, and update the catalog to match
/// (§4.9). Callers are expected to have already asked the datastore to
/// rotate every channel and pass the resulting file set as
/// `rotated_files`.
pub fn compact(layout: &LogDirLayout, rotated_files: &[PathBuf]) -> Result<CompactionInfo, CompactionError> {
    let mut inputs: Vec<PathBuf> = rotated_files.to_vec();
    let existing_compacted = layout.compacted();
    if existing_compacted.exists() {
        inputs.push(existing_compacted);
    }

    let scan_result = scan::scan_files(&inputs, MergeBackend::PutOnly)?;
    write_compacted_file(&layout.compacted(), &scan_result.entries)?;

    let mut catalog = load_catalog(layout)?;
    if scan_result.max_epoch_seen > catalog.max_epoch_id {
        catalog.max_epoch_id = scan_result.max_epoch_seen;
    }
    catalog.compacted_files = vec![("pwal_0000.compacted".to_string(), 1)];
    for path in rotated_files {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            catalog.migrated_pwals.push(name.to_string());
        }
    }
    replace_catalog(layout, &catalog)?;

    info!(
        files_absorbed = inputs.len(),
        entries = scan_result.entries.len(),
        "compaction finished"
    );

    Ok(CompactionInfo {
        wal_files_absorbed: rotated_files.len(),
        entries_written: scan_result.entries.len(),
        new_max_epoch_id: catalog.max_epoch_id,
    })
}

/// A compacted file has the same shape as the snapshot builder's
/// output: a single session at epoch 0 wrapping the surviving records
/// (§4.8). `remove_entry` survivors are omitted — once written, a
/// compacted file is itself the new baseline, so there is nothing
/// older left for a tombstone to override.
fn write_compacted_file(path: &Path, entries: &[Entry]) -> Result<(), PathIoError> {
    let tmp_path = path.with_extension("tmp");
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
                Entry::Remove { .. } => {}
                _ => unreachable!("scan only yields sortable mutation entries"),
            }
        }
        codec::write_end(&mut file, EpochId::ZERO).map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.flush().map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| PathIoError::new(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochwal_core::{StorageId, WriteVersion};
    use std::fs::File as StdFile;
    use tempfile::tempdir;

    #[test]
    fn catalog_text_roundtrips() {
        let catalog = CompactionCatalog {
            max_epoch_id: EpochId::new(3),
            compacted_files: vec![("pwal_0000.compacted".to_string(), 1)],
            migrated_pwals: vec!["pwal_0001.20240101".to_string()],
        };
        let text = catalog.to_text();
        let parsed = parse_catalog_text(Path::new("catalog"), &text).unwrap();
        assert_eq!(parsed, catalog);
    }

    #[test]
    fn historical_detached_pwal_key_is_accepted() {
        let text = format!(
            "{}\nMAX_EPOCH_ID 1\nDETACHED_PWAL pwal_0003\n{}\n",
            HEADER, FOOTER
        );
        let parsed = parse_catalog_text(Path::new("catalog"), &text).unwrap();
        assert_eq!(parsed.migrated_pwals, vec!["pwal_0003".to_string()]);
    }

    #[test]
    fn unknown_key_is_malformed() {
        let text = format!("{}\nMAX_EPOCH_ID 1\nBOGUS_KEY x\n{}\n", HEADER, FOOTER);
        let err = parse_catalog_text(Path::new("catalog"), &text).unwrap_err();
        assert!(matches!(err, CompactionError::Malformed { .. }));
    }

    #[test]
    fn missing_footer_is_rejected() {
        let text = format!("{}\nMAX_EPOCH_ID 1\n", HEADER);
        let err = parse_catalog_text(Path::new("catalog"), &text).unwrap_err();
        assert!(matches!(err, CompactionError::MissingFooter { .. }));
    }

    #[test]
    fn load_catalog_promotes_backup_when_main_missing() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let catalog = CompactionCatalog {
            max_epoch_id: EpochId::new(5),
            compacted_files: vec![],
            migrated_pwals: vec![],
        };
        write_catalog_text(&layout.compaction_catalog_backup(), &catalog).unwrap();

        let loaded = load_catalog(&layout).unwrap();
        assert_eq!(loaded, catalog);
        assert!(layout.compaction_catalog().exists());
        assert!(!layout.compaction_catalog_backup().exists());
    }

    #[test]
    fn load_catalog_on_fresh_directory_is_empty() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let loaded = load_catalog(&layout).unwrap();
        assert_eq!(loaded, CompactionCatalog::default());
    }

    fn write_session_file(path: &Path, epoch: u64, entries: &[Entry]) {
        let mut file = StdFile::create(path).unwrap();
        codec::write_begin(&mut file, EpochId::new(epoch)).unwrap();
        for e in entries {
            if let Entry::Normal {
                storage_id,
                key,
                value,
                write_version,
            } = e
            {
                codec::write_normal(&mut file, *storage_id, key, value, *write_version).unwrap();
            }
        }
        codec::write_end(&mut file, EpochId::new(epoch)).unwrap();
    }

    #[test]
    fn compact_merges_rotated_files_and_updates_catalog() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        write_empty_catalog(&layout.compaction_catalog()).unwrap();

        let rotated = layout.pwal_rotated(0, "20240101T000000");
        write_session_file(
            &rotated,
            1,
            &[Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                write_version: WriteVersion::new(1, 0),
            }],
        );

        let info = compact(&layout, &[rotated]).unwrap();
        assert_eq!(info.wal_files_absorbed, 1);
        assert_eq!(info.entries_written, 1);
        assert!(layout.compacted().exists());

        let catalog = load_catalog(&layout).unwrap();
        assert_eq!(catalog.max_epoch_id, EpochId::new(1));
        assert_eq!(catalog.migrated_pwals.len(), 1);
    }

    #[test]
    fn second_compaction_absorbs_the_first_compacted_file() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        write_empty_catalog(&layout.compaction_catalog()).unwrap();

        let first = layout.pwal_rotated(0, "a");
        write_session_file(
            &first,
            1,
            &[Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"k1".to_vec(),
                value: b"v1".to_vec(),
                write_version: WriteVersion::new(1, 0),
            }],
        );
        compact(&layout, &[first]).unwrap();

        let second = layout.pwal_rotated(0, "b");
        write_session_file(
            &second,
            2,
            &[Entry::Normal {
                storage_id: StorageId::new(1),
                key: b"k2".to_vec(),
                value: b"v2".to_vec(),
                write_version: WriteVersion::new(2, 0),
            }],
        );
        let info = compact(&layout, &[second]).unwrap();
        assert_eq!(info.entries_written, 2); // k1 from the prior compacted file, k2 new
    }
}
