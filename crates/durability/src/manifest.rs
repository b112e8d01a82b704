//! Manifest & directory layout (component B, §4.2).
//!
//! Owns the log directory's single-writer invariant, the format-version
//! manifest, and migration of older directory layouts: `LogDirLayout`
//! is the path-builder half, `ManifestHandle` is the versioned metadata
//! half.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use epochwal_core::PathIoError;

/// Current supported on-disk manifest format.
pub const CURRENT_FORMAT_VERSION: u32 = 4;

const MANIFEST_FILE: &str = "limestone-manifest.json";
const MANIFEST_BACKUP_FILE: &str = "limestone-manifest.json.back";

/// Path builder for everything under one log directory (§3.3).
///
/// One method per path, no exceptions, so every caller that needs a
/// file under the log directory goes through here rather than joining
/// strings locally.
#[derive(Debug, Clone)]
pub struct LogDirLayout {
    root: PathBuf,
}

impl LogDirLayout {
    /// Build path accessors rooted at `root`.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        LogDirLayout {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The log directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `limestone-manifest.json`.
    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// `limestone-manifest.json.back`.
    pub fn manifest_backup(&self) -> PathBuf {
        self.root.join(MANIFEST_BACKUP_FILE)
    }

    /// `pwal_NNNN` for the given channel index.
    pub fn pwal(&self, channel_index: u32) -> PathBuf {
        self.root.join(format!("pwal_{:04}", channel_index))
    }

    /// A rotated `pwal_NNNN.<suffix>` path.
    pub fn pwal_rotated(&self, channel_index: u32, suffix: &str) -> PathBuf {
        self.root.join(format!("pwal_{:04}.{}", channel_index, suffix))
    }

    /// `pwal_0000.compacted`.
    pub fn compacted(&self) -> PathBuf {
        self.root.join("pwal_0000.compacted")
    }

    /// `pwal_0000.compacted.prev`.
    pub fn compacted_prev(&self) -> PathBuf {
        self.root.join("pwal_0000.compacted.prev")
    }

    /// `compaction_catalog`.
    pub fn compaction_catalog(&self) -> PathBuf {
        self.root.join("compaction_catalog")
    }

    /// `compaction_catalog.back`.
    pub fn compaction_catalog_backup(&self) -> PathBuf {
        self.root.join("compaction_catalog.back")
    }

    /// `epoch`.
    pub fn epoch_file(&self) -> PathBuf {
        self.root.join("epoch")
    }

    /// `data/` directory.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// `data/snapshot`.
    pub fn snapshot(&self) -> PathBuf {
        self.data_dir().join("snapshot")
    }

    /// `blob/` directory.
    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("blob")
    }

    /// `wal_history`.
    pub fn wal_history(&self) -> PathBuf {
        self.root.join("wal_history")
    }

    /// `wal_history.tmp`.
    pub fn wal_history_tmp(&self) -> PathBuf {
        self.root.join("wal_history.tmp")
    }

    /// Create the directory skeleton (`data/`, `blob/`) a fresh log
    /// directory needs.
    pub fn create_directories(&self) -> Result<(), PathIoError> {
        fs::create_dir_all(&self.root).map_err(|e| PathIoError::new(&self.root, e))?;
        fs::create_dir_all(self.data_dir()).map_err(|e| PathIoError::new(self.data_dir(), e))?;
        fs::create_dir_all(self.blob_dir()).map_err(|e| PathIoError::new(self.blob_dir(), e))?;
        Ok(())
    }

    /// List every `pwal_NNNN` and `pwal_NNNN.<suffix>` file present,
    /// excluding the compacted file and its `.prev`.
    pub fn list_wal_files(&self) -> Result<Vec<PathBuf>, PathIoError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| PathIoError::new(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PathIoError::new(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("pwal_") && !name.contains("compacted") {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// On-disk manifest contents (§6.1).
///
/// `instance_uuid` is omitted on the wire for `format_version == "1.0"`,
/// matching the original's backward-compatible encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestContents {
    /// Human string form of the format, e.g. `"1.0"`.
    pub format_version: String,
    /// The numeric format tag this crate actually dispatches on.
    pub persistent_format_version: u32,
    /// Per-instance identifier, omitted when `format_version == "1.0"`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance_uuid: Option<Uuid>,
}

impl ManifestContents {
    fn current(instance_uuid: Uuid) -> Self {
        ManifestContents {
            format_version: format!("{}.0", CURRENT_FORMAT_VERSION),
            persistent_format_version: CURRENT_FORMAT_VERSION,
            instance_uuid: Some(instance_uuid),
        }
    }
}

/// Manifest-handling errors (§7 taxonomy: `AlreadyInUse`, `VersionMismatch`, `IoError`).
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// A second process attempted to acquire the manifest lock.
    #[error("manifest at {path} is already in use by another process")]
    AlreadyInUse {
        /// The manifest path the lock was attempted on.
        path: PathBuf,
    },

    /// The manifest's format version is unsupported.
    #[error("manifest format version {actual} is not supported (supported: <= {supported})")]
    VersionMismatch {
        /// The version found on disk, 0 if no manifest exists at all.
        actual: u32,
        /// The highest version this build supports.
        supported: u32,
    },

    /// The manifest JSON could not be parsed.
    #[error("manifest at {path} is corrupt: {source}")]
    Corrupt {
        /// The manifest path.
        path: PathBuf,
        /// The JSON parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// An I/O failure touched the manifest or its backup.
    #[error(transparent)]
    Io(#[from] PathIoError),
}

/// A held exclusive lock on a log directory's manifest, plus the parsed
/// contents (§4.2 `acquire`).
pub struct ManifestHandle {
    layout: LogDirLayout,
    lock_file: File,
    contents: ManifestContents,
    /// Set by `check_and_migrate` when the on-disk version was older
    /// than [`CURRENT_FORMAT_VERSION`] (§1 supplemented `migration_info`).
    migration_info: Option<(u32, u32)>,
}

impl ManifestHandle {
    /// `acquire(dir) -> Handle`: open an advisory exclusive OS-level lock
    /// on the manifest file.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let layout = LogDirLayout::from_root(dir);
        layout.create_directories()?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(layout.manifest())
            .map_err(|e| PathIoError::new(layout.manifest(), e))?;

        lock_file.try_lock_exclusive().map_err(|_| {
            warn!(path = %layout.manifest().display(), "manifest lock held by another process");
            ManifestError::AlreadyInUse {
                path: layout.manifest(),
            }
        })?;

        let (contents, migration_info) = check_and_migrate(&layout)?;

        Ok(ManifestHandle {
            layout,
            lock_file,
            contents,
            migration_info,
        })
    }

    /// `create_initial(dir)`: write the current-format manifest and
    /// ensure the compaction catalog exists, then immediately acquire it.
    pub fn create_initial(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let layout = LogDirLayout::from_root(dir);
        layout.create_directories()?;
        let contents = ManifestContents::current(Uuid::new_v4());
        write_manifest_atomically(&layout.manifest(), &contents)?;
        if !layout.compaction_catalog().exists() {
            crate::compaction::write_empty_catalog(&layout.compaction_catalog())
                .map_err(ManifestError::Io)?;
        }
        Self::acquire(layout.root())
    }

    /// The path layout this handle owns.
    pub fn layout(&self) -> &LogDirLayout {
        &self.layout
    }

    /// The parsed manifest contents.
    pub fn contents(&self) -> &ManifestContents {
        &self.contents
    }

    /// `(old_version, new_version)` if `check_and_migrate` performed a
    /// migration during `acquire` (§1 supplemented feature).
    pub fn migration_info(&self) -> Option<(u32, u32)> {
        self.migration_info
    }

    /// Release the lock explicitly (also happens on drop).
    pub fn release(self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

impl Drop for ManifestHandle {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// `check_and_migrate(dir)` (§4.2): run the five-step migration
/// algorithm and return the resulting contents plus an optional
/// `(old, new)` migration record.
fn check_and_migrate(
    layout: &LogDirLayout,
) -> Result<(ManifestContents, Option<(u32, u32)>), ManifestError> {
    let main_exists = layout.manifest().exists();
    let backup_exists = layout.manifest_backup().exists();

    if !main_exists && !backup_exists {
        return Err(ManifestError::VersionMismatch {
            actual: 0,
            supported: CURRENT_FORMAT_VERSION,
        });
    }

    if !main_exists && backup_exists {
        fs::rename(layout.manifest_backup(), layout.manifest())
            .map_err(|e| PathIoError::new(layout.manifest_backup(), e))?;
        info!(path = %layout.manifest().display(), "promoted manifest backup to main");
    }

    let contents = read_manifest(&layout.manifest())?;

    if contents.persistent_format_version > CURRENT_FORMAT_VERSION {
        return Err(ManifestError::VersionMismatch {
            actual: contents.persistent_format_version,
            supported: CURRENT_FORMAT_VERSION,
        });
    }

    if contents.persistent_format_version < CURRENT_FORMAT_VERSION {
        let old = contents.persistent_format_version;
        let migrated = ManifestContents::current(
            contents.instance_uuid.unwrap_or_else(Uuid::new_v4),
        );
        // Write-backup-then-replace ordering (§4.2 step 4).
        write_manifest_atomically(&layout.manifest_backup(), &migrated)?;
        write_manifest_atomically(&layout.manifest(), &migrated)?;
        let _ = fs::remove_file(layout.manifest_backup());
        info!(old, new = CURRENT_FORMAT_VERSION, "migrated manifest format");
        return Ok((migrated, Some((old, CURRENT_FORMAT_VERSION))));
    }

    Ok((contents, None))
}

fn read_manifest(path: &Path) -> Result<ManifestContents, ManifestError> {
    let mut file = File::open(path).map_err(|e| PathIoError::new(path, e))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .map_err(|e| PathIoError::new(path, e))?;
    serde_json::from_str(&buf).map_err(|source| ManifestError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Safe write discipline (§4.2): open, write, flush, fsync, close, then
/// rename into place via a `.tmp` sibling.
fn write_manifest_atomically(path: &Path, contents: &ManifestContents) -> Result<(), PathIoError> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(contents).expect("manifest contents always serialize");
    {
        let mut file = File::create(&tmp_path).map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.write_all(&json)
            .map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.flush().map_err(|e| PathIoError::new(&tmp_path, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| PathIoError::new(path, e))?;
    Ok(())
}
