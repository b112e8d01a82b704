//! Datastore façade (component F, §4.6).
//!
//! Composes the manifest, the channel set, the epoch tracker, the BLOB
//! registry, and (optionally) the replication client behind the single
//! entry point callers actually hold: one struct owning every
//! subsystem, a two-phase `recover()`/`ready()` startup, and a
//! `shutdown()` that joins every background thread it spawned.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use epochwal_core::EpochId;

use crate::blob::{BlobError, BlobPool, BlobRegistry};
use crate::channel::{ChannelError, LogChannel};
use crate::compaction::{self, CompactionError, CompactionInfo};
use crate::distributor::{PartitionedCursor, PartitionedCursorDistributor};
use crate::epoch::{EpochError, EpochTracker};
use crate::manifest::{LogDirLayout, ManifestError, ManifestHandle};
use crate::replication::{ReplicationClient, ReplicationConfig};
use crate::scan::{self, MergeBackend, ScanError};
use crate::snapshot::{write_snapshot, MergingCursor, SnapshotError};

/// Aggregated failures a façade method can return (§7).
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    /// A manifest operation failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The recovery scan failed.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Building or reading the snapshot failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// A compaction run failed.
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    /// The epoch tracker rejected the call.
    #[error(transparent)]
    Epoch(#[from] EpochError),
    /// A BLOB operation failed.
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// A façade method that requires `ready()` was called beforehand.
    #[error("datastore is still recovering; call ready() before beginning sessions")]
    NotReady,
}

/// Which half of the two-phase startup the facade is in (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Recovering,
    Serving,
}

/// A consistent set of paths a backup tool should copy, captured at
/// `begin_backup()` time (§4.6 `begin_backup() -> Backup`).
pub struct Backup {
    files: Vec<PathBuf>,
}

impl Backup {
    /// The paths to copy, in an order safe to copy sequentially (the
    /// manifest and epoch file last, since they're what a restorer
    /// trusts to decide the directory is complete).
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Release the backup handle. The list is a point-in-time snapshot
    /// of paths, not a lock, so there is nothing to unwind beyond
    /// dropping it; this exists so callers can express "I'm done
    /// copying" explicitly rather than relying on scope exit.
    pub fn release(self) {}
}

/// `get_snapshot() -> Snapshot` (§4.6): a read handle bundling the
/// paths a cursor needs, so callers don't have to know the directory
/// layout.
pub struct Snapshot {
    snapshot_path: PathBuf,
    compacted_path: PathBuf,
}

impl Snapshot {
    /// The ordinary merging cursor over `(snapshot, compacted?)` (§4.8).
    pub fn get_cursor(&self) -> Result<MergingCursor, SnapshotError> {
        MergingCursor::open(&self.snapshot_path, &self.compacted_path)
    }

    /// `get_partitioned_cursors(n)` (§4.11): fan the merging cursor out
    /// across `n` independently-drained partitions.
    pub fn get_partitioned_cursors(
        &self,
        n: usize,
    ) -> Result<(Arc<PartitionedCursorDistributor>, Vec<PartitionedCursor>), SnapshotError> {
        let cursor = self.get_cursor()?;
        Ok(PartitionedCursorDistributor::spawn(cursor, n))
    }
}

fn live_channel_indices(layout: &LogDirLayout) -> Result<Vec<u32>, DatastoreError> {
    let mut indices: Vec<u32> = layout
        .list_wal_files()?
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            let suffix = name.strip_prefix("pwal_")?;
            // A live channel file is exactly `pwal_NNNN`; anything with a
            // further `.` suffix is a rotated-aside tail.
            suffix.parse::<u32>().ok()
        })
        .collect();
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// Outcome of `recover()` (§4.6), reported for logging/diagnostics.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Number of WAL files folded into the fresh snapshot.
    pub wal_files_scanned: usize,
    /// Number of surviving keys written to `data/snapshot`.
    pub entries_recovered: usize,
    /// The durable epoch recovery advanced the datastore to.
    pub recovered_epoch: EpochId,
}

/// The composed entry point over one log directory (§4.6).
pub struct Datastore {
    layout: LogDirLayout,
    manifest: ManifestHandle,
    channels: Mutex<Vec<Arc<LogChannel>>>,
    epoch_tracker: Arc<EpochTracker>,
    blob_registry: Arc<BlobRegistry>,
    replication: Option<Arc<ReplicationClient>>,
    state: Mutex<LifecycleState>,
}

impl Datastore {
    /// Acquire the manifest (creating a fresh directory if necessary)
    /// and run recovery, returning a handle still in the `Recovering`
    /// state until [`Datastore::ready`] is called.
    pub fn recover(dir: impl Into<PathBuf>) -> Result<(Self, RecoveryReport), DatastoreError> {
        let dir = dir.into();
        let manifest = if dir.join("limestone-manifest.json").exists()
            || dir.join("limestone-manifest.json.back").exists()
        {
            ManifestHandle::acquire(&dir)?
        } else {
            ManifestHandle::create_initial(&dir)?
        };
        let layout = manifest.layout().clone();

        let catalog = compaction::load_catalog(&layout)?;
        let migrated: std::collections::HashSet<String> =
            catalog.migrated_pwals.iter().cloned().collect();

        let wal_files: Vec<PathBuf> = layout
            .list_wal_files()?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !migrated.contains(n))
                    .unwrap_or(true)
            })
            .collect();

        let scan_result = scan::scan_files(&wal_files, MergeBackend::PutOnly)?;
        let compacted_exists = layout.compacted().exists();
        write_snapshot(&layout.snapshot(), &scan_result.entries, compacted_exists)?;

        let epoch_file_recorded = scan::read_epoch_file(&layout.epoch_file())?;
        let recovered_epoch = scan_result
            .max_epoch_seen
            .max(catalog.max_epoch_id)
            .max(epoch_file_recorded);
        scan::write_epoch_file(&layout.epoch_file(), recovered_epoch)?;

        let starting_blob_id = scan_result.max_blob_id.map(|id| id.get() + 1).unwrap_or(0);
        let blob_registry = Arc::new(BlobRegistry::new(
            layout.clone(),
            starting_blob_id,
            scan_result.persistent_blob_ids,
        ));

        let mut epoch_tracker = EpochTracker::new(layout.epoch_file(), recovered_epoch);
        if let Some(instance_uuid) = manifest.contents().instance_uuid {
            epoch_tracker = epoch_tracker.with_wal_history(layout.wal_history(), instance_uuid);
        }
        let epoch_tracker = Arc::new(epoch_tracker);

        let replication = ReplicationConfig::from_env().map(|config| {
            info!(endpoint = %config.endpoint, "replication configured");
            Arc::new(ReplicationClient::connect(config))
        });

        let mut channels = Vec::new();
        for index in live_channel_indices(&layout)? {
            let mut channel = LogChannel::open(&layout, index)?;
            if let Some(replication) = &replication {
                channel = channel.with_replication(Arc::clone(replication));
            }
            channels.push(Arc::new(channel));
        }

        let report = RecoveryReport {
            wal_files_scanned: wal_files.len(),
            entries_recovered: scan_result.entries.len(),
            recovered_epoch,
        };

        Ok((
            Datastore {
                layout,
                manifest,
                channels: Mutex::new(channels),
                epoch_tracker,
                blob_registry,
                replication,
                state: Mutex::new(LifecycleState::Recovering),
            },
            report,
        ))
    }

    /// Transition from `Recovering` to `Serving`. `begin_session` on any
    /// channel is illegal before this call (§4.6).
    pub fn ready(&self) {
        *self.state.lock() = LifecycleState::Serving;
    }

    fn require_serving(&self) -> Result<(), DatastoreError> {
        if *self.state.lock() != LifecycleState::Serving {
            return Err(DatastoreError::NotReady);
        }
        Ok(())
    }

    /// `switch_epoch(n)`: advance the durable-epoch tracker and, if
    /// replication is configured, emit the group-commit barrier once the
    /// new durable value has actually been recorded.
    pub fn switch_epoch(&self, new_epoch: EpochId) -> Result<(), DatastoreError> {
        self.require_serving()?;
        let channels = self.channels.lock().clone();
        self.epoch_tracker.switch_epoch(new_epoch, &channels)?;
        if let Some(replication) = &self.replication {
            replication.group_commit(self.epoch_tracker.epoch_id_record_finished());
        }
        Ok(())
    }

    /// Notify the tracker that a channel finished a session, so it can
    /// recompute the durable epoch in case that channel was the
    /// laggard. Channel owners call this after `end_session()`.
    pub fn on_channel_session_end(&self) {
        let channels = self.channels.lock().clone();
        self.epoch_tracker.on_session_end(&channels);
        if let Some(replication) = &self.replication {
            replication.group_commit(self.epoch_tracker.epoch_id_record_finished());
        }
    }

    /// Hint that channel `channel_id` is about to finish its session,
    /// so a waiting recompute doesn't need to poll for the event.
    pub fn request_finish_soon(&self, channel_id: usize) {
        self.epoch_tracker.request_finish_soon(channel_id);
    }

    /// `create_channel() -> &LogChannel`: allocate the next sequential
    /// channel index under this directory.
    pub fn create_channel(&self) -> Result<Arc<LogChannel>, DatastoreError> {
        self.require_serving()?;
        let mut channels = self.channels.lock();
        let index = channels.len() as u32;
        let mut channel = LogChannel::open(&self.layout, index)?;
        if let Some(replication) = &self.replication {
            channel = channel.with_replication(Arc::clone(replication));
        }
        let channel = Arc::new(channel);
        channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    /// Every channel currently owned by this datastore.
    pub fn channels(&self) -> Vec<Arc<LogChannel>> {
        self.channels.lock().clone()
    }

    /// `get_snapshot() -> Snapshot`.
    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            snapshot_path: self.layout.snapshot(),
            compacted_path: self.layout.compacted(),
        }
    }

    /// `acquire_blob_pool() -> Pool`.
    pub fn acquire_blob_pool(&self) -> BlobPool {
        self.blob_registry.acquire_pool()
    }

    /// `generate_reference_tag(id, tx)` (§3.1): an opaque authorization
    /// token for higher layers, deterministic within this instance.
    pub fn generate_reference_tag(
        &self,
        blob_id: epochwal_core::BlobId,
        transaction_id: u64,
    ) -> Result<epochwal_core::BlobReferenceTag, DatastoreError> {
        Ok(self.blob_registry.generate_reference_tag(blob_id, transaction_id)?)
    }

    /// `begin_backup() -> Backup`: list the files a backup tool should
    /// copy, in dependency order.
    pub fn begin_backup(&self) -> Backup {
        let mut files = vec![self.layout.compaction_catalog()];
        if self.layout.compaction_catalog_backup().exists() {
            files.push(self.layout.compaction_catalog_backup());
        }
        if self.layout.compacted().exists() {
            files.push(self.layout.compacted());
        }
        for channel in self.channels.lock().iter() {
            files.push(self.layout.pwal(channel.index()));
        }
        if self.layout.snapshot().exists() {
            files.push(self.layout.snapshot());
        }
        files.push(self.layout.epoch_file());
        files.push(self.layout.manifest());
        Backup { files }
    }

    /// Rotate every channel and fold the results into a fresh compacted
    /// file, composing component I with the channel set this façade owns
    /// (§4.9 "rotation cooperation").
    pub fn compact(&self) -> Result<CompactionInfo, DatastoreError> {
        self.compact_with(&crate::config::CompactionConfig::default())
    }

    /// Like `compact()`, but skips rotating and rewriting anything if
    /// fewer than `config.min_files_to_compact` channels are open, so a
    /// single freshly-created channel doesn't get compacted on its own.
    pub fn compact_with(&self, config: &crate::config::CompactionConfig) -> Result<CompactionInfo, DatastoreError> {
        self.require_serving()?;
        let channels = self.channels.lock().clone();
        if channels.len() < config.min_files_to_compact {
            let catalog = compaction::load_catalog(&self.layout)?;
            return Ok(CompactionInfo {
                wal_files_absorbed: 0,
                entries_written: 0,
                new_max_epoch_id: catalog.max_epoch_id,
            });
        }
        let mut rotated = Vec::new();
        for channel in &channels {
            let result = channel.rotate()?;
            rotated.push(result.rotated_path);
        }
        Ok(compaction::compact(&self.layout, &rotated)?)
    }

    /// `add_persistent_callback(fn)`: invoked at most once per durable
    /// epoch, in increasing order (§4.5).
    pub fn add_persistent_callback(&self, cb: impl Fn(EpochId) + Send + Sync + 'static) {
        self.epoch_tracker.set_callback(cb);
    }

    /// `remove_persistent_callback()`.
    pub fn remove_persistent_callback(&self) {
        self.epoch_tracker.remove_callback();
    }

    /// The manifest's parsed contents (format version, instance uuid).
    pub fn manifest(&self) -> &crate::manifest::ManifestContents {
        self.manifest.contents()
    }

    /// `(old_version, new_version)` if `recover()` migrated the manifest
    /// forward, `None` if it was already current.
    pub fn migration_info(&self) -> Option<(u32, u32)> {
        self.manifest.migration_info()
    }

    /// The BLOB registry, for spawning its GC thread or inspecting the
    /// persistent-id set directly.
    pub fn blob_registry(&self) -> &Arc<BlobRegistry> {
        &self.blob_registry
    }

    /// `shutdown()`: release replication resources and the manifest
    /// lock. Background threads owned by callers (the BLOB GC, any
    /// partitioned-cursor distributor) are joined via their own handles,
    /// not by this call, since their lifetimes aren't owned here.
    pub fn shutdown(self) {
        if let Some(replication) = &self.replication {
            replication.shutdown();
        }
        *self.state.lock() = LifecycleState::Recovering;
        warn!(dir = %self.layout.root().display(), "datastore shut down");
        self.manifest.release();
    }
}
