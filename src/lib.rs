//! # epochwal
//!
//! Epoch-based write-ahead-log durability engine for a transactional
//! database core: the append pipeline, the recovery/snapshot builder,
//! the BLOB lifecycle, and log-file compaction.
//!
//! ```no_run
//! use epochwal::{Datastore, EpochId, StorageId, WriteVersion};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (datastore, _report) = Datastore::recover("./data".into())?;
//!     datastore.ready();
//!     let channel = datastore.create_channel()?;
//!     channel.begin_session(EpochId::new(1))?;
//!     channel.add_entry(StorageId::new(1), b"key", b"value", WriteVersion::new(1, 0))?;
//!     channel.end_session()?;
//!     datastore.on_channel_session_end();
//!     Ok(())
//! }
//! ```
//!
//! Internal crates (`epochwal-core`, `epochwal-durability`) are
//! implementation detail; only the surface re-exported here is stable.

pub use epochwal_core::{
    BlobId, BlobReferenceTag, Entry, EntryKind, EpochId, FailureClass, PathIoError, StorageId,
    WriteVersion,
};
pub use epochwal_durability::{
    Backup, BlobError, BlobPool, BlobRegistry, ChannelError, CompactionCatalog, CompactionConfig,
    CompactionError, CompactionInfo, ConfigError, Datastore, DatastoreError, DecodeError,
    DurabilityError, EpochError, EpochTracker, EpochTrackerConfig, GcHandle, LogChannel,
    LogChannelConfig, LogDirLayout, ManifestContents, ManifestError, ManifestHandle, MergeBackend,
    MergingCursor as Cursor, MergingCursor, PartitionedCursor, PartitionedCursorDistributor,
    RecoveryReport, ReplicationClient, ReplicationConfig, RotationResult, ScanError, ScanResult,
    SessionBoundary, SessionState, Snapshot, SnapshotError,
};
