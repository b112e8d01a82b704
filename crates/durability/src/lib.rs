//! Epoch-based WAL durability engine for `epochwal`.
//!
//! This crate implements three coupled subsystems, plus the compaction
//! concern that mutates the on-disk WAL set alongside them:
//!
//! - The **durability pipeline**: [`codec`] (component A) frames
//!   individual records; [`manifest`] (B) owns the log directory and its
//!   single-writer lock; [`blob`] (C) is the BLOB registry; [`channel`]
//!   (D) is the per-writer append stream; [`epoch`] (E) computes the
//!   minimum in-flight epoch and dispatches durability callbacks;
//!   [`datastore`] (F) composes all of the above behind one façade.
//! - The **recovery/snapshot builder**: [`scan`] (G) parses the WAL set
//!   into a key-ordered, version-resolved stream; [`snapshot`] (H)
//!   materializes it to `data/snapshot` and exposes cursors over it;
//!   [`distributor`] (K) fans a cursor out to parallel consumers.
//! - **Compaction** ([`compaction`], component I) replaces a set of
//!   rotated WAL files with one compacted file, reusing the sort core
//!   of G.
//! - The **replication hook** ([`replication`], component J) mirrors
//!   appended records and group-commit barriers to an optional replica;
//!   failures there are advisory and never propagate to the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod channel;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod datastore;
pub mod distributor;
pub mod epoch;
pub mod manifest;
pub mod replication;
pub mod scan;
pub mod snapshot;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use blob::{BlobError, BlobPool, BlobRegistry, GcHandle};
pub use channel::{ChannelError, LogChannel, RotationResult, SessionState};
pub use codec::DecodeError;
pub use compaction::{CompactionCatalog, CompactionError, CompactionInfo};
pub use config::{CompactionConfig, ConfigError, EpochTrackerConfig, LogChannelConfig};
pub use datastore::{Backup, Datastore, DatastoreError, RecoveryReport, Snapshot};
pub use distributor::{PartitionedCursor, PartitionedCursorDistributor};
pub use epoch::{EpochError, EpochTracker};
pub use manifest::{LogDirLayout, ManifestContents, ManifestError, ManifestHandle};
pub use replication::{ReplicationClient, ReplicationConfig, SessionBoundary};
pub use scan::{MergeBackend, ScanError, ScanResult};
pub use snapshot::{EntryType, FileCursor, MergingCursor, SnapshotError};

/// Crate-wide aggregate error. Most call sites work with the
/// module-local error types directly (`ChannelError`, `ScanError`, ...);
/// this exists for callers that want one `Result` type across the whole
/// durability surface, matching the teacher crate's `ConfigError`/
/// top-level aggregate pattern.
#[derive(Debug, thiserror::Error)]
pub enum DurabilityError {
    /// Manifest acquisition or migration failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A log channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The epoch tracker rejected an operation.
    #[error(transparent)]
    Epoch(#[from] EpochError),
    /// A BLOB pool or registry operation failed.
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// The WAL scan/sort pass failed.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Snapshot construction or cursor iteration failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Compaction failed.
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    /// Record decoding failed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A config struct failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The datastore façade failed; boxed because `DatastoreError`
    /// itself wraps most of the variants above and `thiserror` rejects
    /// a `#[from]` cycle between the two enums.
    #[error(transparent)]
    Datastore(#[from] Box<datastore::DatastoreError>),
}
