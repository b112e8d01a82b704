//! Shared identifiers, record types, and error primitives for `epochwal`.
//!
//! This crate is the dependency leaf of the workspace: it defines the
//! data model every other component is built from —
//!
//! - [`ids`]: `StorageId`, `EpochId`, `WriteVersion`, `BlobId`,
//!   `BlobReferenceTag` (§3.1).
//! - [`record`]: the ten-tag log alphabet and the decoded [`record::Entry`]
//!   representation (§3.2), plus the `key_sid`/`value_etc` sort helpers.
//! - [`error`]: the `(path, errno)` shape shared by every component's
//!   `IoError` variant, and the failure-class taxonomy of §7.
//!
//! Nothing here touches disk; encoding, file layout, and concurrency are
//! owned by `epochwal-durability`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ids;
pub mod record;

pub use error::{FailureClass, PathIoError};
pub use ids::{BlobId, BlobReferenceTag, EpochId, StorageId, WriteVersion};
pub use record::{Entry, EntryKind};
