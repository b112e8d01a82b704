//! Error taxonomy shared by every layer of the durability core (§7).
//!
//! Each component (codec, manifest, blob, channel, scan, compaction,
//! snapshot, ...) defines its own `thiserror` enum for the failures that
//! are local to it; this module holds the pieces that are genuinely
//! shared — the `(path, errno)` shape every `IoError` takes, and the
//! taxonomy tags used to classify a failure for the propagation policy
//! of §7 (repair transparently / propagate synchronously / log-and-abort).

use std::io;
use std::path::{Path, PathBuf};

/// An I/O failure tied to the file it occurred on.
///
/// Every component-local error enum wraps this rather than a bare
/// [`std::io::Error`] so that the failing path survives to the log line
/// a background thread emits before it aborts the process (§5, §7).
#[derive(Debug, thiserror::Error)]
#[error("io error at {path}: {source}")]
pub struct PathIoError {
    /// The file or directory the operation was performed against.
    pub path: PathBuf,
    /// The underlying OS error.
    #[source]
    pub source: io::Error,
}

impl PathIoError {
    /// Wrap an I/O error with the path that caused it.
    pub fn new(path: impl AsRef<Path>, source: io::Error) -> Self {
        PathIoError {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Severity class a failure is propagated under (§7 propagation policy).
///
/// Not carried on the error types themselves (each component's enum is
/// authoritative); this exists so call sites and tests can assert on the
/// *policy* a given error kind falls under without matching every
/// variant of every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transparently repaired by the component itself (e.g. a missing
    /// catalog backup promoted from the primary).
    Repaired,
    /// Propagates synchronously to the caller that initiated the
    /// durability-affecting operation.
    Propagated,
    /// Logged with file path and errno, then the process aborts; this
    /// layer cannot recover lost WAL durability.
    FatalAbort,
}
