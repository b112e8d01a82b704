//! Per-subsystem tunables.
//!
//! Each durability subsystem that has a knob worth exposing gets a small
//! config struct here: a `Default`, a builder, a `validate()`, and a
//! `for_testing()` constructor that trades safety margins for faster
//! tests. None of these are required to construct the subsystem they
//! tune — every constructor that takes one also has a config-free path
//! that uses `Default::default()`.

/// Errors from `validate()` on any of the configs in this module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// `LogChannelConfig::rotation_threshold_bytes` was below the floor.
    #[error("rotation_threshold_bytes must be at least {min} bytes, got {actual}")]
    RotationThresholdTooSmall {
        /// The configured value.
        actual: u64,
        /// The minimum accepted value.
        min: u64,
    },
    /// `EpochTrackerConfig::max_recompute_spins` was zero.
    #[error("max_recompute_spins must be at least 1")]
    MaxRecomputeSpinsZero,
    /// `CompactionConfig::min_files_to_compact` was zero.
    #[error("min_files_to_compact must be at least 1")]
    MinFilesToCompactZero,
}

/// Tunables for [`crate::channel::LogChannel`].
#[derive(Debug, Clone, Copy)]
pub struct LogChannelConfig {
    /// Advisory size, in bytes, above which a caller driving rotation
    /// policy (the datastore, a background task) should call
    /// `LogChannel::rotate()`. The channel itself never auto-rotates;
    /// see [`crate::channel::LogChannel::should_rotate`].
    pub rotation_threshold_bytes: u64,
}

impl Default for LogChannelConfig {
    fn default() -> Self {
        LogChannelConfig {
            rotation_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

impl LogChannelConfig {
    /// Defaults, as a starting point for `with_*` builders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rotation threshold (builder pattern).
    pub fn with_rotation_threshold_bytes(mut self, bytes: u64) -> Self {
        self.rotation_threshold_bytes = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN: u64 = 4096;
        if self.rotation_threshold_bytes < MIN {
            return Err(ConfigError::RotationThresholdTooSmall {
                actual: self.rotation_threshold_bytes,
                min: MIN,
            });
        }
        Ok(())
    }

    /// A configuration with a small rotation threshold so tests can
    /// exercise rotation without writing tens of megabytes.
    pub fn for_testing() -> Self {
        LogChannelConfig {
            rotation_threshold_bytes: 4096,
        }
    }
}

/// Tunables for [`crate::epoch::EpochTracker`].
#[derive(Debug, Clone, Copy)]
pub struct EpochTrackerConfig {
    /// Upper bound on the CAS-retry loops in `recompute`/`try_inform`.
    /// Under ordinary contention these loops converge in a handful of
    /// iterations; the bound exists only to turn a theoretical
    /// livelock into a logged, recoverable no-op instead of a hang.
    pub max_recompute_spins: u32,
}

impl Default for EpochTrackerConfig {
    fn default() -> Self {
        EpochTrackerConfig {
            max_recompute_spins: 10_000,
        }
    }
}

impl EpochTrackerConfig {
    /// Defaults, as a starting point for `with_*` builders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CAS-loop spin bound (builder pattern).
    pub fn with_max_recompute_spins(mut self, spins: u32) -> Self {
        self.max_recompute_spins = spins;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recompute_spins == 0 {
            return Err(ConfigError::MaxRecomputeSpinsZero);
        }
        Ok(())
    }

    /// A configuration with a small spin bound so a stuck CAS loop in a
    /// test fails fast instead of spinning for the duration of the run.
    pub fn for_testing() -> Self {
        EpochTrackerConfig {
            max_recompute_spins: 64,
        }
    }
}

/// Tunables for [`crate::compaction::compact`].
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Compaction is skipped (and `compact()` becomes a no-op reporting
    /// zero files absorbed) unless at least this many rotated files are
    /// available, so a single freshly-rotated file doesn't get rewritten
    /// on its own the moment it appears.
    pub min_files_to_compact: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            min_files_to_compact: 1,
        }
    }
}

impl CompactionConfig {
    /// Defaults, as a starting point for `with_*` builders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum rotated-file count (builder pattern).
    pub fn with_min_files_to_compact(mut self, min_files: usize) -> Self {
        self.min_files_to_compact = min_files;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_files_to_compact == 0 {
            return Err(ConfigError::MinFilesToCompactZero);
        }
        Ok(())
    }

    /// A configuration that compacts as soon as a single file is
    /// available, for tests that want deterministic, immediate
    /// compaction.
    pub fn for_testing() -> Self {
        CompactionConfig {
            min_files_to_compact: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_channel_config_defaults_validate() {
        assert!(LogChannelConfig::default().validate().is_ok());
        assert!(LogChannelConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn log_channel_config_rejects_tiny_threshold() {
        let cfg = LogChannelConfig::new().with_rotation_threshold_bytes(10);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RotationThresholdTooSmall { .. })
        ));
    }

    #[test]
    fn epoch_tracker_config_rejects_zero_spins() {
        let cfg = EpochTrackerConfig::new().with_max_recompute_spins(0);
        assert_eq!(cfg.validate(), Err(ConfigError::MaxRecomputeSpinsZero));
    }

    #[test]
    fn compaction_config_rejects_zero_min_files() {
        let cfg = CompactionConfig::new().with_min_files_to_compact(0);
        assert_eq!(cfg.validate(), Err(ConfigError::MinFilesToCompactZero));
    }

    #[test]
    fn for_testing_configs_are_cheaper_than_defaults() {
        assert!(
            LogChannelConfig::for_testing().rotation_threshold_bytes
                < LogChannelConfig::default().rotation_threshold_bytes
        );
        assert!(
            EpochTrackerConfig::for_testing().max_recompute_spins
                < EpochTrackerConfig::default().max_recompute_spins
        );
    }
}
