//! Epoch tracker (component E, §4.5).
//!
//! Computes the minimum in-flight epoch across all channels and
//! dispatches the durable-epoch callback. All state is a handful of
//! atomics plus a mutex around the callback slot; recomputation runs on
//! whichever caller thread triggered it (`switch_epoch` or the end of a
//! channel's session), not on a dedicated thread.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use epochwal_core::{EpochId, PathIoError};

use crate::channel::LogChannel;
use crate::config::EpochTrackerConfig;
use crate::scan;

/// Errors from the epoch tracker (§7).
#[derive(Debug, thiserror::Error)]
pub enum EpochError {
    /// `switch_epoch` was called with a value not greater than the
    /// current `epoch_id_switched`.
    #[error("switch_epoch({attempted}) is not greater than the current epoch {current}")]
    NotMonotonic {
        /// The epoch that was rejected.
        attempted: EpochId,
        /// The epoch already recorded as switched.
        current: EpochId,
    },
}

type Callback = dyn Fn(EpochId) + Send + Sync;

fn append_wal_history_line(path: &Path, epoch: EpochId, instance_uuid: Uuid) -> Result<(), PathIoError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let line = format!("{} {} {}\n", epoch.get(), instance_uuid, timestamp);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PathIoError::new(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| PathIoError::new(path, e))?;
    file.sync_all().map_err(|e| PathIoError::new(path, e))
}

/// Tracks `epoch_id_switched` / `epoch_id_to_be_recorded` /
/// `epoch_id_record_finished` / `epoch_id_informed` and drives the
/// durable-epoch callback (§4.5).
pub struct EpochTracker {
    epoch_file_path: PathBuf,
    wal_history_path: Option<PathBuf>,
    instance_uuid: Uuid,
    epoch_id_switched: AtomicU64,
    epoch_id_to_be_recorded: AtomicU64,
    epoch_id_record_finished: AtomicU64,
    epoch_id_informed: AtomicU64,
    callback: Mutex<Option<Arc<Callback>>>,
    finish_soon: Mutex<HashSet<usize>>,
    config: EpochTrackerConfig,
}

impl EpochTracker {
    /// Build a tracker seeded with `initial_epoch` (typically the max
    /// epoch seen by `recover()`).
    pub fn new(epoch_file_path: impl AsRef<Path>, initial_epoch: EpochId) -> Self {
        EpochTracker {
            epoch_file_path: epoch_file_path.as_ref().to_path_buf(),
            wal_history_path: None,
            instance_uuid: Uuid::nil(),
            epoch_id_switched: AtomicU64::new(initial_epoch.get()),
            epoch_id_to_be_recorded: AtomicU64::new(initial_epoch.get()),
            epoch_id_record_finished: AtomicU64::new(initial_epoch.get()),
            epoch_id_informed: AtomicU64::new(initial_epoch.get()),
            callback: Mutex::new(None),
            finish_soon: Mutex::new(HashSet::new()),
            config: EpochTrackerConfig::default(),
        }
    }

    /// Override the default `EpochTrackerConfig` (builder pattern).
    pub fn with_config(mut self, config: EpochTrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach `wal_history` appending (§3.3): every CAS-won durable-epoch
    /// advance appends one `(epoch_id, instance_uuid, timestamp)` line,
    /// tagged with the instance identity that produced it.
    pub fn with_wal_history(mut self, wal_history_path: impl AsRef<Path>, instance_uuid: Uuid) -> Self {
        self.wal_history_path = Some(wal_history_path.as_ref().to_path_buf());
        self.instance_uuid = instance_uuid;
        self
    }

    fn append_wal_history(&self, durable_epoch: EpochId) {
        let Some(path) = self.wal_history_path.as_ref() else {
            return;
        };
        if let Err(e) = append_wal_history_line(path, durable_epoch, self.instance_uuid) {
            // Advisory: a replica or debugger missing one history line
            // doesn't compromise durability, which the epoch file alone
            // already guarantees.
            error!(error = %e, "failed to append wal_history line");
        }
    }

    /// The most recent value accepted by `switch_epoch`.
    pub fn epoch_id_switched(&self) -> EpochId {
        EpochId::new(self.epoch_id_switched.load(Ordering::Acquire))
    }

    /// The last epoch whose boundary has been fsynced to the epoch file.
    pub fn epoch_id_record_finished(&self) -> EpochId {
        EpochId::new(self.epoch_id_record_finished.load(Ordering::Acquire))
    }

    /// The last epoch for which the persistent callback was invoked.
    pub fn epoch_id_informed(&self) -> EpochId {
        EpochId::new(self.epoch_id_informed.load(Ordering::Acquire))
    }

    /// Register the persistent callback, replacing any previous one.
    pub fn set_callback(&self, cb: impl Fn(EpochId) + Send + Sync + 'static) {
        *self.callback.lock() = Some(Arc::new(cb));
    }

    /// Remove the persistent callback. Synchronous: by the time this
    /// returns, no new invocation of the old callback can start (§4.5).
    pub fn remove_callback(&self) {
        *self.callback.lock() = None;
    }

    /// `switch_epoch(n)`: requires `n > epoch_id_switched`, then
    /// recomputes the durable epoch across `channels`.
    pub fn switch_epoch(&self, new_epoch: EpochId, channels: &[Arc<LogChannel>]) -> Result<(), EpochError> {
        let current = self.epoch_id_switched();
        if new_epoch <= current {
            return Err(EpochError::NotMonotonic {
                attempted: new_epoch,
                current,
            });
        }
        self.epoch_id_switched.store(new_epoch.get(), Ordering::Release);
        self.recompute(channels);
        Ok(())
    }

    /// Called after a channel's `end_session` completes, to recompute
    /// the durable epoch in case this channel was the laggard.
    pub fn on_session_end(&self, channels: &[Arc<LogChannel>]) {
        self.recompute(channels);
    }

    /// Hint that `channel_id`'s in-flight session is expected to end
    /// soon. Recomputation already runs synchronously on every
    /// `on_session_end`/`switch_epoch` call, so this doesn't change
    /// *when* the next recompute happens; it records the intent so a
    /// caller that can't wait for a fresh session-end event (tests, the
    /// replication hook) can force one via `on_session_end_for` instead
    /// of polling.
    pub fn request_finish_soon(&self, channel_id: usize) {
        self.finish_soon.lock().insert(channel_id);
    }

    /// Whether a `request_finish_soon` hint for `channel_id` is still
    /// pending (not yet consumed by `on_session_end_for`).
    pub fn has_pending_finish_soon(&self, channel_id: usize) -> bool {
        self.finish_soon.lock().contains(&channel_id)
    }

    /// Like `on_session_end`, but also consumes any `request_finish_soon`
    /// hint recorded for `channel_id`, forcing an immediate recompute
    /// regardless of whether the channel's session actually ended.
    pub fn on_session_end_for(&self, channel_id: usize, channels: &[Arc<LogChannel>]) {
        self.finish_soon.lock().remove(&channel_id);
        self.recompute(channels);
    }

    fn recompute(&self, channels: &[Arc<LogChannel>]) {
        let switched = self.epoch_id_switched();
        let min_in_flight = channels
            .iter()
            .map(|c| {
                if c.is_idle() {
                    c.finished_epoch()
                } else {
                    c.current_epoch()
                }
            })
            .min()
            .unwrap_or(switched);

        let durable = min_in_flight.saturating_prev().min(switched.saturating_prev());

        for attempt in 0u32.. {
            if attempt >= self.config.max_recompute_spins {
                warn!(attempt, "recompute CAS loop exceeded max_recompute_spins; yielding to the next caller");
                return;
            }
            let to_be_recorded = EpochId::new(self.epoch_id_to_be_recorded.load(Ordering::Acquire));
            if durable <= to_be_recorded {
                break;
            }
            if self
                .epoch_id_to_be_recorded
                .compare_exchange(
                    to_be_recorded.get(),
                    durable.get(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if let Err(e) = scan::write_epoch_file(&self.epoch_file_path, durable) {
                    error!(error = %e, "failed to persist durable epoch; durability cannot be guaranteed");
                    std::process::abort();
                }
                self.epoch_id_record_finished
                    .store(durable.get(), Ordering::Release);
                self.append_wal_history(durable);
                break;
            }
        }

        self.try_inform();
    }

    fn try_inform(&self) {
        for attempt in 0u32.. {
            if attempt >= self.config.max_recompute_spins {
                warn!(attempt, "try_inform CAS loop exceeded max_recompute_spins; yielding to the next caller");
                return;
            }
            let finished = self.epoch_id_record_finished();
            let informed = self.epoch_id_informed();
            if finished <= informed {
                break;
            }
            if self
                .epoch_id_informed
                .compare_exchange(informed.get(), finished.get(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Held across the call so `remove_callback` cannot return
                // while an invocation for the epoch it is removing is
                // still in flight.
                let guard = self.callback.lock();
                if let Some(cb) = guard.as_ref() {
                    if panic::catch_unwind(AssertUnwindSafe(|| cb(finished))).is_err() {
                        error!("persistent epoch callback panicked; ignoring");
                    }
                }
                drop(guard);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::LogDirLayout;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn make_channel(layout: &LogDirLayout, index: u32) -> Arc<LogChannel> {
        Arc::new(LogChannel::open(layout, index).unwrap())
    }

    #[test]
    fn durable_epoch_advances_only_once_every_channel_has_moved_past_it() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let fast = make_channel(&layout, 0);
        let slow = make_channel(&layout, 1);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO);

        fast.begin_session(EpochId::new(1)).unwrap();
        fast.end_session().unwrap();
        slow.begin_session(EpochId::new(1)).unwrap();
        // slow channel's session is still open.

        tracker
            .switch_epoch(EpochId::new(2), &[fast.clone(), slow.clone()])
            .unwrap();
        // slow is still mid-session at epoch 1, so durable can't pass epoch 0.
        assert_eq!(tracker.epoch_id_record_finished(), EpochId::ZERO);

        slow.end_session().unwrap();
        tracker.on_session_end(&[fast.clone(), slow.clone()]);
        // Both channels have only finished epoch 1; until one of them begins
        // epoch 2, epoch 1 itself isn't provably closed out.
        assert_eq!(tracker.epoch_id_record_finished(), EpochId::ZERO);

        fast.begin_session(EpochId::new(2)).unwrap();
        fast.end_session().unwrap();
        slow.begin_session(EpochId::new(2)).unwrap();
        slow.end_session().unwrap();
        tracker.on_session_end(&[fast, slow]);
        assert_eq!(tracker.epoch_id_record_finished(), EpochId::new(1));
    }

    #[test]
    fn switch_epoch_rejects_non_monotonic_values() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::new(5));
        let err = tracker.switch_epoch(EpochId::new(5), &[]).unwrap_err();
        assert!(matches!(err, EpochError::NotMonotonic { .. }));
    }

    #[test]
    fn callback_is_invoked_at_most_once_per_epoch() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        tracker.set_callback(move |_epoch| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        tracker.switch_epoch(EpochId::new(2), &[ch.clone()]).unwrap();
        // Nobody has begun epoch 2 on this channel yet, so durable can't
        // pass epoch 0; no invocation yet.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        ch.begin_session(EpochId::new(2)).unwrap();
        ch.end_session().unwrap();
        tracker.on_session_end(&[ch.clone()]);
        tracker.on_session_end(&[ch]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_callback_prevents_further_invocations() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        tracker.set_callback(move |_epoch| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        tracker.remove_callback();

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        ch.begin_session(EpochId::new(2)).unwrap();
        ch.end_session().unwrap();
        tracker.switch_epoch(EpochId::new(2), &[ch]).unwrap();

        assert_eq!(tracker.epoch_id_record_finished(), EpochId::new(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wal_history_gets_one_line_per_durable_advance() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let instance_uuid = Uuid::new_v4();
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO)
            .with_wal_history(layout.wal_history(), instance_uuid);

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        ch.begin_session(EpochId::new(2)).unwrap();
        ch.end_session().unwrap();
        tracker.switch_epoch(EpochId::new(2), &[ch]).unwrap();

        let text = std::fs::read_to_string(layout.wal_history()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("1 "));
        assert!(lines[0].contains(&instance_uuid.to_string()));
    }

    #[test]
    fn with_config_is_honored_for_ordinary_uncontended_recomputes() {
        use crate::config::EpochTrackerConfig;

        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO)
            .with_config(EpochTrackerConfig::for_testing());

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        ch.begin_session(EpochId::new(2)).unwrap();
        ch.end_session().unwrap();
        tracker.switch_epoch(EpochId::new(2), &[ch]).unwrap();

        // A single-channel, uncontended recompute converges in one CAS
        // attempt; a generous-but-bounded spin limit doesn't change that.
        assert_eq!(tracker.epoch_id_record_finished(), EpochId::new(1));
    }

    #[test]
    fn finish_soon_hint_is_consumed_by_on_session_end_for() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO);

        tracker.request_finish_soon(0);
        assert!(tracker.has_pending_finish_soon(0));

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        tracker.on_session_end_for(0, &[ch]);

        assert!(!tracker.has_pending_finish_soon(0));
    }

    #[test]
    fn wal_history_is_untouched_when_not_configured() {
        let dir = tempdir().unwrap();
        let layout = LogDirLayout::from_root(dir.path());
        layout.create_directories().unwrap();
        let ch = make_channel(&layout, 0);
        let tracker = EpochTracker::new(layout.epoch_file(), EpochId::ZERO);

        ch.begin_session(EpochId::new(1)).unwrap();
        ch.end_session().unwrap();
        ch.begin_session(EpochId::new(2)).unwrap();
        ch.end_session().unwrap();
        tracker.switch_epoch(EpochId::new(2), &[ch]).unwrap();

        assert!(!layout.wal_history().exists());
    }
}
