//! Partitioned-cursor distributor (component K, §4.11).
//!
//! A read-side fan-out for `get_partitioned_cursors(n)`: one dedicated
//! thread drains the underlying merging cursor in batches and
//! round-robins them across `n` bounded queues, so independent readers
//! can each walk a disjoint slice of the keyspace without contending on
//! the shared cursor.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use epochwal_core::BlobId;
use epochwal_core::StorageId;

use crate::snapshot::{CursorEntry, EntryType, MergingCursor};

const BATCH_SIZE: usize = 64;
const QUEUE_CAPACITY: usize = 256;
const SEND_RETRY_BACKOFF: Duration = Duration::from_micros(200);
const MAX_SEND_RETRIES: usize = 50;

enum Message {
    Entry(CursorEntry),
    End,
}

/// Owns the distributor thread. Dropping it joins the thread, which
/// happens once every queue has been drained to its end-marker (or the
/// receivers have all been dropped, which closes the channels and lets
/// the thread's sends fail out instead of block forever).
pub struct PartitionedCursorDistributor {
    worker: Option<JoinHandle<()>>,
}

impl PartitionedCursorDistributor {
    /// Spawn the distributor over `cursor`, returning the shared handle
    /// and the `n` partitioned read cursors.
    pub fn spawn(cursor: MergingCursor, n: usize) -> (Arc<Self>, Vec<PartitionedCursor>) {
        assert!(n > 0, "a partitioned-cursor distributor needs at least one partition");

        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = sync_channel(QUEUE_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }

        let worker = std::thread::Builder::new()
            .name("partitioned-cursor-distributor".to_string())
            .spawn(move || run_distributor(cursor, senders))
            .expect("failed to spawn partitioned-cursor distributor thread");

        let cursors = receivers
            .into_iter()
            .map(|rx| PartitionedCursor {
                rx,
                current: None,
                exhausted: false,
            })
            .collect();

        (
            Arc::new(PartitionedCursorDistributor {
                worker: Some(worker),
            }),
            cursors,
        )
    }
}

impl Drop for PartitionedCursorDistributor {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn send_with_retries(tx: &SyncSender<Message>, mut msg: Message) {
    for _ in 0..MAX_SEND_RETRIES {
        match tx.try_send(msg) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                msg = returned;
                std::thread::sleep(SEND_RETRY_BACKOFF);
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
    // The consumer fell far behind bounded retries; block rather than
    // drop the record, since dropping would violate cursor semantics.
    let _ = tx.send(msg);
}

fn run_distributor(mut cursor: MergingCursor, senders: Vec<SyncSender<Message>>) {
    let n = senders.len();
    let mut next = 0usize;
    'outer: loop {
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for _ in 0..BATCH_SIZE {
            match cursor.next() {
                Ok(true) => batch.push(CursorEntry {
                    storage_id: cursor.storage().expect("next() returned true"),
                    key: cursor.key().expect("next() returned true").to_vec(),
                    value: cursor.value().expect("next() returned true").to_vec(),
                    entry_type: cursor.entry_type().expect("next() returned true"),
                    blob_ids: cursor.blob_ids().to_vec(),
                }),
                Ok(false) => {
                    for entry in batch {
                        send_with_retries(&senders[next], Message::Entry(entry));
                        next = (next + 1) % n;
                    }
                    break 'outer;
                }
                Err(e) => {
                    warn!(error = %e, "partitioned-cursor distributor stopping early: underlying scan failed");
                    for entry in batch {
                        send_with_retries(&senders[next], Message::Entry(entry));
                        next = (next + 1) % n;
                    }
                    break 'outer;
                }
            }
        }
        for entry in batch {
            send_with_retries(&senders[next], Message::Entry(entry));
            next = (next + 1) % n;
        }
    }
    cursor.close();
    for sender in &senders {
        let _ = sender.send(Message::End);
    }
}

/// One of the `n` read handles returned by `spawn`.
pub struct PartitionedCursor {
    rx: Receiver<Message>,
    current: Option<CursorEntry>,
    exhausted: bool,
}

impl PartitionedCursor {
    /// Advance to the next record on this partition. Returns `false`
    /// once the distributor's end-marker has been seen.
    pub fn next(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        match self.rx.recv() {
            Ok(Message::Entry(entry)) => {
                self.current = Some(entry);
                true
            }
            Ok(Message::End) | Err(_) => {
                self.current = None;
                self.exhausted = true;
                false
            }
        }
    }

    /// `storage()`.
    pub fn storage(&self) -> Option<StorageId> {
        self.current.as_ref().map(|e| e.storage_id)
    }

    /// `key(buf)`.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.key.as_slice())
    }

    /// `value(buf)`.
    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.value.as_slice())
    }

    /// `type()`.
    pub fn entry_type(&self) -> Option<EntryType> {
        self.current.as_ref().map(|e| e.entry_type)
    }

    /// `blob_ids()`.
    pub fn blob_ids(&self) -> &[BlobId] {
        self.current
            .as_ref()
            .map(|e| e.blob_ids.as_slice())
            .unwrap_or(&[])
    }

    /// `close()`.
    pub fn close(&mut self) {
        self.exhausted = true;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::write_snapshot;
    use epochwal_core::{Entry, StorageId as Sid, WriteVersion};
    use tempfile::tempdir;

    fn make_cursor(entries: &[Entry]) -> MergingCursor {
        let dir = tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot");
        write_snapshot(&snapshot_path, entries, false).unwrap();
        let compacted_path = dir.path().join("compacted");
        // Keep `dir` alive by leaking it for the duration of the test;
        // the cursor only needs the files, not the directory handle.
        std::mem::forget(dir);
        MergingCursor::open(&snapshot_path, &compacted_path).unwrap()
    }

    #[test]
    fn every_entry_is_delivered_exactly_once_across_partitions() {
        let entries: Vec<Entry> = (0..20)
            .map(|i| Entry::Normal {
                storage_id: Sid::new(1),
                key: format!("k{:03}", i).into_bytes(),
                value: format!("v{}", i).into_bytes(),
                write_version: WriteVersion::new(1, i as u64),
            })
            .collect();
        let cursor = make_cursor(&entries);

        let (_distributor, mut cursors) = PartitionedCursorDistributor::spawn(cursor, 3);
        let mut total = 0usize;
        for c in cursors.iter_mut() {
            while c.next() {
                total += 1;
            }
        }
        assert_eq!(total, 20);
    }

    #[test]
    fn empty_cursor_ends_every_partition_immediately() {
        let cursor = make_cursor(&[]);
        let (_distributor, mut cursors) = PartitionedCursorDistributor::spawn(cursor, 4);
        for c in cursors.iter_mut() {
            assert!(!c.next());
        }
    }

    #[test]
    fn single_partition_sees_every_entry_in_order() {
        let entries: Vec<Entry> = (0..5)
            .map(|i| Entry::Normal {
                storage_id: Sid::new(1),
                key: format!("k{}", i).into_bytes(),
                value: Vec::new(),
                write_version: WriteVersion::new(1, i as u64),
            })
            .collect();
        let cursor = make_cursor(&entries);
        let (_distributor, mut cursors) = PartitionedCursorDistributor::spawn(cursor, 1);
        let only = &mut cursors[0];
        let mut keys = Vec::new();
        while only.next() {
            keys.push(only.key().unwrap().to_vec());
        }
        assert_eq!(
            keys,
            vec![b"k0".to_vec(), b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec(), b"k4".to_vec()]
        );
    }
}
