//! BLOB file resolver & pool (component C, §4.3).
//!
//! Assigns `blob_id`s, stages provisional payloads under `blob/<d1>/<d2>/`,
//! resolves an id to its path, tracks which ids are durable
//! (`persistent_blob_ids`), and sweeps payloads a background GC finds
//! unreferenced.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use tracing::{debug, warn};

use epochwal_core::{BlobId, BlobReferenceTag, PathIoError};

use crate::manifest::LogDirLayout;

type HmacSha256 = Hmac<Sha256>;

/// BLOB-specific failures (§7: `BlobIoError`, `BlobCryptoError`, `PoolReleased`).
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// I/O failure while registering or resolving a BLOB payload.
    #[error(transparent)]
    Io(#[from] PathIoError),

    /// The HMAC computation for a reference tag could not be completed.
    #[error("failed to compute blob reference tag")]
    Crypto,

    /// A pool method was called after `release()`.
    #[error("blob pool already released")]
    PoolReleased,
}

/// `resolve_path(blob_id) -> path`: deterministic two-level shard.
pub fn resolve_path(layout: &LogDirLayout, id: BlobId) -> PathBuf {
    let (d1, d2) = id.shard();
    layout
        .blob_dir()
        .join(format!("{:02x}", d1))
        .join(format!("{:02x}", d2))
        .join(format!("{}", id.get()))
}

/// Persisted high-water mark for blob id allocation, shared by the pool
/// factory and the garbage collector.
#[derive(Debug)]
pub struct BlobIdAllocator {
    next: AtomicU64,
}

impl BlobIdAllocator {
    /// Start allocation from `starting_at` (typically the value recovered
    /// from the last scan's `max_blob_id`, §4.7 step 4).
    pub fn starting_at(starting_at: u64) -> Self {
        BlobIdAllocator {
            next: AtomicU64::new(starting_at),
        }
    }

    /// Allocate the next id, monotone for the lifetime of the instance.
    pub fn allocate(&self) -> BlobId {
        BlobId::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// The current high-water mark (last allocated id + 1).
    pub fn high_water_mark(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Per-instance secret used to derive [`BlobReferenceTag`]s (§3.1).
/// Never persisted; regenerated fresh whenever it isn't supplied.
#[derive(Clone)]
pub struct BlobSecretKey(Arc<[u8; 32]>);

impl BlobSecretKey {
    /// Generate a fresh key from a CSPRNG. Callers must not derive this
    /// from anything persisted in the manifest (§3.1: the secret backs an
    /// authorization token and must stay unrecoverable from on-disk state).
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        key[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        key[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        BlobSecretKey(Arc::new(key))
    }

    /// `generate_reference_tag(id, tx)`: HMAC-SHA-256 of `(blob_id,
    /// transaction_id)` truncated to 8 bytes.
    pub fn generate_reference_tag(
        &self,
        blob_id: BlobId,
        transaction_id: u64,
    ) -> Result<BlobReferenceTag, BlobError> {
        let mut mac = HmacSha256::new_from_slice(self.0.as_slice()).map_err(|_| BlobError::Crypto)?;
        mac.update(&blob_id.get().to_le_bytes());
        mac.update(&transaction_id.to_le_bytes());
        let result = mac.finalize().into_bytes();
        let mut tag_bytes = [0u8; 8];
        tag_bytes.copy_from_slice(&result[..8]);
        Ok(BlobReferenceTag(u64::from_le_bytes(tag_bytes)))
    }
}

/// The set of `blob_id`s that have appeared in a durable
/// `normal_with_blob` record (§4.3). Guarded by its own mutex so the GC
/// can take a shared read without blocking writers (§5).
#[derive(Default)]
pub struct PersistentBlobIds {
    ids: Mutex<HashSet<u64>>,
}

impl PersistentBlobIds {
    /// Build from the set recovered by a scan (§4.7 step 4).
    pub fn from_recovered(ids: impl IntoIterator<Item = BlobId>) -> Self {
        PersistentBlobIds {
            ids: Mutex::new(ids.into_iter().map(|id| id.get()).collect()),
        }
    }

    /// `add_persistent_blob_ids(ids)`.
    pub fn add_persistent_blob_ids(&self, ids: &[BlobId]) {
        let mut guard = self.ids.lock();
        for id in ids {
            guard.insert(id.get());
        }
    }

    /// `check_and_remove_persistent_blob_ids(ids)`: atomically removes
    /// found ids, returns the not-found subset.
    pub fn check_and_remove_persistent_blob_ids(&self, ids: &[BlobId]) -> Vec<BlobId> {
        let mut guard = self.ids.lock();
        let mut missing = Vec::new();
        for id in ids {
            if !guard.remove(&id.get()) {
                missing.push(*id);
            }
        }
        missing
    }

    /// Snapshot of the current set, for GC and tests.
    pub fn snapshot(&self) -> HashSet<u64> {
        self.ids.lock().clone()
    }

    /// Whether `id` is currently tracked as persistent.
    pub fn contains(&self, id: BlobId) -> bool {
        self.ids.lock().contains(&id.get())
    }
}

/// A transaction-scoped registry of provisional blobs (§4.3
/// `acquire_pool`). Ids registered through a pool are candidates for GC
/// until promoted into a durable `normal_with_blob` record.
pub struct BlobPool {
    layout: LogDirLayout,
    allocator: Arc<BlobIdAllocator>,
    live_provisional: Arc<Mutex<HashSet<u64>>>,
    owned: Mutex<HashSet<u64>>,
    released: std::sync::atomic::AtomicBool,
}

impl BlobPool {
    pub(crate) fn new(
        layout: LogDirLayout,
        allocator: Arc<BlobIdAllocator>,
        live_provisional: Arc<Mutex<HashSet<u64>>>,
    ) -> Self {
        BlobPool {
            layout,
            allocator,
            live_provisional,
            owned: Mutex::new(HashSet::new()),
            released: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_released(&self) -> Result<(), BlobError> {
        if self.released.load(Ordering::Acquire) {
            return Err(BlobError::PoolReleased);
        }
        Ok(())
    }

    /// `register_file(src, is_temp) -> blob_id`. Moves the file into
    /// place if `is_temp` (the caller's scratch copy), otherwise copies
    /// it so the caller's original survives.
    pub fn register_file(&self, src: &Path, is_temp: bool) -> Result<BlobId, BlobError> {
        self.check_released()?;
        let id = self.allocator.allocate();
        let dest = resolve_path(&self.layout, id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PathIoError::new(parent, e))?;
        }
        if is_temp {
            fs::rename(src, &dest).or_else(|_| fs::copy(src, &dest).map(|_| ()))
        } else {
            fs::copy(src, &dest).map(|_| ())
        }
        .map_err(|e| PathIoError::new(&dest, e))?;
        self.mark_provisional(id);
        Ok(id)
    }

    /// `register_data(bytes) -> blob_id`.
    pub fn register_data(&self, bytes: &[u8]) -> Result<BlobId, BlobError> {
        self.check_released()?;
        let id = self.allocator.allocate();
        let dest = resolve_path(&self.layout, id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PathIoError::new(parent, e))?;
        }
        let mut file = File::create(&dest).map_err(|e| PathIoError::new(&dest, e))?;
        file.write_all(bytes).map_err(|e| PathIoError::new(&dest, e))?;
        file.sync_all().map_err(|e| PathIoError::new(&dest, e))?;
        self.mark_provisional(id);
        Ok(id)
    }

    /// `duplicate(id) -> id`: copy an existing blob's payload under a
    /// fresh id, also tracked as provisional by this pool.
    pub fn duplicate(&self, id: BlobId) -> Result<BlobId, BlobError> {
        self.check_released()?;
        let src = resolve_path(&self.layout, id);
        let new_id = self.allocator.allocate();
        let dest = resolve_path(&self.layout, new_id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| PathIoError::new(parent, e))?;
        }
        fs::copy(&src, &dest).map_err(|e| PathIoError::new(&dest, e))?;
        self.mark_provisional(new_id);
        Ok(new_id)
    }

    fn mark_provisional(&self, id: BlobId) {
        self.owned.lock().insert(id.get());
        self.live_provisional.lock().insert(id.get());
    }

    /// `release()`: idempotent. Drops this pool's provisional-ness claim
    /// on every id it registered; ids not subsequently promoted to
    /// persistent become GC candidates.
    pub fn release(&self) {
        if self
            .released
            .swap(true, Ordering::AcqRel)
        {
            return;
        }
        let owned = self.owned.lock();
        let mut live = self.live_provisional.lock();
        for id in owned.iter() {
            live.remove(id);
        }
    }

    /// The ids this pool registered, whether or not it has released.
    pub fn registered_ids(&self) -> Vec<BlobId> {
        self.owned.lock().iter().map(|&id| BlobId::new(id)).collect()
    }
}

impl Drop for BlobPool {
    fn drop(&mut self) {
        self.release();
    }
}

/// Factory for transaction-scoped [`BlobPool`]s, plus the background
/// garbage collector (§4.3).
pub struct BlobRegistry {
    layout: LogDirLayout,
    allocator: Arc<BlobIdAllocator>,
    live_provisional: Arc<Mutex<HashSet<u64>>>,
    persistent: Arc<PersistentBlobIds>,
    secret: BlobSecretKey,
}

impl BlobRegistry {
    /// Build a registry rooted at `layout`, with the blob id allocator
    /// seeded from recovery's `max_blob_id` and the persistent set seeded
    /// from recovery's surviving `normal_with_blob` records.
    ///
    /// The reference-tag secret defaults to a freshly generated key, never
    /// persisted anywhere; call [`BlobRegistry::with_secret_key`] to supply
    /// one explicitly (e.g. for a test that needs reproducible tags).
    pub fn new(
        layout: LogDirLayout,
        starting_blob_id: u64,
        persistent_ids: impl IntoIterator<Item = BlobId>,
    ) -> Self {
        BlobRegistry {
            layout,
            allocator: Arc::new(BlobIdAllocator::starting_at(starting_blob_id)),
            live_provisional: Arc::new(Mutex::new(HashSet::new())),
            persistent: Arc::new(PersistentBlobIds::from_recovered(persistent_ids)),
            secret: BlobSecretKey::generate(),
        }
    }

    /// Replace the reference-tag secret.
    pub fn with_secret_key(mut self, key: BlobSecretKey) -> Self {
        self.secret = key;
        self
    }

    /// `generate_reference_tag(id, tx)` (§3.1): deterministic within this
    /// instance, differs across instances since each derives its secret
    /// from its own manifest uuid.
    pub fn generate_reference_tag(
        &self,
        blob_id: BlobId,
        transaction_id: u64,
    ) -> Result<BlobReferenceTag, BlobError> {
        self.secret.generate_reference_tag(blob_id, transaction_id)
    }

    /// `acquire_pool() -> Pool`.
    pub fn acquire_pool(&self) -> BlobPool {
        BlobPool::new(
            self.layout.clone(),
            Arc::clone(&self.allocator),
            Arc::clone(&self.live_provisional),
        )
    }

    /// The `persistent_blob_ids` set.
    pub fn persistent_ids(&self) -> &Arc<PersistentBlobIds> {
        &self.persistent
    }

    /// The blob id allocator (exposed so the datastore can report the
    /// high-water mark it must persist across restarts, §9 open question).
    pub fn allocator(&self) -> &Arc<BlobIdAllocator> {
        &self.allocator
    }

    /// Run one garbage-collection sweep: remove every blob file whose id
    /// is neither persistent nor held by a live pool and whose id is
    /// `<=` the current high-water mark.
    ///
    /// Returns the number of files removed.
    pub fn sweep_once(&self) -> Result<usize, BlobError> {
        let blob_dir = self.layout.blob_dir();
        if !blob_dir.exists() {
            return Ok(0);
        }
        let hwm = self.allocator.high_water_mark();
        let live = self.live_provisional.lock().clone();
        let persistent = self.persistent.snapshot();

        let mut removed = 0;
        for d1 in read_dir_ok(&blob_dir)? {
            if !d1.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for d2 in read_dir_ok(&d1.path())? {
                if !d2.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                for file in read_dir_ok(&d2.path())? {
                    let name = file.file_name();
                    let id: u64 = match name.to_string_lossy().parse() {
                        Ok(id) => id,
                        Err(_) => continue,
                    };
                    if id > hwm {
                        continue;
                    }
                    if persistent.contains(&id) || live.contains(&id) {
                        continue;
                    }
                    if fs::remove_file(file.path()).is_ok() {
                        removed += 1;
                        debug!(blob_id = id, "garbage collected unreferenced blob");
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Spawn the background GC thread, running `sweep_once` on the given
    /// interval until the returned handle is joined.
    pub fn spawn_gc_thread(self: &Arc<Self>, interval: std::time::Duration) -> GcHandle {
        let registry = Arc::clone(self);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("epochwal-blob-gc".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::Acquire) {
                    if let Err(e) = registry.sweep_once() {
                        warn!(error = %e, "blob gc sweep failed");
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("spawning blob gc thread");
        GcHandle {
            stop,
            join: Some(join),
        }
    }
}

fn read_dir_ok(path: &Path) -> Result<Vec<fs::DirEntry>, BlobError> {
    Ok(fs::read_dir(path)
        .map_err(|e| PathIoError::new(path, e))?
        .filter_map(|r| r.ok())
        .collect())
}

/// Joinable handle to the background blob GC thread (§5: "joinable at
/// shutdown").
pub struct GcHandle {
    stop: Arc<std::sync::atomic::AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl GcHandle {
    /// Signal the GC thread to stop and join it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
