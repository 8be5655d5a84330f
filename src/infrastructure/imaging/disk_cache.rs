//! Disk-based cache of encoded image bytes.
//!
//! Every asynchronous operation is queued onto one dedicated I/O thread, so writes, deletes
//! and cleanup sweeps never interleave. The `*_blocking` variants run on the caller's thread
//! under the same I/O lock.

use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{ImageError, ImageResult};

/// Default maximum age of a cached file: one week.
pub const DEFAULT_MAX_DISK_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Default disk budget: 0, unlimited.
pub const DEFAULT_MAX_DISK_SIZE: u64 = 0;

/// Age and size limits enforced by [`DiskCache::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLimits {
    /// Files whose modification time is older than this are always removed.
    pub max_age: Duration,
    /// Total byte budget, `0` for unlimited. Over budget, cleanup frees down to half of it.
    pub max_size: u64,
}

impl Default for DiskLimits {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_DISK_AGE,
            max_size: DEFAULT_MAX_DISK_SIZE,
        }
    }
}

/// File count and byte total of the writable root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskSize {
    /// Number of files.
    pub file_count: usize,
    /// Sum of file sizes in bytes.
    pub total_bytes: u64,
}

/// What a cleanup sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Files removed because they were older than the age limit.
    pub expired: usize,
    /// Files removed to get back under the size limit.
    pub evicted: usize,
    /// Bytes freed by both phases.
    pub freed_bytes: u64,
    /// Bytes remaining after the sweep.
    pub remaining_bytes: u64,
}

type DiskJob = Box<dyn FnOnce(&DiskStore) + Send>;

/// Result of an operation queued on the disk I/O thread.
///
/// Awaiting it yields the outcome; dropping it leaves the operation running.
pub struct Pending<T> {
    rx: oneshot::Receiver<ImageResult<T>>,
}

impl<T> Pending<T> {
    /// An already completed operation.
    pub fn ready(value: ImageResult<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }
}

impl<T> Future for Pending<T> {
    type Output = ImageResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(ImageError::filesystem("disk cache worker stopped")))
        })
    }
}

/// Disk-based image cache with one writable root and optional read-only roots.
pub struct DiskCache {
    store: Arc<DiskStore>,
    jobs: mpsc::UnboundedSender<DiskJob>,
}

impl DiskCache {
    /// Creates a disk cache rooted at `root` and starts its I/O thread.
    ///
    /// The root directory is created lazily on first write.
    ///
    /// # Errors
    /// Returns error if the I/O thread cannot be spawned.
    pub fn new(root: PathBuf, limits: DiskLimits) -> ImageResult<Self> {
        let store = Arc::new(DiskStore {
            root,
            read_only_roots: RwLock::new(Vec::new()),
            limits: Mutex::new(limits),
            io_lock: Mutex::new(()),
        });

        let (jobs, mut rx) = mpsc::unbounded_channel::<DiskJob>();
        let worker_store = store.clone();
        std::thread::Builder::new()
            .name("webimage-disk-io".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&worker_store);
                }
                trace!(root = %worker_store.root.display(), "Disk cache worker stopped");
            })
            .map_err(|e| ImageError::filesystem(format!("failed to spawn disk worker: {e}")))?;

        Ok(Self { store, jobs })
    }

    /// Returns the writable root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.store.root
    }

    /// Registers a read-only root searched, in registration order, after the writable root.
    pub fn add_read_only_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut roots = self.store.read_only_roots.write();
        if !roots.contains(&path) {
            debug!(path = %path.display(), "Added read-only cache path");
            roots.push(path);
        }
    }

    /// Returns the limits enforced by cleanup.
    #[must_use]
    pub fn limits(&self) -> DiskLimits {
        *self.store.limits.lock()
    }

    /// Replaces the limits enforced by subsequent cleanups.
    pub fn set_limits(&self, limits: DiskLimits) {
        *self.store.limits.lock() = limits;
    }

    /// Returns the file path for `key` in the writable root.
    #[must_use]
    pub fn default_cache_path(&self, key: &CacheKey) -> PathBuf {
        cache_path_in(key, &self.store.root)
    }

    /// Stores bytes for `key` in the writable root.
    pub fn store(&self, key: CacheKey, bytes: Bytes) -> Pending<()> {
        self.submit(move |store| store.store(&key, &bytes))
    }

    /// Stores bytes produced on the I/O thread, for payloads that still need encoding.
    pub fn store_with<F>(&self, key: CacheKey, produce: F) -> Pending<()>
    where
        F: FnOnce() -> ImageResult<Vec<u8>> + Send + 'static,
    {
        self.submit(move |store| {
            let bytes = produce()?;
            store.store(&key, &bytes)
        })
    }

    /// Reads bytes for `key`, falling back to read-only roots.
    pub fn lookup(&self, key: CacheKey) -> Pending<Option<Vec<u8>>> {
        self.lookup_if(key, || true)
    }

    /// Like [`DiskCache::lookup`], but skips the read if `proceed` returns false once the job
    /// reaches the I/O thread.
    pub fn lookup_if<F>(&self, key: CacheKey, proceed: F) -> Pending<Option<Vec<u8>>>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        self.submit(move |store| Ok(if proceed() { store.lookup(&key) } else { None }))
    }

    /// Checks whether `key` exists in any root without reading it.
    pub fn exists(&self, key: CacheKey) -> Pending<bool> {
        self.submit(move |store| Ok(store.exists(&key)))
    }

    /// Removes the file for `key` from the writable root.
    pub fn remove(&self, key: CacheKey) -> Pending<()> {
        self.submit(move |store| store.remove(&key))
    }

    /// Removes every file in the writable root.
    pub fn clear(&self) -> Pending<()> {
        self.submit(DiskStore::clear)
    }

    /// Runs the age-then-size cleanup sweep.
    pub fn cleanup(&self) -> Pending<CleanupReport> {
        self.submit(DiskStore::cleanup)
    }

    /// Enumerates the writable root.
    pub fn compute_size(&self) -> Pending<DiskSize> {
        self.submit(|store| Ok(store.compute_size()))
    }

    fn submit<T, F>(&self, job: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&DiskStore) -> ImageResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: DiskJob = Box::new(move |store| {
            let _ = tx.send(job(store));
        });
        if self.jobs.send(job).is_err() {
            warn!("Disk cache worker is gone, dropping job");
        }
        Pending { rx }
    }

    /// Blocking variant of [`DiskCache::store`].
    ///
    /// # Errors
    /// Returns `ImageError::Filesystem` if the file cannot be written.
    pub fn store_blocking(&self, key: &CacheKey, bytes: &[u8]) -> ImageResult<()> {
        self.store.store(key, bytes)
    }

    /// Blocking variant of [`DiskCache::lookup`].
    #[must_use]
    pub fn lookup_blocking(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.store.lookup(key)
    }

    /// Blocking variant of [`DiskCache::exists`].
    #[must_use]
    pub fn exists_blocking(&self, key: &CacheKey) -> bool {
        self.store.exists(key)
    }

    /// Blocking variant of [`DiskCache::remove`].
    ///
    /// # Errors
    /// Returns `ImageError::Filesystem` if the file exists but cannot be removed.
    pub fn remove_blocking(&self, key: &CacheKey) -> ImageResult<()> {
        self.store.remove(key)
    }

    /// Blocking variant of [`DiskCache::cleanup`].
    ///
    /// # Errors
    /// Returns `ImageError::Filesystem` if the root cannot be enumerated.
    pub fn cleanup_blocking(&self) -> ImageResult<CleanupReport> {
        self.store.cleanup()
    }

    /// Blocking variant of [`DiskCache::compute_size`].
    #[must_use]
    pub fn compute_size_blocking(&self) -> DiskSize {
        self.store.compute_size()
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.store.root)
            .field("limits", &self.limits())
            .finish_non_exhaustive()
    }
}

/// Returns the file path for `key` under `root`. Flat namespace, one-way hashed name.
#[must_use]
pub fn cache_path_in(key: &CacheKey, root: &Path) -> PathBuf {
    root.join(key.hashed_file_name())
}

/// Filesystem state owned by the I/O thread.
struct DiskStore {
    root: PathBuf,
    read_only_roots: RwLock<Vec<PathBuf>>,
    limits: Mutex<DiskLimits>,
    io_lock: Mutex<()>,
}

impl DiskStore {
    fn store(&self, key: &CacheKey, bytes: &[u8]) -> ImageResult<()> {
        let _io = self.io_lock.lock();
        std::fs::create_dir_all(&self.root)
            .map_err(|e| ImageError::filesystem(format!("failed to create cache dir: {e}")))?;

        let path = cache_path_in(key, &self.root);
        let mut file = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| ImageError::filesystem(format!("failed to create cache file: {e}")))?;
        file.write_all(bytes)
            .map_err(|e| ImageError::filesystem(format!("failed to write cache file: {e}")))?;
        file.persist(&path)
            .map_err(|e| ImageError::filesystem(format!("failed to persist cache file: {e}")))?;

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");
        Ok(())
    }

    fn lookup(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let _io = self.io_lock.lock();
        for root in self.search_roots() {
            let path = cache_path_in(key, &root);
            if let Ok(bytes) = std::fs::read(&path) {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                if root == self.root {
                    let _ = filetime::set_file_atime(&path, FileTime::now());
                }
                return Some(bytes);
            }
        }
        trace!(key = %key, "Disk cache miss");
        None
    }

    fn exists(&self, key: &CacheKey) -> bool {
        let _io = self.io_lock.lock();
        self.search_roots()
            .iter()
            .any(|root| cache_path_in(key, root).is_file())
    }

    fn remove(&self, key: &CacheKey) -> ImageResult<()> {
        let _io = self.io_lock.lock();
        let path = cache_path_in(key, &self.root);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "Removed image from disk cache");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImageError::filesystem(format!(
                "failed to remove cache file: {e}"
            ))),
        }
    }

    fn clear(&self) -> ImageResult<()> {
        let _io = self.io_lock.lock();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ImageError::filesystem(format!(
                    "failed to read cache dir: {e}"
                )));
            }
        };

        for entry in entries {
            let path = entry?.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
        info!(root = %self.root.display(), "Cleared disk cache");
        Ok(())
    }

    fn cleanup(&self) -> ImageResult<CleanupReport> {
        let _io = self.io_lock.lock();
        let limits = *self.limits.lock();
        let now = SystemTime::now();
        let mut report = CleanupReport::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => {
                return Err(ImageError::filesystem(format!(
                    "failed to read cache dir: {e}"
                )));
            }
        };

        let mut survivors: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let mut total = 0u64;

        for entry in entries {
            let entry = entry?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);

            if age >= limits.max_age {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        trace!(path = %path.display(), "Removed expired cache file");
                        report.expired += 1;
                        report.freed_bytes += meta.len();
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove expired cache file");
                        total += meta.len();
                    }
                }
                continue;
            }

            let accessed = meta.accessed().unwrap_or(modified);
            total += meta.len();
            survivors.push((path, accessed, meta.len()));
        }

        if limits.max_size > 0 && total > limits.max_size {
            let target = limits.max_size / 2;
            debug!(
                total,
                max_size = limits.max_size,
                target,
                "Disk cache over limit, evicting oldest files"
            );

            survivors.sort_by_key(|(_, accessed, _)| *accessed);
            for (path, _, size) in survivors {
                if total <= target {
                    break;
                }
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
                } else {
                    total -= size;
                    report.evicted += 1;
                    report.freed_bytes += size;
                }
            }
        }

        report.remaining_bytes = total;
        info!(
            expired = report.expired,
            evicted = report.evicted,
            freed_bytes = report.freed_bytes,
            remaining_bytes = report.remaining_bytes,
            "Disk cache cleanup complete"
        );
        Ok(report)
    }

    fn compute_size(&self) -> DiskSize {
        let _io = self.io_lock.lock();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return DiskSize::default();
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(std::fs::Metadata::is_file)
            .fold(DiskSize::default(), |acc, meta| DiskSize {
                file_count: acc.file_count + 1,
                total_bytes: acc.total_bytes + meta.len(),
            })
    }

    fn search_roots(&self) -> Vec<PathBuf> {
        let read_only = self.read_only_roots.read();
        std::iter::once(self.root.clone())
            .chain(read_only.iter().cloned())
            .collect()
    }
}
