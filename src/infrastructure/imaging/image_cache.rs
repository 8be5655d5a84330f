//! Two-tier image cache: decoded images in memory, encoded bytes on disk.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{CacheKey, CacheType, Image, image_cost};
use crate::domain::errors::ImageResult;
use crate::domain::ports::{ImageCodec, MemoryWarning};

use super::codec::StandardCodec;
use super::disk_cache::{CleanupReport, DiskCache, DiskLimits, DiskSize, Pending};
use super::memory_cache::{DEFAULT_MAX_MEMORY_COST, MemoryCache};

/// Default namespace directory under the cache directory.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Limits and search paths of an [`ImageCache`].
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Memory budget in bytes of decoded pixels, `0` for unlimited.
    pub max_memory_cost: u64,
    /// Files older than this are removed by cleanup.
    pub max_disk_age: Duration,
    /// Disk budget in bytes, `0` for unlimited.
    pub max_disk_size: u64,
    /// Read-only roots searched, in order, after the writable root.
    pub read_only_paths: Vec<PathBuf>,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        let limits = DiskLimits::default();
        Self {
            max_memory_cost: DEFAULT_MAX_MEMORY_COST,
            max_disk_age: limits.max_age,
            max_disk_size: limits.max_size,
            read_only_paths: Vec::new(),
        }
    }
}

/// Memory and disk cache behind one lookup, store, and remove contract.
pub struct ImageCache {
    memory: MemoryCache,
    disk: DiskCache,
    codec: Arc<dyn ImageCodec>,
}

impl ImageCache {
    /// Creates a cache whose writable disk root is `root`.
    ///
    /// # Errors
    /// Returns error if the disk I/O thread cannot be started.
    pub fn new(
        root: PathBuf,
        config: &ImageCacheConfig,
        codec: Arc<dyn ImageCodec>,
    ) -> ImageResult<Self> {
        let disk = DiskCache::new(
            root,
            DiskLimits {
                max_age: config.max_disk_age,
                max_size: config.max_disk_size,
            },
        )?;
        for path in &config.read_only_paths {
            disk.add_read_only_path(path.clone());
        }

        debug!(root = %disk.root().display(), "Created image cache");

        Ok(Self {
            memory: MemoryCache::new(config.max_memory_cost),
            disk,
            codec,
        })
    }

    /// Creates a cache with default limits in `<directory>/<namespace>`.
    ///
    /// Without a directory the platform cache directory is used.
    ///
    /// # Errors
    /// Returns error if the disk I/O thread cannot be started.
    pub fn with_namespace(namespace: &str, directory: Option<PathBuf>) -> ImageResult<Self> {
        let root = directory
            .unwrap_or_else(default_cache_directory)
            .join(namespace);
        Self::new(root, &ImageCacheConfig::default(), Arc::new(StandardCodec))
    }

    /// Returns the memory tier.
    #[must_use]
    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    /// Returns the disk tier.
    #[must_use]
    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Returns the codec.
    #[must_use]
    pub fn codec(&self) -> &Arc<dyn ImageCodec> {
        &self.codec
    }

    /// Registers an extra read-only root.
    pub fn add_read_only_path(&self, path: impl Into<PathBuf>) {
        self.disk.add_read_only_path(path);
    }

    /// Returns the writable disk path for `key`.
    #[must_use]
    pub fn default_cache_path(&self, key: &CacheKey) -> PathBuf {
        self.disk.default_cache_path(key)
    }

    /// Stores an image in memory, and on disk if `to_disk`.
    ///
    /// Without `data` the image is encoded on the disk I/O thread. The returned operation
    /// may be awaited for the disk outcome or dropped.
    pub fn store(
        &self,
        key: &CacheKey,
        image: Image,
        data: Option<Bytes>,
        to_disk: bool,
    ) -> Pending<()> {
        self.memory
            .set(key.clone(), image.clone(), image_cost(&image));

        if !to_disk {
            return Pending::ready(Ok(()));
        }

        match data {
            Some(bytes) => self.disk.store(key.clone(), bytes),
            None => {
                let codec = self.codec.clone();
                self.disk
                    .store_with(key.clone(), move || codec.encode(&image))
            }
        }
    }

    /// Synchronous memory lookup. Never touches disk.
    #[must_use]
    pub fn query_memory(&self, key: &CacheKey) -> Option<Image> {
        self.memory.get(key)
    }

    /// Blocking disk read and decode. A hit is promoted into memory.
    #[must_use]
    pub fn query_disk_blocking(&self, key: &CacheKey) -> Option<Image> {
        let bytes = self.disk.lookup_blocking(key)?;
        self.decode_and_promote(key, &bytes)
    }

    /// Looks up memory, then disk. A disk hit is decoded off the caller's task and promoted.
    pub async fn query(&self, key: &CacheKey) -> Option<(Image, CacheType)> {
        self.query_with_cancel(key, &CancellationToken::new()).await
    }

    /// Like [`ImageCache::query`], abandoning the lookup if `cancel` fires before the disk
    /// phase starts.
    pub async fn query_with_cancel(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Option<(Image, CacheType)> {
        if let Some(image) = self.memory.get(key) {
            return Some((image, CacheType::Memory));
        }
        if cancel.is_cancelled() {
            return None;
        }

        let job_cancel = cancel.clone();
        let bytes = match self
            .disk
            .lookup_if(key.clone(), move || !job_cancel.is_cancelled())
            .await
        {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache lookup failed");
                return None;
            }
        };
        if cancel.is_cancelled() {
            trace!(key = %key, "Query cancelled after disk read");
            return None;
        }

        let codec = self.codec.clone();
        let decoded = tokio::task::spawn_blocking(move || codec.decode(&bytes)).await;
        let image = match decoded {
            Ok(Ok(image)) => Arc::new(image),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to decode cached image");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Decode task panicked");
                return None;
            }
        };

        self.memory
            .set(key.clone(), image.clone(), image_cost(&image));
        debug!(key = %key, "Decoded image from disk cache");
        Some((image, CacheType::Disk))
    }

    /// Removes `key` from memory and, if `from_disk`, from disk.
    pub fn remove(&self, key: &CacheKey, from_disk: bool) -> Pending<()> {
        self.memory.remove(key);
        if from_disk {
            self.disk.remove(key.clone())
        } else {
            Pending::ready(Ok(()))
        }
    }

    /// Drops every decoded image.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Removes every file in the writable disk root.
    pub fn clear_disk(&self) -> Pending<()> {
        self.disk.clear()
    }

    /// Runs the disk cleanup sweep.
    pub fn clean_disk(&self) -> Pending<CleanupReport> {
        self.disk.cleanup()
    }

    /// Blocking existence probe on disk.
    #[must_use]
    pub fn disk_exists_blocking(&self, key: &CacheKey) -> bool {
        self.disk.exists_blocking(key)
    }

    /// Existence probe on disk, queued behind pending writes.
    pub fn disk_exists(&self, key: &CacheKey) -> Pending<bool> {
        self.disk.exists(key.clone())
    }

    /// Total bytes on disk.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.disk.compute_size_blocking().total_bytes
    }

    /// Number of files on disk.
    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.disk.compute_size_blocking().file_count
    }

    /// Counts files and bytes on disk without blocking the caller.
    pub fn calculate_size(&self) -> Pending<DiskSize> {
        self.disk.compute_size()
    }

    /// Clears the memory tier whenever a low-memory signal arrives.
    ///
    /// The task stops when the sender side closes or the cache is dropped.
    pub fn watch_memory_warnings(
        self: &Arc<Self>,
        mut warnings: broadcast::Receiver<MemoryWarning>,
    ) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match warnings.recv().await {
                    Ok(MemoryWarning) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        info!("Memory warning received, clearing memory cache");
                        cache.clear_memory();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn decode_and_promote(&self, key: &CacheKey, bytes: &[u8]) -> Option<Image> {
        match self.codec.decode(bytes) {
            Ok(image) => {
                let image = Arc::new(image);
                self.memory
                    .set(key.clone(), image.clone(), image_cost(&image));
                Some(image)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to decode cached image");
                None
            }
        }
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.memory)
            .field("disk", &self.disk)
            .finish_non_exhaustive()
    }
}

/// Returns the platform cache directory for images.
#[must_use]
pub fn default_cache_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "linuxmobile", "webimage").map_or_else(
        || std::env::temp_dir().join("webimage").join("cache"),
        |dirs| dirs.cache_dir().join("images"),
    )
}
