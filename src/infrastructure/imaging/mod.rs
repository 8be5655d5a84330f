//! Image loading engine.
//!
//! This module provides:
//! - Memory caching with cost-bounded LRU eviction
//! - Disk caching on a dedicated I/O thread with age and size cleanup
//! - Prioritised, deduplicated HTTP downloads
//! - Request orchestration with a failed-url blacklist

pub mod cache_key;
pub mod codec;
pub mod disk_cache;
pub mod dispatch;
pub mod downloader;
pub mod image_cache;
pub mod manager;
pub mod memory_cache;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache_key::{CacheKeyFilter, filter_from_settings, pattern_filter, strip_query_filter};
pub use codec::StandardCodec;
pub use disk_cache::{CleanupReport, DiskCache, DiskLimits, DiskSize, Pending, cache_path_in};
pub use dispatch::{DispatchQueue, Dispatcher};
pub use downloader::{
    DownloadEvent, DownloadHandle, DownloadProgress, Downloaded, Downloader, DownloaderConfig,
    HeadersFilter, OperationState, Priority, ProgressCallback,
};
pub use image_cache::{DEFAULT_NAMESPACE, ImageCache, ImageCacheConfig, default_cache_directory};
pub use manager::{
    CompletionCallback, DownloadPolicy, ImageManager, ImageResponse, RequestHandle, TransformHook,
};
pub use memory_cache::{CacheStats, DEFAULT_MAX_MEMORY_COST, MemoryCache};
