//! Prioritised, deduplicating HTTP downloads.

#[allow(clippy::module_inception)]
mod downloader;
mod operation;
mod queue;

pub use downloader::{
    DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_MAX_CONCURRENT_DOWNLOADS, DownloadEvent, DownloadHandle,
    Downloader, DownloaderConfig, HeadersFilter, ProgressCallback,
};
pub use operation::{DownloadProgress, Downloaded, OperationState};
pub use queue::Priority;
