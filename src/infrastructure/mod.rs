//! Infrastructure layer with the image engine and its configuration.

/// Application configuration.
pub mod config;
/// Image caching, downloading and request orchestration.
pub mod imaging;

pub use config::{AppConfig, CliArgs, ConfigError, LogLevel, StorageManager};
pub use imaging::{
    Dispatcher, Downloader, DownloaderConfig, ImageCache, ImageCacheConfig, ImageManager,
    ImageResponse, RequestHandle, StandardCodec,
};
