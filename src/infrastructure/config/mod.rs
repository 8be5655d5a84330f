//! Application configuration.

pub mod app_config;
pub mod args;
pub mod storage;

pub use app_config::{AppConfig, CacheSettings, DownloaderSettings, LogLevel, ManagerSettings};
pub use args::{CacheCommand, CliArgs, Command, FetchArgs};
pub use storage::{ConfigError, StorageManager};
