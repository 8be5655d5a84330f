//! Application configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::domain::entities::{Credential, ExecutionOrder};
use crate::infrastructure::imaging::{
    CacheKeyFilter, DEFAULT_MAX_MEMORY_COST, DEFAULT_NAMESPACE, DownloaderConfig,
    ImageCacheConfig, default_cache_directory, filter_from_settings,
};

use super::args::CliArgs;
use super::storage::ConfigError;

pub(super) const APP_NAME: &str = "webimage";
pub(super) const APP_QUALIFIER: &str = "com";
pub(super) const APP_ORGANIZATION: &str = "linuxmobile";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, read from `config.toml` and overlaid with CLI flags.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache limits and location.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Download scheduling and HTTP settings.
    #[serde(default)]
    pub downloader: DownloaderSettings,

    /// Request orchestration settings.
    #[serde(default)]
    pub manager: ManagerSettings,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Subdirectory of `directory` holding this cache.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Parent directory of the namespace. Defaults to the platform cache directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Memory budget in bytes of decoded pixels, 0 for unlimited.
    #[serde(default = "default_max_memory_cost")]
    pub max_memory_cost: u64,

    /// Maximum age of a disk entry in seconds.
    #[serde(default = "default_max_disk_age_secs")]
    pub max_disk_age_secs: u64,

    /// Disk budget in bytes, 0 for unlimited.
    #[serde(default)]
    pub max_disk_size: u64,

    /// Read-only directories searched after the writable one.
    #[serde(default)]
    pub read_only_paths: Vec<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            directory: None,
            max_memory_cost: default_max_memory_cost(),
            max_disk_age_secs: default_max_disk_age_secs(),
            max_disk_size: 0,
            read_only_paths: Vec::new(),
        }
    }
}

/// `[downloader]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderSettings {
    /// Simultaneous downloads.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Seconds without progress before a download fails.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Promotion order of waiting downloads.
    #[serde(default)]
    pub execution_order: ExecutionOrder,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Username for authentication challenges.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication challenges.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Accept any server certificate. Unsafe outside development.
    #[serde(default)]
    pub trust_all_certificates: bool,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_timeout_secs: default_download_timeout_secs(),
            execution_order: ExecutionOrder::default(),
            headers: BTreeMap::new(),
            username: None,
            password: None,
            trust_all_certificates: false,
        }
    }
}

/// `[manager]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Drop the query string when deriving cache keys.
    #[serde(default)]
    pub cache_key_strip_query: bool,

    /// Regular expression removed from the URL when deriving cache keys.
    #[serde(default)]
    pub cache_key_strip_pattern: Option<String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_memory_cost() -> u64 {
    DEFAULT_MAX_MEMORY_COST
}

fn default_max_disk_age_secs() -> u64 {
    60 * 60 * 24 * 7
}

fn default_max_concurrent_downloads() -> usize {
    crate::infrastructure::imaging::downloader::DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

fn default_download_timeout_secs() -> u64 {
    15
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(directory) = &args.cache_dir {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(namespace) = &args.namespace {
            self.cache.namespace.clone_from(namespace);
        }
        if let Some(max) = args.max_concurrent_downloads {
            self.downloader.max_concurrent_downloads = max;
        }
        if let Some(timeout) = args.timeout {
            self.downloader.download_timeout_secs = timeout;
        }
        if let Some(order) = args.execution_order {
            self.downloader.execution_order = order;
        }
        if args.trust_all_certificates {
            self.downloader.trust_all_certificates = true;
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default config file path.
    #[must_use]
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_dir().join("webimage.log"))
    }

    /// Returns effective config path.
    #[must_use]
    pub fn effective_config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(Self::default_config_path)
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }

    /// Returns the writable disk cache root: `<directory>/<namespace>`.
    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        self.cache
            .directory
            .clone()
            .unwrap_or_else(default_cache_directory)
            .join(&self.cache.namespace)
    }

    /// Builds the cache limits.
    #[must_use]
    pub fn image_cache_config(&self) -> ImageCacheConfig {
        ImageCacheConfig {
            max_memory_cost: self.cache.max_memory_cost,
            max_disk_age: Duration::from_secs(self.cache.max_disk_age_secs),
            max_disk_size: self.cache.max_disk_size,
            read_only_paths: self.cache.read_only_paths.clone(),
        }
    }

    /// Builds the downloader settings.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidHeader` if a configured header cannot be sent.
    pub fn downloader_config(&self) -> Result<DownloaderConfig, ConfigError> {
        let mut config = DownloaderConfig::default();
        let settings = &self.downloader;

        config.max_concurrent_downloads = settings.max_concurrent_downloads;
        config.download_timeout = Duration::from_secs(settings.download_timeout_secs);
        config.execution_order = settings.execution_order;
        config.trust_all_certificates = settings.trust_all_certificates;
        config.default_headers.extend(parse_headers(&settings.headers)?);
        config.credential = settings
            .username
            .as_ref()
            .map(|user| Credential::new(user.clone(), settings.password.clone().unwrap_or_default()));

        Ok(config)
    }

    /// Builds the cache key filter described by `[manager]`.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPattern` if the strip pattern is not a valid regex.
    pub fn cache_key_filter(&self) -> Result<Option<CacheKeyFilter>, ConfigError> {
        Ok(filter_from_settings(
            self.manager.cache_key_strip_query,
            self.manager.cache_key_strip_pattern.as_deref(),
        )?)
    }
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
            Ok((name, value))
        })
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            cache: CacheSettings::default(),
            downloader: DownloaderSettings::default(),
            manager: ManagerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_config_sections() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            namespace = "avatars"
            max_memory_cost = 0
            max_disk_size = 1048576

            [downloader]
            max_concurrent_downloads = 2
            execution_order = "lifo"
            username = "me"
            password = "secret"

            [downloader.headers]
            "X-Api-Key" = "abc"

            [manager]
            cache_key_strip_query = true
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.namespace, "avatars");
        assert_eq!(config.cache.max_memory_cost, 0);
        assert_eq!(config.cache.max_disk_age_secs, default_max_disk_age_secs());

        let downloader = config.downloader_config().unwrap();
        assert_eq!(downloader.max_concurrent_downloads, 2);
        assert_eq!(downloader.execution_order, ExecutionOrder::Lifo);
        assert_eq!(downloader.default_headers.get("x-api-key").unwrap(), "abc");
        assert!(downloader.default_headers.contains_key("accept"));
        assert_eq!(downloader.credential.unwrap().password(), "secret");

        assert!(config.cache_key_filter().unwrap().is_some());
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.cache.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.downloader.download_timeout_secs, 15);
        assert!(config.cache_key_filter().unwrap().is_none());
        assert!(config.downloader_config().unwrap().credential.is_none());
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let mut config = AppConfig::default();
        config
            .downloader
            .headers
            .insert("bad header".to_string(), "x".to_string());

        assert!(matches!(
            config.downloader_config(),
            Err(ConfigError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "webimage",
            "--namespace",
            "thumbs",
            "--cache-dir",
            "/tmp/webimage-test",
            "--execution-order",
            "lifo",
            "cache",
            "size",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.cache_root(), PathBuf::from("/tmp/webimage-test/thumbs"));
        assert_eq!(config.downloader.execution_order, ExecutionOrder::Lifo);
    }

    #[test]
    fn test_password_is_not_written_back() {
        let mut config = AppConfig::default();
        config.downloader.password = Some("secret".to_string());

        let written = toml::to_string_pretty(&config).unwrap();
        assert!(!written.contains("secret"));
    }
}
