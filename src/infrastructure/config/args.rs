use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use crate::domain::entities::{ExecutionOrder, WebImageOptions};

use super::app_config::LogLevel;

#[derive(Debug, Parser)]
#[command(
    name = "webimage",
    version,
    about = "Fetch web images through a memory and disk cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Parent directory of the cache namespace.
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Cache namespace.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Simultaneous downloads.
    #[arg(long, global = true)]
    pub max_concurrent_downloads: Option<usize>,

    /// Seconds without progress before a download fails.
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Promotion order of waiting downloads.
    #[arg(long, value_enum, global = true)]
    pub execution_order: Option<ExecutionOrder>,

    /// Accept any server certificate. Unsafe outside development.
    #[arg(long, global = true)]
    pub trust_all_certificates: bool,

    /// Print results as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load images through the cache, downloading on a miss.
    Fetch(FetchArgs),
    /// Inspect or maintain the disk cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// URLs to load.
    #[arg(required = true)]
    pub urls: Vec<Url>,

    /// Download again even if cached.
    #[arg(long)]
    pub refresh: bool,

    /// Retry URLs that failed before.
    #[arg(long)]
    pub retry_failed: bool,

    /// Keep results out of the disk cache.
    #[arg(long)]
    pub memory_only: bool,

    /// Report partial images while downloading.
    #[arg(long)]
    pub progressive: bool,

    /// Download ahead of other requests.
    #[arg(long, conflicts_with = "low_priority")]
    pub high_priority: bool,

    /// Download behind other requests.
    #[arg(long)]
    pub low_priority: bool,
}

impl FetchArgs {
    /// Request flags selected on the command line.
    #[must_use]
    pub fn options(&self) -> WebImageOptions {
        [
            (self.refresh, WebImageOptions::REFRESH_CACHED),
            (self.retry_failed, WebImageOptions::RETRY_FAILED),
            (self.memory_only, WebImageOptions::CACHE_MEMORY_ONLY),
            (self.progressive, WebImageOptions::PROGRESSIVE_DOWNLOAD),
            (self.high_priority, WebImageOptions::HIGH_PRIORITY),
            (self.low_priority, WebImageOptions::LOW_PRIORITY),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(WebImageOptions::empty(), |acc, (_, flag)| acc | flag)
    }
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Print file count and bytes on disk.
    Size,
    /// Remove expired files, then shrink to the size limit.
    Clean,
    /// Remove every file.
    Clear,
    /// Print the disk path a URL is cached at.
    Path {
        /// URL to resolve.
        url: Url,
    },
}
