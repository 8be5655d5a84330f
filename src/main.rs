use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, bail};
use futures_util::future::join_all;
use image::GenericImageView;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use webimage::infrastructure::config::{CacheCommand, Command, FetchArgs};
use webimage::infrastructure::{
    AppConfig, CliArgs, Downloader, ImageCache, ImageManager, ImageResponse, StandardCodec,
    StorageManager,
};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = config.effective_log_path() {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry().with(filter).init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

fn create_manager(config: &AppConfig) -> Result<ImageManager> {
    let codec = Arc::new(StandardCodec);
    let cache = ImageCache::new(config.cache_root(), &config.image_cache_config(), codec.clone())?;
    let downloader = Downloader::new(config.downloader_config()?, codec);

    let manager = ImageManager::new(Arc::new(cache), downloader);
    manager.set_cache_key_filter(config.cache_key_filter()?);
    Ok(manager)
}

#[derive(Serialize)]
struct FetchReport {
    url: String,
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    error: Option<String>,
}

impl FetchReport {
    fn from_response(response: &ImageResponse) -> Self {
        let dimensions = response.image().map(|image| image.dimensions());
        Self {
            url: response.url.to_string(),
            source: response
                .image()
                .map(|_| response.cache_type.to_string()),
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            error: response.error().map(ToString::to_string),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn fetch(manager: &ImageManager, args: &FetchArgs, json: bool) -> Result<()> {
    let options = args.options();
    let responses = join_all(
        args.urls
            .iter()
            .map(|url| manager.load(url.clone(), options)),
    )
    .await;

    let mut failures = 0usize;
    for response in responses {
        if let Err(err) = &response.result {
            failures += 1;
            warn!(url = %response.url, error = %err, "Image load failed");
        }

        if json {
            print_json(&FetchReport::from_response(&response))?;
            continue;
        }
        match &response.result {
            Ok(Some(image)) => {
                let (width, height) = image.dimensions();
                println!("{}\t{}\t{width}x{height}", response.url, response.cache_type);
            }
            Ok(None) => println!("{}\tskipped", response.url),
            Err(err) => eprintln!("{}\terror: {err}", response.url),
        }
    }

    if failures > 0 {
        bail!("{failures} of {} images failed to load", args.urls.len());
    }
    Ok(())
}

async fn run_cache_command(manager: &ImageManager, action: &CacheCommand, json: bool) -> Result<()> {
    let cache = manager.cache();
    match action {
        CacheCommand::Size => {
            let size = cache.calculate_size().await?;
            if json {
                return print_json(&size);
            }
            println!("{} files, {} bytes", size.file_count, size.total_bytes);
        }
        CacheCommand::Clean => {
            let report = cache.clean_disk().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "removed {} expired and {} evicted files, freed {} bytes, {} bytes remain",
                report.expired, report.evicted, report.freed_bytes, report.remaining_bytes
            );
        }
        CacheCommand::Clear => {
            cache.clear_memory();
            cache.clear_disk().await?;
            if !json {
                println!("cache cleared");
            }
        }
        CacheCommand::Path { url } => {
            let path = cache.default_cache_path(&manager.cache_key_for_url(url));
            if json {
                return print_json(&serde_json::json!({ "url": url.as_str(), "path": path }));
            }
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    init_logging(&config)?;

    info!(version = webimage::VERSION, root = %config.cache_root().display(), "Starting webimage");

    let manager = create_manager(&config)?;

    match &args.command {
        Command::Fetch(fetch_args) => fetch(&manager, fetch_args, args.json).await,
        Command::Cache { action } => run_cache_command(&manager, action, args.json).await,
    }
}
