//! Request orchestration: cache lookup, blacklist, download, store, delivery.
//!
//! A request first consults the two-tier cache. On a miss it checks the failed-URL set and
//! the optional download policy, then joins or starts a download. Successful downloads are
//! stored back into the cache and every outcome reaches the caller through the configured
//! [`Dispatcher`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, CacheType, Image, WebImageOptions};
use crate::domain::errors::{ImageError, ImageResult};

use super::cache_key::CacheKeyFilter;
use super::codec::StandardCodec;
use super::disk_cache::Pending;
use super::dispatch::Dispatcher;
use super::downloader::{
    DownloadHandle, DownloadProgress, Downloaded, Downloader, DownloaderConfig, ProgressCallback,
};
use super::image_cache::{DEFAULT_NAMESPACE, ImageCache};

/// Decides whether a missing image may be downloaded at all.
pub type DownloadPolicy = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// Post-download transform applied before the image is cached and delivered.
pub type TransformHook = Arc<dyn Fn(&Url, Image) -> Image + Send + Sync>;

/// Completion callback. Invoked once per non-terminal interim result and exactly once with
/// `finished == true`.
pub type CompletionCallback = Arc<dyn Fn(ImageResponse) + Send + Sync>;

static SHARED: OnceLock<ImageManager> = OnceLock::new();

/// One delivery to a request's completion callback.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The requested URL.
    pub url: Url,
    /// The image, no image when the download policy declined, or the failure.
    pub result: ImageResult<Option<Image>>,
    /// Where the image came from.
    pub cache_type: CacheType,
    /// True for the terminal delivery.
    pub finished: bool,
}

impl ImageResponse {
    /// Returns the image, if any.
    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        self.result.as_ref().ok().and_then(Option::as_ref)
    }

    /// Returns the error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ImageError> {
        self.result.as_ref().err()
    }
}

struct RunningRequest {
    url: Url,
    token: CancellationToken,
    download: Option<DownloadHandle>,
}

#[derive(Default)]
struct Hooks {
    cache_key_filter: Option<CacheKeyFilter>,
    download_policy: Option<DownloadPolicy>,
    transform: Option<TransformHook>,
}

struct ManagerShared {
    cache: Arc<ImageCache>,
    downloader: Downloader,
    failed_urls: Mutex<HashSet<Url>>,
    running: Mutex<HashMap<u64, RunningRequest>>,
    next_id: AtomicU64,
    hooks: RwLock<Hooks>,
    dispatcher: RwLock<Dispatcher>,
}

/// Entry point of the engine, composing [`ImageCache`] and [`Downloader`].
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ImageManager {
    shared: Arc<ManagerShared>,
}

impl ImageManager {
    /// Creates a manager over an existing cache and downloader.
    #[must_use]
    pub fn new(cache: Arc<ImageCache>, downloader: Downloader) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                cache,
                downloader,
                failed_urls: Mutex::new(HashSet::new()),
                running: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                hooks: RwLock::new(Hooks::default()),
                dispatcher: RwLock::new(Dispatcher::Immediate),
            }),
        }
    }

    /// Creates a manager with the default namespace, limits and codec.
    ///
    /// # Errors
    /// Returns error if the disk cache cannot be started.
    pub fn with_defaults() -> ImageResult<Self> {
        let cache = Arc::new(ImageCache::with_namespace(DEFAULT_NAMESPACE, None)?);
        let downloader = Downloader::new(DownloaderConfig::default(), Arc::new(StandardCodec));
        Ok(Self::new(cache, downloader))
    }

    /// Process-wide default manager.
    ///
    /// Created with [`ImageManager::with_defaults`] on first successful call and kept until
    /// the process exits. It is never reset.
    ///
    /// # Errors
    /// Returns error if the first construction fails; a later call retries.
    pub fn shared() -> ImageResult<&'static Self> {
        if let Some(manager) = SHARED.get() {
            return Ok(manager);
        }
        let manager = Self::with_defaults()?;
        Ok(SHARED.get_or_init(|| manager))
    }

    /// Returns the cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.shared.cache
    }

    /// Returns the downloader.
    #[must_use]
    pub fn downloader(&self) -> &Downloader {
        &self.shared.downloader
    }

    /// Installs or removes the URL to cache key normalisation.
    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        self.shared.hooks.write().cache_key_filter = filter;
    }

    /// Installs or removes the policy consulted before each download.
    pub fn set_download_policy(&self, policy: Option<DownloadPolicy>) {
        self.shared.hooks.write().download_policy = policy;
    }

    /// Installs or removes the post-download transform.
    pub fn set_transform(&self, transform: Option<TransformHook>) {
        self.shared.hooks.write().transform = transform;
    }

    /// Sets where callbacks of subsequent requests run.
    pub fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *self.shared.dispatcher.write() = dispatcher;
    }

    /// Returns the cache key for `url`.
    #[must_use]
    pub fn cache_key_for_url(&self, url: &Url) -> CacheKey {
        self.shared.cache_key_for_url(url)
    }

    /// Loads `url` and reports through `on_completion`.
    ///
    /// Returns immediately; all cache and network work happens on Tokio tasks. Must be called
    /// from within a Tokio runtime.
    pub fn request(
        &self,
        url: Url,
        options: WebImageOptions,
        on_progress: Option<ProgressCallback>,
        on_completion: CompletionCallback,
    ) -> RequestHandle {
        let dispatcher = self.shared.dispatcher.read().clone();
        self.start(url, options, on_progress, on_completion, dispatcher)
    }

    /// Loads `url` and waits for the terminal response. Callbacks bypass the dispatcher.
    pub async fn load(&self, url: Url, options: WebImageOptions) -> ImageResponse {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self.start(
            url.clone(),
            options,
            None,
            Arc::new(move |response: ImageResponse| {
                let _ = tx.send(response);
            }),
            Dispatcher::Immediate,
        );

        while let Some(response) = rx.recv().await {
            if response.finished {
                return response;
            }
        }

        handle.cancel();
        ImageResponse {
            url,
            result: Err(ImageError::Cancelled),
            cache_type: CacheType::None,
            finished: true,
        }
    }

    fn start(
        &self,
        url: Url,
        options: WebImageOptions,
        on_progress: Option<ProgressCallback>,
        on_completion: CompletionCallback,
        dispatcher: Dispatcher,
    ) -> RequestHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.shared.running.lock().insert(
            id,
            RunningRequest {
                url: url.clone(),
                token: token.clone(),
                download: None,
            },
        );

        let request = Request {
            id,
            key: self.shared.cache_key_for_url(&url),
            url,
            options,
            token,
            dispatcher,
            on_progress,
            on_completion,
        };
        tokio::spawn(ManagerShared::run(self.shared.clone(), request));

        RequestHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Cancels every outstanding request. No further callbacks are delivered for them.
    pub fn cancel_all(&self) {
        let running: Vec<RunningRequest> = self
            .shared
            .running
            .lock()
            .drain()
            .map(|(_, request)| request)
            .collect();
        if !running.is_empty() {
            debug!(count = running.len(), "Cancelling all image requests");
        }
        for request in running {
            request.cancel();
        }
    }

    /// Returns true while any request has not reached its terminal delivery.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.running.lock().is_empty()
    }

    /// Returns true if `url` is cached in memory or on disk. Blocks on disk I/O.
    #[must_use]
    pub fn cached_image_exists(&self, url: &Url) -> bool {
        let key = self.cache_key_for_url(url);
        self.shared.cache.memory().contains(&key) || self.shared.cache.disk_exists_blocking(&key)
    }

    /// Non-blocking variant of [`ImageManager::cached_image_exists`].
    pub async fn cached_image_exists_async(&self, url: &Url) -> bool {
        let key = self.cache_key_for_url(url);
        if self.shared.cache.memory().contains(&key) {
            return true;
        }
        self.shared.cache.disk_exists(&key).await.unwrap_or(false)
    }

    /// Returns true if `url` is cached on disk. Blocks on disk I/O.
    #[must_use]
    pub fn disk_image_exists(&self, url: &Url) -> bool {
        self.shared
            .cache
            .disk_exists_blocking(&self.cache_key_for_url(url))
    }

    /// Non-blocking variant of [`ImageManager::disk_image_exists`].
    pub async fn disk_image_exists_async(&self, url: &Url) -> bool {
        self.shared
            .cache
            .disk_exists(&self.cache_key_for_url(url))
            .await
            .unwrap_or(false)
    }

    /// Stores an image obtained elsewhere under the key of `url`, in memory and on disk.
    pub fn save_image_to_cache(&self, image: Image, url: &Url) -> Pending<()> {
        self.shared
            .cache
            .store(&self.cache_key_for_url(url), image, None, true)
    }

    /// Returns true if `url` previously failed and is excluded from retries.
    #[must_use]
    pub fn is_failed(&self, url: &Url) -> bool {
        self.shared.failed_urls.lock().contains(url)
    }
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("cache", &self.shared.cache)
            .field("downloader", &self.shared.downloader)
            .field("running", &self.shared.running.lock().len())
            .finish_non_exhaustive()
    }
}

struct Request {
    id: u64,
    url: Url,
    key: CacheKey,
    options: WebImageOptions,
    token: CancellationToken,
    dispatcher: Dispatcher,
    on_progress: Option<ProgressCallback>,
    on_completion: CompletionCallback,
}

impl Request {
    /// Delivers through the dispatcher unless the request was cancelled meanwhile.
    fn deliver(&self, result: ImageResult<Option<Image>>, cache_type: CacheType, finished: bool) {
        let response = ImageResponse {
            url: self.url.clone(),
            result,
            cache_type,
            finished,
        };
        let token = self.token.clone();
        let callback = self.on_completion.clone();
        self.dispatcher.dispatch(move || {
            if !token.is_cancelled() {
                callback(response);
            }
        });
    }

    fn progress_relay(&self) -> Option<ProgressCallback> {
        let callback = self.on_progress.clone()?;
        let token = self.token.clone();
        let dispatcher = self.dispatcher.clone();
        Some(Arc::new(move |progress: &DownloadProgress| {
            let callback = callback.clone();
            let token = token.clone();
            let progress = progress.clone();
            dispatcher.dispatch(move || {
                if !token.is_cancelled() {
                    callback(&progress);
                }
            });
        }))
    }
}

impl ManagerShared {
    fn cache_key_for_url(&self, url: &Url) -> CacheKey {
        match &self.hooks.read().cache_key_filter {
            Some(filter) => filter(url),
            None => CacheKey::from_url(url),
        }
    }

    async fn run(self: Arc<Self>, request: Request) {
        let options = request.options;

        let cached = self
            .cache
            .query_with_cancel(&request.key, &request.token)
            .await;
        if request.token.is_cancelled() {
            return;
        }

        if let Some((image, tier)) = cached {
            if !options.contains(WebImageOptions::REFRESH_CACHED) {
                trace!(url = %request.url, %tier, "Served from cache");
                request.deliver(Ok(Some(image)), tier, true);
                self.finish(request.id);
                return;
            }
            request.deliver(Ok(Some(image)), tier, false);
        }

        if !options.contains(WebImageOptions::RETRY_FAILED)
            && self.failed_urls.lock().contains(&request.url)
        {
            debug!(url = %request.url, "Skipping previously failed url");
            request.deliver(
                Err(ImageError::blacklisted(request.url.as_str())),
                CacheType::None,
                true,
            );
            self.finish(request.id);
            return;
        }

        let policy = self.hooks.read().download_policy.clone();
        if let Some(policy) = policy
            && !policy(&request.url)
        {
            debug!(url = %request.url, "Download declined by policy");
            request.deliver(Ok(None), CacheType::None, true);
            self.finish(request.id);
            return;
        }

        self.download(request);
    }

    fn download(self: Arc<Self>, request: Request) {
        let request = Arc::new(request);
        let progress = request.progress_relay();
        let on_done = {
            let shared = Arc::downgrade(&self);
            let request = request.clone();
            move |result: ImageResult<Downloaded>| {
                if let Some(shared) = shared.upgrade() {
                    shared.complete(&request, result);
                }
            }
        };
        let on_cancel = {
            let shared = Arc::downgrade(&self);
            let id = request.id;
            move || {
                if let Some(shared) = shared.upgrade() {
                    shared.finish(id);
                }
            }
        };

        let handle = self.downloader.fetch_with_cancel(
            request.url.clone(),
            request.options.to_downloader_options(),
            progress,
            on_done,
            on_cancel,
        );

        let orphaned = match self.running.lock().get_mut(&request.id) {
            Some(entry) => {
                entry.download = Some(handle);
                None
            }
            None => Some(handle),
        };
        if let Some(handle) = orphaned {
            handle.cancel();
        }
    }

    fn complete(&self, request: &Request, result: ImageResult<Downloaded>) {
        match result {
            Ok(downloaded) => {
                let image = downloaded
                    .finalize_once(|downloaded| self.store_download(request, downloaded));
                self.failed_urls.lock().remove(&request.url);
                request.deliver(Ok(Some(image)), CacheType::None, true);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                if e.should_blacklist() {
                    debug!(url = %request.url, error = %e, "Marking url as failed");
                    self.failed_urls.lock().insert(request.url.clone());
                }
                request.deliver(Err(e), CacheType::None, true);
            }
        }
        self.finish(request.id);
    }

    /// Transforms and caches a download. Runs once per download, however many requests
    /// share it.
    fn store_download(&self, request: &Request, downloaded: &Downloaded) -> Image {
        let transform = self.hooks.read().transform.clone();
        let (image, data) = match transform {
            Some(transform) => (transform(&request.url, downloaded.image.clone()), None),
            None => (downloaded.image.clone(), Some(downloaded.data.clone())),
        };

        let to_disk = !request.options.contains(WebImageOptions::CACHE_MEMORY_ONLY);
        let stored = self.cache.store(&request.key, image.clone(), data, to_disk);
        let key = request.key.clone();
        tokio::spawn(async move {
            if let Err(e) = stored.await {
                warn!(key = %key, error = %e, "Failed to persist downloaded image");
            }
        });
        image
    }

    fn finish(&self, id: u64) {
        self.running.lock().remove(&id);
    }
}

impl RunningRequest {
    fn cancel(self) {
        self.token.cancel();
        if let Some(download) = self.download {
            download.cancel();
        }
        trace!(url = %self.url, "Cancelled image request");
    }
}

/// Caller handle for one request.
///
/// Dropping it does not cancel the request.
#[derive(Clone)]
pub struct RequestHandle {
    id: u64,
    shared: Weak<ManagerShared>,
}

impl RequestHandle {
    /// Cancels the request. No further callbacks are delivered to this caller; the
    /// download continues if other requests still need it.
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let request = shared.running.lock().remove(&self.id);
        if let Some(request) = request {
            request.cancel();
        }
    }

    /// Returns true until the terminal response was delivered or the request was cancelled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.running.lock().contains_key(&self.id))
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::imaging::image_cache::ImageCacheConfig;
    use crate::infrastructure::imaging::test_support::TestServer;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_manager() -> (ImageManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = ImageCache::new(
            temp_dir.path().join("images"),
            &ImageCacheConfig::default(),
            Arc::new(StandardCodec),
        )
        .unwrap();
        let downloader = Downloader::new(DownloaderConfig::default(), Arc::new(StandardCodec));
        (ImageManager::new(Arc::new(cache), downloader), temp_dir)
    }

    fn collector() -> (CompletionCallback, mpsc::UnboundedReceiver<ImageResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |response: ImageResponse| {
                let _ = tx.send(response);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_miss_downloads_then_hits_memory() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/image.png");

        let first = manager.load(url.clone(), WebImageOptions::empty()).await;
        assert!(first.image().is_some());
        assert_eq!(first.cache_type, CacheType::None);

        let second = manager.load(url.clone(), WebImageOptions::empty()).await;
        assert_eq!(second.cache_type, CacheType::Memory);
        assert_eq!(server.hits("/image.png"), 1);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_disk_hit_after_memory_cleared() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/image.png");

        manager.load(url.clone(), WebImageOptions::empty()).await;
        let key = manager.cache_key_for_url(&url);
        manager.cache().disk().exists(key).await.unwrap();
        manager.cache().clear_memory();

        let response = manager.load(url, WebImageOptions::empty()).await;
        assert_eq!(response.cache_type, CacheType::Disk);
    }

    #[tokio::test]
    async fn test_failed_url_is_blacklisted_until_retry() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/missing.png");

        let first = manager.load(url.clone(), WebImageOptions::empty()).await;
        assert!(matches!(first.error(), Some(ImageError::Network { .. })));
        assert!(manager.is_failed(&url));

        let second = manager.load(url.clone(), WebImageOptions::empty()).await;
        assert!(matches!(second.error(), Some(ImageError::Blacklisted { .. })));
        assert_eq!(server.hits("/missing.png"), 1);

        let third = manager.load(url, WebImageOptions::RETRY_FAILED).await;
        assert!(matches!(third.error(), Some(ImageError::Network { .. })));
        assert_eq!(server.hits("/missing.png"), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_blacklisted() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        manager
            .downloader()
            .set_download_timeout(Duration::from_millis(100));
        let url = server.url("/stall.png");

        let response = manager.load(url.clone(), WebImageOptions::empty()).await;
        assert!(matches!(response.error(), Some(ImageError::Timeout { .. })));
        assert!(!manager.is_failed(&url));
    }

    #[tokio::test]
    async fn test_refresh_cached_delivers_interim_then_network() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/image.png");
        manager.load(url.clone(), WebImageOptions::empty()).await;

        let (callback, mut rx) = collector();
        let _handle = manager.request(url, WebImageOptions::REFRESH_CACHED, None, callback);

        let interim = rx.recv().await.unwrap();
        assert!(!interim.finished);
        assert_eq!(interim.cache_type, CacheType::Memory);

        let terminal = rx.recv().await.unwrap();
        assert!(terminal.finished);
        assert_eq!(terminal.cache_type, CacheType::None);
        assert_eq!(server.hits("/image.png"), 2);
        assert_eq!(
            server.last_headers().get("cache-control").unwrap(),
            "no-cache"
        );
    }

    #[tokio::test]
    async fn test_policy_can_decline_download() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        manager.set_download_policy(Some(Arc::new(|_: &Url| false)));

        let response = manager
            .load(server.url("/image.png"), WebImageOptions::empty())
            .await;

        assert!(response.finished);
        assert!(matches!(response.result, Ok(None)));
        assert_eq!(server.hits("/image.png"), 0);
    }

    #[tokio::test]
    async fn test_memory_only_skips_disk() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/image.png");

        manager.load(url.clone(), WebImageOptions::CACHE_MEMORY_ONLY).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.cached_image_exists(&url));
        assert!(!manager.disk_image_exists_async(&url).await);
    }

    #[tokio::test]
    async fn test_cancelled_request_gets_no_callbacks() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let (callback, mut rx) = collector();

        let handle = manager.request(
            server.url("/slow/cancel.png"),
            WebImageOptions::empty(),
            None,
            callback,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert!(!handle.is_running());
        let outcome = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(matches!(outcome, Ok(None) | Err(_)));
        assert!(!manager.is_failed(&server.url("/slow/cancel.png")));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_download() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let url = server.url("/slow/dedup.png");

        let (a, b) = tokio::join!(
            manager.load(url.clone(), WebImageOptions::empty()),
            manager.load(url.clone(), WebImageOptions::empty()),
        );

        assert!(a.image().is_some() && b.image().is_some());
        assert_eq!(server.hits("/slow/dedup.png"), 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let (callback, _rx) = collector();

        for name in ["one", "two"] {
            manager.request(
                server.url(&format!("/slow/{name}.png")),
                WebImageOptions::empty(),
                None,
                callback.clone(),
            );
        }
        assert!(manager.is_running());

        manager.cancel_all();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_cache_key_filter_and_transform() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        manager.set_cache_key_filter(Some(crate::infrastructure::imaging::cache_key::strip_query_filter()));
        manager.set_transform(Some(Arc::new(|_: &Url, image: Image| {
            Arc::new(image.grayscale())
        })));

        let first = manager
            .load(server.url("/image.png?v=1"), WebImageOptions::empty())
            .await;
        assert_eq!(first.image().unwrap().color(), image::ColorType::La8);

        let second = manager
            .load(server.url("/image.png?v=2"), WebImageOptions::empty())
            .await;
        assert_eq!(second.cache_type, CacheType::Memory);
    }

    #[tokio::test]
    async fn test_shared_download_is_transformed_and_stored_once() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let transforms = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = transforms.clone();
        manager.set_transform(Some(Arc::new(move |_: &Url, image: Image| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(image.grayscale())
        })));

        let url = server.url("/slow/dedup.png");
        let responses = futures_util::future::join_all(
            (0..4).map(|_| manager.load(url.clone(), WebImageOptions::empty())),
        )
        .await;

        let images: Vec<Image> = responses
            .iter()
            .map(|response| response.image().unwrap().clone())
            .collect();
        assert!(images.iter().all(|image| Arc::ptr_eq(image, &images[0])));
        assert_eq!(transforms.load(Ordering::SeqCst), 1);
        assert_eq!(server.hits("/slow/dedup.png"), 1);
    }

    #[tokio::test]
    async fn test_queued_dispatcher_defers_callbacks() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let (dispatcher, mut queue) = Dispatcher::queue();
        manager.set_dispatcher(dispatcher);
        let (callback, mut rx) = collector();

        let handle = manager.request(
            server.url("/image.png"),
            WebImageOptions::empty(),
            None,
            callback,
        );
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rx.try_recv().is_err());

        assert_eq!(queue.run_pending(), 1);
        assert!(rx.try_recv().unwrap().finished);
    }

    #[tokio::test]
    async fn test_progress_relay() {
        let server = TestServer::start().await;
        let (manager, _temp) = create_manager();
        let (callback, mut rx) = collector();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = seen.clone();
        manager.request(
            server.url("/image.png"),
            WebImageOptions::PROGRESSIVE_DOWNLOAD,
            Some(Arc::new(move |progress: &DownloadProgress| {
                recorder.lock().push(progress.received);
            })),
            callback,
        );

        assert!(rx.recv().await.unwrap().finished);
        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&(server.png().len() as u64)));
    }

    #[tokio::test]
    async fn test_save_image_to_cache() {
        let (manager, _temp) = create_manager();
        let url = Url::parse("https://example.com/local.png").unwrap();

        manager
            .save_image_to_cache(Arc::new(image::DynamicImage::new_rgb8(2, 2)), &url)
            .await
            .unwrap();

        assert!(manager.disk_image_exists(&url));
        assert!(manager.cached_image_exists_async(&url).await);
    }
}
