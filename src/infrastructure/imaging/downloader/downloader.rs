//! Bounded-concurrency download scheduler with per-URL deduplication.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AsHeaderName, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{Credential, DownloaderOptions, ExecutionOrder};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::ImageCodec;

use super::operation::{
    self, DownloadProgress, Downloaded, OperationRequest, OperationState,
};
use super::queue::{Priority, ReadyQueue};

/// Default number of simultaneous downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 6;

/// Default time without progress before a download fails.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Progress callback, shared by every notification of one subscriber.
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Rewrites the headers of each request just before it is sent.
pub type HeadersFilter = Arc<dyn Fn(&Url, HeaderMap) -> HeaderMap + Send + Sync>;

type CompletionCallback = Box<dyn FnOnce(ImageResult<Downloaded>) + Send>;
type CancelCallback = Box<dyn FnOnce() + Send>;

/// Settings applied to every download started after they are set.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Executing downloads allowed at once.
    pub max_concurrent_downloads: usize,
    /// Time without progress before a download fails with a timeout.
    pub download_timeout: Duration,
    /// Promotion order of Ready downloads within one priority lane.
    pub execution_order: ExecutionOrder,
    /// Headers sent with every request.
    pub default_headers: HeaderMap,
    /// Credential answered to authentication challenges.
    pub credential: Option<Credential>,
    /// Accept any server certificate for every request. Unsafe outside development.
    pub trust_all_certificates: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static("image/*,*/*;q=0.8"),
        );
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            execution_order: ExecutionOrder::default(),
            default_headers,
            credential: None,
            trust_all_certificates: false,
        }
    }
}

/// Start and stop notifications for network activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// A download moved from Ready to Executing.
    Started {
        /// The URL being fetched.
        url: Url,
    },
    /// An Executing download finished, failed, or was cancelled.
    Stopped {
        /// The URL that was fetched.
        url: Url,
    },
}

struct Subscriber {
    id: u64,
    progress: Option<ProgressCallback>,
    completion: CompletionCallback,
    cancel: Option<CancelCallback>,
}

struct Task {
    id: u64,
    options: DownloaderOptions,
    state: OperationState,
    token: CancellationToken,
    subscribers: Vec<Subscriber>,
}

struct State {
    config: DownloaderConfig,
    headers_filter: Option<HeadersFilter>,
    tasks: HashMap<Url, Task>,
    queue: ReadyQueue,
    executing: usize,
    suspended: bool,
    clients: HashMap<(bool, bool), Client>,
}

struct Shared {
    state: Mutex<State>,
    codec: Arc<dyn ImageCodec>,
    events: broadcast::Sender<DownloadEvent>,
    next_id: AtomicU64,
}

/// Prioritised, deduplicating download scheduler.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Downloader {
    shared: Arc<Shared>,
}

impl Downloader {
    /// Creates a downloader that decodes payloads with `codec`.
    #[must_use]
    pub fn new(config: DownloaderConfig, codec: Arc<dyn ImageCodec>) -> Self {
        let (events, _) = broadcast::channel(64);
        let queue = ReadyQueue::new(config.execution_order);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    headers_filter: None,
                    tasks: HashMap::new(),
                    queue,
                    executing: 0,
                    suspended: false,
                    clients: HashMap::new(),
                }),
                codec,
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fetches `url`, or joins the download already pending for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn fetch<F>(
        &self,
        url: Url,
        options: DownloaderOptions,
        on_progress: Option<ProgressCallback>,
        on_completion: F,
    ) -> DownloadHandle
    where
        F: FnOnce(ImageResult<Downloaded>) + Send + 'static,
    {
        self.subscribe_to(url, options, on_progress, Box::new(on_completion), None)
    }

    /// Like [`Downloader::fetch`], with a callback fired instead of `on_completion` if this
    /// subscription is cancelled.
    pub fn fetch_with_cancel<F, C>(
        &self,
        url: Url,
        options: DownloaderOptions,
        on_progress: Option<ProgressCallback>,
        on_completion: F,
        on_cancel: C,
    ) -> DownloadHandle
    where
        F: FnOnce(ImageResult<Downloaded>) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.subscribe_to(
            url,
            options,
            on_progress,
            Box::new(on_completion),
            Some(Box::new(on_cancel)),
        )
    }

    /// Fetches `url` and waits for the outcome.
    ///
    /// # Errors
    /// Returns the download error, or `ImageError::Cancelled` if the download was cancelled.
    pub async fn download(&self, url: Url, options: DownloaderOptions) -> ImageResult<Downloaded> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let cancel_tx = tx.clone();

        let _handle = self.fetch_with_cancel(
            url,
            options,
            None,
            move |result| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(result);
                }
            },
            move || {
                if let Some(tx) = cancel_tx.lock().take() {
                    let _ = tx.send(Err(ImageError::Cancelled));
                }
            },
        );

        rx.await.unwrap_or(Err(ImageError::Cancelled))
    }

    fn subscribe_to(
        &self,
        url: Url,
        options: DownloaderOptions,
        progress: Option<ProgressCallback>,
        completion: CompletionCallback,
        cancel: Option<CancelCallback>,
    ) -> DownloadHandle {
        let subscriber_id = self.shared.next_id();
        let subscriber = Subscriber {
            id: subscriber_id,
            progress,
            completion,
            cancel,
        };

        let task_id = {
            let mut state = self.shared.state.lock();
            if let Some(task) = state.tasks.get_mut(&url) {
                task.subscribers.push(subscriber);
                debug!(url = %url, subscribers = task.subscribers.len(), "Joined pending download");
                task.id
            } else {
                let task_id = self.shared.next_id();
                state.tasks.insert(
                    url.clone(),
                    Task {
                        id: task_id,
                        options,
                        state: OperationState::Ready,
                        token: CancellationToken::new(),
                        subscribers: vec![subscriber],
                    },
                );
                state.queue.push(url.clone(), Priority::from_options(options));
                trace!(url = %url, ?options, "Queued download");
                task_id
            }
        };

        Shared::pump(&self.shared);

        DownloadHandle {
            url,
            task_id,
            subscriber_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Pauses or resumes promotion of Ready downloads. Executing downloads keep running.
    pub fn set_suspended(&self, suspended: bool) {
        self.shared.state.lock().suspended = suspended;
        debug!(suspended, "Downloader suspension changed");
        if !suspended {
            Shared::pump(&self.shared);
        }
    }

    /// Returns true if promotion is paused.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    /// Returns the number of Executing downloads.
    #[must_use]
    pub fn current_download_count(&self) -> usize {
        self.shared.state.lock().executing
    }

    /// Returns the number of Ready downloads waiting for a slot.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns a copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> DownloaderConfig {
        self.shared.state.lock().config.clone()
    }

    /// Returns a default header value.
    #[must_use]
    pub fn header(&self, name: impl AsHeaderName) -> Option<HeaderValue> {
        self.shared.state.lock().config.default_headers.get(name).cloned()
    }

    /// Sets a default header, or removes it with `None`.
    pub fn set_header(&self, name: HeaderName, value: Option<HeaderValue>) {
        let mut state = self.shared.state.lock();
        match value {
            Some(value) => {
                state.config.default_headers.insert(name, value);
            }
            None => {
                state.config.default_headers.remove(name);
            }
        }
    }

    /// Installs or removes the per-request header filter.
    pub fn set_headers_filter(&self, filter: Option<HeadersFilter>) {
        self.shared.state.lock().headers_filter = filter;
    }

    /// Sets the credential answered to authentication challenges.
    pub fn set_credential(&self, credential: Option<Credential>) {
        self.shared.state.lock().config.credential = credential;
    }

    /// Changes the promotion order of Ready downloads.
    pub fn set_execution_order(&self, order: ExecutionOrder) {
        let mut state = self.shared.state.lock();
        state.config.execution_order = order;
        state.queue.set_order(order);
    }

    /// Returns the promotion order of Ready downloads.
    #[must_use]
    pub fn execution_order(&self) -> ExecutionOrder {
        self.shared.state.lock().queue.order()
    }

    /// Changes the concurrency limit. Raising it promotes waiting downloads immediately.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.shared.state.lock().config.max_concurrent_downloads = max;
        Shared::pump(&self.shared);
    }

    /// Changes the no-progress timeout of downloads started from now on.
    pub fn set_download_timeout(&self, timeout: Duration) {
        self.shared.state.lock().config.download_timeout = timeout;
    }

    /// Subscribes to download start and stop notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Cancels every download. Each subscriber's cancel callback fires.
    pub fn cancel_all(&self) {
        let count = Shared::cancel_where(&self.shared, |_| true);
        if count > 0 {
            info!(count, "Cancelled all downloads");
        }
    }

    /// Cancels every download not marked `CONTINUE_IN_BACKGROUND`.
    pub fn enter_background(&self) {
        let count = Shared::cancel_where(&self.shared, |options| {
            !options.contains(DownloaderOptions::CONTINUE_IN_BACKGROUND)
        });
        info!(count, "Cancelled foreground-only downloads");
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Downloader")
            .field("executing", &state.executing)
            .field("queued", &state.queue.len())
            .field("suspended", &state.suspended)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Promotes Ready downloads while slots are free.
    fn pump(self: &Arc<Self>) {
        loop {
            let (url, task_id, token, request) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.suspended || state.executing >= state.config.max_concurrent_downloads.max(1)
                {
                    return;
                }
                let Some(url) = state.queue.pop() else {
                    return;
                };
                let Some(task) = state.tasks.get_mut(&url) else {
                    continue;
                };
                task.state = OperationState::Executing;
                let (task_id, token, options) = (task.id, task.token.clone(), task.options);
                state.executing += 1;

                let request = Self::prepare(state, &self.codec, &url, options);
                (url, task_id, token, request)
            };

            debug!(url = %url, "Starting download");
            let _ = self.events.send(DownloadEvent::Started { url: url.clone() });

            let shared = self.clone();
            tokio::spawn(async move {
                let result = match request {
                    Ok(request) => {
                        let reporter = shared.clone();
                        let progress_url = url.clone();
                        let running = tokio::spawn(operation::execute(
                            request,
                            token,
                            move |progress| {
                                reporter.report_progress(&progress_url, task_id, &progress);
                            },
                        ));
                        // The slot and the subscribers are released even if the operation panics.
                        running.await.unwrap_or_else(|e| {
                            warn!(url = %url, error = %e, "Download task aborted");
                            Err(ImageError::network(format!("download task aborted: {e}")))
                        })
                    }
                    Err(e) => Err(e),
                };
                shared.finish(&url, task_id, result);
            });
        }
    }

    fn prepare(
        state: &mut State,
        codec: &Arc<dyn ImageCodec>,
        url: &Url,
        options: DownloaderOptions,
    ) -> ImageResult<OperationRequest> {
        let cookies = options.contains(DownloaderOptions::HANDLE_COOKIES);
        let invalid_tls = state.config.trust_all_certificates
            || options.contains(DownloaderOptions::ALLOW_INVALID_SSL_CERTIFICATES);

        let client = match state.clients.get(&(cookies, invalid_tls)) {
            Some(client) => client.clone(),
            None => {
                if invalid_tls {
                    warn!(url = %url, "Accepting invalid TLS certificates");
                }
                let client = operation::build_client(cookies, invalid_tls)?;
                state.clients.insert((cookies, invalid_tls), client.clone());
                client
            }
        };

        let mut headers = state.config.default_headers.clone();
        if let Some(filter) = &state.headers_filter {
            headers = filter(url, headers);
        }
        operation::apply_cache_policy(&mut headers, options);

        Ok(OperationRequest {
            url: url.clone(),
            options,
            client,
            headers,
            credential: state.config.credential.clone(),
            timeout: state.config.download_timeout,
            codec: codec.clone(),
        })
    }

    fn report_progress(&self, url: &Url, task_id: u64, progress: &DownloadProgress) {
        let callbacks: Vec<ProgressCallback> = {
            let state = self.state.lock();
            state
                .tasks
                .get(url)
                .filter(|task| task.id == task_id)
                .map(|task| {
                    task.subscribers
                        .iter()
                        .filter_map(|s| s.progress.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for callback in callbacks {
            invoke_guarded(url, "progress", || callback(progress));
        }
    }

    fn finish(self: &Arc<Self>, url: &Url, task_id: u64, result: ImageResult<Downloaded>) {
        let subscribers = {
            let mut state = self.state.lock();
            state.executing = state.executing.saturating_sub(1);
            let owned = state.tasks.get(url).is_some_and(|task| task.id == task_id);
            if owned {
                state
                    .tasks
                    .remove(url)
                    .map(|task| task.subscribers)
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        let _ = self.events.send(DownloadEvent::Stopped { url: url.clone() });

        match &result {
            Ok(_) => debug!(url = %url, subscribers = subscribers.len(), "Download succeeded"),
            Err(ImageError::Cancelled) => trace!(url = %url, "Download stopped after cancel"),
            Err(e) => debug!(url = %url, error = %e, "Download failed"),
        }

        if matches!(result, Err(ImageError::Cancelled)) {
            for subscriber in subscribers {
                if let Some(cancel) = subscriber.cancel {
                    invoke_guarded(url, "cancel", cancel);
                }
            }
        } else {
            for subscriber in subscribers {
                let result = result.clone();
                invoke_guarded(url, "completion", || (subscriber.completion)(result));
            }
        }

        self.pump();
    }

    /// Detaches one subscriber. The task is aborted once nobody is left.
    fn detach(&self, url: &Url, task_id: u64, subscriber_id: u64) {
        let cancel = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(task) = state.tasks.get_mut(url).filter(|task| task.id == task_id) else {
                return;
            };
            let Some(pos) = task.subscribers.iter().position(|s| s.id == subscriber_id) else {
                return;
            };
            let subscriber = task.subscribers.remove(pos);

            if task.subscribers.is_empty()
                && let Some(task) = state.tasks.remove(url)
            {
                match task.state {
                    OperationState::Ready => {
                        state.queue.remove(url);
                        debug!(url = %url, "Removed unwanted download from queue");
                    }
                    _ => {
                        task.token.cancel();
                        debug!(url = %url, "Aborting download with no subscribers");
                    }
                }
            }
            subscriber.cancel
        };

        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Cancels every task whose options match. Returns how many were cancelled.
    fn cancel_where(self: &Arc<Self>, matches: impl Fn(DownloaderOptions) -> bool) -> usize {
        let mut detached = Vec::new();
        let mut count = 0;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let selected: Vec<Url> = state
                .tasks
                .iter()
                .filter(|(_, task)| matches(task.options))
                .map(|(url, _)| url.clone())
                .collect();

            for url in selected {
                let Some(task) = state.tasks.remove(&url) else {
                    continue;
                };
                count += 1;
                if task.state == OperationState::Ready {
                    state.queue.remove(&url);
                } else {
                    task.token.cancel();
                }
                detached.extend(task.subscribers);
            }
        }

        for subscriber in detached {
            if let Some(cancel) = subscriber.cancel {
                cancel();
            }
        }
        count
    }
}

/// Runs a caller-supplied callback so that a panic in it cannot starve the other
/// subscribers of the same download.
fn invoke_guarded(url: &Url, kind: &'static str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(url = %url, kind, "Download callback panicked");
    }
}

/// One caller's attachment to a download.
///
/// Dropping the handle does not cancel. Cancelling detaches only this caller; the download
/// continues while other callers remain attached.
#[derive(Clone)]
pub struct DownloadHandle {
    url: Url,
    task_id: u64,
    subscriber_id: u64,
    cancelled: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl DownloadHandle {
    /// Returns the URL being fetched.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Detaches this caller and fires its cancel callback, if it was still attached.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(&self.url, self.task_id, self.subscriber_id);
        }
    }

    /// Returns the state of the underlying download as seen by this caller.
    #[must_use]
    pub fn state(&self) -> OperationState {
        if self.cancelled.load(Ordering::SeqCst) {
            return OperationState::Cancelled;
        }
        self.shared
            .upgrade()
            .and_then(|shared| {
                shared
                    .state
                    .lock()
                    .tasks
                    .get(&self.url)
                    .filter(|task| task.id == self.task_id)
                    .map(|task| task.state)
            })
            .unwrap_or(OperationState::Finished)
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}
