//! One in-flight fetch of a single URL.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Upper bound on the buffer reserved from `Content-Length`. Larger bodies grow on demand.
const MAX_PREALLOCATION: usize = 4 * 1024 * 1024;

use crate::domain::entities::{Credential, DownloaderOptions, Image};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::ImageCodec;

/// Lifecycle of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Waiting for a concurrency slot.
    Ready,
    /// Request issued, body streaming.
    Executing,
    /// Terminal outcome delivered.
    Finished,
    /// Aborted before completion.
    Cancelled,
}

/// Progress of a running download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// The URL being fetched.
    pub url: Url,
    /// Bytes received so far.
    pub received: u64,
    /// Total size announced by the server, if any.
    pub expected: Option<u64>,
    /// Best-effort decode of the bytes received so far, for progressive downloads.
    pub partial: Option<Image>,
}

/// Successful download: the decoded image and the bytes it came from.
///
/// Every subscriber of one download receives a clone sharing the same finalized slot.
#[derive(Debug, Clone)]
pub struct Downloaded {
    /// Decoded image.
    pub image: Image,
    /// Raw response body.
    pub data: Bytes,
    finalized: Arc<OnceLock<Image>>,
}

impl Downloaded {
    pub(super) fn new(image: Image, data: Bytes) -> Self {
        Self {
            image,
            data,
            finalized: Arc::default(),
        }
    }

    /// Runs `finalize` for the first subscriber only. Later subscribers get its result
    /// without running it again.
    pub fn finalize_once(&self, finalize: impl FnOnce(&Self) -> Image) -> Image {
        self.finalized.get_or_init(|| finalize(self)).clone()
    }
}

/// Everything an operation needs, snapshotted from the downloader configuration when the
/// operation is admitted.
pub(super) struct OperationRequest {
    pub url: Url,
    pub options: DownloaderOptions,
    pub client: Client,
    pub headers: HeaderMap,
    pub credential: Option<Credential>,
    pub timeout: Duration,
    pub codec: Arc<dyn ImageCodec>,
}

/// Builds a client for one combination of cookie handling and certificate trust.
pub(super) fn build_client(cookies: bool, accept_invalid_certs: bool) -> ImageResult<Client> {
    Client::builder()
        .user_agent(concat!("webimage/", env!("CARGO_PKG_VERSION")))
        .cookie_store(cookies)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .gzip(true)
        .build()
        .map_err(|e| ImageError::connection(format!("failed to create HTTP client: {e}")))
}

/// Applies the per-request cache policy on top of the configured headers.
pub(super) fn apply_cache_policy(headers: &mut HeaderMap, options: DownloaderOptions) {
    if !options.contains(DownloaderOptions::USE_URL_CACHE)
        || options.contains(DownloaderOptions::IGNORE_CACHED_RESPONSE)
    {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
}

/// Runs the request until it finishes or `cancel` fires.
pub(super) async fn execute<P>(
    request: OperationRequest,
    cancel: CancellationToken,
    on_progress: P,
) -> ImageResult<Downloaded>
where
    P: Fn(DownloadProgress) + Send + Sync,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(url = %request.url, "Download cancelled");
            Err(ImageError::Cancelled)
        }
        result = run(&request, &on_progress) => result,
    }
}

async fn run<P>(request: &OperationRequest, on_progress: &P) -> ImageResult<Downloaded>
where
    P: Fn(DownloadProgress) + Send + Sync,
{
    let mut response = send(request, None).await?;

    if response.status() == StatusCode::UNAUTHORIZED
        && let Some(credential) = &request.credential
    {
        debug!(url = %request.url, user = credential.username(), "Answering authentication challenge");
        response = send(request, Some(credential)).await?;
    }

    let status = response.status();
    if !status.is_success() {
        return Err(ImageError::http_status(status));
    }

    let expected = response.content_length();
    let progressive = request.options.contains(DownloaderOptions::PROGRESSIVE_DOWNLOAD);
    let mut buffer: Vec<u8> = Vec::with_capacity(initial_capacity(expected));

    on_progress(DownloadProgress {
        url: request.url.clone(),
        received: 0,
        expected,
        partial: None,
    });

    while let Some(chunk) = next_chunk(&mut response, request.timeout).await? {
        buffer.extend_from_slice(&chunk);
        trace!(url = %request.url, received = buffer.len(), "Received chunk");

        let partial = if progressive {
            let codec = request.codec.clone();
            let snapshot = buffer.clone();
            tokio::task::spawn_blocking(move || codec.decode_partial(&snapshot))
                .await
                .ok()
                .flatten()
                .map(Arc::new)
        } else {
            None
        };

        on_progress(DownloadProgress {
            url: request.url.clone(),
            received: buffer.len() as u64,
            expected,
            partial,
        });
    }

    if buffer.is_empty() {
        return Err(ImageError::EmptyData);
    }

    let data = Bytes::from(buffer);
    let codec = request.codec.clone();
    let payload = data.clone();
    let image = tokio::task::spawn_blocking(move || codec.decode(&payload))
        .await
        .map_err(|e| ImageError::decode(format!("decode task panicked: {e}")))??;

    debug!(url = %request.url, size = data.len(), "Download finished");
    Ok(Downloaded::new(Arc::new(image), data))
}

/// The announced length is untrusted, so only a bounded amount is reserved up front.
fn initial_capacity(expected: Option<u64>) -> usize {
    expected
        .and_then(|n| usize::try_from(n).ok())
        .map_or(0, |n| n.min(MAX_PREALLOCATION))
}

async fn send(request: &OperationRequest, credential: Option<&Credential>) -> ImageResult<Response> {
    let mut builder = request
        .client
        .get(request.url.clone())
        .headers(request.headers.clone());
    if let Some(credential) = credential {
        builder = builder.basic_auth(credential.username(), Some(credential.password()));
    }

    tokio::time::timeout(request.timeout, builder.send())
        .await
        .map_err(|_| ImageError::Timeout {
            after: request.timeout,
        })?
        .map_err(|e| ImageError::from_reqwest(&e))
}

async fn next_chunk(response: &mut Response, timeout: Duration) -> ImageResult<Option<Bytes>> {
    tokio::time::timeout(timeout, response.chunk())
        .await
        .map_err(|_| ImageError::Timeout { after: timeout })?
        .map_err(|e| ImageError::from_reqwest(&e))
}
