//! Local HTTP server serving image fixtures to downloader and manager tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Url;

use crate::domain::ports::ImageCodec;

use super::codec::StandardCodec;

#[derive(Default)]
struct Recorded {
    hits: HashMap<String, usize>,
    last_headers: HeaderMap,
}

#[derive(Clone)]
struct ServerState {
    png: Bytes,
    recorded: Arc<Mutex<Recorded>>,
}

impl ServerState {
    fn new() -> Self {
        let size = TestServer::IMAGE_SIZE;
        let mut pixels = image::RgbaImage::new(size, size);
        pixels.put_pixel(3, 4, image::Rgba([200, 100, 50, 255]));
        let png = StandardCodec
            .encode(&image::DynamicImage::ImageRgba8(pixels))
            .unwrap();

        Self {
            png: Bytes::from(png),
            recorded: Arc::default(),
        }
    }
}

/// Fixture server bound to an ephemeral local port.
///
/// Paths: `/image.png`, `/slow/*` (200 ms delay), `/stall.png` (never answers in time),
/// `/protected.png` (basic auth), `/cookie/set.png` (sets a session cookie),
/// `/cookie/check.png` (403 without that cookie), `/garbage.png`, `/empty.png`; anything
/// else is 404.
pub struct TestServer {
    base: Url,
    state: ServerState,
}

impl TestServer {
    pub const IMAGE_SIZE: u32 = 8;
    pub const USERNAME: &'static str = "webimage";
    pub const PASSWORD: &'static str = "hunter2";
    const AUTHORIZATION: &'static str = "Basic d2ViaW1hZ2U6aHVudGVyMg==";
    const SESSION_COOKIE: &'static str = "session=webimage";

    pub async fn start() -> Self {
        let state = ServerState::new();
        let app = Router::new().fallback(serve).with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: Url::parse(&format!("http://{addr}")).unwrap(),
            state,
        }
    }

    /// Same fixtures over HTTPS, behind a freshly generated self-signed certificate.
    pub async fn start_tls() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let tls = RustlsConfig::from_pem(
            certified.cert.pem().into_bytes(),
            certified.key_pair.serialize_pem().into_bytes(),
        )
        .await
        .unwrap();

        let state = ServerState::new();
        let app = Router::new().fallback(serve).with_state(state.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum_server::from_tcp_rustls(listener, tls)
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        Self {
            base: Url::parse(&format!("https://{addr}")).unwrap(),
            state,
        }
    }

    pub fn url(&self, path_and_query: &str) -> Url {
        self.base.join(path_and_query).unwrap()
    }

    pub fn png(&self) -> Bytes {
        self.state.png.clone()
    }

    /// Requests seen for `path`, query ignored.
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .recorded
            .lock()
            .hits
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn last_headers(&self) -> HeaderMap {
        self.state.recorded.lock().last_headers.clone()
    }
}

async fn serve(State(state): State<ServerState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    {
        let mut recorded = state.recorded.lock();
        *recorded.hits.entry(path.clone()).or_default() += 1;
        recorded.last_headers = headers.clone();
    }

    let png = || ([(header::CONTENT_TYPE, "image/png")], state.png.clone()).into_response();

    match path.as_str() {
        "/image.png" => png(),
        "/stall.png" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            png()
        }
        "/protected.png" => {
            let authorized = headers
                .get(header::AUTHORIZATION)
                .is_some_and(|value| value == TestServer::AUTHORIZATION);
            if authorized {
                png()
            } else {
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Basic realm=\"fixtures\"")],
                )
                    .into_response()
            }
        }
        "/cookie/set.png" => (
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (
                    header::SET_COOKIE,
                    format!("{}; Path=/", TestServer::SESSION_COOKIE),
                ),
            ],
            state.png.clone(),
        )
            .into_response(),
        "/cookie/check.png" => {
            let has_session = headers
                .get_all(header::COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(';'))
                .any(|pair| pair.trim() == TestServer::SESSION_COOKIE);
            if has_session {
                png()
            } else {
                StatusCode::FORBIDDEN.into_response()
            }
        }
        "/garbage.png" => "definitely not an image".into_response(),
        "/empty.png" => StatusCode::OK.into_response(),
        p if p.starts_with("/slow/") => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            png()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
