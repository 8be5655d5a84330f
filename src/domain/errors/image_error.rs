//! Image loading error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for image loading and caching operations.
pub type ImageResult<T> = std::result::Result<T, ImageError>;

/// Image loading error variants.
///
/// `Clone` so that one terminal outcome can be delivered to every subscriber of a download.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum ImageError {
    #[error("network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
    },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("download timed out after {after:?} without progress")]
    Timeout { after: Duration },

    #[error("failed to decode image: {message}")]
    Decode { message: String },

    #[error("downloaded image data is empty")]
    EmptyData,

    #[error("url previously failed and retry was not requested: {url}")]
    Blacklisted { url: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache filesystem error: {message}")]
    Filesystem { message: String },
}

impl ImageError {
    /// Creates network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
        }
    }

    /// Creates network error for a non-success HTTP status.
    #[must_use]
    pub fn http_status(status: reqwest::StatusCode) -> Self {
        Self::Network {
            message: format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
            status: Some(status.as_u16()),
        }
    }

    /// Creates connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates filesystem error.
    #[must_use]
    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::Filesystem {
            message: message.into(),
        }
    }

    /// Creates blacklist error.
    #[must_use]
    pub fn blacklisted(url: impl Into<String>) -> Self {
        Self::Blacklisted { url: url.into() }
    }

    /// Maps a transport error from the HTTP client.
    #[must_use]
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_connect() {
            Self::connection(error.to_string())
        } else if let Some(status) = error.status() {
            Self::http_status(status)
        } else {
            Self::network(error.to_string())
        }
    }

    /// Returns whether error came from the transport layer.
    #[must_use]
    pub const fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Returns whether error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns whether the failing url should be excluded from further attempts.
    ///
    /// Cancellations, timeouts and failures to reach the host are transient.
    #[must_use]
    pub const fn should_blacklist(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Decode { .. } | Self::EmptyData
        )
    }
}

impl From<std::io::Error> for ImageError {
    fn from(error: std::io::Error) -> Self {
        Self::filesystem(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ImageError::network("boom"), true ; "network")]
    #[test_case(ImageError::decode("bad"), true ; "decode")]
    #[test_case(ImageError::EmptyData, true ; "empty")]
    #[test_case(ImageError::Cancelled, false ; "cancelled")]
    #[test_case(ImageError::Timeout { after: Duration::from_secs(1) }, false ; "timeout")]
    #[test_case(ImageError::connection("refused"), false ; "connection")]
    #[test_case(ImageError::filesystem("disk full"), false ; "filesystem")]
    fn test_should_blacklist(error: ImageError, expected: bool) {
        assert_eq!(error.should_blacklist(), expected);
    }

    #[test]
    fn test_http_status_message() {
        let error = ImageError::http_status(reqwest::StatusCode::NOT_FOUND);
        assert_eq!(error.to_string(), "network error: HTTP 404: Not Found");
        assert!(error.is_network_error());
        assert!(matches!(error, ImageError::Network { status: Some(404), .. }));
    }
}
