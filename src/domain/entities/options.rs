//! Option sets for downloads and managed requests.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Per-download behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DownloaderOptions: u32 {
        /// Deferred behind normal and high priority tasks in the Ready queue.
        const LOW_PRIORITY = 1 << 0;
        /// Run the codec's partial decode after every chunk and report what it yields.
        ///
        /// `StandardCodec` does not decode incrementally: it produces an image only once the
        /// buffer holds the complete payload, so a partial image first appears with the last
        /// chunk. Codecs with incremental decoders report earlier.
        const PROGRESSIVE_DOWNLOAD = 1 << 1;
        /// Let intermediate HTTP caches answer. Without it every request asks for a fresh copy.
        const USE_URL_CACHE = 1 << 2;
        /// Always ask for a fresh copy, even with `USE_URL_CACHE`.
        const IGNORE_CACHED_RESPONSE = 1 << 3;
        /// Keep running when the host enters the background.
        const CONTINUE_IN_BACKGROUND = 1 << 4;
        /// Store and send cookies for this request.
        const HANDLE_COOKIES = 1 << 5;
        /// Accept any server certificate. Unsafe outside development.
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 6;
        /// Promoted ahead of normal and low priority tasks in the Ready queue.
        const HIGH_PRIORITY = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `ImageManager::request`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct WebImageOptions: u32 {
        /// Try the network again even if the URL failed before.
        const RETRY_FAILED = 1 << 0;
        /// Download with low priority.
        const LOW_PRIORITY = 1 << 1;
        /// Keep the result out of the disk cache.
        const CACHE_MEMORY_ONLY = 1 << 2;
        /// Report partial images while downloading, as far as the codec can decode them.
        /// See [`DownloaderOptions::PROGRESSIVE_DOWNLOAD`].
        const PROGRESSIVE_DOWNLOAD = 1 << 3;
        /// Re-download even on a cache hit. The cached image is delivered first as a
        /// non-terminal response.
        const REFRESH_CACHED = 1 << 4;
        /// Keep running when the host enters the background.
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        /// Store and send cookies.
        const HANDLE_COOKIES = 1 << 6;
        /// Accept any server certificate. Unsafe outside development.
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 7;
        /// Download with high priority.
        const HIGH_PRIORITY = 1 << 8;
    }
}

impl WebImageOptions {
    /// Translates request flags into the flags of the underlying download.
    #[must_use]
    pub fn to_downloader_options(self) -> DownloaderOptions {
        let pairs = [
            (Self::LOW_PRIORITY, DownloaderOptions::LOW_PRIORITY),
            (Self::HIGH_PRIORITY, DownloaderOptions::HIGH_PRIORITY),
            (
                Self::PROGRESSIVE_DOWNLOAD,
                DownloaderOptions::PROGRESSIVE_DOWNLOAD,
            ),
            (
                Self::CONTINUE_IN_BACKGROUND,
                DownloaderOptions::CONTINUE_IN_BACKGROUND,
            ),
            (Self::HANDLE_COOKIES, DownloaderOptions::HANDLE_COOKIES),
            (
                Self::ALLOW_INVALID_SSL_CERTIFICATES,
                DownloaderOptions::ALLOW_INVALID_SSL_CERTIFICATES,
            ),
            (
                Self::REFRESH_CACHED,
                DownloaderOptions::USE_URL_CACHE.union(DownloaderOptions::IGNORE_CACHED_RESPONSE),
            ),
        ];

        pairs
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(DownloaderOptions::empty(), |acc, (_, mapped)| acc | mapped)
    }
}

/// Which Ready download is promoted when a concurrency slot frees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// Longest-waiting first.
    #[default]
    Fifo,
    /// Most recently enqueued first.
    Lifo,
}

impl std::fmt::Display for ExecutionOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Lifo => write!(f, "lifo"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(WebImageOptions::LOW_PRIORITY, DownloaderOptions::LOW_PRIORITY ; "low_priority")]
    #[test_case(WebImageOptions::HIGH_PRIORITY, DownloaderOptions::HIGH_PRIORITY ; "high_priority")]
    #[test_case(WebImageOptions::PROGRESSIVE_DOWNLOAD, DownloaderOptions::PROGRESSIVE_DOWNLOAD ; "progressive")]
    #[test_case(WebImageOptions::HANDLE_COOKIES, DownloaderOptions::HANDLE_COOKIES ; "cookies")]
    #[test_case(
        WebImageOptions::ALLOW_INVALID_SSL_CERTIFICATES,
        DownloaderOptions::ALLOW_INVALID_SSL_CERTIFICATES ;
        "invalid_tls"
    )]
    #[test_case(
        WebImageOptions::REFRESH_CACHED,
        DownloaderOptions::USE_URL_CACHE.union(DownloaderOptions::IGNORE_CACHED_RESPONSE) ;
        "refresh_cached"
    )]
    #[test_case(WebImageOptions::RETRY_FAILED, DownloaderOptions::empty() ; "retry_failed_is_manager_only")]
    #[test_case(WebImageOptions::CACHE_MEMORY_ONLY, DownloaderOptions::empty() ; "memory_only_is_manager_only")]
    fn test_option_translation(input: WebImageOptions, expected: DownloaderOptions) {
        assert_eq!(input.to_downloader_options(), expected);
    }

    #[test]
    fn test_combined_translation_keeps_independent_flags() {
        let options = WebImageOptions::LOW_PRIORITY
            | WebImageOptions::HANDLE_COOKIES
            | WebImageOptions::RETRY_FAILED;
        assert_eq!(
            options.to_downloader_options(),
            DownloaderOptions::LOW_PRIORITY | DownloaderOptions::HANDLE_COOKIES
        );
    }
}
