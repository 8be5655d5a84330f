//! Domain layer with core value types, errors, and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CacheType, DownloaderOptions, Image, WebImageOptions};
pub use errors::{ImageError, ImageResult};
pub use ports::{ImageCodec, MemoryWarning};
