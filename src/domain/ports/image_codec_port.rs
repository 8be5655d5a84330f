//! Port definitions for image decoding and platform memory signals.

use crate::domain::errors::ImageResult;

/// Port turning fetched bytes into decoded images and back.
///
/// The engine treats bytes as opaque payload; implementations decide the encoding.
/// Implementations must be thread-safe.
#[cfg_attr(test, mockall::automock)]
pub trait ImageCodec: Send + Sync {
    /// Decodes a complete payload.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` if the bytes are not a valid image.
    fn decode(&self, bytes: &[u8]) -> ImageResult<image::DynamicImage>;

    /// Encodes an image for the disk cache.
    ///
    /// # Errors
    /// Returns `ImageError::Decode` if the image cannot be encoded.
    fn encode(&self, image: &image::DynamicImage) -> ImageResult<Vec<u8>>;

    /// Best-effort decode of a partially received payload.
    ///
    /// The default attempts a full decode, which only succeeds once `bytes` holds a
    /// complete image. Override it for formats with an incremental decoder.
    fn decode_partial(&self, bytes: &[u8]) -> Option<image::DynamicImage> {
        self.decode(bytes).ok()
    }
}

/// Platform low-memory signal. Receiving one clears the memory cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWarning;
