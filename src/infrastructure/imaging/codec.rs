//! Default codec backed by the `image` crate.

use std::io::Cursor;

use image::ImageFormat;

use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::ImageCodec;

/// Decodes any format the `image` crate was built with and encodes to PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCodec;

impl ImageCodec for StandardCodec {
    fn decode(&self, bytes: &[u8]) -> ImageResult<image::DynamicImage> {
        if bytes.is_empty() {
            return Err(ImageError::EmptyData);
        }
        image::load_from_memory(bytes).map_err(|e| ImageError::decode(e.to_string()))
    }

    fn encode(&self, image: &image::DynamicImage) -> ImageResult<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| ImageError::decode(format!("failed to encode image: {e}")))?;
        Ok(buffer.into_inner())
    }
}
