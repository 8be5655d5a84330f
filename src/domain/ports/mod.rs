mod image_codec_port;

pub use image_codec_port::{ImageCodec, MemoryWarning};

#[cfg(test)]
pub mod mocks {
    pub use super::image_codec_port::MockImageCodec;
}
