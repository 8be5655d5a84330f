//! Domain entity definitions.

mod cache_key;
mod credential;
mod decoded_image;
mod options;

pub use cache_key::CacheKey;
pub use credential::Credential;
pub use decoded_image::{CacheType, Image, image_cost};
pub use options::{DownloaderOptions, ExecutionOrder, WebImageOptions};
