//! Decoded image and cache tier types.

use std::sync::Arc;

/// A decoded image shared between the memory cache and every caller that received it.
pub type Image = Arc<image::DynamicImage>;

/// Where a result was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheType {
    /// Not served from any cache: downloaded from the network, or no image at all.
    #[default]
    None,
    /// Read from the disk cache and decoded.
    Disk,
    /// Served from the in-memory cache.
    Memory,
}

impl CacheType {
    /// Returns true if the result came from either cache tier.
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::Disk | Self::Memory)
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "network"),
            Self::Disk => write!(f, "disk"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Memory cost of a decoded image: the size of its pixel buffer in bytes.
#[must_use]
pub fn image_cost(image: &image::DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_cost_counts_pixel_bytes() {
        let img = image::DynamicImage::new_rgba8(10, 5);
        assert_eq!(image_cost(&img), 10 * 5 * 4);
    }

    #[test]
    fn test_cache_type_display() {
        assert_eq!(CacheType::Memory.to_string(), "memory");
        assert_eq!(CacheType::Disk.to_string(), "disk");
        assert_eq!(CacheType::None.to_string(), "network");
        assert!(!CacheType::None.is_cached());
    }
}
