//! In-memory caches for fetched image bytes and decoded thumbnails

mod bytes;
pub mod keys;
mod store;
mod thumbnails;

pub use bytes::{ByteCache, Payload};
pub use store::{CacheLimits, CacheStats, CacheUsage};
pub use thumbnails::{DecodedThumbnailCache, Thumbnail, ThumbnailHandle, estimated_cost};

/// Default byte cache: 400 images, 512 MiB
pub const DEFAULT_BYTE_LIMITS: CacheLimits = CacheLimits::new(400, 512 * 1024 * 1024);

/// Default thumbnail cache: 600 thumbnails, 256 MiB estimated
pub const DEFAULT_THUMBNAIL_LIMITS: CacheLimits = CacheLimits::new(600, 256 * 1024 * 1024);

/// Errors from cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("refusing to cache empty payload for {0}")]
    EmptyPayload(String),

    #[error("key {0} is outside the memory namespace")]
    ForeignKey(String),

    #[error("{key} needs {size} bytes, cache budget is {max_bytes}")]
    TooLarge {
        key: String,
        size: usize,
        max_bytes: usize,
    },

    #[error("invalid cache limits: max_entries={max_entries}, max_bytes={max_bytes}")]
    InvalidLimits { max_entries: usize, max_bytes: usize },
}
