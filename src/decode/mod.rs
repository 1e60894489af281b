//! Thumbnail decoding: bytes in the byte cache to bounded-size thumbnails

mod queue;
mod request;
mod scheduler;
mod thumbnail;

pub use request::{DecodeOutcome, DecodeRequest, DecodeSeed, EnqueueOutcome, ItemId};
pub use scheduler::{
    DEFAULT_HORIZON, DEFAULT_THUMBNAIL_WIDTH, DecodeConfig, DecodeScheduler,
    default_max_concurrency,
};
pub use thumbnail::{ImageThumbnailDecoder, ThumbnailDecoder};

/// Errors from decoding a thumbnail
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("image decode failed: {0}")]
    Image(String),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("no cached bytes for {0}")]
    MissingSource(String),

    #[error("decode pool unavailable: {0}")]
    Pool(String),

    #[error("decode cancelled")]
    Cancelled,
}
