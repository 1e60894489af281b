//! Streaming gallery acquisition and caching.
//!
//! A gallery is an ordered list of page URLs, each showing one image. This
//! crate fetches those images concurrently into an in-memory byte cache,
//! delivers their cache keys strictly in page order as incremental batches,
//! resumes cancelled galleries from a snapshot, and decodes thumbnails
//! nearest-to-viewport first.

pub mod cache;
pub mod decode;
pub mod fetch;
pub mod gallery;
pub mod panic_handler;
pub mod services;
pub mod settings;

pub use gallery::{Batch, StreamRequest};
pub use services::GalleryServices;
pub use settings::Settings;
