//! Gallery sessions: fetch progress, lifecycle and ordered streaming

mod registry;
mod session;
mod stream;
mod worker;

pub use registry::SessionRegistry;
pub use session::{FinishOutcome, GallerySession, PageSignature, PartialSnapshot, SessionPhase};
pub use stream::{
    Batch, DEFAULT_BATCH_SIZE, DEFAULT_CHECK_INTERVAL, DEFAULT_TAIL_FLUSH, ProgressCallback,
    StreamOptions, StreamRequest, StreamingCoordinator,
};
pub use worker::{FetchContext, run_session};
