//! Decode request and outcome types

use flume::Sender;

use super::DecodeError;
use crate::cache::ThumbnailHandle;

/// Opaque reference to the display entity waiting for a thumbnail
pub type ItemId = u64;

/// Minimal description of decode work, before it is scored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeSeed {
    pub item: ItemId,
    pub source_key: String,
    pub index: usize,
}

impl DecodeSeed {
    pub fn new(item: ItemId, source_key: impl Into<String>, index: usize) -> Self {
        Self {
            item,
            source_key: source_key.into(),
            index,
        }
    }
}

/// Queued decode work
#[derive(Clone, Debug)]
pub struct DecodeRequest {
    pub item: ItemId,
    pub source_key: String,
    /// Position in the gallery list
    pub index: usize,
    /// Distance from the pivot index; lower dispatches first
    pub priority: usize,
    /// Insertion order, breaks priority ties
    pub seq: u64,
    /// Where the outcome is delivered
    pub dispatch: Sender<DecodeOutcome>,
}

impl DecodeRequest {
    pub(crate) fn rescore(&mut self, pivot: usize) {
        self.priority = self.index.abs_diff(pivot);
    }
}

/// What `enqueue` did with a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A thumbnail at the scheduler width is already cached
    AlreadyDecoded,
    /// The same source is already pending or running
    Coalesced,
    /// The scheduler is shut down
    Rejected,
}

/// Result of one decode, sent on the request's dispatch channel
#[derive(Debug)]
pub struct DecodeOutcome {
    pub item: ItemId,
    pub source_key: String,
    pub index: usize,
    pub width: u32,
    pub result: Result<ThumbnailHandle, DecodeError>,
}
