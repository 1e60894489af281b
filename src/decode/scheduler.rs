//! Viewport-aware thumbnail decode scheduler
//!
//! Requests wait in a distance-ordered queue; a bounded number run on a
//! dedicated rayon pool. Outcomes go out over the flume channel returned by
//! [`DecodeScheduler::new`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::DecodeError;
use super::queue::DecodeQueue;
use super::request::{DecodeOutcome, DecodeRequest, DecodeSeed, EnqueueOutcome, ItemId};
use super::thumbnail::ThumbnailDecoder;
use crate::cache::{ByteCache, DecodedThumbnailCache, ThumbnailHandle};

/// Requests further than this from the pivot are dropped on rescore
pub const DEFAULT_HORIZON: usize = 200;

pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 320;

/// Available parallelism minus one, clamped to `2..=8`.
#[must_use]
pub fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .clamp(2, 8)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeConfig {
    pub max_concurrency: usize,
    pub horizon: usize,
    /// Decode width for every thumbnail this scheduler produces
    pub width: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            horizon: DEFAULT_HORIZON,
            width: DEFAULT_THUMBNAIL_WIDTH,
        }
    }
}

pub struct DecodeScheduler {
    queue: Mutex<DecodeQueue>,
    pool: rayon::ThreadPool,
    decoder: Arc<dyn ThumbnailDecoder>,
    bytes: Arc<ByteCache>,
    thumbnails: Arc<DecodedThumbnailCache>,
    outcomes: Sender<DecodeOutcome>,
    config: DecodeConfig,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl DecodeScheduler {
    pub fn new(
        config: DecodeConfig,
        decoder: Arc<dyn ThumbnailDecoder>,
        bytes: Arc<ByteCache>,
        thumbnails: Arc<DecodedThumbnailCache>,
    ) -> Result<(Arc<Self>, Receiver<DecodeOutcome>), DecodeError> {
        let config = DecodeConfig {
            max_concurrency: config.max_concurrency.max(1),
            width: config.width.max(1),
            ..config
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .thread_name(|i| format!("thumb-decode-{i}"))
            .build()
            .map_err(|e| DecodeError::Pool(e.to_string()))?;

        let (outcomes, receiver) = flume::unbounded();
        debug!(
            "Decode scheduler: {} workers, horizon {}, width {}",
            config.max_concurrency, config.horizon, config.width
        );

        let scheduler = Arc::new(Self {
            queue: Mutex::new(DecodeQueue::new(config.horizon)),
            pool,
            decoder,
            bytes,
            thumbnails,
            outcomes,
            config,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok((scheduler, receiver))
    }

    /// Queue a decode of `source_key` for `item`, scored against `pivot`.
    pub fn enqueue(
        self: &Arc<Self>,
        item: ItemId,
        source_key: &str,
        index: usize,
        pivot: usize,
    ) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Rejected;
        }
        if self.thumbnails.contains(source_key, self.config.width) {
            return EnqueueOutcome::AlreadyDecoded;
        }

        let outcome = self
            .lock()
            .push(DecodeSeed::new(item, source_key, index), pivot, &self.outcomes);
        if outcome == EnqueueOutcome::Queued {
            self.pump();
        }
        outcome
    }

    /// Rescore pending work against a new pivot, dropping requests past the
    /// horizon. Returns the number dropped.
    pub fn update_selected_index(&self, pivot: usize) -> usize {
        let dropped = self.lock().rescore(pivot);
        if dropped > 0 {
            debug!("Pivot {pivot}: dropped {dropped} decode requests past the horizon");
        }
        dropped
    }

    /// Replace all pending work with `seeds` scored against `pivot`,
    /// leaving running decodes alone. Returns how many seeds were queued.
    pub fn replace_pending_keep_running(
        self: &Arc<Self>,
        seeds: Vec<DecodeSeed>,
        pivot: usize,
    ) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let seeds: Vec<DecodeSeed> = seeds
            .into_iter()
            .filter(|seed| !self.thumbnails.contains(&seed.source_key, self.config.width))
            .collect();

        let queued = self.lock().replace_pending(seeds, pivot, &self.outcomes);
        self.pump();
        queued
    }

    /// Stop dispatching; queued and running work is kept.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(self: &Arc<Self>) {
        self.paused.store(false, Ordering::Release);
        self.pump();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Drop pending work and refuse new requests. Running decodes finish.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = self.lock().clear_pending();
        debug!("Decode scheduler shut down, {dropped} pending requests dropped");
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending_len()
    }

    #[must_use]
    pub fn running_len(&self) -> usize {
        self.lock().running_len()
    }

    #[must_use]
    pub fn horizon(&self) -> usize {
        self.lock().horizon()
    }

    #[must_use]
    pub fn config(&self) -> DecodeConfig {
        self.config
    }

    /// Dispatch nearest requests until the concurrency cap is reached.
    fn pump(self: &Arc<Self>) {
        loop {
            if self.paused.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
                return;
            }
            let next = {
                let mut queue = self.lock();
                if queue.running_len() >= self.config.max_concurrency {
                    return;
                }
                queue.pop_next()
            };
            let Some(request) = next else {
                return;
            };

            let this = Arc::clone(self);
            self.pool.spawn(move || this.run(request));
        }
    }

    fn run(self: Arc<Self>, request: DecodeRequest) {
        let result = if self.closed.load(Ordering::Acquire) {
            Err(DecodeError::Cancelled)
        } else {
            self.decode(&request.source_key)
        };

        match &result {
            Ok(handle) => {
                let cached = self.thumbnails.add(
                    &request.source_key,
                    self.config.width,
                    Arc::clone(handle),
                );
                if let Err(e) = cached {
                    warn!("Thumbnail for {} not cached: {e}", request.source_key);
                }
            }
            Err(DecodeError::Cancelled) => {}
            Err(e) => warn!("Decode of {} failed: {e}", request.source_key),
        }

        self.lock().finish(&request.source_key);
        let _ = request.dispatch.send(DecodeOutcome {
            item: request.item,
            source_key: request.source_key,
            index: request.index,
            width: self.config.width,
            result,
        });
        self.pump();
    }

    fn decode(&self, source_key: &str) -> Result<ThumbnailHandle, DecodeError> {
        if let Some(hit) = self.thumbnails.get(source_key, self.config.width) {
            return Ok(hit);
        }
        let bytes = self
            .bytes
            .try_get(source_key)
            .ok_or_else(|| DecodeError::MissingSource(source_key.to_string()))?;
        let thumbnail = self.decoder.decode(&bytes, self.config.width)?;
        Ok(Arc::new(thumbnail))
    }

    fn lock(&self) -> MutexGuard<'_, DecodeQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
