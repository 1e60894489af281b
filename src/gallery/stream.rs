//! Ordered, delta-batched consumption of a gallery session
//!
//! Each call to [`StreamingCoordinator::stream`] walks a cursor over the
//! session's resolved keys. Keys are released strictly in index order: an
//! index is only delivered once every lower index has been delivered, so
//! out-of-order fetch completions are held back until the gap closes.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use log::debug;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;
use super::session::{GallerySession, SessionPhase};
use super::worker::{FetchContext, run_session};

pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_TAIL_FLUSH: usize = 4;

/// Incremental delivery unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Keys resolved since the previous batch, in index order
    pub new_keys: Vec<String>,
    /// Pages resolved in the session so far
    pub completed: usize,
    pub total: usize,
}

impl Batch {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

/// Invoked with every batch right before it is yielded.
pub type ProgressCallback = Arc<dyn Fn(&Batch) + Send + Sync>;

/// Arguments of one streaming call.
#[derive(Clone)]
pub struct StreamRequest {
    pub gallery_id: String,
    pub pages: Vec<String>,
    pub batch_size: usize,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl StreamRequest {
    pub fn new(gallery_id: impl Into<String>, pages: Vec<String>) -> Self {
        Self {
            gallery_id: gallery_id.into(),
            pages,
            batch_size: DEFAULT_BATCH_SIZE,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Emission cadence shared by every stream of a coordinator.
#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    /// Flush whatever is ready at least this often while the worker runs
    pub check_interval: Duration,
    /// Flush early once this few pages remain
    pub tail_flush: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            tail_flush: DEFAULT_TAIL_FLUSH,
        }
    }
}

/// Entry point for consuming galleries as ordered batches.
#[derive(Clone)]
pub struct StreamingCoordinator {
    registry: Arc<SessionRegistry>,
    fetch: FetchContext,
    options: StreamOptions,
}

impl StreamingCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        fetch: FetchContext,
        options: StreamOptions,
    ) -> Self {
        Self {
            registry,
            fetch,
            options,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Lazily stream the gallery as ordered batches.
    ///
    /// The first poll yields a batch at once with whatever is already
    /// resolved, and starts (or restarts) the fetch worker. Must be polled
    /// inside a Tokio runtime. Cancelling `request.cancel` cancels the
    /// session, keeps a snapshot, and ends the stream without an error.
    pub fn stream(&self, request: StreamRequest) -> BoxStream<'static, Batch> {
        let StreamRequest {
            gallery_id,
            pages,
            batch_size,
            progress,
            cancel,
        } = request;

        if let Some(keys) = self.registry.completed_keys_for(&gallery_id, &pages) {
            debug!("Serving {gallery_id} from the completed store");
            return stream::once(async move {
                let batch = Batch {
                    new_keys: keys.to_vec(),
                    completed: keys.len(),
                    total: keys.len(),
                };
                if let Some(progress) = &progress {
                    progress(&batch);
                }
                batch
            })
            .boxed();
        }

        let session = self.registry.get_or_create(&gallery_id, pages);
        let cursor = Cursor {
            progress_rx: session.subscribe(),
            session,
            coordinator: self.clone(),
            next_index: 0,
            batch_size: batch_size.max(1),
            progress,
            cancel,
            started: false,
            done: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            let batch = cursor.next_batch().await?;
            Some((batch, cursor))
        })
        .boxed()
    }

    /// Start a worker unless one is already running for `session`.
    fn ensure_worker(&self, session: &Arc<GallerySession>) {
        if !session.begin() && !session.rearm() {
            return;
        }
        let fetch = self.fetch.clone();
        let registry = Arc::clone(&self.registry);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let outcome = run_session(fetch, Arc::clone(&session)).await;
            registry.session_finished(&session, outcome);
        });
    }
}

enum Step {
    Emit(Batch),
    End,
    Wait,
}

struct Cursor {
    session: Arc<GallerySession>,
    progress_rx: watch::Receiver<u64>,
    coordinator: StreamingCoordinator,
    /// Lowest index not yet delivered
    next_index: usize,
    batch_size: usize,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    started: bool,
    done: bool,
}

impl Cursor {
    async fn next_batch(&mut self) -> Option<Batch> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.abandon();
            return None;
        }

        if !self.started {
            self.started = true;
            self.coordinator.ensure_worker(&self.session);
            return match self.evaluate(true) {
                Step::Emit(batch) => Some(self.emit(batch)),
                Step::End => None,
                Step::Wait => {
                    let batch = self.batch(Vec::new());
                    Some(self.emit(batch))
                }
            };
        }

        let interval = self.coordinator.options.check_interval;
        let mut deadline = Instant::now() + interval;
        let mut tick = false;
        loop {
            match self.evaluate(tick) {
                Step::Emit(batch) => return Some(self.emit(batch)),
                Step::End => return None,
                Step::Wait => {}
            }
            if tick {
                tick = false;
                deadline = Instant::now() + interval;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.abandon();
                    return None;
                }
                _ = self.progress_rx.changed() => {}
                () = tokio::time::sleep_until(deadline) => tick = true,
            }
        }
    }

    /// Decide what to do with the session's current state.
    ///
    /// `tick` means the periodic check is due, so anything ready flushes.
    fn evaluate(&mut self, tick: bool) -> Step {
        let phase = self.session.phase();
        if phase == SessionPhase::Cancelled {
            debug!("Session {} cancelled under stream", self.session.gallery_id());
            self.done = true;
            return Step::End;
        }

        let total = self.session.total();
        let pending = self.session.keys_from(self.next_index);
        let ready = contiguous_from(self.next_index, &pending);

        if self.next_index + ready == total {
            self.done = true;
            return Step::Emit(self.take(pending, ready));
        }

        if matches!(phase, SessionPhase::Completed | SessionPhase::Faulted) {
            // No worker will fill the gaps; release the rest, skipping them.
            self.done = true;
            if pending.is_empty() {
                return Step::End;
            }
            let count = pending.len();
            return Step::Emit(self.take(pending, count));
        }

        let remaining = total - (self.next_index + ready);
        let flush = ready >= self.batch_size
            || (ready > 0 && remaining <= self.coordinator.options.tail_flush)
            || (ready > 0 && tick);
        if flush {
            Step::Emit(self.take(pending, ready))
        } else {
            Step::Wait
        }
    }

    fn take(&mut self, mut pending: Vec<(usize, String)>, count: usize) -> Batch {
        pending.truncate(count);
        if let Some((last, _)) = pending.last() {
            self.next_index = last + 1;
        }
        self.batch(pending.into_iter().map(|(_, key)| key).collect())
    }

    fn batch(&self, new_keys: Vec<String>) -> Batch {
        Batch {
            new_keys,
            completed: self.session.resolved_count(),
            total: self.session.total(),
        }
    }

    fn emit(&self, batch: Batch) -> Batch {
        if let Some(progress) = &self.progress {
            progress(&batch);
        }
        batch
    }

    fn abandon(&mut self) {
        self.done = true;
        debug!("Stream for {} cancelled by consumer", self.session.gallery_id());
        self.coordinator.registry.cancel_session(&self.session);
    }
}

/// Length of the run of consecutive indices starting at `start`.
fn contiguous_from(start: usize, pending: &[(usize, String)]) -> usize {
    pending
        .iter()
        .enumerate()
        .take_while(|(offset, (index, _))| *index == start + offset)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(indices: &[usize]) -> Vec<(usize, String)> {
        indices.iter().map(|i| (*i, format!("k{i}"))).collect()
    }

    #[test]
    fn contiguous_run_stops_at_gap() {
        assert_eq!(contiguous_from(0, &entries(&[0, 1, 2, 4])), 3);
        assert_eq!(contiguous_from(3, &entries(&[4, 5])), 0);
        assert_eq!(contiguous_from(5, &entries(&[])), 0);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        let request = StreamRequest::new("g", Vec::new()).with_batch_size(0);
        assert_eq!(request.batch_size, 1);
    }

    #[test]
    fn batch_completion() {
        let batch = Batch {
            new_keys: vec!["a".into()],
            completed: 3,
            total: 3,
        };
        assert!(batch.is_complete());
    }
}
