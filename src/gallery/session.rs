//! Per-gallery fetch progress tracker

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// URLs sampled from each end of the page list for the session signature
const SIGNATURE_SAMPLE: usize = 3;

/// Lifecycle of a gallery session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Page list fixed, no worker started yet
    Created,
    /// A worker is fetching unresolved pages
    Running,
    /// Worker finished without an image fetch failure
    Completed,
    /// Worker finished, at least one image fetch failed
    Faulted,
    /// Cancelled before finishing
    Cancelled,
}

impl SessionPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Cancelled)
    }
}

/// Cheap identity of a page list: length plus a few URLs from each end.
///
/// Pages changing only in the middle of the list go unnoticed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSignature {
    total: usize,
    head: Vec<String>,
    tail: Vec<String>,
}

impl PageSignature {
    #[must_use]
    pub fn of(pages: &[String]) -> Self {
        let sample = SIGNATURE_SAMPLE.min(pages.len());
        Self {
            total: pages.len(),
            head: pages[..sample].to_vec(),
            tail: pages[pages.len() - sample..].to_vec(),
        }
    }

    #[must_use]
    pub fn matches(&self, pages: &[String]) -> bool {
        let sample = self.head.len();
        self.total == pages.len()
            && pages[..sample] == self.head[..]
            && pages[pages.len() - sample..] == self.tail[..]
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

/// Resolved keys of a session cancelled before it finished.
#[derive(Clone, Debug)]
pub struct PartialSnapshot {
    pub gallery_id: String,
    pub signature: PageSignature,
    pub keys: BTreeMap<usize, String>,
    pub taken_at: Instant,
}

impl PartialSnapshot {
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn highest_index(&self) -> Option<usize> {
        self.keys.keys().next_back().copied()
    }
}

/// What `finish` decided about a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinishOutcome {
    pub phase: SessionPhase,
    pub full_coverage: bool,
    /// Full coverage and never faulted
    pub promotable: bool,
}

struct SessionInner {
    phase: SessionPhase,
    keys: BTreeMap<usize, String>,
    faulted: bool,
    finished_at: Option<Instant>,
}

/// Mutable tracker of one gallery's fetch progress.
///
/// The page list is fixed at creation; resolved keys only grow, and each
/// index is resolved at most once. Consumers subscribe to a version counter
/// bumped on every resolution and phase change.
pub struct GallerySession {
    gallery_id: String,
    pages: Arc<[String]>,
    signature: PageSignature,
    started_at: Instant,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
    version: watch::Sender<u64>,
}

impl GallerySession {
    pub fn new(gallery_id: impl Into<String>, pages: Vec<String>) -> Self {
        Self::with_keys(gallery_id.into(), pages, BTreeMap::new())
    }

    /// Start from a snapshot's keys; indices past the page list are dropped.
    pub fn restored(
        gallery_id: impl Into<String>,
        pages: Vec<String>,
        snapshot: &PartialSnapshot,
    ) -> Self {
        let total = pages.len();
        let keys = snapshot
            .keys
            .range(..total)
            .map(|(i, k)| (*i, k.clone()))
            .collect();
        Self::with_keys(gallery_id.into(), pages, keys)
    }

    fn with_keys(gallery_id: String, pages: Vec<String>, keys: BTreeMap<usize, String>) -> Self {
        let signature = PageSignature::of(&pages);
        let (version, _) = watch::channel(0);
        Self {
            gallery_id,
            pages: pages.into(),
            signature,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Created,
                keys,
                faulted: false,
                finished_at: None,
            }),
            version,
        }
    }

    #[must_use]
    pub fn gallery_id(&self) -> &str {
        &self.gallery_id
    }

    #[must_use]
    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn signature(&self) -> &PageSignature {
        &self.signature
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        self.lock().finished_at
    }

    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.lock().keys.len()
    }

    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.lock().keys.len() == self.total()
    }

    /// `Created -> Running`. Only the first caller gets `true`.
    pub fn begin(&self) -> bool {
        let started = {
            let mut inner = self.lock();
            if inner.phase != SessionPhase::Created {
                return false;
            }
            inner.phase = SessionPhase::Running;
            true
        };
        debug!("Session {} running ({} pages)", self.gallery_id, self.total());
        self.bump();
        started
    }

    /// Put a finished session with gaps back to `Running` so a new worker
    /// can retry the unresolved pages. The fault flag is kept.
    pub fn rearm(&self) -> bool {
        {
            let mut inner = self.lock();
            let finished = matches!(inner.phase, SessionPhase::Completed | SessionPhase::Faulted);
            if !finished || inner.keys.len() == self.pages.len() || self.cancel.is_cancelled() {
                return false;
            }
            inner.phase = SessionPhase::Running;
            inner.finished_at = None;
        }
        debug!("Session {} rearmed for unresolved pages", self.gallery_id);
        self.bump();
        true
    }

    /// Record the cache key for `index`. Writes to an already resolved
    /// index, out of range indices and writes after cancellation are ignored.
    pub fn resolve(&self, index: usize, key: impl Into<String>) -> bool {
        if index >= self.pages.len() {
            return false;
        }
        let inserted = {
            let mut inner = self.lock();
            if inner.phase == SessionPhase::Cancelled || inner.keys.contains_key(&index) {
                false
            } else {
                inner.keys.insert(index, key.into());
                true
            }
        };
        if inserted {
            self.bump();
        }
        inserted
    }

    /// Sticky: once set it is never cleared.
    pub fn mark_faulted(&self) {
        self.lock().faulted = true;
    }

    /// Worker is done: settle on `Completed` or `Faulted`.
    pub fn finish(&self) -> FinishOutcome {
        let outcome = {
            let mut inner = self.lock();
            let full_coverage = inner.keys.len() == self.pages.len();
            if inner.phase == SessionPhase::Cancelled {
                return FinishOutcome {
                    phase: SessionPhase::Cancelled,
                    full_coverage,
                    promotable: false,
                };
            }
            inner.phase = if inner.faulted {
                SessionPhase::Faulted
            } else {
                SessionPhase::Completed
            };
            inner.finished_at = Some(Instant::now());
            FinishOutcome {
                phase: inner.phase,
                full_coverage,
                promotable: full_coverage && !inner.faulted,
            }
        };
        debug!(
            "Session {} finished as {:?}, {}/{} resolved",
            self.gallery_id,
            outcome.phase,
            self.resolved_count(),
            self.total()
        );
        self.bump();
        outcome
    }

    /// Cancel an unfinished session.
    ///
    /// Returns a snapshot when at least one page was resolved. The snapshot
    /// is copied before the token fires and never waits on it.
    pub fn cancel(&self) -> Option<PartialSnapshot> {
        let snapshot = {
            let mut inner = self.lock();
            if inner.phase.is_terminal() {
                None
            } else {
                inner.phase = SessionPhase::Cancelled;
                inner.finished_at = Some(Instant::now());
                (!inner.keys.is_empty()).then(|| PartialSnapshot {
                    gallery_id: self.gallery_id.clone(),
                    signature: self.signature.clone(),
                    keys: inner.keys.clone(),
                    taken_at: Instant::now(),
                })
            }
        };
        self.cancel.cancel();
        self.bump();
        snapshot
    }

    #[must_use]
    pub fn keys(&self) -> BTreeMap<usize, String> {
        self.lock().keys.clone()
    }

    /// Resolved `(index, key)` pairs at or after `start`, in index order.
    #[must_use]
    pub fn keys_from(&self, start: usize) -> Vec<(usize, String)> {
        self.lock()
            .keys
            .range(start..)
            .map(|(i, k)| (*i, k.clone()))
            .collect()
    }

    /// The full ordered key list, once every page is resolved.
    #[must_use]
    pub fn ordered_keys(&self) -> Option<Vec<String>> {
        let inner = self.lock();
        (inner.keys.len() == self.pages.len()).then(|| inner.keys.values().cloned().collect())
    }

    #[must_use]
    pub fn unresolved_indices(&self) -> Vec<usize> {
        let inner = self.lock();
        (0..self.pages.len())
            .filter(|i| !inner.keys.contains_key(i))
            .collect()
    }

    /// Receiver woken on every resolution and phase change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
