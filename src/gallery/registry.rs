//! Keyed store of live sessions, partial snapshots and completed galleries

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};

use super::session::{FinishOutcome, GallerySession, PageSignature, PartialSnapshot};

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<GallerySession>>,
    snapshots: HashMap<String, PartialSnapshot>,
}

/// Ordered keys of a fully fetched gallery and the page list they came from.
struct CompletedGallery {
    signature: PageSignature,
    keys: Arc<[String]>,
}

/// Owns every gallery session by id.
///
/// Lock order is registry then session; sessions never call back into the
/// registry. The completed-gallery store has its own lock and is never
/// taken while the session map is held.
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    completed: Mutex<HashMap<String, CompletedGallery>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the live session for `gallery_id` when its page signature
    /// matches, otherwise cancel it and start a fresh one, restoring a
    /// matching snapshot if there is one.
    pub fn get_or_create(&self, gallery_id: &str, pages: Vec<String>) -> Arc<GallerySession> {
        let mut state = self.lock();

        if let Some(existing) = state.sessions.get(gallery_id) {
            let reusable = existing.signature().matches(&pages)
                && !existing.cancellation().is_cancelled();
            if reusable {
                return Arc::clone(existing);
            }
            debug!("Page list changed for {gallery_id}, replacing session");
            if let Some(stale) = state.sessions.remove(gallery_id) {
                Self::retire(&mut state, &stale);
            }
        }

        let restorable = state
            .snapshots
            .get(gallery_id)
            .filter(|snapshot| snapshot.signature.matches(&pages));

        let session = match restorable {
            Some(snapshot) => {
                info!(
                    "Resuming {gallery_id} with {}/{} pages from snapshot",
                    snapshot.resolved_count(),
                    pages.len()
                );
                GallerySession::restored(gallery_id, pages, snapshot)
            }
            None => GallerySession::new(gallery_id, pages),
        };

        let session = Arc::new(session);
        state
            .sessions
            .insert(gallery_id.to_string(), Arc::clone(&session));
        session
    }

    #[must_use]
    pub fn session(&self, gallery_id: &str) -> Option<Arc<GallerySession>> {
        self.lock().sessions.get(gallery_id).cloned()
    }

    /// Remove and cancel the session for `gallery_id`, keeping a snapshot
    /// of unfinished progress.
    pub fn cancel(&self, gallery_id: &str) -> bool {
        let mut state = self.lock();
        let Some(session) = state.sessions.remove(gallery_id) else {
            return false;
        };
        Self::retire(&mut state, &session);
        true
    }

    /// Like `cancel`, but only if `session` is still the registered one.
    pub fn cancel_session(&self, session: &Arc<GallerySession>) -> bool {
        let mut state = self.lock();
        let id = session.gallery_id();
        let registered = state
            .sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            state.sessions.remove(id);
        }
        Self::retire(&mut state, session);
        registered
    }

    /// Cancel every session whose id is not in `keep`.
    pub fn cancel_all_except(&self, keep: &HashSet<String>) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .sessions
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();

        for id in &doomed {
            if let Some(session) = state.sessions.remove(id) {
                Self::retire(&mut state, &session);
            }
        }
        if !doomed.is_empty() {
            debug!("Cancelled {} sessions outside the keep set", doomed.len());
        }
        doomed.len()
    }

    /// Drop sessions that finished more than `retention` ago.
    pub fn cleanup_expired(&self, retention: Duration) -> usize {
        let mut state = self.lock();
        let before = state.sessions.len();
        state.sessions.retain(|_, session| {
            session
                .finished_at()
                .is_none_or(|finished| finished.elapsed() <= retention)
        });
        let removed = before - state.sessions.len();
        if removed > 0 {
            debug!("Expired {removed} finished sessions");
        }
        removed
    }

    /// Called once a session's worker has returned.
    ///
    /// Full coverage discards any snapshot for the gallery; full coverage
    /// without a fault also promotes the ordered keys.
    pub fn session_finished(&self, session: &GallerySession, outcome: FinishOutcome) {
        let id = session.gallery_id();
        if outcome.full_coverage {
            self.lock().snapshots.remove(id);
        }
        if !outcome.promotable {
            return;
        }
        if let Some(keys) = session.ordered_keys() {
            info!("Gallery {id} complete, {} pages promoted", keys.len());
            let entry = CompletedGallery {
                signature: session.signature().clone(),
                keys: keys.into(),
            };
            self.completed_lock().insert(id.to_string(), entry);
        }
    }

    /// Ordered keys of a gallery that finished fully without a fault.
    #[must_use]
    pub fn completed_keys(&self, gallery_id: &str) -> Option<Arc<[String]>> {
        self.completed_lock()
            .get(gallery_id)
            .map(|entry| Arc::clone(&entry.keys))
    }

    /// Completed keys, only if they were fetched for this same page list.
    #[must_use]
    pub fn completed_keys_for(&self, gallery_id: &str, pages: &[String]) -> Option<Arc<[String]>> {
        self.completed_lock()
            .get(gallery_id)
            .filter(|entry| entry.signature.matches(pages))
            .map(|entry| Arc::clone(&entry.keys))
    }

    pub fn forget_completed(&self, gallery_id: &str) -> bool {
        self.completed_lock().remove(gallery_id).is_some()
    }

    #[must_use]
    pub fn snapshot(&self, gallery_id: &str) -> Option<PartialSnapshot> {
        self.lock().snapshots.get(gallery_id).cloned()
    }

    pub fn discard_snapshot(&self, gallery_id: &str) -> bool {
        self.lock().snapshots.remove(gallery_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every session, e.g. on shutdown.
    pub fn cancel_all(&self) -> usize {
        self.cancel_all_except(&HashSet::new())
    }

    fn retire(state: &mut RegistryState, session: &GallerySession) {
        if let Some(snapshot) = session.cancel() {
            debug!(
                "Snapshot of {} kept with {} pages",
                snapshot.gallery_id,
                snapshot.resolved_count()
            );
            state
                .snapshots
                .insert(snapshot.gallery_id.clone(), snapshot);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn completed_lock(&self) -> MutexGuard<'_, HashMap<String, CompletedGallery>> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::SessionPhase;

    fn pages(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://example.com/p/{i}")).collect()
    }

    #[test]
    fn reuses_matching_session() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("g", pages(5));
        let b = registry.get_or_create("g", pages(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn mismatch_replaces_and_snapshots_old() {
        let registry = SessionRegistry::new();
        let old = registry.get_or_create("g", pages(5));
        old.begin();
        old.resolve(0, "a");

        let fresh = registry.get_or_create("g", pages(6));
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(old.phase(), SessionPhase::Cancelled);
        assert_eq!(fresh.resolved_count(), 0);

        let snapshot = registry.snapshot("g").unwrap();
        assert_eq!(snapshot.resolved_count(), 1);
    }

    #[test]
    fn cancel_then_recreate_restores_progress() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("g", pages(4));
        first.begin();
        first.resolve(0, "a");
        first.resolve(1, "b");

        assert!(registry.cancel("g"));
        assert!(registry.session("g").is_none());

        let second = registry.get_or_create("g", pages(4));
        assert_eq!(second.resolved_count(), 2);
        assert_eq!(second.unresolved_indices(), vec![2, 3]);
    }

    #[test]
    fn cancel_all_except_keeps_listed() {
        let registry = SessionRegistry::new();
        for id in ["a", "b", "c"] {
            registry.get_or_create(id, pages(2));
        }
        let keep: HashSet<String> = ["b".to_string()].into_iter().collect();

        assert_eq!(registry.cancel_all_except(&keep), 2);
        assert!(registry.session("b").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn promotion_requires_clean_full_coverage() {
        let registry = SessionRegistry::new();
        let clean = registry.get_or_create("clean", pages(2));
        clean.begin();
        clean.resolve(0, "a");
        clean.resolve(1, "b");
        registry.session_finished(&clean, clean.finish());

        let faulted = registry.get_or_create("faulted", pages(2));
        faulted.begin();
        faulted.resolve(0, "a");
        faulted.mark_faulted();
        faulted.resolve(1, "b");
        registry.session_finished(&faulted, faulted.finish());

        assert_eq!(registry.completed_keys("clean").unwrap().len(), 2);
        assert!(registry.completed_keys("faulted").is_none());
    }

    #[test]
    fn completed_keys_require_matching_page_list() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("g", pages(2));
        session.begin();
        session.resolve(0, "a");
        session.resolve(1, "b");
        registry.session_finished(&session, session.finish());

        let other: Vec<String> = vec!["https://elsewhere/0".into(), "https://elsewhere/1".into()];
        assert!(registry.completed_keys_for("g", &pages(2)).is_some());
        assert!(registry.completed_keys_for("g", &other).is_none());
        assert!(registry.completed_keys_for("g", &pages(3)).is_none());
    }

    #[test]
    fn full_coverage_discards_snapshot() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("g", pages(2));
        first.begin();
        first.resolve(0, "a");
        registry.cancel("g");
        assert!(registry.snapshot("g").is_some());

        let second = registry.get_or_create("g", pages(2));
        second.begin();
        second.resolve(1, "b");
        registry.session_finished(&second, second.finish());

        assert!(registry.snapshot("g").is_none());
        assert!(registry.completed_keys("g").is_some());
    }

    #[test]
    fn cleanup_expired_only_drops_finished() {
        let registry = SessionRegistry::new();
        let running = registry.get_or_create("running", pages(2));
        running.begin();
        let done = registry.get_or_create("done", pages(1));
        done.begin();
        done.resolve(0, "a");
        done.finish();

        assert_eq!(registry.cleanup_expired(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.cleanup_expired(Duration::ZERO), 1);
        assert!(registry.session("running").is_some());
        assert!(registry.session("done").is_none());
    }

    #[test]
    fn cancel_session_ignores_replaced() {
        let registry = SessionRegistry::new();
        let old = registry.get_or_create("g", pages(3));
        let current = registry.get_or_create("g", pages(4));

        assert!(!registry.cancel_session(&old));
        assert!(registry.session("g").is_some_and(|s| Arc::ptr_eq(&s, &current)));
    }
}
