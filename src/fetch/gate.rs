//! Two-level fetch concurrency limiter
//!
//! The global gate bounds outbound fetches across every session. Each
//! session additionally gets its own small gate so one large gallery
//! cannot take every global slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors from acquiring a gate slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("acquire cancelled")]
    Cancelled,

    #[error("gate closed")]
    Closed,
}

/// Process-wide fetch gate plus the per-session cap.
#[derive(Debug)]
pub struct FetchGate {
    global: Arc<Semaphore>,
    global_limit: usize,
    per_session: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
}

impl FetchGate {
    /// Limits below one are raised to one.
    #[must_use]
    pub fn new(global_limit: usize, per_session: usize) -> Self {
        let global_limit = global_limit.max(1);
        Self {
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
            per_session: per_session.clamp(1, global_limit),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Global limit of `cpus * 4` clamped to `4..=32`, per-session cap of 4.
    #[must_use]
    pub fn with_default_concurrency() -> Self {
        Self::new(default_global_limit(), DEFAULT_PER_SESSION)
    }

    /// Wait for a global slot, giving up as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<FetchPermit, GateError> {
        let permit = acquire_or_cancel(&self.global, cancel).await?;

        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);

        Ok(FetchPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// A fresh per-session gate sized to the session cap.
    #[must_use]
    pub fn session_gate(&self) -> SessionGate {
        SessionGate {
            semaphore: Arc::new(Semaphore::new(self.per_session)),
        }
    }

    #[must_use]
    pub fn global_limit(&self) -> usize {
        self.global_limit
    }

    #[must_use]
    pub fn per_session_limit(&self) -> usize {
        self.per_session
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Stop handing out global slots; pending acquires fail with `Closed`.
    pub fn close(&self) {
        self.global.close();
    }
}

impl Default for FetchGate {
    fn default() -> Self {
        Self::with_default_concurrency()
    }
}

/// Per-session gate bounding how many fetch tasks one session keeps in flight.
#[derive(Debug, Clone)]
pub struct SessionGate {
    semaphore: Arc<Semaphore>,
}

impl SessionGate {
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, GateError> {
        acquire_or_cancel(&self.semaphore, cancel).await
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Held while a fetch is in progress; releases its global slot on drop.
#[derive(Debug)]
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

const DEFAULT_PER_SESSION: usize = 4;

/// `cpus * 4`, clamped to `4..=32`.
#[must_use]
pub fn default_global_limit() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);
    (cpus * 4).clamp(4, 32)
}

async fn acquire_or_cancel(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, GateError> {
    if cancel.is_cancelled() {
        return Err(GateError::Cancelled);
    }
    // Dropping the acquire future on cancellation leaves no slot behind.
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(GateError::Cancelled),
        permit = Arc::clone(semaphore).acquire_owned() => permit.map_err(|_| GateError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn limits_are_clamped() {
        let gate = FetchGate::new(0, 10);
        assert_eq!(gate.global_limit(), 1);
        assert_eq!(gate.per_session_limit(), 1);

        let gate = FetchGate::new(8, 0);
        assert_eq!(gate.per_session_limit(), 1);
    }

    #[test]
    fn default_limit_in_range() {
        let limit = default_global_limit();
        assert!((4..=32).contains(&limit));
    }

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let gate = FetchGate::new(2, 2);
        let token = CancellationToken::new();

        let a = gate.acquire(&token).await.unwrap();
        let b = gate.acquire(&token).await.unwrap();
        assert_eq!(gate.available(), 0);
        assert_eq!(gate.in_flight(), 2);

        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn pending_acquire_aborts_on_cancel_without_leaking() {
        let gate = Arc::new(FetchGate::new(1, 1));
        let token = CancellationToken::new();
        let held = gate.acquire(&token).await.unwrap();

        let waiter_gate = Arc::clone(&gate);
        let waiter_token = token.child_token();
        let waiter =
            tokio::spawn(async move { waiter_gate.acquire(&waiter_token).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(GateError::Cancelled));

        drop(held);
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let gate = FetchGate::new(4, 2);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(gate.acquire(&token).await.err(), Some(GateError::Cancelled));
        assert_eq!(gate.available(), 4);
    }

    #[tokio::test]
    async fn session_gate_caps_in_flight() {
        let gate = FetchGate::new(8, 2);
        let session = gate.session_gate();
        let token = CancellationToken::new();

        let _a = session.acquire(&token).await.unwrap();
        let _b = session.acquire(&token).await.unwrap();
        assert_eq!(session.available(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(30), session.acquire(&token)).await;
        assert!(blocked.is_err());
        assert_eq!(gate.available(), 8);
    }

    #[tokio::test]
    async fn closed_gate_reports_closed() {
        let gate = FetchGate::new(1, 1);
        gate.close();
        let token = CancellationToken::new();

        assert_eq!(gate.acquire(&token).await.err(), Some(GateError::Closed));
    }
}
