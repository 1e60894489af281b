//! Fetch loop driving one session over its unresolved pages

use std::future::Future;
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::session::{FinishOutcome, GallerySession};
use crate::cache::ByteCache;
use crate::cache::keys::{image_extension, memory_key};
use crate::fetch::{FetchError, FetchGate, PageParser, PageSource};

/// Everything a session worker needs to fetch and cache pages.
#[derive(Clone)]
pub struct FetchContext {
    pub source: Arc<dyn PageSource>,
    pub parser: Arc<dyn PageParser>,
    pub gate: Arc<FetchGate>,
    pub bytes: Arc<ByteCache>,
}

/// Result of one page fetch task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageResult {
    Resolved,
    Skipped,
    Faulted,
    Cancelled,
}

/// Fetch every unresolved page of `session`, at most the per-session cap at
/// a time, then settle the session.
///
/// Returns once all spawned tasks are done or the session is cancelled.
pub async fn run_session(ctx: FetchContext, session: Arc<GallerySession>) -> FinishOutcome {
    let cancel = session.cancellation().clone();
    let session_gate = ctx.gate.session_gate();
    let pending = session.unresolved_indices();
    debug!(
        "Fetching {} pages of {} ({} at a time)",
        pending.len(),
        session.gallery_id(),
        ctx.gate.per_session_limit()
    );

    let mut tasks = JoinSet::new();
    for index in pending {
        let Ok(slot) = session_gate.acquire(&cancel).await else {
            break;
        };
        let ctx = ctx.clone();
        let task_session = Arc::clone(&session);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _slot = slot;
            fetch_page(&ctx, &task_session, index, &cancel).await
        });

        while let Some(joined) = tasks.try_join_next() {
            log_join(&session, joined);
        }
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(joined) => log_join(&session, joined),
                None => break,
            },
        }
    }

    session.finish()
}

async fn fetch_page(
    ctx: &FetchContext,
    session: &GallerySession,
    index: usize,
    cancel: &CancellationToken,
) -> PageResult {
    let id = session.gallery_id();
    let page_url = &session.pages()[index];

    // One global slot covers the page and its image.
    let Ok(_permit) = ctx.gate.acquire(cancel).await else {
        return PageResult::Cancelled;
    };

    let html = match until_cancelled(cancel, ctx.source.fetch_text(page_url)).await {
        Ok(html) => html,
        Err(FetchError::Cancelled) => return PageResult::Cancelled,
        Err(e) => {
            warn!("Skipping page {} of {id}: {e}", index + 1);
            return PageResult::Skipped;
        }
    };

    let image_url = match ctx.parser.image_url(page_url, &html) {
        Ok(url) => url,
        Err(e) => {
            warn!("Skipping page {} of {id}: {e}", index + 1);
            return PageResult::Skipped;
        }
    };

    let bytes = match until_cancelled(cancel, ctx.source.fetch_bytes(&image_url)).await {
        Ok(bytes) => bytes,
        Err(FetchError::Cancelled) => return PageResult::Cancelled,
        Err(e) => {
            warn!("Image fetch failed for page {} of {id}: {e}", index + 1);
            session.mark_faulted();
            return PageResult::Faulted;
        }
    };

    let key = memory_key(id, index, &image_extension(&image_url));
    if let Err(e) = ctx.bytes.add(&key, bytes) {
        warn!("Could not cache page {} of {id}: {e}", index + 1);
        session.mark_faulted();
        return PageResult::Faulted;
    }

    session.resolve(index, key);
    PageResult::Resolved
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fetch: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(FetchError::Cancelled),
        result = fetch => result,
    }
}

fn log_join(session: &GallerySession, joined: Result<PageResult, JoinError>) {
    match joined {
        Ok(result) => {
            if result != PageResult::Resolved {
                debug!("Page task for {} ended {result:?}", session.gallery_id());
            }
        }
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            error!("Page task for {} panicked: {e}", session.gallery_id());
            session.mark_faulted();
        }
    }
}
