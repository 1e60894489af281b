//! Process-wide service graph, built once at startup and passed around

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Receiver;
use futures::stream::BoxStream;
use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::keys::gallery_prefix;
use crate::cache::{ByteCache, CacheError, CacheLimits, DecodedThumbnailCache};
use crate::decode::{DecodeOutcome, DecodeScheduler, ImageThumbnailDecoder, ThumbnailDecoder};
use crate::fetch::{FetchGate, HtmlImageParser, PageParser, PageSource, ReqwestSource};
use crate::gallery::{Batch, FetchContext, SessionRegistry, StreamRequest, StreamingCoordinator};
use crate::settings::Settings;

/// Everything a gallery viewer needs, wired together.
///
/// Each cache, the registry and the decode queue keep their own lock; the
/// services never hold two of them at once.
pub struct GalleryServices {
    pub bytes: Arc<ByteCache>,
    pub thumbnails: Arc<DecodedThumbnailCache>,
    pub gate: Arc<FetchGate>,
    pub registry: Arc<SessionRegistry>,
    pub coordinator: StreamingCoordinator,
    pub decoder: Arc<DecodeScheduler>,
    /// Decode results; flume receivers can be cloned for several consumers
    pub decode_outcomes: Receiver<DecodeOutcome>,
    retention: Duration,
    cleanup_interval: Duration,
    shutdown: CancellationToken,
}

impl GalleryServices {
    /// Build with the HTTP source, the HTML parser and the image decoder.
    pub fn new(settings: &Settings) -> Result<Self> {
        let source = ReqwestSource::with_options(
            settings.fetch.timeout(),
            &settings.fetch.user_agent,
        )
        .context("Failed to create HTTP client")?;
        Self::with_collaborators(
            settings,
            Arc::new(source),
            Arc::new(HtmlImageParser::new()),
            Arc::new(ImageThumbnailDecoder),
        )
    }

    /// Build around caller-supplied page source, parser and decoder.
    ///
    /// Invalid values in `settings` are replaced by their defaults.
    pub fn with_collaborators(
        settings: &Settings,
        source: Arc<dyn PageSource>,
        parser: Arc<dyn PageParser>,
        thumbnail_decoder: Arc<dyn ThumbnailDecoder>,
    ) -> Result<Self> {
        let settings = settings.clone().validated();
        let bytes = Arc::new(
            ByteCache::new(settings.byte_cache).context("Invalid byte cache limits")?,
        );
        let thumbnails = Arc::new(
            DecodedThumbnailCache::new(settings.thumbnail_cache)
                .context("Invalid thumbnail cache limits")?,
        );
        let gate = Arc::new(FetchGate::new(
            settings.fetch.global_limit(),
            settings.fetch.per_session,
        ));
        let registry = Arc::new(SessionRegistry::new());

        let fetch = FetchContext {
            source,
            parser,
            gate: Arc::clone(&gate),
            bytes: Arc::clone(&bytes),
        };
        let coordinator =
            StreamingCoordinator::new(Arc::clone(&registry), fetch, settings.stream.options());

        let (decoder, decode_outcomes) = DecodeScheduler::new(
            settings.decode.config(),
            thumbnail_decoder,
            Arc::clone(&bytes),
            Arc::clone(&thumbnails),
        )
        .context("Failed to start decode scheduler")?;

        info!(
            "Services ready: fetch {}/{} per session, decode {} workers",
            gate.global_limit(),
            gate.per_session_limit(),
            decoder.config().max_concurrency
        );

        Ok(Self {
            bytes,
            thumbnails,
            gate,
            registry,
            coordinator,
            decoder,
            decode_outcomes,
            retention: settings.stream.retention(),
            cleanup_interval: settings.stream.cleanup_interval(),
            shutdown: CancellationToken::new(),
        })
    }

    /// See [`StreamingCoordinator::stream`].
    pub fn stream(&self, request: StreamRequest) -> BoxStream<'static, Batch> {
        self.coordinator.stream(request)
    }

    /// Periodically drop finished sessions past their retention, until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let retention = self.retention;
        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.cleanup_expired(retention);
                    }
                }
            }
            debug!("Retention sweeper stopped");
        })
    }

    /// Forget a gallery: cancel its session, drop its completed entry, then
    /// clear its bytes and thumbnails. Returns the cache entries removed.
    pub fn evict_gallery(&self, gallery_id: &str) -> usize {
        self.registry.cancel(gallery_id);
        self.registry.forget_completed(gallery_id);
        self.registry.discard_snapshot(gallery_id);

        let prefix = gallery_prefix(gallery_id);
        let bytes = self.bytes.remove_by_prefix(&prefix);
        let thumbnails = self.thumbnails.remove_by_prefix(&prefix);
        debug!("Evicted {gallery_id}: {bytes} buffers, {thumbnails} thumbnails");
        bytes + thumbnails
    }

    pub fn set_byte_limits(&self, limits: CacheLimits) -> Result<usize, CacheError> {
        self.bytes.set_limits(limits)
    }

    pub fn set_thumbnail_limits(&self, limits: CacheLimits) -> Result<usize, CacheError> {
        self.thumbnails.set_limits(limits)
    }

    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background work: sweeper, sessions, decode dispatch, fetch gate.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let cancelled = self.registry.cancel_all();
        self.decoder.shutdown();
        self.gate.close();
        info!("Services shut down, {cancelled} sessions cancelled");
    }
}

impl Drop for GalleryServices {
    fn drop(&mut self) {
        self.shutdown();
    }
}
