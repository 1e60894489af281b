#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use gallery_stream::cache::keys::memory_key;
use gallery_stream::decode::ImageThumbnailDecoder;
use gallery_stream::fetch::{BoxFuture, FetchError, HtmlImageParser, PageSource};
use gallery_stream::{Batch, GalleryServices, Settings};

const PAGE_BASE: &str = "https://gallery.test/g/page/";
const IMAGE_BASE: &str = "https://cdn.test/g/";

/// In-memory gallery host: page `i` shows `https://cdn.test/g/{i}.jpg`.
#[derive(Default)]
pub struct MockGallery {
    delays: Mutex<HashMap<usize, Duration>>,
    failing: Mutex<HashSet<usize>>,
    broken_pages: Mutex<HashSet<usize>>,
    held: Mutex<HashMap<usize, CancellationToken>>,
    release: CancellationToken,
    image_fetches: Mutex<HashMap<usize, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockGallery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delays(delays: &[u64]) -> Arc<Self> {
        let gallery = Self::default();
        {
            let mut map = gallery.delays.lock().unwrap();
            for (i, ms) in delays.iter().enumerate() {
                map.insert(i, Duration::from_millis(*ms));
            }
        }
        Arc::new(gallery)
    }

    /// Image fetches for these pages fail with HTTP 503.
    pub fn fail_images(&self, indices: impl IntoIterator<Item = usize>) {
        self.failing.lock().unwrap().extend(indices);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// These pages have no image markup.
    pub fn break_pages(&self, indices: impl IntoIterator<Item = usize>) {
        self.broken_pages.lock().unwrap().extend(indices);
    }

    /// Image fetches for these pages wait until they are released.
    pub fn hold_images(&self, indices: impl IntoIterator<Item = usize>) {
        let mut held = self.held.lock().unwrap();
        for index in indices {
            held.insert(index, self.release.child_token());
        }
    }

    /// Release every held image.
    pub fn release(&self) {
        self.release.cancel();
    }

    pub fn release_images(&self, indices: impl IntoIterator<Item = usize>) {
        let held = self.held.lock().unwrap();
        for index in indices {
            if let Some(token) = held.get(&index) {
                token.cancel();
            }
        }
    }

    pub fn image_fetches(&self, index: usize) -> usize {
        self.image_fetches
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_image_fetches(&self) -> usize {
        self.image_fetches.lock().unwrap().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn index_of(url: &str, base: &str) -> Result<usize, FetchError> {
        url.strip_prefix(base)
            .and_then(|rest| rest.trim_end_matches(".jpg").parse().ok())
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

impl PageSource for MockGallery {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            let index = Self::index_of(url, PAGE_BASE)?;
            if self.broken_pages.lock().unwrap().contains(&index) {
                return Ok("<html><body><p>This page was removed.</p></body></html>".to_string());
            }
            Ok(format!(
                r#"<html><body><div class="page"><img id="img" src="{IMAGE_BASE}{index}.jpg"></div></body></html>"#
            ))
        })
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            let index = Self::index_of(url, IMAGE_BASE)?;
            *self.image_fetches.lock().unwrap().entry(index).or_default() += 1;

            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let held = self.held.lock().unwrap().get(&index).cloned();
            if let Some(token) = held {
                token.cancelled().await;
            }
            let delay = self.delays.lock().unwrap().get(&index).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.failing.lock().unwrap().contains(&index) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 503,
                });
            }
            Ok(format!("image-bytes-{index}").into_bytes())
        })
    }
}

pub fn settings(global: usize, per_session: usize) -> Settings {
    let mut settings = Settings::default();
    settings.fetch.global_concurrency = Some(global);
    settings.fetch.per_session = per_session;
    settings.stream.check_interval_ms = 20;
    settings.stream.tail_flush = 2;
    settings.decode.max_concurrency = Some(2);
    settings
}

pub fn services(gallery: &Arc<MockGallery>, settings: &Settings) -> GalleryServices {
    GalleryServices::with_collaborators(
        settings,
        Arc::clone(gallery) as Arc<dyn PageSource>,
        Arc::new(HtmlImageParser::new()),
        Arc::new(ImageThumbnailDecoder),
    )
    .unwrap()
}

pub fn page_urls(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{PAGE_BASE}{i}")).collect()
}

pub fn expected_keys(gallery_id: &str, indices: impl IntoIterator<Item = usize>) -> Vec<String> {
    indices
        .into_iter()
        .map(|i| memory_key(gallery_id, i, "jpg"))
        .collect()
}

/// Drain a stream, failing the test if it does not end within 10 seconds.
pub async fn collect(stream: BoxStream<'static, Batch>) -> Vec<Batch> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}

pub fn delivered_keys(batches: &[Batch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|batch| batch.new_keys.iter().cloned())
        .collect()
}
