use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::Receiver;
use image::{ImageFormat, Rgba, RgbaImage};

use gallery_stream::cache::keys::memory_key;
use gallery_stream::cache::{ByteCache, CacheLimits, DecodedThumbnailCache, Thumbnail};
use gallery_stream::decode::{
    DecodeConfig, DecodeError, DecodeOutcome, DecodeScheduler, DecodeSeed, EnqueueOutcome,
    ImageThumbnailDecoder, ThumbnailDecoder,
};

const GALLERY: &str = "0badcafe";
const WAIT: Duration = Duration::from_secs(5);

/// Answers with a 1x1 thumbnail; bytes carrying index 0 wait for a release
/// signal when a gate is installed.
#[derive(Default)]
struct GatedDecoder {
    gate: Mutex<Option<Receiver<()>>>,
}

impl GatedDecoder {
    fn gated() -> (Arc<Self>, flume::Sender<()>) {
        let (tx, rx) = flume::bounded(1);
        let decoder = Self {
            gate: Mutex::new(Some(rx)),
        };
        (Arc::new(decoder), tx)
    }
}

impl ThumbnailDecoder for GatedDecoder {
    fn decode(&self, bytes: &[u8], _width: u32) -> Result<Thumbnail, DecodeError> {
        if bytes == b"0" {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.recv_timeout(WAIT);
            }
        }
        Ok(Thumbnail::new(RgbaImage::new(1, 1)))
    }
}

struct Fixture {
    scheduler: Arc<DecodeScheduler>,
    outcomes: Receiver<DecodeOutcome>,
    bytes: Arc<ByteCache>,
    thumbnails: Arc<DecodedThumbnailCache>,
}

impl Fixture {
    fn new(decoder: Arc<dyn ThumbnailDecoder>, max_concurrency: usize) -> Self {
        let bytes = Arc::new(ByteCache::new(CacheLimits::new(1000, 64 << 20)).unwrap());
        let thumbnails =
            Arc::new(DecodedThumbnailCache::new(CacheLimits::new(1000, 256 << 20)).unwrap());
        let config = DecodeConfig {
            max_concurrency,
            horizon: 200,
            width: 320,
        };
        let (scheduler, outcomes) = DecodeScheduler::new(
            config,
            decoder,
            Arc::clone(&bytes),
            Arc::clone(&thumbnails),
        )
        .unwrap();
        Self {
            scheduler,
            outcomes,
            bytes,
            thumbnails,
        }
    }

    /// Cache placeholder bytes for `index` and return its key.
    fn page(&self, index: usize) -> String {
        let key = memory_key(GALLERY, index, "jpg");
        self.bytes.add(&key, index.to_string().into_bytes()).unwrap();
        key
    }

    fn enqueue(&self, index: usize, pivot: usize) -> EnqueueOutcome {
        let key = self.page(index);
        self.scheduler.enqueue(index as u64, &key, index, pivot)
    }

    fn next_indices(&self, count: usize) -> Vec<usize> {
        (0..count)
            .map(|_| self.outcomes.recv_timeout(WAIT).unwrap().index)
            .collect()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A jump to the top of a 500 page gallery drops everything past the
/// horizon and decodes the rest nearest first.
#[test]
fn test_pivot_jump_prunes_and_reorders() {
    let fixture = Fixture::new(Arc::new(GatedDecoder::default()), 1);
    fixture.scheduler.pause();

    for index in 0..500 {
        assert_eq!(fixture.enqueue(index, 250), EnqueueOutcome::Queued);
    }
    assert_eq!(fixture.scheduler.pending_len(), 500);

    assert_eq!(fixture.scheduler.update_selected_index(0), 299);
    assert_eq!(fixture.scheduler.pending_len(), 201);

    fixture.scheduler.resume();
    assert_eq!(fixture.next_indices(201), (0..=200).collect::<Vec<_>>());
    assert!(fixture.outcomes.recv_timeout(Duration::from_millis(50)).is_err());
}

/// Equal distances from the pivot decode in the order they were queued.
#[test]
fn test_ties_break_by_arrival() {
    let fixture = Fixture::new(Arc::new(GatedDecoder::default()), 1);
    fixture.scheduler.pause();

    for index in [8, 2, 7, 3, 5] {
        fixture.enqueue(index, 5);
    }
    fixture.scheduler.resume();

    assert_eq!(fixture.next_indices(5), vec![5, 7, 3, 8, 2]);
}

/// Replacing the queue leaves a running decode alone and skips its seed.
#[test]
fn test_replace_pending_keeps_running_decode() {
    let (decoder, release) = GatedDecoder::gated();
    let fixture = Fixture::new(decoder, 1);

    assert_eq!(fixture.enqueue(0, 0), EnqueueOutcome::Queued);
    for _ in 0..100 {
        if fixture.scheduler.running_len() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(fixture.scheduler.running_len(), 1);
    fixture.enqueue(300, 0);
    assert_eq!(fixture.scheduler.pending_len(), 1);

    let seeds = [100, 101, 0]
        .into_iter()
        .map(|index| DecodeSeed::new(index as u64, fixture.page(index), index))
        .collect();
    assert_eq!(fixture.scheduler.replace_pending_keep_running(seeds, 100), 2);
    assert_eq!(fixture.scheduler.pending_len(), 2);

    release.send(()).unwrap();
    assert_eq!(fixture.next_indices(3), vec![0, 100, 101]);
}

/// A second request for a queued source coalesces; once decoded, further
/// requests are answered from the thumbnail cache.
#[test]
fn test_coalesce_then_already_decoded() {
    let fixture = Fixture::new(Arc::new(GatedDecoder::default()), 2);
    fixture.scheduler.pause();

    assert_eq!(fixture.enqueue(4, 0), EnqueueOutcome::Queued);
    assert_eq!(fixture.enqueue(4, 0), EnqueueOutcome::Coalesced);
    assert_eq!(fixture.scheduler.pending_len(), 1);

    fixture.scheduler.resume();
    let outcome = fixture.outcomes.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.index, 4);
    assert!(outcome.result.is_ok());

    assert_eq!(fixture.enqueue(4, 0), EnqueueOutcome::AlreadyDecoded);
    assert!(fixture.outcomes.recv_timeout(Duration::from_millis(50)).is_err());
}

/// The default decoder scales wide images down to the configured width.
#[test]
fn test_real_png_decodes_to_thumbnail_width() {
    let fixture = Fixture::new(Arc::new(ImageThumbnailDecoder), 2);
    let key = memory_key(GALLERY, 0, "png");
    fixture.bytes.add(&key, png(640, 320)).unwrap();

    fixture.scheduler.enqueue(1, &key, 0, 0);
    let outcome = fixture.outcomes.recv_timeout(WAIT).unwrap();
    let thumbnail = outcome.result.unwrap();

    assert_eq!((thumbnail.width, thumbnail.height), (320, 160));
    assert_eq!(outcome.width, 320);
    assert!(fixture.thumbnails.contains(&key, 320));
}

/// Garbage bytes surface as an image error in the outcome.
#[test]
fn test_corrupt_bytes_report_error() {
    let fixture = Fixture::new(Arc::new(ImageThumbnailDecoder), 1);
    let key = memory_key(GALLERY, 2, "png");
    fixture.bytes.add(&key, b"not an image".to_vec()).unwrap();

    fixture.scheduler.enqueue(3, &key, 2, 0);
    let outcome = fixture.outcomes.recv_timeout(WAIT).unwrap();

    assert!(matches!(outcome.result, Err(DecodeError::Image(_))));
    assert!(!fixture.thumbnails.contains(&key, 320));
    assert_eq!(fixture.scheduler.running_len(), 0);
}
