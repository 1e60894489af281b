//! Decoded thumbnail cache keyed by (source key, decode width)

use std::sync::{Arc, Mutex, PoisonError};

use image::RgbaImage;
use log::debug;

use super::CacheError;
use super::store::{CacheLimits, CacheStats, CacheUsage, LruStore};

/// A decoded, display-ready thumbnail
#[derive(Debug)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub pixels: RgbaImage,
}

impl Thumbnail {
    #[must_use]
    pub fn new(pixels: RgbaImage) -> Self {
        let (width, height) = pixels.dimensions();
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Shared handle to a decoded thumbnail
pub type ThumbnailHandle = Arc<Thumbnail>;

type ThumbKey = (String, u32);

/// Estimated memory cost of a thumbnail decoded at `width`.
#[must_use]
pub fn estimated_cost(width: u32) -> usize {
    let width = width as usize;
    width.saturating_mul(width).saturating_mul(4)
}

/// LRU store of decoded thumbnails.
///
/// One source key may hold several widths at once (a low-res placeholder
/// next to the final image); the placeholder stays until the caller removes
/// it.
pub struct DecodedThumbnailCache {
    store: Mutex<LruStore<ThumbKey, ThumbnailHandle>>,
}

impl DecodedThumbnailCache {
    pub fn new(limits: CacheLimits) -> Result<Self, CacheError> {
        let limits = limits.validate()?;
        Ok(Self {
            store: Mutex::new(LruStore::new(limits)),
        })
    }

    pub fn get(&self, source_key: &str, width: u32) -> Option<ThumbnailHandle> {
        self.lock().get(&(source_key.to_string(), width))
    }

    #[must_use]
    pub fn contains(&self, source_key: &str, width: u32) -> bool {
        self.lock().contains(&(source_key.to_string(), width))
    }

    /// Insert a decoded thumbnail, charged at `width² × 4` bytes.
    pub fn add(
        &self,
        source_key: &str,
        width: u32,
        thumbnail: ThumbnailHandle,
    ) -> Result<(), CacheError> {
        let cost = estimated_cost(width);
        let mut store = self.lock();
        let max_bytes = store.limits().max_bytes;
        if width == 0 || cost > max_bytes {
            return Err(CacheError::TooLarge {
                key: format!("{source_key}@{width}"),
                size: cost,
                max_bytes,
            });
        }

        let evicted = store.insert((source_key.to_string(), width), thumbnail, cost);
        if evicted > 0 {
            debug!("Thumbnail cache evicted {evicted} entries while adding {source_key}@{width}");
        }
        Ok(())
    }

    /// Remove one width of a source, e.g. a placeholder superseded by the
    /// high-resolution decode.
    pub fn remove(&self, source_key: &str, width: u32) -> bool {
        self.lock().remove(&(source_key.to_string(), width))
    }

    /// Remove every width cached for `source_key`.
    pub fn remove_source(&self, source_key: &str) -> usize {
        self.lock().remove_where(|(source, _)| source == source_key)
    }

    /// Remove every entry whose source key starts with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        self.lock().remove_where(|(source, _)| source.starts_with(prefix))
    }

    /// Widths currently cached for `source_key`, ascending.
    #[must_use]
    pub fn widths_for(&self, source_key: &str) -> Vec<u32> {
        let mut widths: Vec<u32> = self
            .lock()
            .keys_where(|(source, _)| source == source_key)
            .into_iter()
            .map(|(_, width)| width)
            .collect();
        widths.sort_unstable();
        widths
    }

    pub fn set_limits(&self, limits: CacheLimits) -> Result<usize, CacheError> {
        let limits = limits.validate()?;
        Ok(self.lock().set_limits(limits))
    }

    #[must_use]
    pub fn limits(&self) -> CacheLimits {
        self.lock().limits()
    }

    #[must_use]
    pub fn usage(&self) -> CacheUsage {
        self.lock().usage()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruStore<ThumbKey, ThumbnailHandle>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thumb(width: u32) -> ThumbnailHandle {
        Arc::new(Thumbnail::new(RgbaImage::new(width, width)))
    }

    fn cache(max_entries: usize, max_bytes: usize) -> DecodedThumbnailCache {
        DecodedThumbnailCache::new(CacheLimits::new(max_entries, max_bytes)).unwrap()
    }

    #[test]
    fn cost_is_width_squared_times_four() {
        assert_eq!(estimated_cost(100), 40_000);
        assert_eq!(estimated_cost(0), 0);
    }

    #[test]
    fn placeholder_and_final_coexist_until_removed() {
        let c = cache(10, 10_000_000);
        c.add("mem:g:0001.jpg", 64, thumb(64)).unwrap();
        c.add("mem:g:0001.jpg", 512, thumb(512)).unwrap();

        assert_eq!(c.widths_for("mem:g:0001.jpg"), vec![64, 512]);
        assert!(c.remove("mem:g:0001.jpg", 64));
        assert_eq!(c.widths_for("mem:g:0001.jpg"), vec![512]);
        assert_eq!(c.usage().bytes, estimated_cost(512));
    }

    #[test]
    fn evicts_by_estimated_bytes() {
        let c = cache(100, estimated_cost(100) * 2);
        c.add("a", 100, thumb(1)).unwrap();
        c.add("b", 100, thumb(1)).unwrap();
        c.add("c", 100, thumb(1)).unwrap();

        assert!(!c.contains("a", 100));
        assert!(c.contains("b", 100));
        assert!(c.contains("c", 100));
    }

    #[test]
    fn rejects_width_over_budget() {
        let c = cache(10, 1_000);
        assert!(c.add("a", 100, thumb(1)).is_err());
        assert!(c.add("a", 0, thumb(1)).is_err());
    }

    #[test]
    fn remove_source_and_prefix() {
        let c = cache(10, 10_000_000);
        c.add("mem:a:0001.jpg", 32, thumb(1)).unwrap();
        c.add("mem:a:0001.jpg", 64, thumb(1)).unwrap();
        c.add("mem:a:0002.jpg", 64, thumb(1)).unwrap();
        c.add("mem:b:0001.jpg", 64, thumb(1)).unwrap();

        assert_eq!(c.remove_source("mem:a:0001.jpg"), 2);
        assert_eq!(c.remove_by_prefix("mem:a:"), 1);
        assert_eq!(c.usage().entries, 1);
    }

    #[test]
    fn parallel_get_and_add() {
        let c = Arc::new(cache(8, estimated_cost(16) * 8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("mem:g:{:04}.jpg", t * 100 + i);
                        c.add(&key, 16, thumb(1)).unwrap();
                        let _ = c.get(&key, 16);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let usage = c.usage();
        assert!(usage.entries <= 8);
        assert!(usage.bytes <= estimated_cost(16) * 8);
    }
}
