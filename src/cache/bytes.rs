//! Raw image buffer cache keyed by memory key

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use super::CacheError;
use super::keys::is_memory_key;
use super::store::{CacheLimits, CacheStats, CacheUsage, LruStore};

/// Shared, immutable image payload
pub type Payload = Arc<[u8]>;

/// Count and byte limited LRU store of fetched image bytes.
///
/// Reads refresh recency, so every operation goes through the same mutex.
pub struct ByteCache {
    store: Mutex<LruStore<String, Payload>>,
}

impl ByteCache {
    pub fn new(limits: CacheLimits) -> Result<Self, CacheError> {
        let limits = limits.validate()?;
        Ok(Self {
            store: Mutex::new(LruStore::new(limits)),
        })
    }

    /// Insert or replace a buffer, evicting least recently used entries
    /// until both limits hold again.
    pub fn add(&self, key: &str, bytes: impl Into<Payload>) -> Result<(), CacheError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CacheError::EmptyPayload(key.to_string()));
        }
        if !is_memory_key(key) {
            return Err(CacheError::ForeignKey(key.to_string()));
        }

        let mut store = self.lock();
        let max_bytes = store.limits().max_bytes;
        if bytes.len() > max_bytes {
            return Err(CacheError::TooLarge {
                key: key.to_string(),
                size: bytes.len(),
                max_bytes,
            });
        }

        let size = bytes.len();
        let evicted = store.insert(key.to_string(), bytes, size);
        if evicted > 0 {
            debug!("Byte cache evicted {evicted} entries while adding {key}");
        }
        Ok(())
    }

    /// Fetch a buffer and mark it most recently used.
    pub fn try_get(&self, key: &str) -> Option<Payload> {
        self.lock().get(&key.to_string())
    }

    /// Check presence without touching recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(&key.to_string())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(&key.to_string())
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        self.lock().remove_where(|k| k.starts_with(prefix))
    }

    /// Replace the limits and sweep immediately.
    ///
    /// Invalid limits are rejected and the previous configuration kept.
    pub fn set_limits(&self, limits: CacheLimits) -> Result<usize, CacheError> {
        let limits = limits.validate()?;
        let evicted = self.lock().set_limits(limits);
        debug!(
            "Byte cache limits now {} entries / {} bytes, evicted {evicted}",
            limits.max_entries, limits.max_bytes
        );
        Ok(evicted)
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

    fn lock(&self) -> std::sync::MutexGuard<'_, LruStore<String, Payload>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
