use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::{GeoCell, RetrievalScale};

/// A shared in-memory cache for retrieval results.
///
/// Keyed by image content hash plus scale and K, so identical inputs
/// across runs hit the cache instead of the inference endpoint. The
/// mapping is deterministic given identical input, so racing writers
/// are harmless: last writer wins. Entries expire after the configured
/// time-to-live.
#[derive(Clone)]
pub struct RetrievalCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

struct CacheEntry {
    cells: Vec<GeoCell>,
    inserted_at: Instant,
}

impl RetrievalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key(content_hash: &str, top_k: usize, scale: RetrievalScale) -> String {
        format!("{content_hash}:{scale}:{top_k}")
    }

    /// Retrieve cached cells if present and not expired.
    pub fn get(
        &self,
        content_hash: &str,
        top_k: usize,
        scale: RetrievalScale,
    ) -> Option<Vec<GeoCell>> {
        let key = Self::key(content_hash, top_k, scale);
        let entries = self.entries.read().expect("RetrievalCache lock poisoned");
        let entry = entries.get(&key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.cells.clone())
    }

    /// Insert (or overwrite) a result set.
    pub fn put(
        &self,
        content_hash: &str,
        top_k: usize,
        scale: RetrievalScale,
        cells: Vec<GeoCell>,
    ) {
        let key = Self::key(content_hash, top_k, scale);
        let mut entries = self.entries.write().expect("RetrievalCache lock poisoned");
        // Opportunistic cleanup keeps the map bounded over long batches
        entries.retain(|_, e| e.inserted_at.elapsed() <= self.ttl);
        entries.insert(
            key,
            CacheEntry {
                cells,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells() -> Vec<GeoCell> {
        vec![GeoCell {
            lat: 48.8584,
            lon: 2.2945,
            score: 0.8,
        }]
    }

    #[test]
    fn test_cache_hit() {
        let cache = RetrievalCache::new(Duration::from_secs(60));
        cache.put("hash1", 5, RetrievalScale::Fine, cells());
        assert_eq!(cache.get("hash1", 5, RetrievalScale::Fine), Some(cells()));
    }

    #[test]
    fn test_cache_miss_on_different_key() {
        let cache = RetrievalCache::new(Duration::from_secs(60));
        cache.put("hash1", 5, RetrievalScale::Fine, cells());
        assert!(cache.get("hash1", 10, RetrievalScale::Fine).is_none());
        assert!(cache.get("hash1", 5, RetrievalScale::Region).is_none());
        assert!(cache.get("other", 5, RetrievalScale::Fine).is_none());
    }

    #[test]
    fn test_cache_expiry() {
        let cache = RetrievalCache::new(Duration::from_millis(0));
        cache.put("hash1", 5, RetrievalScale::Fine, cells());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("hash1", 5, RetrievalScale::Fine).is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = RetrievalCache::new(Duration::from_secs(60));
        cache.put("hash1", 5, RetrievalScale::Fine, vec![]);
        cache.put("hash1", 5, RetrievalScale::Fine, cells());
        assert_eq!(cache.get("hash1", 5, RetrievalScale::Fine), Some(cells()));
    }
}
