//! Query result cache with TTL and insertion-order eviction

pub mod bus;

pub use bus::{Invalidation, InvalidationBus};

use crate::config::CacheSettings;
use crate::scheduler::IntervalHandle;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Statistics about cache performance
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Cache of read results keyed by query fingerprint.
///
/// Every invalidation bumps a generation counter; readers capture it before
/// going remote and store through [`QueryCache::set_if_fresh`] so a result
/// computed before a write cannot land after it.
pub struct QueryCache<V> {
    entries: Mutex<IndexMap<String, Entry<V>>>,
    max_size: usize,
    ttl: Duration,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl<V: Clone> QueryCache<V> {
    /// Create a new cache with specified capacity and TTL
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        info!("Initializing query cache with max_size={}, ttl={:?}", max_size, ttl);
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_size: max_size.max(1),
            ttl,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_size, Duration::from_millis(settings.ttl_ms))
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let value = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.shift_remove(key);
                None
            }
            None => None,
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for key: {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for key: {}", key);
        }
        value
    }

    /// Store a value; an existing key moves to the newest position
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock();
        self.insert_locked(&mut entries, key.into(), value);
    }

    /// Store only if nothing was invalidated since `generation` was read
    pub fn set_if_fresh(&self, key: impl Into<String>, value: V, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding stale cache fill");
            return false;
        }
        self.insert_locked(&mut entries, key.into(), value);
        true
    }

    fn insert_locked(&self, entries: &mut IndexMap<String, Entry<V>>, key: String, value: V) {
        entries.shift_remove(&key);
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        while entries.len() > self.max_size {
            entries.shift_remove_index(0);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Present and not expired; does not touch hit counters
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.inserted_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        self.bump_generation();
        entries.shift_remove(key).is_some()
    }

    /// Drop every entry whose key mentions `id` as a whole segment
    pub fn invalidate_for_entity(&self, id: &str) -> usize {
        let needle = format!(":{}:", id);
        self.invalidate_where(|key| format!(":{}:", key).contains(&needle))
    }

    /// Drop every entry whose key starts with `prefix`
    pub fn invalidate_for_category(&self, prefix: &str) -> usize {
        self.invalidate_where(|key| key.starts_with(prefix))
    }

    fn invalidate_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries.lock();
        self.bump_generation();
        let before = entries.len();
        entries.retain(|key, _| !matches(key));
        let removed = before - entries.len();
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Invalidated {} cache entries", removed);
        }
        removed
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.bump_generation();
        let removed = entries.len();
        entries.clear();
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        debug!("Cache cleared");
    }

    /// Remove expired entries; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Apply an invalidation message
    pub fn apply(&self, invalidation: &Invalidation) -> usize {
        match invalidation {
            Invalidation::Entity(id) => self.invalidate_for_entity(id),
            Invalidation::Category(prefix) => self.invalidate_for_category(prefix),
            Invalidation::All => {
                let size = self.len();
                self.clear();
                size
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    /// Purge expired entries every `period` until the handle is stopped or the cache dropped
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> IntervalHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        IntervalHandle::spawn(period, move || {
            let cache = cache.clone();
            async move {
                if let Some(cache) = cache.upgrade() {
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        debug!("Swept {} expired cache entries", purged);
                    }
                }
            }
        })
    }
}

/// Cache key layouts used by the coordinator
pub mod keys {
    use super::*;

    pub const FOLDERS_PREFIX: &str = "folders:";
    pub const FILES_PREFIX: &str = "files:";
    pub const ALL_FOLDERS: &str = "folders:all";

    pub fn folders_for_file(file_id: &str, top_k: usize) -> String {
        format!("folders:file:{}:{}", file_id, top_k)
    }

    pub fn folders_for_embedding(vector: &[f32], top_k: usize) -> String {
        format!("folders:emb:{}:{}", vector_fingerprint(vector), top_k)
    }

    pub fn similar_files(vector: &[f32], top_k: usize) -> String {
        format!("files:similar:{}:{}", vector_fingerprint(vector), top_k)
    }

    /// Short hash of the exact vector bits
    pub fn vector_fingerprint(vector: &[f32]) -> String {
        let mut hasher = Sha256::new();
        for x in vector {
            hasher.update(x.to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> QueryCache<Vec<String>> {
        QueryCache::new(3, Duration::from_secs(60))
    }

    #[test]
    fn test_set_get() {
        let cache = cache();
        cache.set("folders:all", vec!["d1".to_string()]);

        assert_eq!(cache.get("folders:all"), Some(vec!["d1".to_string()]));
        assert_eq!(cache.get("folders:missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_reads_as_absent() {
        let cache = QueryCache::new(3, Duration::from_millis(20));
        cache.set("k", 1);
        assert!(cache.has("k"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.has("k"));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insertion_order_eviction() {
        let cache = cache();
        cache.set("a", vec![]);
        cache.set("b", vec![]);
        cache.set("c", vec![]);
        // rewriting moves "a" to the newest slot
        cache.set("a", vec![]);
        cache.set("d", vec![]);

        assert!(!cache.has("b"));
        assert!(cache.has("a"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_entity_invalidation_matches_whole_segments() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.set(keys::folders_for_file("f1", 5), 1);
        cache.set(keys::folders_for_file("f10", 5), 2);
        cache.set(keys::ALL_FOLDERS, 3);

        assert_eq!(cache.invalidate_for_entity("f1"), 1);
        assert!(cache.has(&keys::folders_for_file("f10", 5)));
        assert!(cache.has(keys::ALL_FOLDERS));
    }

    #[test]
    fn test_category_invalidation() {
        let cache = QueryCache::new(10, Duration::from_secs(60));
        cache.set(keys::folders_for_file("f1", 5), 1);
        cache.set(keys::similar_files(&[0.1, 0.2], 5), 2);

        assert_eq!(cache.invalidate_for_category(keys::FOLDERS_PREFIX), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_stale_fill_rejected() {
        let cache = cache();
        let generation = cache.generation();
        cache.invalidate_for_entity("f1");

        assert!(!cache.set_if_fresh("folders:file:f1:5", vec![], generation));
        assert!(!cache.has("folders:file:f1:5"));

        let fresh = cache.generation();
        assert!(cache.set_if_fresh("folders:file:f1:5", vec![], fresh));
    }

    #[test]
    fn test_purge_expired() {
        let cache = QueryCache::new(10, Duration::from_millis(10));
        cache.set("a", 1);
        cache.set("b", 2);
        std::thread::sleep(Duration::from_millis(25));
        cache.set("c", 3);

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(
            keys::vector_fingerprint(&[0.1, 0.2]),
            keys::vector_fingerprint(&[0.1, 0.2])
        );
        assert_ne!(
            keys::vector_fingerprint(&[0.1, 0.2]),
            keys::vector_fingerprint(&[0.2, 0.1])
        );
    }

    #[tokio::test]
    async fn test_sweeper() {
        let cache = Arc::new(QueryCache::new(10, Duration::from_millis(10)));
        cache.set("a", 1);
        let sweeper = cache.spawn_sweeper(Duration::from_millis(15));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 0);
        sweeper.stop();
    }
}
