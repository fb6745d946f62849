//! Thread-safe TTL + LRU memory caches.
//!
//! Three variants share the same contract (expired entries read as absent,
//! `put` refreshes expiry and recency, LRU eviction at capacity):
//! - [`TtlLruCache`]: single-lock, generic values.
//! - [`ShardedTtlCache`]: hash-sharded byte store with optional gzip
//!   compression, hit/miss/eviction counters and a warm-up callback.
//! - [`TieredTileCache`]: hot/warm/cold sharded tiers with promotion on
//!   access and frequency-based placement.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{TileError, TileResult};

/// Monotonic clock with a logical offset so tests can jump past a TTL.
struct CacheClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl CacheClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    fn now(&self) -> Duration {
        self.base.elapsed() + Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    fn advance(&self, delta: Duration) {
        self.offset_ms
            .fetch_add(delta.as_millis() as u64, Ordering::Relaxed);
    }
}

fn validate_limits(max_items: usize, ttl_seconds: u64) -> TileResult<()> {
    if max_items < 1 {
        return Err(TileError::BadRequest("max_items must be >= 1".into()));
    }
    if ttl_seconds < 1 {
        return Err(TileError::BadRequest("ttl_seconds must be >= 1".into()));
    }
    Ok(())
}

struct Entry<V> {
    value: V,
    expires_at: Duration,
}

/// Single-lock TTL-LRU cache.
pub struct TtlLruCache<K: Hash + Eq, V> {
    store: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
    clock: CacheClock,
}

impl<K: Hash + Eq, V: Clone> TtlLruCache<K, V> {
    pub fn new(max_items: usize, ttl_seconds: u64) -> TileResult<Self> {
        validate_limits(max_items, ttl_seconds)?;
        let cap = NonZeroUsize::new(max_items).expect("validated above");
        Ok(Self {
            store: Mutex::new(LruCache::new(cap)),
            ttl: Duration::from_secs(ttl_seconds),
            clock: CacheClock::new(),
        })
    }

    /// Get a value. An expired entry is removed and reads as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let expired = match store.get(key) {
            None => return None,
            Some(entry) if entry.expires_at <= now => true,
            Some(entry) => return Some(entry.value.clone()),
        };
        if expired {
            store.pop(key);
        }
        None
    }

    /// Insert a value, refreshing expiry and recency. Evicts the
    /// least-recently-used entry when a new key exceeds capacity.
    pub fn put(&self, key: K, value: V) {
        let expires_at = self.clock.now() + self.ttl;
        self.store.lock().push(key, Entry { value, expires_at });
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    #[cfg(test)]
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub items: usize,
}

struct ShardEntry {
    payload: Bytes,
    compressed: bool,
    expires_at: Duration,
}

type WarmupCallback<K> = Box<dyn Fn(&K) + Send + Sync>;

/// Hash-sharded TTL-LRU byte cache for high-contention keys (tiles).
///
/// Values may be stored gzip-compressed; decompression happens on read.
/// A warm-up callback, when set, fires on every miss so callers can trigger
/// asynchronous population.
pub struct ShardedTtlCache<K: Hash + Eq + Clone> {
    shards: Vec<Mutex<LruCache<K, ShardEntry>>>,
    ttl: Duration,
    compression: bool,
    clock: CacheClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    warmup: Mutex<Option<WarmupCallback<K>>>,
}

impl<K: Hash + Eq + Clone> ShardedTtlCache<K> {
    pub fn new(
        max_items: usize,
        ttl_seconds: u64,
        segments: usize,
        compression: bool,
    ) -> TileResult<Self> {
        validate_limits(max_items, ttl_seconds)?;
        if segments < 1 {
            return Err(TileError::BadRequest("segments must be >= 1".into()));
        }
        let per_shard = NonZeroUsize::new((max_items / segments).max(1)).expect("min 1");
        let shards = (0..segments)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Ok(Self {
            shards,
            ttl: Duration::from_secs(ttl_seconds),
            compression,
            clock: CacheClock::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            warmup: Mutex::new(None),
        })
    }

    fn shard_for(&self, key: &K) -> &Mutex<LruCache<K, ShardEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: &K) -> Option<Bytes> {
        let now = self.clock.now();
        let found = {
            let mut shard = self.shard_for(key).lock();
            match shard.get(key) {
                None => None,
                Some(entry) if entry.expires_at <= now => {
                    shard.pop(key);
                    None
                }
                Some(entry) => Some((entry.payload.clone(), entry.compressed)),
            }
        };
        match found {
            Some((payload, compressed)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if compressed {
                    gunzip(&payload)
                } else {
                    Some(payload)
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(cb) = self.warmup.lock().as_ref() {
                    cb(key);
                }
                None
            }
        }
    }

    pub fn put(&self, key: K, payload: Bytes) {
        let (payload, compressed) = if self.compression {
            match gzip(&payload) {
                Some(packed) => (packed, true),
                None => (payload, false),
            }
        } else {
            (payload, false)
        };
        let entry = ShardEntry {
            payload,
            compressed,
            expires_at: self.clock.now() + self.ttl,
        };
        let evicted = self.shard_for(&key).lock().push(key.clone(), entry);
        if let Some((old_key, _)) = evicted {
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.shard_for(key)
            .lock()
            .peek(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Register the callback fired on every miss.
    pub fn set_warmup(&self, callback: WarmupCallback<K>) {
        *self.warmup.lock() = Some(callback);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            items: self.len(),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
    }
}

fn gzip(data: &[u8]) -> Option<Bytes> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).ok()?;
    Some(Bytes::from(encoder.finish().ok()?))
}

fn gunzip(data: &[u8]) -> Option<Bytes> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(Bytes::from(out))
}

/// Rolling access window retained per key for tier placement.
const ACCESS_HISTORY_CAP: usize = 100;
const HOT_WINDOW: Duration = Duration::from_secs(300);
const WARM_WINDOW: Duration = Duration::from_secs(1800);

/// Three-tier tile cache: hot (uncompressed, short TTL), warm, cold.
///
/// Access promotes an entry one tier hotter; nothing is demoted — entries
/// simply expire from whichever tier holds them. Placement on `put` follows a
/// rolling access-frequency window.
pub struct TieredTileCache<K: Hash + Eq + Clone> {
    hot: ShardedTtlCache<K>,
    warm: ShardedTtlCache<K>,
    cold: ShardedTtlCache<K>,
    history: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Hash + Eq + Clone> TieredTileCache<K> {
    pub fn new() -> Self {
        Self {
            // Hot data stays uncompressed for fast reads.
            hot: ShardedTtlCache::new(128, 180, 8, false).expect("static limits"),
            warm: ShardedTtlCache::new(256, 600, 8, true).expect("static limits"),
            cold: ShardedTtlCache::new(512, 1800, 8, true).expect("static limits"),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<Bytes> {
        if let Some(value) = self.hot.get(key) {
            self.record_access(key);
            return Some(value);
        }
        if let Some(value) = self.warm.get(key) {
            self.hot.put(key.clone(), value.clone());
            self.record_access(key);
            return Some(value);
        }
        if let Some(value) = self.cold.get(key) {
            self.warm.put(key.clone(), value.clone());
            self.record_access(key);
            return Some(value);
        }
        None
    }

    pub fn put(&self, key: K, value: Bytes) {
        if self.recent_hits(&key, HOT_WINDOW, 10) >= 3 {
            self.hot.put(key, value);
        } else if self.recent_hits(&key, WARM_WINDOW, 20) >= 2 {
            self.warm.put(key, value);
        } else {
            self.cold.put(key, value);
        }
    }

    pub fn clear(&self) {
        self.hot.clear();
        self.warm.clear();
        self.cold.clear();
        self.history.lock().clear();
    }

    pub fn stats(&self) -> (CacheStats, CacheStats, CacheStats) {
        (self.hot.stats(), self.warm.stats(), self.cold.stats())
    }

    fn record_access(&self, key: &K) {
        let mut history = self.history.lock();
        let samples = history.entry(key.clone()).or_default();
        samples.push_back(Instant::now());
        while samples.len() > ACCESS_HISTORY_CAP {
            samples.pop_front();
        }
    }

    fn recent_hits(&self, key: &K, window: Duration, tail: usize) -> usize {
        let history = self.history.lock();
        let Some(samples) = history.get(key) else {
            return 0;
        };
        samples
            .iter()
            .rev()
            .take(tail)
            .filter(|t| t.elapsed() < window)
            .count()
    }
}

impl<K: Hash + Eq + Clone> Default for TieredTileCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_put_then_get_before_expiry() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4, 60).unwrap();
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn test_expired_entry_is_removed_not_resurrected() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4, 1).unwrap();
        cache.put("a", 1);
        cache.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_put_refreshes_expiry() {
        let cache: TtlLruCache<&str, u32> = TtlLruCache::new(4, 10).unwrap();
        cache.put("a", 1);
        cache.advance(Duration::from_secs(8));
        cache.put("a", 2);
        cache.advance(Duration::from_secs(8));
        // 16s since first put, but only 8s since refresh.
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn test_capacity_bound_and_lru_eviction_order() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(2, 60).unwrap();
        cache.put(1, 10);
        cache.put(2, 20);
        // Touch 1 so 2 becomes the least recently used.
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);
        assert!(cache.len() <= 2);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        assert!(TtlLruCache::<u32, u32>::new(0, 60).is_err());
        assert!(TtlLruCache::<u32, u32>::new(4, 0).is_err());
        assert!(ShardedTtlCache::<u32>::new(4, 60, 0, false).is_err());
    }

    #[test]
    fn test_clear() {
        let cache: TtlLruCache<u32, u32> = TtlLruCache::new(4, 60).unwrap();
        cache.put(1, 1);
        cache.put(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sharded_roundtrip_and_stats() {
        let cache: ShardedTtlCache<u32> = ShardedTtlCache::new(64, 60, 4, false).unwrap();
        cache.put(1, Bytes::from_static(b"tile-bytes"));
        assert_eq!(cache.get(&1).unwrap().as_ref(), b"tile-bytes");
        assert!(cache.get(&2).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.items, 1);
    }

    #[test]
    fn test_sharded_compression_roundtrip() {
        let cache: ShardedTtlCache<u32> = ShardedTtlCache::new(64, 60, 4, true).unwrap();
        let payload = Bytes::from(vec![7u8; 4096]);
        cache.put(9, payload.clone());
        assert_eq!(cache.get(&9).unwrap(), payload);
    }

    #[test]
    fn test_sharded_expiry() {
        let cache: ShardedTtlCache<u32> = ShardedTtlCache::new(64, 1, 4, false).unwrap();
        cache.put(1, Bytes::from_static(b"x"));
        cache.advance(Duration::from_secs(2));
        assert!(cache.get(&1).is_none());
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_sharded_warmup_fires_on_miss_only() {
        let cache: ShardedTtlCache<u32> = ShardedTtlCache::new(64, 60, 4, false).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cache.set_warmup(Box::new(move |_key| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        cache.get(&1);
        cache.put(1, Bytes::from_static(b"x"));
        cache.get(&1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_sharded_eviction_counted() {
        // One shard so eviction is deterministic.
        let cache: ShardedTtlCache<u32> = ShardedTtlCache::new(2, 60, 1, false).unwrap();
        cache.put(1, Bytes::from_static(b"a"));
        cache.put(2, Bytes::from_static(b"b"));
        cache.put(3, Bytes::from_static(b"c"));
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_tiered_first_put_lands_cold() {
        let cache: TieredTileCache<&str> = TieredTileCache::new();
        cache.put("k", Bytes::from_static(b"v"));
        let (hot, warm, cold) = cache.stats();
        assert_eq!(hot.items, 0);
        assert_eq!(warm.items, 0);
        assert_eq!(cold.items, 1);
    }

    #[test]
    fn test_tiered_access_promotes() {
        let cache: TieredTileCache<&str> = TieredTileCache::new();
        cache.put("k", Bytes::from_static(b"v"));
        // Cold hit promotes to warm, warm hit promotes to hot.
        assert!(cache.get(&"k").is_some());
        assert!(cache.get(&"k").is_some());
        let (hot, _, _) = cache.stats();
        assert_eq!(hot.items, 1);
    }

    #[test]
    fn test_tiered_frequent_key_placed_hot() {
        let cache: TieredTileCache<&str> = TieredTileCache::new();
        cache.put("k", Bytes::from_static(b"v"));
        for _ in 0..3 {
            assert!(cache.get(&"k").is_some());
        }
        // Three recent accesses: next put goes straight to hot.
        cache.put("k", Bytes::from_static(b"v2"));
        assert_eq!(cache.hot.get(&"k").unwrap().as_ref(), b"v2");
    }
}
