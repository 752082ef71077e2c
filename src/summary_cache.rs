use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub summary: String,
    pub tokens: u64,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed store of pre-computed conversation summaries. Keys are
/// fingerprints of the collapsed turns, so identical histories share entries.
#[async_trait]
pub trait SummaryCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<SummaryEntry>;
    async fn put(&self, key: &str, entry: SummaryEntry);
}

struct MemoryEntry {
    entry: SummaryEntry,
    inserted_at: std::time::Instant,
}

/// Size-bounded in-memory backend with TTL eviction.
pub struct MemorySummaryCache {
    max_entries: usize,
    ttl: Duration,
    items: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemorySummaryCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    fn evict_oldest(items: &mut HashMap<String, MemoryEntry>) {
        let oldest = items
            .iter()
            .min_by_key(|(_, v)| v.inserted_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            items.remove(&key);
        }
    }
}

#[async_trait]
impl SummaryCache for MemorySummaryCache {
    async fn get(&self, key: &str) -> Option<SummaryEntry> {
        let mut items = self.items.lock().await;
        match items.get(key) {
            Some(held) => {
                if !self.ttl.is_zero() && held.inserted_at.elapsed() > self.ttl {
                    items.remove(key);
                    None
                } else {
                    Some(held.entry.clone())
                }
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, entry: SummaryEntry) {
        let mut items = self.items.lock().await;
        if !items.contains_key(key) && items.len() >= self.max_entries {
            Self::evict_oldest(&mut items);
        }
        items.insert(
            key.to_string(),
            MemoryEntry {
                entry,
                inserted_at: std::time::Instant::now(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub struct SummaryStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SummaryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("trellis_summary_cache_hits_total").increment(1);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("trellis_summary_cache_misses_total").increment(1);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Wraps any backend and records hit/miss counts.
pub struct InstrumentedCache {
    inner: Arc<dyn SummaryCache>,
    stats: Arc<SummaryStats>,
}

impl InstrumentedCache {
    pub fn new(inner: Arc<dyn SummaryCache>, stats: Arc<SummaryStats>) -> Self {
        Self { inner, stats }
    }
}

#[async_trait]
impl SummaryCache for InstrumentedCache {
    async fn get(&self, key: &str) -> Option<SummaryEntry> {
        match self.inner.get(key).await {
            Some(entry) => {
                self.stats.hit();
                Some(entry)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    async fn put(&self, key: &str, entry: SummaryEntry) {
        self.inner.put(key, entry).await;
    }
}

/// Builds the configured cache: `off` yields `None`, `memory` the LRU+TTL
/// backend wrapped with instrumentation.
pub fn build_summary_cache(
    mode: &str,
    size: usize,
    ttl: Duration,
    stats: Arc<SummaryStats>,
) -> Option<Arc<dyn SummaryCache>> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "off" => None,
        _ => {
            let base: Arc<dyn SummaryCache> = Arc::new(MemorySummaryCache::new(size, ttl));
            Some(Arc::new(InstrumentedCache::new(base, stats)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(summary: &str) -> SummaryEntry {
        SummaryEntry {
            summary: summary.to_string(),
            tokens: summary.len() as u64,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemorySummaryCache::new(4, Duration::from_secs(60));
        cache.put("k", entry("hello")).await;
        let got = cache.get("k").await.unwrap();
        assert_eq!(got.summary, "hello");
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemorySummaryCache::new(4, Duration::from_millis(5));
        cache.put("k", entry("hello")).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn memory_cache_bounds_size() {
        let cache = MemorySummaryCache::new(2, Duration::from_secs(60));
        cache.put("a", entry("a")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.put("b", entry("b")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.put("c", entry("c")).await;
        // Oldest entry was evicted to make room.
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn instrumented_cache_counts_hits_and_misses() {
        let stats = Arc::new(SummaryStats::new());
        let cache = InstrumentedCache::new(
            Arc::new(MemorySummaryCache::new(4, Duration::from_secs(60))),
            stats.clone(),
        );
        assert!(cache.get("missing").await.is_none());
        cache.put("k", entry("v")).await;
        assert!(cache.get("k").await.is_some());
        assert_eq!(stats.snapshot(), (1, 1));
    }

    #[test]
    fn off_mode_disables_cache() {
        let stats = Arc::new(SummaryStats::new());
        assert!(build_summary_cache("off", 4, Duration::from_secs(1), stats).is_none());
    }
}
