//! Query cache & performance monitor (E): an LRU over `count -> Vec<Reading>`
//! plus per-query-type timing.
//!
//! Hand-rolled over `HashMap` + an explicit insertion-order list rather than
//! an external LRU crate: the cache's capacity (10 distinct `count` values)
//! is small enough that a linear scan for the oldest entry is simpler than
//! pulling in an intrusive-list crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::reading::Reading;

const DEFAULT_CAPACITY: usize = 10;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

struct CacheEntry {
    value: Vec<Reading>,
    insert_time: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, max_age: Duration) -> bool {
        self.insert_time.elapsed() > max_age
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        }
    }
}

/// LRU cache of `get_recent(count)` results, keyed by `count`.
/// Capacity 10, entry age cap 30s by default; thread-safe behind a single
/// mutex (the working set is tiny, so lock contention is not a concern).
pub struct RecentCache {
    capacity: usize,
    max_age: Duration,
    entries: Mutex<HashMap<usize, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    total_requests: AtomicU64,
}

impl RecentCache {
    pub fn new() -> Self {
        Self::with_capacity_and_max_age(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }

    pub fn with_capacity_and_max_age(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    /// Look up a cached `get_recent(count)` result. Returns `None` on a
    /// miss or an expired entry (the expired entry is evicted eagerly).
    pub fn get(&self, count: usize) -> Option<Vec<Reading>> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&count) {
            if entry.is_expired(self.max_age) {
                entries.remove(&count);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.access_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a fresh result, evicting the oldest entry by `insert_time` if
    /// at capacity (deterministic LRU eviction).
    pub fn put(&self, count: usize, value: Vec<Reading>) {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(&count) && entries.len() >= self.capacity {
            if let Some((&oldest_key, _)) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.insert_time)
            {
                entries.remove(&oldest_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            count,
            CacheEntry {
                value,
                insert_time: Instant::now(),
                access_count: 0,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for RecentCache {
    fn default() -> Self {
        Self::new()
    }
}

const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

#[derive(Debug, Default, Clone, Copy)]
pub struct QueryTypeMetrics {
    pub total_count: u64,
    pub total_duration_ms: u64,
    pub slow_count: u64,
    pub cached_count: u64,
    pub failure_count: u64,
}

impl QueryTypeMetrics {
    pub fn avg_duration_ms(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_count as f64
        }
    }
}

/// Per-query-type timing records. One monitor is
/// shared across all HTTP handlers; each query type (`recent`, `range`,
/// `aggregate`, `info`) gets its own running totals.
#[derive(Default)]
pub struct QueryPerfMonitor {
    by_type: Mutex<HashMap<String, QueryTypeMetrics>>,
}

impl QueryPerfMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a query of the given type. The returned guard records
    /// its elapsed duration into this monitor when dropped, on every exit
    /// path — a guard whose `Drop` impl is the one release point.
    pub fn start(&self, query_type: impl Into<String>) -> QueryTimerGuard<'_> {
        QueryTimerGuard {
            monitor: self,
            query_type: query_type.into(),
            started: Instant::now(),
            cached: false,
            failed: false,
        }
    }

    fn record(&self, query_type: &str, duration: Duration, cached: bool, failed: bool) {
        let mut by_type = self.by_type.lock().unwrap();
        let metrics = by_type.entry(query_type.to_string()).or_default();
        metrics.total_count += 1;
        metrics.total_duration_ms += duration.as_millis() as u64;
        if duration.as_millis() as u64 > SLOW_QUERY_THRESHOLD_MS {
            metrics.slow_count += 1;
        }
        if cached {
            metrics.cached_count += 1;
        }
        if failed {
            metrics.failure_count += 1;
        }
    }

    pub fn snapshot(&self) -> HashMap<String, QueryTypeMetrics> {
        self.by_type.lock().unwrap().clone()
    }
}

/// Scoped query timer. On drop, records `{duration_ms, cached?, failed?}`
/// into the owning [`QueryPerfMonitor`] and bumps the slow-query counter
/// when `duration_ms > 100`.
pub struct QueryTimerGuard<'a> {
    monitor: &'a QueryPerfMonitor,
    query_type: String,
    started: Instant,
    cached: bool,
    failed: bool,
}

impl QueryTimerGuard<'_> {
    pub fn mark_cached(&mut self) {
        self.cached = true;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for QueryTimerGuard<'_> {
    fn drop(&mut self) {
        self.monitor
            .record(&self.query_type, self.started.elapsed(), self.cached, self.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::QualityFlags;

    fn sample(ts: u64) -> Reading {
        Reading {
            timestamp_us: ts,
            co2_ppm: Some(450.0),
            temperature_c: None,
            humidity_percent: None,
            quality_flags: QualityFlags::CO2_VALID,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = RecentCache::new();
        assert!(cache.get(10).is_none());
        cache.put(10, vec![sample(1)]);
        assert_eq!(cache.get(10), Some(vec![sample(1)]));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn entry_expires_after_max_age() {
        let cache = RecentCache::with_capacity_and_max_age(10, Duration::from_millis(1));
        cache.put(5, vec![sample(1)]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(5).is_none());
    }

    #[test]
    fn evicts_oldest_entry_at_capacity() {
        let cache = RecentCache::with_capacity_and_max_age(2, Duration::from_secs(30));
        cache.put(1, vec![sample(1)]);
        std::thread::sleep(Duration::from_millis(2));
        cache.put(2, vec![sample(2)]);
        std::thread::sleep(Duration::from_millis(2));
        cache.put(3, vec![sample(3)]); // should evict key 1 (oldest)
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn perf_monitor_records_slow_queries() {
        let monitor = QueryPerfMonitor::new();
        {
            let mut guard = monitor.start("recent");
            std::thread::sleep(Duration::from_millis(105));
            guard.mark_cached();
        }
        let snapshot = monitor.snapshot();
        let metrics = snapshot.get("recent").unwrap();
        assert_eq!(metrics.total_count, 1);
        assert_eq!(metrics.slow_count, 1);
        assert_eq!(metrics.cached_count, 1);
    }
}
