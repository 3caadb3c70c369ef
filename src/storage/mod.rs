//! Time-series store: an LSM-backed ordered key-value store keyed by
//! an 8-byte big-endian microsecond timestamp.
//!
//! `sled` supplies the ordered keyspace, iterator and flush/compaction
//! primitives; TTL isn't native to `sled` so `cleanup()` implements it as an
//! explicit range delete of keys older than retention.

pub mod cache;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::reading::{self, Reading};

/// Below this much free space, `put` refuses writes rather than risk a
/// half-written record.
const MIN_FREE_DISK_BYTES: u64 = 100 * 1024 * 1024;

const SENTINEL_KEY: &[u8] = b"__sensor_daemon_sentinel__";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },
    #[error("insufficient free disk space for write")]
    DiskFull,
    #[error("store I/O error: {0}")]
    Io(#[from] sled::Error),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// `get_recent`/`get_range` hard upper bounds.
pub const MAX_RECENT_COUNT: usize = 10_000;
pub const MAX_RANGE_RESULTS: usize = 50_000;
const DEFAULT_RANGE_RESULTS: usize = 10_000;
const DEFAULT_STREAM_BATCH: usize = 1_000;

/// Encode a microsecond timestamp as the 8-byte big-endian key. Lexicographic
/// order of this encoding equals chronological order — the store's sole
/// sort criterion.
pub fn encode_key(timestamp_us: u64) -> [u8; 8] {
    timestamp_us.to_be_bytes()
}

pub fn decode_key(key: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(key.try_into().ok()?))
}

#[derive(Debug, Clone, Copy)]
pub struct StoreInfo {
    pub total_records_estimate: usize,
    pub earliest_ts: Option<u64>,
    pub latest_ts: Option<u64>,
    pub db_size_bytes: u64,
    pub healthy: bool,
}

/// Embedded LSM-backed time-series store for [`Reading`]s.
pub struct TimeSeriesStore {
    tree: sled::Db,
    path: PathBuf,
    retention: Duration,
}

impl TimeSeriesStore {
    /// Open (or create) the store at `data_directory` with the given
    /// retention window. `sled`'s config is tuned toward a time-series
    /// write pattern: a small write buffer, modest segment size, and a
    /// compact ~2MB block cache.
    pub fn open(data_directory: &Path, retention: Duration) -> StorageResult<Self> {
        let db = sled::Config::new()
            .path(data_directory)
            .cache_capacity(2 * 1024 * 1024)
            .flush_every_ms(None) // WAL append durability without a per-write fsync.
            .mode(sled::Mode::LowSpace)
            .open()
            .map_err(|source| StorageError::Open {
                path: data_directory.to_path_buf(),
                source,
            })?;

        Ok(Self {
            tree: db,
            path: data_directory.to_path_buf(),
            retention,
        })
    }

    /// Store a reading, keyed by its microsecond timestamp. Fails
    /// cleanly rather than panicking when free disk space drops below the
    /// 100 MB floor.
    pub fn put(&self, reading: &Reading) -> StorageResult<()> {
        if self.free_disk_bytes() < MIN_FREE_DISK_BYTES {
            return Err(StorageError::DiskFull);
        }
        let key = encode_key(reading.timestamp_us);
        let value = reading::serialize(reading);
        self.tree.insert(key, value)?;
        Ok(())
    }

    /// The `count` newest readings, newest first . `count` is
    /// clamped to `1..=MAX_RECENT_COUNT` silently.
    pub fn get_recent(&self, count: usize) -> StorageResult<Vec<Reading>> {
        let count = count.clamp(1, MAX_RECENT_COUNT);
        let mut out = Vec::with_capacity(count.min(256));
        for entry in self.tree.iter().rev() {
            if out.len() >= count {
                break;
            }
            let (_key, value) = entry?;
            if let Some(reading) = reading::deserialize(&value) {
                out.push(reading);
            }
        }
        Ok(out)
    }

    /// Readings with `start <= ts <= end`, chronological order.
    /// `max_results` is clamped to `MAX_RANGE_RESULTS`.
    pub fn get_range(
        &self,
        start_us: u64,
        end_us: u64,
        max_results: Option<usize>,
    ) -> StorageResult<Vec<Reading>> {
        if start_us > end_us {
            return Err(StorageError::InvalidQuery(
                "range start must be <= end".to_string(),
            ));
        }
        let max_results = max_results
            .unwrap_or(DEFAULT_RANGE_RESULTS)
            .clamp(1, MAX_RANGE_RESULTS);

        let start_key = encode_key(start_us);
        let end_key = encode_key(end_us);
        let mut out = Vec::with_capacity(max_results.min(256));
        for entry in self.tree.range(start_key..=end_key) {
            if out.len() >= max_results {
                break;
            }
            let (_key, value) = entry?;
            if let Some(reading) = reading::deserialize(&value) {
                out.push(reading);
            }
        }
        Ok(out)
    }

    /// Stream readings in `[start, end]` to `on_batch` in chunks of
    /// `batch_size`, halting early if `on_batch` returns `false`.
    /// Returns the number of readings actually delivered. The trailing
    /// partial batch is delivered only if non-empty.
    pub fn stream_range<F>(
        &self,
        start_us: u64,
        end_us: u64,
        batch_size: Option<usize>,
        max_results: Option<usize>,
        mut on_batch: F,
    ) -> StorageResult<usize>
    where
        F: FnMut(&[Reading]) -> bool,
    {
        if start_us > end_us {
            return Err(StorageError::InvalidQuery(
                "range start must be <= end".to_string(),
            ));
        }
        let batch_size = batch_size.unwrap_or(DEFAULT_STREAM_BATCH).max(1);
        let max_results = max_results
            .unwrap_or(MAX_RANGE_RESULTS)
            .clamp(1, MAX_RANGE_RESULTS);

        let start_key = encode_key(start_us);
        let end_key = encode_key(end_us);
        let mut batch = Vec::with_capacity(batch_size);
        let mut processed = 0usize;

        for entry in self.tree.range(start_key..=end_key) {
            if processed >= max_results {
                break;
            }
            let (_key, value) = entry?;
            let Some(reading) = reading::deserialize(&value) else {
                continue;
            };
            batch.push(reading);
            processed += 1;
            if batch.len() >= batch_size {
                if !on_batch(&batch) {
                    return Ok(processed);
                }
                batch.clear();
            }
        }
        if !batch.is_empty() {
            on_batch(&batch);
        }
        Ok(processed)
    }

    /// Summary statistics for the `/data/info` / diagnostic surfaces.
    pub fn info(&self) -> StoreInfo {
        let earliest_ts = self
            .tree
            .iter()
            .next()
            .and_then(Result::ok)
            .and_then(|(k, _)| decode_key(&k));
        let latest_ts = self
            .tree
            .iter()
            .next_back()
            .and_then(Result::ok)
            .and_then(|(k, _)| decode_key(&k));

        StoreInfo {
            total_records_estimate: self.tree.len(),
            earliest_ts,
            latest_ts,
            db_size_bytes: self.tree.size_on_disk().unwrap_or(0),
            healthy: self.health(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cheap readiness check: a read against a sentinel key is healthy
    /// whether or not the key exists — only an I/O error is unhealthy.
    pub fn health(&self) -> bool {
        self.tree.get(SENTINEL_KEY).is_ok()
    }

    /// Force a full compaction and sweep keys older than the configured
    /// retention. Manual trigger; the daemon also calls this
    /// opportunistically on a periodic tick.
    pub fn cleanup(&self) -> StorageResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let cutoff_key = encode_key(cutoff);
        let expired: Vec<sled::IVec> = self
            .tree
            .range(..cutoff_key)
            .filter_map(Result::ok)
            .map(|(k, _)| k)
            .collect();
        let removed = expired.len();
        for key in expired {
            self.tree.remove(key)?;
        }
        self.tree.flush()?;
        Ok(removed)
    }

    fn free_disk_bytes(&self) -> u64 {
        check_disk_space(&self.path)
    }
}

/// Free bytes available on the filesystem backing `path`.
///
/// Walks `sysinfo`'s disk list for the mount point that most specifically
/// contains `path` (longest matching prefix), the same disk-lookup `sysinfo`
/// itself recommends since it doesn't expose a path-to-disk lookup directly.
fn check_disk_space(path: &Path) -> u64 {
    let dir = if path.exists() {
        path.to_path_buf()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let canonical = dir.canonicalize().unwrap_or(dir);

    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .unwrap_or(u64::MAX)
}

/// Log a store-level error through the tracing backend with consistent
/// structure.
pub fn log_storage_error(operation: &str, err: &StorageError) {
    tracing::error!(operation, error = %err, "storage operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::QualityFlags;
    use tempfile::TempDir;

    fn reading_at(ts: u64) -> Reading {
        Reading {
            timestamp_us: ts,
            co2_ppm: Some(450.5),
            temperature_c: Some(23.2),
            humidity_percent: Some(65.8),
            quality_flags: QualityFlags::CO2_VALID
                | QualityFlags::TEMP_VALID
                | QualityFlags::HUMIDITY_VALID,
        }
    }

    fn open_temp_store() -> (TempDir, TimeSeriesStore) {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::open(dir.path(), Duration::from_secs(3600 * 24 * 365))
            .expect("store opens");
        (dir, store)
    }

    #[test]
    fn round_trip_store_put_then_get_recent() {
        let (_dir, store) = open_temp_store();
        let reading = reading_at(1_700_000_000_000_000);
        store.put(&reading).unwrap();
        let recent = store.get_recent(1).unwrap();
        assert_eq!(recent, vec![reading]);
    }

    #[test]
    fn range_excludes_out_of_bounds() {
        let (_dir, store) = open_temp_store();
        store.put(&reading_at(10_000_000)).unwrap();
        store.put(&reading_at(20_000_000)).unwrap();
        store.put(&reading_at(30_000_000)).unwrap();

        let results = store.get_range(15_000_000, 25_000_000, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timestamp_us, 20_000_000);
    }

    #[test]
    fn recent_ordering_is_newest_first() {
        let (_dir, store) = open_temp_store();
        for i in 1..=10u64 {
            store.put(&reading_at(i * 1_000_000)).unwrap();
        }
        let recent = store.get_recent(3).unwrap();
        let timestamps: Vec<u64> = recent.iter().map(|r| r.timestamp_us).collect();
        assert_eq!(timestamps, vec![10_000_000, 9_000_000, 8_000_000]);
    }

    #[test]
    fn get_recent_clamps_count_to_max() {
        let (_dir, store) = open_temp_store();
        store.put(&reading_at(1)).unwrap();
        let recent = store.get_recent(MAX_RECENT_COUNT + 500).unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn stream_range_delivers_batches_and_honors_continue_flag() {
        let (_dir, store) = open_temp_store();
        for i in 1..=10u64 {
            store.put(&reading_at(i * 1_000_000)).unwrap();
        }
        let mut seen = Vec::new();
        let processed = store
            .stream_range(0, 10_000_000, Some(3), None, |batch| {
                seen.extend_from_slice(batch);
                true
            })
            .unwrap();
        assert_eq!(processed, 10);
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn stream_range_halts_when_callback_returns_false() {
        let (_dir, store) = open_temp_store();
        for i in 1..=10u64 {
            store.put(&reading_at(i * 1_000_000)).unwrap();
        }
        let mut batches_seen = 0;
        let processed = store
            .stream_range(0, 10_000_000, Some(3), None, |_batch| {
                batches_seen += 1;
                batches_seen < 2
            })
            .unwrap();
        assert_eq!(batches_seen, 2);
        assert_eq!(processed, 6);
    }

    #[test]
    fn info_reports_bounds() {
        let (_dir, store) = open_temp_store();
        store.put(&reading_at(10_000_000)).unwrap();
        store.put(&reading_at(30_000_000)).unwrap();
        let info = store.info();
        assert_eq!(info.total_records_estimate, 2);
        assert_eq!(info.earliest_ts, Some(10_000_000));
        assert_eq!(info.latest_ts, Some(30_000_000));
        assert!(info.healthy);
    }

    #[test]
    fn cleanup_removes_entries_older_than_retention() {
        let dir = TempDir::new().unwrap();
        let store = TimeSeriesStore::open(dir.path(), Duration::from_secs(1)).unwrap();
        let ancient = reading::now_micros().saturating_sub(10_000_000);
        store.put(&reading_at(ancient)).unwrap();
        store.put(&reading_at(reading::now_micros())).unwrap();
        let removed = store.cleanup().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.info().total_records_estimate, 1);
    }

    #[test]
    fn health_is_true_on_fresh_store() {
        let (_dir, store) = open_temp_store();
        assert!(store.health());
    }
}
