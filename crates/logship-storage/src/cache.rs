//! Writer cache
//!
//! Keeps one [`RotatingWriter`] per log identity (ignoring the client
//! hostname, so every host writing the same stream shares a file lineage).
//! Entries expire after three bucket intervals without a write; eviction
//! closes the writer. A background task refreshes every live writer so
//! files are rotated on time even when no data arrives.

use crate::format::writer_for;
use crate::metrics::StorageMetrics;
use crate::writer::{RotatingWriter, WriterSettings};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use logship_common::config::StorageConfig;
use logship_common::{Error, LogId, LogIdKey, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct CacheEntry {
    writer: Mutex<RotatingWriter>,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn touch(&self, now: Instant) {
        *self.last_access.lock() = now;
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(*self.last_access.lock()) >= ttl
    }
}

/// TTL cache of rotating writers
pub struct StreamWriterCache {
    config: StorageConfig,
    settings: WriterSettings,
    ttl: Duration,
    entries: DashMap<LogIdKey, Arc<CacheEntry>>,
    metrics: Arc<StorageMetrics>,
}

impl StreamWriterCache {
    pub fn new(config: StorageConfig) -> Self {
        let settings = WriterSettings {
            root_dir: config.root_dir.clone(),
            bucket_interval: config.bucket_interval(),
            max_versions: config.max_versions,
        };
        Self {
            ttl: config.writer_ttl(),
            config,
            settings,
            entries: DashMap::new(),
            metrics: Arc::new(StorageMetrics::new()),
        }
    }

    /// Override the inactivity TTL
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub const fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live writers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update_gauge(&self) {
        self.metrics
            .cached_writers
            .store(self.entries.len() as u64, Ordering::Relaxed);
    }

    fn entry(&self, log_id: &LogId, now: DateTime<Utc>) -> Result<Arc<CacheEntry>> {
        let key = log_id.cache_key();
        if let Some(entry) = self.entries.get(&key) {
            return Ok(Arc::clone(&entry));
        }

        let entry = self
            .entries
            .entry(key)
            .or_try_insert_with(|| {
                let format = writer_for(self.config.format_for(&log_id.log_type));
                let writer = RotatingWriter::new(
                    log_id.clone(),
                    self.settings.clone(),
                    format,
                    Arc::clone(&self.metrics),
                    now,
                )?;
                debug!(
                    "Created writer for {} ({})",
                    log_id.log_type, log_id.file_prefix_pattern
                );
                Ok::<_, Error>(Arc::new(CacheEntry {
                    writer: Mutex::new(writer),
                    last_access: Mutex::new(Instant::now()),
                }))
            })
            .map(|entry| Arc::clone(&entry))?;
        self.update_gauge();
        Ok(entry)
    }

    /// Write rows for `log_id` at the current time
    pub fn write(&self, log_id: &LogId, rows: &[Vec<String>]) -> Result<usize> {
        self.write_at(log_id, rows, Utc::now())
    }

    /// Write rows for `log_id` as of `now`
    pub fn write_at(&self, log_id: &LogId, rows: &[Vec<String>], now: DateTime<Utc>) -> Result<usize> {
        let mut retried = false;
        loop {
            let entry = self.entry(log_id, now)?;
            entry.touch(Instant::now());
            let result = entry
                .writer
                .lock()
                .write_at(now, &log_id.headers, &log_id.column_types, rows);

            match result {
                // Evicted between lookup and lock; build a fresh writer once.
                Err(Error::WriterClosed(_)) if !retried => {
                    retried = true;
                    self.entries
                        .remove_if(&log_id.cache_key(), |_, current| Arc::ptr_eq(current, &entry));
                    self.update_gauge();
                }
                result => return result,
            }
        }
    }

    /// Write several row groups as one unit as of `now`
    ///
    /// Every writer involved is locked (in a fixed order) and prepared
    /// before the first row is written, so a refusal such as version
    /// exhaustion leaves every file untouched. Only an I/O failure while
    /// appending rows can leave earlier groups written.
    pub fn write_batch_at(
        &self,
        batch: &[(LogId, &[Vec<String>])],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        for (log_id, rows) in batch {
            if let Some(row) = rows.iter().find(|row| row.len() != log_id.headers.len()) {
                return Err(Error::protocol(format!(
                    "row has {} cells, schema has {} columns",
                    row.len(),
                    log_id.headers.len()
                )));
            }
        }

        let mut retried = false;
        loop {
            match self.try_write_batch(batch, now) {
                // A writer was evicted between lookup and lock; look up again once.
                Err(Error::WriterClosed(_)) if !retried => retried = true,
                result => return result,
            }
        }
    }

    fn try_write_batch(&self, batch: &[(LogId, &[Vec<String>])], now: DateTime<Utc>) -> Result<usize> {
        let mut entries: Vec<Arc<CacheEntry>> = Vec::new();
        let mut slots = Vec::with_capacity(batch.len());
        for (log_id, _) in batch {
            let entry = self.entry(log_id, now)?;
            let slot = if let Some(i) = entries.iter().position(|e| Arc::ptr_eq(e, &entry)) {
                i
            } else {
                entries.push(entry);
                entries.len() - 1
            };
            slots.push(slot);
        }

        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&i| Arc::as_ptr(&entries[i]) as usize);
        let touched = Instant::now();
        let mut guards: Vec<(usize, MutexGuard<'_, RotatingWriter>)> = order
            .into_iter()
            .map(|i| {
                entries[i].touch(touched);
                (i, entries[i].writer.lock())
            })
            .collect();
        guards.sort_by_key(|(i, _)| *i);

        for ((log_id, rows), &slot) in batch.iter().zip(&slots) {
            if !rows.is_empty() {
                guards[slot]
                    .1
                    .prepare_at(now, &log_id.headers, &log_id.column_types)?;
            }
        }

        let mut written = 0;
        for ((_, rows), &slot) in batch.iter().zip(&slots) {
            if !rows.is_empty() {
                written += guards[slot].1.write_prepared(rows)?;
            }
        }
        Ok(written)
    }

    /// Refresh every live writer as of `now`
    pub fn refresh_all(&self, now: DateTime<Utc>) {
        let entries: Vec<Arc<CacheEntry>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let mut writer = entry.writer.lock();
            if let Err(e) = writer.refresh_at(now, false) {
                warn!("Refresh of {} failed: {}", writer.current_pattern(), e);
            }
        }
    }

    /// Evict and close writers idle for longer than the TTL
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Evict writers idle at `now`; returns the number evicted
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let expired: Vec<LogIdKey> = self
            .entries
            .iter()
            .filter(|e| e.value().expired(now, self.ttl))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&key, |_, entry| entry.expired(now, self.ttl))
            {
                close_entry(&entry);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.metrics
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            self.update_gauge();
            debug!("Evicted {} idle writers", evicted);
        }
        evicted
    }

    /// Close and drop every writer
    pub fn close_all(&self) {
        let keys: Vec<LogIdKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                close_entry(&entry);
                closed += 1;
            }
        }
        self.update_gauge();
        info!("Closed {} writers", closed);
    }

    /// Spawn the fixed-delay refresh and expiry task
    pub fn spawn_refresh(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.refresh_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.refresh_all(Utc::now());
                        cache.cleanup();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Writer refresh task stopped");
        })
    }
}

fn close_entry(entry: &CacheEntry) {
    let mut writer = entry.writer.lock();
    if let Err(e) = writer.close() {
        warn!("Failed to close writer {}: {}", writer.current_pattern(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::{ROW_COUNT_PROPERTY, Sidecar};
    use chrono::TimeZone;
    use logship_common::config::{FormatKind, LogTypeOverride};
    use std::collections::BTreeMap;
    use tempfile::{TempDir, tempdir};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, 0).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            root_dir: dir.path().to_path_buf(),
            file_pattern: "{log_type}/{HH}{mm}.v{version}".into(),
            buckets_per_hour: 12,
            max_versions: 20,
            refresh_interval_ms: 10,
            overrides: vec![LogTypeOverride {
                log_type: "audit".into(),
                file_pattern: None,
                format: Some(FormatKind::Jsonl),
            }],
            ..StorageConfig::default()
        }
    }

    fn log_id(log_type: &str, host: &str, headers: &[&str]) -> LogId {
        LogId {
            file_prefix_pattern: "{log_type}/{HH}{mm}.v{version}".into(),
            log_type: log_type.into(),
            client_hostname: host.into(),
            properties: BTreeMap::new(),
            headers: strings(headers),
            column_types: headers.iter().map(|_| "string".to_string()).collect(),
        }
    }

    fn row(n: usize) -> Vec<Vec<String>> {
        vec![(0..n).map(|i| i.to_string()).collect()]
    }

    #[test]
    fn test_hosts_share_a_writer() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));

        cache.write_at(&log_id("access", "web-1", &["a"]), &row(1), at(1, 3)).unwrap();
        cache.write_at(&log_id("access", "web-2", &["a"]), &row(1), at(1, 3)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.metrics().cached_writers.load(Ordering::Relaxed), 1);

        let text = std::fs::read_to_string(dir.path().join("access/0100.v1.tsv")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_scenario_across_buckets_and_schemas() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));
        let before = log_id("access", "web-1", &["ts", "msg"]);
        let after = log_id("access", "web-1", &["ts", "level", "msg"]);

        cache.write_at(&before, &row(2), at(1, 3)).unwrap();
        cache.write_at(&before, &row(2), at(1, 16)).unwrap();
        cache.write_at(&after, &row(3), at(1, 16)).unwrap();
        cache.close_all();

        let names: Vec<&str> = vec!["0100.v1.tsv", "0115.v1.tsv", "0115.v2.tsv"];
        for name in &names {
            assert!(dir.path().join("access").join(name).exists(), "{name}");
        }
        assert!(!dir.path().join("access/0100.v2.tsv").exists());
        let sidecar = Sidecar::read(&dir.path().join("access/0115.v2.tsv")).unwrap();
        assert_eq!(sidecar.headers, strings(&["ts", "level", "msg"]));
    }

    #[test]
    fn test_format_override_by_log_type() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));
        cache.write_at(&log_id("audit", "h", &["user"]), &row(1), at(2, 0)).unwrap();
        assert!(dir.path().join("audit/0200.v1.jsonl").exists());
    }

    #[test]
    fn test_idle_writers_are_evicted_and_closed() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));
        assert_eq!(cache.ttl(), Duration::from_secs(900));
        let id = log_id("access", "web-1", &["a"]);
        cache.write_at(&id, &row(1), at(3, 0)).unwrap();

        assert_eq!(cache.cleanup_at(Instant::now()), 0);
        assert_eq!(cache.cleanup_at(Instant::now() + cache.ttl()), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().files_closed.load(Ordering::Relaxed), 1);
        let sidecar = Sidecar::read(&dir.path().join("access/0300.v1.tsv")).unwrap();
        assert_eq!(sidecar.properties[ROW_COUNT_PROPERTY], "1");

        cache.write_at(&id, &row(1), at(3, 1)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(dir.path().join("access/0300.v2.tsv").exists());
    }

    #[test]
    fn test_refresh_all_closes_finished_buckets() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));
        cache.write_at(&log_id("access", "h", &["a"]), &row(1), at(4, 0)).unwrap();

        cache.refresh_all(at(4, 2));
        assert_eq!(cache.metrics().files_closed.load(Ordering::Relaxed), 0);
        cache.refresh_all(at(4, 5));
        assert_eq!(cache.metrics().files_closed.load(Ordering::Relaxed), 1);
        assert_eq!(cache.metrics().bucket_rotations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_refresh_task_evicts_until_shutdown() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(StreamWriterCache::new(config(&dir)).with_ttl(Duration::ZERO));
        cache.write(&log_id("access", "h", &["a"]), &row(1)).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = cache.spawn_refresh(rx);
        for _ in 0..100 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_batch_refused_before_any_row_is_written() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(StorageConfig {
            max_versions: 1,
            ..config(&dir)
        });
        let plain = log_id("access", "h", &["line"]);
        let stamped = log_id("access", "h", &["ts", "line"]);
        let first = vec![strings(&["one"])];
        let second = vec![strings(&["1", "two"])];
        let batch = [(plain, first.as_slice()), (stamped, second.as_slice())];

        for _ in 0..2 {
            let err = cache.write_batch_at(&batch, at(1, 0)).unwrap_err();
            assert!(matches!(err, Error::VersionsExhausted { .. }), "{err}");
        }
        cache.close_all();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("access/0100.v1.tsv")).unwrap(),
            "line\n"
        );
        assert_eq!(cache.metrics().rows_written.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_batch_spans_writers() {
        let dir = tempdir().unwrap();
        let cache = StreamWriterCache::new(config(&dir));
        let plain = log_id("access", "h", &["line"]);
        let stamped = log_id("access", "h", &["ts", "line"]);
        let first = vec![strings(&["one"]), strings(&["two"])];
        let second = vec![strings(&["1", "three"])];
        let batch = [
            (plain.clone(), first.as_slice()),
            (stamped, second.as_slice()),
            (plain, first.as_slice()),
        ];

        assert_eq!(cache.write_batch_at(&batch, at(2, 0)).unwrap(), 5);
        assert_eq!(cache.len(), 2);
        cache.close_all();
        let v1 = std::fs::read_to_string(dir.path().join("access/0200.v1.tsv")).unwrap();
        assert_eq!(v1, "line\none\ntwo\none\ntwo\n");
        assert!(dir.path().join("access/0200.v2.tsv").exists());
    }
}
