//! Storage metrics
//!
//! Atomic counters updated by rotating writers and the writer cache,
//! exported in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by every writer of one cache
#[derive(Debug, Default)]
pub struct StorageMetrics {
    /// Files opened
    pub files_opened: AtomicU64,
    /// Files closed (rotation, eviction or shutdown)
    pub files_closed: AtomicU64,
    /// Bucket changes observed by refresh
    pub bucket_rotations: AtomicU64,
    /// Version bumps (collision or schema change)
    pub version_bumps: AtomicU64,
    /// Rows handed to format writers
    pub rows_written: AtomicU64,
    /// Bytes in closed files
    pub bytes_closed: AtomicU64,
    /// Total time closed files were open (microseconds)
    pub open_duration_us: AtomicU64,
    /// I/O failures that force-closed an output
    pub write_errors: AtomicU64,
    /// Writers currently cached
    pub cached_writers: AtomicU64,
    /// Writers evicted after inactivity
    pub evictions: AtomicU64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a closed file
    pub fn record_close(&self, bytes: u64, open_for: Duration) {
        self.files_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_closed.fetch_add(bytes, Ordering::Relaxed);
        self.open_duration_us.fetch_add(
            u64::try_from(open_for.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self, node: &str) -> String {
        let mut output = String::with_capacity(2 * 1024);

        let counters = [
            ("logship_storage_files_opened_total", "Rotated files opened", &self.files_opened),
            ("logship_storage_files_closed_total", "Rotated files closed", &self.files_closed),
            ("logship_storage_bucket_rotations_total", "Time bucket changes", &self.bucket_rotations),
            ("logship_storage_version_bumps_total", "File version bumps within a bucket", &self.version_bumps),
            ("logship_storage_rows_written_total", "Rows written to rotated files", &self.rows_written),
            ("logship_storage_bytes_closed_total", "Bytes in closed rotated files", &self.bytes_closed),
            ("logship_storage_write_errors_total", "Write failures that force-closed a file", &self.write_errors),
            ("logship_storage_writer_evictions_total", "Writers evicted after inactivity", &self.evictions),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name}{{node=\"{node}\"}} {}", value.load(Ordering::Relaxed));
        }

        let _ = writeln!(
            output,
            "# HELP logship_storage_file_open_seconds_sum Total time closed files were open"
        );
        let _ = writeln!(output, "# TYPE logship_storage_file_open_seconds_sum counter");
        let _ = writeln!(
            output,
            "logship_storage_file_open_seconds_sum{{node=\"{node}\"}} {}",
            self.open_duration_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );

        let _ = writeln!(output, "# HELP logship_storage_cached_writers Live writer cache entries");
        let _ = writeln!(output, "# TYPE logship_storage_cached_writers gauge");
        let _ = writeln!(
            output,
            "logship_storage_cached_writers{{node=\"{node}\"}} {}",
            self.cached_writers.load(Ordering::Relaxed)
        );

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_prometheus() {
        let metrics = StorageMetrics::new();
        metrics.files_opened.fetch_add(2, Ordering::Relaxed);
        metrics.record_close(1024, Duration::from_millis(1500));
        metrics.cached_writers.store(3, Ordering::Relaxed);

        let text = metrics.export_prometheus("n1");
        assert!(text.contains("logship_storage_files_opened_total{node=\"n1\"} 2"));
        assert!(text.contains("logship_storage_bytes_closed_total{node=\"n1\"} 1024"));
        assert!(text.contains("logship_storage_file_open_seconds_sum{node=\"n1\"} 1.5"));
        assert!(text.contains("logship_storage_cached_writers{node=\"n1\"} 3"));
    }
}
