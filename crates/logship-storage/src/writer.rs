//! Rotating writer
//!
//! Owns at most one open output for a log identity and decides on every
//! write whether the time bucket or the content version requires a new
//! file:
//!
//! ```text
//! NO_FILE --write--> OPEN --bucket change / schema change--> NO_FILE --write--> OPEN
//!    \                 \
//!     +----close-------+----close----> CLOSED
//! ```
//!
//! The file name of an open output is the pattern computed when it was
//! opened. `file_version` only grows within a bucket and resets to 1 when
//! the bucket changes.

use crate::format::FormatWriter;
use crate::metrics::StorageMetrics;
use crate::pattern::{NameFields, NamingTemplate};
use crate::sidecar::{ROW_COUNT_PROPERTY, Sidecar};
use chrono::{DateTime, Utc};
use logship_common::{Error, LogId, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Settings shared by every writer of a cache
#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Directory rendered names are relative to
    pub root_dir: PathBuf,
    /// Length of one time bucket
    pub bucket_interval: Duration,
    /// Highest file version allowed within one bucket
    pub max_versions: u32,
}

/// Lifecycle state of a [`RotatingWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    NoFile,
    Open,
    Closed,
}

struct OpenOutput {
    path: PathBuf,
    sidecar: Sidecar,
    opened_at: Instant,
    rows: u64,
}

/// Time-bucketed, versioned file writer for one log identity
pub struct RotatingWriter {
    log_id: LogId,
    template: NamingTemplate,
    settings: WriterSettings,
    format: Box<dyn FormatWriter>,
    output: Option<OpenOutput>,
    /// Pattern the next file will be opened under
    current_pattern: String,
    /// Pattern adopted by the last refresh
    last_applied_pattern: String,
    file_version: u32,
    closed: bool,
    metrics: Arc<StorageMetrics>,
}

impl RotatingWriter {
    /// Create a writer; no file is opened until the first write
    pub fn new(
        log_id: LogId,
        settings: WriterSettings,
        format: Box<dyn FormatWriter>,
        metrics: Arc<StorageMetrics>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let template = NamingTemplate::parse(&log_id.file_prefix_pattern, settings.bucket_interval)?;
        let mut writer = Self {
            log_id,
            template,
            settings,
            format,
            output: None,
            current_pattern: String::new(),
            last_applied_pattern: String::new(),
            file_version: 1,
            closed: false,
            metrics,
        };
        writer.current_pattern = writer.render(now, 1);
        writer.last_applied_pattern = writer.current_pattern.clone();
        Ok(writer)
    }

    pub const fn log_id(&self) -> &LogId {
        &self.log_id
    }

    pub const fn file_version(&self) -> u32 {
        self.file_version
    }

    pub const fn state(&self) -> WriterState {
        if self.closed {
            WriterState::Closed
        } else if self.output.is_some() {
            WriterState::Open
        } else {
            WriterState::NoFile
        }
    }

    /// Path of the open output, if any
    pub fn current_path(&self) -> Option<&Path> {
        self.output.as_ref().map(|o| o.path.as_path())
    }

    /// Relative name the next file will be opened under
    pub fn current_pattern(&self) -> &str {
        &self.current_pattern
    }

    fn render(&self, now: DateTime<Utc>, version: u32) -> String {
        let fields = NameFields {
            log_type: &self.log_id.log_type,
            host: &self.log_id.client_hostname,
            properties: &self.log_id.properties,
            extension: self.format.extension(),
        };
        self.template.render(&fields, now, version)
    }

    /// Write rows at the current time
    pub fn write(
        &mut self,
        headers: &[String],
        column_types: &[String],
        rows: &[Vec<String>],
    ) -> Result<usize> {
        self.write_at(Utc::now(), headers, column_types, rows)
    }

    /// Write rows as of `now`; returns the number of rows written
    pub fn write_at(
        &mut self,
        now: DateTime<Utc>,
        headers: &[String],
        column_types: &[String],
        rows: &[Vec<String>],
    ) -> Result<usize> {
        if let Some(row) = rows.iter().find(|row| row.len() != headers.len()) {
            return Err(Error::protocol(format!(
                "row has {} cells, schema has {} columns",
                row.len(),
                headers.len()
            )));
        }
        if rows.is_empty() {
            self.sync_at(now, headers, column_types)?;
            return Ok(0);
        }
        self.prepare_at(now, headers, column_types)?;
        self.write_prepared(rows)
    }

    /// Bring the writer to an open output for `(headers, column_types)`
    ///
    /// Everything that can refuse a write (closed writer, bucket refresh,
    /// version exhaustion, file creation) happens here, so a caller can
    /// prepare several writers before writing rows to any of them.
    pub fn prepare_at(
        &mut self,
        now: DateTime<Utc>,
        headers: &[String],
        column_types: &[String],
    ) -> Result<()> {
        self.sync_at(now, headers, column_types)?;
        if self.output.is_none() {
            self.open_output(now)?;
        }
        Ok(())
    }

    fn sync_at(&mut self, now: DateTime<Utc>, headers: &[String], column_types: &[String]) -> Result<()> {
        if self.closed {
            return Err(Error::WriterClosed(self.current_pattern.clone()));
        }
        self.refresh_at(now, false)?;

        if !self.log_id.same_schema(headers, column_types) {
            self.log_id.headers = headers.to_vec();
            self.log_id.column_types = column_types.to_vec();
            if self.output.is_some() {
                debug!(
                    "Schema of {} changed, starting a new version",
                    self.current_pattern
                );
                self.close_output()?;
                self.bump_version(now)?;
            }
        }
        Ok(())
    }

    /// Append rows to the output opened by [`Self::prepare_at`]
    pub fn write_prepared(&mut self, rows: &[Vec<String>]) -> Result<usize> {
        if self.output.is_none() {
            return Err(Error::internal(format!(
                "no open output for {}",
                self.current_pattern
            )));
        }
        if let Some(row) = rows.iter().find(|row| row.len() != self.log_id.headers.len()) {
            return Err(Error::protocol(format!(
                "row has {} cells, schema has {} columns",
                row.len(),
                self.log_id.headers.len()
            )));
        }

        for row in rows {
            if let Err(e) = self.format.write_record(row) {
                return Err(self.fail(e));
            }
        }
        if let Err(e) = self.format.flush() {
            return Err(self.fail(e));
        }

        if let Some(output) = self.output.as_mut() {
            output.rows += rows.len() as u64;
        }
        self.metrics
            .rows_written
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(rows.len())
    }

    /// Refresh at the current time
    pub fn refresh(&mut self, force_sync: bool) -> Result<()> {
        self.refresh_at(Utc::now(), force_sync)
    }

    /// Recompute the file pattern as of `now`
    ///
    /// When the pattern changed (or `force_sync` is set) the open output is
    /// closed and the new pattern adopted; the next write opens it. A
    /// pattern that differs even at `file_version - 1` means the bucket
    /// changed, which resets the version to 1.
    pub fn refresh_at(&mut self, now: DateTime<Utc>, force_sync: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut pattern = self.render(now, self.file_version);
        if !force_sync && pattern == self.last_applied_pattern {
            return Ok(());
        }

        let bucket_changed = pattern != self.last_applied_pattern
            && self.render(now, self.file_version.saturating_sub(1)) != self.last_applied_pattern;
        if bucket_changed {
            self.file_version = 1;
            pattern = self.render(now, 1);
            self.metrics.bucket_rotations.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Bucket changed for {}: {} -> {}",
                self.log_id.log_type, self.last_applied_pattern, pattern
            );
        }

        let closed = self.close_output();
        self.current_pattern = pattern.clone();
        self.last_applied_pattern = pattern;
        closed
    }

    fn bump_version(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.file_version >= self.settings.max_versions {
            error!(
                "No free version for {} after {} attempts",
                self.current_pattern, self.settings.max_versions
            );
            return Err(Error::VersionsExhausted {
                path: self.current_pattern.clone(),
                max_versions: self.settings.max_versions,
            });
        }
        self.file_version += 1;
        self.metrics.version_bumps.fetch_add(1, Ordering::Relaxed);
        self.refresh_at(now, true)
    }

    fn open_output(&mut self, now: DateTime<Utc>) -> Result<()> {
        loop {
            let path = self.settings.root_dir.join(&self.current_pattern);
            if path.exists() || Sidecar::path_for(&path).exists() {
                self.bump_version(now)?;
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::writer(parent, e))?;
            }

            match self
                .format
                .open(&path, &self.log_id.headers, &self.log_id.column_types)
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    self.bump_version(now)?;
                    continue;
                }
                Err(e) => {
                    self.format.abort();
                    return Err(Error::writer(path, e));
                }
            }

            let sidecar = Sidecar::for_log_id(&self.log_id);
            if let Err(e) = sidecar.write(&path) {
                self.format.abort();
                if let Err(remove) = Sidecar::remove_with(&path) {
                    warn!("Failed to remove {} after sidecar failure: {}", path.display(), remove);
                }
                return Err(e);
            }

            self.metrics.files_opened.fetch_add(1, Ordering::Relaxed);
            info!("Opened {} (version {})", path.display(), self.file_version);
            self.output = Some(OpenOutput {
                path,
                sidecar,
                opened_at: Instant::now(),
                rows: 0,
            });
            return Ok(());
        }
    }

    /// Drop the output after an I/O failure; the next write reopens
    fn fail(&mut self, source: io::Error) -> Error {
        self.format.abort();
        self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
        let path = self
            .output
            .take()
            .map_or_else(|| PathBuf::from(&self.current_pattern), |o| o.path);
        error!("Write to {} failed, closing it: {}", path.display(), source);
        Error::writer(path, source)
    }

    fn close_output(&mut self) -> Result<()> {
        let Some(mut output) = self.output.take() else {
            return Ok(());
        };
        let bytes = match self.format.close() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::writer(output.path, e));
            }
        };
        self.metrics.record_close(bytes, output.opened_at.elapsed());

        output
            .sidecar
            .properties
            .insert(ROW_COUNT_PROPERTY.to_string(), output.rows.to_string());
        if let Err(e) = output.sidecar.write(&output.path) {
            warn!("Failed to finalize sidecar of {}: {}", output.path.display(), e);
        }
        remove_stray_files(&output.path);

        info!(
            "Closed {} ({} rows, {} bytes)",
            output.path.display(),
            output.rows,
            bytes
        );
        Ok(())
    }

    /// Close the output and refuse further writes
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.close_output()
    }
}

impl Drop for RotatingWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close writer for {}: {}", self.current_pattern, e);
        }
    }
}

/// Remove checksum and temp files left next to a closed output
fn remove_stray_files(path: &Path) {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    let name = name.to_string_lossy();
    let candidates = [
        dir.join(format!(".{name}.crc")),
        dir.join(format!("{name}.tmp")),
        dir.join(format!("{name}.meta.json.tmp")),
    ];
    for candidate in candidates {
        match fs::remove_file(&candidate) {
            Ok(()) => debug!("Removed stray file {}", candidate.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", candidate.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{TsvWriter, writer_for};
    use chrono::TimeZone;
    use logship_common::config::FormatKind;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use tempfile::{TempDir, tempdir};

    const PATTERN: &str = "{log_type}/{HH}{mm}.v{version}";

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, 0).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn log_id() -> LogId {
        LogId {
            file_prefix_pattern: PATTERN.into(),
            log_type: "access".into(),
            client_hostname: "web-1".into(),
            properties: BTreeMap::new(),
            headers: strings(&["ts", "msg"]),
            column_types: strings(&["long", "string"]),
        }
    }

    fn settings(dir: &TempDir, max_versions: u32) -> WriterSettings {
        WriterSettings {
            root_dir: dir.path().to_path_buf(),
            bucket_interval: Duration::from_secs(300),
            max_versions,
        }
    }

    fn writer(dir: &TempDir, max_versions: u32, now: DateTime<Utc>) -> RotatingWriter {
        RotatingWriter::new(
            log_id(),
            settings(dir, max_versions),
            writer_for(FormatKind::Tsv),
            Arc::new(StorageMetrics::new()),
            now,
        )
        .unwrap()
    }

    fn rows(n: usize) -> Vec<Vec<String>> {
        (0..n).map(|i| vec![i.to_string(), format!("row {i}")]).collect()
    }

    #[test]
    fn test_bucket_and_schema_scenario() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(1, 3));

        w.write_at(at(1, 3), &id.headers, &id.column_types, &rows(1)).unwrap();
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0100.v1.tsv"));

        w.write_at(at(1, 16), &id.headers, &id.column_types, &rows(1)).unwrap();
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0115.v1.tsv"));
        assert_eq!(w.file_version(), 1);

        let changed = strings(&["ts", "level", "msg"]);
        let types = strings(&["long", "string", "string"]);
        let row = vec![strings(&["3", "WARN", "disk full"])];
        w.write_at(at(1, 16), &changed, &types, &row).unwrap();
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0115.v2.tsv"));
        assert_eq!(w.file_version(), 2);
        w.close().unwrap();

        for name in ["0100.v1.tsv", "0115.v1.tsv", "0115.v2.tsv"] {
            assert!(dir.path().join("access").join(name).exists(), "{name}");
        }
        let sidecar = Sidecar::read(&dir.path().join("access/0115.v2.tsv")).unwrap();
        assert_eq!(sidecar.headers, changed);
        let first = Sidecar::read(&dir.path().join("access/0115.v1.tsv")).unwrap();
        assert_ne!(first.content_version(), sidecar.content_version());
    }

    #[test]
    fn test_collision_bumps_version_until_exhausted() {
        let dir = tempdir().unwrap();
        let id = log_id();
        fs::create_dir_all(dir.path().join("access")).unwrap();
        for v in 1..=2 {
            fs::write(dir.path().join(format!("access/0100.v{v}.tsv")), b"").unwrap();
        }

        let mut w = writer(&dir, 3, at(1, 0));
        w.write_at(at(1, 1), &id.headers, &id.column_types, &rows(2)).unwrap();
        assert_eq!(w.file_version(), 3);
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0100.v3.tsv"));
        w.close().unwrap();

        let mut w = writer(&dir, 3, at(1, 0));
        let err = w
            .write_at(at(1, 2), &id.headers, &id.column_types, &rows(1))
            .unwrap_err();
        assert!(matches!(err, Error::VersionsExhausted { max_versions: 3, .. }));
        assert!(!dir.path().join("access/0100.v4.tsv").exists());
    }

    #[test]
    fn test_version_resets_only_on_bucket_change() {
        let dir = tempdir().unwrap();
        let id = log_id();
        fs::create_dir_all(dir.path().join("access")).unwrap();
        fs::write(dir.path().join("access/0100.v1.tsv"), b"").unwrap();

        let mut w = writer(&dir, 20, at(1, 0));
        w.write_at(at(1, 0), &id.headers, &id.column_types, &rows(1)).unwrap();
        assert_eq!(w.file_version(), 2);

        w.refresh_at(at(1, 4), false).unwrap();
        assert_eq!(w.file_version(), 2);
        assert_eq!(w.state(), WriterState::Open);

        w.refresh_at(at(1, 5), false).unwrap();
        assert_eq!(w.file_version(), 1);
        assert_eq!(w.state(), WriterState::NoFile);
        assert_eq!(w.current_pattern(), "access/0105.v1.tsv");
    }

    #[test]
    fn test_forced_refresh_closes_and_next_write_moves_on() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(2, 0));
        w.write_at(at(2, 0), &id.headers, &id.column_types, &rows(3)).unwrap();

        w.refresh_at(at(2, 1), true).unwrap();
        assert_eq!(w.state(), WriterState::NoFile);

        let sidecar = Sidecar::read(&dir.path().join("access/0200.v1.tsv")).unwrap();
        assert_eq!(sidecar.properties[ROW_COUNT_PROPERTY], "3");

        w.write_at(at(2, 1), &id.headers, &id.column_types, &rows(1)).unwrap();
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0200.v2.tsv"));
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(3, 0));
        w.write_at(at(3, 0), &id.headers, &id.column_types, &rows(1)).unwrap();

        w.close().unwrap();
        w.close().unwrap();
        assert_eq!(w.state(), WriterState::Closed);
        assert!(matches!(
            w.write_at(at(3, 0), &id.headers, &id.column_types, &rows(1)),
            Err(Error::WriterClosed(_))
        ));
    }

    #[test]
    fn test_stray_files_removed_on_close() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(4, 0));
        w.write_at(at(4, 0), &id.headers, &id.column_types, &rows(1)).unwrap();

        let crc = dir.path().join("access/.0400.v1.tsv.crc");
        fs::write(&crc, b"stale").unwrap();
        w.close().unwrap();
        assert!(!crc.exists());
        assert!(dir.path().join("access/0400.v1.tsv").exists());
    }

    /// TSV writer that fails record writes while `broken` is set
    struct Flaky {
        inner: TsvWriter,
        broken: Arc<AtomicBool>,
    }

    impl FormatWriter for Flaky {
        fn open(&mut self, path: &Path, headers: &[String], types: &[String]) -> io::Result<()> {
            self.inner.open(path, headers, types)
        }
        fn write_record(&mut self, columns: &[String]) -> io::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(io::Error::other("disk went away"));
            }
            self.inner.write_record(columns)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
        fn close(&mut self) -> io::Result<u64> {
            self.inner.close()
        }
        fn abort(&mut self) {
            self.inner.abort();
        }
        fn extension(&self) -> &'static str {
            self.inner.extension()
        }
    }

    #[test]
    fn test_io_failure_closes_output_and_writer_recovers() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let broken = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(StorageMetrics::new());
        let mut w = RotatingWriter::new(
            id.clone(),
            settings(&dir, 20),
            Box::new(Flaky {
                inner: TsvWriter::default(),
                broken: broken.clone(),
            }),
            metrics.clone(),
            at(5, 0),
        )
        .unwrap();

        w.write_at(at(5, 0), &id.headers, &id.column_types, &rows(1)).unwrap();
        broken.store(true, Ordering::SeqCst);
        let err = w
            .write_at(at(5, 0), &id.headers, &id.column_types, &rows(1))
            .unwrap_err();
        assert!(matches!(err, Error::Writer { .. }));
        assert_eq!(w.state(), WriterState::NoFile);
        assert_eq!(metrics.write_errors.load(Ordering::Relaxed), 1);

        broken.store(false, Ordering::SeqCst);
        w.write_at(at(5, 0), &id.headers, &id.column_types, &rows(1)).unwrap();
        assert_eq!(w.current_path().unwrap(), dir.path().join("access/0500.v2.tsv"));
    }

    #[test]
    fn test_empty_write_opens_nothing() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(6, 0));
        assert_eq!(
            w.write_at(at(6, 0), &id.headers, &id.column_types, &[]).unwrap(),
            0
        );
        assert_eq!(w.state(), WriterState::NoFile);
        assert!(!dir.path().join("access").exists());
    }

    #[test]
    fn test_prepare_opens_before_any_row() {
        let dir = tempdir().unwrap();
        let id = log_id();
        let mut w = writer(&dir, 20, at(7, 0));
        assert!(w.write_prepared(&rows(1)).is_err());

        w.prepare_at(at(7, 0), &id.headers, &id.column_types).unwrap();
        assert_eq!(w.state(), WriterState::Open);
        let path = dir.path().join("access/0700.v1.tsv");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ts\tmsg\n");

        assert_eq!(w.write_prepared(&rows(2)).unwrap(), 2);
        assert!(w.write_prepared(&[strings(&["only-one"])]).is_err());
        w.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_prepare_refuses_exhausted_versions() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("access")).unwrap();
        std::fs::write(dir.path().join("access/0800.v1.tsv"), b"taken").unwrap();

        let id = log_id();
        let mut w = writer(&dir, 1, at(8, 0));
        let err = w.prepare_at(at(8, 0), &id.headers, &id.column_types).unwrap_err();
        assert!(matches!(err, Error::VersionsExhausted { .. }));
        assert_eq!(w.state(), WriterState::NoFile);
    }
}
