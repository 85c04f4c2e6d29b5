//! Logship Storage - time-partitioned disk materialization
//!
//! This crate turns decoded record blocks into rotated files:
//! - Naming templates with time bucket and version placeholders
//! - Pluggable output formats (TSV, JSON lines)
//! - Rotating writers with sidecar metadata
//! - A TTL cache of writers with a background refresh task
//! - Free-space admission control

pub mod cache;
pub mod format;
pub mod metrics;
pub mod pattern;
pub mod sidecar;
pub mod space;
pub mod writer;

pub use cache::StreamWriterCache;
pub use format::{FormatWriter, JsonlWriter, TsvWriter, writer_for};
pub use metrics::StorageMetrics;
pub use pattern::{NameFields, NamingTemplate};
pub use sidecar::Sidecar;
pub use space::{FreeSpaceMonitor, usable_bytes};
pub use writer::{RotatingWriter, WriterSettings, WriterState};

use chrono::{DateTime, Utc};
use logship_common::Result;
use logship_common::config::StorageConfig;

/// Validate every naming template of a storage configuration
pub fn validate_templates(config: &StorageConfig, now: DateTime<Utc>) -> Result<()> {
    for pattern in config.all_patterns() {
        NamingTemplate::parse(pattern, config.bucket_interval())?.validate(now)?;
    }
    Ok(())
}
