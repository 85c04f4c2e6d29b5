//! Configuration types for Logship
//!
//! This module defines configuration structures used across components. Every
//! section deserializes with defaults so a partial TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for Logship
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Shipping client configuration
    pub client: ClientConfig,
    /// Receiving server configuration
    pub server: ServerConfig,
    /// Disk materialization configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Data directory for local state
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "logship-node".to_string(),
            data_dir: PathBuf::from("/var/lib/logship"),
        }
    }
}

/// Shipping client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Collector address
    pub server_addr: String,
    /// Identity byte sent in the handshake
    pub client_id: u8,
    /// Capacity of each per-stream buffer (bytes)
    pub buffer_capacity: usize,
    /// Delay between send ticks (milliseconds)
    pub send_interval_ms: u64,
    /// Socket read/write timeout (milliseconds)
    pub io_timeout_ms: u64,
    /// Ready-queue length at which the client reports itself degraded
    pub ready_queue_threshold: usize,
    /// Snapshot file for crash recovery
    pub state_file: PathBuf,
}

impl ClientConfig {
    #[must_use]
    pub const fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7070".to_string(),
            client_id: 0,
            buffer_capacity: 1024 * 1024, // 1 MB
            send_interval_ms: 1000,
            io_timeout_ms: 10_000,
            ready_queue_threshold: 1024,
            state_file: PathBuf::from("/var/lib/logship/client.state"),
        }
    }
}

/// Receiving server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Largest payload accepted in one frame (bytes)
    pub max_buffer_size: u32,
    /// Connection handler pool size
    pub max_connections: usize,
    /// Idle read timeout before a connection is closed (milliseconds)
    pub io_timeout_ms: u64,
    /// Dedup high-water mark database
    pub dedup_path: PathBuf,
    /// Metrics/health HTTP port (0 disables)
    pub metrics_port: u16,
}

impl ServerConfig {
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7070".to_string(),
            max_buffer_size: 4 * 1024 * 1024, // 4 MB
            max_connections: 64,
            io_timeout_ms: 60_000,
            dedup_path: PathBuf::from("/var/lib/logship/dedup.redb"),
            metrics_port: 9470,
        }
    }
}

/// Output encoding of rotated files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Tab-separated text with a header line
    #[default]
    Tsv,
    /// One JSON object per record
    Jsonl,
}

impl FormatKind {
    /// File extension appended to rendered names
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Tsv => "tsv",
            Self::Jsonl => "jsonl",
        }
    }
}

/// Per-log-type naming/format override
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogTypeOverride {
    /// Log type the override applies to
    pub log_type: String,
    /// Naming template (falls back to the default template)
    #[serde(default)]
    pub file_pattern: Option<String>,
    /// Output format (falls back to the default format)
    #[serde(default)]
    pub format: Option<FormatKind>,
}

/// Disk materialization configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of rotated files
    pub root_dir: PathBuf,
    /// Default naming template
    pub file_pattern: String,
    /// Number of time buckets per hour (must divide 60)
    pub buckets_per_hour: u32,
    /// Maximum file versions within one bucket
    pub max_versions: u32,
    /// Minimum usable free space on the target volume (bytes)
    pub min_free_bytes: u64,
    /// Delay between writer refresh passes (milliseconds)
    pub refresh_interval_ms: u64,
    /// Default output format
    pub default_format: FormatKind,
    /// Per-log-type overrides
    pub overrides: Vec<LogTypeOverride>,
}

impl StorageConfig {
    /// Length of one time bucket
    #[must_use]
    pub fn bucket_interval(&self) -> Duration {
        Duration::from_secs(u64::from(60 / self.buckets_per_hour.max(1)) * 60)
    }

    /// Inactivity TTL of a cached writer: three full rotation intervals
    #[must_use]
    pub fn writer_ttl(&self) -> Duration {
        self.bucket_interval() * 3
    }

    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Override for a log type, if configured
    #[must_use]
    pub fn override_for(&self, log_type: &str) -> Option<&LogTypeOverride> {
        self.overrides.iter().find(|o| o.log_type == log_type)
    }

    /// Naming template used for a log type
    #[must_use]
    pub fn pattern_for(&self, log_type: &str) -> &str {
        self.override_for(log_type)
            .and_then(|o| o.file_pattern.as_deref())
            .unwrap_or(&self.file_pattern)
    }

    /// Output format used for a log type
    #[must_use]
    pub fn format_for(&self, log_type: &str) -> FormatKind {
        self.override_for(log_type)
            .and_then(|o| o.format)
            .unwrap_or(self.default_format)
    }

    /// Every distinct naming template in use
    #[must_use]
    pub fn all_patterns(&self) -> Vec<&str> {
        let mut patterns = vec![self.file_pattern.as_str()];
        for pattern in self.overrides.iter().filter_map(|o| o.file_pattern.as_deref()) {
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        patterns
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/logship/data"),
            file_pattern: "{log_type}/{yyyy}/{MM}/{dd}/{HH}{mm}-{host}.v{version}".to_string(),
            buckets_per_hour: 12,
            max_versions: 20,
            min_free_bytes: 1024 * 1024 * 1024, // 1 GB
            refresh_interval_ms: 30_000,
            default_format: FormatKind::Tsv,
            overrides: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "logship-node");
        assert_eq!(config.storage.buckets_per_hour, 12);
        assert_eq!(config.server.max_buffer_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_writer_ttl_is_three_buckets() {
        let storage = StorageConfig {
            buckets_per_hour: 12,
            ..StorageConfig::default()
        };
        assert_eq!(storage.bucket_interval(), Duration::from_secs(300));
        assert_eq!(storage.writer_ttl(), Duration::from_secs(900));

        let hourly = StorageConfig {
            buckets_per_hour: 1,
            ..StorageConfig::default()
        };
        assert_eq!(hourly.writer_ttl(), Duration::from_secs(3 * 3600));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            buckets_per_hour = 4
            default_format = "jsonl"

            [[storage.overrides]]
            log_type = "audit"
            format = "tsv"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.buckets_per_hour, 4);
        assert_eq!(config.storage.default_format, FormatKind::Jsonl);
        assert_eq!(config.storage.format_for("audit"), FormatKind::Tsv);
        assert_eq!(config.client.client_id, 0);
    }

    #[test]
    fn test_overrides() {
        let storage = StorageConfig {
            overrides: vec![LogTypeOverride {
                log_type: "audit".into(),
                file_pattern: Some("audit/{yyyy}{MM}{dd}{HH}{mm}.{version}".into()),
                format: Some(FormatKind::Jsonl),
            }],
            ..StorageConfig::default()
        };
        assert_eq!(storage.format_for("audit"), FormatKind::Jsonl);
        assert_eq!(storage.format_for("access"), FormatKind::Tsv);
        assert_eq!(storage.pattern_for("access"), storage.file_pattern);
        assert_eq!(storage.all_patterns().len(), 2);
    }
}
