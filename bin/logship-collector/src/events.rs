//! Server events and metrics
//!
//! The request loop reports every outcome through an [`EventListener`].
//! The default [`LoggingListener`] logs each event and counts it in
//! [`ServerMetrics`].

use logship_common::{ClientId, StreamKey};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

/// Outcome of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Payload larger than the receive buffer; connection aborted
    BufferOverflow {
        client: ClientId,
        key: StreamKey,
        size: u32,
    },
    /// Admission control refused the write; connection aborted
    BackendUnavailable { client: ClientId, key: StreamKey },
    /// Sequence id at or below the high-water mark; acknowledged, not applied
    AlreadyWritten {
        client: ClientId,
        key: StreamKey,
        sequence_id: u64,
        last_applied: u64,
    },
    /// Payload handed to the sink
    Applied {
        client: ClientId,
        key: StreamKey,
        sequence_id: u64,
        size: u32,
    },
    /// The sink failed; connection aborted
    SinkFailed {
        client: ClientId,
        key: StreamKey,
        reason: String,
    },
}

/// Receiver of server events
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

/// Server counters
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub frames_applied: AtomicU64,
    pub bytes_applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub backend_unavailable: AtomicU64,
    pub sink_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl ServerMetrics {
    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self, node: &str) -> String {
        let mut output = String::with_capacity(2 * 1024);

        let _ = writeln!(
            output,
            "# HELP logship_collector_requests_total Requests by outcome"
        );
        let _ = writeln!(output, "# TYPE logship_collector_requests_total counter");
        let outcomes = [
            ("applied", &self.frames_applied),
            ("duplicate", &self.duplicates),
            ("buffer_overflow", &self.buffer_overflows),
            ("backend_unavailable", &self.backend_unavailable),
            ("sink_failed", &self.sink_failures),
            ("protocol_error", &self.protocol_errors),
        ];
        for (outcome, value) in outcomes {
            let _ = writeln!(
                output,
                "logship_collector_requests_total{{node=\"{node}\",outcome=\"{outcome}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(output, "# HELP logship_collector_bytes_applied_total Payload bytes applied");
        let _ = writeln!(output, "# TYPE logship_collector_bytes_applied_total counter");
        let _ = writeln!(
            output,
            "logship_collector_bytes_applied_total{{node=\"{node}\"}} {}",
            self.bytes_applied.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP logship_collector_connections_total Connections accepted");
        let _ = writeln!(output, "# TYPE logship_collector_connections_total counter");
        let _ = writeln!(
            output,
            "logship_collector_connections_total{{node=\"{node}\"}} {}",
            self.connections_accepted.load(Ordering::Relaxed)
        );

        let _ = writeln!(output, "# HELP logship_collector_connections_active Open connections");
        let _ = writeln!(output, "# TYPE logship_collector_connections_active gauge");
        let _ = writeln!(
            output,
            "logship_collector_connections_active{{node=\"{node}\"}} {}",
            self.connections_active.load(Ordering::Relaxed)
        );

        output
    }
}

/// Default listener: log and count
pub struct LoggingListener {
    metrics: Arc<ServerMetrics>,
}

impl LoggingListener {
    pub const fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self { metrics }
    }
}

impl EventListener for LoggingListener {
    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::BufferOverflow { client, key, size } => {
                self.metrics.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                error!("{client} sent {size} bytes for {key}, above the receive buffer; aborting connection");
            }
            ServerEvent::BackendUnavailable { client, key } => {
                self.metrics
                    .backend_unavailable
                    .fetch_add(1, Ordering::Relaxed);
                error!("Backend unavailable, refusing {client} write for {key}");
            }
            ServerEvent::AlreadyWritten {
                client,
                key,
                sequence_id,
                last_applied,
            } => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{client} resent sequence {sequence_id} for {key} (last applied {last_applied}); already written"
                );
            }
            ServerEvent::Applied {
                client,
                key,
                sequence_id,
                size,
            } => {
                self.metrics.frames_applied.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .bytes_applied
                    .fetch_add(u64::from(*size), Ordering::Relaxed);
                debug!("Applied sequence {sequence_id} ({size} bytes) from {client} for {key}");
            }
            ServerEvent::SinkFailed {
                client,
                key,
                reason,
            } => {
                self.metrics.sink_failures.fetch_add(1, Ordering::Relaxed);
                error!("Write of {key} from {client} failed: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_listener_counts() {
        let metrics = Arc::new(ServerMetrics::default());
        let listener = LoggingListener::new(metrics.clone());
        let client = ClientId::new(3);
        let key = StreamKey::new("web", "access", "h", 0, 1).unwrap();

        listener.on_event(&ServerEvent::Applied {
            client,
            key: key.clone(),
            sequence_id: 1,
            size: 100,
        });
        listener.on_event(&ServerEvent::AlreadyWritten {
            client,
            key: key.clone(),
            sequence_id: 1,
            last_applied: 1,
        });
        listener.on_event(&ServerEvent::BufferOverflow {
            client,
            key,
            size: 1 << 30,
        });

        let text = metrics.export_prometheus("n1");
        assert!(text.contains("outcome=\"applied\"} 1"));
        assert!(text.contains("outcome=\"duplicate\"} 1"));
        assert!(text.contains("outcome=\"buffer_overflow\"} 1"));
        assert!(text.contains("logship_collector_bytes_applied_total{node=\"n1\"} 100"));
    }
}
