//! Destination of accepted payloads

use chrono::Utc;
use logship_common::{Availability, LogId, Result, StreamKey};
use logship_proto::RecordBlock;
use logship_storage::{FreeSpaceMonitor, StreamWriterCache};
use std::sync::Arc;

/// Where the server applies accepted payloads
pub trait Sink: Send + Sync {
    /// Whether the sink currently accepts writes
    fn availability(&self) -> Availability;

    /// Apply one payload; returns the number of rows written
    fn apply(&self, key: &StreamKey, payload: &[u8]) -> Result<usize>;
}

/// Sink writing record blocks to rotated files
pub struct DiskSink {
    cache: Arc<StreamWriterCache>,
    space: FreeSpaceMonitor,
}

impl DiskSink {
    pub fn new(cache: Arc<StreamWriterCache>) -> Self {
        let storage = cache.config();
        let space = FreeSpaceMonitor::new(storage.root_dir.clone(), storage.min_free_bytes);
        Self { cache, space }
    }

    /// Server-side identity of a block received for `key`
    pub fn log_id(&self, key: &StreamKey, block: &RecordBlock) -> LogId {
        LogId {
            file_prefix_pattern: self.cache.config().pattern_for(&key.stream_type).to_string(),
            log_type: key.stream_type.clone(),
            client_hostname: key.client_hostname.clone(),
            properties: key.properties(),
            headers: block.headers.clone(),
            column_types: block.column_types.clone(),
        }
    }
}

impl Sink for DiskSink {
    fn availability(&self) -> Availability {
        self.space.availability_report()
    }

    /// Decode the payload and write all of its blocks as one batch
    ///
    /// A payload that is refused (malformed, version exhaustion, closed
    /// writer) writes nothing, so the client can retry it under the same
    /// sequence id without duplicating rows.
    fn apply(&self, key: &StreamKey, payload: &[u8]) -> Result<usize> {
        let blocks = RecordBlock::decode_all(payload)?;
        let batch: Vec<(LogId, &[Vec<String>])> = blocks
            .iter()
            .map(|block| (self.log_id(key, block), block.rows.as_slice()))
            .collect();
        self.cache.write_batch_at(&batch, Utc::now())
    }
}
