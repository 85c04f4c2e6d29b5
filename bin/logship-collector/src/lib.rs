//! Logship Collector - receiving side of the shipping pipeline
//!
//! The collector accepts framed payloads from shipping clients, drops
//! replays using persisted per-stream high-water marks and materializes
//! accepted record blocks into rotated files.

pub mod dedup;
pub mod events;
pub mod server;
pub mod sink;

pub use dedup::{DedupKey, DedupOutcome, DedupStore};
pub use events::{EventListener, LoggingListener, ServerEvent, ServerMetrics};
pub use server::{ServerSettings, WireProtocolServer};
pub use sink::{DiskSink, Sink};
