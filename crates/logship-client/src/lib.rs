//! Logship client - buffering and shipping
//!
//! Records are appended to per-stream buffers in a [`ClientBufferStore`];
//! a [`WireProtocolClient`] drains the store's ready queue to a collector.
//! The store survives restarts through a checksummed snapshot file.

pub mod buffer;
pub mod sender;
pub mod snapshot;
pub mod store;

pub use buffer::StreamBuffer;
pub use sender::{ClientMetrics, SenderConfig, WireProtocolClient};
pub use snapshot::Snapshot;
pub use store::{ClientBufferStore, ReadyBuffer};
