//! Logship Protocol - wire frames and record blocks
//!
//! This crate contains the length-framed client/collector protocol and the
//! record block encoding carried inside frame payloads.

pub mod block;
pub mod frame;

pub use block::RecordBlock;
pub use frame::{
    FrameHeader, WireFrame, read_ack, read_handshake, read_header, read_payload, write_ack,
    write_handshake,
};
