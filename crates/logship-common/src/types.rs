//! Core type definitions for Logship
//!
//! This module defines the identities that flow through the whole pipeline:
//! stream keys on the client and on the wire, log identities on the server,
//! acknowledgement codes and the two-state availability signal.

use crate::checksum::SchemaHasher;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum encoded length of any string field carried on the wire
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// One-byte identity a client announces during the handshake
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into, Display,
)]
#[display("client-{_0}")]
pub struct ClientId(u8);

impl ClientId {
    /// Create a client id from its wire byte
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Get the wire byte
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// Identity of one logical output stream
///
/// Two records with equal keys always end up in the same rotated file
/// lineage. The key travels on the wire as its individual fields.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Logical stream name
    pub stream_name: String,
    /// Record type written to the stream
    pub stream_type: String,
    /// Host the records originate from
    pub client_hostname: String,
    /// Shard of the stream
    pub shard: i32,
    /// Version of the stream's record layout
    pub version: i32,
}

impl StreamKey {
    /// Create a new stream key (validates field lengths)
    pub fn new(
        stream_name: impl Into<String>,
        stream_type: impl Into<String>,
        client_hostname: impl Into<String>,
        shard: i32,
        version: i32,
    ) -> Result<Self, StreamKeyError> {
        let key = Self {
            stream_name: stream_name.into(),
            stream_type: stream_type.into(),
            client_hostname: client_hostname.into(),
            shard,
            version,
        };
        key.validate()?;
        Ok(key)
    }

    /// Validate the key fields
    pub fn validate(&self) -> Result<(), StreamKeyError> {
        if self.stream_name.is_empty() {
            return Err(StreamKeyError::EmptyName);
        }
        if self.stream_type.is_empty() {
            return Err(StreamKeyError::EmptyType);
        }
        for field in [&self.stream_name, &self.stream_type, &self.client_hostname] {
            if field.len() > MAX_FIELD_LEN {
                return Err(StreamKeyError::FieldTooLong(field.len()));
            }
        }
        Ok(())
    }

    /// Properties contributed by the key to the server-side log identity
    #[must_use]
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("stream".to_string(), self.stream_name.clone());
        props.insert("shard".to_string(), self.shard.to_string());
        props.insert("stream_version".to_string(), self.version.to_string());
        props
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.stream_name, self.stream_type, self.client_hostname, self.shard, self.version
        )
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({self})")
    }
}

/// Errors that can occur when creating a stream key
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamKeyError {
    #[error("stream name cannot be empty")]
    EmptyName,
    #[error("stream type cannot be empty")]
    EmptyType,
    #[error("stream key field of {0} bytes exceeds the wire limit")]
    FieldTooLong(usize),
}

/// Server-side identity of a log stream
///
/// `headers` and `column_types` determine the content version of the
/// stream; everything except `client_hostname` determines cache grouping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId {
    /// Naming template for rotated files
    pub file_prefix_pattern: String,
    /// Log type (the stream type on the wire)
    pub log_type: String,
    /// Originating host
    pub client_hostname: String,
    /// Caller-supplied properties, ordered by key
    pub properties: BTreeMap<String, String>,
    /// Ordered column names
    pub headers: Vec<String>,
    /// Ordered column type tags
    pub column_types: Vec<String>,
}

impl LogId {
    /// Cache key for this identity (everything but the client hostname)
    #[must_use]
    pub fn cache_key(&self) -> LogIdKey {
        LogIdKey {
            file_prefix_pattern: self.file_prefix_pattern.clone(),
            log_type: self.log_type.clone(),
            properties: self.properties.clone(),
            headers: self.headers.clone(),
            column_types: self.column_types.clone(),
        }
    }

    /// Content hash of the ordered `(headers, column_types)` pair
    #[must_use]
    pub fn schema_hash(&self) -> u64 {
        schema_hash(&self.headers, &self.column_types)
    }

    /// Check whether two identities carry the same schema
    #[must_use]
    pub fn same_schema(&self, headers: &[String], column_types: &[String]) -> bool {
        self.headers == headers && self.column_types == column_types
    }
}

/// Hash of an ordered schema, rendered as the sidecar `VERSION` tag
#[must_use]
pub fn schema_hash(headers: &[String], column_types: &[String]) -> u64 {
    let mut hasher = SchemaHasher::new();
    hasher.update_list(headers);
    hasher.update_list(column_types);
    hasher.finish()
}

/// Cache grouping key for a [`LogId`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogIdKey {
    pub file_prefix_pattern: String,
    pub log_type: String,
    pub properties: BTreeMap<String, String>,
    pub headers: Vec<String>,
    pub column_types: Vec<String>,
}

/// Negative acknowledgement codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(i32)]
pub enum AckCode {
    /// Payload larger than the server's receive buffer
    #[display("BUFFER_OVERFLOW")]
    BufferOverflow = -1,
    /// Admission control rejected the write
    #[display("BACKEND_UNAVAILABLE")]
    BackendUnavailable = -2,
    /// Any other failure
    #[display("GENERIC")]
    Generic = -3,
}

impl AckCode {
    /// Wire value of the code
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parse a negative wire value; unknown codes map to `Generic`
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        match value {
            -1 => Self::BufferOverflow,
            -2 => Self::BackendUnavailable,
            _ => Self::Generic,
        }
    }
}

/// Decoded acknowledgement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    /// Number of bytes accepted
    Accepted(u32),
    /// The message was rejected
    Rejected(AckCode),
}

impl Ack {
    /// Decode the `i32` carried on the wire
    #[must_use]
    pub fn from_wire(value: i32) -> Self {
        u32::try_from(value).map_or_else(|_| Self::Rejected(AckCode::from_i32(value)), Self::Accepted)
    }

    /// Encode for the wire
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Accepted(size) => i32::try_from(size).unwrap_or(i32::MAX),
            Self::Rejected(code) => code.as_i32(),
        }
    }
}

/// Two-state health signal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Availability {
    #[default]
    #[display("OPERATIONAL")]
    Operational,
    #[display("FAILED")]
    Failed,
}

impl Availability {
    #[must_use]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Operational)
    }

    /// Value exported on the metrics endpoint
    #[must_use]
    pub const fn as_value(self) -> u8 {
        match self {
            Self::Operational => 1,
            Self::Failed => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_id(host: &str, headers: &[&str]) -> LogId {
        LogId {
            file_prefix_pattern: "{log_type}/{yyyy}{MM}{dd}{HH}{mm}.{version}".into(),
            log_type: "access".into(),
            client_hostname: host.into(),
            properties: BTreeMap::new(),
            headers: headers.iter().map(|h| (*h).to_string()).collect(),
            column_types: headers.iter().map(|_| "string".to_string()).collect(),
        }
    }

    #[test]
    fn test_stream_key_validation() {
        assert!(StreamKey::new("web", "access", "host-a", 0, 1).is_ok());
        assert!(matches!(
            StreamKey::new("", "access", "host-a", 0, 1),
            Err(StreamKeyError::EmptyName)
        ));
        assert!(matches!(
            StreamKey::new("web", "", "host-a", 0, 1),
            Err(StreamKeyError::EmptyType)
        ));
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new("web", "access", "host-a", 3, 2).unwrap();
        assert_eq!(key.to_string(), "web/access/host-a/3/2");
    }

    #[test]
    fn test_cache_key_ignores_hostname() {
        let a = log_id("host-a", &["ts", "msg"]);
        let b = log_id("host-b", &["ts", "msg"]);
        assert_ne!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_schema_hash_is_order_sensitive() {
        let a = log_id("h", &["ts", "msg"]);
        let b = log_id("h", &["msg", "ts"]);
        assert_ne!(a.schema_hash(), b.schema_hash());
        assert_eq!(a.schema_hash(), log_id("other", &["ts", "msg"]).schema_hash());
    }

    #[test]
    fn test_ack_wire_values() {
        assert_eq!(Ack::from_wire(42), Ack::Accepted(42));
        assert_eq!(Ack::from_wire(-1), Ack::Rejected(AckCode::BufferOverflow));
        assert_eq!(Ack::from_wire(-2), Ack::Rejected(AckCode::BackendUnavailable));
        assert_eq!(Ack::from_wire(-99), Ack::Rejected(AckCode::Generic));
        assert_eq!(Ack::Rejected(AckCode::Generic).to_wire(), -3);
    }
}
