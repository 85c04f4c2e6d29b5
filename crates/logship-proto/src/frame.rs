//! Wire frames between shipping clients and the collector
//!
//! Every integer is big-endian. A connection starts with a one-byte client
//! identity, then carries any number of request/ack exchanges:
//!
//! ```text
//! request:  +-------+------+--------+--------+--------+-------+---------+---------+
//!           | SeqId | Size | Stream | Type   | Host   | Shard | Version | Payload |
//!           | 8B    | 4B   | str    | str    | str    | 4B    | 4B      | Size B  |
//!           +-------+------+--------+--------+--------+-------+---------+---------+
//! ack:      +-------+
//!           | i32   |   > 0 bytes accepted, < 0 error code
//!           +-------+
//! ```
//!
//! Strings are a `u16` length followed by UTF-8 bytes.

use bytes::{BufMut, Bytes, BytesMut};
use logship_common::{Ack, ClientId, Error, Result, StreamKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed portion of a request header (sequence id + size + shard + version)
const FIXED_HEADER_SIZE: usize = 8 + 4 + 4 + 4;

/// Request header: everything before the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Per-(client, stream) sequence id
    pub sequence_id: u64,
    /// Payload length in bytes
    pub size: u32,
    /// Stream the payload belongs to
    pub key: StreamKey,
}

/// A complete request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub sequence_id: u64,
    pub key: StreamKey,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(sequence_id: u64, key: StreamKey, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            key,
            payload: payload.into(),
        }
    }

    /// Header describing this frame
    pub fn header(&self) -> Result<FrameHeader> {
        let size = u32::try_from(self.payload.len())
            .map_err(|_| Error::protocol(format!("payload of {} bytes", self.payload.len())))?;
        Ok(FrameHeader {
            sequence_id: self.sequence_id,
            size,
            key: self.key.clone(),
        })
    }

    /// Serialize the whole frame into one buffer
    pub fn encode(&self) -> Result<BytesMut> {
        let header = self.header()?;
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_SIZE
                + 6
                + self.key.stream_name.len()
                + self.key.stream_type.len()
                + self.key.client_hostname.len()
                + self.payload.len(),
        );
        buf.put_u64(header.sequence_id);
        buf.put_u32(header.size);
        put_str(&mut buf, &self.key.stream_name)?;
        put_str(&mut buf, &self.key.stream_type)?;
        put_str(&mut buf, &self.key.client_hostname)?;
        buf.put_i32(self.key.shard);
        buf.put_i32(self.key.version);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Write the frame in a single `write_all`
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::protocol(format!("string field of {} bytes", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

async fn read_str<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u16().await? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes).map_err(|e| Error::protocol(format!("invalid UTF-8 field: {e}")))
}

/// Read a request header
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<FrameHeader>> {
    let mut seq = [0u8; 8];
    let n = reader.read(&mut seq).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut seq[n..]).await?;
    let sequence_id = u64::from_be_bytes(seq);

    let size = reader.read_u32().await?;
    let stream_name = read_str(reader).await?;
    let stream_type = read_str(reader).await?;
    let client_hostname = read_str(reader).await?;
    let shard = reader.read_i32().await?;
    let version = reader.read_i32().await?;

    Ok(Some(FrameHeader {
        sequence_id,
        size,
        key: StreamKey {
            stream_name,
            stream_type,
            client_hostname,
            shard,
            version,
        },
    }))
}

/// Read exactly `size` payload bytes
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, size: u32) -> Result<Bytes> {
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Write an acknowledgement
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, ack: Ack) -> Result<()> {
    writer.write_i32(ack.to_wire()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an acknowledgement
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Ack> {
    Ok(Ack::from_wire(reader.read_i32().await?))
}

/// Send the client identity byte
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, client: ClientId) -> Result<()> {
    writer.write_u8(client.as_u8()).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive the client identity byte
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ClientId> {
    Ok(ClientId::new(reader.read_u8().await?))
}
