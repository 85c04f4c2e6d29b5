//! On-disk snapshot of the client buffer store
//!
//! The snapshot is written once at shutdown and read once at startup.
//!
//! ```text
//! +--------+---------+---------+---------+-----------+--------+
//! | Magic  | Version | Current | Ready   | Sequences | CRC32C |
//! | 4B     | 4B      | section | section | section   | 4B     |
//! +--------+---------+---------+---------+-----------+--------+
//! ```
//!
//! Each section is a `u32` count followed by entries. A buffer entry is a
//! stream key (five fields) plus a `u32`-prefixed byte string; a sequence
//! entry is a stream key plus the last acknowledged `u64` sequence id. All
//! integers are little-endian; the CRC covers every preceding byte.

use bytes::Bytes;
use logship_common::checksum::crc32c;
use logship_common::{Error, Result, StreamKey};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Snapshot file magic number
const SNAPSHOT_MAGIC: u32 = 0x4C53_534E; // "LSSN"

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Complete persisted client state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Contents of the live per-stream buffers
    pub current: Vec<(StreamKey, Bytes)>,
    /// Ready queue, oldest first
    pub ready: Vec<(StreamKey, Bytes)>,
    /// Last acknowledged sequence id per stream
    pub sequences: Vec<(StreamKey, u64)>,
}

impl Snapshot {
    /// Serialize to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());

        for section in [&self.current, &self.ready] {
            put_len(&mut buf, section.len())?;
            for (key, data) in section {
                put_key(&mut buf, key)?;
                put_len(&mut buf, data.len())?;
                buf.extend_from_slice(data);
            }
        }

        put_len(&mut buf, self.sequences.len())?;
        for (key, sequence) in &self.sequences {
            put_key(&mut buf, key)?;
            buf.extend_from_slice(&sequence.to_le_bytes());
        }

        let checksum = crc32c(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Deserialize from bytes, verifying magic, version and checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::SnapshotCorrupt("file too small".into()));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32c(body);
        if stored != computed {
            return Err(Error::SnapshotCorrupt(format!(
                "checksum mismatch: computed={computed:08x}, stored={stored:08x}"
            )));
        }

        let mut reader = body;
        let magic = read_u32(&mut reader)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::SnapshotCorrupt(format!("invalid magic {magic:#x}")));
        }
        let version = read_u32(&mut reader)?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotCorrupt(format!(
                "unsupported version: {version}"
            )));
        }

        let current = read_buffers(&mut reader)?;
        let ready = read_buffers(&mut reader)?;

        let count = read_u32(&mut reader)? as usize;
        let mut sequences = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = read_key(&mut reader)?;
            let sequence = read_u64(&mut reader)?;
            sequences.push((key, sequence));
        }

        if !reader.is_empty() {
            return Err(Error::SnapshotCorrupt(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }

        Ok(Self {
            current,
            ready,
            sequences,
        })
    }

    /// Write the snapshot atomically (temp file + rename)
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.encode()?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a snapshot; `Ok(None)` when no file exists
    pub fn read_from(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(&data).map(Some)
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| Error::Serialization(format!("length {len} exceeds u32")))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Serialization(format!("field of {} bytes", value.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_key(buf: &mut Vec<u8>, key: &StreamKey) -> Result<()> {
    put_str(buf, &key.stream_name)?;
    put_str(buf, &key.stream_type)?;
    put_str(buf, &key.client_hostname)?;
    buf.extend_from_slice(&key.shard.to_le_bytes());
    buf.extend_from_slice(&key.version.to_le_bytes());
    Ok(())
}

fn read_exact<const N: usize>(reader: &mut &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    reader
        .read_exact(&mut out)
        .map_err(|e| Error::SnapshotCorrupt(e.to_string()))?;
    Ok(out)
}

fn read_u32(reader: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(read_exact(reader)?))
}

fn read_u64(reader: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_le_bytes(read_exact(reader)?))
}

fn read_bytes(reader: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if reader.len() < len {
        return Err(Error::SnapshotCorrupt("entry truncated".into()));
    }
    let (head, tail) = reader.split_at(len);
    *reader = tail;
    Ok(head.to_vec())
}

fn read_str(reader: &mut &[u8]) -> Result<String> {
    let len = u16::from_le_bytes(read_exact(reader)?) as usize;
    String::from_utf8(read_bytes(reader, len)?)
        .map_err(|e| Error::SnapshotCorrupt(format!("invalid stream key: {e}")))
}

fn read_key(reader: &mut &[u8]) -> Result<StreamKey> {
    Ok(StreamKey {
        stream_name: read_str(reader)?,
        stream_type: read_str(reader)?,
        client_hostname: read_str(reader)?,
        shard: i32::from_le_bytes(read_exact(reader)?),
        version: i32::from_le_bytes(read_exact(reader)?),
    })
}

fn read_buffers(reader: &mut &[u8]) -> Result<Vec<(StreamKey, Bytes)>> {
    let count = read_u32(reader)? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = read_key(reader)?;
        let len = read_u32(reader)? as usize;
        entries.push((key, Bytes::from(read_bytes(reader, len)?)));
    }
    Ok(entries)
}
