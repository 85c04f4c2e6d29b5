//! Record blocks carried inside frame payloads
//!
//! A payload is a concatenation of self-describing blocks, so client buffers
//! can append blocks back to back and the collector can split them again:
//!
//! ```text
//! +-------+---------+--------+-------+-------+------+-----+
//! | Magic | NumCols | Header | Types | NRows | Rows | ... |
//! | 1B    | 2B      | str*n  | str*n | 4B    |      |     |
//! +-------+---------+--------+-------+-------+------+-----+
//! ```
//!
//! Header and type names are `u16`-prefixed; row cells are `u32`-prefixed.

use bytes::{Buf, BufMut, BytesMut};
use logship_common::{Error, Result};

/// Marks the start of every block
const BLOCK_MAGIC: u8 = 0xB7;

/// Rows sharing one schema
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordBlock {
    /// Ordered column names
    pub headers: Vec<String>,
    /// Ordered column type tags
    pub column_types: Vec<String>,
    /// Rows, each with exactly one cell per header
    pub rows: Vec<Vec<String>>,
}

impl RecordBlock {
    /// Create an empty block for a schema
    pub fn new(headers: Vec<String>, column_types: Vec<String>) -> Result<Self> {
        if headers.len() != column_types.len() {
            return Err(Error::protocol(format!(
                "{} headers but {} column types",
                headers.len(),
                column_types.len()
            )));
        }
        if headers.len() > u16::MAX as usize {
            return Err(Error::protocol(format!("{} columns", headers.len())));
        }
        Ok(Self {
            headers,
            column_types,
            rows: Vec::new(),
        })
    }

    /// Append a row
    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.headers.len() {
            return Err(Error::protocol(format!(
                "row has {} cells, schema has {} columns",
                row.len(),
                self.headers.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Size of [`Self::encode`]'s output
    pub fn encoded_len(&self) -> usize {
        let names: usize = self
            .headers
            .iter()
            .chain(&self.column_types)
            .map(|name| 2 + name.len())
            .sum();
        let rows: usize = self.rows.iter().map(|row| Self::row_encoded_len(row)).sum();
        1 + 2 + names + 4 + rows
    }

    /// Bytes one row adds to an encoded block
    pub fn row_encoded_len(row: &[String]) -> usize {
        row.iter().map(|cell| 4 + cell.len()).sum()
    }

    /// Serialize the block
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(BLOCK_MAGIC);
        let columns = u16::try_from(self.headers.len())
            .map_err(|_| Error::protocol(format!("{} columns", self.headers.len())))?;
        buf.put_u16(columns);
        for name in self.headers.iter().chain(&self.column_types) {
            let len = u16::try_from(name.len())
                .map_err(|_| Error::protocol(format!("column name of {} bytes", name.len())))?;
            buf.put_u16(len);
            buf.put_slice(name.as_bytes());
        }
        let rows = u32::try_from(self.rows.len())
            .map_err(|_| Error::protocol(format!("{} rows", self.rows.len())))?;
        buf.put_u32(rows);
        for row in &self.rows {
            for cell in row {
                let len = u32::try_from(cell.len())
                    .map_err(|_| Error::protocol(format!("cell of {} bytes", cell.len())))?;
                buf.put_u32(len);
                buf.put_slice(cell.as_bytes());
            }
        }
        Ok(buf.to_vec())
    }

    /// Split a payload into its blocks
    pub fn decode_all(mut payload: &[u8]) -> Result<Vec<Self>> {
        let mut blocks = Vec::new();
        while payload.has_remaining() {
            blocks.push(Self::decode_one(&mut payload)?);
        }
        Ok(blocks)
    }

    fn decode_one(buf: &mut &[u8]) -> Result<Self> {
        need(buf, 3)?;
        let magic = buf.get_u8();
        if magic != BLOCK_MAGIC {
            return Err(Error::protocol(format!("bad block magic: {magic:#x}")));
        }
        let columns = buf.get_u16() as usize;

        let mut headers = Vec::with_capacity(columns);
        for _ in 0..columns {
            headers.push(get_str(buf, 2)?);
        }
        let mut column_types = Vec::with_capacity(columns);
        for _ in 0..columns {
            column_types.push(get_str(buf, 2)?);
        }

        need(buf, 4)?;
        let row_count = buf.get_u32() as usize;
        let mut rows = Vec::with_capacity(row_count.min(4096));
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(columns);
            for _ in 0..columns {
                row.push(get_str(buf, 4)?);
            }
            rows.push(row);
        }

        Ok(Self {
            headers,
            column_types,
            rows,
        })
    }
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::protocol("record block truncated"));
    }
    Ok(())
}

fn get_str(buf: &mut &[u8], prefix: usize) -> Result<String> {
    need(buf, prefix)?;
    let len = if prefix == 2 {
        buf.get_u16() as usize
    } else {
        buf.get_u32() as usize
    };
    need(buf, len)?;
    let value = String::from_utf8(buf[..len].to_vec())
        .map_err(|e| Error::protocol(format!("invalid UTF-8 in record block: {e}")))?;
    buf.advance(len);
    Ok(value)
}
