//! Output encodings for rotated files
//!
//! A [`FormatWriter`] owns the bytes of one open file at a time. The rotating
//! writer decides which file; the format writer decides how rows look.

use logship_common::config::FormatKind;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Encoder for one output file at a time
pub trait FormatWriter: Send {
    /// Create `path` (which must not exist) and write any preamble
    fn open(&mut self, path: &Path, headers: &[String], column_types: &[String]) -> io::Result<()>;

    /// Append one record
    fn write_record(&mut self, columns: &[String]) -> io::Result<()>;

    /// Push buffered bytes to the file
    fn flush(&mut self) -> io::Result<()>;

    /// Flush, sync and close; returns the bytes written since `open`
    fn close(&mut self) -> io::Result<u64>;

    /// Drop the open file without flushing (after an I/O failure)
    fn abort(&mut self);

    /// Extension appended to rendered file names
    fn extension(&self) -> &'static str;
}

/// Build the writer for a configured format
pub fn writer_for(kind: FormatKind) -> Box<dyn FormatWriter> {
    match kind {
        FormatKind::Tsv => Box::new(TsvWriter::default()),
        FormatKind::Jsonl => Box::new(JsonlWriter::default()),
    }
}

fn create_new(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(BufWriter::with_capacity(64 * 1024, file))
}

fn finish(out: Option<BufWriter<File>>) -> io::Result<()> {
    if let Some(out) = out {
        let file = out.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Tab-separated text with a header line
///
/// Tabs, line breaks and backslashes inside cells are escaped as `\t`, `\n`,
/// `\r` and `\\`.
#[derive(Default)]
pub struct TsvWriter {
    out: Option<BufWriter<File>>,
    bytes: u64,
}

impl TsvWriter {
    fn write_line(&mut self, cells: &[String]) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::other("tsv writer is not open"))?;
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            escape_tsv(cell, &mut line);
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
        self.bytes += line.len() as u64;
        Ok(())
    }
}

fn escape_tsv(cell: &str, out: &mut String) {
    for c in cell.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
}

impl FormatWriter for TsvWriter {
    fn open(&mut self, path: &Path, headers: &[String], _column_types: &[String]) -> io::Result<()> {
        self.out = Some(create_new(path)?);
        self.bytes = 0;
        self.write_line(headers)
    }

    fn write_record(&mut self, columns: &[String]) -> io::Result<()> {
        self.write_line(columns)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<u64> {
        finish(self.out.take())?;
        Ok(self.bytes)
    }

    fn abort(&mut self) {
        self.out = None;
    }

    fn extension(&self) -> &'static str {
        FormatKind::Tsv.extension()
    }
}

/// One JSON object per line, keyed by header
#[derive(Default)]
pub struct JsonlWriter {
    out: Option<BufWriter<File>>,
    headers: Vec<String>,
    bytes: u64,
}

impl FormatWriter for JsonlWriter {
    fn open(&mut self, path: &Path, headers: &[String], _column_types: &[String]) -> io::Result<()> {
        self.out = Some(create_new(path)?);
        self.headers = headers.to_vec();
        self.bytes = 0;
        Ok(())
    }

    fn write_record(&mut self, columns: &[String]) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::other("jsonl writer is not open"))?;
        let object: Map<String, Value> = self
            .headers
            .iter()
            .zip(columns)
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        let mut line = serde_json::to_vec(&object)?;
        line.push(b'\n');
        out.write_all(&line)?;
        self.bytes += line.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<u64> {
        finish(self.out.take())?;
        Ok(self.bytes)
    }

    fn abort(&mut self) {
        self.out = None;
    }

    fn extension(&self) -> &'static str {
        FormatKind::Jsonl.extension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_tsv_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.tsv");
        let mut writer = writer_for(FormatKind::Tsv);

        writer
            .open(&path, &strings(&["ts", "msg"]), &strings(&["long", "string"]))
            .unwrap();
        writer.write_record(&strings(&["1", "tab\there"])).unwrap();
        writer.write_record(&strings(&["2", "line\nbreak"])).unwrap();
        let bytes = writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "ts\tmsg\n1\ttab\\there\n2\tline\\nbreak\n");
        assert_eq!(bytes, text.len() as u64);
    }

    #[test]
    fn test_jsonl_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut writer = writer_for(FormatKind::Jsonl);
        assert_eq!(writer.extension(), "jsonl");

        writer
            .open(&path, &strings(&["ts", "msg"]), &strings(&["long", "string"]))
            .unwrap();
        writer.write_record(&strings(&["1", "hello \"world\""])).unwrap();
        writer.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["ts"], "1");
        assert_eq!(value["msg"], "hello \"world\"");
    }

    #[test]
    fn test_open_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taken.tsv");
        std::fs::write(&path, b"already here").unwrap();

        let mut writer = writer_for(FormatKind::Tsv);
        let err = writer.open(&path, &strings(&["a"]), &strings(&["string"])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(writer.write_record(&strings(&["x"])).is_err());
    }
}
