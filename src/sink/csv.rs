//! CSV file sink.
//!
//! One row per message, comma-and-space separated, after a header line:
//!
//! ```text
//! id, name, data, timestamp
//! 0, Load, 2.5, 2024-05-01_12:00:00:000001
//! ```

use super::Sink;
use crate::error::{Result, ResultExt};
use crate::message::{Message, Payload};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str = "id, name, data, timestamp";

/// Appends rows to a CSV file, truncating it on open.
pub struct CsvSink {
    writer: BufWriter<File>,
    path: PathBuf,
    rows_written: u64,
}

impl CsvSink {
    /// Create (or truncate) `path` and write the header
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).with_context(|| format!("create CSV file {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER)?;
        tracing::info!("CSV sink writing to {:?}", path);

        Ok(Self {
            writer,
            path,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

/// Quote a field if it would break the row layout
fn field(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\"")).into()
    } else {
        value.into()
    }
}

impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        let data = match message.payload() {
            Payload::Reading(v) => v.to_string(),
            Payload::EndOfStream => String::new(),
        };
        writeln!(
            self.writer,
            "{}, {}, {}, {}",
            message.id(),
            field(message.name()),
            data,
            field(message.timestamp())
        )?;
        self.rows_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flush CSV file")
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush {:?} on close: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.append(&Message::reading(0, "Load", 2.5, "T1")).unwrap();
        sink.append(&Message::reading(1, "Disk, root", -1.0, "T2")).unwrap();
        assert_eq!(sink.rows_written(), 2);
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, [CSV_HEADER, "0, Load, 2.5, T1", "1, \"Disk, root\", -1, T2"]);
    }

    #[test]
    fn test_flush_makes_rows_visible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        sink.append(&Message::reading(3, "Temp", 21.5, "T")).unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("3, Temp, 21.5, T\n"));
    }
}
