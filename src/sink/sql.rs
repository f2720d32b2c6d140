//! SQL script sink.
//!
//! Writes a replayable SQL script: a `CREATE TABLE IF NOT EXISTS` statement
//! followed by one `INSERT` per message. The script can be fed to any SQLite
//! compatible shell.

use super::Sink;
use crate::error::{FleetError, Result, ResultExt};
use crate::message::Message;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_TABLE: &str = "readings";

/// Escape a string literal for SQL (single quotes doubled)
fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

fn validate_table(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(FleetError::Config(format!("invalid SQL table name '{}'", table)))
    }
}

/// Render one message as an INSERT statement
pub fn insert_statement(table: &str, message: &Message) -> String {
    let data = match message.data() {
        Some(v) => v.to_string(),
        None => "NULL".to_string(),
    };
    format!(
        "INSERT INTO {} (id, name, data, timestamp) VALUES ({}, '{}', {}, '{}');",
        table,
        message.id(),
        escape_sql_string(message.name()),
        data,
        escape_sql_string(message.timestamp())
    )
}

pub struct SqlSink {
    writer: BufWriter<File>,
    path: PathBuf,
    table: String,
}

impl SqlSink {
    pub fn create(path: impl AsRef<Path>, table: Option<&str>) -> Result<Self> {
        let table = table.unwrap_or(DEFAULT_TABLE).to_string();
        validate_table(&table)?;

        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).with_context(|| format!("create SQL file {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER, name TEXT, data REAL, timestamp TEXT);",
            table
        )?;
        tracing::info!("SQL sink writing table {} to {:?}", table, path);

        Ok(Self { writer, path, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for SqlSink {
    fn name(&self) -> &str {
        "sql"
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        writeln!(self.writer, "{}", insert_statement(&self.table, message))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flush SQL file")
    }
}

impl Drop for SqlSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Failed to flush {:?} on close: {}", self.path, e);
        }
    }
}
