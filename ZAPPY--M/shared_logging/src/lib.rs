#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging and append-only audit trails for the governance stack.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// Structured operational log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Module emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary JSON payload for fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copies the fields of a JSON object into the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: &serde_json::Value) -> Self {
        if let Some(obj) = metadata.as_object() {
            self.metadata = obj.clone();
        }
        self
    }
}

/// Thread-safe JSON-lines writer opened in append mode.
#[derive(Debug)]
struct AppendWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl AppendWriter {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append<T: Serialize>(&self, value: &T, durable: bool) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        if self.ends_mid_line()? {
            // A writer died mid-line; start ours on a fresh one.
            line.insert(0, b'\n');
        }
        file.write_all(&line)?;
        file.flush()?;
        if durable {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Whether the file ends with a partial line left by an interrupted append.
    fn ends_mid_line(&self) -> Result<bool> {
        let mut reader = File::open(&self.path)
            .with_context(|| format!("reading log tail {}", self.path.display()))?;
        if reader.metadata()?.len() == 0 {
            return Ok(false);
        }
        reader.seek(SeekFrom::End(-1))?;
        let mut last = [0_u8; 1];
        reader.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }
}

/// Operational JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    writer: AppendWriter,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            writer: AppendWriter::open(path)?,
        })
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        self.writer.append(record, false)
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

/// Entry in an audit trail (incident or recovery log).
///
/// Entries are only ever appended; nothing in this crate rewrites or truncates
/// an audit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Wall-clock time the entry was produced.
    pub timestamp: DateTime<Utc>,
    /// Machine-readable event name (e.g. `MUTEX_BLOCKED`).
    pub event: String,
    /// Human-readable cause.
    pub reason: String,
    /// Component that wrote the entry.
    pub source: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            reason: reason.into(),
            source: source.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Overrides the timestamp, for callers that own their time source.
    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only audit trail. Every append is synced to disk before returning.
#[derive(Debug)]
pub struct AuditLog {
    writer: AppendWriter,
}

impl AuditLog {
    /// Opens (creating if needed) the audit trail at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            writer: AppendWriter::open(path)?,
        })
    }

    /// Appends a single entry.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.writer.append(entry, true)
    }

    /// Returns the trail location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.writer.path
    }

    /// Reads every parseable entry from the trail at `path`.
    ///
    /// A missing file yields an empty list. Lines that fail to parse (for
    /// example a torn final line after a crash) are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("opening audit log {}", path.display()))
            }
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("test.log")).unwrap();
        logger
            .log(&LogRecord::new("module", LogLevel::Info, "hello"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"hello\""));
    }

    #[test]
    fn audit_entries_accumulate_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/incidents.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.append(&AuditEntry::new("mutex", "MUTEX_BLOCKED", "train while hunting"))
            .unwrap();
        log.append(
            &AuditEntry::new("validator", "CHECKSUM", "mismatch")
                .with_details(serde_json::json!({ "check": 6 })),
        )
        .unwrap();

        let reopened = AuditLog::open(&path).unwrap();
        reopened
            .append(&AuditEntry::new("recovery", "ORPHAN", "no liveness marker"))
            .unwrap();

        let entries = AuditLog::read_all(&path).unwrap();
        let events: Vec<_> = entries.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, ["MUTEX_BLOCKED", "CHECKSUM", "ORPHAN"]);
        assert_eq!(entries[1].details["check"], 6);
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.append(&AuditEntry::new("recovery", "ORPHAN", "crash"))
            .unwrap();
        let mut raw = fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"timestamp\":\"2025-").unwrap();
        assert_eq!(AuditLog::read_all(&path).unwrap().len(), 1);
        assert!(AuditLog::read_all(dir.path().join("missing.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn append_after_torn_line_is_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.jsonl");
        AuditLog::open(&path)
            .unwrap()
            .append(&AuditEntry::new("recovery", "FIRST", "before crash"))
            .unwrap();
        let mut raw = fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"timestamp\":\"2025-").unwrap();
        drop(raw);

        let reopened = AuditLog::open(&path).unwrap();
        reopened
            .append(&AuditEntry::new("recovery_guard", "ORPHANED_TRAINING", "no marker"))
            .unwrap();
        reopened
            .append(&AuditEntry::new("recovery_guard", "TELEMETRY_CORRUPTED", "bad seal"))
            .unwrap();

        let events: Vec<_> = AuditLog::read_all(&path)
            .unwrap()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(events, ["FIRST", "ORPHANED_TRAINING", "TELEMETRY_CORRUPTED"]);
    }
}
