#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared by the capture tool and the daemon.

use std::{
    fmt,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
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

impl LogLevel {
    /// Upper-case label used in console output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => bail!("unknown log level `{other}`"),
        }
    }
}

/// Structured log record.
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
    /// Arbitrary JSON payload for fields such as pids, paths or command output.
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

    /// Attaches the fields of a JSON object as metadata. Non-object values are stored under `data`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata = map,
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("data".into(), other);
            }
        }
        self
    }
}

enum Sink {
    File { path: PathBuf, file: File },
    Stderr,
}

/// Thread-safe JSON logger with append-only semantics.
///
/// A logger writes to exactly one sink: an append-only file or the process
/// stderr. Records below the configured minimum level are dropped.
pub struct JsonLogger {
    min_level: LogLevel,
    sink: Mutex<Sink>,
}

impl fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLogger")
            .field("min_level", &self.min_level)
            .field("path", &self.path())
            .finish()
    }
}

impl JsonLogger {
    /// Creates or opens a file logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            min_level: LogLevel::Debug,
            sink: Mutex::new(Sink::File { path, file }),
        })
    }

    /// Creates a logger that writes JSON lines to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            min_level: LogLevel::Debug,
            sink: Mutex::new(Sink::Stderr),
        }
    }

    /// Drops every record below `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Returns true when a record at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if !self.enabled(record.level) {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut sink = self.sink.lock();
        match &mut *sink {
            Sink::File { file, .. } => {
                file.write_all(&line)?;
                file.flush()?;
            }
            Sink::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(&line)?;
                err.flush()?;
            }
        }
        Ok(())
    }

    /// Returns the underlying file path, `None` for stderr loggers.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.sink.lock() {
            Sink::File { path, .. } => Some(path.clone()),
            Sink::Stderr => None,
        }
    }
}
