#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Sinks that receive structured records once the capture path produces them.
//!
//! Storage backends are collaborators outside this workspace; everything they
//! need is the [`RecordSink`] trait. The bundled sinks cover local use: an
//! in-memory backlog, an append-only JSON-lines archive and a per-source
//! snapshot directory.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};

/// A record handed to a sink after it has been produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducedRecord {
    /// Producer of the record (the sensor name for captures).
    pub source: String,
    /// ISO timestamp of production.
    pub produced_at: String,
    /// The record document itself.
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Record-produced interface implemented by storage collaborators.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Accepts a freshly produced record.
    async fn publish(&self, record: ProducedRecord) -> Result<()>;
}

/// Renders a value as pretty JSON indented with four spaces.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}

/// In-memory sink with a bounded backlog and live subscription.
#[derive(Debug, Clone)]
pub struct MemoryRecordSink {
    sender: broadcast::Sender<ProducedRecord>,
    capacity: usize,
    backlog: Arc<Mutex<VecDeque<ProducedRecord>>>,
}

impl MemoryRecordSink {
    /// Creates a sink retaining at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Subscribes to records published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProducedRecord> {
        self.sender.subscribe()
    }

    /// Snapshot of recent records retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProducedRecord> {
        self.backlog.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn publish(&self, record: ProducedRecord) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(record.clone());
            while backlog.len() > self.capacity {
                backlog.pop_front();
            }
        }
        // No live subscribers is not an error.
        let _ = self.sender.send(record);
        Ok(())
    }
}

/// Appends each record body as a single JSON line.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    /// Creates a sink appending to `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn publish(&self, record: ProducedRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_vec(&record.body)?;
        line.push(b'\n');
        // one append per record keeps concurrent publishers from interleaving
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps the latest record of every source as `<dir>/<source>.json`.
#[derive(Debug, Clone)]
pub struct SnapshotFileSink {
    dir: PathBuf,
}

impl SnapshotFileSink {
    /// Creates a sink writing into `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path the snapshot for `source` is written to.
    #[must_use]
    pub fn snapshot_path(&self, source: &str) -> PathBuf {
        let file_name: String = source
            .chars()
            .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl RecordSink for SnapshotFileSink {
    async fn publish(&self, record: ProducedRecord) -> Result<()> {
        let path = self.snapshot_path(&record.source);
        let rendered = to_pretty_json(&record.body)?;
        tokio::fs::write(&path, rendered.as_bytes()).await?;
        Ok(())
    }
}
