//! Daemon telemetry: structured JSON logs plus lifecycle and command events.

use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;
use record_sink::{ProducedRecord, RecordSink};
use serde_json::{json, Value};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::{runtime::Handle, task::JoinSet};

/// Builder for daemon telemetry sinks.
pub struct DaemonTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    console_level: Option<LogLevel>,
    min_level: LogLevel,
    event_sink: Option<Arc<dyn RecordSink>>,
}

impl DaemonTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            console_level: None,
            min_level: LogLevel::Debug,
            event_sink: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Mirrors records at or above `level` to stderr.
    #[must_use]
    pub fn console(mut self, level: LogLevel) -> Self {
        self.console_level = Some(level);
        self
    }

    /// Drops file records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the sink receiving lifecycle and command events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<DaemonTelemetry> {
        let file = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        let console = self
            .console_level
            .map(|level| JsonLogger::stderr().with_min_level(level));
        Ok(DaemonTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                file,
                console,
                events: self.event_sink,
                pending: Mutex::new(JoinSet::new()),
            }),
        })
    }
}

/// Telemetry handle shared by the lifecycle and the command handlers.
#[derive(Clone)]
pub struct DaemonTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for DaemonTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    file: Option<JsonLogger>,
    console: Option<JsonLogger>,
    events: Option<Arc<dyn RecordSink>>,
    pending: Mutex<JoinSet<()>>,
}

impl DaemonTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> DaemonTelemetryBuilder {
        DaemonTelemetryBuilder::new(module)
    }

    /// Logs structured metadata to every configured logger.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if self.inner.file.is_none() && self.inner.console.is_none() {
            return Ok(());
        }
        let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
        if let Some(console) = &self.inner.console {
            console.log(&record)?;
        }
        if let Some(file) = &self.inner.file {
            file.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event to the event sink without waiting for it; see
    /// [`DaemonTelemetry::flush`]. Outside a Tokio runtime the event is dropped.
    pub fn event(&self, event_type: &str, payload: Value) {
        let Some(sink) = &self.inner.events else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!("no runtime for telemetry event {event_type}");
            return;
        };
        let produced_at = chrono::Utc::now().to_rfc3339();
        let record = ProducedRecord {
            source: self.inner.module.clone(),
            produced_at: produced_at.clone(),
            body: json!({
                "event_type": event_type,
                "timestamp": produced_at,
                "payload": payload,
            }),
        };
        let sink = Arc::clone(sink);
        let mut pending = self.inner.pending.lock();
        while pending.try_join_next().is_some() {}
        pending.spawn_on(
            async move {
                if let Err(err) = sink.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            },
            &handle,
        );
    }

    /// Waits until every event emitted so far has been published.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.inner.pending.lock());
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = joined {
                tracing::warn!("telemetry event task failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_sink::{JsonLinesSink, MemoryRecordSink};
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("daemon.log.jsonl");
        let sink = Arc::new(MemoryRecordSink::new(16));
        let mut rx = sink.subscribe();
        let telemetry = DaemonTelemetry::builder("irrigo-daemon")
            .log_path(&path)
            .event_sink(sink.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "daemon.lock.acquired", json!({ "pid": 42 }))
            .unwrap();
        telemetry.event("daemon.started", json!({ "pid": 42 }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.body["event_type"], "daemon.started");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("daemon.lock.acquired"));
    }

    #[tokio::test]
    async fn flush_waits_for_pending_events() {
        let tmp = tempdir().unwrap();
        let events = tmp.path().join("events.jsonl");
        let telemetry = DaemonTelemetry::builder("irrigo-daemon")
            .event_sink(Arc::new(JsonLinesSink::new(&events).unwrap()))
            .build()
            .unwrap();
        for n in 0..8 {
            telemetry.event("command.handled", json!({ "n": n }));
        }
        telemetry.event("daemon.stopped", json!({ "reason": "service_returned" }));
        telemetry.flush().await;
        let content = std::fs::read_to_string(&events).unwrap();
        assert_eq!(content.lines().count(), 9);
        assert!(content.contains("daemon.stopped"));
    }

    #[test]
    fn file_level_filter_applies() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("quiet.log.jsonl");
        let telemetry = DaemonTelemetry::builder("irrigo-daemon")
            .log_path(&path)
            .min_level(LogLevel::Warn)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "chat.reply", json!({}))
            .unwrap();
        telemetry.event("ignored.without.sink", json!({}));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
