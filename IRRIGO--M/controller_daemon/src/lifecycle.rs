//! Singleton daemon lifecycle.
//!
//! `Unstarted -> Starting -> Running -> ShuttingDown -> Stopped`. The lock
//! marker is taken in `Starting` and removed before `Stopped`, whether the
//! service returns, fails, or a termination signal arrives. Removal is
//! idempotent, so the signal path and the normal exit path may both attempt it.

use std::{fmt, future::Future, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::sync::watch;

use crate::{
    lock::{DaemonLock, LockError},
    telemetry::DaemonTelemetry,
};

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing acquired yet.
    Unstarted,
    /// Checking and writing the lock marker.
    Starting,
    /// Lock held, service running.
    Running,
    /// Releasing resources.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Why the daemon left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// The service loop returned on its own.
    ServiceReturned,
    /// Requested programmatically through a [`ShutdownHandle`].
    Requested,
}

impl ShutdownReason {
    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::ServiceReturned => "service_returned",
            Self::Requested => "requested",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable trigger for shutting the daemon down from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    lock: Arc<DaemonLock>,
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("lock", &self.lock.path())
            .field("reason", &*self.tx.borrow())
            .finish()
    }
}

impl ShutdownHandle {
    /// Removes the lock marker, then wakes the service loop. Only the first
    /// reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) {
        if let Err(err) = self.lock.release() {
            tracing::warn!("lock release on {reason} failed: {err}");
        }
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// First reason triggered, if any.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }
}

/// Owns the lock marker and drives the service until shutdown.
pub struct Lifecycle {
    lock_path: PathBuf,
    state: LifecycleState,
    lock: Option<Arc<DaemonLock>>,
    shutdown: Arc<watch::Sender<Option<ShutdownReason>>>,
    telemetry: Option<DaemonTelemetry>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("lock_path", &self.lock_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Creates an unstarted lifecycle guarding `lock_path`.
    #[must_use]
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            lock_path: lock_path.into(),
            state: LifecycleState::Unstarted,
            lock: None,
            shutdown: Arc::new(tx),
            telemetry: None,
        }
    }

    /// Reports transitions through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: DaemonTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Held lock, while running.
    #[must_use]
    pub fn lock(&self) -> Option<&DaemonLock> {
        self.lock.as_deref()
    }

    /// Acquires the lock marker and enters `Running`.
    ///
    /// A live owner yields [`LockError::AlreadyRunning`], leaves the marker
    /// untouched and moves to `Stopped`. Calling this outside `Unstarted` is a no-op.
    pub fn start(&mut self) -> Result<(), LockError> {
        if self.state != LifecycleState::Unstarted {
            return Ok(());
        }
        self.state = LifecycleState::Starting;
        match DaemonLock::acquire(&self.lock_path) {
            Ok(lock) => {
                let pid = lock.pid();
                self.lock = Some(Arc::new(lock));
                self.state = LifecycleState::Running;
                self.report(
                    LogLevel::Info,
                    "daemon.started",
                    json!({ "pid": pid, "lock_path": self.lock_path }),
                );
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Stopped;
                self.report(
                    LogLevel::Error,
                    "daemon.start_refused",
                    json!({ "error": err.to_string(), "lock_path": self.lock_path }),
                );
                Err(err)
            }
        }
    }

    /// Shutdown trigger bound to the held lock; `None` before a successful start.
    #[must_use]
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.lock.as_ref().map(|lock| ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
            lock: Arc::clone(lock),
        })
    }

    /// Spawns listeners turning SIGINT and SIGTERM into shutdown triggers.
    /// Must run inside a Tokio runtime, after [`Lifecycle::start`].
    pub fn install_signal_handlers(&self) -> Result<()> {
        let handle = self
            .shutdown_handle()
            .context("signal handlers need a started lifecycle")?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            // registered before returning so no signal is lost to the default action
            for (kind, reason) in [
                (SignalKind::interrupt(), ShutdownReason::Interrupt),
                (SignalKind::terminate(), ShutdownReason::Terminate),
            ] {
                let mut stream = signal(kind).context("installing signal handler")?;
                let handle = handle.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        handle.trigger(reason);
                    }
                });
            }
        }
        #[cfg(not(unix))]
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.trigger(ShutdownReason::Interrupt);
            }
        });

        Ok(())
    }

    /// Runs `service` until it returns or a shutdown is triggered, then stops.
    ///
    /// When a trigger wins, the service future is dropped mid-flight. A service
    /// error is returned after the lock has been released.
    pub async fn run<F>(&mut self, service: F) -> Result<ShutdownReason>
    where
        F: Future<Output = Result<()>>,
    {
        anyhow::ensure!(
            self.state == LifecycleState::Running,
            "lifecycle is {:?}, not running",
            self.state
        );
        let mut rx = self.shutdown.subscribe();
        let (reason, outcome) = tokio::select! {
            outcome = service => (ShutdownReason::ServiceReturned, outcome),
            triggered = rx.wait_for(Option::is_some) => {
                let reason = triggered.ok().and_then(|r| *r).unwrap_or(ShutdownReason::Requested);
                (reason, Ok(()))
            }
        };
        if let Err(err) = &outcome {
            self.report(
                LogLevel::Error,
                "daemon.service_failed",
                json!({ "error": format!("{err:#}") }),
            );
        }
        self.stop(reason);
        outcome.map(|()| reason)
    }

    /// Releases the lock and enters `Stopped`. Safe to call repeatedly.
    pub fn stop(&mut self, reason: ShutdownReason) {
        if matches!(self.state, LifecycleState::Stopped | LifecycleState::Unstarted) {
            self.state = LifecycleState::Stopped;
            return;
        }
        self.state = LifecycleState::ShuttingDown;
        if let Some(lock) = self.lock.take() {
            if let Err(err) = lock.release() {
                self.report(
                    LogLevel::Error,
                    "daemon.lock.release_failed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
        self.shutdown.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        self.state = LifecycleState::Stopped;
        self.report(
            LogLevel::Info,
            "daemon.stopped",
            json!({ "reason": reason.as_str() }),
        );
    }

    fn report(&self, level: LogLevel, message: &str, payload: serde_json::Value) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}: {payload}"),
            LogLevel::Info => tracing::info!("{message}: {payload}"),
            LogLevel::Warn => tracing::warn!("{message}: {payload}"),
            LogLevel::Error => tracing::error!("{message}: {payload}"),
        }
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.log(level, message, payload.clone()) {
                tracing::warn!("failed to write log record: {err:?}");
            }
            telemetry.event(message, payload);
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.state == LifecycleState::Running {
            self.stop(ShutdownReason::Requested);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    #[test]
    fn start_takes_lock_and_stop_releases_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut lifecycle = Lifecycle::new(&path);
        assert_eq!(lifecycle.state(), LifecycleState::Unstarted);
        lifecycle.start().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        lifecycle.stop(ShutdownReason::Requested);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(!path.exists());
        lifecycle.stop(ShutdownReason::Requested);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn second_start_is_refused_then_third_succeeds_after_trigger() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut first = Lifecycle::new(&path);
        first.start().unwrap();
        let contents = fs::read_to_string(&path).unwrap();

        let mut second = Lifecycle::new(&path);
        let err = second.start().unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
        assert_eq!(second.state(), LifecycleState::Stopped);
        assert_eq!(fs::read_to_string(&path).unwrap(), contents);

        first
            .shutdown_handle()
            .unwrap()
            .trigger(ShutdownReason::Terminate);
        assert!(!path.exists());

        let mut third = Lifecycle::new(&path);
        third.start().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn service_return_stops_and_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut lifecycle = Lifecycle::new(&path);
        lifecycle.start().unwrap();
        let reason = lifecycle.run(async { Ok(()) }).await.unwrap();
        assert_eq!(reason, ShutdownReason::ServiceReturned);
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn service_error_still_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut lifecycle = Lifecycle::new(&path);
        lifecycle.start().unwrap();
        let err = lifecycle
            .run(async { Err(anyhow::anyhow!("transport closed abruptly")) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transport closed"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn trigger_preempts_pending_service() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let mut lifecycle = Lifecycle::new(&path);
        lifecycle.start().unwrap();
        let handle = lifecycle.shutdown_handle().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.trigger(ShutdownReason::Interrupt);
            handle.trigger(ShutdownReason::Terminate);
        });
        let reason = lifecycle
            .run(std::future::pending::<Result<()>>())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Interrupt);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn run_requires_start() {
        let dir = tempdir().unwrap();
        let mut lifecycle = Lifecycle::new(dir.path().join("daemon.pid"));
        assert!(lifecycle.run(async { Ok(()) }).await.is_err());
        assert!(lifecycle.shutdown_handle().is_none());
    }

    #[test]
    fn drop_while_running_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let mut lifecycle = Lifecycle::new(&path);
            lifecycle.start().unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn lifecycle_records_carry_their_levels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        let log = dir.path().join("daemon.log");
        let telemetry = DaemonTelemetry::builder("irrigo-daemon")
            .min_level(LogLevel::Debug)
            .log_path(&log)
            .build()
            .unwrap();

        let mut first = Lifecycle::new(&path).with_telemetry(telemetry.clone());
        first.start().unwrap();
        let mut second = Lifecycle::new(&path).with_telemetry(telemetry);
        second.start().unwrap_err();
        first.stop(ShutdownReason::Interrupt);

        let records: Vec<shared_logging::LogRecord> = fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let seen: Vec<(&str, LogLevel)> = records
            .iter()
            .map(|r| (r.message.as_str(), r.level))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("daemon.started", LogLevel::Info),
                ("daemon.start_refused", LogLevel::Error),
                ("daemon.stopped", LogLevel::Info),
            ]
        );
        assert_eq!(records[2].metadata["reason"], "interrupt");
    }
}
