#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Irrigation controller daemon: a single-instance chat front-end that runs the
//! controller script on demand and answers with human-readable durations.

/// Chat messages, command parsing and transports.
pub mod chat;
/// TOML configuration.
pub mod config;
/// Human-readable duration rendering.
pub mod duration;
/// Integer field extraction from controller output.
pub mod extract;
/// Command dispatch and the service loop.
pub mod handlers;
/// External process invocation.
pub mod invoker;
/// Start/stop state machine with signal-driven shutdown.
pub mod lifecycle;
/// Pid-file lock marker.
pub mod lock;
/// Structured logs and lifecycle events.
pub mod telemetry;

pub use chat::{ChatCommand, ChatTransport, ConsoleTransport, InboundMessage, MemoryTransport};
pub use config::{ConfigError, ControllerConfig, DaemonConfig};
pub use duration::format_duration;
pub use extract::{extract_field, ExtractError, TrimMode};
pub use handlers::{
    run_service, CommandError, CommandHandler, Controller, ControllerMode, ScriptController,
};
pub use invoker::{InvokeError, ProcessInvoker, ProcessResult};
pub use lifecycle::{Lifecycle, LifecycleState, ShutdownHandle, ShutdownReason};
pub use lock::{running_instance, DaemonLock, LockError};
pub use telemetry::{DaemonTelemetry, DaemonTelemetryBuilder};
