use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use irrigo_daemon::{
    run_service, running_instance, CommandHandler, ConsoleTransport, DaemonConfig,
    DaemonTelemetry, Lifecycle, LockError, ScriptController,
};
use record_sink::JsonLinesSink;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "irrigo-daemon",
    version,
    about = "Single-instance chat front-end for the irrigation controller"
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `lock_path` from the configuration.
    #[arg(long, global = true)]
    lock_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Runs the daemon in the foreground (default).
    Run,
    /// Reports whether a live instance holds the lock.
    Status,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load_or_default(cli.config.as_deref())?;
    if let Some(path) = cli.lock_file {
        config.lock_path = path;
    }
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config),
        Commands::Status => status(&config),
    }
}

fn status(config: &DaemonConfig) -> Result<ExitCode> {
    match running_instance(&config.lock_path)? {
        Some(pid) => {
            println!("irrigo-daemon is running (pid {pid})");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("irrigo-daemon is not running");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run(config: &DaemonConfig) -> Result<ExitCode> {
    let level = config.level()?;
    let runtime = Runtime::new().context("starting tokio runtime")?;
    let outcome = runtime.block_on(serve(config, level));
    // the stdin reader thread may still be parked in a read
    runtime.shutdown_background();
    outcome
}

async fn serve(config: &DaemonConfig, level: LogLevel) -> Result<ExitCode> {
    let mut builder = DaemonTelemetry::builder("irrigo-daemon").min_level(level);
    if config.console_log {
        builder = builder.console(level);
    }
    if let Some(path) = &config.log_path {
        builder = builder.log_path(path);
    }
    if let Some(path) = &config.events_path {
        let sink = JsonLinesSink::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_sink(Arc::new(sink));
    }
    let telemetry = builder.build()?;

    let outcome = supervise(config, &telemetry).await;
    // the lifecycle is gone by now, so its final events are queued
    telemetry.flush().await;
    outcome
}

async fn supervise(config: &DaemonConfig, telemetry: &DaemonTelemetry) -> Result<ExitCode> {
    let mut lifecycle = Lifecycle::new(&config.lock_path).with_telemetry(telemetry.clone());
    match lifecycle.start() {
        Ok(()) => {}
        Err(LockError::AlreadyRunning { pid }) => {
            eprintln!("irrigo-daemon is already running (pid {pid})");
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err).context("acquiring daemon lock"),
    }
    lifecycle.install_signal_handlers()?;

    let controller = ScriptController::new(config.controller.clone());
    let handler = CommandHandler::new(Arc::new(controller)).with_telemetry(telemetry.clone());
    let transport = ConsoleTransport::stdin(config.chat.user.clone())?;

    let reason = lifecycle.run(run_service(&transport, &handler)).await?;
    tracing::info!("irrigo-daemon stopped ({reason})");
    Ok(ExitCode::SUCCESS)
}
