//! Chat command dispatch: runs the controller, extracts its answer and
//! renders the reply sentence.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::instrument;

use crate::{
    chat::{ChatCommand, ChatTransport, InboundMessage},
    config::ControllerConfig,
    duration::format_duration,
    extract::{extract_field, ExtractError, TrimMode},
    invoker::{InvokeError, ProcessInvoker},
    telemetry::DaemonTelemetry,
};

const WATERING_FIELD: &str = "total_watering_time";
const NEXT_ALARM_FIELD: &str = "nextAlarmSecs";

const MSG_HELP: &str = "Hello master how can I assist you?";
const MSG_TRIGGERED: &str = "Alarm triggered.";
const MSG_EXEC_FAILED: &str = "Failed to execute the command.";
const MSG_PROCESSING_FAILED: &str = "An error occurred while processing the command.";
const MSG_NO_WATERING: &str = "Could not find the watering time information.";
const MSG_NO_ALARM: &str = "Could not find the next alarm information.";

/// Controller operation selected by `<mode_flag> <mode>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    /// Total watering time of the current schedule.
    GetWateringTime,
    /// Seconds until the next alarm.
    NextAlarm,
    /// Fires the alarm now.
    TriggerAlarm,
}

impl ControllerMode {
    /// Argument passed after the mode flag.
    #[must_use]
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::GetWateringTime => "get-watering-time",
            Self::NextAlarm => "next-alarm",
            Self::TriggerAlarm => "trigger-alarm",
        }
    }
}

/// The irrigation controller as seen by the handlers.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Runs `mode` and returns the controller's stdout.
    async fn query(&self, mode: ControllerMode) -> Result<String, InvokeError>;
}

/// Controller reached by launching the configured script.
#[derive(Debug, Clone)]
pub struct ScriptController {
    invoker: ProcessInvoker,
    config: ControllerConfig,
}

impl ScriptController {
    /// Creates a controller from configuration.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let invoker = match &config.working_dir {
            Some(dir) => ProcessInvoker::new().with_working_dir(dir),
            None => ProcessInvoker::new(),
        };
        Self { invoker, config }
    }

    /// Arguments for `mode`: `[script] <mode_flag> <mode>`.
    #[must_use]
    pub fn args(&self, mode: ControllerMode) -> Vec<String> {
        let mut args: Vec<String> = self
            .config
            .script
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        args.push(self.config.mode_flag.clone());
        args.push(mode.as_arg().to_string());
        args
    }
}

#[async_trait]
impl Controller for ScriptController {
    async fn query(&self, mode: ControllerMode) -> Result<String, InvokeError> {
        let result = self
            .invoker
            .run(&self.config.program, &self.args(mode))
            .await?;
        Ok(result.stdout)
    }
}

/// Failures turned into a reply sentence at the handler boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Controller could not be launched or exited non-zero.
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    /// Controller output lacked the field or carried a bad value.
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// A duration field was negative.
    #[error("field `{field}` is negative ({value})")]
    NegativeDuration {
        /// Field name.
        field: String,
        /// Parsed value.
        value: i64,
    },
}

impl CommandError {
    /// User-facing sentence; `not_found` is used when the field was absent.
    #[must_use]
    pub const fn user_message(&self, not_found: &'static str) -> &'static str {
        match self {
            Self::Invoke(_) => MSG_EXEC_FAILED,
            Self::Extract(ExtractError::FieldNotFound { .. }) => not_found,
            Self::Extract(ExtractError::FieldParseError { .. }) | Self::NegativeDuration { .. } => {
                MSG_PROCESSING_FAILED
            }
        }
    }
}

/// Maps chat messages to replies.
pub struct CommandHandler {
    controller: Arc<dyn Controller>,
    telemetry: Option<DaemonTelemetry>,
}

impl CommandHandler {
    /// Creates a handler around `controller`.
    #[must_use]
    pub fn new(controller: Arc<dyn Controller>) -> Self {
        Self {
            controller,
            telemetry: None,
        }
    }

    /// Logs controller output and failures through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: DaemonTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Produces the reply for `message`. Never fails; errors become sentences.
    /// Unrecognized slash commands get no reply at all.
    #[instrument(skip(self, message), fields(chat_id = message.chat_id))]
    pub async fn handle(&self, message: &InboundMessage) -> Option<String> {
        let reply = match ChatCommand::parse(&message.text) {
            ChatCommand::Start => format!("Hi {}!", message.user),
            ChatCommand::Help => MSG_HELP.to_string(),
            ChatCommand::WateringTime => {
                match self
                    .fetch_seconds(ControllerMode::GetWateringTime, WATERING_FIELD, TrimMode::RestOfLine)
                    .await
                {
                    Ok(secs) => format!(
                        "The total watering time needed is {}.",
                        format_duration(secs)
                    ),
                    Err(err) => self.fail(ControllerMode::GetWateringTime, &err, MSG_NO_WATERING),
                }
            }
            ChatCommand::NextAlarm => {
                match self
                    .fetch_seconds(ControllerMode::NextAlarm, NEXT_ALARM_FIELD, TrimMode::FirstToken)
                    .await
                {
                    Ok(secs) => format!("The next alarm is in {}.", format_duration(secs)),
                    Err(err) => self.fail(ControllerMode::NextAlarm, &err, MSG_NO_ALARM),
                }
            }
            ChatCommand::TriggerAlarm => match self.query(ControllerMode::TriggerAlarm).await {
                Ok(_) => MSG_TRIGGERED.to_string(),
                Err(err) => self.fail(ControllerMode::TriggerAlarm, &err, MSG_EXEC_FAILED),
            },
            ChatCommand::Unknown(name) => {
                tracing::debug!("ignoring unknown command /{name}");
                return None;
            }
            ChatCommand::Echo(text) => text,
        };
        Some(reply)
    }

    async fn fetch_seconds(
        &self,
        mode: ControllerMode,
        field: &str,
        trim: TrimMode,
    ) -> Result<u64, CommandError> {
        let output = self.query(mode).await?;
        let value = extract_field(&output, field, trim)?;
        u64::try_from(value).map_err(|_| CommandError::NegativeDuration {
            field: field.to_string(),
            value,
        })
    }

    async fn query(&self, mode: ControllerMode) -> Result<String, CommandError> {
        let output = self.controller.query(mode).await?;
        self.log(
            LogLevel::Info,
            "controller.output",
            json!({ "mode": mode.as_arg(), "stdout": output }),
        );
        Ok(output)
    }

    fn fail(&self, mode: ControllerMode, err: &CommandError, not_found: &'static str) -> String {
        tracing::error!(mode = mode.as_arg(), "command failed: {err}");
        let stderr = match err {
            CommandError::Invoke(InvokeError::CommandFailed { stderr, .. }) => Some(stderr.as_str()),
            _ => None,
        };
        self.log(
            LogLevel::Error,
            "controller.failed",
            json!({ "mode": mode.as_arg(), "error": err.to_string(), "stderr": stderr }),
        );
        err.user_message(not_found).to_string()
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.log(level, message, metadata) {
                tracing::warn!("failed to write log record: {err:?}");
            }
        }
    }
}

/// Serves `transport` until it closes, answering one message at a time.
///
/// Reply delivery failures are logged and skipped; a failing receive ends the loop.
pub async fn run_service(transport: &dyn ChatTransport, handler: &CommandHandler) -> Result<()> {
    while let Some(message) = transport
        .next_message()
        .await
        .context("receiving chat message")?
    {
        let Some(reply) = handler.handle(&message).await else {
            continue;
        };
        if let Err(err) = transport.send_reply(message.chat_id, &reply).await {
            tracing::warn!(chat_id = message.chat_id, "failed to send reply: {err:?}");
        }
    }
    Ok(())
}
