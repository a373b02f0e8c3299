//! Chat-side types: inbound messages, command parsing and transports.

use std::{
    collections::VecDeque,
    io::{BufRead, Write},
    thread,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One message received from the chat network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Conversation the reply goes back to.
    pub chat_id: i64,
    /// Display name of the sender.
    pub user: String,
    /// Raw message text.
    pub text: String,
}

impl InboundMessage {
    /// Creates a message.
    pub fn new(chat_id: i64, user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            user: user.into(),
            text: text.into(),
        }
    }
}

/// Parsed form of a message's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// `/start`
    Start,
    /// `/help`
    Help,
    /// `/watering_time`
    WateringTime,
    /// `/next_alarm`
    NextAlarm,
    /// `/trigger_alarm`
    TriggerAlarm,
    /// Any other slash command, without the leading slash.
    Unknown(String),
    /// Plain text.
    Echo(String),
}

impl ChatCommand {
    /// Parses message text. A command is the first whitespace-delimited word
    /// starting with `/`; an `@botname` suffix on it is ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let Some(word) = text.split_whitespace().next().and_then(|w| w.strip_prefix('/')) else {
            return Self::Echo(text.to_string());
        };
        let name = word.split_once('@').map_or(word, |(name, _)| name);
        match name {
            "start" => Self::Start,
            "help" => Self::Help,
            "watering_time" => Self::WateringTime,
            "next_alarm" => Self::NextAlarm,
            "trigger_alarm" => Self::TriggerAlarm,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Chat network seam.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Next inbound message; `None` once the transport is closed.
    async fn next_message(&self) -> Result<Option<InboundMessage>>;

    /// Sends `text` to `chat_id`.
    async fn send_reply(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Line-based transport over the process's stdin and stdout.
///
/// Stdin is read on a dedicated thread so a pending read never holds up
/// runtime shutdown.
pub struct ConsoleTransport {
    user: String,
    lines: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl ConsoleTransport {
    /// Console chat id.
    pub const CHAT_ID: i64 = 0;

    /// Starts reading stdin; every non-empty line becomes a message from `user`.
    pub fn stdin(user: impl Into<String>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(32);
        thread::Builder::new()
            .name("console-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
            })
            .context("spawning stdin reader")?;
        Ok(Self {
            user: user.into(),
            lines: tokio::sync::Mutex::new(rx),
        })
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn next_message(&self) -> Result<Option<InboundMessage>> {
        let mut lines = self.lines.lock().await;
        while let Some(line) = lines.recv().await {
            let text = line.trim();
            if !text.is_empty() {
                return Ok(Some(InboundMessage::new(Self::CHAT_ID, &self.user, text)));
            }
        }
        Ok(None)
    }

    async fn send_reply(&self, _chat_id: i64, text: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{text}").context("writing reply")?;
        stdout.flush().context("flushing reply")
    }
}

/// Scripted in-process transport; replies are recorded for inspection.
#[derive(Default)]
pub struct MemoryTransport {
    inbox: Mutex<VecDeque<InboundMessage>>,
    sent: Mutex<Vec<(i64, String)>>,
}

impl MemoryTransport {
    /// Transport that yields `messages` then reports closed.
    pub fn new(messages: impl IntoIterator<Item = InboundMessage>) -> Self {
        Self {
            inbox: Mutex::new(messages.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Replies sent so far.
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn next_message(&self) -> Result<Option<InboundMessage>> {
        Ok(self.inbox.lock().pop_front())
    }

    async fn send_reply(&self, chat_id: i64, text: &str) -> Result<()> {
        self.sent.lock().push((chat_id, text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(ChatCommand::parse("/start"), ChatCommand::Start);
        assert_eq!(ChatCommand::parse("/help"), ChatCommand::Help);
        assert_eq!(ChatCommand::parse("/watering_time"), ChatCommand::WateringTime);
        assert_eq!(ChatCommand::parse("/next_alarm"), ChatCommand::NextAlarm);
        assert_eq!(ChatCommand::parse("/trigger_alarm"), ChatCommand::TriggerAlarm);
    }

    #[test]
    fn bot_suffix_and_arguments_are_ignored() {
        assert_eq!(
            ChatCommand::parse("/next_alarm@irrigo_bot"),
            ChatCommand::NextAlarm
        );
        assert_eq!(ChatCommand::parse("  /help please"), ChatCommand::Help);
    }

    #[test]
    fn unknown_and_plain_text() {
        assert_eq!(
            ChatCommand::parse("/water_now"),
            ChatCommand::Unknown("water_now".into())
        );
        assert_eq!(
            ChatCommand::parse("is it raining?"),
            ChatCommand::Echo("is it raining?".into())
        );
        assert_eq!(ChatCommand::parse(""), ChatCommand::Echo(String::new()));
    }

    #[tokio::test]
    async fn memory_transport_drains_then_closes() {
        let transport = MemoryTransport::new([InboundMessage::new(7, "ana", "/help")]);
        let msg = transport.next_message().await.unwrap().unwrap();
        assert_eq!(msg.text, "/help");
        assert!(transport.next_message().await.unwrap().is_none());
        transport.send_reply(7, "ok").await.unwrap();
        assert_eq!(transport.sent(), vec![(7, "ok".to_string())]);
    }
}
