//! Daemon configuration loaded from TOML.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use shared_logging::LogLevel;
use thiserror::Error;

/// Default marker location.
pub const DEFAULT_LOCK_PATH: &str = "/tmp/irrigo-daemon.pid";

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing config {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// `log_level` is not a known level.
    #[error("invalid log_level `{0}`")]
    LogLevel(String),
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Single-instance marker path.
    pub lock_path: PathBuf,
    /// Structured JSON log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines file receiving lifecycle and command events.
    pub events_path: Option<PathBuf>,
    /// Mirror log records to stderr.
    pub console_log: bool,
    /// Minimum level written by the loggers.
    pub log_level: String,
    /// External controller invocation.
    pub controller: ControllerConfig,
    /// Console chat front-end.
    pub chat: ChatConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            log_path: None,
            events_path: None,
            console_log: true,
            log_level: "info".into(),
            controller: ControllerConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a TOML file; absent keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Loads `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Parsed minimum log level.
    pub fn level(&self) -> Result<LogLevel, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }
}

/// How the controller script is invoked: `<program> [script] <mode_flag> <mode>`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Executable to launch.
    pub program: String,
    /// Script passed as first argument; omitted when empty.
    pub script: Option<String>,
    /// Flag preceding the mode name.
    pub mode_flag: String,
    /// Working directory of the child.
    pub working_dir: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            script: Some("serial-ping.py".into()),
            mode_flag: "-m".into(),
            working_dir: None,
        }
    }
}

/// Console chat settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    /// Display name used for console messages.
    pub user: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            user: "operator".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.lock_path, PathBuf::from(DEFAULT_LOCK_PATH));
        assert_eq!(config.controller.program, "python3");
        assert_eq!(config.level().unwrap(), LogLevel::Info);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = DaemonConfig::from_toml_str(
            r#"
            lock_path = "/run/irrigo.pid"
            log_level = "debug"

            [controller]
            program = "/usr/local/bin/serial-ping"
            mode_flag = "--mode"
            "#,
        )
        .unwrap();
        assert_eq!(config.lock_path, PathBuf::from("/run/irrigo.pid"));
        assert_eq!(config.level().unwrap(), LogLevel::Debug);
        assert_eq!(config.controller.mode_flag, "--mode");
        assert_eq!(config.controller.script.as_deref(), Some("serial-ping.py"));
        assert_eq!(config.chat.user, "operator");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::from_toml_str("bot_tokn = \"x\"").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempdir().unwrap();
        let err = DaemonConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[chat]\nuser = \"gardener\"\n").unwrap();
        let config = DaemonConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.chat.user, "gardener");
    }

    #[test]
    fn bad_level_is_reported() {
        let config = DaemonConfig::from_toml_str("log_level = \"loud\"").unwrap();
        assert!(matches!(config.level(), Err(ConfigError::LogLevel(_))));
    }
}
