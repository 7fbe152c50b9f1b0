//! TaskerConfig - ランタイム全体の設定
//!
//! JSON で読み込めます。省略したフィールドはデフォルト値になります。
//!
//! ```json
//! { "autostart_tasks": true, "log_level": "info" }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::TaskerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Named option sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Tasks are started by hand; status changes are logged.
    Manual,
    Prod,
    /// Everything is logged, including every session request.
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskerConfig {
    /// Force-start every task when the registry starts.
    pub autostart_tasks: bool,
    /// Log each session request and release.
    pub log_requests: bool,
    pub log_status_changes: bool,
    pub log_level: LogLevel,
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            autostart_tasks: false,
            log_requests: false,
            log_status_changes: false,
            log_level: LogLevel::Debug,
        }
    }
}

impl TaskerConfig {
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Manual => Self {
                autostart_tasks: false,
                log_requests: false,
                log_status_changes: true,
                log_level: LogLevel::Info,
            },
            Preset::Prod => Self {
                autostart_tasks: false,
                log_requests: false,
                log_status_changes: false,
                log_level: LogLevel::Warn,
            },
            Preset::Debug => Self {
                autostart_tasks: false,
                log_requests: true,
                log_status_changes: true,
                log_level: LogLevel::Debug,
            },
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, TaskerError> {
        serde_json::from_str(raw).map_err(|err| TaskerError::Config(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TaskerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| TaskerError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = TaskerConfig::from_json_str(r#"{"autostart_tasks": true}"#).unwrap();
        assert!(config.autostart_tasks);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.log_requests);
    }

    #[rstest]
    #[case(Preset::Manual, LogLevel::Info, false)]
    #[case(Preset::Prod, LogLevel::Warn, false)]
    #[case(Preset::Debug, LogLevel::Debug, true)]
    fn presets(#[case] preset: Preset, #[case] level: LogLevel, #[case] log_requests: bool) {
        let config = TaskerConfig::preset(preset);
        assert_eq!(config.log_level, level);
        assert_eq!(config.log_requests, log_requests);
        assert!(!config.autostart_tasks);
    }

    #[test]
    fn bad_input_is_a_config_error() {
        assert!(matches!(
            TaskerConfig::from_json_str(r#"{"log_level": "loud"}"#),
            Err(TaskerError::Config(_))
        ));
        assert!(matches!(
            TaskerConfig::from_path("/definitely/not/here.json"),
            Err(TaskerError::Config(_))
        ));
    }
}
