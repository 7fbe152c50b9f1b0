//! State - 各コンポーネントの状態
//!
//! Serialized names match what the dashboard displays.

use serde::{Deserialize, Serialize};

/// TaskRunState はタスクの状態を表現
///
/// # 状態遷移
/// ```text
/// Ready ─► Running ─┬─► Completed | Ready     (one-off)
///                   ├─► Scheduled             (cron / interval)
///                   ├─► Error
///                   └─► Stopping ─► Stopped   (force_stop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskRunState {
    Ready,
    Running,
    Stopping,
    Error,
    Scheduled,
    Completed,
    Stopped,
}

/// ApiState is derived from the in-flight counter: `InUse` iff it is > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiState {
    Ready,
    #[serde(rename = "In Use")]
    InUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed but no transport bound yet.
    Unregistered,
    Ready,
    #[serde(rename = "Logging In")]
    LoggingIn,
    #[serde(rename = "In Use")]
    InUse,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialsState {
    #[serde(rename = "Not Provided")]
    NotProvided,
    Provided,
    Valid,
    Invalid,
}
