//! Errors - エラー型と分類
//!
//! Every component of the runtime reports failures through [`TaskerError`].
//! The type is `Clone` so an error recorded in a status snapshot can still be
//! returned to the caller that triggered it.

use std::time::Duration;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（whole-task retry の対象）
/// - Permanent: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskerError {
    /// Conflicting construction options or an invalid cron expression.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown operation, source or target name.
    #[error("{kind} '{name}' is not defined")]
    NotDefined { kind: &'static str, name: String },

    /// A component (or dependency) was used before it was registered.
    #[error("{0} used before being registered")]
    NotRegistered(String),

    /// Two different instances registered under the same name.
    #[error("unable to register more than one {kind} under the same name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("resource request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Raised to `wait_for` futures when the owning task is force-stopped.
    #[error("task forcefully shut down")]
    Cancelled,

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("lease payload is not a {expected}")]
    PayloadType { expected: &'static str },

    #[error("configuration error: {0}")]
    Config(String),

    /// Error raised by user code (an API operation or a step body).
    #[error("{0}")]
    Operation(String),
}

impl TaskerError {
    /// Convenience for user code: wrap any displayable error.
    pub fn operation(err: impl std::fmt::Display) -> Self {
        Self::Operation(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::LoginFailed(_) | Self::Operation(_) => {
                ErrorKind::Transient
            }
            Self::Validation(_)
            | Self::NotDefined { .. }
            | Self::NotRegistered(_)
            | Self::DuplicateName { .. }
            | Self::Cancelled
            | Self::Codec(_)
            | Self::Config(_)
            | Self::PayloadType { .. } => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for TaskerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_are_never_retried() {
        let err = TaskerError::NotDefined {
            kind: "source",
            name: "missing".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(!TaskerError::Cancelled.is_retryable());
        assert!(!TaskerError::NotRegistered("session 's1'".into()).is_retryable());
    }

    #[test]
    fn operation_errors_are_transient() {
        let err = TaskerError::operation("upstream returned 503");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "upstream returned 503");
    }

    #[test]
    fn messages_name_the_offender() {
        let err = TaskerError::NotDefined {
            kind: "target",
            name: "push".to_string(),
        };
        assert_eq!(err.to_string(), "target 'push' is not defined");
    }
}
