//! Status snapshots published by each component.
//!
//! Snapshots are replaced wholesale; listeners never observe a half-applied
//! change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{ApiState, CredentialsState, SessionState, TaskRunState};

pub type Timestamps = BTreeMap<String, Option<DateTime<Utc>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: TaskRunState,
    pub current_step: Option<String>,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TaskStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TaskRunState::Ready,
            current_step: None,
            last_executed: None,
            last_error: None,
            error_message: None,
        }
    }
}

/// DataApi status: in-flight counter plus per-operation bookkeeping.
///
/// "touched" means an operation was invoked; "updated" means the owning task
/// asserted the underlying data changed. Neither is inferred from the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataApiStatus {
    pub name: String,
    pub state: ApiState,
    pub in_queue: usize,
    pub source_last_touched: Timestamps,
    pub source_last_updated: Timestamps,
    pub target_last_touched: Timestamps,
    pub target_last_updated: Timestamps,
}

impl DataApiStatus {
    pub fn new<'a>(
        name: impl Into<String>,
        sources: impl IntoIterator<Item = &'a String>,
        targets: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let sources: Timestamps = sources.into_iter().map(|k| (k.clone(), None)).collect();
        let targets: Timestamps = targets.into_iter().map(|k| (k.clone(), None)).collect();
        Self {
            name: name.into(),
            state: ApiState::Ready,
            in_queue: 0,
            source_last_touched: sources.clone(),
            source_last_updated: sources,
            target_last_touched: targets.clone(),
            target_last_updated: targets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub name: String,
    pub state: SessionState,
    pub in_queue: usize,
    pub is_logged_in: bool,
    pub error: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SessionState::Unregistered,
            in_queue: 0,
            is_logged_in: false,
            error: None,
            last_login: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsStatus {
    pub name: String,
    pub state: CredentialsState,
    pub username: Option<String>,
    pub has_password: bool,
    pub valid: Option<bool>,
}
