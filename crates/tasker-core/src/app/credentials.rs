//! Credentials - ログイン用のユーザー名・パスワード
//!
//! Sessions read the pair at login time and report back whether the login
//! succeeded through [`Credentials::set_valid`].

use std::fmt;

use parking_lot::Mutex;
use tracing::{Span, debug};

use super::broadcaster::{StatusBroadcaster, Unsubscribe};
use crate::domain::{CredentialsState, CredentialsStatus};

/// Names of the environment variables holding the pair.
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialsData {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CredentialsData {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for CredentialsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsData")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

pub struct Credentials {
    name: String,
    data: Mutex<CredentialsData>,
    status: StatusBroadcaster<CredentialsStatus>,
    span: Mutex<Span>,
}

impl Credentials {
    pub fn new(name: impl Into<String>, data: CredentialsData) -> Self {
        let name = name.into();
        let provided = data.username.is_some() && data.password.is_some();
        let status = CredentialsStatus {
            name: name.clone(),
            state: if provided {
                CredentialsState::Provided
            } else {
                CredentialsState::NotProvided
            },
            username: data.username.clone(),
            has_password: data.password.is_some(),
            valid: None,
        };
        Self {
            name,
            data: Mutex::new(data),
            status: StatusBroadcaster::new(status),
            span: Mutex::new(Span::none()),
        }
    }

    /// Read the pair from the named environment variables. Unset or
    /// non-unicode variables count as missing.
    pub fn from_env(name: impl Into<String>, vars: &EnvVars) -> Self {
        let read = |var: &Option<String>| var.as_deref().and_then(|v| std::env::var(v).ok());
        Self::new(
            name,
            CredentialsData {
                username: read(&vars.username),
                password: read(&vars.password),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, span: Span) {
        *self.span.lock() = span;
    }

    pub fn credentials(&self) -> CredentialsData {
        self.data.lock().clone()
    }

    /// Replace the pair. Validity is unknown again until the next login.
    pub fn set_credentials(&self, data: CredentialsData) {
        debug!(parent: &*self.span.lock(), username = ?data.username, "credentials set");
        let username = data.username.clone();
        let has_password = data.password.as_deref().is_some_and(|p| !p.is_empty());
        *self.data.lock() = data;
        self.status.change_status(|s| {
            s.state = CredentialsState::Provided;
            s.username = username;
            s.has_password = has_password;
            s.valid = None;
        });
    }

    pub fn set_valid(&self, valid: bool) {
        if self.status.snapshot().valid != Some(valid) {
            let span = self.span.lock();
            if valid {
                debug!(parent: &*span, "valid credentials");
            } else {
                debug!(parent: &*span, "invalid credentials");
            }
        }
        self.status.change_status(|s| {
            s.state = if valid {
                CredentialsState::Valid
            } else {
                CredentialsState::Invalid
            };
            s.valid = Some(valid);
        });
    }

    pub fn status(&self) -> CredentialsStatus {
        self.status.snapshot()
    }

    pub fn on_status(
        &self,
        listener: impl Fn(&CredentialsStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.status.subscribe(listener)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
