//! SessionTransport port - ログインが必要な外部リソース
//!
//! The transport does the real login/logout work. A [`Session`] wraps it,
//! chains it to a parent session and to credentials, and exposes it as a
//! [`Dependency`].
//!
//! [`Session`]: crate::app::Session
//! [`Dependency`]: crate::ports::Dependency

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::Span;

use crate::app::broadcaster::{Listener, Unsubscribe};
use crate::domain::{LeaseHandle, RequestRef, SessionStatus, TaskerError};

/// Hook fired by the transport once per request reference.
pub type ReleaseHook = Box<dyn FnOnce(RequestRef) -> BoxFuture<'static, ()> + Send>;

/// Payload carried by a session lease.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionObject {
    pub name: String,
    /// Transport state as of the moment the lease was handed out.
    pub state: Value,
    pub reference: RequestRef,
}

/// Extra material handed to the transport's login hook.
#[derive(Debug, Clone, Default)]
pub struct LoginEnhancement {
    /// Lease on the parent session borrowed for this request.
    pub parent_session: Option<LeaseHandle>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Supplies the [`LoginEnhancement`] for a given request reference.
#[async_trait]
pub trait LoginEnhancer: Send + Sync {
    async fn enhance(&self, reference: RequestRef) -> LoginEnhancement;
}

/// One acquisition request.
///
/// # Contract
/// `on_release` must fire exactly once: after the returned lease is released,
/// or before the error is returned when acquisition fails.
pub struct SessionRequest {
    pub reference: RequestRef,
    pub timeout: Duration,
    pub on_release: ReleaseHook,
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("reference", &self.reference)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn request_session(&self, request: SessionRequest) -> Result<LeaseHandle, TaskerError>;

    /// Merge a partial JSON object into the transport state.
    fn set_state(&self, partial: Value);

    fn state(&self) -> Value;

    fn is_logged_in(&self) -> bool;

    /// Treat the current login as invalid; the next request logs in again.
    fn invalidate_session(&self, reason: &str);

    async fn shutdown(&self);

    fn on_status(&self, listener: Listener<SessionStatus>) -> Unsubscribe;
}

/// Everything a transport needs at bind time.
pub struct TransportConfig {
    pub name: String,
    pub span: Span,
    pub log_requests: bool,
    /// State buffered by `Session::set_state` before registration.
    pub initial_state: Option<Value>,
    pub enhancer: Arc<dyn LoginEnhancer>,
}

/// Builds the real transport when a session is registered.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: TransportConfig) -> Arc<dyn SessionTransport>;
}
