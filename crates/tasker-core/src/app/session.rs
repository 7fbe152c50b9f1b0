//! Session - ログイン済みリソースのリース
//!
//! A `Session` wraps a [`SessionTransport`] and adds lease chaining: when a
//! parent session is configured, every request borrows a parent lease first
//! and keeps it in a table keyed by the request's [`RequestRef`] until the
//! transport fires that reference's release hook.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Span, debug, warn};

use super::broadcaster::{StatusBroadcaster, Unsubscribe};
use super::credentials::Credentials;
use crate::domain::{LeaseHandle, RequestRef, SessionStatus, TaskerError, merge_state};
use crate::ports::{
    Clock, Dependency, LoginEnhancement, LoginEnhancer, ReleaseHook, SessionRequest,
    SessionTransport, SystemClock, TransportConfig, TransportFactory,
};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SessionOptions {
    pub parent: Option<Arc<Session>>,
    pub credentials: Option<Arc<Credentials>>,
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            parent: None,
            credentials: None,
            request_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl SessionOptions {
    pub fn parent(mut self, parent: Arc<Session>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn credentials(mut self, credentials: Arc<Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// State shared with the transport through the [`LoginEnhancer`] seam.
struct SessionShared {
    parent: Option<Arc<Session>>,
    credentials: Option<Arc<Credentials>>,
    parent_leases: Mutex<HashMap<RequestRef, LeaseHandle>>,
}

impl SessionShared {
    async fn release_parent(&self, reference: RequestRef) {
        let lease = self.parent_leases.lock().remove(&reference);
        if let Some(lease) = lease {
            lease.release().await;
        }
    }
}

#[async_trait]
impl LoginEnhancer for SessionShared {
    async fn enhance(&self, reference: RequestRef) -> LoginEnhancement {
        let mut enhancement = LoginEnhancement::default();
        if self.parent.is_some() {
            enhancement.parent_session = self.parent_leases.lock().get(&reference).cloned();
        }
        if let Some(credentials) = &self.credentials {
            let data = credentials.credentials();
            enhancement.username = data.username;
            enhancement.password = data.password;
        }
        enhancement
    }
}

/// Releases the parent lease if the transport call is abandoned mid-flight.
/// Once the transport returns, its release hook owns the table entry.
struct ParentGuard {
    shared: Arc<SessionShared>,
    reference: RequestRef,
    armed: bool,
}

impl Drop for ParentGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lease = self.shared.parent_leases.lock().remove(&self.reference);
        if let Some(lease) = lease {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { lease.release().await });
            }
        }
    }
}

pub struct Session {
    name: String,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<SessionShared>,
    request_timeout: Duration,
    transport: OnceLock<Arc<dyn SessionTransport>>,
    /// State set before `register`; handed to the transport as initial state.
    pending_state: Mutex<Option<Value>>,
    status: StatusBroadcaster<SessionStatus>,
    span: Mutex<Span>,
    forward: Mutex<Option<Unsubscribe>>,
    clock: Arc<dyn Clock>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        options: SessionOptions,
    ) -> Self {
        let name = name.into();
        Self {
            status: StatusBroadcaster::new(SessionStatus::new(name.clone())),
            name,
            factory,
            shared: Arc::new(SessionShared {
                parent: options.parent,
                credentials: options.credentials,
                parent_leases: Mutex::new(HashMap::new()),
            }),
            request_timeout: options.request_timeout,
            transport: OnceLock::new(),
            pending_state: Mutex::new(None),
            span: Mutex::new(Span::none()),
            forward: Mutex::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Session>> {
        self.shared.parent.as_ref()
    }

    pub fn credentials(&self) -> Option<&Arc<Credentials>> {
        self.shared.credentials.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.transport.get().is_some()
    }

    /// Bind the transport. Only the first call has any effect.
    pub fn register(&self, span: Span, log_requests: bool) {
        let mut pending = self.pending_state.lock();
        if self.transport.get().is_some() {
            warn!(parent: &span, session = %self.name, "session already registered; ignoring");
            return;
        }
        *self.span.lock() = span.clone();

        let enhancer: Arc<dyn LoginEnhancer> = self.shared.clone();
        let transport = self.factory.create(TransportConfig {
            name: self.name.clone(),
            span,
            log_requests,
            initial_state: pending.take(),
            enhancer,
        });

        let status = self.status.clone();
        let forward = transport.on_status(Arc::new(move |s: &SessionStatus| {
            let next = s.clone();
            status.change_status(|cur| *cur = next);
        }));
        *self.forward.lock() = Some(forward);

        // 失敗は「既に登録済み」のみで、上でチェック済み
        let _ = self.transport.set(transport);
    }

    fn transport(&self) -> Result<Arc<dyn SessionTransport>, TaskerError> {
        self.transport
            .get()
            .cloned()
            .ok_or_else(|| TaskerError::NotRegistered(format!("session '{}'", self.name)))
    }

    pub async fn request_resource(&self, timeout: Duration) -> Result<LeaseHandle, TaskerError> {
        let transport = self.transport()?;
        let reference = RequestRef::generate(self.clock.as_ref());

        let mut guard = None;
        if let Some(parent) = &self.shared.parent {
            // through the trait object so the recursion is boxed
            let lease = Dependency::request_resource(parent.as_ref(), timeout).await?;
            self.shared.parent_leases.lock().insert(reference, lease);
            guard = Some(ParentGuard {
                shared: Arc::clone(&self.shared),
                reference,
                armed: true,
            });
        }

        let shared = Arc::clone(&self.shared);
        let on_release: ReleaseHook = Box::new(move |reference| {
            Box::pin(async move { shared.release_parent(reference).await })
        });
        let result = transport
            .request_session(SessionRequest {
                reference,
                timeout,
                on_release,
            })
            .await;
        if let Some(guard) = guard.as_mut() {
            guard.armed = false;
        }

        match &result {
            Ok(_) => {
                if let Some(credentials) = &self.shared.credentials {
                    credentials.set_valid(transport.is_logged_in());
                }
            }
            Err(err @ TaskerError::LoginFailed(_)) => {
                warn!(parent: &*self.span.lock(), error = %err, "session login failed");
                if let Some(credentials) = &self.shared.credentials {
                    credentials.set_valid(false);
                }
            }
            Err(err) => {
                debug!(parent: &*self.span.lock(), error = %err, "session request failed");
            }
        }
        result
    }

    /// Merge `partial` into the transport state, buffering it until
    /// `register` when no transport is bound yet.
    pub fn set_state(&self, partial: Value) {
        let mut pending = self.pending_state.lock();
        match self.transport.get() {
            Some(transport) => {
                drop(pending);
                transport.set_state(partial);
            }
            None => match pending.as_mut() {
                Some(buffered) => merge_state(buffered, partial),
                None => *pending = Some(partial),
            },
        }
    }

    pub fn state(&self) -> Value {
        match self.transport.get() {
            Some(transport) => transport.state(),
            None => self.pending_state.lock().clone().unwrap_or(Value::Null),
        }
    }

    pub fn invalidate_session(&self) {
        let Some(transport) = self.transport.get() else {
            return;
        };
        debug!(parent: &*self.span.lock(), "session forced to invalidate");
        transport.invalidate_session("session forced to invalidate");
    }

    pub async fn shutdown(&self) {
        if let Some(transport) = self.transport.get().cloned() {
            let span = self.span.lock().clone();
            debug!(parent: &span, "shutting session down");
            transport.shutdown().await;
            debug!(parent: &span, "session shut down");
        }
        self.status.teardown_all_timers();
    }

    /// Number of parent leases currently held on behalf of child requests.
    pub fn pending_parent_leases(&self) -> usize {
        self.shared.parent_leases.lock().len()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    pub fn on_status(
        &self,
        listener: impl Fn(&SessionStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.status.subscribe(listener)
    }
}

#[async_trait]
impl Dependency for Session {
    fn default_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn request_resource(&self, timeout: Duration) -> Result<LeaseHandle, TaskerError> {
        Session::request_resource(self, timeout).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("registered", &self.is_registered())
            .field("parent", &self.parent().map(|p| p.name().to_string()))
            .finish_non_exhaustive()
    }
}
