//! DataApi - 名前付きの source/target 操作と依存リソースの貸し出し
//!
//! Every call borrows leases through its [`ApiContext`]; whatever the
//! operation forgot to release is released when the call ends, including
//! when the call future is dropped mid-flight.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Span, debug};

use super::broadcaster::{StatusBroadcaster, Unsubscribe};
use super::session::Session;
use crate::domain::{ApiState, DataApiStatus, LeaseHandle, TaskerError, Timestamps};
use crate::ports::{Clock, Dependency, SystemClock};

pub type ApiFn =
    Arc<dyn Fn(ApiContext, Value) -> BoxFuture<'static, Result<Value, TaskerError>> + Send + Sync>;

/// Which operation table a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiSide {
    Source,
    Target,
}

impl ApiSide {
    fn label(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }

    fn touched(self, status: &mut DataApiStatus) -> &mut Timestamps {
        match self {
            Self::Source => &mut status.source_last_touched,
            Self::Target => &mut status.target_last_touched,
        }
    }

    fn updated(self, status: &mut DataApiStatus) -> &mut Timestamps {
        match self {
            Self::Source => &mut status.source_last_updated,
            Self::Target => &mut status.target_last_updated,
        }
    }
}

type Dependencies = BTreeMap<String, Arc<dyn Dependency>>;

/// Handed to each operation invocation.
#[derive(Clone)]
pub struct ApiContext {
    span: Span,
    dependencies: Arc<Dependencies>,
    handles: Arc<Mutex<Vec<LeaseHandle>>>,
}

impl ApiContext {
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Borrow a lease from the named dependency. `None` uses the
    /// dependency's default timeout.
    pub async fn request_resource(
        &self,
        dependency: &str,
        timeout: Option<Duration>,
    ) -> Result<LeaseHandle, TaskerError> {
        let provider = self
            .dependencies
            .get(dependency)
            .cloned()
            .ok_or_else(|| TaskerError::NotRegistered(format!("dependency '{dependency}'")))?;
        let timeout = timeout.unwrap_or_else(|| provider.default_timeout());
        let handle = provider.request_resource(timeout).await?;
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub struct DataApiBuilder {
    name: String,
    dependencies: Dependencies,
    sessions: BTreeMap<String, Arc<Session>>,
    sources: BTreeMap<String, ApiFn>,
    targets: BTreeMap<String, ApiFn>,
    clock: Arc<dyn Clock>,
}

impl DataApiBuilder {
    pub fn dependency(mut self, name: impl Into<String>, dependency: Arc<dyn Dependency>) -> Self {
        self.dependencies.insert(name.into(), dependency);
        self
    }

    /// Register a session as a dependency. Sessions added this way are
    /// also registered alongside the api by the registry.
    pub fn session(mut self, name: impl Into<String>, session: Arc<Session>) -> Self {
        let name = name.into();
        self.dependencies
            .insert(name.clone(), Arc::clone(&session) as Arc<dyn Dependency>);
        self.sessions.insert(name, session);
        self
    }

    pub fn source<F, Fut>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: Fn(ApiContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskerError>> + Send + 'static,
    {
        self.sources.insert(name.into(), boxed_op(op));
        self
    }

    pub fn target<F, Fut>(mut self, name: impl Into<String>, op: F) -> Self
    where
        F: Fn(ApiContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskerError>> + Send + 'static,
    {
        self.targets.insert(name.into(), boxed_op(op));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<DataApi> {
        let status = DataApiStatus::new(&self.name, self.sources.keys(), self.targets.keys());
        Arc::new(DataApi {
            name: self.name,
            dependencies: Arc::new(self.dependencies),
            sessions: self.sessions,
            sources: self.sources,
            targets: self.targets,
            clock: self.clock,
            status: StatusBroadcaster::new(status),
            span: Mutex::new(Span::none()),
        })
    }
}

fn boxed_op<F, Fut>(op: F) -> ApiFn
where
    F: Fn(ApiContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskerError>> + Send + 'static,
{
    Arc::new(move |ctx: ApiContext, params: Value| op(ctx, params).boxed())
}

pub struct DataApi {
    name: String,
    dependencies: Arc<Dependencies>,
    sessions: BTreeMap<String, Arc<Session>>,
    sources: BTreeMap<String, ApiFn>,
    targets: BTreeMap<String, ApiFn>,
    clock: Arc<dyn Clock>,
    status: StatusBroadcaster<DataApiStatus>,
    span: Mutex<Span>,
}

/// Per-call cleanup. `settle` runs on the normal path; `Drop` covers a call
/// future that is dropped before the operation returns.
struct InFlight {
    side: ApiSide,
    name: String,
    handles: Arc<Mutex<Vec<LeaseHandle>>>,
    status: StatusBroadcaster<DataApiStatus>,
    clock: Arc<dyn Clock>,
    settled: bool,
}

impl InFlight {
    fn unreleased(&self) -> Vec<LeaseHandle> {
        let mut handles = self.handles.lock();
        handles.drain(..).filter(|h| !h.was_released()).collect()
    }

    fn leave(&self) {
        let now = self.clock.now();
        let (side, name) = (self.side, self.name.clone());
        self.status.change_status(|s| {
            s.in_queue = s.in_queue.saturating_sub(1);
            s.state = if s.in_queue == 0 {
                ApiState::Ready
            } else {
                ApiState::InUse
            };
            side.touched(s).insert(name, Some(now));
        });
    }

    async fn settle(mut self) {
        for handle in self.unreleased() {
            handle.release().await;
        }
        self.leave();
        self.settled = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let pending = self.unreleased();
        if !pending.is_empty() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    for handle in pending {
                        handle.release().await;
                    }
                });
            }
        }
        self.leave();
    }
}

impl DataApi {
    pub fn builder(name: impl Into<String>) -> DataApiBuilder {
        DataApiBuilder {
            name: name.into(),
            dependencies: BTreeMap::new(),
            sessions: BTreeMap::new(),
            sources: BTreeMap::new(),
            targets: BTreeMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, span: Span) {
        *self.span.lock() = span;
    }

    /// Sessions this api depends on, keyed by dependency name.
    pub fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn has_target(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub async fn call_source_api(&self, name: &str, params: Value) -> Result<Value, TaskerError> {
        self.call(ApiSide::Source, name, params).await
    }

    pub async fn call_target_api(&self, name: &str, params: Value) -> Result<Value, TaskerError> {
        self.call(ApiSide::Target, name, params).await
    }

    pub async fn call_source<R: DeserializeOwned>(
        &self,
        name: &str,
        params: impl Serialize,
    ) -> Result<R, TaskerError> {
        let value = self
            .call(ApiSide::Source, name, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_target<R: DeserializeOwned>(
        &self,
        name: &str,
        params: impl Serialize,
    ) -> Result<R, TaskerError> {
        let value = self
            .call(ApiSide::Target, name, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    fn operation(&self, side: ApiSide, name: &str) -> Result<ApiFn, TaskerError> {
        let table = match side {
            ApiSide::Source => &self.sources,
            ApiSide::Target => &self.targets,
        };
        table.get(name).cloned().ok_or_else(|| TaskerError::NotDefined {
            kind: side.label(),
            name: name.to_string(),
        })
    }

    async fn call(&self, side: ApiSide, name: &str, params: Value) -> Result<Value, TaskerError> {
        let op = self.operation(side, name)?;
        let span = self.span.lock().clone();

        self.status.change_status(|s| {
            s.in_queue += 1;
            s.state = ApiState::InUse;
        });
        let in_flight = InFlight {
            side,
            name: name.to_string(),
            handles: Arc::new(Mutex::new(Vec::new())),
            status: self.status.clone(),
            clock: Arc::clone(&self.clock),
            settled: false,
        };
        let ctx = ApiContext {
            span: span.clone(),
            dependencies: Arc::clone(&self.dependencies),
            handles: Arc::clone(&in_flight.handles),
        };

        debug!(parent: &span, api = name, side = side.label(), "calling api");
        let result = op(ctx, params).await;
        in_flight.settle().await;

        if let Err(err) = &result {
            debug!(parent: &span, api = name, error = %err, "api call failed");
        }
        result
    }

    fn set_last_updated(
        &self,
        side: ApiSide,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskerError> {
        self.operation(side, name)?;
        debug!(parent: &*self.span.lock(), api = name, last_updated = ?at, "last updated set");
        self.status.change_status(|s| {
            side.updated(s).insert(name.to_string(), at);
        });
        Ok(())
    }

    fn last_updated(&self, side: ApiSide, name: &str) -> Result<Option<DateTime<Utc>>, TaskerError> {
        self.operation(side, name)?;
        let mut status = self.status.snapshot();
        Ok(side.updated(&mut status).get(name).copied().flatten())
    }

    pub fn set_source_last_updated(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskerError> {
        self.set_last_updated(ApiSide::Source, name, at)
    }

    pub fn get_source_last_updated(&self, name: &str) -> Result<Option<DateTime<Utc>>, TaskerError> {
        self.last_updated(ApiSide::Source, name)
    }

    pub fn set_target_last_updated(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskerError> {
        self.set_last_updated(ApiSide::Target, name, at)
    }

    pub fn get_target_last_updated(&self, name: &str) -> Result<Option<DateTime<Utc>>, TaskerError> {
        self.last_updated(ApiSide::Target, name)
    }

    pub fn status(&self) -> DataApiStatus {
        self.status.snapshot()
    }

    pub fn on_status(
        &self,
        listener: impl Fn(&DataApiStatus) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.status.subscribe(listener)
    }
}

impl fmt::Debug for DataApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataApi")
            .field("name", &self.name)
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
