//! StepContext - step 関数に渡される実行コンテキスト

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Span;

use super::engine::TaskInner;
use crate::app::data_api::DataApi;
use crate::domain::TaskerError;

/// What a step sees of its task: shared local state, the task's sources and
/// targets, and the cancellation token used by [`wait_for`](Self::wait_for).
pub struct StepContext<L> {
    task: Arc<TaskInner<L>>,
    retries: u32,
    span: Span,
}

impl<L> Clone for StepContext<L> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            retries: self.retries,
            span: self.span.clone(),
        }
    }
}

impl<L: Send + 'static> StepContext<L> {
    pub(super) fn new(task: Arc<TaskInner<L>>, retries: u32, span: Span) -> Self {
        Self {
            task,
            retries,
            span,
        }
    }

    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// Span of the current run.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// How many times the current step has returned `Retry` in this run.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Access the task's local state. The lock is held for the duration of
    /// `f`; do not await inside it.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        self.task.with_state(f)
    }

    pub fn state(&self) -> L
    where
        L: Clone,
    {
        self.task.with_state(|s| s.clone())
    }

    fn source(&self, name: &str) -> Result<&Arc<DataApi>, TaskerError> {
        self.task.source(name)
    }

    fn target(&self, name: &str) -> Result<&Arc<DataApi>, TaskerError> {
        self.task.target(name)
    }

    pub async fn get_from_source(
        &self,
        source: &str,
        op: &str,
        params: Value,
    ) -> Result<Value, TaskerError> {
        self.source(source)?.call_source_api(op, params).await
    }

    pub async fn send_to_target(
        &self,
        target: &str,
        op: &str,
        params: Value,
    ) -> Result<Value, TaskerError> {
        self.target(target)?.call_target_api(op, params).await
    }

    pub async fn get_from_source_as<R: DeserializeOwned>(
        &self,
        source: &str,
        op: &str,
        params: impl Serialize,
    ) -> Result<R, TaskerError> {
        self.source(source)?.call_source(op, params).await
    }

    pub async fn send_to_target_as<R: DeserializeOwned>(
        &self,
        target: &str,
        op: &str,
        params: impl Serialize,
    ) -> Result<R, TaskerError> {
        self.target(target)?.call_target(op, params).await
    }

    pub fn set_source_last_updated(
        &self,
        source: &str,
        op: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskerError> {
        self.source(source)?.set_source_last_updated(op, at)
    }

    pub fn get_source_last_updated(
        &self,
        source: &str,
        op: &str,
    ) -> Result<Option<DateTime<Utc>>, TaskerError> {
        self.source(source)?.get_source_last_updated(op)
    }

    pub fn set_target_last_updated(
        &self,
        target: &str,
        op: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), TaskerError> {
        self.target(target)?.set_target_last_updated(op, at)
    }

    pub fn get_target_last_updated(
        &self,
        target: &str,
        op: &str,
    ) -> Result<Option<DateTime<Utc>>, TaskerError> {
        self.target(target)?.get_target_last_updated(op)
    }

    /// Race `fut` against a forced stop of the task.
    ///
    /// Returns `Err(Cancelled)` if the task is stopped first, or already was
    /// stopped when this is called. `fut` is dropped in that case.
    pub async fn wait_for<T>(&self, fut: impl Future<Output = T>) -> Result<T, TaskerError> {
        if self.task.is_force_stopped() {
            return Err(TaskerError::Cancelled);
        }
        let token = self.task.cancel_token();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TaskerError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
