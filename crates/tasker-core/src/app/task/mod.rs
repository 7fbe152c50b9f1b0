//! Task - ステップ列をスケジュールに従って実行する
//!
//! # 使用例
//! ```ignore
//! let task = Task::<Local>::builder("sync-users")
//!     .source(users_api)
//!     .target(store_api)
//!     .interval(Duration::from_secs(60))
//!     .step("fetch", |ctx| async move { /* .. */ Ok(Control::Next) })
//!     .build()?;
//! task.register(span);
//! task.force_start().await;
//! ```

mod context;
mod engine;
mod options;
mod step;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Span;

pub use self::context::StepContext;
pub use self::options::{SchedulePolicy, TaskBuilder};
pub use self::step::{Step, StepFn, Steps};

use self::engine::TaskInner;
use super::broadcaster::{Listener, Unsubscribe};
use super::data_api::DataApi;
use crate::domain::TaskStatus;

/// Cheap to clone; clones share one task.
pub struct Task<L> {
    inner: Arc<TaskInner<L>>,
}

impl<L> Clone for Task<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Default + Send + 'static> Task<L> {
    pub fn builder(name: impl Into<String>) -> TaskBuilder<L> {
        TaskBuilder::new(name.into(), L::default())
    }
}

impl<L: Send + 'static> Task<L> {
    pub fn builder_with_state(name: impl Into<String>, state: L) -> TaskBuilder<L> {
        TaskBuilder::new(name.into(), state)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn policy(&self) -> &SchedulePolicy {
        self.inner.policy()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<DataApi>> {
        self.inner.sources()
    }

    pub fn targets(&self) -> impl Iterator<Item = &Arc<DataApi>> {
        self.inner.targets()
    }

    /// Bind the logger span. Cron-driven tasks start receiving ticks here.
    pub fn register(&self, span: Span) {
        self.inner.register(span);
    }

    /// Run once now. Does nothing while a run is already in flight.
    pub async fn execute(&self) {
        self.inner.execute().await;
    }

    /// No-op while `Running` or `Stopping`. Otherwise re-arms the scheduler, clears the
    /// forced-stop flag and runs.
    pub async fn force_start(&self) {
        self.inner.force_start().await;
    }

    /// Stop the scheduler and pending interval timer, and cancel every
    /// pending [`StepContext::wait_for`].
    pub fn force_stop(&self) {
        self.inner.force_stop();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        self.inner.with_state(f)
    }

    pub fn set_state(&self, state: L) {
        self.inner.with_state(|s| *s = state);
    }

    pub fn state(&self) -> L
    where
        L: Clone,
    {
        self.inner.with_state(|s| s.clone())
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.status.snapshot()
    }

    pub fn on_status(&self, listener: impl Fn(&TaskStatus) + Send + Sync + 'static) -> Unsubscribe {
        self.inner.status.subscribe(listener)
    }
}

impl<L> fmt::Debug for Task<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.inner.status.snapshot())
            .finish_non_exhaustive()
    }
}

/// Type-erased task, so tasks with different local state types can share a
/// [`Registry`](crate::app::Registry).
#[async_trait]
pub trait ManagedTask: Send + Sync {
    fn name(&self) -> &str;

    fn sources(&self) -> Vec<Arc<DataApi>>;

    fn targets(&self) -> Vec<Arc<DataApi>>;

    fn register(&self, span: Span);

    fn status(&self) -> TaskStatus;

    fn on_status(&self, listener: Listener<TaskStatus>) -> Unsubscribe;

    async fn force_start(&self);

    fn force_stop(&self);

    fn shutdown(&self);
}

#[async_trait]
impl<L: Send + 'static> ManagedTask for Task<L> {
    fn name(&self) -> &str {
        Task::name(self)
    }

    fn sources(&self) -> Vec<Arc<DataApi>> {
        Task::sources(self).cloned().collect()
    }

    fn targets(&self) -> Vec<Arc<DataApi>> {
        Task::targets(self).cloned().collect()
    }

    fn register(&self, span: Span) {
        Task::register(self, span);
    }

    fn status(&self) -> TaskStatus {
        Task::status(self)
    }

    fn on_status(&self, listener: Listener<TaskStatus>) -> Unsubscribe {
        self.inner.status.subscribe_arc(listener)
    }

    async fn force_start(&self) {
        Task::force_start(self).await;
    }

    fn force_stop(&self) {
        Task::force_stop(self);
    }

    fn shutdown(&self) {
        Task::shutdown(self);
    }
}
