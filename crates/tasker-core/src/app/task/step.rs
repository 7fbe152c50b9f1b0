//! Step - タスクを構成する 1 ステップ

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::context::StepContext;
use crate::domain::{Control, TaskerError};

pub type StepFn<L> =
    Arc<dyn Fn(StepContext<L>) -> BoxFuture<'static, Result<Control, TaskerError>> + Send + Sync>;

pub struct Step<L> {
    name: String,
    run: StepFn<L>,
}

impl<L> Clone for Step<L> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            run: Arc::clone(&self.run),
        }
    }
}

impl<L: Send + 'static> Step<L> {
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(StepContext<L>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Control, TaskerError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |ctx: StepContext<L>| run(ctx).boxed()),
        }
    }
}

impl<L> Step<L> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn invoke(&self, ctx: StepContext<L>) -> BoxFuture<'static, Result<Control, TaskerError>> {
        (self.run)(ctx)
    }
}

impl<L> fmt::Debug for Step<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Ordered step list.
///
/// ```ignore
/// let steps = Steps::new()
///     .step("extract", |ctx| async move { /* .. */ Ok(Control::Next) })
///     .step("load", |ctx| async move { /* .. */ Ok(Control::Finish) });
/// ```
pub struct Steps<L> {
    steps: Vec<Step<L>>,
}

impl<L> Default for Steps<L> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<L: Send + 'static> Steps<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step<F, Fut>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(StepContext<L>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Control, TaskerError>> + Send + 'static,
    {
        self.steps.push(Step::new(name, run));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<L> IntoIterator for Steps<L> {
    type Item = Step<L>;
    type IntoIter = std::vec::IntoIter<Step<L>>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}
