//! TaskBuilder - タスクの構築と起動時検証
//!
//! # Fail-fast 設計
//! - cron schedule と interval / continue_interval の併用は `Validation`
//! - 不正な cron 式も `build()` 時点で `Validation`

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::Task;
use super::context::StepContext;
use super::engine::{TaskInner, TaskParts};
use super::step::{Step, Steps};
use crate::app::data_api::DataApi;
use crate::domain::{Control, TaskerError};
use crate::impls::CronScheduler;
use crate::ports::{Clock, Scheduler, SystemClock};

/// How runs after the first one are triggered.
#[derive(Clone)]
pub enum SchedulePolicy {
    /// Runs only when started explicitly.
    OneOff,
    /// Every scheduler tick starts a run.
    Cron(Arc<dyn Scheduler>),
    /// After each run, the next one is started after `every`, or after
    /// `on_continue` when the run ended with [`Control::Continue`].
    Interval {
        every: Duration,
        on_continue: Option<Duration>,
    },
}

impl SchedulePolicy {
    /// Whether a finished run resolves to `Scheduled`.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::OneOff)
    }

    pub(super) fn next_delay(&self, last: Control) -> Option<Duration> {
        match self {
            Self::Interval { every, on_continue } => Some(match (last, on_continue) {
                (Control::Continue, Some(delay)) => *delay,
                _ => *every,
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for SchedulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneOff => f.write_str("OneOff"),
            Self::Cron(_) => f.write_str("Cron"),
            Self::Interval { every, on_continue } => f
                .debug_struct("Interval")
                .field("every", every)
                .field("on_continue", on_continue)
                .finish(),
        }
    }
}

pub struct TaskBuilder<L> {
    name: String,
    steps: Vec<Step<L>>,
    sources: BTreeMap<String, Arc<DataApi>>,
    targets: BTreeMap<String, Arc<DataApi>>,
    schedule: Option<String>,
    scheduler: Option<Arc<dyn Scheduler>>,
    interval: Option<Duration>,
    continue_interval: Option<Duration>,
    retry: u32,
    state: L,
    clock: Arc<dyn Clock>,
}

impl<L: Send + 'static> TaskBuilder<L> {
    pub(super) fn new(name: String, state: L) -> Self {
        Self {
            name,
            steps: Vec::new(),
            sources: BTreeMap::new(),
            targets: BTreeMap::new(),
            schedule: None,
            scheduler: None,
            interval: None,
            continue_interval: None,
            retry: 0,
            state,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn step<F, Fut>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(StepContext<L>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Control, TaskerError>> + Send + 'static,
    {
        self.steps.push(Step::new(name, run));
        self
    }

    pub fn steps(mut self, steps: Steps<L>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Add a source api, addressed from steps by its own name.
    pub fn source(mut self, api: Arc<DataApi>) -> Self {
        self.sources.insert(api.name().to_string(), api);
        self
    }

    /// Add a target api, addressed from steps by its own name.
    pub fn target(mut self, api: Arc<DataApi>) -> Self {
        self.targets.insert(api.name().to_string(), api);
        self
    }

    /// Cron expression (5, 6 or 7 fields).
    pub fn schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    /// Drive the task from a custom scheduler instead of a cron expression.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn interval(mut self, every: Duration) -> Self {
        self.interval = Some(every);
        self
    }

    pub fn continue_interval(mut self, delay: Duration) -> Self {
        self.continue_interval = Some(delay);
        self
    }

    /// Additional whole-task attempts after a retryable step error.
    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = attempts;
        self
    }

    pub fn state(mut self, state: L) -> Self {
        self.state = state;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Task<L>, TaskerError> {
        let cron_based = self.schedule.is_some() || self.scheduler.is_some();
        if cron_based && (self.interval.is_some() || self.continue_interval.is_some()) {
            return Err(TaskerError::Validation(format!(
                "task '{}': when a schedule is given, interval and continue_interval cannot be used",
                self.name
            )));
        }
        if self.schedule.is_some() && self.scheduler.is_some() {
            return Err(TaskerError::Validation(format!(
                "task '{}': schedule and scheduler are mutually exclusive",
                self.name
            )));
        }

        let policy = match (self.scheduler, self.schedule, self.interval) {
            (Some(scheduler), _, _) => SchedulePolicy::Cron(scheduler),
            (None, Some(expression), _) => {
                SchedulePolicy::Cron(Arc::new(CronScheduler::new(&expression)?))
            }
            (None, None, Some(every)) => SchedulePolicy::Interval {
                every,
                on_continue: self.continue_interval,
            },
            (None, None, None) => {
                if self.continue_interval.is_some() {
                    warn!(task = %self.name, "continue_interval without interval is ignored; task runs one-off");
                }
                SchedulePolicy::OneOff
            }
        };

        Ok(Task {
            inner: Arc::new(TaskInner::new(TaskParts {
                name: self.name,
                steps: self.steps,
                sources: self.sources,
                targets: self.targets,
                policy,
                retry: self.retry,
                state: self.state,
                clock: self.clock,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn builder() -> TaskBuilder<()> {
        Task::builder("t").step("noop", |_| async { Ok(Control::Next) })
    }

    #[rstest]
    #[case(builder().schedule("*/5 * * * *").interval(Duration::from_secs(1)))]
    #[case(builder().schedule("*/5 * * * *").continue_interval(Duration::from_secs(1)))]
    #[case(builder().schedule("definitely not cron"))]
    fn conflicting_or_invalid_schedules_fail(#[case] builder: TaskBuilder<()>) {
        assert!(matches!(builder.build(), Err(TaskerError::Validation(_))));
    }

    #[test]
    fn policy_follows_options() {
        let task = builder()
            .interval(Duration::from_secs(10))
            .continue_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(matches!(
            task.policy(),
            SchedulePolicy::Interval { on_continue: Some(_), .. }
        ));

        let task = builder().continue_interval(Duration::from_secs(1)).build().unwrap();
        assert!(matches!(task.policy(), SchedulePolicy::OneOff));

        let task = builder().schedule("0 0 * * *").build().unwrap();
        assert!(task.policy().is_recurring());
    }

    #[rstest]
    #[case(Control::Continue, Duration::from_secs(1))]
    #[case(Control::Next, Duration::from_secs(10))]
    #[case(Control::Finish, Duration::from_secs(10))]
    fn next_delay_prefers_continue_interval(#[case] last: Control, #[case] expected: Duration) {
        let policy = SchedulePolicy::Interval {
            every: Duration::from_secs(10),
            on_continue: Some(Duration::from_secs(1)),
        };
        assert_eq!(policy.next_delay(last), Some(expected));
    }

    #[rstest]
    #[case(Control::Continue)]
    #[case(Control::Next)]
    fn next_delay_without_continue_interval_waits_the_full_interval(#[case] last: Control) {
        let policy = SchedulePolicy::Interval {
            every: Duration::from_secs(10),
            on_continue: None,
        };
        assert_eq!(policy.next_delay(last), Some(Duration::from_secs(10)));
        assert_eq!(SchedulePolicy::OneOff.next_delay(last), None);
    }
}
