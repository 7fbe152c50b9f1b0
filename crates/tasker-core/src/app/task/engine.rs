//! Task engine - ステップ実行のステートマシン
//!
//! # 実行の流れ
//! 1. `execute()`: 実行中なら skip（同じタスクの run は重ならない）
//! 2. Running に遷移して `run_with_retry()`
//! 3. `run_steps()`: step を順番に実行し、制御シンボルを解釈
//! 4. 終了時の状態を決定（Error はそのまま / Stopped / Scheduled / Completed / Ready）
//! 5. interval ポリシーなら次の run のタイマーをセット

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, debug_span, error, warn};

use super::context::StepContext;
use super::options::SchedulePolicy;
use super::step::Step;
use crate::app::broadcaster::{StatusBroadcaster, TimerCanceller};
use crate::app::data_api::DataApi;
use crate::domain::{Control, RunId, TaskRunState, TaskStatus, TaskerError};
use crate::ports::{Clock, TickFn};

pub(super) struct TaskParts<L> {
    pub name: String,
    pub steps: Vec<Step<L>>,
    pub sources: BTreeMap<String, Arc<DataApi>>,
    pub targets: BTreeMap<String, Arc<DataApi>>,
    pub policy: SchedulePolicy,
    pub retry: u32,
    pub state: L,
    pub clock: Arc<dyn Clock>,
}

pub(crate) struct TaskInner<L> {
    name: String,
    steps: Vec<Step<L>>,
    sources: BTreeMap<String, Arc<DataApi>>,
    targets: BTreeMap<String, Arc<DataApi>>,
    policy: SchedulePolicy,
    retry: u32,
    state: Mutex<L>,
    clock: Arc<dyn Clock>,
    pub(super) status: StatusBroadcaster<TaskStatus>,
    span: Mutex<Span>,
    forced_stop: AtomicBool,
    cancel: Mutex<CancellationToken>,
    /// Held for the whole run.
    run_lock: tokio::sync::Mutex<()>,
    interval_timer: Mutex<Option<TimerCanceller>>,
}

impl<L: Send + 'static> TaskInner<L> {
    pub(super) fn new(parts: TaskParts<L>) -> Self {
        Self {
            status: StatusBroadcaster::new(TaskStatus::new(parts.name.clone())),
            name: parts.name,
            steps: parts.steps,
            sources: parts.sources,
            targets: parts.targets,
            policy: parts.policy,
            retry: parts.retry,
            state: Mutex::new(parts.state),
            clock: parts.clock,
            span: Mutex::new(Span::none()),
            forced_stop: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
            interval_timer: Mutex::new(None),
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub(super) fn sources(&self) -> impl Iterator<Item = &Arc<DataApi>> {
        self.sources.values()
    }

    pub(super) fn targets(&self) -> impl Iterator<Item = &Arc<DataApi>> {
        self.targets.values()
    }

    pub(super) fn source(&self, name: &str) -> Result<&Arc<DataApi>, TaskerError> {
        self.sources.get(name).ok_or_else(|| TaskerError::NotDefined {
            kind: "source",
            name: name.to_string(),
        })
    }

    pub(super) fn target(&self, name: &str) -> Result<&Arc<DataApi>, TaskerError> {
        self.targets.get(name).ok_or_else(|| TaskerError::NotDefined {
            kind: "target",
            name: name.to_string(),
        })
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(super) fn is_force_stopped(&self) -> bool {
        self.forced_stop.load(Ordering::SeqCst)
    }

    pub(super) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn span(&self) -> Span {
        self.span.lock().clone()
    }

    /// Bind the logger span and arm the scheduler of cron-driven tasks.
    pub(super) fn register(self: &Arc<Self>, span: Span) {
        *self.span.lock() = span;
        if let SchedulePolicy::Cron(scheduler) = &self.policy {
            scheduler.start(self.tick_fn());
        }
    }

    fn tick_fn(self: &Arc<Self>) -> TickFn {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            let Some(task) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { task.execute().await });
                }
                Err(_) => warn!(parent: &task.span(), "scheduler tick outside a tokio runtime; skipped"),
            }
        })
    }

    fn cancel_interval_timer(&self) {
        if let Some(timer) = self.interval_timer.lock().take() {
            timer.cancel();
        }
    }

    fn arm_interval_timer(self: &Arc<Self>, last: Control) {
        let Some(delay) = self.policy.next_delay(last) else {
            return;
        };
        debug!(parent: &self.span(), ?delay, "next run scheduled");
        let weak = Arc::downgrade(self);
        let timer = self.status.set_timer(delay, false, move || {
            if let Some(task) = weak.upgrade() {
                tokio::spawn(async move { task.execute().await });
            }
        });
        if let Some(previous) = self.interval_timer.lock().replace(timer) {
            previous.cancel();
        }
    }

    /// Run the steps once. Skipped while another run of this task is in flight.
    pub(super) async fn execute(self: &Arc<Self>) {
        let Ok(_running) = self.run_lock.try_lock() else {
            debug!(parent: &self.span(), "run already in progress; skipping");
            return;
        };
        self.cancel_interval_timer();
        if !self.is_force_stopped() {
            let mut token = self.cancel.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }

        let run_id = RunId::generate(self.clock.as_ref());
        let span = debug_span!(parent: &self.span(), "run", task = %self.name, run = %run_id);
        debug!(parent: &span, "task started");
        self.status.change_status(|s| {
            s.state = TaskRunState::Running;
            s.current_step = None;
            s.last_error = None;
            s.error_message = None;
        });
        // let subscribers observe `Running` even when every step completes
        // without suspending
        tokio::task::yield_now().await;

        let output = self.run_with_retry(&span).await;

        if self.status.snapshot().state == TaskRunState::Error {
            debug!(parent: &span, "task failed");
        } else {
            let forced = self.is_force_stopped();
            let next = if forced {
                TaskRunState::Stopped
            } else if self.policy.is_recurring() {
                TaskRunState::Scheduled
            } else if output == Control::Finish {
                TaskRunState::Completed
            } else {
                TaskRunState::Ready
            };
            let now = self.clock.now();
            self.status.change_status(|s| {
                s.state = next;
                s.current_step = None;
                s.last_executed = Some(now);
                s.last_error = None;
                s.error_message = None;
            });
            debug!(parent: &span, state = ?next, "task finished");
        }

        if !self.is_force_stopped() {
            self.arm_interval_timer(output);
        }
    }

    /// Whole-task retry around [`run_steps`](Self::run_steps).
    async fn run_with_retry(self: &Arc<Self>, span: &Span) -> Control {
        let mut attempt = 0;
        loop {
            let err = match self.run_steps(span).await {
                Ok(control) => return control,
                Err(err) => err,
            };
            if attempt >= self.retry || !err.is_retryable() || self.is_force_stopped() {
                return Control::Next;
            }
            attempt += 1;
            warn!(parent: span, attempt, of = self.retry, error = %err, "retrying task");
            self.status.change_status(|s| s.state = TaskRunState::Running);
        }
    }

    async fn run_steps(self: &Arc<Self>, span: &Span) -> Result<Control, TaskerError> {
        let mut output = Control::Next;
        for step in &self.steps {
            if self.is_force_stopped() {
                break;
            }
            debug!(parent: span, step = step.name(), "step");
            let name = step.name().to_string();
            self.status.change_status(|s| s.current_step = Some(name));

            let mut retries = 0;
            loop {
                if self.is_force_stopped() {
                    return Ok(output);
                }
                if retries > 0 {
                    debug!(parent: span, step = step.name(), retries, "retrying step");
                }
                let ctx = StepContext::new(Arc::clone(self), retries, span.clone());
                output = match step.invoke(ctx).await {
                    Ok(control) => control,
                    Err(err) if self.is_force_stopped() => {
                        debug!(parent: span, step = step.name(), error = %err, "step interrupted by forced stop");
                        return Ok(Control::Next);
                    }
                    Err(err) => {
                        error!(parent: span, step = step.name(), error = %err, "step failed");
                        let now = self.clock.now();
                        let message = err.to_string();
                        self.status.change_status(|s| {
                            s.state = TaskRunState::Error;
                            s.last_error = Some(now);
                            s.error_message = Some(message);
                        });
                        return Err(err);
                    }
                };
                if output.stops_run() {
                    debug!(parent: span, step = step.name(), control = ?output, "ending run early");
                    return Ok(output);
                }
                if output == Control::Retry {
                    retries += 1;
                } else {
                    break;
                }
            }
        }
        Ok(output)
    }

    pub(super) async fn force_start(self: &Arc<Self>) {
        let state = self.status.snapshot().state;
        if matches!(state, TaskRunState::Running | TaskRunState::Stopping) {
            debug!(parent: &self.span(), ?state, "force start ignored");
            return;
        }
        if let SchedulePolicy::Cron(scheduler) = &self.policy {
            scheduler.start(self.tick_fn());
        }
        self.cancel_interval_timer();
        self.forced_stop.store(false, Ordering::SeqCst);
        self.execute().await;
    }

    pub(super) fn force_stop(&self) {
        if self.status.snapshot().state == TaskRunState::Running {
            debug!(parent: &self.span(), "forcing task to stop");
        }
        if let SchedulePolicy::Cron(scheduler) = &self.policy {
            scheduler.stop();
        }
        self.cancel_interval_timer();
        self.forced_stop.store(true, Ordering::SeqCst);
        self.status.change_status(|s| {
            s.state = if s.state == TaskRunState::Running {
                TaskRunState::Stopping
            } else {
                TaskRunState::Stopped
            };
        });
        self.cancel.lock().cancel();
    }

    pub(super) fn shutdown(&self) {
        self.force_stop();
        self.status.teardown_all_timers();
    }
}
