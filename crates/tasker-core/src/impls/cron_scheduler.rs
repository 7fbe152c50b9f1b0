//! CronScheduler - cron 式で tick を発行する Scheduler
//!
//! 5 フィールド（分単位）の式は秒フィールド `0` を補って 6 フィールドとして
//! 解釈します。6/7 フィールドの式はそのまま渡します。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::domain::TaskerError;
use crate::ports::{Scheduler, TickFn};

pub fn parse_schedule(expression: &str) -> Result<Schedule, TaskerError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|err| TaskerError::Validation(format!("invalid cron schedule '{expression}': {err}")))
}

#[derive(Debug)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(expression: &str) -> Result<Self, TaskerError> {
        Ok(Self {
            expression: expression.to_string(),
            schedule: parse_schedule(expression)?,
            running: Mutex::new(None),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Scheduler for CronScheduler {
    fn start(&self, tick: TickFn) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(schedule = %self.expression, "no tokio runtime; cron schedule not started");
            return;
        };
        let schedule = self.schedule.clone();
        *running = Some(runtime.spawn(async move {
            while let Some(next) = schedule.upcoming(Utc).next() {
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                tick();
            }
        }));
    }

    fn stop(&self) {
        if let Some(handle) = self.running.lock().take() {
            handle.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scheduler that only ticks when told to. Useful in tests.
#[derive(Default)]
pub struct ManualScheduler {
    tick: Mutex<Option<TickFn>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver one tick. Returns false while stopped.
    pub fn fire(&self) -> bool {
        let tick = self.tick.lock().clone();
        match tick {
            Some(tick) => {
                tick();
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn start(&self, tick: TickFn) {
        *self.tick.lock() = Some(tick);
    }

    fn stop(&self) {
        self.tick.lock().take();
    }

    fn is_running(&self) -> bool {
        self.tick.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rstest]
    #[case("*/5 * * * *")]
    #[case("0 30 9 * * Mon-Fri")]
    #[case("0 0 0 1 1 * 2030")]
    fn accepts_common_forms(#[case] expression: &str) {
        assert!(parse_schedule(expression).is_ok(), "{expression}");
    }

    #[rstest]
    #[case("")]
    #[case("not a cron")]
    #[case("61 * * * *")]
    fn rejects_garbage(#[case] expression: &str) {
        assert!(matches!(
            parse_schedule(expression),
            Err(TaskerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_toggle_running() {
        let scheduler = CronScheduler::new("0 0 0 1 1 *").unwrap();
        scheduler.start(Arc::new(|| {}));
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn manual_scheduler_ticks_only_while_started() {
        let scheduler = ManualScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        assert!(!scheduler.fire());

        let counter = Arc::clone(&ticks);
        scheduler.start(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(scheduler.fire());
        scheduler.stop();
        assert!(!scheduler.fire());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
