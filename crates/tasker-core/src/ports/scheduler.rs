//! Scheduler port - cron などの外部スケジューラ
//!
//! The engine only needs ticks plus start/stop; parsing the schedule is the
//! implementation's business.

use std::sync::Arc;

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

pub trait Scheduler: Send + Sync {
    /// Begin (or resume) delivering ticks to `tick`.
    fn start(&self, tick: TickFn);

    /// Stop delivering ticks. Idempotent.
    fn stop(&self);

    fn is_running(&self) -> bool;
}
