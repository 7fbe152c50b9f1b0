use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;
use serde_json::{Map, Value, json};

use tasker_core::app::DataApi;
use tasker_core::domain::{Control, TaskRunState, TaskStatus, TaskerError};
use tasker_core::impls::{ManualScheduler, memory_data_api};
use tasker_core::Task;
use tasker_core::ports::Scheduler;

/// Record every status emission the task makes.
fn record_statuses<L: Send + 'static>(task: &Task<L>) -> Arc<Mutex<Vec<TaskStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    // dropping the handle keeps the listener attached
    let _ = task.on_status(move |s| sink.lock().push(s.clone()));
    seen
}

/// State transitions across the recorded emissions. Panics if two
/// consecutive emissions carry the same snapshot.
fn transitions(seen: &Mutex<Vec<TaskStatus>>) -> Vec<TaskRunState> {
    let seen = seen.lock();
    assert!(
        seen.windows(2).all(|w| w[0] != w[1]),
        "identical snapshot emitted twice: {seen:?}"
    );
    let mut states: Vec<TaskRunState> = seen.iter().map(|s| s.state).collect();
    states.dedup();
    states
}

fn doubler() -> Arc<DataApi> {
    DataApi::builder("calc")
        .source("double", |_, params| async move {
            let n: i64 = serde_json::from_value(params)?;
            Ok(json!(n * 2))
        })
        .build()
}

#[tokio::test]
async fn one_off_run_passes_local_state_between_steps() {
    let store = memory_data_api("store", Map::new());
    let task = Task::<i64>::builder("pipeline")
        .source(doubler())
        .target(Arc::clone(&store))
        .step("set", |ctx| async move {
            ctx.with_state(|local| *local = 3);
            Ok(Control::Next)
        })
        .step("double", |ctx| async move {
            let doubled: i64 = ctx.get_from_source_as("calc", "double", ctx.state()).await?;
            ctx.with_state(|local| *local = doubled);
            Ok(Control::Next)
        })
        .step("send", |ctx| async move {
            let value = ctx.state();
            ctx.send_to_target("store", "set", json!({"key": "out", "value": value}))
                .await?;
            Ok(Control::Next)
        })
        .build()
        .unwrap();
    let seen = record_statuses(&task);

    task.execute().await;
    tokio::task::yield_now().await;

    assert_eq!(
        transitions(&seen),
        vec![TaskRunState::Ready, TaskRunState::Running, TaskRunState::Ready]
    );
    assert_eq!(seen.lock().last(), Some(&task.status()));
    assert_eq!(store.call_source_api("get", json!("out")).await.unwrap(), json!(6));
    let status = task.status();
    assert!(status.last_executed.is_some());
    assert_eq!(status.current_step, None);
}

#[tokio::test]
async fn finish_marks_a_one_off_task_completed() {
    let task = Task::<()>::builder("finisher")
        .step("done", |_| async { Ok(Control::Finish) })
        .step("never", |_| async { Err(TaskerError::operation("ran after Finish")) })
        .build()
        .unwrap();

    task.execute().await;

    assert_eq!(task.status().state, TaskRunState::Completed);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn retry_reruns_the_step_and_resets_per_run(#[case] k: u32) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let after = Arc::clone(&seen);
    let task = Task::<()>::builder("retrying")
        .step("flaky", move |ctx| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(ctx.retries());
                Ok(if ctx.retries() < k { Control::Retry } else { Control::Next })
            }
        })
        .step("after", move |ctx| {
            let sink = Arc::clone(&after);
            async move {
                sink.lock().push(100 + ctx.retries());
                Ok(Control::Next)
            }
        })
        .build()
        .unwrap();

    task.execute().await;
    let mut first: Vec<u32> = (0..=k).collect();
    first.push(100);
    assert_eq!(*seen.lock(), first);

    seen.lock().clear();
    task.execute().await;
    assert_eq!(*seen.lock(), first, "retry counter starts at zero on each run");
}

#[tokio::test]
async fn abort_skips_remaining_steps_without_error() {
    let later = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later);
    let task = Task::<()>::builder("aborting")
        .step("check", |_| async { Ok(Control::Abort) })
        .step("later", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Control::Next) }
        })
        .build()
        .unwrap();

    task.execute().await;

    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(task.status().state, TaskRunState::Ready);
}

#[tokio::test]
async fn schedule_and_interval_are_rejected() {
    let err = Task::<()>::builder("both")
        .schedule("*/5 * * * *")
        .interval(Duration::from_secs(1))
        .build()
        .unwrap_err();
    assert!(matches!(err, TaskerError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn continue_uses_the_shorter_interval() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::<()>::builder("paged")
        .interval(Duration::from_secs(60))
        .continue_interval(Duration::from_secs(1))
        .step("page", move |_| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if run == 0 { Control::Continue } else { Control::Next }) }
        })
        .build()
        .unwrap();

    task.execute().await;
    assert_eq!(task.status().state, TaskRunState::Scheduled);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2, "a plain run waits the full interval");

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    task.shutdown();
}

#[tokio::test(start_paused = true)]
async fn continue_without_continue_interval_waits_the_interval() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::<()>::builder("paged")
        .interval(Duration::from_secs(60))
        .step("page", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Control::Continue) }
        })
        .build()
        .unwrap();

    task.execute().await;
    assert_eq!(task.status().state, TaskRunState::Scheduled);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    task.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failed_run_stays_scheduled_for_the_next_interval() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::<()>::builder("failing")
        .interval(Duration::from_secs(60))
        .step("call", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskerError::operation("upstream down")) }
        })
        .build()
        .unwrap();

    task.execute().await;
    let status = task.status();
    assert_eq!(status.state, TaskRunState::Error);
    assert_eq!(status.error_message.as_deref(), Some("upstream down"));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(task.status().state, TaskRunState::Error);

    task.shutdown();
}

#[tokio::test(start_paused = true)]
async fn force_start_after_force_stop_rearms_the_interval() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::<()>::builder("resumable")
        .interval(Duration::from_secs(60))
        .step("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Control::Next) }
        })
        .build()
        .unwrap();

    task.execute().await;
    task.force_stop();
    assert_eq!(task.status().state, TaskRunState::Stopped);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "stopped tasks are not rescheduled");

    task.force_start().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(task.status().state, TaskRunState::Scheduled);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    task.shutdown();
}

#[tokio::test(start_paused = true)]
async fn force_stop_cancels_a_pending_wait() {
    let task = Task::<()>::builder("sleepy")
        .step("wait", |ctx| async move {
            ctx.wait_for(tokio::time::sleep(Duration::from_secs(3_600))).await?;
            Ok(Control::Next)
        })
        .build()
        .unwrap();

    let seen = record_statuses(&task);

    let running = {
        let task = task.clone();
        tokio::spawn(async move { task.execute().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(task.status().state, TaskRunState::Running);

    task.force_stop();
    assert_eq!(task.status().state, TaskRunState::Stopping);

    running.await.unwrap();
    tokio::task::yield_now().await;
    let status = task.status();
    assert_eq!(status.state, TaskRunState::Stopped);
    assert_eq!(status.error_message, None);

    let states = transitions(&seen);
    assert!(!states.contains(&TaskRunState::Error), "{states:?}");
    assert_eq!(states.last(), Some(&TaskRunState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn force_start_while_stopping_does_not_revive_the_run() {
    let later = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later);
    let task = Task::<()>::builder("stubborn")
        .step("wait", |ctx| async move {
            ctx.wait_for(tokio::time::sleep(Duration::from_secs(3_600))).await?;
            Ok(Control::Next)
        })
        .step("later", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Control::Next) }
        })
        .build()
        .unwrap();

    let running = {
        let task = task.clone();
        tokio::spawn(async move { task.execute().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    task.force_stop();
    task.force_start().await;
    assert_eq!(task.status().state, TaskRunState::Stopping);

    running.await.unwrap();
    assert_eq!(later.load(Ordering::SeqCst), 0);
    let status = task.status();
    assert_eq!(status.state, TaskRunState::Stopped);
    assert_eq!(status.error_message, None);
}

#[tokio::test]
async fn transient_errors_retry_the_whole_task() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let task = Task::<()>::builder("flaky")
        .retry(2)
        .step("call", move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(TaskerError::operation("upstream unavailable"))
                } else {
                    Ok(Control::Next)
                }
            }
        })
        .build()
        .unwrap();

    task.execute().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let status = task.status();
    assert_eq!(status.state, TaskRunState::Ready);
    assert_eq!(status.error_message, None);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let task = Task::<()>::builder("misconfigured")
        .retry(5)
        .step("call", move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                ctx.get_from_source("missing", "op", Value::Null).await?;
                Ok(Control::Next)
            }
        })
        .build()
        .unwrap();

    task.execute().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let status = task.status();
    assert_eq!(status.state, TaskRunState::Error);
    assert!(status.last_error.is_some());
    assert_eq!(
        status.error_message.as_deref(),
        Some("source 'missing' is not defined")
    );
}

#[tokio::test]
async fn cron_ticks_run_the_task() {
    let scheduler = ManualScheduler::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = Task::<()>::builder("cron")
        .scheduler(scheduler.clone())
        .step("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Control::Next) }
        })
        .build()
        .unwrap();

    assert!(!scheduler.fire(), "no ticks before register");
    task.register(tracing::Span::none());
    assert!(scheduler.is_running());

    assert!(scheduler.fire());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(task.status().state, TaskRunState::Scheduled);

    task.force_stop();
    assert!(!scheduler.fire());
    assert_eq!(task.status().state, TaskRunState::Stopped);

    task.force_start().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(scheduler.is_running());

    assert!(scheduler.fire());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    task.shutdown();
}
