//! End-to-end tests for the engine
//!
//! Timing-sensitive tests run on Tokio's paused clock, so sleeps complete
//! instantly and deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use taskgate_engine::{
    CircuitState, Context, ContextError, Engine, EngineConfig, EngineError, EngineEvent,
    EngineStatus, EventSink, ShutdownMode, Task, TaskError,
};

/// Event sink that keeps every event
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<EngineEvent>>>);

impl Recorder {
    fn events(&self) -> Vec<EngineEvent> {
        self.0.lock().clone()
    }
}

impl EventSink for Recorder {
    fn emit(&self, event: &EngineEvent) {
        self.0.lock().push(event.clone());
    }
}

/// Handles for a task that blocks until released
struct Gate {
    started: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

fn gated_task() -> (Task, Gate) {
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let task = Task::new(move |_| async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok(json!("released"))
    });
    (
        task,
        Gate {
            started: started_rx,
            release: release_tx,
        },
    )
}

fn ok_task() -> Task {
    Task::new(|_| async { Ok(json!("ok")) })
}

fn failing_task() -> Task {
    Task::new(|_| async { Err(anyhow::anyhow!("downstream unavailable")) })
}

fn sleeping_task(duration: Duration) -> Task {
    Task::new(move |_| async move {
        tokio::time::sleep(duration).await;
        Ok(json!(duration.as_millis() as u64))
    })
}

/// Config with every gate wide open
fn open_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(4)
        .with_queue_capacity(128)
        .with_rate_limit(1_000_000.0, 1_000_000.0)
        .with_failure_threshold(1_000)
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrency_bounded_by_workers() {
    let engine = Engine::new(open_config().with_workers(3)).unwrap();
    let ctx = Context::background();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let task = Task::new(move |_| async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(null))
        });
        handles.push(engine.submit(&ctx, task).await.unwrap());
    }

    for handle in handles {
        assert!(handle.await.is_success());
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(engine.stats().succeeded, 20);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_circuit_opens_and_recovers() {
    let recorder = Recorder::default();
    let engine = Engine::builder(
        open_config()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_millis(100)),
    )
    .with_event_sink(recorder.clone())
    .build()
    .unwrap();
    let ctx = Context::background();

    for _ in 0..3 {
        let handle = engine.submit(&ctx, failing_task()).await.unwrap();
        assert!(matches!(
            handle.await.error(),
            Some(TaskError::Failed { .. })
        ));
    }
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    // Shed while open
    let err = engine.submit(&ctx, ok_task()).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen));

    tokio::time::advance(Duration::from_millis(100)).await;

    // Exactly one trial while half-open
    let (trial, gate) = gated_task();
    let trial = engine.submit(&ctx, trial).await.unwrap();
    assert_ok!(gate.started.await);
    assert_eq!(engine.circuit_state(), CircuitState::HalfOpen);

    let err = engine.submit(&ctx, ok_task()).await.unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen));

    gate.release.send(()).unwrap();
    assert!(trial.await.is_success());
    assert_eq!(engine.circuit_state(), CircuitState::Closed);

    let handle = engine.submit(&ctx, ok_task()).await.unwrap();
    assert!(handle.await.is_success());

    let transitions: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::CircuitTransition { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    assert_eq!(engine.stats().rejected, 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failed_trial_reopens_circuit() {
    let engine = Engine::new(
        open_config()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    let ctx = Context::background();

    engine.submit(&ctx, failing_task()).await.unwrap().await;
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(100)).await;
    engine.submit(&ctx, failing_task()).await.unwrap().await;
    assert_eq!(engine.circuit_state(), CircuitState::Open);

    // The reset timeout restarts from the failed trial
    tokio::time::advance(Duration::from_millis(50)).await;
    assert_err!(engine.try_submit(ok_task()));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rate_limit_smooths_bursts() {
    let engine = Engine::new(open_config().with_rate_limit(10.0, 10.0)).unwrap();
    let ctx = Context::background();
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..20 {
        handles.push(engine.submit(&ctx, ok_task()).await.unwrap());
    }
    let elapsed = start.elapsed();

    // 10 from the burst, 10 more at 10 per second
    assert!(elapsed >= Duration::from_millis(950), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1200), "elapsed {elapsed:?}");

    for handle in handles {
        assert!(handle.await.is_success());
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_try_submit_throttled() {
    let engine = Engine::new(open_config().with_rate_limit(1.0, 1.0)).unwrap();

    let handle = assert_ok!(engine.try_submit(ok_task()));
    let err = assert_err!(engine.try_submit(ok_task()));
    assert!(matches!(err, EngineError::Throttled));
    assert!(err.is_rejection());

    assert!(handle.await.is_success());
    let stats = engine.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.rejected, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_queue_backpressure() {
    let engine = Engine::new(open_config().with_workers(1).with_queue_capacity(5)).unwrap();
    let ctx = Context::background();

    let (blocker, gate) = gated_task();
    let blocker = engine.submit(&ctx, blocker).await.unwrap();
    gate.started.await.unwrap();

    let mut queued = Vec::new();
    for _ in 0..5 {
        queued.push(engine.submit(&ctx, ok_task()).await.unwrap());
    }
    assert_eq!(engine.stats().queue_depth, 5);

    // Non-blocking submission fails fast
    let err = assert_err!(engine.try_submit(ok_task()));
    assert!(matches!(err, EngineError::QueueFull));

    // Blocking submission gives up when its context ends
    let short = Context::with_timeout(Duration::from_millis(50));
    let err = engine.submit(&short, ok_task()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Context(ContextError::DeadlineExceeded)
    ));
    assert_eq!(engine.stats().queue_depth, 5);

    // Blocking submission proceeds once a slot frees up
    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.submit(&Context::background(), ok_task()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!pending.is_finished());

    gate.release.send(()).unwrap();
    let late = pending.await.unwrap().unwrap();

    assert!(blocker.await.is_success());
    for handle in queued {
        assert!(handle.await.is_success());
    }
    assert!(late.await.is_success());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_graceful_shutdown_drains_every_task() {
    let engine = Engine::new(open_config()).unwrap();
    let ctx = Context::background();

    let mut handles = Vec::new();
    for i in 0..50 {
        let task = sleeping_task(Duration::from_millis(10)).with_id(format!("task-{i}"));
        handles.push(engine.submit(&ctx, task).await.unwrap());
    }

    engine
        .shutdown(&Context::with_timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    let mut seen = HashSet::new();
    for handle in handles {
        let id = handle.id().clone();
        let result = handle.await;
        assert_eq!(result.task_id, id);
        assert!(result.is_success());
        assert!(seen.insert(id));
    }
    assert_eq!(seen.len(), 50);

    let err = engine.submit(&ctx, ok_task()).await.unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));

    let stats = engine.stats();
    assert_eq!(stats.status, EngineStatus::Stopped);
    assert_eq!(stats.submitted, 50);
    assert_eq!(stats.succeeded, 50);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queue_depth, 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_shutdown_timeout_then_abort() {
    let engine = Engine::new(open_config().with_workers(1)).unwrap();
    let ctx = Context::background();

    let (blocked, gate) = gated_task();
    let blocked = engine.submit(&ctx, blocked).await.unwrap();
    gate.started.await.unwrap();
    let queued = engine.submit(&ctx, ok_task()).await.unwrap();

    let err = engine
        .shutdown(&Context::with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShutdownTimeout));
    assert_eq!(engine.stats().status, EngineStatus::Draining);

    let err = engine.submit(&ctx, ok_task()).await.unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));

    engine.shutdown_now().await;

    for handle in [blocked, queued] {
        assert!(matches!(
            handle.await.error(),
            Some(TaskError::PoolShutdown { .. })
        ));
    }
    assert_eq!(engine.stats().status, EngineStatus::Stopped);
    drop(gate.release);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_immediate_shutdown_mode() {
    let recorder = Recorder::default();
    let engine = Engine::builder(
        open_config()
            .with_workers(1)
            .with_shutdown_mode(ShutdownMode::Immediate),
    )
    .with_event_sink(recorder.clone())
    .build()
    .unwrap();
    let ctx = Context::background();

    let (blocked, gate) = gated_task();
    let blocked = engine.submit(&ctx, blocked).await.unwrap();
    gate.started.await.unwrap();
    let queued: Vec<_> = {
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(engine.submit(&ctx, ok_task()).await.unwrap());
        }
        handles
    };

    engine.shutdown(&ctx).await.unwrap();

    assert!(matches!(
        blocked.await.error(),
        Some(TaskError::PoolShutdown { .. })
    ));
    for handle in queued {
        assert!(matches!(
            handle.await.error(),
            Some(TaskError::PoolShutdown { .. })
        ));
    }

    let events = recorder.events();
    assert!(events.contains(&EngineEvent::ShutdownStarted {
        mode: ShutdownMode::Immediate
    }));
    assert_eq!(events.last(), Some(&EngineEvent::ShutdownCompleted));
    assert_eq!(engine.stats().failed, 4);
    drop(gate.release);
}

#[test_log::test(tokio::test)]
async fn test_panic_is_isolated() {
    let engine = Engine::new(open_config().with_workers(1)).unwrap();
    let ctx = Context::background();

    let panicking = engine
        .submit(
            &ctx,
            Task::new(|_| async {
                if true {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }),
        )
        .await
        .unwrap();
    let healthy = engine.submit(&ctx, ok_task()).await.unwrap();

    let result = panicking.await;
    assert!(matches!(
        result.error(),
        Some(TaskError::Panicked { message, .. }) if message == "handler bug"
    ));
    assert!(healthy.await.is_success());

    let stats = engine.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.workers_busy, 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_deadline_overrun_counts_as_failure() {
    let engine = Engine::new(open_config().with_failure_threshold(1)).unwrap();
    let ctx = Context::background();

    let task = sleeping_task(Duration::from_secs(1)).with_timeout(Duration::from_millis(50));
    let result = engine.submit(&ctx, task).await.unwrap().await;

    match result.error() {
        Some(TaskError::DeadlineExceeded { elapsed, .. }) => {
            assert!(*elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");
            assert!(*elapsed < Duration::from_secs(1), "elapsed {elapsed:?}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(engine.circuit_state(), CircuitState::Open);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_deadline_expired_in_queue_never_runs() {
    let engine = Engine::new(open_config().with_workers(1).with_failure_threshold(1)).unwrap();
    let ctx = Context::background();
    let ran = Arc::new(AtomicUsize::new(0));

    let blocker = engine
        .submit(&ctx, sleeping_task(Duration::from_millis(100)))
        .await
        .unwrap();

    let counter = Arc::clone(&ran);
    let expiring = Task::new(move |_| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!(null))
    })
    .with_timeout(Duration::from_millis(50));
    let expiring = engine.submit(&ctx, expiring).await.unwrap();

    assert!(blocker.await.is_success());
    let result = expiring.await;
    assert!(matches!(
        result.error(),
        Some(TaskError::DeadlineExceeded { .. })
    ));
    assert_eq!(result.elapsed, Duration::ZERO);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Never ran, so it says nothing about downstream health
    assert_eq!(engine.circuit_state(), CircuitState::Closed);
}

#[test_log::test(tokio::test)]
async fn test_task_lifecycle_events() {
    let recorder = Recorder::default();
    let engine = Engine::builder(open_config().with_workers(1))
        .with_event_sink(recorder.clone())
        .build()
        .unwrap();
    let ctx = Context::background();

    let handle = engine
        .submit(&ctx, ok_task().with_id("evented"))
        .await
        .unwrap();
    assert!(handle.await.is_success());

    let events: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|event| !matches!(event, EngineEvent::CircuitTransition { .. }))
        .collect();

    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        EngineEvent::TaskAdmitted {
            task_id: "evented".into()
        }
    );
    assert_eq!(
        events[1],
        EngineEvent::TaskStarted {
            task_id: "evented".into(),
            worker: 0
        }
    );
    assert!(matches!(
        &events[2],
        EngineEvent::TaskFinished { task_id, outcome, .. }
            if task_id.as_str() == "evented" && outcome == "succeeded"
    ));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_dropped_engine_drains_admitted_tasks() {
    let engine = Engine::new(open_config().with_workers(2)).unwrap();
    let ctx = Context::background();

    let mut handles = Vec::new();
    for _ in 0..6 {
        handles.push(
            engine
                .submit(&ctx, sleeping_task(Duration::from_millis(10)))
                .await
                .unwrap(),
        );
    }
    drop(engine);

    for handle in handles {
        assert!(handle.await.is_success());
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_exactly_one_result_under_contention() {
    let engine = Engine::new(open_config().with_workers(8).with_queue_capacity(16)).unwrap();

    let mut submitters = Vec::new();
    for s in 0..4 {
        let engine = engine.clone();
        submitters.push(tokio::spawn(async move {
            let ctx = Context::background();
            let mut handles = Vec::new();
            for i in 0..100 {
                let task = Task::new(move |_| async move {
                    tokio::task::yield_now().await;
                    if i % 10 == 0 {
                        anyhow::bail!("every tenth task fails");
                    }
                    Ok(json!(i))
                })
                .with_id(format!("{s}-{i}"));
                handles.push(engine.submit(&ctx, task).await.unwrap());
            }
            handles
        }));
    }

    let mut results = Vec::new();
    for submitter in submitters {
        for handle in submitter.await.unwrap() {
            results.push(handle.await);
        }
    }

    engine.shutdown(&Context::background()).await.unwrap();

    assert_eq!(results.len(), 400);
    let failed = results.iter().filter(|r| !r.is_success()).count();
    assert_eq!(failed, 40);

    let stats = engine.stats();
    assert_eq!(stats.submitted, 400);
    assert_eq!(stats.succeeded + stats.failed, 400);
}
