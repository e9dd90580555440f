// Synthetic load command

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::Args;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use taskgate_engine::{
    Context, Engine, EngineError, EngineEvent, EngineStats, Task, TaskHandle,
};

use crate::commands::EngineArgs;
use crate::output::{OutputFormat, Report, Sheet};

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Number of tasks to submit
    #[arg(long, default_value = "100")]
    pub tasks: u64,

    /// Probability that a task body returns an error
    #[arg(long, default_value = "0.0")]
    pub failure_rate: f64,

    /// Probability that a task body panics
    #[arg(long, default_value = "0.0")]
    pub panic_rate: f64,

    /// Simulated downstream latency per task in milliseconds
    #[arg(long, default_value = "10")]
    pub latency_ms: u64,

    /// Random extra latency up to this many milliseconds
    #[arg(long, default_value = "0")]
    pub jitter_ms: u64,

    /// Per-task deadline in milliseconds (0 disables)
    #[arg(long, default_value = "0")]
    pub task_timeout_ms: u64,

    /// Longest a single submission may wait for admission
    #[arg(long, default_value = "5000")]
    pub submit_timeout_ms: u64,

    /// Longest graceful shutdown may take before work is abandoned
    #[arg(long, default_value = "10000")]
    pub shutdown_timeout_ms: u64,
}

/// What one synthetic task will do
struct Plan {
    latency: Duration,
    fail: bool,
    panic: bool,
}

impl LoadArgs {
    fn plan(&self, rng: &mut impl Rng) -> Plan {
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        let roll: f64 = rng.gen();
        Plan {
            latency: Duration::from_millis(self.latency_ms + jitter),
            panic: roll < self.panic_rate,
            fail: roll >= self.panic_rate && roll < self.panic_rate + self.failure_rate,
        }
    }
}

/// Run report
#[derive(Debug, Serialize)]
struct RunSummary {
    tasks: u64,
    admitted: u64,
    rejected: BTreeMap<String, u64>,
    outcomes: BTreeMap<String, u64>,
    circuit_transitions: u64,
    wall_time_ms: u64,
    throughput_per_sec: f64,
    interrupted: bool,
    stats: EngineStats,
    #[serde(skip)]
    quiet: bool,
}

impl Report for RunSummary {
    fn text(&self, sheet: &mut Sheet) {
        sheet
            .field("Tasks", self.tasks)
            .field("Admitted", self.admitted)
            .field("Rejected", self.rejected.values().sum::<u64>())
            .field("Wall time", format!("{}ms", self.wall_time_ms))
            .field(
                "Throughput",
                format!("{:.1} tasks/s", self.throughput_per_sec),
            )
            .field(
                "Circuit",
                format!(
                    "{} ({} transitions)",
                    self.stats.circuit_state, self.circuit_transitions
                ),
            );
        if self.interrupted {
            sheet.field("Interrupted", "yes");
        }

        if !self.quiet {
            sheet
                .counts("Outcomes", &self.outcomes)
                .counts("Rejections", &self.rejected);
        }
    }
}

pub async fn run(
    load: &LoadArgs,
    engine_args: &EngineArgs,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    for (name, rate) in [("failure", load.failure_rate), ("panic", load.panic_rate)] {
        if !(0.0..=1.0).contains(&rate) {
            anyhow::bail!("--{name}-rate must be between 0 and 1, got {rate}");
        }
    }

    let config = engine_args.resolve();
    let shutdown_mode = config.shutdown_mode;

    let transitions = Arc::new(AtomicU64::new(0));
    let engine = {
        let transitions = Arc::clone(&transitions);
        Engine::builder(config)
            .with_name("taskgate-run")
            .with_event_sink(move |event: &EngineEvent| {
                if let EngineEvent::CircuitTransition { from, to } = event {
                    transitions.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(%from, %to, "Circuit transition");
                }
            })
            .build()
            .context("Failed to start engine")?
    };

    tracing::info!(
        tasks = load.tasks,
        failure_rate = load.failure_rate,
        panic_rate = load.panic_rate,
        latency_ms = load.latency_ms,
        %shutdown_mode,
        "Starting synthetic load"
    );

    // Ctrl-C stops submission; admitted tasks still get a result
    let root = Context::background();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
                root.cancel();
            }
        });
    }

    let started = Instant::now();
    let mut handles: Vec<TaskHandle> = Vec::new();
    let mut rejected: BTreeMap<String, u64> = BTreeMap::new();

    for i in 0..load.tasks {
        if root.is_done() {
            break;
        }

        let plan = load.plan(&mut rand::thread_rng());
        let mut task = synthetic_task(plan).with_id(format!("task-{i}"));
        if load.task_timeout_ms > 0 {
            task = task.with_timeout(Duration::from_millis(load.task_timeout_ms));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(load.submit_timeout_ms);
        let ctx = root.child_with_deadline(deadline);

        match engine.submit(&ctx, task).await {
            Ok(handle) => handles.push(handle),
            Err(EngineError::Context(_)) if root.is_done() => break,
            Err(e) => *rejected.entry(e.kind().to_string()).or_default() += 1,
        }
    }
    let interrupted = root.is_done();

    let admitted = handles.len() as u64;
    let mut outcomes: BTreeMap<String, u64> = BTreeMap::new();
    for handle in handles {
        let result = handle.await;
        let kind = match result.error() {
            None => "succeeded",
            Some(e) => e.kind(),
        };
        *outcomes.entry(kind.to_string()).or_default() += 1;
    }
    let wall_time = started.elapsed();

    let shutdown_ctx = Context::with_timeout(Duration::from_millis(load.shutdown_timeout_ms));
    if let Err(e) = engine.shutdown(&shutdown_ctx).await {
        tracing::warn!(error = %e, "Graceful shutdown incomplete; abandoning remaining work");
        engine.shutdown_now().await;
    }

    let summary = RunSummary {
        tasks: load.tasks,
        admitted,
        rejected,
        outcomes,
        circuit_transitions: transitions.load(Ordering::Relaxed),
        wall_time_ms: wall_time.as_millis() as u64,
        throughput_per_sec: admitted as f64 / wall_time.as_secs_f64().max(f64::EPSILON),
        interrupted,
        stats: engine.stats(),
        quiet,
    };

    output.print(&summary)
}

fn synthetic_task(plan: Plan) -> Task {
    Task::new(move |ctx: Context| async move {
        tokio::select! {
            _ = tokio::time::sleep(plan.latency) => {}
            err = ctx.done() => anyhow::bail!("interrupted: {err}"),
        }

        if plan.panic {
            panic!("synthetic panic");
        }
        if plan.fail {
            anyhow::bail!("synthetic downstream failure");
        }
        Ok(json!({ "latency_ms": plan.latency.as_millis() as u64 }))
    })
}
