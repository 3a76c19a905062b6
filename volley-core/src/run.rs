use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use volley_metrics::Report;

use crate::admission::{AdmissionQueue, AdmissionStats};
use crate::bus::{BusEvent, EventBus};
use crate::config::{RunConfig, ScriptConfig};
use crate::coordinator::{Coordinator, ScenarioPicker};
use crate::engine::EngineRegistry;
use crate::error::Result;
use crate::executor::{Emitter, ExecutorSettings, VuExecutor};
use crate::health::sample_process_health;
use crate::plugin::{PluginHost, PluginRegistry};
use crate::progress::ProgressFn;
use crate::scenario::ScenarioSet;
use crate::schedule::{ArrivalSchedule, drive};
use crate::worker::{RunClock, aggregator_task, worker_loop};

/// Engines and plugins available to a run.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub engines: EngineRegistry,
    pub plugins: PluginRegistry,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: Report,
    pub cancelled: bool,
    pub stats: AdmissionStats,
}

/// Optional inputs of [`run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
    /// Observe the run's bus from outside, e.g. for a live console.
    pub bus: Option<EventBus>,
}

/// Execute a load script to completion (or cancellation) and return its report.
///
/// Configuration errors are returned before any virtual user starts. Plugins that were
/// initialized are always cleaned up, including when the run fails or is cancelled.
pub async fn run(
    script: ScriptConfig,
    cfg: RunConfig,
    ext: &Extensions,
    opts: RunOptions,
) -> Result<RunOutcome> {
    cfg.validate()?;
    let schedule = ArrivalSchedule::from_config(&script.phases)?;
    let mut scenarios = ScenarioSet::from_config(&script.scenarios, &ext.engines)?;
    scenarios.variables = script.variables;

    let bus = opts
        .bus
        .clone()
        .unwrap_or_else(|| EventBus::new(cfg.bus_capacity));

    let mut host =
        PluginHost::load(&ext.plugins, &script.plugins, &mut scenarios, &bus, &cfg).await?;

    if let Err(err) = scenarios.validate(&ext.engines) {
        host.cleanup(cfg.plugin_cleanup_grace).await;
        return Err(err);
    }

    tracing::info!(
        phases = schedule.phases().len(),
        expected_arrivals = schedule.expected_arrivals(),
        duration = ?schedule.total_duration(),
        scenarios = scenarios.scenarios.len(),
        workers = cfg.workers,
        plugins = ?host.names(),
        "starting run"
    );

    let result = execute(schedule, Arc::new(scenarios), &ext.engines, &bus, &cfg, opts).await;
    host.cleanup(cfg.plugin_cleanup_grace).await;

    if let Ok(outcome) = &result {
        tracing::info!(
            cancelled = outcome.cancelled,
            created = outcome.report.counter("vusers.created"),
            completed = outcome.report.counter("vusers.completed"),
            failed = outcome.report.counter("vusers.failed"),
            "run finished"
        );
    }
    result
}

async fn execute(
    schedule: ArrivalSchedule,
    scenarios: Arc<ScenarioSet>,
    engines: &EngineRegistry,
    bus: &EventBus,
    cfg: &RunConfig,
    opts: RunOptions,
) -> Result<RunOutcome> {
    let clock = RunClock::start();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let kill = CancellationToken::new();
    let settings = ExecutorSettings {
        step_timeout: cfg.step_timeout,
        scenario_timeout: cfg.scenario_timeout,
    };

    let mut job_senders = Vec::with_capacity(cfg.workers);
    let mut worker_handles = Vec::with_capacity(cfg.workers);
    let mut aggregator_handles = Vec::with_capacity(cfg.workers + 1);

    for id in 0..cfg.workers {
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        aggregator_handles.push(tokio::spawn(aggregator_task(
            id,
            metrics_rx,
            clock,
            cfg.flush_interval,
            msg_tx.clone(),
            stop.clone(),
        )));

        let executor = Arc::new(VuExecutor::new(
            scenarios.clone(),
            engines.clone(),
            Emitter::new(id, metrics_tx, bus.clone()),
            settings,
            kill.clone(),
        ));
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        job_senders.push(job_tx);
        worker_handles.push(tokio::spawn(worker_loop(id, job_rx, executor, msg_tx.clone())));
    }

    // Core collector: metrics published on the bus by the engine and by plugins.
    aggregator_handles.push(tokio::spawn(aggregator_task(
        cfg.workers,
        bus.tap_metrics(),
        clock,
        cfg.flush_interval,
        msg_tx.clone(),
        stop.clone(),
    )));
    drop(msg_tx);

    let health = cfg
        .process_health_interval
        .map(|every| tokio::spawn(sample_process_health(bus.clone(), every, stop.clone())));

    let phase_caps = schedule.phases().iter().map(|p| p.max_vusers).collect();
    let admission = AdmissionQueue::new(cfg.max_vusers, phase_caps, cfg.queue_depth, cfg.shed_policy);
    let picker = ScenarioPicker::new(scenarios.scenarios.iter().map(|s| s.weight));

    let (arrival_tx, arrival_rx) = mpsc::channel(1024);
    let scheduler = tokio::spawn(drive(
        schedule,
        clock.started,
        arrival_tx,
        bus.clone(),
        opts.cancel.clone(),
    ));

    let mut coordinator = Coordinator::new(
        admission,
        job_senders,
        picker,
        cfg.workers + 1,
        bus.clone(),
        clock,
        opts.progress.clone(),
    );
    let summary = coordinator
        .dispatch(arrival_rx, &mut msg_rx, opts.cancel.clone(), kill, cfg.grace)
        .await;

    coordinator.close_workers();
    for handle in worker_handles {
        handle.await?;
    }
    let completed = scheduler.await?;

    stop.cancel();
    if let Some(health) = health {
        health.await?;
    }
    while let Some(msg) = msg_rx.recv().await {
        coordinator.on_message(msg);
    }
    for handle in aggregator_handles {
        handle.await?;
    }

    let stats = coordinator.stats();
    let windows = coordinator.finish();
    bus.publish(BusEvent::Done);

    tracing::debug!(
        scheduler_completed = completed,
        killed = summary.killed,
        discarded = summary.discarded,
        shed = stats.shed,
        peak_active = stats.peak_active,
        bus_dropped = bus.dropped(),
        "run drained"
    );

    Ok(RunOutcome {
        report: Report::from_windows(windows),
        cancelled: summary.cancelled,
        stats,
    })
}
