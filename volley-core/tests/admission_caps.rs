mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use volley_core::{PluginRegistry, RunConfig, RunOptions, ShedPolicy, run};

use support::MockEngine;

#[tokio::test(start_paused = true)]
async fn phase_max_vusers_queues_instead_of_dropping() -> volley_core::Result<()> {
    let engine = Arc::new(MockEngine::default());
    let ext = support::extensions(engine.clone(), PluginRegistry::new());
    let script = support::simple_script(
        json!([{ "duration": 1, "arrivalRate": 10, "maxVusers": 1 }]),
        json!([{ "sleep": { "ms": 250 } }]),
    );

    let started = tokio::time::Instant::now();
    let outcome = run(script, support::run_config(4), &ext, RunOptions::default()).await?;

    assert_eq!(engine.peak_active.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.report.counter("vusers.created"), 10);
    assert_eq!(outcome.report.counter("vusers.completed"), 10);
    assert_eq!(outcome.report.counter("vusers.dropped"), 0);

    let stats = outcome.stats;
    assert_eq!(stats.peak_active, 1);
    assert!(stats.peak_pending > 0);
    assert_eq!((stats.active, stats.pending, stats.shed), (0, 0, 0));

    // Ten serialized 250ms sessions.
    assert_eq!(started.elapsed(), Duration::from_millis(2500));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bounded_queue_sheds_and_counts_dropped_arrivals() -> volley_core::Result<()> {
    let engine = Arc::new(MockEngine::default());
    let ext = support::extensions(engine.clone(), PluginRegistry::new());
    let script = support::simple_script(
        json!([{ "duration": 1, "arrivalRate": 10 }]),
        json!([{ "sleep": { "ms": 1000 } }]),
    );
    let cfg = RunConfig {
        max_vusers: Some(1),
        queue_depth: Some(2),
        shed_policy: ShedPolicy::DropNewest,
        ..support::run_config(2)
    };

    let outcome = run(script, cfg, &ext, RunOptions::default()).await?;

    assert_eq!(engine.peak_active.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.report.counter("vusers.created"), 3);
    assert_eq!(outcome.report.counter("vusers.dropped"), 7);
    assert_eq!(outcome.stats.shed, 7);
    assert_eq!(outcome.stats.peak_pending, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn run_cap_applies_across_phases() -> volley_core::Result<()> {
    let engine = Arc::new(MockEngine::default());
    let ext = support::extensions(engine.clone(), PluginRegistry::new());
    let script = support::simple_script(
        json!([
            { "duration": 1, "arrivalRate": 4 },
            { "duration": 1, "arrivalRate": 4 }
        ]),
        json!([{ "sleep": { "ms": 600 } }]),
    );
    let cfg = RunConfig {
        max_vusers: Some(2),
        ..support::run_config(2)
    };

    let outcome = run(script, cfg, &ext, RunOptions::default()).await?;
    assert_eq!(engine.peak_active.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.report.counter("vusers.completed"), 8);
    assert_eq!(outcome.stats.peak_active, 2);
    Ok(())
}
