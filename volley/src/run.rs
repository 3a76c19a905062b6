use std::sync::Arc;

use anyhow::Context as _;
use volley_core::{
    EngineRegistry, Extensions, PluginRegistry, RunConfig, RunOptions, RunOutcome, names,
};

use crate::cli::RunArgs;
use crate::exit_codes::ExitCode;
use crate::output;
use crate::run_error::RunError;
use crate::script::load_script;
use crate::synthetic::SyntheticEngine;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let out = output::formatter(args.output);

    let script = load_script(&args.script)
        .await
        .map_err(RunError::InvalidInput)?;
    let cfg = run_config(&args);
    let ext = extensions();

    let opts = RunOptions {
        progress: out.progress(),
        ..RunOptions::default()
    };

    // First Ctrl-C starts a graceful stop; the run still reports what it collected.
    let cancel = opts.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping new arrivals");
            cancel.cancel();
        }
    });

    out.print_header(&args.script, &script);
    let result = volley_core::run(script, cfg, &ext, opts).await;
    ctrl_c.abort();

    let outcome = result?;
    out.print_summary(&outcome)
        .context("failed to print summary")
        .map_err(RunError::RuntimeError)?;

    Ok(exit_code(&outcome))
}

fn run_config(args: &RunArgs) -> RunConfig {
    let mut cfg = RunConfig::default();
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if args.max_vusers.is_some() {
        cfg.max_vusers = args.max_vusers;
    }
    if let Some(interval) = args.flush_interval {
        cfg.flush_interval = interval;
    }
    if let Some(grace) = args.grace {
        cfg.grace = grace;
    }
    cfg
}

fn extensions() -> Extensions {
    Extensions {
        engines: EngineRegistry::new().with(Arc::new(SyntheticEngine::new())),
        plugins: PluginRegistry::new(),
    }
}

fn exit_code(outcome: &RunOutcome) -> ExitCode {
    ExitCode::from_failed_vusers(outcome.report.counter(names::VUSERS_FAILED))
}
