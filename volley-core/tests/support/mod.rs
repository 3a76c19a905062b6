#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use volley_core::{
    Engine, EngineRegistry, Extensions, MetricEvent, PluginRegistry, RunConfig, ScriptConfig,
    StepResult, VuContext,
};

/// In-memory engine for run tests.
///
/// Actions: `ok`, `fail` (code `EBAD`), `sleep` (`{ ms }`), `render` (`{ template, expect }`).
#[derive(Default)]
pub struct MockEngine {
    pub active: AtomicU64,
    pub peak_active: AtomicU64,
    pub workers: Mutex<Vec<usize>>,
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn actions(&self) -> &[&str] {
        &["ok", "fail", "sleep", "render"]
    }

    async fn step(&self, action: &str, params: &Value, ctx: &mut VuContext) -> StepResult {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        self.workers.lock().push(ctx.worker);

        let result = match action {
            "ok" => StepResult::ok(Duration::from_millis(2))
                .with_event(MetricEvent::counter("mock.requests", 1)),
            "fail" => StepResult::failed("EBAD", Duration::from_millis(1)),
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                StepResult::ok(Duration::from_millis(ms))
            }
            "render" => {
                let template = params.get("template").and_then(Value::as_str).unwrap_or("");
                let expect = params.get("expect").and_then(Value::as_str).unwrap_or("");
                if ctx.render(template) == expect {
                    StepResult::ok(Duration::ZERO)
                } else {
                    StepResult::failed("EMISMATCH", Duration::ZERO)
                }
            }
            _ => StepResult::failed("EUNKNOWN", Duration::ZERO),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn extensions(engine: Arc<MockEngine>, plugins: PluginRegistry) -> Extensions {
    Extensions {
        engines: EngineRegistry::new().with(engine),
        plugins,
    }
}

pub fn script(value: Value) -> ScriptConfig {
    serde_json::from_value(value).unwrap_or_else(|e| panic!("invalid script: {e}"))
}

/// A single scenario running `flow` under `phases`.
pub fn simple_script(phases: Value, flow: Value) -> ScriptConfig {
    script(json!({
        "phases": phases,
        "scenarios": [{ "name": "main", "flow": flow }]
    }))
}

pub fn run_config(workers: usize) -> RunConfig {
    RunConfig {
        workers,
        ..RunConfig::default()
    }
}
