use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::Value;
use volley_metrics::MetricEvent;

use crate::context::{SessionHandle, VuContext};

/// Result of one engine step.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub success: bool,
    pub elapsed: Duration,
    pub error_code: Option<Arc<str>>,
    /// Engine-specific metrics, e.g. `http.requests` or `http.codes.200`.
    pub events: Vec<MetricEvent>,
}

impl StepResult {
    pub fn ok(elapsed: Duration) -> Self {
        Self {
            success: true,
            elapsed,
            ..Self::default()
        }
    }

    pub fn failed(code: impl Into<Arc<str>>, elapsed: Duration) -> Self {
        Self {
            success: false,
            elapsed,
            error_code: Some(code.into()),
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: MetricEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: Arc<str>,
    pub message: String,
}

impl EngineError {
    pub fn new(code: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A protocol driver that executes scenario steps.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Prefix of the metrics this engine produces, e.g. `http`.
    fn name(&self) -> &str;

    /// Step keys this engine understands.
    fn actions(&self) -> &[&str];

    /// Reject malformed step parameters at load time.
    fn validate(&self, _action: &str, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn create_session(
        &self,
        _ctx: &mut VuContext,
    ) -> Result<Option<SessionHandle>, EngineError> {
        Ok(None)
    }

    async fn close_session(&self, _session: SessionHandle) {}

    async fn step(&self, action: &str, params: &Value, ctx: &mut VuContext) -> StepResult;
}

#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Arc<AHashMap<String, Arc<dyn Engine>>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.engines.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("EngineRegistry")
            .field("engines", &names)
            .finish()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        Arc::make_mut(&mut self.engines).insert(engine.name().to_string(), engine);
    }

    pub fn with(mut self, engine: Arc<dyn Engine>) -> Self {
        self.register(engine);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Engine>> {
        self.engines.get(name)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Resolve a scenario's engine. Without an explicit name, a single registered
    /// engine is used.
    pub fn resolve(&self, name: Option<&str>) -> Option<&Arc<dyn Engine>> {
        match name {
            Some(name) => self.get(name),
            None if self.engines.len() == 1 => self.engines.values().next(),
            None => None,
        }
    }
}
