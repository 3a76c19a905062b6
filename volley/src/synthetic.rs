//! A protocol-free engine that simulates request latency and failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use volley_core::{ConfigDuration, Engine, MetricEvent, StepResult, VuContext};

pub(crate) const ENGINE_NAME: &str = "synthetic";
const DEFAULT_ERROR: &str = "ESYNTHETIC";

/// Parameters of the `request` action.
///
/// ```yaml
/// - request: { latency: 20ms, failEvery: 10, code: ETIMEDOUT, capture: lastId }
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RequestParams {
    #[serde(default)]
    latency: Option<ConfigDuration>,
    /// Fail every n-th request across the whole run.
    #[serde(default)]
    fail_every: Option<u64>,
    #[serde(default)]
    code: Option<String>,
    /// Store the request sequence number in this variable.
    #[serde(default)]
    capture: Option<String>,
}

impl RequestParams {
    fn parse(params: &Value) -> Result<Self, String> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let parsed: Self = serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if parsed.fail_every == Some(0) {
            return Err("`failEvery` must be greater than zero".to_string());
        }
        Ok(parsed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SyntheticEngine {
    requests: AtomicU64,
}

impl SyntheticEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Engine for SyntheticEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn actions(&self) -> &[&str] {
        &["request"]
    }

    fn validate(&self, _action: &str, params: &Value) -> Result<(), String> {
        RequestParams::parse(params).map(|_| ())
    }

    async fn step(&self, _action: &str, params: &Value, ctx: &mut VuContext) -> StepResult {
        let params = match RequestParams::parse(&ctx.render_value(params)) {
            Ok(p) => p,
            Err(err) => {
                tracing::debug!(vu = ctx.vu_id, error = %err, "invalid synthetic request");
                return StepResult::failed("EINVAL", Duration::ZERO);
            }
        };

        let seq = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let latency = params.latency.map(|d| d.0).unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(var) = params.capture {
            ctx.set_var(var, seq);
        }

        let ms = latency.as_secs_f64() * 1000.0;
        let failed = params.fail_every.is_some_and(|n| seq % n == 0);

        let base = if failed {
            StepResult::failed(
                params.code.unwrap_or_else(|| DEFAULT_ERROR.to_string()),
                latency,
            )
        } else {
            StepResult::ok(latency)
                .with_event(MetricEvent::counter("synthetic.codes.200", 1))
                .with_event(MetricEvent::histogram("synthetic.response_time", ms))
        };

        base.with_event(MetricEvent::counter("synthetic.requests", 1))
            .with_event(MetricEvent::rate("synthetic.request_rate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use volley_core::FunctionRegistry;

    fn ctx() -> VuContext {
        VuContext::new(1, "s".into(), 0, FunctionRegistry::default())
    }

    #[test]
    fn validate_rejects_bad_params() {
        let engine = SyntheticEngine::new();
        assert!(engine.validate("request", &Value::Null).is_ok());
        assert!(engine.validate("request", &json!({ "latency": "5ms" })).is_ok());
        assert!(engine.validate("request", &json!({ "failEvery": 0 })).is_err());
        assert!(engine.validate("request", &json!({ "latncy": 1 })).is_err());
        assert!(engine.validate("request", &json!({ "latency": "soon" })).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_every_nth_request() {
        let engine = SyntheticEngine::new();
        let mut ctx = ctx();
        let params = json!({ "latency": "10ms", "failEvery": 3, "code": "EBUSY", "capture": "seq" });

        let mut failures = Vec::new();
        for _ in 0..6 {
            let r = engine.step("request", &params, &mut ctx).await;
            assert_eq!(r.elapsed, Duration::from_millis(10));
            if !r.success {
                failures.push(r.error_code.as_deref().map(str::to_string));
            }
        }

        assert_eq!(failures, vec![Some("EBUSY".to_string()); 2]);
        assert_eq!(ctx.var("seq"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn successful_requests_report_response_time() {
        let engine = SyntheticEngine::new();
        let r = engine.step("request", &Value::Null, &mut ctx()).await;
        assert!(r.success);
        let names: Vec<&str> = r.events.iter().map(|e| e.name.as_ref()).collect();
        assert!(names.contains(&"synthetic.response_time"));
        assert!(names.contains(&"synthetic.requests"));
    }
}
