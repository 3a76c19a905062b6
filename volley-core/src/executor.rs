use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volley_metrics::MetricEvent;

use crate::bus::{BusEvent, EventBus, Origin};
use crate::context::VuContext;
use crate::engine::{Engine, EngineRegistry, StepResult};
use crate::scenario::{ScenarioDefinition, ScenarioSet, Step, StepAction};

pub mod error_codes {
    pub const ETIMEDOUT: &str = "ETIMEDOUT";
    pub const ESCENARIOTIMEOUT: &str = "ESCENARIOTIMEOUT";
    pub const ECANCELLED: &str = "ECANCELLED";
    pub const ENOENGINE: &str = "ENOENGINE";
    pub const EFUNCTION: &str = "EFUNCTION";
    pub const ECRASHED: &str = "ECRASHED";
    pub const ESTEP: &str = "ESTEP";
}

pub mod names {
    pub const VUSERS_CREATED: &str = "vusers.created";
    pub const VUSERS_CREATED_BY_NAME: &str = "vusers.created_by_name.";
    pub const VUSERS_COMPLETED: &str = "vusers.completed";
    pub const VUSERS_FAILED: &str = "vusers.failed";
    pub const VUSERS_SESSION_LENGTH: &str = "vusers.session_length";
    pub const VUSERS_DROPPED: &str = "vusers.dropped";
    pub const ERRORS: &str = "errors.";
    pub const STEP_TIME: &str = "step_time";
}

/// Time a killed virtual user gets for `afterScenario` hooks and session close.
pub(crate) const KILLED_TEARDOWN_LIMIT: Duration = Duration::from_secs(1);

/// Metric sink of one worker.
///
/// Events always reach the worker's aggregator; they are mirrored on the bus only
/// when somebody listens for them.
#[derive(Clone)]
pub(crate) struct Emitter {
    worker: usize,
    tx: mpsc::UnboundedSender<MetricEvent>,
    bus: EventBus,
}

impl Emitter {
    pub(crate) fn new(worker: usize, tx: mpsc::UnboundedSender<MetricEvent>, bus: EventBus) -> Self {
        Self { worker, tx, bus }
    }

    pub(crate) fn worker(&self) -> usize {
        self.worker
    }

    pub(crate) fn emit(&self, event: MetricEvent) {
        if self.bus.wants(&event.name) {
            self.bus.publish_metric(Origin::Worker(self.worker), event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub(crate) fn counter(&self, name: impl Into<Arc<str>>, value: u64) {
        self.emit(MetricEvent::counter(name, value));
    }

    pub(crate) fn histogram(&self, name: impl Into<Arc<str>>, value: f64) {
        self.emit(MetricEvent::histogram(name, value));
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub elapsed: Duration,
    pub error_code: Option<Arc<str>>,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecutorSettings {
    pub step_timeout: Duration,
    pub scenario_timeout: Option<Duration>,
}

/// Why a virtual user stopped early. `counted` is set when the matching
/// `errors.<code>` counter was already emitted by the failing step.
struct Failure {
    code: Arc<str>,
    counted: bool,
}

impl Failure {
    fn new(code: &str) -> Self {
        Self {
            code: Arc::from(code),
            counted: false,
        }
    }
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Failure>> + Send + 'a>>;

/// Runs one virtual user through its scenario, emitting lifecycle and step metrics.
pub(crate) struct VuExecutor {
    scenarios: Arc<ScenarioSet>,
    engines: EngineRegistry,
    emitter: Emitter,
    settings: ExecutorSettings,
    kill: CancellationToken,
}

impl VuExecutor {
    pub(crate) fn new(
        scenarios: Arc<ScenarioSet>,
        engines: EngineRegistry,
        emitter: Emitter,
        settings: ExecutorSettings,
        kill: CancellationToken,
    ) -> Self {
        Self {
            scenarios,
            engines,
            emitter,
            settings,
            kill,
        }
    }

    /// Build a fresh context for `vu_id` and run scenario number `scenario`.
    pub(crate) async fn execute(&self, vu_id: u64, scenario: usize) -> Outcome {
        let Some(def) = self.scenarios.scenarios.get(scenario) else {
            tracing::error!(vu_id, scenario, "scenario index out of range");
            return Outcome {
                status: OutcomeStatus::Failed,
                elapsed: Duration::ZERO,
                error_code: Some(Arc::from(error_codes::ENOENGINE)),
            };
        };

        let mut ctx = VuContext::new(
            vu_id,
            def.name.clone(),
            self.emitter.worker(),
            self.scenarios.functions.clone(),
        )
        .with_vars(self.scenarios.variables.clone());

        self.run(def, &mut ctx).await
    }

    pub(crate) async fn run(&self, scenario: &ScenarioDefinition, ctx: &mut VuContext) -> Outcome {
        let started = Instant::now();
        self.emitter.counter(names::VUSERS_CREATED, 1);
        self.emitter
            .counter(format!("{}{}", names::VUSERS_CREATED_BY_NAME, scenario.name), 1);

        let result = match self.engines.get(&scenario.engine).cloned() {
            None => Err(Failure::new(error_codes::ENOENGINE)),
            Some(engine) => {
                let body = self.run_body(engine.as_ref(), scenario, ctx);
                let limited = async {
                    match self.settings.scenario_timeout {
                        Some(limit) => tokio::time::timeout(limit, body)
                            .await
                            .unwrap_or_else(|_| Err(Failure::new(error_codes::ESCENARIOTIMEOUT))),
                        None => body.await,
                    }
                };

                let result = tokio::select! {
                    biased;
                    _ = self.kill.cancelled() => Err(Failure::new(error_codes::ECANCELLED)),
                    r = limited => r,
                };

                self.teardown(engine.as_ref(), scenario, ctx).await;
                result
            }
        };

        let elapsed = started.elapsed();
        let outcome = match result {
            Ok(()) => {
                self.emitter.counter(names::VUSERS_COMPLETED, 1);
                Outcome {
                    status: OutcomeStatus::Completed,
                    elapsed,
                    error_code: None,
                }
            }
            Err(failure) => {
                if !failure.counted {
                    self.emitter
                        .counter(format!("{}{}", names::ERRORS, failure.code), 1);
                }
                self.emitter.counter(names::VUSERS_FAILED, 1);
                tracing::debug!(
                    vu_id = ctx.vu_id,
                    scenario = %scenario.name,
                    code = %failure.code,
                    "virtual user failed"
                );
                self.emitter.bus().publish(BusEvent::VuFailed {
                    vu_id: ctx.vu_id,
                    scenario: scenario.name.clone(),
                    code: failure.code.clone(),
                });
                Outcome {
                    status: OutcomeStatus::Failed,
                    elapsed,
                    error_code: Some(failure.code),
                }
            }
        };

        self.emitter
            .histogram(names::VUSERS_SESSION_LENGTH, duration_ms(elapsed));
        outcome
    }

    /// Record a virtual user whose task panicked.
    pub(crate) fn crashed(&self, vu_id: u64) -> Outcome {
        tracing::error!(vu_id, "virtual user task panicked");
        self.emitter
            .counter(format!("{}{}", names::ERRORS, error_codes::ECRASHED), 1);
        self.emitter.counter(names::VUSERS_FAILED, 1);
        Outcome {
            status: OutcomeStatus::Failed,
            elapsed: Duration::ZERO,
            error_code: Some(Arc::from(error_codes::ECRASHED)),
        }
    }

    async fn run_body(
        &self,
        engine: &dyn Engine,
        scenario: &ScenarioDefinition,
        ctx: &mut VuContext,
    ) -> Result<(), Failure> {
        match engine.create_session(ctx).await {
            Ok(Some(session)) => ctx.set_session(session),
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(vu_id = ctx.vu_id, error = %err, "session setup failed");
                return Err(Failure {
                    code: err.code,
                    counted: false,
                });
            }
        }

        for name in &scenario.before_scenario {
            self.call_hook(name, ctx).await?;
        }

        self.run_steps(engine, &scenario.flow, ctx).await
    }

    /// Run `afterScenario` hooks and close the session.
    ///
    /// Once the kill token fires, whatever is left gets [`KILLED_TEARDOWN_LIMIT`].
    async fn teardown(&self, engine: &dyn Engine, scenario: &ScenarioDefinition, ctx: &mut VuContext) {
        let work = async {
            self.run_after_hooks(scenario, ctx).await;
            if let Some(session) = ctx.take_session() {
                engine.close_session(session).await;
            }
        };
        tokio::pin!(work);

        let finished = tokio::select! {
            biased;
            () = &mut work => true,
            () = self.kill.cancelled() => false,
        };
        if !finished && tokio::time::timeout(KILLED_TEARDOWN_LIMIT, &mut work).await.is_err() {
            tracing::warn!(
                scenario = %scenario.name,
                limit = ?KILLED_TEARDOWN_LIMIT,
                "abandoning afterScenario hooks and session close of a killed virtual user"
            );
        }
    }

    /// `afterScenario` hooks always run; their failures are logged only.
    async fn run_after_hooks(&self, scenario: &ScenarioDefinition, ctx: &mut VuContext) {
        for name in &scenario.after_scenario {
            let call = self.call_hook(name, ctx);
            match tokio::time::timeout(self.settings.step_timeout, call).await {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    tracing::warn!(hook = %name, code = %failure.code, "afterScenario hook failed");
                }
                Err(_) => tracing::warn!(hook = %name, "afterScenario hook timed out"),
            }
        }
    }

    async fn call_hook(&self, name: &str, ctx: &mut VuContext) -> Result<(), Failure> {
        let Some(hook) = self.scenarios.hooks.get(name) else {
            return Err(Failure::new(error_codes::EFUNCTION));
        };
        hook.call(ctx).await.map_err(|err| {
            tracing::debug!(hook = name, error = %err, "hook failed");
            Failure {
                code: err.code,
                counted: false,
            }
        })
    }

    fn run_steps<'a>(
        &'a self,
        engine: &'a dyn Engine,
        steps: &'a [Step],
        ctx: &'a mut VuContext,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            for step in steps {
                match self.run_step(engine, step, ctx).await {
                    Ok(()) => {}
                    Err(failure) if step.non_fatal => {
                        if !failure.counted {
                            self.emitter
                                .counter(format!("{}{}", names::ERRORS, failure.code), 1);
                        }
                        tracing::debug!(code = %failure.code, "non-fatal step failed");
                    }
                    Err(failure) => return Err(failure),
                }
            }
            Ok(())
        })
    }

    async fn run_step(
        &self,
        engine: &dyn Engine,
        step: &Step,
        ctx: &mut VuContext,
    ) -> Result<(), Failure> {
        match &step.action {
            StepAction::Think(d) => {
                tokio::time::sleep(*d).await;
                Ok(())
            }
            StepAction::Log(msg) => {
                tracing::info!(vu_id = ctx.vu_id, scenario = %ctx.scenario, "{}", ctx.render(msg));
                Ok(())
            }
            StepAction::Function(name) => {
                let limit = step.timeout.unwrap_or(self.settings.step_timeout);
                match tokio::time::timeout(limit, self.call_hook(name, ctx)).await {
                    Ok(r) => r,
                    Err(_) => Err(Failure::new(error_codes::ETIMEDOUT)),
                }
            }
            StepAction::Loop { count, steps } => {
                for i in 0..*count {
                    ctx.set_var("$loopCount", i);
                    self.run_steps(engine, steps, ctx).await?;
                }
                Ok(())
            }
            StepAction::Engine { action, params } => {
                let limit = step.timeout.unwrap_or(self.settings.step_timeout);
                let t0 = Instant::now();
                let result = match tokio::time::timeout(limit, engine.step(action, params, ctx)).await
                {
                    Ok(r) => r,
                    Err(_) => StepResult::failed(error_codes::ETIMEDOUT, t0.elapsed()),
                };
                self.record_step(engine.name(), result)
            }
        }
    }

    fn record_step(&self, engine: &str, result: StepResult) -> Result<(), Failure> {
        for ev in result.events {
            self.emitter.emit(ev);
        }
        self.emitter.histogram(
            format!("{engine}.{}", names::STEP_TIME),
            duration_ms(result.elapsed),
        );

        if result.success {
            return Ok(());
        }

        let code = result
            .error_code
            .unwrap_or_else(|| Arc::from(error_codes::ESTEP));
        self.emitter.counter(format!("{}{code}", names::ERRORS), 1);
        Err(Failure {
            code,
            counted: true,
        })
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
