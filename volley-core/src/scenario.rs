use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::{ConfigDuration, ScenarioConfig};
use crate::context::FunctionRegistry;
use crate::engine::{Engine, EngineRegistry};
use crate::error::{ConfigError, Error};
use crate::hooks::HookRegistry;

/// Step keys that modify a step rather than name its action.
const MODIFIERS: &[&str] = &["nonFatal", "timeout", "count"];

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Think(Duration),
    Log(String),
    /// Call a registered processor function.
    Function(String),
    Loop { count: u64, steps: Vec<Step> },
    Engine { action: Arc<str>, params: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub action: StepAction,
    /// A failing non-fatal step is recorded but does not end the scenario.
    pub non_fatal: bool,
    pub timeout: Option<Duration>,
}

impl Step {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            non_fatal: false,
            timeout: None,
        }
    }

    pub fn engine(action: &str, params: Value) -> Self {
        Self::new(StepAction::Engine {
            action: Arc::from(action),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioDefinition {
    pub name: Arc<str>,
    pub engine: Arc<str>,
    pub weight: u32,
    pub flow: Vec<Step>,
    pub before_scenario: Vec<String>,
    pub after_scenario: Vec<String>,
}

impl ScenarioDefinition {
    pub fn from_config(
        index: usize,
        cfg: &ScenarioConfig,
        engines: &EngineRegistry,
    ) -> Result<Self, Error> {
        let name: Arc<str> = match &cfg.name {
            Some(n) => Arc::from(n.as_str()),
            None => Arc::from(format!("scenario {index}")),
        };

        let engine = engines.resolve(cfg.engine.as_deref()).ok_or_else(|| {
            Error::NoEngine(
                cfg.engine
                    .clone()
                    .unwrap_or_else(|| format!("<unspecified> in scenario `{name}`")),
            )
        })?;

        let flow = cfg
            .flow
            .iter()
            .map(|v| parse_step(&name, engine.as_ref(), v))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            engine: Arc::from(engine.name()),
            name,
            weight: cfg.weight.unwrap_or(1),
            flow,
            before_scenario: cfg.before_scenario.clone(),
            after_scenario: cfg.after_scenario.clone(),
        })
    }
}

fn invalid(scenario: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidStep {
        scenario: scenario.to_string(),
        reason: reason.into(),
    }
}

fn parse_duration(scenario: &str, key: &str, v: &Value) -> Result<Duration, ConfigError> {
    serde_json::from_value::<ConfigDuration>(v.clone())
        .map(Duration::from)
        .map_err(|err| invalid(scenario, format!("`{key}`: {err}")))
}

fn parse_step(scenario: &str, engine: &dyn Engine, v: &Value) -> Result<Step, ConfigError> {
    let Value::Object(map) = v else {
        return Err(invalid(scenario, "a step must be a mapping"));
    };

    let mut keys = map.keys().filter(|k| !MODIFIERS.contains(&k.as_str()));
    let key = match (keys.next(), keys.next()) {
        (Some(k), None) => k.as_str(),
        (None, _) => return Err(invalid(scenario, "a step needs an action")),
        (Some(a), Some(b)) => {
            return Err(invalid(scenario, format!("a step has one action, got `{a}` and `{b}`")));
        }
    };
    let body = &map[key];
    if key != "loop" && map.contains_key("count") {
        return Err(invalid(scenario, format!("`count` only applies to `loop`, not `{key}`")));
    }

    let action = match key {
        "think" => StepAction::Think(parse_duration(scenario, key, body)?),
        "log" => StepAction::Log(
            body.as_str()
                .ok_or_else(|| invalid(scenario, "`log` takes a string"))?
                .to_string(),
        ),
        "function" => StepAction::Function(
            body.as_str()
                .ok_or_else(|| invalid(scenario, "`function` takes a function name"))?
                .to_string(),
        ),
        "loop" => {
            let Value::Array(items) = body else {
                return Err(invalid(scenario, "`loop` takes a list of steps"));
            };
            let count = map
                .get("count")
                .and_then(Value::as_u64)
                .filter(|c| *c > 0)
                .ok_or_else(|| invalid(scenario, "`loop` needs a positive `count`"))?;
            let steps = items
                .iter()
                .map(|s| parse_step(scenario, engine, s))
                .collect::<Result<Vec<_>, _>>()?;
            StepAction::Loop { count, steps }
        }
        action => {
            if !engine.actions().contains(&action) {
                return Err(ConfigError::UnknownAction {
                    scenario: scenario.to_string(),
                    engine: engine.name().to_string(),
                    action: action.to_string(),
                });
            }
            engine
                .validate(action, body)
                .map_err(|reason| invalid(scenario, format!("`{action}`: {reason}")))?;
            StepAction::Engine {
                action: Arc::from(action),
                params: body.clone(),
            }
        }
    };

    let non_fatal = map.get("nonFatal").and_then(Value::as_bool).unwrap_or(false);
    let timeout = map
        .get("timeout")
        .map(|t| parse_duration(scenario, "timeout", t))
        .transpose()?;

    Ok(Step {
        action,
        non_fatal,
        timeout,
    })
}

/// Everything virtual users execute.
///
/// Plugins may change the set while they initialize; afterwards it is frozen behind an
/// `Arc` and shared read-only by all workers.
#[derive(Debug, Clone, Default)]
pub struct ScenarioSet {
    pub scenarios: Vec<ScenarioDefinition>,
    pub hooks: HookRegistry,
    pub functions: FunctionRegistry,
    /// Initial variables of every virtual user.
    pub variables: serde_json::Map<String, Value>,
}

impl ScenarioSet {
    pub fn from_config(cfgs: &[ScenarioConfig], engines: &EngineRegistry) -> Result<Self, Error> {
        let scenarios = cfgs
            .iter()
            .enumerate()
            .map(|(i, c)| ScenarioDefinition::from_config(i, c, engines))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            scenarios,
            ..Self::default()
        })
    }

    /// Add `hook` to the `beforeScenario` list of every scenario.
    pub fn add_before_scenario(&mut self, hook: &str) {
        for s in &mut self.scenarios {
            s.before_scenario.push(hook.to_string());
        }
    }

    pub fn add_after_scenario(&mut self, hook: &str) {
        for s in &mut self.scenarios {
            s.after_scenario.push(hook.to_string());
        }
    }

    /// Final check before the run starts: engines, hooks and function steps must resolve.
    pub fn validate(&self, engines: &EngineRegistry) -> Result<(), Error> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios.into());
        }
        if self.scenarios.iter().all(|s| s.weight == 0) {
            return Err(ConfigError::NoScenarioWeight.into());
        }

        for s in &self.scenarios {
            if engines.get(&s.engine).is_none() {
                return Err(Error::NoEngine(s.engine.to_string()));
            }
            let unknown = |name: &String| ConfigError::UnknownFunction {
                scenario: s.name.to_string(),
                name: name.clone(),
            };
            for h in s.before_scenario.iter().chain(&s.after_scenario) {
                if !self.hooks.contains(h) {
                    return Err(unknown(h).into());
                }
            }
            let mut functions = Vec::new();
            collect_functions(&s.flow, &mut functions);
            for f in functions {
                if !self.hooks.contains(f) {
                    return Err(unknown(f).into());
                }
            }
        }
        Ok(())
    }
}

fn collect_functions<'a>(steps: &'a [Step], out: &mut Vec<&'a String>) {
    for step in steps {
        match &step.action {
            StepAction::Function(name) => out.push(name),
            StepAction::Loop { steps, .. } => collect_functions(steps, out),
            _ => {}
        }
    }
}
