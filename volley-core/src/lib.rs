mod admission;
mod bus;
mod config;
mod context;
mod coordinator;
mod engine;
mod error;
mod executor;
mod health;
mod hooks;
mod plugin;
mod progress;
mod run;
mod scenario;
mod schedule;
mod worker;

pub use admission::{Admission, AdmissionQueue, AdmissionStats};
pub use bus::{BusEvent, EventBus, Origin, Pattern, Subscription};
pub use config::{
    ConfigDuration, PhaseConfig, RunConfig, ScenarioConfig, ScriptConfig, ShedPolicy,
};
pub use context::{CustomFn, FunctionRegistry, SessionHandle, VuContext};
pub use engine::{Engine, EngineError, EngineRegistry, StepResult};
pub use error::{ConfigError, Error, Result};
pub use executor::{Outcome, OutcomeStatus, error_codes, names};
pub use hooks::{DEFAULT_HOOK_ERROR, FnHook, Hook, HookError, HookRegistry};
pub use plugin::{
    NoCleanup, Plugin, PluginContext, PluginError, PluginFactory, PluginHost, PluginRegistry,
};
pub use progress::{ProgressFn, ProgressUpdate};
pub use run::{Extensions, RunOptions, RunOutcome, run};
pub use scenario::{ScenarioDefinition, ScenarioSet, Step, StepAction};
pub use schedule::{ArrivalEvent, ArrivalSchedule, Arrivals, Phase, PhaseKind};
pub use volley_metrics::{
    AggregateWindow, HistogramReport, IntervalReport, MetricEvent, MetricKind, MetricValue, Report,
    StatsReport, SummaryReport,
};
