use crate::plugin::PluginError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no engine registered for `{0}`")]
    NoEngine(String),

    #[error("plugin `{0}` is not registered")]
    UnknownPlugin(String),

    #[error("plugin `{name}` failed to initialize: {source}")]
    PluginInit {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Problems found while validating a script or run configuration.
///
/// All of these are detected before any virtual user starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one phase is required")]
    NoPhases,

    #[error("phase {index}: `duration` must be a positive duration")]
    InvalidDuration { index: usize },

    #[error("phase {index}: arrival rates must be finite and non-negative")]
    InvalidRate { index: usize },

    #[error("phase {index}: `arrivalCount` must be a positive integer")]
    InvalidArrivalCount { index: usize },

    #[error("phase {index}: `maxVusers` must be a positive integer")]
    InvalidPhaseMaxVusers { index: usize },

    #[error("phase {index}: {reason}")]
    AmbiguousPhase { index: usize, reason: &'static str },

    #[error("at least one scenario is required")]
    NoScenarios,

    #[error("scenario weights must add up to a positive number")]
    NoScenarioWeight,

    #[error("scenario `{scenario}`: engine `{engine}` has no action `{action}`")]
    UnknownAction {
        scenario: String,
        engine: String,
        action: String,
    },

    #[error("scenario `{scenario}`: invalid step: {reason}")]
    InvalidStep { scenario: String, reason: String },

    #[error("scenario `{scenario}`: function `{name}` is not registered")]
    UnknownFunction { scenario: String, name: String },

    #[error("`workers` must be a positive integer")]
    InvalidWorkers,

    #[error("`maxVusers` must be a positive integer")]
    InvalidMaxVusers,

    #[error("`flush_interval` must be a positive duration")]
    InvalidFlushInterval,

    #[error("`step_timeout` must be a positive duration")]
    InvalidStepTimeout,

    #[error("`bus_capacity` must be a positive integer")]
    InvalidBusCapacity,
}
