use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load script as parsed from YAML/JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,

    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,

    /// Plugin name -> plugin options. `optional: true` turns load failures into warnings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, serde_json::Value>,

    /// Initial variables of every virtual user.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<ConfigDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_rate: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_to: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_count: Option<u64>,

    /// A pause phase; the value is its duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<ConfigDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vusers: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,

    #[serde(default)]
    pub flow: Vec<serde_json::Value>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub before_scenario: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub after_scenario: Vec<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// A duration written either as a number of seconds or as a humantime string (`"1m30s"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDuration(pub Duration);

impl From<Duration> for ConfigDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Self {
        value.0
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a number of seconds or a duration string like \"10s\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ConfigDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(ConfigDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Duration::try_from_secs_f64(v)
                    .map(ConfigDuration)
                    .map_err(|_| E::custom("duration must be a non-negative, finite number"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(ConfigDuration(d))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// What to do with an arrival when the admission queue is full.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ShedPolicy {
    /// Discard the arrival that does not fit.
    #[default]
    DropNewest,
    /// Discard the longest-waiting arrival to make room.
    DropOldest,
}

/// Engine-level settings that are not part of the load script.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workers: usize,
    /// Run-wide cap on concurrently active virtual users.
    pub max_vusers: Option<u64>,
    /// Bound on arrivals waiting for capacity; `None` means unbounded.
    pub queue_depth: Option<usize>,
    pub shed_policy: ShedPolicy,
    pub flush_interval: Duration,
    pub step_timeout: Duration,
    pub scenario_timeout: Option<Duration>,
    /// How long in-flight virtual users may keep running after cancellation.
    pub grace: Duration,
    pub plugin_cleanup_grace: Duration,
    pub bus_capacity: usize,
    pub process_health_interval: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_vusers: None,
            queue_depth: None,
            shed_policy: ShedPolicy::default(),
            flush_interval: Duration::from_secs(10),
            step_timeout: Duration::from_secs(120),
            scenario_timeout: None,
            grace: Duration::from_secs(30),
            plugin_cleanup_grace: Duration::from_secs(30),
            bus_capacity: 1024,
            process_health_interval: None,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        if self.max_vusers == Some(0) {
            return Err(ConfigError::InvalidMaxVusers);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidFlushInterval);
        }
        if self.step_timeout.is_zero() {
            return Err(ConfigError::InvalidStepTimeout);
        }
        if self.bus_capacity == 0 {
            return Err(ConfigError::InvalidBusCapacity);
        }
        Ok(())
    }
}
