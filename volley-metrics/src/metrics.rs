use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;

/// Namespace reserved for process-health metrics emitted by the runner itself.
pub const INTERNAL_NAMESPACE: &str = "artillery_internal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Monotonic increment.
    Counter(u64),
    /// One occurrence; turned into events/second over the window length.
    Rate,
    /// One histogram sample (milliseconds for latencies, raw units otherwise).
    Histogram(f64),
}

impl MetricValue {
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate => MetricKind::Rate,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }
}

// SmallVec to avoid allocation for small tag sets (usually < 4)
pub type Tags = SmallVec<[(Arc<str>, Arc<str>); 4]>;

/// One observation, namespaced as `source.metric`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: Arc<str>,
    pub value: MetricValue,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub tags: Tags,
}

impl MetricEvent {
    pub fn new(name: impl Into<Arc<str>>, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: now_millis(),
            tags: Tags::new(),
        }
    }

    pub fn counter(name: impl Into<Arc<str>>, value: u64) -> Self {
        Self::new(name, MetricValue::Counter(value))
    }

    pub fn rate(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, MetricValue::Rate)
    }

    pub fn histogram(name: impl Into<Arc<str>>, value: f64) -> Self {
        Self::new(name, MetricValue::Histogram(value))
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// The `source` part of `source.metric`, or the whole name when it has no namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.name
            .split_once('.')
            .map_or(self.name.as_ref(), |(ns, _)| ns)
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.namespace() == INTERNAL_NAMESPACE
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}
