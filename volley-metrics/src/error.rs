use crate::metrics::MetricKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("metric `{name}` is a {expected}, got a {got} sample")]
    KindMismatch {
        name: String,
        expected: MetricKind,
        got: MetricKind,
    },

    #[error("histogram sample must not be negative (got {0})")]
    Negative(f64),

    #[error("histogram sample must be finite (got {0})")]
    NonFinite(f64),

    #[error("value overflows the metric's storage")]
    Overflow,
}
