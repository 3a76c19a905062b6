pub mod aggregator;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod report;
pub mod window;

pub use aggregator::Aggregator;
pub use digest::{Digest, HistogramReport, Summary, SummaryReport};
pub use error::AggregationError;
pub use metrics::{INTERNAL_NAMESPACE, MetricEvent, MetricKind, MetricValue, Tags, now_millis};
pub use report::{IntervalReport, Report, StatsReport};
pub use window::AggregateWindow;
