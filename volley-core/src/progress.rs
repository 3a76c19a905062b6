use std::sync::Arc;
use std::time::Duration;

use volley_metrics::AggregateWindow;

use crate::admission::AdmissionStats;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub elapsed: Duration,
    /// Merged window of every worker for one reporting period.
    pub window: Arc<AggregateWindow>,
    pub stats: AdmissionStats,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;
