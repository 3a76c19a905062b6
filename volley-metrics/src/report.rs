use std::collections::BTreeMap;

use serde::Serialize;

use crate::digest::{HistogramReport, SummaryReport};
use crate::window::AggregateWindow;

/// Derived statistics of one window, in the shape handed to report writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReport {
    pub counters: BTreeMap<String, u64>,
    pub rates: BTreeMap<String, f64>,
    pub summaries: BTreeMap<String, SummaryReport>,
    pub histograms: BTreeMap<String, HistogramReport>,
}

impl StatsReport {
    pub fn from_window(window: &AggregateWindow) -> Self {
        let counters = window
            .counters
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        let rates = window
            .rates
            .keys()
            .map(|k| (k.to_string(), round2(window.rate(k))))
            .collect();

        let mut summaries = BTreeMap::new();
        let mut histograms = BTreeMap::new();
        for (name, digest) in &window.histograms {
            if let Some(s) = digest.to_summary_report() {
                summaries.insert(name.to_string(), s);
            }
            if let Some(h) = digest.to_histogram_report() {
                histograms.insert(name.to_string(), h);
            }
        }

        Self {
            counters,
            rates,
            summaries,
            histograms,
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalReport {
    pub period: u64,
    /// Epoch milliseconds.
    pub start_time: u64,
    /// Epoch milliseconds.
    pub end_time: u64,
    #[serde(flatten)]
    pub stats: StatsReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub intervals: Vec<IntervalReport>,
    pub aggregate: StatsReport,
}

impl Report {
    /// Build the report from merged per-period windows.
    ///
    /// The aggregate is the merge of every interval, so its counters equal the sum of
    /// the interval counters.
    pub fn from_windows(mut windows: Vec<AggregateWindow>) -> Self {
        windows.sort_by_key(|w| w.period);

        let aggregate = AggregateWindow::merge_all(windows.iter())
            .map(|w| StatsReport::from_window(&w))
            .unwrap_or_default();

        let intervals = windows
            .iter()
            .map(|w| IntervalReport {
                period: w.period,
                start_time: w.start,
                end_time: w.end,
                stats: StatsReport::from_window(w),
            })
            .collect();

        Self {
            intervals,
            aggregate,
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.aggregate.counter(name)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
