use std::sync::Arc;

use ahash::AHashMap;

use crate::digest::Digest;

/// Statistics of one reporting interval (or of a whole run, once merged).
///
/// Windows are plain values: workers hand them over as immutable snapshots and
/// the coordinator combines them with [`AggregateWindow::merge`], which is
/// commutative and associative for every field.
#[derive(Debug, Clone, Default)]
pub struct AggregateWindow {
    /// Interval index since run start. Windows with the same period describe the same
    /// wall-clock interval on different workers.
    pub period: u64,
    /// Epoch milliseconds.
    pub start: u64,
    /// Epoch milliseconds.
    pub end: u64,
    pub counters: AHashMap<Arc<str>, u64>,
    /// Raw occurrence counts of rate metrics; rates are derived at report time.
    pub rates: AHashMap<Arc<str>, u64>,
    pub histograms: AHashMap<Arc<str>, Digest>,
}

impl AggregateWindow {
    pub fn new(period: u64, start: u64, end: u64) -> Self {
        Self {
            period,
            start,
            end,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.rates.is_empty() && self.histograms.is_empty()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn rate_count(&self, name: &str) -> u64 {
        self.rates.get(name).copied().unwrap_or(0)
    }

    pub fn histogram(&self, name: &str) -> Option<&Digest> {
        self.histograms.get(name)
    }

    /// Length of the window in seconds (never zero).
    pub fn span_secs(&self) -> f64 {
        (self.end.saturating_sub(self.start) as f64 / 1000.0).max(1e-3)
    }

    /// Rate of `name` in events per second over this window.
    pub fn rate(&self, name: &str) -> f64 {
        self.rate_count(name) as f64 / self.span_secs()
    }

    /// Fold `other` into `self`. The time range becomes the union of both ranges.
    pub fn merge(&mut self, other: &AggregateWindow) {
        if self.is_empty() && self.start == 0 && self.end == 0 {
            self.period = other.period;
            self.start = other.start;
            self.end = other.end;
        } else {
            self.period = self.period.min(other.period);
            self.start = self.start.min(other.start);
            self.end = self.end.max(other.end);
        }

        for (name, v) in &other.counters {
            saturating_add(name, self.counters.entry(name.clone()).or_insert(0), *v);
        }
        for (name, v) in &other.rates {
            saturating_add(name, self.rates.entry(name.clone()).or_insert(0), *v);
        }
        for (name, d) in &other.histograms {
            self.histograms.entry(name.clone()).or_default().merge(d);
        }
    }

    /// Pure merge of two snapshots.
    #[must_use]
    pub fn merged(a: &AggregateWindow, b: &AggregateWindow) -> AggregateWindow {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Merge any number of snapshots; `None` when the iterator is empty.
    pub fn merge_all<'a>(
        windows: impl IntoIterator<Item = &'a AggregateWindow>,
    ) -> Option<AggregateWindow> {
        let mut iter = windows.into_iter();
        let mut acc = iter.next()?.clone();
        for w in iter {
            acc.merge(w);
        }
        Some(acc)
    }
}

/// Adds `v` to `cur`, clamping at `u64::MAX`.
fn saturating_add(name: &str, cur: &mut u64, v: u64) {
    match cur.checked_add(v) {
        Some(sum) => *cur = sum,
        None => {
            tracing::warn!(metric = %name, "counter saturated while merging windows");
            *cur = u64::MAX;
        }
    }
}
