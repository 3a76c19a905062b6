use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::AggregationError;

/// Samples are stored in thousandths so that sub-millisecond latencies keep
/// three decimals of resolution.
const SCALE: f64 = 1000.0;
const SIGNIFICANT_DIGITS: u8 = 3;

pub(crate) fn new_default_histogram() -> Histogram<u64> {
    // Auto-resizing: memory stays bounded by the value range, not the sample count.
    match Histogram::<u64>::new(SIGNIFICANT_DIGITS) {
        Ok(h) => h,
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

/// Exact min/max/mean/count, composed with the usual mergeable reductions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Summary {
    pub fn push(&mut self, x: f64) {
        self.count = self.count.saturating_add(1);
        self.sum += x;
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn merge(&mut self, other: &Summary) {
        self.count = self.count.saturating_add(other.count);
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum / self.count as f64)
    }
}

/// Mergeable streaming percentile estimator.
///
/// Percentiles come from an HDR histogram (relative error bounded by the
/// configured significant digits); min, max, mean and count are exact.
#[derive(Debug, Clone)]
pub struct Digest {
    summary: Summary,
    histogram: Histogram<u64>,
}

impl Default for Digest {
    fn default() -> Self {
        Self {
            summary: Summary::default(),
            histogram: new_default_histogram(),
        }
    }
}

impl Digest {
    pub fn record(&mut self, value: f64) -> Result<(), AggregationError> {
        if !value.is_finite() {
            return Err(AggregationError::NonFinite(value));
        }
        if value < 0.0 {
            return Err(AggregationError::Negative(value));
        }

        let scaled = (value * SCALE).round();
        if scaled >= u64::MAX as f64 {
            return Err(AggregationError::Overflow);
        }

        self.histogram
            .record(scaled as u64)
            .map_err(|_| AggregationError::Overflow)?;
        self.summary.push(value);
        Ok(())
    }

    pub fn merge(&mut self, other: &Digest) {
        if other.summary.is_empty() {
            return;
        }
        if let Err(err) = self.histogram.add(&other.histogram) {
            tracing::warn!(error = %err, "failed to merge histogram buckets");
            return;
        }
        self.summary.merge(&other.summary);
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn count(&self) -> u64 {
        self.summary.count()
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
    }

    /// Estimated value at quantile `q` (0..=1), clamped to the exact observed range.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        let (min, max) = (self.summary.min()?, self.summary.max()?);
        let raw = self.histogram.value_at_quantile(q.clamp(0.0, 1.0)) as f64 / SCALE;
        Some(raw.clamp(min, max))
    }

    pub fn to_histogram_report(&self) -> Option<HistogramReport> {
        if self.is_empty() {
            return None;
        }
        let p50 = self.quantile(0.50)?;
        Some(HistogramReport {
            p50,
            p95: self.quantile(0.95)?,
            p99: self.quantile(0.99)?,
            median: p50,
            min: self.summary.min()?,
            max: self.summary.max()?,
            count: self.count(),
        })
    }

    pub fn to_summary_report(&self) -> Option<SummaryReport> {
        Some(SummaryReport {
            min: self.summary.min()?,
            max: self.summary.max()?,
            mean: self.summary.mean()?,
            count: self.count(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryReport {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramReport {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(values: impl IntoIterator<Item = f64>) -> Digest {
        let mut d = Digest::default();
        for v in values {
            if let Err(err) = d.record(v) {
                panic!("record failed: {err}");
            }
        }
        d
    }

    #[test]
    fn empty_digest_has_no_stats() {
        let d = Digest::default();
        assert!(d.is_empty());
        assert!(d.quantile(0.5).is_none());
        assert!(d.to_histogram_report().is_none());
        assert!(d.to_summary_report().is_none());
    }

    #[test]
    fn summary_is_exact() {
        let d = digest_of([10.0, 20.0, 30.0, 0.5]);
        let s = d
            .to_summary_report()
            .unwrap_or_else(|| panic!("expected summary"));
        assert_eq!(s.count, 4);
        assert_eq!(s.min, 0.5);
        assert_eq!(s.max, 30.0);
        assert!((s.mean - 15.125).abs() < 1e-9);
    }

    #[test]
    fn percentiles_are_monotonic_and_within_range() {
        let d = digest_of((1..=1000).map(|v| v as f64 * 1.7));
        let h = d
            .to_histogram_report()
            .unwrap_or_else(|| panic!("expected histogram"));
        assert!(h.min <= h.p50);
        assert!(h.p50 <= h.p95);
        assert!(h.p95 <= h.p99);
        assert!(h.p99 <= h.max);
        assert_eq!(h.median, h.p50);

        // 3 significant digits => within 0.1% of the exact rank value.
        let exact_p95 = 950.0 * 1.7;
        assert!((h.p95 - exact_p95).abs() / exact_p95 < 0.002);
    }

    #[test]
    fn single_sample_percentiles_equal_the_sample() {
        let d = digest_of([42.25]);
        let h = d
            .to_histogram_report()
            .unwrap_or_else(|| panic!("expected histogram"));
        assert_eq!(h.p50, 42.25);
        assert_eq!(h.p99, 42.25);
    }

    #[test]
    fn rejects_negative_and_non_finite_samples() {
        let mut d = Digest::default();
        assert!(matches!(d.record(-1.0), Err(AggregationError::Negative(_))));
        assert!(matches!(
            d.record(f64::NAN),
            Err(AggregationError::NonFinite(_))
        ));
        assert!(d.is_empty());
    }

    #[test]
    fn merge_matches_recording_everything_in_one_digest() {
        let mut a = digest_of([1.0, 2.0, 3.0]);
        let b = digest_of([100.0, 200.0]);
        a.merge(&b);

        let all = digest_of([1.0, 2.0, 3.0, 100.0, 200.0]);
        assert_eq!(a.count(), all.count());
        assert_eq!(a.to_summary_report(), all.to_summary_report());
        assert_eq!(a.to_histogram_report(), all.to_histogram_report());
    }

    #[test]
    fn merging_an_empty_digest_is_identity() {
        let mut a = digest_of([5.0, 6.0]);
        let before = a.to_histogram_report();
        a.merge(&Digest::default());
        assert_eq!(a.to_histogram_report(), before);
    }
}
