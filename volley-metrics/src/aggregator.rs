use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;

use crate::digest::Digest;
use crate::error::AggregationError;
use crate::metrics::{MetricEvent, MetricKind, MetricValue};
use crate::window::AggregateWindow;

/// Single-owner metrics accumulator.
///
/// One aggregator lives inside each worker; it is never shared, so it needs no
/// locking. Interval state is reset on every [`Aggregator::flush`] while the
/// closed window is folded into the cumulative totals.
#[derive(Debug)]
pub struct Aggregator {
    interval_ms: u64,
    current: AggregateWindow,
    cumulative: AggregateWindow,
    kinds: AHashMap<Arc<str>, MetricKind>,
    dropped: u64,
}

impl Aggregator {
    /// `start` is the run start in epoch milliseconds; windows are aligned to it.
    pub fn new(start: u64, interval: Duration) -> Self {
        let interval_ms: u64 = interval.as_millis().try_into().unwrap_or(u64::MAX).max(1);
        Self {
            interval_ms,
            current: AggregateWindow::new(0, start, start.saturating_add(interval_ms)),
            cumulative: AggregateWindow::new(0, start, start),
            kinds: AHashMap::new(),
            dropped: 0,
        }
    }

    pub fn consume(&mut self, event: &MetricEvent) -> Result<(), AggregationError> {
        let got = event.kind();
        let known = match self.kinds.get(event.name.as_ref()) {
            Some(expected) if *expected != got => {
                return Err(AggregationError::KindMismatch {
                    name: event.name.to_string(),
                    expected: *expected,
                    got,
                });
            }
            Some(_) => true,
            None => false,
        };

        match event.value {
            MetricValue::Counter(v) => {
                let cur = self.current.counters.entry(event.name.clone()).or_insert(0);
                *cur = cur.checked_add(v).ok_or(AggregationError::Overflow)?;
            }
            MetricValue::Rate => {
                let cur = self.current.rates.entry(event.name.clone()).or_insert(0);
                *cur = cur.checked_add(1).ok_or(AggregationError::Overflow)?;
            }
            MetricValue::Histogram(v) => match self.current.histograms.get_mut(event.name.as_ref()) {
                Some(digest) => digest.record(v)?,
                None => {
                    let mut digest = Digest::default();
                    digest.record(v)?;
                    self.current.histograms.insert(event.name.clone(), digest);
                }
            },
        }

        // A rejected first sample must not claim the name.
        if !known {
            self.kinds.insert(event.name.clone(), got);
        }
        Ok(())
    }

    /// Like [`Aggregator::consume`], but drops invalid events with a warning.
    pub fn record(&mut self, event: &MetricEvent) {
        if let Err(err) = self.consume(event) {
            self.dropped = self.dropped.saturating_add(1);
            tracing::warn!(metric = %event.name, error = %err, "dropping metric event");
        }
    }

    /// Epoch milliseconds at which the open window is due to close.
    pub fn next_boundary(&self) -> u64 {
        self.current.end
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Close the open window at `end` and open the next one.
    pub fn flush(&mut self, end: u64) -> AggregateWindow {
        let period = self.current.period;
        let start = self.current.start;
        let end = end.max(start);

        let next = AggregateWindow::new(
            period.saturating_add(1),
            end,
            end.saturating_add(self.interval_ms),
        );
        let mut closed = std::mem::replace(&mut self.current, next);
        closed.end = end;

        self.cumulative.merge(&closed);
        closed
    }

    pub fn current(&self) -> &AggregateWindow {
        &self.current
    }

    /// Totals across every flushed window.
    pub fn cumulative(&self) -> &AggregateWindow {
        &self.cumulative
    }

    /// Events rejected by [`Aggregator::record`].
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
