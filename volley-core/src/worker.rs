use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use volley_metrics::{AggregateWindow, Aggregator, MetricEvent, now_millis};

use crate::executor::{Outcome, VuExecutor};

/// Run start, both as a monotonic instant and as epoch milliseconds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunClock {
    pub started: Instant,
    pub epoch_ms: u64,
}

impl RunClock {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            epoch_ms: now_millis(),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn now_millis(&self) -> u64 {
        let elapsed: u64 = self.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VuJob {
    pub vu_id: u64,
    pub scenario: usize,
    pub phase: usize,
}

#[derive(Debug)]
pub(crate) enum CoordinatorMsg {
    VuFinished {
        worker: usize,
        phase: usize,
        outcome: Outcome,
    },
    Window {
        source: usize,
        window: AggregateWindow,
    },
}

/// Accept jobs until the coordinator hangs up, then wait for in-flight virtual users.
pub(crate) async fn worker_loop(
    id: usize,
    mut jobs: mpsc::UnboundedReceiver<VuJob>,
    executor: Arc<VuExecutor>,
    out: mpsc::UnboundedSender<CoordinatorMsg>,
) {
    let mut running: JoinSet<(usize, Outcome)> = JoinSet::new();
    let report = |res: Result<(usize, Outcome), tokio::task::JoinError>| match res {
        Ok((phase, outcome)) => {
            let _ = out.send(CoordinatorMsg::VuFinished {
                worker: id,
                phase,
                outcome,
            });
        }
        Err(err) => tracing::error!(worker = id, error = %err, "virtual user supervisor failed"),
    };

    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let executor = executor.clone();
                running.spawn(async move {
                    let vu = {
                        let executor = executor.clone();
                        tokio::spawn(async move { executor.execute(job.vu_id, job.scenario).await })
                    };
                    let outcome = match vu.await {
                        Ok(outcome) => outcome,
                        Err(_) => executor.crashed(job.vu_id),
                    };
                    (job.phase, outcome)
                });
            }
            Some(res) = running.join_next(), if !running.is_empty() => report(res),
        }
    }

    while let Some(res) = running.join_next().await {
        report(res);
    }
    tracing::debug!(worker = id, "worker drained");
}

/// Own one [`Aggregator`], flushing a window to the coordinator on every interval
/// boundary and a final partial window when `stop` fires or the feed closes.
pub(crate) async fn aggregator_task(
    source: usize,
    mut rx: mpsc::UnboundedReceiver<MetricEvent>,
    clock: RunClock,
    interval: Duration,
    out: mpsc::UnboundedSender<CoordinatorMsg>,
    stop: CancellationToken,
) {
    let mut aggregator = Aggregator::new(clock.epoch_ms, interval);
    let mut tick = tokio::time::interval_at(clock.started + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => aggregator.record(&ev),
                None => break,
            },
            _ = tick.tick() => {
                let end = aggregator.next_boundary();
                let window = aggregator.flush(end);
                let _ = out.send(CoordinatorMsg::Window { source, window });
            }
            _ = stop.cancelled() => {
                while let Ok(ev) = rx.try_recv() {
                    aggregator.record(&ev);
                }
                break;
            }
        }
    }

    let window = aggregator.flush(clock.now_millis());
    if aggregator.dropped() > 0 {
        tracing::warn!(source, dropped = aggregator.dropped(), "invalid metric events were dropped");
    }
    let _ = out.send(CoordinatorMsg::Window { source, window });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn aggregator_flushes_on_interval_and_on_stop() {
        let clock = RunClock::start();
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let task = tokio::spawn(aggregator_task(
            3,
            rx,
            clock,
            Duration::from_secs(1),
            out_tx,
            stop.clone(),
        ));

        let _ = tx.send(MetricEvent::counter("a.b", 1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let _ = tx.send(MetricEvent::counter("a.b", 2));
        stop.cancel();
        let _ = task.await;

        let mut windows = Vec::new();
        while let Some(CoordinatorMsg::Window { source, window }) = out_rx.recv().await {
            assert_eq!(source, 3);
            windows.push(window);
        }
        assert_eq!(windows.len(), 2);
        assert_eq!((windows[0].period, windows[0].counter("a.b")), (0, 1));
        assert_eq!(windows[0].end - windows[0].start, 1000);
        assert_eq!((windows[1].period, windows[1].counter("a.b")), (1, 2));
        assert_eq!(windows[1].end - windows[1].start, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregator_finishes_when_feed_closes() {
        let clock = RunClock::start();
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(aggregator_task(
            0,
            rx,
            clock,
            Duration::from_secs(10),
            out_tx,
            CancellationToken::new(),
        ));

        let _ = tx.send(MetricEvent::histogram("x.t", 4.0));
        drop(tx);
        let _ = task.await;

        match out_rx.recv().await {
            Some(CoordinatorMsg::Window { window, .. }) => {
                assert_eq!(window.histogram("x.t").map(|d| d.count()), Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out_rx.recv().await.is_none());
    }
}
