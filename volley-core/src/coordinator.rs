use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use volley_metrics::{AggregateWindow, MetricEvent};

use crate::admission::{Admission, AdmissionQueue, AdmissionStats};
use crate::bus::{BusEvent, EventBus, Origin};
use crate::executor::names;
use crate::progress::{ProgressFn, ProgressUpdate};
use crate::schedule::ArrivalEvent;
use crate::worker::{CoordinatorMsg, RunClock, VuJob};

/// Smooth weighted round-robin over scenario weights.
///
/// Deterministic: over any `sum(weights)` consecutive picks every scenario is chosen
/// exactly `weight` times.
#[derive(Debug, Clone)]
pub(crate) struct ScenarioPicker {
    weights: Vec<i64>,
    current: Vec<i64>,
    total: i64,
}

impl ScenarioPicker {
    pub(crate) fn new(weights: impl IntoIterator<Item = u32>) -> Self {
        let weights: Vec<i64> = weights.into_iter().map(i64::from).collect();
        let total = weights.iter().sum();
        Self {
            current: vec![0; weights.len()],
            weights,
            total,
        }
    }

    pub(crate) fn next(&mut self) -> usize {
        let mut best = 0;
        for (i, w) in self.weights.iter().enumerate() {
            self.current[i] += w;
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        if let Some(c) = self.current.get_mut(best) {
            *c -= self.total;
        }
        best
    }
}

/// Combines per-source windows of the same period.
#[derive(Debug)]
pub(crate) struct WindowMerger {
    sources: usize,
    pending: BTreeMap<u64, (AggregateWindow, usize)>,
    complete: Vec<AggregateWindow>,
}

impl WindowMerger {
    pub(crate) fn new(sources: usize) -> Self {
        Self {
            sources: sources.max(1),
            pending: BTreeMap::new(),
            complete: Vec::new(),
        }
    }

    /// Returns the merged window once every source has reported `window.period`.
    pub(crate) fn add(&mut self, window: AggregateWindow) -> Option<AggregateWindow> {
        let period = window.period;
        let (acc, seen) = self
            .pending
            .entry(period)
            .or_insert_with(|| (AggregateWindow::default(), 0));
        acc.merge(&window);
        *seen += 1;

        if *seen < self.sources {
            return None;
        }
        let (merged, _) = self.pending.remove(&period)?;
        self.complete.push(merged.clone());
        Some(merged)
    }

    /// Flush periods that not every source reported (sources that ended early).
    pub(crate) fn finish(&mut self) -> Vec<AggregateWindow> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|(w, _)| {
                self.complete.push(w.clone());
                w
            })
            .collect()
    }

    pub(crate) fn into_windows(self) -> Vec<AggregateWindow> {
        self.complete
    }
}

struct WorkerSlot {
    tx: mpsc::UnboundedSender<VuJob>,
    load: u64,
}

/// Result of the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchSummary {
    pub cancelled: bool,
    pub killed: bool,
    pub discarded: u64,
}

/// Owns admission state and worker selection. Runs as a single task, so nothing here
/// needs locking.
pub(crate) struct Coordinator {
    admission: AdmissionQueue,
    workers: Vec<WorkerSlot>,
    picker: ScenarioPicker,
    next_vu_id: u64,
    merger: WindowMerger,
    bus: EventBus,
    clock: RunClock,
    progress: Option<ProgressFn>,
}

impl Coordinator {
    pub(crate) fn new(
        admission: AdmissionQueue,
        workers: Vec<mpsc::UnboundedSender<VuJob>>,
        picker: ScenarioPicker,
        sources: usize,
        bus: EventBus,
        clock: RunClock,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            admission,
            workers: workers
                .into_iter()
                .map(|tx| WorkerSlot { tx, load: 0 })
                .collect(),
            picker,
            next_vu_id: 1,
            merger: WindowMerger::new(sources),
            bus,
            clock,
            progress,
        }
    }

    pub(crate) fn stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    /// Admit arrivals and track virtual users until the schedule is exhausted and every
    /// started virtual user has finished.
    pub(crate) async fn dispatch(
        &mut self,
        mut arrivals: mpsc::Receiver<ArrivalEvent>,
        msgs: &mut mpsc::UnboundedReceiver<CoordinatorMsg>,
        cancel: CancellationToken,
        kill: CancellationToken,
        grace: Duration,
    ) -> DispatchSummary {
        let mut arrivals_open = true;
        let mut summary = DispatchSummary {
            cancelled: false,
            killed: false,
            discarded: 0,
        };
        let grace_timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(grace_timer);

        loop {
            if !arrivals_open && self.admission.is_idle() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !summary.cancelled => {
                    summary.cancelled = true;
                    arrivals_open = false;
                    arrivals.close();
                    let mut discarded = self.admission.drain_pending().len() as u64;
                    while let Ok(_a) = arrivals.try_recv() {
                        discarded += 1;
                    }
                    summary.discarded = discarded;
                    if discarded > 0 {
                        self.bus.publish_metric(
                            Origin::Core,
                            MetricEvent::counter(names::VUSERS_DROPPED, discarded),
                        );
                    }
                    tracing::warn!(
                        active = self.admission.stats().active,
                        discarded,
                        grace = ?grace,
                        "run cancelled; waiting for in-flight virtual users"
                    );
                    grace_timer.as_mut().reset(tokio::time::Instant::now() + grace);
                }

                _ = &mut grace_timer, if summary.cancelled && !summary.killed => {
                    summary.killed = true;
                    tracing::warn!(
                        active = self.admission.stats().active,
                        "grace period elapsed; terminating in-flight virtual users"
                    );
                    kill.cancel();
                }

                msg = msgs.recv() => match msg {
                    Some(msg) => self.on_message(msg),
                    None => {
                        tracing::error!("all workers stopped unexpectedly");
                        break;
                    }
                },

                arrival = arrivals.recv(), if arrivals_open => match arrival {
                    Some(arrival) => self.on_arrival(arrival),
                    None => arrivals_open = false,
                },
            }
        }

        summary
    }

    fn on_arrival(&mut self, arrival: ArrivalEvent) {
        match self.admission.admit(arrival) {
            Admission::Accepted(a) => self.start(a),
            Admission::Queued => {
                tracing::trace!(seq = arrival.seq, "arrival queued");
            }
            Admission::Shed(dropped) => {
                let shed = self.admission.stats().shed;
                if shed == 1 || shed % 1000 == 0 {
                    tracing::warn!(
                        seq = dropped.seq,
                        shed,
                        "admission queue full; shedding arrivals"
                    );
                }
                self.bus.publish_metric(
                    Origin::Core,
                    MetricEvent::counter(names::VUSERS_DROPPED, 1),
                );
            }
        }
    }

    pub(crate) fn on_message(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::VuFinished {
                worker,
                phase,
                outcome,
            } => {
                tracing::trace!(
                    worker,
                    status = %outcome.status,
                    elapsed = ?outcome.elapsed,
                    "virtual user finished"
                );
                if let Some(slot) = self.workers.get_mut(worker) {
                    slot.load = slot.load.saturating_sub(1);
                }
                self.admission.release(phase);
                while let Some(next) = self.admission.next_ready() {
                    self.start(next);
                }
            }
            CoordinatorMsg::Window { source, window } => {
                tracing::trace!(source, period = window.period, "window received");
                if let Some(merged) = self.merger.add(window) {
                    self.publish_window(merged);
                }
            }
        }
    }

    /// Capacity is already reserved for `arrival`.
    fn start(&mut self, arrival: ArrivalEvent) {
        let Some(worker) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.tx.is_closed())
            .min_by_key(|(_, w)| w.load)
            .map(|(i, _)| i)
        else {
            tracing::error!(seq = arrival.seq, "no worker available");
            self.admission.release(arrival.phase);
            return;
        };

        let job = VuJob {
            vu_id: self.next_vu_id,
            scenario: self.picker.next(),
            phase: arrival.phase,
        };
        self.next_vu_id += 1;

        let slot = &mut self.workers[worker];
        if slot.tx.send(job).is_err() {
            tracing::error!(worker, vu_id = job.vu_id, "worker is gone");
            self.admission.release(arrival.phase);
            return;
        }
        slot.load += 1;
    }

    fn publish_window(&mut self, window: AggregateWindow) {
        let window = Arc::new(window);
        self.bus.publish(BusEvent::Stats(window.clone()));
        if let Some(progress) = &self.progress {
            progress(ProgressUpdate {
                elapsed: self.clock.elapsed(),
                window,
                stats: self.admission.stats(),
            });
        }
    }

    /// Stop handing out work; workers exit once their virtual users finish.
    pub(crate) fn close_workers(&mut self) {
        self.workers.clear();
    }

    /// Publish periods that not every source reported and return all merged windows.
    pub(crate) fn finish(mut self) -> Vec<AggregateWindow> {
        for w in self.merger.finish() {
            self.publish_window(w);
        }
        self.merger.into_windows()
    }
}
