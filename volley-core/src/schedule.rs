use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::config::PhaseConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhaseKind {
    ConstantRate { rate: f64 },
    /// Arrival rate changes linearly from `from` to `to` across the phase.
    Ramp { from: f64, to: f64 },
    /// `count` arrivals spread evenly across the phase.
    FixedCount { count: u64 },
    Pause,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub index: usize,
    pub name: Option<Arc<str>>,
    pub kind: PhaseKind,
    pub duration: Duration,
    /// Cap on concurrently active virtual users started by this phase.
    pub max_vusers: Option<u64>,
}

impl Phase {
    pub fn from_config(index: usize, cfg: &PhaseConfig) -> Result<Self, ConfigError> {
        let has_arrivals =
            cfg.arrival_rate.is_some() || cfg.ramp_to.is_some() || cfg.arrival_count.is_some();

        let (kind, duration) = if let Some(pause) = cfg.pause {
            if has_arrivals {
                return Err(ConfigError::AmbiguousPhase {
                    index,
                    reason: "`pause` cannot be combined with arrival settings",
                });
            }
            (PhaseKind::Pause, pause.0)
        } else {
            let duration = cfg
                .duration
                .map(|d| d.0)
                .ok_or(ConfigError::InvalidDuration { index })?;

            let kind = match (cfg.arrival_rate, cfg.ramp_to, cfg.arrival_count) {
                (None, None, Some(count)) => PhaseKind::FixedCount { count },
                (_, _, Some(_)) => {
                    return Err(ConfigError::AmbiguousPhase {
                        index,
                        reason: "`arrivalCount` cannot be combined with `arrivalRate` or `rampTo`",
                    });
                }
                (from, Some(to), None) => PhaseKind::Ramp {
                    from: from.unwrap_or(0.0),
                    to,
                },
                (Some(rate), None, None) => PhaseKind::ConstantRate { rate },
                (None, None, None) => {
                    return Err(ConfigError::AmbiguousPhase {
                        index,
                        reason: "one of `arrivalRate`, `rampTo`, `arrivalCount` or `pause` is required",
                    });
                }
            };
            (kind, duration)
        };

        let phase = Self {
            index,
            name: cfg.name.as_deref().map(Arc::from),
            kind,
            duration,
            max_vusers: cfg.max_vusers,
        };
        phase.validate()?;
        Ok(phase)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let index = self.index;
        if self.duration.is_zero() {
            return Err(ConfigError::InvalidDuration { index });
        }
        if self.max_vusers == Some(0) {
            return Err(ConfigError::InvalidPhaseMaxVusers { index });
        }

        let valid_rate = |r: f64| r.is_finite() && r >= 0.0;
        match self.kind {
            PhaseKind::ConstantRate { rate } if !valid_rate(rate) => {
                Err(ConfigError::InvalidRate { index })
            }
            PhaseKind::Ramp { from, to } if !valid_rate(from) || !valid_rate(to) => {
                Err(ConfigError::InvalidRate { index })
            }
            PhaseKind::FixedCount { count: 0 } => Err(ConfigError::InvalidArrivalCount { index }),
            _ => Ok(()),
        }
    }

    /// Target arrival rate (per second) at `t` into the phase.
    pub fn rate_at(&self, t: Duration) -> f64 {
        let d = self.duration.as_secs_f64();
        match self.kind {
            PhaseKind::ConstantRate { rate } => rate,
            PhaseKind::Ramp { from, to } => {
                let t = t.as_secs_f64().min(d);
                from + (to - from) * t / d
            }
            PhaseKind::FixedCount { count } => count as f64 / d,
            PhaseKind::Pause => 0.0,
        }
    }

    /// Number of arrivals this phase produces.
    pub fn arrival_count(&self) -> u64 {
        let d = self.duration.as_secs_f64();
        match self.kind {
            PhaseKind::ConstantRate { rate } => (rate * d).round() as u64,
            // Integral of the linear rate over the phase.
            PhaseKind::Ramp { from, to } => ((from + to) / 2.0 * d).round() as u64,
            PhaseKind::FixedCount { count } => count,
            PhaseKind::Pause => 0,
        }
    }

    /// Offset of the `k`-th arrival (0-based) from the start of the phase.
    pub fn offset_of(&self, k: u64) -> Duration {
        match self.kind {
            PhaseKind::ConstantRate { .. } | PhaseKind::FixedCount { .. } => {
                let n = self.arrival_count().max(1) as u128;
                let nanos = self.duration.as_nanos() * k as u128 / n;
                Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
            }
            PhaseKind::Ramp { from, to } => {
                // Invert the cumulative arrival curve
                //   A(t) = from*t + (to-from)*t^2/(2d)
                // at A(t) = k, in a form that stays stable when `from` is zero.
                let d = self.duration.as_secs_f64();
                let a = (to - from) / (2.0 * d);
                let b = from;
                let k = k as f64;
                let disc = (b * b + 4.0 * a * k).max(0.0);
                let denom = b + disc.sqrt();
                let t = if k == 0.0 {
                    0.0
                } else if denom > 0.0 {
                    2.0 * k / denom
                } else {
                    d
                };
                Duration::from_secs_f64(t.clamp(0.0, d))
            }
            PhaseKind::Pause => Duration::ZERO,
        }
    }
}

/// A single virtual-user arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalEvent {
    /// Offset from run start.
    pub at: Duration,
    pub phase: usize,
    /// Run-wide arrival sequence number.
    pub seq: u64,
}

/// The phases of a run laid out back to back.
#[derive(Debug, Clone)]
pub struct ArrivalSchedule {
    phases: Arc<[Phase]>,
    starts: Arc<[Duration]>,
}

impl ArrivalSchedule {
    pub fn new(phases: Vec<Phase>) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        for p in &phases {
            p.validate()?;
        }

        let mut starts = Vec::with_capacity(phases.len());
        let mut acc = Duration::ZERO;
        for p in &phases {
            starts.push(acc);
            acc = acc.saturating_add(p.duration);
        }

        Ok(Self {
            phases: phases.into(),
            starts: starts.into(),
        })
    }

    pub fn from_config(phases: &[PhaseConfig]) -> Result<Self, ConfigError> {
        let phases = phases
            .iter()
            .enumerate()
            .map(|(i, p)| Phase::from_config(i, p))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(phases)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Offset of the phase start from run start.
    pub fn phase_start(&self, index: usize) -> Duration {
        self.starts.get(index).copied().unwrap_or(Duration::ZERO)
    }

    pub fn total_duration(&self) -> Duration {
        match (self.starts.last(), self.phases.last()) {
            (Some(s), Some(p)) => s.saturating_add(p.duration),
            _ => Duration::ZERO,
        }
    }

    pub fn expected_arrivals(&self) -> u64 {
        self.phases.iter().map(Phase::arrival_count).sum()
    }

    /// Lazily enumerate every arrival in time order.
    pub fn arrivals(&self) -> Arrivals {
        Arrivals {
            phases: self.phases.clone(),
            starts: self.starts.clone(),
            phase: 0,
            k: 0,
            seq: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Arrivals {
    phases: Arc<[Phase]>,
    starts: Arc<[Duration]>,
    phase: usize,
    k: u64,
    seq: u64,
}

impl Iterator for Arrivals {
    type Item = ArrivalEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let phase = self.phases.get(self.phase)?;
            if self.k < phase.arrival_count() {
                let start = self.starts.get(self.phase).copied().unwrap_or_default();
                let ev = ArrivalEvent {
                    at: start.saturating_add(phase.offset_of(self.k)),
                    phase: self.phase,
                    seq: self.seq,
                };
                self.k += 1;
                self.seq += 1;
                return Some(ev);
            }
            self.phase += 1;
            self.k = 0;
        }
    }
}

/// Emit arrivals in real time until the schedule is exhausted or `cancel` fires.
///
/// Returns `true` when every phase ran to completion.
pub(crate) async fn drive(
    schedule: ArrivalSchedule,
    started: Instant,
    tx: mpsc::Sender<ArrivalEvent>,
    bus: EventBus,
    cancel: CancellationToken,
) -> bool {
    let mut arrivals = schedule.arrivals().peekable();

    for phase in schedule.phases() {
        let phase_start = started + schedule.phase_start(phase.index);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(phase_start) => {}
        }

        tracing::info!(
            phase = phase.index,
            name = phase.name.as_deref().unwrap_or(""),
            arrivals = phase.arrival_count(),
            duration = ?phase.duration,
            "phase started"
        );
        bus.publish(BusEvent::PhaseStarted {
            index: phase.index,
            name: phase.name.clone(),
        });

        while let Some(arrival) = arrivals.next_if(|a| a.phase == phase.index) {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(started + arrival.at) => {}
            }
            if tx.send(arrival).await.is_err() {
                return false;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(phase_start + phase.duration) => {}
        }

        tracing::info!(phase = phase.index, "phase completed");
        bus.publish(BusEvent::PhaseCompleted {
            index: phase.index,
            name: phase.name.clone(),
        });
    }

    true
}
