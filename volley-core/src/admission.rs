use std::collections::VecDeque;

use crate::config::ShedPolicy;
use crate::schedule::ArrivalEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Capacity was reserved; the arrival may start now.
    Accepted(ArrivalEvent),
    /// Waiting for capacity.
    Queued,
    /// Discarded; may be an older queued arrival under [`ShedPolicy::DropOldest`].
    Shed(ArrivalEvent),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub active: u64,
    pub peak_active: u64,
    pub pending: u64,
    pub peak_pending: u64,
    pub accepted: u64,
    pub shed: u64,
}

/// Concurrency caps and the FIFO of arrivals waiting for them.
///
/// Owned by the coordinator task only.
#[derive(Debug)]
pub struct AdmissionQueue {
    max_active: Option<u64>,
    phase_caps: Vec<Option<u64>>,
    active_by_phase: Vec<u64>,
    pending: VecDeque<ArrivalEvent>,
    queue_depth: Option<usize>,
    policy: ShedPolicy,
    stats: AdmissionStats,
}

impl AdmissionQueue {
    pub fn new(
        max_active: Option<u64>,
        phase_caps: Vec<Option<u64>>,
        queue_depth: Option<usize>,
        policy: ShedPolicy,
    ) -> Self {
        let phases = phase_caps.len();
        Self {
            max_active,
            phase_caps,
            active_by_phase: vec![0; phases],
            pending: VecDeque::new(),
            queue_depth,
            policy,
            stats: AdmissionStats::default(),
        }
    }

    fn has_capacity(&self, phase: usize) -> bool {
        if let Some(max) = self.max_active
            && self.stats.active >= max
        {
            return false;
        }
        match self.phase_caps.get(phase).copied().flatten() {
            Some(cap) => self.active_by_phase.get(phase).copied().unwrap_or(0) < cap,
            None => true,
        }
    }

    fn reserve(&mut self, phase: usize) {
        self.stats.active += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.stats.active);
        self.stats.accepted += 1;
        if let Some(n) = self.active_by_phase.get_mut(phase) {
            *n += 1;
        }
    }

    /// Decide what happens to a new arrival.
    ///
    /// Queued arrivals never block an arrival that fits: capacity is re-offered to the
    /// queue on every [`AdmissionQueue::release`].
    pub fn admit(&mut self, arrival: ArrivalEvent) -> Admission {
        if self.has_capacity(arrival.phase) {
            self.reserve(arrival.phase);
            return Admission::Accepted(arrival);
        }

        if let Some(depth) = self.queue_depth
            && self.pending.len() >= depth
        {
            self.stats.shed += 1;
            return match (self.policy, self.pending.pop_front()) {
                (ShedPolicy::DropOldest, Some(oldest)) => {
                    self.pending.push_back(arrival);
                    Admission::Shed(oldest)
                }
                (_, oldest) => {
                    if let Some(oldest) = oldest {
                        self.pending.push_front(oldest);
                    }
                    Admission::Shed(arrival)
                }
            };
        }

        self.pending.push_back(arrival);
        self.stats.pending = self.pending.len() as u64;
        self.stats.peak_pending = self.stats.peak_pending.max(self.stats.pending);
        Admission::Queued
    }

    /// A virtual user started by `phase` finished.
    pub fn release(&mut self, phase: usize) {
        self.stats.active = self.stats.active.saturating_sub(1);
        if let Some(n) = self.active_by_phase.get_mut(phase) {
            *n = n.saturating_sub(1);
        }
    }

    /// First queued arrival that fits, in FIFO order; capacity is reserved for it.
    pub fn next_ready(&mut self) -> Option<ArrivalEvent> {
        let idx = self
            .pending
            .iter()
            .position(|a| self.has_capacity(a.phase))?;
        let arrival = self.pending.remove(idx)?;
        self.stats.pending = self.pending.len() as u64;
        self.reserve(arrival.phase);
        Some(arrival)
    }

    /// Remove every queued arrival.
    pub fn drain_pending(&mut self) -> Vec<ArrivalEvent> {
        let out: Vec<ArrivalEvent> = self.pending.drain(..).collect();
        self.stats.pending = 0;
        out
    }

    pub fn is_idle(&self) -> bool {
        self.stats.active == 0 && self.pending.is_empty()
    }

    pub fn stats(&self) -> AdmissionStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn arrival(seq: u64, phase: usize) -> ArrivalEvent {
        ArrivalEvent {
            at: Duration::from_millis(seq * 100),
            phase,
            seq,
        }
    }

    #[test]
    fn unlimited_queue_accepts_everything() {
        let mut q = AdmissionQueue::new(None, vec![None], None, ShedPolicy::DropNewest);
        for i in 0..100 {
            assert!(matches!(q.admit(arrival(i, 0)), Admission::Accepted(_)));
        }
        assert_eq!(q.stats().active, 100);
        assert_eq!(q.stats().pending, 0);
    }

    #[test]
    fn run_cap_queues_in_fifo_order() {
        let mut q = AdmissionQueue::new(Some(1), vec![None], None, ShedPolicy::DropNewest);
        assert_eq!(q.admit(arrival(0, 0)), Admission::Accepted(arrival(0, 0)));
        assert_eq!(q.admit(arrival(1, 0)), Admission::Queued);
        assert_eq!(q.admit(arrival(2, 0)), Admission::Queued);
        assert_eq!(q.next_ready(), None);

        q.release(0);
        assert_eq!(q.next_ready().map(|a| a.seq), Some(1));
        assert_eq!(q.next_ready(), None);
        q.release(0);
        assert_eq!(q.next_ready().map(|a| a.seq), Some(2));
        q.release(0);

        let s = q.stats();
        assert!(q.is_idle());
        assert_eq!((s.peak_active, s.peak_pending, s.accepted, s.shed), (1, 2, 3, 0));
    }

    #[test]
    fn phase_caps_are_independent() {
        let mut q = AdmissionQueue::new(None, vec![Some(1), None], None, ShedPolicy::DropNewest);
        assert!(matches!(q.admit(arrival(0, 0)), Admission::Accepted(_)));
        assert_eq!(q.admit(arrival(1, 0)), Admission::Queued);
        // A later phase is not blocked by the earlier phase's queue.
        assert!(matches!(q.admit(arrival(2, 1)), Admission::Accepted(_)));

        q.release(1);
        assert_eq!(q.next_ready(), None);
        q.release(0);
        assert_eq!(q.next_ready().map(|a| a.seq), Some(1));
    }

    #[test]
    fn bounded_queue_drops_newest() {
        let mut q = AdmissionQueue::new(Some(1), vec![None], Some(1), ShedPolicy::DropNewest);
        let _ = q.admit(arrival(0, 0));
        assert_eq!(q.admit(arrival(1, 0)), Admission::Queued);
        assert_eq!(q.admit(arrival(2, 0)), Admission::Shed(arrival(2, 0)));
        q.release(0);
        assert_eq!(q.next_ready().map(|a| a.seq), Some(1));
        assert_eq!(q.stats().shed, 1);
    }

    #[test]
    fn bounded_queue_drops_oldest() {
        let mut q = AdmissionQueue::new(Some(1), vec![None], Some(1), ShedPolicy::DropOldest);
        let _ = q.admit(arrival(0, 0));
        assert_eq!(q.admit(arrival(1, 0)), Admission::Queued);
        assert_eq!(q.admit(arrival(2, 0)), Admission::Shed(arrival(1, 0)));
        q.release(0);
        assert_eq!(q.next_ready().map(|a| a.seq), Some(2));
    }

    #[test]
    fn zero_depth_sheds_immediately() {
        let mut q = AdmissionQueue::new(Some(1), vec![None], Some(0), ShedPolicy::DropOldest);
        let _ = q.admit(arrival(0, 0));
        assert_eq!(q.admit(arrival(1, 0)), Admission::Shed(arrival(1, 0)));
        assert_eq!(q.stats().pending, 0);
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut q = AdmissionQueue::new(Some(1), vec![None], None, ShedPolicy::DropNewest);
        let _ = q.admit(arrival(0, 0));
        let _ = q.admit(arrival(1, 0));
        let _ = q.admit(arrival(2, 0));
        assert_eq!(q.drain_pending().len(), 2);
        assert!(!q.is_idle());
        q.release(0);
        assert!(q.is_idle());
    }
}
