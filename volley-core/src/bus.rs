use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use volley_metrics::{AggregateWindow, MetricEvent};

/// Who published a metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Worker(usize),
    Core,
    Plugin,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    Metric {
        origin: Origin,
        event: MetricEvent,
    },
    PhaseStarted {
        index: usize,
        name: Option<Arc<str>>,
    },
    PhaseCompleted {
        index: usize,
        name: Option<Arc<str>>,
    },
    VuFailed {
        vu_id: u64,
        scenario: Arc<str>,
        code: Arc<str>,
    },
    /// A merged reporting window.
    Stats(Arc<AggregateWindow>),
    Done,
}

impl BusEvent {
    /// Name used for subscription matching. Metric events use the metric name.
    pub fn name(&self) -> &str {
        match self {
            BusEvent::Metric { event, .. } => event.name.as_ref(),
            BusEvent::PhaseStarted { .. } => "phase.started",
            BusEvent::PhaseCompleted { .. } => "phase.completed",
            BusEvent::VuFailed { .. } => "vusers.error",
            BusEvent::Stats(_) => "stats",
            BusEvent::Done => "done",
        }
    }
}

/// Subscription pattern: an exact name, a `prefix.*` wildcard, or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    /// Stored with the trailing dot, e.g. `vusers.`.
    Prefix(String),
}

impl Pattern {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s == "*" {
            Pattern::Any
        } else if let Some(prefix) = s.strip_suffix('*')
            && prefix.ends_with('.')
        {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(s.to_string())
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(n) => n == name,
            Pattern::Prefix(p) => name.starts_with(p.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Pattern::parse(value)
    }
}

enum Sink {
    Bounded {
        pattern: Pattern,
        tx: mpsc::Sender<BusEvent>,
        dropped: AtomicU64,
    },
    /// Lossless feed of core and plugin metrics for the run-level collector.
    MetricTap { tx: mpsc::UnboundedSender<MetricEvent> },
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Bounded { tx, .. } => tx.is_closed(),
            Sink::MetricTap { tx } => tx.is_closed(),
        }
    }
}

struct Inner {
    capacity: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Run-wide publish/subscribe channel.
///
/// Publishing never blocks: every subscriber has its own bounded buffer and events that
/// do not fit are dropped for that subscriber only. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.inner.subscribers.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to events whose name matches `pattern`.
    ///
    /// Each subscription has its own cursor: it sees events published after it was
    /// created, independently of other subscribers.
    pub fn subscribe(&self, pattern: impl Into<Pattern>) -> Subscription {
        let pattern = pattern.into();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        if !self.is_closed() {
            self.add(Sink::Bounded {
                pattern,
                tx,
                dropped: AtomicU64::new(0),
            });
        }
        Subscription { rx }
    }

    pub(crate) fn tap_metrics(&self) -> mpsc::UnboundedReceiver<MetricEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.add(Sink::MetricTap { tx });
        }
        rx
    }

    fn add(&self, sink: Sink) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push(Subscriber { id, sink });
    }

    pub fn publish(&self, event: BusEvent) {
        if self.is_closed() {
            return;
        }

        let mut saw_closed = false;
        {
            let subscribers = self.inner.subscribers.read();
            for sub in subscribers.iter() {
                match &sub.sink {
                    Sink::Bounded {
                        pattern,
                        tx,
                        dropped,
                    } => {
                        if !pattern.matches(event.name()) {
                            continue;
                        }
                        match tx.try_send(event.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(ev)) => {
                                let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                                if n == 1 || n % 1000 == 0 {
                                    tracing::warn!(
                                        subscriber = sub.id,
                                        event = ev.name(),
                                        dropped = n,
                                        "event bus subscriber is lagging; dropping events"
                                    );
                                }
                            }
                            Err(TrySendError::Closed(_)) => saw_closed = true,
                        }
                    }
                    Sink::MetricTap { tx } => {
                        if let BusEvent::Metric {
                            origin: Origin::Core | Origin::Plugin,
                            event,
                        } = &event
                            && tx.send(event.clone()).is_err()
                        {
                            saw_closed = true;
                        }
                    }
                }
            }
        }

        if saw_closed {
            self.inner.subscribers.write().retain(|s| !s.is_closed());
        }
    }

    pub fn publish_metric(&self, origin: Origin, event: MetricEvent) {
        self.publish(BusEvent::Metric { origin, event });
    }

    /// `true` when someone could receive a published event.
    pub fn has_subscribers(&self) -> bool {
        !self.is_closed() && !self.inner.subscribers.read().is_empty()
    }

    /// `true` when a bounded subscriber would receive an event named `name`.
    pub(crate) fn wants(&self, name: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.subscribers.read().iter().any(|s| match &s.sink {
            Sink::Bounded { pattern, .. } => pattern.matches(name),
            Sink::MetricTap { .. } => false,
        })
    }

    /// Events dropped across all subscribers because their buffers were full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events. Subscribers drain what is buffered and then end.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers.write().clear();
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str) -> BusEvent {
        BusEvent::Metric {
            origin: Origin::Worker(0),
            event: MetricEvent::counter(name, 1),
        }
    }

    fn names(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(ev) = sub.try_recv() {
            out.push(ev.name().to_string());
        }
        out
    }

    #[test]
    fn patterns_match_exact_prefix_and_any() {
        assert!(Pattern::parse("*").matches("anything"));
        assert!(Pattern::parse("vusers.*").matches("vusers.created"));
        assert!(!Pattern::parse("vusers.*").matches("vusersx"));
        assert!(Pattern::parse("stats").matches("stats"));
        assert!(!Pattern::parse("stats").matches("stats.extra"));
        assert_eq!(Pattern::parse("a*"), Pattern::Exact("a*".to_string()));
    }

    #[test]
    fn subscribers_only_see_matching_events() {
        let bus = EventBus::new(8);
        let mut vusers = bus.subscribe("vusers.*");
        let mut all = bus.subscribe("*");
        let mut done = bus.subscribe("done");

        bus.publish(metric("vusers.created"));
        bus.publish(metric("http.requests"));
        bus.publish(BusEvent::Done);

        assert_eq!(names(&mut vusers), vec!["vusers.created"]);
        assert_eq!(names(&mut all), vec!["vusers.created", "http.requests", "done"]);
        assert_eq!(names(&mut done), vec!["done"]);
    }

    #[test]
    fn lagging_subscriber_drops_without_affecting_others() {
        let bus = EventBus::new(3);
        let mut slow = bus.subscribe("*");
        let mut fast = bus.subscribe("*");

        for _ in 0..3 {
            bus.publish(metric("a.b"));
        }
        assert_eq!(names(&mut fast).len(), 3);
        assert_eq!(bus.dropped(), 0);

        // `slow` is still full, so only it loses these.
        for _ in 0..3 {
            bus.publish(metric("a.b"));
        }
        assert_eq!(names(&mut fast).len(), 3);
        assert_eq!(names(&mut slow).len(), 3);
        assert_eq!(bus.dropped(), 3);
    }

    #[test]
    fn late_subscribers_see_only_new_events() {
        let bus = EventBus::new(8);
        bus.publish(metric("x.y"));
        let mut late = bus.subscribe("*");
        bus.publish(metric("x.z"));
        assert_eq!(names(&mut late), vec!["x.z"]);
    }

    #[tokio::test]
    async fn close_ends_subscriptions_after_draining() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("*");
        bus.publish(BusEvent::Done);
        bus.close();
        bus.publish(BusEvent::Done);

        assert!(matches!(sub.recv().await, Some(BusEvent::Done)));
        assert!(sub.recv().await.is_none());
        assert!(!bus.has_subscribers());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("*");
        assert!(bus.has_subscribers());
        drop(sub);
        bus.publish(BusEvent::Done);
        assert!(!bus.has_subscribers());
    }

    #[test]
    fn metric_tap_receives_only_core_and_plugin_metrics() {
        let bus = EventBus::new(1);
        let mut tap = bus.tap_metrics();

        bus.publish(metric("worker.metric"));
        for i in 0..5 {
            bus.publish_metric(Origin::Plugin, MetricEvent::counter("plugin.seen", i));
        }
        bus.publish_metric(Origin::Core, MetricEvent::counter("vusers.dropped", 1));

        let mut got = Vec::new();
        while let Ok(ev) = tap.try_recv() {
            got.push(ev.name.to_string());
        }
        assert_eq!(got.len(), 6);
        assert!(got.iter().all(|n| n != "worker.metric"));
    }
}
