use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::bus::{BusEvent, EventBus};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::scenario::ScenarioSet;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A loaded plugin instance.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Flush and release resources. Called exactly once, after the run has ended.
    async fn cleanup(&self) -> std::result::Result<(), PluginError> {
        Ok(())
    }
}

/// A plugin that only needed to initialize.
pub struct NoCleanup;

impl Plugin for NoCleanup {}

pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self, ctx: &mut PluginContext<'_>) -> std::result::Result<Box<dyn Plugin>, PluginError>;
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Arc<dyn PluginFactory>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn with(mut self, factory: Arc<dyn PluginFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories.get(name)
    }
}

/// What a plugin may touch while it initializes.
pub struct PluginContext<'a> {
    pub scenarios: &'a mut ScenarioSet,
    pub bus: &'a EventBus,
    pub run_config: &'a RunConfig,
    /// The plugin's entry from the script's `plugins` map.
    pub config: &'a Value,
    plugin: &'a str,
    handlers: &'a mut Vec<JoinHandle<()>>,
}

impl PluginContext<'_> {
    /// Run `handler` for every bus event matching `pattern` until the bus closes.
    ///
    /// Handler errors are logged and do not affect the run.
    pub fn spawn_handler<F>(&mut self, pattern: &str, mut handler: F)
    where
        F: FnMut(&BusEvent) -> std::result::Result<(), PluginError> + Send + 'static,
    {
        let mut sub = self.bus.subscribe(pattern);
        let plugin = self.plugin.to_string();
        self.handlers.push(tokio::spawn(async move {
            while let Some(ev) = sub.recv().await {
                if let Err(err) = handler(&ev) {
                    tracing::warn!(plugin = %plugin, event = ev.name(), error = %err, "plugin handler failed");
                }
            }
        }));
    }
}

struct LoadedPlugin {
    name: String,
    plugin: Box<dyn Plugin>,
}

/// Initialized plugins and their bus handlers.
pub struct PluginHost {
    plugins: Vec<LoadedPlugin>,
    handlers: Vec<JoinHandle<()>>,
    bus: EventBus,
    cleaned: bool,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.names())
            .field("handlers", &self.handlers.len())
            .field("cleaned", &self.cleaned)
            .finish()
    }
}

impl PluginHost {
    /// Initialize plugins in name order.
    ///
    /// A plugin that is not registered or fails to initialize aborts loading unless its
    /// options contain `optional: true`. On abort, plugins initialized so far are cleaned up.
    pub async fn load(
        registry: &PluginRegistry,
        specs: &BTreeMap<String, Value>,
        scenarios: &mut ScenarioSet,
        bus: &EventBus,
        run_config: &RunConfig,
    ) -> Result<Self> {
        let mut host = Self {
            plugins: Vec::with_capacity(specs.len()),
            handlers: Vec::new(),
            bus: bus.clone(),
            cleaned: false,
        };

        for (name, config) in specs {
            let optional = config
                .get("optional")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let result = match registry.get(name) {
                None => Err(Error::UnknownPlugin(name.clone())),
                Some(factory) => {
                    let mut ctx = PluginContext {
                        scenarios: &mut *scenarios,
                        bus,
                        run_config,
                        config,
                        plugin: name,
                        handlers: &mut host.handlers,
                    };
                    factory
                        .init(&mut ctx)
                        .map_err(|source| Error::PluginInit {
                            name: name.clone(),
                            source,
                        })
                }
            };

            match result {
                Ok(plugin) => {
                    tracing::info!(plugin = %name, "plugin loaded");
                    host.plugins.push(LoadedPlugin {
                        name: name.clone(),
                        plugin,
                    });
                }
                Err(err) if optional => {
                    tracing::warn!(plugin = %name, error = %err, "skipping optional plugin");
                }
                Err(err) => {
                    host.cleanup(run_config.plugin_cleanup_grace).await;
                    return Err(err);
                }
            }
        }

        Ok(host)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Close the bus, let handlers drain, then run every plugin's cleanup concurrently.
    ///
    /// Runs at most once; everything must finish within `grace`.
    pub async fn cleanup(&mut self, grace: Duration) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        let deadline = Instant::now() + grace;
        self.bus.close();

        for handle in self.handlers.drain(..) {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "plugin handler panicked"),
                Err(_) => tracing::warn!("plugin handler did not drain before the cleanup deadline"),
            }
        }

        let mut set = JoinSet::new();
        for LoadedPlugin { name, plugin } in self.plugins.drain(..) {
            set.spawn(async move {
                let result = plugin.cleanup().await;
                (name, result)
            });
        }

        let waited = tokio::time::timeout_at(deadline, async {
            while let Some(res) = set.join_next().await {
                match res {
                    Ok((name, Ok(()))) => tracing::debug!(plugin = %name, "plugin cleaned up"),
                    Ok((name, Err(err))) => {
                        tracing::warn!(plugin = %name, error = %err, "plugin cleanup failed");
                    }
                    Err(err) => tracing::warn!(error = %err, "plugin cleanup panicked"),
                }
            }
        })
        .await;

        if waited.is_err() {
            tracing::warn!(
                pending = set.len(),
                grace = ?grace,
                "plugin cleanup grace elapsed; abandoning remaining plugins"
            );
            set.abort_all();
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        if !self.cleaned && !self.plugins.is_empty() {
            tracing::warn!(plugins = ?self.names(), "plugin host dropped without cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde_json::json;

    use super::*;

    struct Counting {
        name: &'static str,
        cleanups: Arc<AtomicU64>,
        fail_init: bool,
        slow_cleanup: bool,
    }

    struct CountingPlugin {
        cleanups: Arc<AtomicU64>,
        slow: bool,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        async fn cleanup(&self) -> std::result::Result<(), PluginError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl PluginFactory for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn init(
            &self,
            ctx: &mut PluginContext<'_>,
        ) -> std::result::Result<Box<dyn Plugin>, PluginError> {
            if self.fail_init {
                return Err(PluginError::new("bad options"));
            }
            ctx.scenarios.functions.register("$fromPlugin", |_| json!(1));
            Ok(Box::new(CountingPlugin {
                cleanups: self.cleanups.clone(),
                slow: self.slow_cleanup,
            }))
        }
    }

    fn factory(name: &'static str, cleanups: &Arc<AtomicU64>) -> Counting {
        Counting {
            name,
            cleanups: cleanups.clone(),
            fail_init: false,
            slow_cleanup: false,
        }
    }

    fn specs(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn loads_in_name_order_and_cleans_up_once() {
        let cleanups = Arc::new(AtomicU64::new(0));
        let registry = PluginRegistry::new()
            .with(Arc::new(factory("zeta", &cleanups)))
            .with(Arc::new(factory("alpha", &cleanups)));
        let mut set = ScenarioSet::default();
        let bus = EventBus::new(8);

        let mut host = match PluginHost::load(
            &registry,
            &specs(&[("zeta", json!({})), ("alpha", json!({}))]),
            &mut set,
            &bus,
            &RunConfig::default(),
        )
        .await
        {
            Ok(h) => h,
            Err(err) => panic!("{err}"),
        };

        assert_eq!(host.names(), vec!["alpha", "zeta"]);
        assert!(set.functions.contains("$fromPlugin"));

        host.cleanup(Duration::from_secs(1)).await;
        host.cleanup(Duration::from_secs(1)).await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert!(bus.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn required_plugin_failure_cleans_up_loaded_plugins() {
        let cleanups = Arc::new(AtomicU64::new(0));
        let registry = PluginRegistry::new()
            .with(Arc::new(factory("a-ok", &cleanups)))
            .with(Arc::new(Counting {
                fail_init: true,
                ..factory("b-broken", &cleanups)
            }));

        let err = PluginHost::load(
            &registry,
            &specs(&[("a-ok", json!({})), ("b-broken", json!({}))]),
            &mut ScenarioSet::default(),
            &EventBus::new(8),
            &RunConfig::default(),
        )
        .await
        .err();

        assert!(matches!(err, Some(Error::PluginInit { ref name, .. }) if name == "b-broken"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn optional_plugins_may_be_missing_or_broken() {
        let cleanups = Arc::new(AtomicU64::new(0));
        let registry = PluginRegistry::new().with(Arc::new(Counting {
            fail_init: true,
            ..factory("broken", &cleanups)
        }));

        let host = PluginHost::load(
            &registry,
            &specs(&[
                ("broken", json!({ "optional": true })),
                ("missing", json!({ "optional": true })),
            ]),
            &mut ScenarioSet::default(),
            &EventBus::new(8),
            &RunConfig::default(),
        )
        .await;
        assert!(matches!(host, Ok(ref h) if h.names().is_empty()));

        let missing = PluginHost::load(
            &registry,
            &specs(&[("missing", json!({}))]),
            &mut ScenarioSet::default(),
            &EventBus::new(8),
            &RunConfig::default(),
        )
        .await;
        assert!(matches!(missing, Err(Error::UnknownPlugin(ref n)) if n == "missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cleanup_is_bounded_by_grace() {
        let cleanups = Arc::new(AtomicU64::new(0));
        let registry = PluginRegistry::new()
            .with(Arc::new(Counting {
                slow_cleanup: true,
                ..factory("slow", &cleanups)
            }))
            .with(Arc::new(factory("fast", &cleanups)));

        let mut host = match PluginHost::load(
            &registry,
            &specs(&[("slow", json!({})), ("fast", json!({}))]),
            &mut ScenarioSet::default(),
            &EventBus::new(8),
            &RunConfig::default(),
        )
        .await
        {
            Ok(h) => h,
            Err(err) => panic!("{err}"),
        };

        let started = Instant::now();
        host.cleanup(Duration::from_secs(5)).await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    struct Listener {
        seen: Arc<AtomicU64>,
    }

    impl PluginFactory for Listener {
        fn name(&self) -> &str {
            "listener"
        }

        fn init(
            &self,
            ctx: &mut PluginContext<'_>,
        ) -> std::result::Result<Box<dyn Plugin>, PluginError> {
            let seen = self.seen.clone();
            ctx.spawn_handler("phase.*", move |ev| {
                seen.fetch_add(1, Ordering::SeqCst);
                match ev {
                    BusEvent::PhaseCompleted { .. } => Err(PluginError::new("ignored")),
                    _ => Ok(()),
                }
            });
            Ok(Box::new(NoCleanup))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_drain_before_cleanup_returns() {
        let seen = Arc::new(AtomicU64::new(0));
        let registry = PluginRegistry::new().with(Arc::new(Listener { seen: seen.clone() }));
        let bus = EventBus::new(8);
        let mut host = match PluginHost::load(
            &registry,
            &specs(&[("listener", json!({}))]),
            &mut ScenarioSet::default(),
            &bus,
            &RunConfig::default(),
        )
        .await
        {
            Ok(h) => h,
            Err(err) => panic!("{err}"),
        };

        bus.publish(BusEvent::PhaseStarted { index: 0, name: None });
        bus.publish(BusEvent::PhaseCompleted { index: 0, name: None });
        bus.publish(BusEvent::Done);
        host.cleanup(Duration::from_secs(1)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
