use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;

use crate::context::VuContext;

pub const DEFAULT_HOOK_ERROR: &str = "EHOOK";

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    pub code: Arc<str>,
    pub message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: Arc::from(DEFAULT_HOOK_ERROR),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<Arc<str>>) -> Self {
        self.code = code.into();
        self
    }
}

/// A named processor function, used by `beforeScenario`/`afterScenario` and `function` steps.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &mut VuContext) -> Result<(), HookError>;
}

/// Adapts a synchronous closure into a [`Hook`].
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&mut VuContext) -> Result<(), HookError> + Send + Sync,
{
    async fn call(&self, ctx: &mut VuContext) -> Result<(), HookError> {
        (self.0)(ctx)
    }
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: AHashMap<String, Arc<dyn Hook>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}

impl HookRegistry {
    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut VuContext) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnHook(f)));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Hook>> {
        self.hooks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }
}
