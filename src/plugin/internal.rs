//! In-process plugins.
//!
//! An internal plugin's "entry point" is a factory registered under the
//! plugin name. Loading the plugin calls the factory once; requests are then
//! answered synchronously on the dispatching task.

use super::manifest::PluginManifest;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A plugin that runs inside the daemon process.
///
/// `handle` must return promptly; it runs on the daemon's executor.
pub trait InternalPlugin: Send + Sync {
    fn handle(&self, path: &str, data: &Value) -> anyhow::Result<Value>;
}

impl<F> InternalPlugin for F
where
    F: Fn(&str, &Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn handle(&self, path: &str, data: &Value) -> anyhow::Result<Value> {
        self(path, data)
    }
}

pub type InternalFactory =
    Arc<dyn Fn(&PluginManifest) -> anyhow::Result<Arc<dyn InternalPlugin>> + Send + Sync>;

/// Factories for internal plugins, keyed by plugin name.
#[derive(Clone, Default)]
pub struct InternalRegistry {
    factories: HashMap<String, InternalFactory>,
}

impl InternalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PluginManifest) -> anyhow::Result<Arc<dyn InternalPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginManifest) -> anyhow::Result<Arc<dyn InternalPlugin>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<InternalFactory> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for InternalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalRegistry")
            .field("factories", &self.names())
            .finish()
    }
}
