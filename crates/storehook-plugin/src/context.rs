//! Per-plugin state held by the loader.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use storehook_core::{DataEntry, Plugin, Registry, StoreResult};
use tokio_util::sync::CancellationToken;

use crate::engine::{Callable, ExecutionContext, Exports};

/// Normalize a module name: forward slashes, no leading `./` or `/`, and
/// the final extension stripped.
pub fn normalize_path(name: &str) -> String {
    let mut path = name.replace('\\', "/");
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest.to_string();
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest.to_string();
        } else {
            break;
        }
    }

    let file_start = path.rfind('/').map_or(0, |i| i + 1);
    if let Some(dot) = path[file_start..].rfind('.') {
        if dot > 0 {
            path.truncate(file_start + dot);
        }
    }
    path
}

/// Exported values of a plugin's modules and dependencies, shared with the
/// context's `require`.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: RwLock<IndexMap<String, Arc<Exports>>>,
    dependencies: RwLock<IndexMap<String, Arc<Exports>>>,
}

impl ModuleTable {
    /// Register a module under its normalized path, the `./`-prefixed path
    /// and the plugin-prefixed path. All three share one `Arc`.
    pub fn insert_module(&self, plugin_id: &str, file_name: &str, exports: Arc<Exports>) {
        let path = normalize_path(file_name);
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        modules.insert(format!("./{path}"), Arc::clone(&exports));
        modules.insert(format!("{plugin_id}/{path}"), Arc::clone(&exports));
        modules.insert(path, exports);
    }

    /// Register a dependency under its package name.
    pub fn insert_dependency(&self, package_name: &str, exports: Arc<Exports>) {
        self.dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package_name.to_string(), exports);
    }

    /// Look up a module by one of its registered aliases.
    pub fn module(&self, alias: &str) -> Option<Arc<Exports>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    /// Look up a dependency by package name.
    pub fn dependency(&self, package_name: &str) -> Option<Arc<Exports>> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package_name)
            .cloned()
    }

    /// Resolve a `require` argument: a module alias, a module path in any
    /// spelling, then a dependency name.
    pub fn resolve(&self, name: &str) -> Option<Arc<Exports>> {
        self.module(name)
            .or_else(|| self.module(&normalize_path(name)))
            .or_else(|| self.dependency(name))
    }

    /// All registered module aliases in registration order.
    pub fn paths(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Package names of linked dependencies.
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// A plugin's private key/value area, scoped to its id.
#[derive(Debug, Clone)]
pub struct PluginData {
    plugin_id: Arc<str>,
    registry: Registry,
}

impl PluginData {
    pub fn new(plugin_id: impl Into<Arc<str>>, registry: Registry) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            registry,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Stored value for `key`. Expired entries are still returned.
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.entry(key)?.map(|entry| entry.value))
    }

    /// Stored entry for `key`, including its expiry.
    pub fn entry(&self, key: &str) -> StoreResult<Option<DataEntry>> {
        self.registry.get_data(&self.plugin_id, key)
    }

    pub fn set(&self, key: &str, value: Value, expires_at: Option<DateTime<Utc>>) -> StoreResult<()> {
        self.registry.set_data(&self.plugin_id, key, value, expires_at)
    }

    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        self.registry.delete_data(&self.plugin_id, key)
    }
}

/// A loaded hook handler or event listener.
#[derive(Debug, Clone)]
pub struct Registration {
    pub handler: Callable,
    pub priority: i64,
    pub enabled: bool,
}

/// Everything one loaded plugin owns at runtime.
pub struct PluginContext {
    plugin: Plugin,
    modules: Arc<ModuleTable>,
    hooks: RwLock<IndexMap<String, Registration>>,
    events: RwLock<IndexMap<String, Registration>>,
    runtime: Box<dyn ExecutionContext>,
    data: PluginData,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin.id)
            .field("modules", &self.modules.paths())
            .field("hooks", &self.hook_names())
            .field("events", &self.event_names())
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub(crate) fn new(
        plugin: Plugin,
        modules: Arc<ModuleTable>,
        runtime: Box<dyn ExecutionContext>,
        data: PluginData,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin,
            modules,
            hooks: RwLock::new(IndexMap::new()),
            events: RwLock::new(IndexMap::new()),
            runtime,
            data,
            cancel,
        }
    }

    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin.id
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// The exports of a module, by any alias.
    pub fn module(&self, alias: &str) -> Option<Arc<Exports>> {
        self.modules.module(alias)
    }

    pub fn data(&self) -> &PluginData {
        &self.data
    }

    pub(crate) fn runtime(&self) -> &dyn ExecutionContext {
        self.runtime.as_ref()
    }

    /// Stop in-flight and future runs of this plugin.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn register_hook(&self, name: &str, registration: Registration) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), registration);
    }

    pub(crate) fn register_event(&self, name: &str, registration: Registration) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), registration);
    }

    /// Registration for a hook name.
    pub fn hook(&self, name: &str) -> Option<Registration> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registration for an event name.
    pub fn event(&self, name: &str) -> Option<Registration> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Toggle a hook registration. Returns whether it exists.
    pub fn set_hook_enabled(&self, name: &str, enabled: bool) -> bool {
        Self::toggle(&self.hooks, name, enabled)
    }

    /// Toggle an event registration. Returns whether it exists.
    pub fn set_event_enabled(&self, name: &str, enabled: bool) -> bool {
        Self::toggle(&self.events, name, enabled)
    }

    fn toggle(table: &RwLock<IndexMap<String, Registration>>, name: &str, enabled: bool) -> bool {
        match table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
        {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }
}
