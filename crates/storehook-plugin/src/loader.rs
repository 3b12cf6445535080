//! Plugin loading.
//!
//! Loading is strictly sequential. For one plugin the loader fetches the
//! record, creates a context through the engine for its trust tier, then
//! runs dependencies, modules, hooks and events in that order. Any failure
//! discards the partially built context so a plugin is either fully loaded
//! or absent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use indexmap::IndexMap;
use storehook_core::{PluginDependency, Registry, SecurityLevel, StoreResult};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::context::{ModuleTable, PluginContext, PluginData, Registration};
use crate::engine::{self, Callable, ContextBindings, ExecutionEngine, Exports};
use crate::transform::transform;
use crate::types::{PluginError, PluginResult};

/// A dependency executed once and shared by every plugin that bundles the
/// same package version.
struct CachedDependency {
    exports: Arc<Exports>,
    /// Ids of loaded plugins using this entry.
    claimants: HashSet<String>,
}

/// Outcome of [`PluginLoader::load_all_plugins`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Plugins loaded, in load order.
    pub loaded: Vec<String>,

    /// Active plugins skipped because the configuration disables them.
    pub skipped: Vec<String>,

    /// Plugins that failed, with the reason.
    pub failed: Vec<(String, PluginError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Builds and owns plugin contexts.
pub struct PluginLoader {
    registry: Registry,
    config: RuntimeConfig,
    engines: HashMap<SecurityLevel, Arc<dyn ExecutionEngine>>,
    contexts: RwLock<IndexMap<String, Arc<PluginContext>>>,
    dependency_cache: DashMap<(String, String), CachedDependency>,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.loaded_ids())
            .field("cached_dependencies", &self.dependency_cache.len())
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// Create a loader with one rhai engine per trust tier.
    pub fn new(registry: Registry, config: RuntimeConfig) -> Self {
        let engines = [SecurityLevel::Sandboxed, SecurityLevel::Trusted]
            .into_iter()
            .map(|level| (level, engine::engine_for(level, config.sandbox(level).clone())))
            .collect();

        Self {
            registry,
            config,
            engines,
            contexts: RwLock::new(IndexMap::new()),
            dependency_cache: DashMap::new(),
        }
    }

    /// Replace the engine used for a trust tier.
    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engines.insert(engine.level(), engine);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Load one plugin, replacing any context already loaded for it.
    pub async fn load_plugin(&self, id: &str) -> PluginResult<Arc<PluginContext>> {
        self.discard(id);

        match self.build_context(id).await {
            Ok(context) => {
                let context = Arc::new(context);
                self.contexts
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.to_string(), Arc::clone(&context));
                tracing::info!(
                    plugin_id = id,
                    hooks = context.hook_names().len(),
                    events = context.event_names().len(),
                    "Loaded plugin"
                );
                Ok(context)
            }
            Err(e) => {
                self.discard(id);
                if e.is_store() {
                    tracing::error!(plugin_id = id, error = %e, "Plugin store failed while loading");
                } else {
                    tracing::warn!(plugin_id = id, error = %e, "Failed to load plugin");
                }
                Err(e)
            }
        }
    }

    /// Discard a plugin's context and load it again from the registry.
    pub async fn reload_plugin(&self, id: &str) -> PluginResult<Arc<PluginContext>> {
        tracing::debug!(plugin_id = id, "Reloading plugin");
        self.discard(id);
        self.load_plugin(id).await
    }

    /// Discard a plugin's context. Returns whether it was loaded.
    pub fn unload_plugin(&self, id: &str) -> bool {
        let unloaded = self.discard(id).is_some();
        if unloaded {
            tracing::info!(plugin_id = id, "Unloaded plugin");
        }
        unloaded
    }

    /// Load every active plugin, honouring the configured tenant and
    /// disabled list. Individual failures are collected, not returned.
    pub async fn load_all_plugins(&self) -> StoreResult<LoadReport> {
        let plugins = self.registry.list_active(self.config.tenant.as_deref())?;
        let mut report = LoadReport::default();

        for plugin in plugins {
            if self.config.is_disabled(&plugin.id) {
                tracing::info!(plugin_id = %plugin.id, "Skipping disabled plugin");
                report.skipped.push(plugin.id);
                continue;
            }
            match self.load_plugin(&plugin.id).await {
                Ok(_) => report.loaded.push(plugin.id),
                Err(e) => report.failed.push((plugin.id, e)),
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Finished loading plugins"
        );
        Ok(report)
    }

    /// The live context of a plugin.
    pub fn context(&self, id: &str) -> Option<Arc<PluginContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot of live contexts in load order.
    pub fn contexts(&self) -> Vec<Arc<PluginContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Ids of loaded plugins in load order.
    pub fn loaded_ids(&self) -> Vec<String> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of shared dependency entries currently cached.
    pub fn cached_dependencies(&self) -> usize {
        self.dependency_cache.len()
    }

    fn engine(&self, level: SecurityLevel) -> PluginResult<&Arc<dyn ExecutionEngine>> {
        self.engines
            .get(&level)
            .ok_or_else(|| PluginError::config(format!("no execution engine for '{level}' plugins")))
    }

    /// Remove a context, cancel it and drop its dependency claims.
    fn discard(&self, id: &str) -> Option<Arc<PluginContext>> {
        let removed = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(id);
        if let Some(context) = &removed {
            context.cancel();
        }

        self.dependency_cache.retain(|_, entry| {
            entry.claimants.remove(id);
            !entry.claimants.is_empty()
        });
        removed
    }

    async fn build_context(&self, id: &str) -> PluginResult<PluginContext> {
        let plugin = self
            .registry
            .get_plugin(id)?
            .ok_or_else(|| PluginError::NotFound { id: id.to_string() })?;
        if self.config.is_disabled(id) {
            return Err(PluginError::Disabled { id: id.to_string() });
        }
        if !plugin.is_active() {
            return Err(PluginError::Inactive { id: id.to_string() });
        }

        let engine = self.engine(plugin.security_level)?;
        tracing::debug!(plugin_id = id, engine = engine.name(), "Creating plugin context");

        let modules = Arc::new(ModuleTable::default());
        let data = PluginData::new(id, self.registry.clone());
        let cancel = CancellationToken::new();
        let runtime = engine.create_context(ContextBindings {
            plugin_id: id.to_string(),
            modules: Arc::clone(&modules),
            data: data.clone(),
            cancel: cancel.clone(),
        })?;
        let context = PluginContext::new(plugin, modules, runtime, data, cancel);

        for dependency in self.registry.get_dependencies(id)? {
            self.load_dependency(&context, &dependency).await?;
        }

        for module in self.registry.get_modules(id)? {
            let unit = format!("{id}/{}", module.file_name);
            let exports = self.run_unit(&context, &unit, &module.file_content).await?;
            context
                .modules()
                .insert_module(id, &module.file_name, Arc::new(exports));
        }

        for hook in self.registry.get_hooks(id)? {
            let unit = format!("{id}#hook:{}", hook.hook_name);
            let handler = self.load_handler(&context, &unit, &hook.handler_function).await?;
            context.register_hook(
                &hook.hook_name,
                Registration {
                    handler,
                    priority: hook.priority,
                    enabled: hook.is_enabled,
                },
            );
        }

        for event in self.registry.get_events(id)? {
            let unit = format!("{id}#event:{}", event.event_name);
            let handler = self.load_handler(&context, &unit, &event.listener_function).await?;
            context.register_event(
                &event.event_name,
                Registration {
                    handler,
                    priority: event.priority,
                    enabled: event.is_enabled,
                },
            );
        }

        Ok(context)
    }

    async fn run_unit(&self, context: &PluginContext, unit: &str, source: &str) -> PluginResult<Exports> {
        let code = transform(source).map_err(|source| PluginError::Transform {
            unit: unit.to_string(),
            source,
        })?;
        context.runtime().execute(unit, &code).await
    }

    async fn load_handler(&self, context: &PluginContext, unit: &str, source: &str) -> PluginResult<Callable> {
        self.run_unit(context, unit, source)
            .await?
            .handler()
            .ok_or_else(|| PluginError::MissingHandler { unit: unit.to_string() })
    }

    async fn load_dependency(&self, context: &PluginContext, dependency: &PluginDependency) -> PluginResult<()> {
        let id = context.plugin_id();
        let key = (dependency.package_name.clone(), dependency.version.clone());

        let cached = self
            .dependency_cache
            .get(&key)
            .map(|entry| Arc::clone(&entry.exports));

        let exports = match cached {
            Some(exports) => {
                tracing::debug!(
                    plugin_id = id,
                    package = %dependency.package_name,
                    version = %dependency.version,
                    "Reusing cached dependency"
                );
                exports
            }
            None => {
                let unit = format!("{id}#dep:{}@{}", dependency.package_name, dependency.version);
                let exports = Arc::new(self.run_unit(context, &unit, &dependency.bundled_code).await?);
                Arc::clone(
                    &self
                        .dependency_cache
                        .entry(key.clone())
                        .or_insert_with(|| CachedDependency {
                            exports: Arc::clone(&exports),
                            claimants: HashSet::new(),
                        })
                        .exports,
                )
            }
        };

        if let Some(mut entry) = self.dependency_cache.get_mut(&key) {
            entry.claimants.insert(id.to_string());
        }
        context
            .modules()
            .insert_dependency(&dependency.package_name, exports);
        Ok(())
    }
}
