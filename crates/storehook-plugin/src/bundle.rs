//! Plugin bundles on disk.
//!
//! A bundle is a directory with a `plugin.toml` describing the plugin and
//! naming the source files of its modules, dependencies, hooks and events:
//!
//! ```toml
//! id = "reviews"
//! name = "Product reviews"
//! version = "1.2.0"
//! status = "active"
//! security_level = "sandboxed"
//!
//! [[modules]]
//! file = "lib/stars.rhai"
//! priority = 10
//!
//! [[dependencies]]
//! name = "money"
//! version = "2.0.1"
//! file = "vendor/money.rhai"
//!
//! [[hooks]]
//! name = "product.render"
//! file = "hooks/render.rhai"
//!
//! [[events]]
//! name = "order.created"
//! file = "events/order.rhai"
//! priority = 5
//! ```

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use storehook_core::{
    ModuleScope, Plugin, PluginDependency, PluginEvent, PluginHook, PluginManifest, PluginModule, PluginStatus,
    Registry, SecurityLevel,
};

use crate::types::{PluginError, PluginResult};

/// Name of the bundle manifest file.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub status: PluginStatus,

    #[serde(default)]
    pub security_level: SecurityLevel,

    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// UI surfaces, settings schema and feature flags.
    #[serde(default)]
    pub manifest: PluginManifest,

    #[serde(default)]
    pub modules: Vec<ModuleEntry>,

    #[serde(default)]
    pub dependencies: Vec<DependencyEntry>,

    #[serde(default)]
    pub hooks: Vec<HandlerEntry>,

    #[serde(default)]
    pub events: Vec<HandlerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleEntry {
    pub file: String,

    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub scope: ModuleScope,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyEntry {
    pub name: String,
    pub version: String,
    pub file: String,
}

/// A hook or event entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerEntry {
    pub name: String,
    pub file: String,

    #[serde(default)]
    pub priority: i64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_enabled() -> bool {
    true
}

/// What [`Bundle::install`] registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub plugin_id: String,
    pub modules: usize,
    pub dependencies: usize,
    pub hooks: usize,
    pub events: usize,
}

/// A plugin bundle directory.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
    manifest: BundleManifest,
}

impl Bundle {
    /// Read and parse the bundle's `plugin.toml`.
    pub fn open(dir: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest: BundleManifest = toml::from_str(&text).map_err(|e| PluginError::config(e.to_string()))?;

        Ok(Self {
            root: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// The plugin record described by the manifest.
    pub fn plugin(&self) -> PluginResult<Plugin> {
        let m = &self.manifest;
        Plugin::builder()
            .id(&m.id)
            .name(&m.name)
            .version(&m.version)
            .status(m.status)
            .security_level(m.security_level)
            .manifest(m.manifest.clone())
            .permissions(m.permissions.clone())
            .dependencies(
                m.dependencies
                    .iter()
                    .map(|d| format!("{}@{}", d.name, d.version))
                    .collect::<Vec<_>>(),
            )
            .tags(m.tags.clone())
            .build()
            .map_err(|e| PluginError::config(e.to_string()))
    }

    /// Register the plugin and everything it owns. Installing the same
    /// bundle again updates the existing rows.
    ///
    /// Every source file is read before anything is written.
    pub fn install(&self, registry: &Registry) -> PluginResult<InstallReport> {
        let plugin = self.plugin()?;
        let id = plugin.id.as_str();
        let m = &self.manifest;

        let modules = m
            .modules
            .iter()
            .map(|e| -> PluginResult<PluginModule> {
                Ok(PluginModule::new(id, &e.file, self.read(&e.file)?)
                    .with_priority(e.priority)
                    .with_scope(e.scope)
                    .enabled(e.enabled))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        let dependencies = m
            .dependencies
            .iter()
            .map(|e| -> PluginResult<PluginDependency> {
                Ok(PluginDependency::new(id, &e.name, &e.version, self.read(&e.file)?))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        let hooks = m
            .hooks
            .iter()
            .map(|e| -> PluginResult<PluginHook> {
                Ok(PluginHook::new(id, &e.name, self.read(&e.file)?)
                    .with_priority(e.priority)
                    .enabled(e.enabled))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        let events = m
            .events
            .iter()
            .map(|e| -> PluginResult<PluginEvent> {
                Ok(PluginEvent::new(id, &e.name, self.read(&e.file)?)
                    .with_priority(e.priority)
                    .enabled(e.enabled))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        registry.register(&plugin)?;
        for module in &modules {
            registry.register_module(module)?;
        }
        for dependency in &dependencies {
            registry.register_dependency(dependency)?;
        }
        for hook in &hooks {
            registry.register_hook(hook)?;
        }
        for event in &events {
            registry.register_event(event)?;
        }

        tracing::info!(
            plugin_id = id,
            version = %plugin.version,
            path = %self.root.display(),
            "Installed plugin bundle"
        );

        Ok(InstallReport {
            plugin_id: plugin.id.clone(),
            modules: modules.len(),
            dependencies: dependencies.len(),
            hooks: hooks.len(),
            events: events.len(),
        })
    }

    /// Read a source file. Paths must stay inside the bundle.
    fn read(&self, file: &str) -> PluginResult<String> {
        let relative = Path::new(file);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(PluginError::config(format!(
                "source path '{file}' must be relative to the bundle"
            )));
        }
        Ok(std::fs::read_to_string(self.root.join(relative))?)
    }
}
