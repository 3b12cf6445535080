//! Plugin records as persisted by the storefront.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Lifecycle status of a plugin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginStatus {
    /// Loaded by `load_all_plugins` and eligible for dispatch.
    Active,

    /// Registered but not loadable.
    #[default]
    Inactive,
}

/// Trust tier that selects the execution engine for a plugin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SecurityLevel {
    /// Strict limits, reduced capabilities, evaluated off the calling task.
    #[default]
    Sandboxed,

    /// Generous limits, full capability set, evaluated in-process.
    Trusted,
}

/// Where a module's code is meant to run. Informational only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleScope {
    Frontend,
    Backend,
    Admin,
    #[default]
    Shared,
}

/// A UI slot the plugin contributes a component to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiSurface {
    /// Named extension slot in the storefront or admin UI.
    pub slot: String,

    /// Component identifier rendered into the slot.
    pub component: String,
}

/// Declarative manifest of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// UI surfaces the plugin registers.
    #[serde(default)]
    pub surfaces: Vec<UiSurface>,

    /// Settings schema document.
    #[serde(default)]
    pub settings: serde_json::Value,

    /// Feature flags the plugin advertises.
    #[serde(default)]
    pub features: Vec<String>,
}

/// A registered plugin.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Plugin {
    /// Stable identifier; the upsert key.
    pub id: String,

    /// Display name.
    #[builder(default)]
    pub name: String,

    /// Semantic version.
    #[builder(default = "\"0.1.0\".to_string()")]
    pub version: String,

    /// Lifecycle status.
    #[builder(default)]
    pub status: PluginStatus,

    /// Trust tier.
    #[builder(default)]
    pub security_level: SecurityLevel,

    /// Declarative manifest.
    #[builder(default)]
    #[serde(default)]
    pub manifest: PluginManifest,

    /// Permissions requested by the plugin.
    #[builder(default)]
    #[serde(default)]
    pub permissions: Vec<String>,

    /// Declared package dependencies.
    #[builder(default)]
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Free-form tags.
    #[builder(default)]
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.id {
            Some(id) if !id.trim().is_empty() => {}
            Some(_) => return Err("Plugin id cannot be empty".to_string()),
            None => return Err("Plugin id is required".to_string()),
        }
        if let Some(version) = &self.version {
            if version.trim().is_empty() {
                return Err("Plugin version cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

impl Plugin {
    /// Create a new plugin builder.
    pub fn builder() -> PluginBuilder {
        PluginBuilder::default()
    }

    /// Whether the plugin is active.
    pub fn is_active(&self) -> bool {
        self.status == PluginStatus::Active
    }
}

/// One unit of plugin source, loaded into the plugin's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginModule {
    pub plugin_id: String,

    /// File name; doubles as the logical module path.
    pub file_name: String,

    pub file_content: String,

    #[serde(default)]
    pub scope: ModuleScope,

    /// Ascending: lower loads first.
    #[serde(default)]
    pub load_priority: i64,

    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

impl PluginModule {
    /// Create an enabled module with priority 0.
    pub fn new(
        plugin_id: impl Into<String>,
        file_name: impl Into<String>,
        file_content: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            file_name: file_name.into(),
            file_content: file_content.into(),
            scope: ModuleScope::default(),
            load_priority: 0,
            is_enabled: true,
        }
    }

    /// Set the load priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.load_priority = priority;
        self
    }

    /// Set the scope tag.
    pub fn with_scope(mut self, scope: ModuleScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }
}

/// A bundled third-party package a plugin's modules may `require`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDependency {
    pub plugin_id: String,
    pub package_name: String,
    pub version: String,
    pub bundled_code: String,
}

impl PluginDependency {
    pub fn new(
        plugin_id: impl Into<String>,
        package_name: impl Into<String>,
        version: impl Into<String>,
        bundled_code: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            package_name: package_name.into(),
            version: version.into(),
            bundled_code: bundled_code.into(),
        }
    }
}

/// A filter handler registered under a shared hook name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginHook {
    pub plugin_id: String,
    pub hook_name: String,
    pub handler_function: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

impl PluginHook {
    /// Create an enabled hook with priority 0.
    pub fn new(
        plugin_id: impl Into<String>,
        hook_name: impl Into<String>,
        handler_function: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            hook_name: hook_name.into(),
            handler_function: handler_function.into(),
            priority: 0,
            is_enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }
}

/// A notification listener registered under a shared event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub plugin_id: String,
    pub event_name: String,
    pub listener_function: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

impl PluginEvent {
    /// Create an enabled listener with priority 0.
    pub fn new(
        plugin_id: impl Into<String>,
        event_name: impl Into<String>,
        listener_function: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            event_name: event_name.into(),
            listener_function: listener_function.into(),
            priority: 0,
            is_enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }
}

/// One key/value pair in a plugin's private data area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub plugin_id: String,
    pub key: String,
    pub value: serde_json::Value,

    /// Advisory expiry. Stored and returned, never enforced on read.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl DataEntry {
    /// Whether the entry's expiry lies at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-tenant switch for a plugin. Plugins are on unless switched off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantOverride {
    pub plugin_id: String,
    pub tenant_id: String,
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}
