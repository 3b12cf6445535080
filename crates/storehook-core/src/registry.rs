//! Plugin registry: the data-access layer over a [`PluginStore`].
//!
//! Every method is a thin translation between records and rows. Store
//! failures are returned as-is; the registry never retries and never
//! swallows an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::model::{
    DataEntry, Plugin, PluginDependency, PluginEvent, PluginHook, PluginModule, PluginStatus,
    TenantOverride,
};
use crate::store::{PluginStore, Query, Row, Table};

/// Registry of plugins and everything they own.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn PluginStore>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

fn to_row<T: Serialize>(table: Table, record: &T) -> StoreResult<Row> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::InvalidRow {
            table,
            message: format!("record encoded as {other}, expected an object"),
        }),
    }
}

fn from_row<T: DeserializeOwned>(table: Table, row: Row) -> StoreResult<T> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::InvalidRow {
        table,
        message: e.to_string(),
    })
}

impl Registry {
    /// Create a registry over a store.
    pub fn new(store: Arc<dyn PluginStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn PluginStore> {
        &self.store
    }

    fn fetch<T: DeserializeOwned>(&self, query: &Query) -> StoreResult<Vec<T>> {
        self.store
            .query(query)?
            .into_iter()
            .map(|row| from_row(query.table, row))
            .collect()
    }

    fn fetch_one<T: DeserializeOwned>(&self, query: &Query) -> StoreResult<Option<T>> {
        Ok(self.fetch(query)?.into_iter().next())
    }

    fn put<T: Serialize>(&self, table: Table, record: &T) -> StoreResult<()> {
        self.store.upsert(table, to_row(table, record)?)
    }

    // ==================== Plugins ====================

    /// Insert or update a plugin keyed by id.
    pub fn register(&self, plugin: &Plugin) -> StoreResult<()> {
        tracing::debug!(plugin_id = %plugin.id, version = %plugin.version, "Registering plugin");
        self.put(Table::Plugins, plugin)
    }

    /// Look up a plugin by id.
    pub fn get_plugin(&self, id: &str) -> StoreResult<Option<Plugin>> {
        self.fetch_one(&Query::new(Table::Plugins).filter("id", id))
    }

    /// Every registered plugin, active or not.
    pub fn list_all(&self) -> StoreResult<Vec<Plugin>> {
        self.fetch(&Query::new(Table::Plugins))
    }

    /// Active plugins. With a tenant, plugins that tenant has switched off
    /// are left out; everything else stays in.
    pub fn list_active(&self, tenant: Option<&str>) -> StoreResult<Vec<Plugin>> {
        let active: Vec<Plugin> = self.fetch(
            &Query::new(Table::Plugins).filter("status", PluginStatus::Active.as_ref()),
        )?;

        let Some(tenant) = tenant else {
            return Ok(active);
        };

        let disabled: Vec<TenantOverride> = self.fetch(
            &Query::new(Table::TenantOverrides)
                .filter("tenant_id", tenant)
                .filter("is_enabled", false),
        )?;

        Ok(active
            .into_iter()
            .filter(|p| !disabled.iter().any(|o| o.plugin_id == p.id))
            .collect())
    }

    /// Flip a plugin's status. Returns whether the plugin exists.
    pub fn set_status(&self, id: &str, status: PluginStatus) -> StoreResult<bool> {
        let mut changes = Row::new();
        changes.insert("status".into(), Value::from(status.as_ref()));
        let touched = self
            .store
            .update(&Query::new(Table::Plugins).filter("id", id), changes)?;
        Ok(touched > 0)
    }

    /// Switch a plugin on or off for one tenant.
    pub fn set_tenant_override(&self, plugin_id: &str, tenant: &str, enabled: bool) -> StoreResult<()> {
        self.put(
            Table::TenantOverrides,
            &TenantOverride {
                plugin_id: plugin_id.to_string(),
                tenant_id: tenant.to_string(),
                is_enabled: enabled,
            },
        )
    }

    // ==================== Owned rows ====================

    /// Insert or update a module keyed by `(plugin_id, file_name)`.
    pub fn register_module(&self, module: &PluginModule) -> StoreResult<()> {
        self.put(Table::Modules, module)
    }

    /// Insert or update a dependency keyed by `(plugin_id, package_name)`.
    pub fn register_dependency(&self, dependency: &PluginDependency) -> StoreResult<()> {
        self.put(Table::Dependencies, dependency)
    }

    /// Insert or update a hook keyed by `(plugin_id, hook_name)`.
    pub fn register_hook(&self, hook: &PluginHook) -> StoreResult<()> {
        self.put(Table::Hooks, hook)
    }

    /// Insert or update an event listener keyed by `(plugin_id, event_name)`.
    pub fn register_event(&self, event: &PluginEvent) -> StoreResult<()> {
        self.put(Table::Events, event)
    }

    /// Enabled modules of a plugin, lowest load priority first.
    pub fn get_modules(&self, plugin_id: &str) -> StoreResult<Vec<PluginModule>> {
        self.fetch(
            &Query::new(Table::Modules)
                .filter("plugin_id", plugin_id)
                .filter("is_enabled", true)
                .order_by("load_priority"),
        )
    }

    /// Dependencies of a plugin in registration order.
    pub fn get_dependencies(&self, plugin_id: &str) -> StoreResult<Vec<PluginDependency>> {
        self.fetch(&Query::new(Table::Dependencies).filter("plugin_id", plugin_id))
    }

    /// Enabled hooks of a plugin.
    pub fn get_hooks(&self, plugin_id: &str) -> StoreResult<Vec<PluginHook>> {
        self.fetch(
            &Query::new(Table::Hooks)
                .filter("plugin_id", plugin_id)
                .filter("is_enabled", true),
        )
    }

    /// Enabled event listeners of a plugin.
    pub fn get_events(&self, plugin_id: &str) -> StoreResult<Vec<PluginEvent>> {
        self.fetch(
            &Query::new(Table::Events)
                .filter("plugin_id", plugin_id)
                .filter("is_enabled", true),
        )
    }

    /// Enabled hooks registered under `hook_name` by any plugin, lowest
    /// priority first.
    pub fn hooks_named(&self, hook_name: &str) -> StoreResult<Vec<PluginHook>> {
        self.fetch(
            &Query::new(Table::Hooks)
                .filter("hook_name", hook_name)
                .filter("is_enabled", true)
                .order_by("priority"),
        )
    }

    /// Enabled listeners registered under `event_name` by any plugin, lowest
    /// priority first.
    pub fn events_named(&self, event_name: &str) -> StoreResult<Vec<PluginEvent>> {
        self.fetch(
            &Query::new(Table::Events)
                .filter("event_name", event_name)
                .filter("is_enabled", true)
                .order_by("priority"),
        )
    }

    // ==================== Plugin data ====================

    /// Read one entry of a plugin's data area. Expiry is not checked.
    pub fn get_data(&self, plugin_id: &str, key: &str) -> StoreResult<Option<DataEntry>> {
        self.fetch_one(
            &Query::new(Table::Data)
                .filter("plugin_id", plugin_id)
                .filter("key", key),
        )
    }

    /// Create or overwrite one entry of a plugin's data area.
    pub fn set_data(
        &self,
        plugin_id: &str,
        key: &str,
        value: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.put(
            Table::Data,
            &DataEntry {
                plugin_id: plugin_id.to_string(),
                key: key.to_string(),
                value,
                expires_at,
            },
        )
    }

    /// Delete one entry. Returns whether it existed.
    pub fn delete_data(&self, plugin_id: &str, key: &str) -> StoreResult<bool> {
        let removed = self.store.delete(
            &Query::new(Table::Data)
                .filter("plugin_id", plugin_id)
                .filter("key", key),
        )?;
        Ok(removed > 0)
    }
}
