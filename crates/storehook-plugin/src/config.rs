//! Runtime configuration.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use storehook_core::SecurityLevel;

use crate::sandbox::{Capability, SandboxConfig};
use crate::types::{PluginError, PluginResult};

/// Configuration of the plugin loader and its execution tiers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the configuration file and the default database.
    pub config_dir: PathBuf,

    /// Plugin database used by the command line front end.
    pub database: PathBuf,

    /// Tenant whose overrides filter `load_all_plugins`.
    pub tenant: Option<String>,

    /// Plugin ids that are never loaded, whatever their status.
    pub disabled_plugins: HashSet<String>,

    /// Limits for `sandboxed` plugins.
    pub sandboxed: SandboxConfig,

    /// Limits for `trusted` plugins.
    pub trusted: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("storehook");

        Self {
            database: config_dir.join("plugins.db"),
            config_dir,
            tenant: None,
            disabled_plugins: HashSet::new(),
            sandboxed: SandboxConfig::sandboxed(),
            trusted: SandboxConfig::trusted(),
        }
    }
}

/// On-disk shape of the configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    database: Option<PathBuf>,
    tenant: Option<String>,
    disabled_plugins: Vec<String>,
    sandboxed: TierOverrides,
    trusted: TierOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TierOverrides {
    timeout_ms: Option<u64>,
    max_operations: Option<u64>,
    max_call_levels: Option<usize>,
    max_expr_depth: Option<usize>,
    max_string_size: Option<usize>,
    max_array_size: Option<usize>,
    max_map_size: Option<usize>,
    max_console_lines: Option<usize>,
    capabilities: Option<BTreeSet<Capability>>,
}

impl TierOverrides {
    fn apply(self, mut base: SandboxConfig) -> SandboxConfig {
        if let Some(v) = self.timeout_ms {
            base.timeout_ms = v;
        }
        if let Some(v) = self.max_operations {
            base.max_operations = v;
        }
        if let Some(v) = self.max_call_levels {
            base.max_call_levels = v;
        }
        if let Some(v) = self.max_expr_depth {
            base.max_expr_depth = v;
        }
        if let Some(v) = self.max_string_size {
            base.max_string_size = v;
        }
        if let Some(v) = self.max_array_size {
            base.max_array_size = v;
        }
        if let Some(v) = self.max_map_size {
            base.max_map_size = v;
        }
        if let Some(v) = self.max_console_lines {
            base.max_console_lines = Some(v);
        }
        if let Some(v) = self.capabilities {
            base.capabilities = v;
        }
        base
    }
}

impl RuntimeConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        Self::default().config_dir.join("config.toml")
    }

    /// Parse configuration text, filling gaps with the defaults.
    pub fn from_toml_str(text: &str) -> PluginResult<Self> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| PluginError::config(e.to_string()))?;
        let defaults = Self::default();

        Ok(Self {
            database: file.database.unwrap_or(defaults.database),
            config_dir: defaults.config_dir,
            tenant: file.tenant,
            disabled_plugins: file.disabled_plugins.into_iter().collect(),
            sandboxed: file.sandboxed.apply(defaults.sandboxed),
            trusted: file.trusted.apply(defaults.trusted),
        })
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(dir) = path.parent() {
            config.config_dir = dir.to_path_buf();
        }
        tracing::debug!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    /// Load an explicit file, or the default file if it exists, or the
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> PluginResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Filter `load_all_plugins` by a tenant's overrides.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Use a different plugin database.
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    /// Replace the limits of one trust tier.
    pub fn with_sandbox(mut self, level: SecurityLevel, sandbox: SandboxConfig) -> Self {
        match level {
            SecurityLevel::Sandboxed => self.sandboxed = sandbox,
            SecurityLevel::Trusted => self.trusted = sandbox,
        }
        self
    }

    /// Disable a specific plugin.
    pub fn disable_plugin(mut self, id: impl Into<String>) -> Self {
        self.disabled_plugins.insert(id.into());
        self
    }

    /// Check if a plugin is disabled.
    pub fn is_disabled(&self, id: &str) -> bool {
        self.disabled_plugins.contains(id)
    }

    /// Limits of one trust tier.
    pub fn sandbox(&self, level: SecurityLevel) -> &SandboxConfig {
        match level {
            SecurityLevel::Sandboxed => &self.sandboxed,
            SecurityLevel::Trusted => &self.trusted,
        }
    }
}
