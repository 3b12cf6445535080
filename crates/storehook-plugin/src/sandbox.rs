//! Trust-tier limits and capability grants.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Host facilities a script may reach, each bound as a module of the same
/// name (`console::log`, `plugin_data::get`, ...).
///
/// `require` is not listed: module resolution is part of the execution
/// protocol and always bound.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// Logging routed to the host's tracing output.
    Console,

    /// The plugin's private key/value data area.
    PluginData,

    /// Monotonic clock and remaining execution budget.
    Timers,

    /// JSON parsing and encoding.
    Json,

    /// Wall-clock date and time.
    Date,
}

/// Limits and grants applied to every run in a plugin context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Wall-clock budget of a single execute or call, in milliseconds.
    pub timeout_ms: u64,

    /// Maximum script operations per run (0 = unlimited).
    pub max_operations: u64,

    /// Maximum function call nesting.
    pub max_call_levels: usize,

    /// Maximum expression nesting accepted by the parser.
    pub max_expr_depth: usize,

    /// Maximum string length in bytes.
    pub max_string_size: usize,

    /// Maximum array length.
    pub max_array_size: usize,

    /// Maximum object map size.
    pub max_map_size: usize,

    /// Console lines a context may emit before further output is dropped.
    pub max_console_lines: Option<usize>,

    /// Granted capabilities.
    pub capabilities: BTreeSet<Capability>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::sandboxed()
    }
}

impl SandboxConfig {
    /// Strict limits for untrusted plugins. Timers are not granted.
    pub fn sandboxed() -> Self {
        Self {
            timeout_ms: 1000,
            max_operations: 100_000,
            max_call_levels: 32,
            max_expr_depth: 32,
            max_string_size: 100 * 1024,
            max_array_size: 1000,
            max_map_size: 1000,
            max_console_lines: Some(200),
            capabilities: Capability::iter()
                .filter(|c| *c != Capability::Timers)
                .collect(),
        }
    }

    /// Generous limits and every capability, for trusted plugins.
    pub fn trusted() -> Self {
        Self {
            timeout_ms: 30_000,
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_console_lines: None,
            capabilities: Capability::iter().collect(),
        }
    }

    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the operation budget.
    pub fn with_max_operations(mut self, operations: u64) -> Self {
        self.max_operations = operations;
        self
    }

    /// Grant a capability.
    pub fn grant(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Withdraw a capability.
    pub fn revoke(mut self, capability: Capability) -> Self {
        self.capabilities.remove(&capability);
        self
    }

    /// Check if a capability is granted.
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// The per-run timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let sandboxed = SandboxConfig::sandboxed();
        assert!(!sandboxed.allows(Capability::Timers));
        assert!(sandboxed.allows(Capability::Console));
        assert!(sandboxed.max_console_lines.is_some());

        let trusted = SandboxConfig::trusted();
        assert!(Capability::iter().all(|c| trusted.allows(c)));
        assert!(trusted.timeout_ms > sandboxed.timeout_ms);
    }

    #[test]
    fn test_grant_and_revoke() {
        let config = SandboxConfig::sandboxed()
            .grant(Capability::Timers)
            .revoke(Capability::PluginData)
            .with_timeout(50);

        assert!(config.allows(Capability::Timers));
        assert!(!config.allows(Capability::PluginData));
        assert_eq!(config.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_capability_names_match_script_modules() {
        assert_eq!(Capability::PluginData.to_string(), "plugin_data");
        assert_eq!("timers".parse::<Capability>().unwrap(), Capability::Timers);
    }
}
