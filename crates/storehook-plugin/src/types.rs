//! Error types for the plugin runtime.

use storehook_core::StoreError;
use thiserror::Error;

use crate::transform::TransformError;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors raised while loading plugins or invoking their handlers.
///
/// `unit` names the piece of source involved, e.g. `reviews/index.rhai`,
/// `reviews#hook:page.render` or `reviews#dep:money@1.2.0`.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin row with this id.
    #[error("Plugin not found: {id}")]
    NotFound { id: String },

    /// The plugin exists but is not active.
    #[error("Plugin '{id}' is not active")]
    Inactive { id: String },

    /// The plugin is listed as disabled in the runtime configuration.
    #[error("Plugin '{id}' is disabled by configuration")]
    Disabled { id: String },

    /// The store failed underneath the registry.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Import/export syntax could not be rewritten.
    #[error("Failed to transform '{unit}': {source}")]
    Transform {
        unit: String,
        #[source]
        source: TransformError,
    },

    /// Source did not compile.
    #[error("Failed to compile '{unit}': {message}")]
    Compile { unit: String, message: String },

    /// Source raised an error while running.
    #[error("'{unit}' failed: {message}")]
    Execution { unit: String, message: String },

    /// The watchdog stopped a run that exceeded its budget.
    #[error("'{unit}' timed out after {timeout_ms}ms")]
    Timeout { unit: String, timeout_ms: u64 },

    /// The owning context was cancelled while the run was in progress.
    #[error("'{unit}' was cancelled")]
    Cancelled { unit: String },

    /// Source called a capability its trust tier does not grant.
    #[error("'{unit}' used capability '{capability}', which is not granted")]
    CapabilityDenied { unit: String, capability: String },

    /// A hook or event unit did not export a callable handler.
    #[error("'{unit}' does not export a handler function")]
    MissingHandler { unit: String },

    /// Invalid runtime configuration or bundle manifest.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error came from the store rather than from plugin code.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
