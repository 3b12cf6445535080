//! Plugin runtime for storehook.
//!
//! Plugins are stored as records in a [`Registry`](storehook_core::Registry):
//! bundled dependencies, source modules, hook handlers and event listeners,
//! all written in Rhai with ES-style `import`/`export` statements. The
//! [`PluginLoader`] turns those records into live [`PluginContext`]s and the
//! [`Dispatcher`] invokes their handlers by name.
//!
//! # Architecture
//!
//! - [`transform`] rewrites `import`/`export` into `require(..)` calls and
//!   assignments to the injected `unit.exports` record.
//! - [`ExecutionEngine`] is the seam between the loader and the script
//!   engine. There is one engine per trust tier: [`TrustedEngine`] runs
//!   inline with generous limits; [`SandboxedEngine`] runs on a blocking
//!   thread with strict limits and a reduced capability set.
//! - Every context has a wall-clock watchdog and a cancellation token.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use storehook_plugin::{Dispatcher, PluginLoader, RuntimeConfig};
//!
//! let loader = Arc::new(PluginLoader::new(registry, RuntimeConfig::default()));
//! loader.load_all_plugins().await?;
//!
//! let dispatcher = Dispatcher::new(Arc::clone(&loader));
//! let outputs = dispatcher.execute_hook("product.render", vec![product]).await;
//! dispatcher.emit_event("order.created", order).await;
//! ```

mod bundle;
mod config;
mod context;
mod dispatcher;
pub mod engine;
mod loader;
mod sandbox;
pub mod transform;
mod types;

pub use bundle::{Bundle, BundleManifest, InstallReport, MANIFEST_FILE};
pub use config::RuntimeConfig;
pub use context::{ModuleTable, PluginContext, PluginData, Registration, normalize_path};
pub use dispatcher::{Dispatcher, EmitSummary, HookOutput};
pub use engine::{
    Callable, ContextBindings, ExecutionContext, ExecutionEngine, Exports, SandboxedEngine, TrustedEngine,
};
pub use loader::{LoadReport, PluginLoader};
pub use sandbox::{Capability, SandboxConfig};
pub use transform::{TransformError, transform};
pub use types::{PluginError, PluginResult};
