//! Execution engines.
//!
//! An [`ExecutionEngine`] is a factory for one trust tier. It creates an
//! [`ExecutionContext`] per loaded plugin; the context owns the script
//! engine and the watchdog, and is the only thing that ever runs plugin code.
//!
//! Units do not share functions. Every function pointer a unit exports is
//! sealed with that unit's own function library, so it resolves the same
//! names wherever it is called from.

mod capabilities;
mod convert;
mod runtime;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rhai::{AST, Dynamic, FnPtr, Map};
use serde_json::Value;
use storehook_core::SecurityLevel;
use tokio_util::sync::CancellationToken;

use crate::context::{ModuleTable, PluginData};
use crate::sandbox::SandboxConfig;
use crate::types::PluginResult;

pub use self::convert::{dynamic_to_json, json_to_dynamic};
pub use self::runtime::{SandboxedEngine, TrustedEngine};

/// Type alias for boxed futures returned by async engine methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-tier factory of plugin execution contexts.
pub trait ExecutionEngine: Send + Sync {
    /// Engine name used in logs.
    fn name(&self) -> &'static str;

    /// Trust tier served by this engine.
    fn level(&self) -> SecurityLevel;

    /// Limits and capabilities applied to every context.
    fn sandbox(&self) -> &SandboxConfig;

    /// Create an isolated context bound to one plugin.
    fn create_context(&self, bindings: ContextBindings) -> PluginResult<Box<dyn ExecutionContext>>;
}

/// A plugin's private evaluation environment.
///
/// Runs are serialized per context, including offloaded runs the caller
/// stopped waiting for.
pub trait ExecutionContext: Send + Sync {
    /// Execute one transformed unit and return what it exported.
    fn execute<'a>(&'a self, unit: &'a str, source: &'a str) -> BoxFuture<'a, PluginResult<Exports>>;

    /// Invoke an exported handler with JSON arguments.
    fn call<'a>(
        &'a self,
        unit: &'a str,
        callable: &'a Callable,
        args: Vec<Value>,
    ) -> BoxFuture<'a, PluginResult<Value>>;
}

/// Host state a context closes its capabilities over.
#[derive(Clone)]
pub struct ContextBindings {
    pub plugin_id: String,
    pub modules: Arc<ModuleTable>,
    pub data: PluginData,
    pub cancel: CancellationToken,
}

/// What one unit exported, plus the functions it defined.
#[derive(Clone)]
pub struct Exports {
    value: Dynamic,
    library: Arc<AST>,
}

impl Exports {
    pub(crate) fn new(value: Dynamic, library: Arc<AST>) -> Self {
        Self { value, library }
    }

    /// The raw exported value.
    pub fn value(&self) -> &Dynamic {
        &self.value
    }

    /// The exported value as JSON. Function pointers become `null`.
    pub fn to_json(&self) -> Value {
        dynamic_to_json(&self.value)
    }

    /// The exported handler: the export itself when it is a function
    /// pointer, otherwise the `handler` field of an exported map.
    pub fn handler(&self) -> Option<Callable> {
        let value = self.value.flatten_clone();
        let fn_ptr = match value.clone().try_cast::<FnPtr>() {
            Some(fn_ptr) => fn_ptr,
            None => value
                .try_cast::<Map>()?
                .get("handler")?
                .flatten_clone()
                .try_cast::<FnPtr>()?,
        };
        Some(Callable {
            fn_ptr,
            library: Arc::clone(&self.library),
        })
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("value", &self.to_json())
            .field("functions", &self.library.iter_functions().count())
            .finish()
    }
}

/// A script function that can be invoked later through its context,
/// together with the library of the unit that defined it.
#[derive(Clone)]
pub struct Callable {
    pub(crate) fn_ptr: FnPtr,
    pub(crate) library: Arc<AST>,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callable").field(&self.fn_ptr.fn_name()).finish()
    }
}

impl Callable {
    /// Name of the target function.
    pub fn name(&self) -> &str {
        self.fn_ptr.fn_name()
    }
}

/// Build the engine for a trust tier.
pub fn engine_for(level: SecurityLevel, sandbox: SandboxConfig) -> Arc<dyn ExecutionEngine> {
    match level {
        SecurityLevel::Sandboxed => Arc::new(SandboxedEngine::new(sandbox)),
        SecurityLevel::Trusted => Arc::new(TrustedEngine::new(sandbox)),
    }
}
