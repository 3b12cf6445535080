//! Rhai-backed execution engines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage, MoreStringPackage, Package,
};
use rhai::{AST, Array, Dynamic, Engine, EvalAltResult, FnPtr, INT, Map, Scope};
use serde_json::Value;
use storehook_core::SecurityLevel;
use tokio_util::sync::CancellationToken;

use super::capabilities::{self, CapabilityHost, DENIED_PREFIX};
use super::convert::{dynamic_to_json, json_to_dynamic};
use super::{BoxFuture, Callable, ContextBindings, ExecutionContext, ExecutionEngine, Exports};
use crate::sandbox::SandboxConfig;
use crate::transform::EXPORTS_RECORD;
use crate::types::{PluginError, PluginResult};

/// Termination token for an exceeded deadline.
const TIMED_OUT: &str = "timeout";

/// Termination token for a cancelled context.
const CANCELLED: &str = "cancelled";

/// Operations between two deadline checks.
const CHECK_INTERVAL: u64 = 256;

/// Slack given to an offloaded run before the caller stops waiting for it.
const OFFLOAD_GRACE: Duration = Duration::from_millis(250);

const DISARMED: u64 = u64::MAX;

/// Name given to sealed anonymous functions.
const SEALED_CLOSURE: &str = "closure";

/// Wall-clock deadline and cancellation checked from the engine's
/// progress callback.
pub(crate) struct Watchdog {
    created: Instant,
    /// Deadline as microseconds since `created`.
    deadline: AtomicU64,
    cancel: CancellationToken,
}

impl Watchdog {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            created: Instant::now(),
            deadline: AtomicU64::new(DISARMED),
            cancel,
        }
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn arm(&self, budget: Duration) {
        let budget = u64::try_from(budget.as_micros()).unwrap_or(u64::MAX);
        self.deadline
            .store(self.now_us().saturating_add(budget), Ordering::Release);
    }

    fn disarm(&self) {
        self.deadline.store(DISARMED, Ordering::Release);
    }

    /// Milliseconds since the context was created.
    pub(crate) fn elapsed_ms(&self) -> INT {
        INT::try_from(self.created.elapsed().as_millis()).unwrap_or(INT::MAX)
    }

    /// Milliseconds left in the current run, 0 once exceeded.
    pub(crate) fn remaining_ms(&self) -> INT {
        let deadline = self.deadline.load(Ordering::Acquire);
        if deadline == DISARMED {
            return 0;
        }
        INT::try_from(deadline.saturating_sub(self.now_us()) / 1000).unwrap_or(INT::MAX)
    }

    fn verdict(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            return Some(CANCELLED);
        }
        let deadline = self.deadline.load(Ordering::Acquire);
        (deadline != DISARMED && self.now_us() >= deadline).then_some(TIMED_OUT)
    }
}

/// Build a raw engine with an explicit package list and the tier's limits.
fn build_engine(sandbox: &SandboxConfig, watchdog: &Arc<Watchdog>, allow_eval: bool) -> Engine {
    let mut engine = Engine::new_raw();

    CorePackage::new().register_into_engine(&mut engine);
    LogicPackage::new().register_into_engine(&mut engine);
    MoreStringPackage::new().register_into_engine(&mut engine);
    BasicArrayPackage::new().register_into_engine(&mut engine);
    BasicMapPackage::new().register_into_engine(&mut engine);
    BasicMathPackage::new().register_into_engine(&mut engine);

    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());

    engine.set_max_expr_depths(sandbox.max_expr_depth, sandbox.max_expr_depth);
    engine.set_max_call_levels(sandbox.max_call_levels);
    engine.set_max_operations(sandbox.max_operations);
    engine.set_max_string_size(sandbox.max_string_size);
    engine.set_max_array_size(sandbox.max_array_size);
    engine.set_max_map_size(sandbox.max_map_size);

    let watchdog = Arc::clone(watchdog);
    engine.on_progress(move |ops| {
        if ops % CHECK_INTERVAL != 0 {
            return None;
        }
        watchdog.verdict().map(|token| Dynamic::from(token.to_string()))
    });

    if !allow_eval {
        engine.disable_symbol("eval");
    }

    engine
}

/// Script state of one plugin context.
struct RhaiState {
    engine: Engine,
    watchdog: Arc<Watchdog>,
    timeout: Duration,
}

impl RhaiState {
    fn new(bindings: ContextBindings, sandbox: &SandboxConfig, allow_eval: bool) -> Self {
        let watchdog = Arc::new(Watchdog::new(bindings.cancel));
        let mut engine = build_engine(sandbox, &watchdog, allow_eval);

        let host = CapabilityHost {
            plugin_id: Arc::from(bindings.plugin_id),
            modules: bindings.modules,
            data: bindings.data,
            watchdog: Arc::clone(&watchdog),
        };
        capabilities::install(&mut engine, &host, sandbox);

        Self {
            engine,
            watchdog,
            timeout: sandbox.timeout(),
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn ensure_live(&self, unit: &str) -> PluginResult<()> {
        if self.watchdog.cancel.is_cancelled() {
            return Err(PluginError::Cancelled { unit: unit.to_string() });
        }
        Ok(())
    }

    /// Run `f` with the deadline armed.
    fn guarded<T>(&self, f: impl FnOnce() -> Result<T, Box<EvalAltResult>>) -> Result<T, Box<EvalAltResult>> {
        self.watchdog.arm(self.timeout);
        let result = f();
        self.watchdog.disarm();
        result
    }

    fn run_unit(&self, unit: &str, source: &str) -> PluginResult<Exports> {
        self.ensure_live(unit)?;

        let ast = self.engine.compile(source).map_err(|e| PluginError::Compile {
            unit: unit.to_string(),
            message: e.to_string(),
        })?;
        let library = Arc::new(ast.clone_functions_only());

        let mut record = Map::new();
        record.insert("exports".into(), Dynamic::from(Map::new()));
        let mut scope = Scope::new();
        scope.push(EXPORTS_RECORD, record);

        self.guarded(|| self.engine.run_ast_with_scope(&mut scope, &ast))
            .map_err(|e| self.map_error(unit, &e))?;

        let value = scope
            .get_value::<Map>(EXPORTS_RECORD)
            .and_then(|record| record.get("exports").cloned())
            .unwrap_or(Dynamic::UNIT);

        Ok(Exports::new(seal(value, &library), library))
    }

    fn call(&self, unit: &str, callable: &Callable, args: Vec<Value>) -> PluginResult<Value> {
        self.ensure_live(unit)?;

        let args: Vec<Dynamic> = args.iter().map(json_to_dynamic).collect();
        let result = self
            .guarded(|| callable.fn_ptr.call::<Dynamic>(&self.engine, &callable.library, args))
            .map_err(|e| self.map_error(unit, &e))?;

        Ok(dynamic_to_json(&result))
    }

    fn map_error(&self, unit: &str, err: &EvalAltResult) -> PluginError {
        let unit = unit.to_string();
        match innermost(err) {
            EvalAltResult::ErrorTerminated(token, _) if token.to_string() == CANCELLED => {
                PluginError::Cancelled { unit }
            }
            EvalAltResult::ErrorTerminated(..) => PluginError::Timeout {
                unit,
                timeout_ms: self.timeout_ms(),
            },
            EvalAltResult::ErrorRuntime(value, _) => match value.to_string().strip_prefix(DENIED_PREFIX) {
                Some(capability) => PluginError::CapabilityDenied {
                    unit,
                    capability: capability.to_string(),
                },
                None => PluginError::Execution {
                    unit,
                    message: err.to_string(),
                },
            },
            EvalAltResult::ErrorParsing(..) => PluginError::Compile {
                unit,
                message: err.to_string(),
            },
            _ => PluginError::Execution {
                unit,
                message: err.to_string(),
            },
        }
    }
}

/// Bind every function pointer in an exported value to the library of the
/// unit that exported it. Maps and arrays are walked.
fn seal(value: Dynamic, library: &Arc<AST>) -> Dynamic {
    let value = value.flatten();
    if value.is_fnptr() {
        return match value.try_cast::<FnPtr>() {
            Some(target) => seal_fn(target, library),
            None => Dynamic::UNIT,
        };
    }
    if value.is_map() {
        return match value.try_cast::<Map>() {
            Some(map) => Dynamic::from_map(
                map.into_iter()
                    .map(|(key, item)| (key, seal(item, library)))
                    .collect(),
            ),
            None => Dynamic::UNIT,
        };
    }
    if value.is_array() {
        return match value.try_cast::<Array>() {
            Some(items) => Dynamic::from_array(items.into_iter().map(|item| seal(item, library)).collect()),
            None => Dynamic::UNIT,
        };
    }
    value
}

#[allow(deprecated)] // `FnPtr::from_fn` is marked volatile, not deprecated
fn seal_fn(target: FnPtr, library: &Arc<AST>) -> Dynamic {
    let name = match FnPtr::new(target.fn_name()) {
        Ok(_) => target.fn_name().to_string(),
        Err(_) => SEALED_CLOSURE.to_string(),
    };
    let fallback = target.clone();
    let library = Arc::clone(library);

    let sealed = FnPtr::from_fn(name, move |context, args| {
        let args: Vec<Dynamic> = args.iter_mut().map(|arg| std::mem::take(&mut **arg)).collect();
        target.call::<Dynamic>(context.engine(), &library, args)
    });
    sealed.map_or_else(|_| Dynamic::from(fallback), Dynamic::from)
}

/// Unwrap the call and module frames wrapped around the actual error.
fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => {
            innermost(inner)
        }
        _ => err,
    }
}

/// Where a context evaluates its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// On the calling task.
    Inline,
    /// On a blocking thread, bounded by an outer timeout.
    Offloaded,
}

/// A plugin context backed by one rhai engine.
pub struct RhaiContext {
    state: Arc<RhaiState>,
    placement: Placement,
    /// Serializes runs, which share the watchdog deadline. An offloaded
    /// job holds its turn until the job itself ends.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl RhaiContext {
    fn new(bindings: ContextBindings, sandbox: &SandboxConfig, placement: Placement) -> Self {
        let allow_eval = placement == Placement::Inline;
        Self {
            state: Arc::new(RhaiState::new(bindings, sandbox, allow_eval)),
            placement,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn run<T, F>(&self, unit: &str, job: F) -> PluginResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RhaiState) -> PluginResult<T> + Send + 'static,
    {
        if self.placement == Placement::Inline {
            let _turn = self.gate.lock().await;
            return job(&*self.state);
        }

        let state = Arc::clone(&self.state);
        let gate = Arc::clone(&self.gate);
        let budget = state.timeout + OFFLOAD_GRACE;
        let offloaded = async move {
            let turn = gate.lock_owned().await;
            tokio::task::spawn_blocking(move || {
                let _turn = turn;
                job(&*state)
            })
            .await
        };

        match tokio::time::timeout(budget, offloaded).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PluginError::Execution {
                unit: unit.to_string(),
                message: format!("evaluation thread failed: {join}"),
            }),
            Err(_) => {
                tracing::warn!(unit, "Offloaded run did not finish within its budget");
                Err(PluginError::Timeout {
                    unit: unit.to_string(),
                    timeout_ms: self.state.timeout_ms(),
                })
            }
        }
    }
}

impl ExecutionContext for RhaiContext {
    fn execute<'a>(&'a self, unit: &'a str, source: &'a str) -> BoxFuture<'a, PluginResult<Exports>> {
        Box::pin(async move {
            let name = unit.to_string();
            let source = source.to_string();
            self.run(unit, move |state| state.run_unit(&name, &source))
                .await
        })
    }

    fn call<'a>(
        &'a self,
        unit: &'a str,
        callable: &'a Callable,
        args: Vec<Value>,
    ) -> BoxFuture<'a, PluginResult<Value>> {
        Box::pin(async move {
            let name = unit.to_string();
            let callable = callable.clone();
            self.run(unit, move |state| state.call(&name, &callable, args))
                .await
        })
    }
}

/// Engine for trusted plugins: evaluates inline with generous limits.
#[derive(Debug, Clone)]
pub struct TrustedEngine {
    sandbox: SandboxConfig,
}

impl TrustedEngine {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }
}

impl Default for TrustedEngine {
    fn default() -> Self {
        Self::new(SandboxConfig::trusted())
    }
}

impl ExecutionEngine for TrustedEngine {
    fn name(&self) -> &'static str {
        "rhai-trusted"
    }

    fn level(&self) -> SecurityLevel {
        SecurityLevel::Trusted
    }

    fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    fn create_context(&self, bindings: ContextBindings) -> PluginResult<Box<dyn ExecutionContext>> {
        Ok(Box::new(RhaiContext::new(bindings, &self.sandbox, Placement::Inline)))
    }
}

/// Engine for untrusted plugins: evaluates on a blocking thread with
/// strict limits, `eval` disabled and a reduced capability set.
#[derive(Debug, Clone)]
pub struct SandboxedEngine {
    sandbox: SandboxConfig,
}

impl SandboxedEngine {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }
}

impl Default for SandboxedEngine {
    fn default() -> Self {
        Self::new(SandboxConfig::sandboxed())
    }
}

impl ExecutionEngine for SandboxedEngine {
    fn name(&self) -> &'static str {
        "rhai-sandboxed"
    }

    fn level(&self) -> SecurityLevel {
        SecurityLevel::Sandboxed
    }

    fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    fn create_context(&self, bindings: ContextBindings) -> PluginResult<Box<dyn ExecutionContext>> {
        Ok(Box::new(RhaiContext::new(bindings, &self.sandbox, Placement::Offloaded)))
    }
}
