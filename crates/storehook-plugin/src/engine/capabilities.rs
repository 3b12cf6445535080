//! Host functions bound into plugin engines.
//!
//! Each [`Capability`] is a static module named after it. A capability the
//! tier does not grant is still bound, but every function in it fails with
//! a `capability denied` error so scripts get a clear message instead of an
//! unknown-function error.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{TimeDelta, Utc};
use rhai::{Dynamic, Engine, EvalAltResult, INT, Map, Module};

use super::convert::{dynamic_to_json, json_to_dynamic};
use super::runtime::Watchdog;
use crate::context::{ModuleTable, PluginData};
use crate::sandbox::{Capability, SandboxConfig};
use crate::transform::REQUIRE_FN;

/// Prefix of the runtime error raised by a denied capability.
pub(crate) const DENIED_PREFIX: &str = "capability denied: ";

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Everything the capabilities of one context close over.
pub(crate) struct CapabilityHost {
    pub plugin_id: Arc<str>,
    pub modules: Arc<ModuleTable>,
    pub data: PluginData,
    pub watchdog: Arc<Watchdog>,
}

/// Bind `require`, `print`/`debug` and every capability module.
pub(crate) fn install(engine: &mut Engine, host: &CapabilityHost, sandbox: &SandboxConfig) {
    let modules = Arc::clone(&host.modules);
    engine.register_fn(REQUIRE_FN, move |name: &str| -> ScriptResult<Dynamic> {
        match modules.resolve(name) {
            Some(exports) => Ok(exports.value().clone()),
            None => Err(format!("module '{name}' not found").into()),
        }
    });

    let console = Arc::new(Console::new(Arc::clone(&host.plugin_id), sandbox.max_console_lines));
    if sandbox.allows(Capability::Console) {
        let out = Arc::clone(&console);
        engine.on_print(move |text| out.write(Level::Info, text));
        let out = Arc::clone(&console);
        engine.on_debug(move |text, _source, _pos| out.write(Level::Debug, text));
    }

    for capability in [
        Capability::Console,
        Capability::PluginData,
        Capability::Timers,
        Capability::Json,
        Capability::Date,
    ] {
        let module = if sandbox.allows(capability) {
            match capability {
                Capability::Console => console_module(&console),
                Capability::PluginData => data_module(&host.data),
                Capability::Timers => timers_module(&host.watchdog),
                Capability::Json => json_module(),
                Capability::Date => date_module(),
            }
        } else {
            denied_module(capability)
        };
        engine.register_static_module(capability.to_string(), module.into());
    }
}

fn script_error(err: impl Display) -> Box<EvalAltResult> {
    err.to_string().into()
}

// ==================== console ====================

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
    Debug,
}

/// Console sink of one context. Lines past the cap are dropped.
struct Console {
    plugin_id: Arc<str>,
    emitted: AtomicUsize,
    cap: Option<usize>,
}

impl Console {
    fn new(plugin_id: Arc<str>, cap: Option<usize>) -> Self {
        Self {
            plugin_id,
            emitted: AtomicUsize::new(0),
            cap,
        }
    }

    fn write(&self, level: Level, message: &str) {
        let n = self.emitted.fetch_add(1, Ordering::Relaxed);
        if let Some(cap) = self.cap {
            if n == cap {
                tracing::warn!(
                    target: "plugin",
                    plugin_id = %self.plugin_id,
                    "Console limit of {cap} lines reached, dropping further output"
                );
            }
            if n >= cap {
                return;
            }
        }

        let plugin_id = &*self.plugin_id;
        match level {
            Level::Info => tracing::info!(target: "plugin", plugin_id, "{message}"),
            Level::Warn => tracing::warn!(target: "plugin", plugin_id, "{message}"),
            Level::Error => tracing::error!(target: "plugin", plugin_id, "{message}"),
            Level::Debug => tracing::debug!(target: "plugin", plugin_id, "{message}"),
        }
    }
}

fn console_module(console: &Arc<Console>) -> Module {
    let mut module = Module::new();
    for (name, level) in [
        ("log", Level::Info),
        ("info", Level::Info),
        ("warn", Level::Warn),
        ("error", Level::Error),
        ("debug", Level::Debug),
    ] {
        let console = Arc::clone(console);
        module.set_native_fn(name, move |value: Dynamic| -> ScriptResult<()> {
            console.write(level, &value.to_string());
            Ok(())
        });
    }
    module
}

// ==================== plugin_data ====================

fn data_module(data: &PluginData) -> Module {
    let mut module = Module::new();

    let d = data.clone();
    module.set_native_fn("get", move |key: &str| -> ScriptResult<Dynamic> {
        let value = d.get(key).map_err(script_error)?;
        Ok(value.as_ref().map_or(Dynamic::UNIT, json_to_dynamic))
    });

    let d = data.clone();
    module.set_native_fn("entry", move |key: &str| -> ScriptResult<Dynamic> {
        let Some(entry) = d.entry(key).map_err(script_error)? else {
            return Ok(Dynamic::UNIT);
        };
        let mut map = Map::new();
        map.insert("value".into(), json_to_dynamic(&entry.value));
        map.insert(
            "expires_at".into(),
            entry
                .expires_at
                .map_or(Dynamic::UNIT, |at| Dynamic::from(at.to_rfc3339())),
        );
        Ok(Dynamic::from(map))
    });

    let d = data.clone();
    module.set_native_fn("set", move |key: &str, value: Dynamic| -> ScriptResult<()> {
        d.set(key, dynamic_to_json(&value), None).map_err(script_error)
    });

    let d = data.clone();
    module.set_native_fn(
        "set",
        move |key: &str, value: Dynamic, ttl_ms: INT| -> ScriptResult<()> {
            let expires_at = TimeDelta::try_milliseconds(ttl_ms)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .ok_or_else(|| script_error(format!("ttl of {ttl_ms}ms is out of range")))?;
            d.set(key, dynamic_to_json(&value), Some(expires_at))
                .map_err(script_error)
        },
    );

    let d = data.clone();
    module.set_native_fn("delete", move |key: &str| -> ScriptResult<bool> {
        d.delete(key).map_err(script_error)
    });

    module
}

// ==================== timers ====================

fn timers_module(watchdog: &Arc<Watchdog>) -> Module {
    let mut module = Module::new();

    let w = Arc::clone(watchdog);
    module.set_native_fn("now", move || -> ScriptResult<INT> { Ok(w.elapsed_ms()) });

    let w = Arc::clone(watchdog);
    module.set_native_fn("remaining", move || -> ScriptResult<INT> { Ok(w.remaining_ms()) });

    module
}

// ==================== json ====================

fn json_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("parse", |text: &str| -> ScriptResult<Dynamic> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(script_error)?;
        Ok(json_to_dynamic(&value))
    });

    module.set_native_fn("stringify", |value: Dynamic| -> ScriptResult<String> {
        serde_json::to_string(&dynamic_to_json(&value)).map_err(script_error)
    });

    module
}

// ==================== date ====================

fn date_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("now", || -> ScriptResult<String> { Ok(Utc::now().to_rfc3339()) });
    module.set_native_fn("timestamp", || -> ScriptResult<INT> {
        Ok(Utc::now().timestamp_millis())
    });
    module
}

// ==================== denied ====================

fn denied_module(capability: Capability) -> Module {
    let names: &[&str] = match capability {
        Capability::Console => &["log", "info", "warn", "error", "debug"],
        Capability::PluginData => &["get", "entry", "set", "delete"],
        Capability::Timers => &["now", "remaining"],
        Capability::Json => &["parse", "stringify"],
        Capability::Date => &["now", "timestamp"],
    };

    let message = format!("{DENIED_PREFIX}{capability}");
    let mut module = Module::new();
    for name in names {
        let m = message.clone();
        module.set_native_fn(*name, move || -> ScriptResult<Dynamic> { Err(m.clone().into()) });
        let m = message.clone();
        module.set_native_fn(*name, move |_: Dynamic| -> ScriptResult<Dynamic> {
            Err(m.clone().into())
        });
        let m = message.clone();
        module.set_native_fn(*name, move |_: Dynamic, _: Dynamic| -> ScriptResult<Dynamic> {
            Err(m.clone().into())
        });
    }
    module
}
