//! Hook and event dispatch across loaded plugins.

use std::sync::Arc;

use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;

use crate::context::{PluginContext, Registration};
use crate::loader::PluginLoader;

/// Result of one hook handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookOutput {
    pub plugin_id: String,
    pub result: Value,
}

/// Delivery counts of one emitted event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitSummary {
    pub delivered: usize,
    pub failed: usize,
}

/// Invokes the hook handlers and event listeners of live contexts.
///
/// Handlers run one at a time, lowest priority first; equal priorities run
/// in plugin load order. A failing handler is logged and skipped.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    loader: Arc<PluginLoader>,
}

impl Dispatcher {
    pub fn new(loader: Arc<PluginLoader>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// Call every enabled handler of `name` and collect the results of the
    /// ones that succeeded.
    pub async fn execute_hook(&self, name: &str, args: Vec<Value>) -> Vec<HookOutput> {
        let targets = self.targets(name, PluginContext::hook);
        tracing::debug!(hook = name, handlers = targets.len(), "Executing hook");

        let mut outputs = Vec::with_capacity(targets.len());
        for (context, registration) in targets {
            let plugin_id = context.plugin_id();
            let unit = format!("{plugin_id}#hook:{name}");
            match context
                .runtime()
                .call(&unit, &registration.handler, args.clone())
                .await
            {
                Ok(result) => outputs.push(HookOutput {
                    plugin_id: plugin_id.to_string(),
                    result,
                }),
                Err(e) => {
                    tracing::warn!(plugin_id, hook = name, error = %e, "Hook handler failed");
                }
            }
        }
        outputs
    }

    /// Deliver `data` to every enabled listener of `name`.
    pub async fn emit_event(&self, name: &str, data: Value) -> EmitSummary {
        let targets = self.targets(name, PluginContext::event);
        let mut summary = EmitSummary::default();

        for (context, registration) in targets {
            let plugin_id = context.plugin_id();
            let unit = format!("{plugin_id}#event:{name}");
            match context
                .runtime()
                .call(&unit, &registration.handler, vec![data.clone()])
                .await
            {
                Ok(_) => summary.delivered += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(plugin_id, event = name, error = %e, "Event listener failed");
                }
            }
        }

        tracing::debug!(
            event = name,
            delivered = summary.delivered,
            failed = summary.failed,
            "Emitted event"
        );
        summary
    }

    fn targets(
        &self,
        name: &str,
        lookup: impl Fn(&PluginContext, &str) -> Option<Registration>,
    ) -> Vec<(Arc<PluginContext>, Registration)> {
        self.loader
            .contexts()
            .into_iter()
            .filter(|context| !context.is_cancelled())
            .filter_map(|context| {
                let registration = lookup(context.as_ref(), name)?;
                registration.enabled.then_some((context, registration))
            })
            .sorted_by_key(|(_, registration)| registration.priority)
            .collect()
    }
}
