//! End-to-end tests for loading and dispatch.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use storehook_core::{
    MemoryStore, Plugin, PluginDependency, PluginEvent, PluginHook, PluginModule, PluginStatus, PluginStore, Query,
    Registry, Row, SecurityLevel, StoreResult, Table,
};
use storehook_plugin::{Dispatcher, PluginError, PluginLoader, RuntimeConfig, SandboxConfig, transform};

/// Store wrapper that records which plugin wrote plugin data, in order.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    data_writes: Mutex<Vec<String>>,
}

impl PluginStore for RecordingStore {
    fn query(&self, query: &Query) -> StoreResult<Vec<Row>> {
        self.inner.query(query)
    }

    fn upsert(&self, table: Table, row: Row) -> StoreResult<()> {
        if table == Table::Data {
            if let Some(Value::String(id)) = row.get("plugin_id") {
                self.data_writes.lock().unwrap().push(id.clone());
            }
        }
        self.inner.upsert(table, row)
    }

    fn update(&self, query: &Query, changes: Row) -> StoreResult<usize> {
        self.inner.update(query, changes)
    }

    fn delete(&self, query: &Query) -> StoreResult<usize> {
        self.inner.delete(query)
    }
}

fn registry() -> Registry {
    Registry::new(Arc::new(MemoryStore::new()))
}

fn plugin(id: &str, level: SecurityLevel) -> Plugin {
    Plugin::builder()
        .id(id)
        .name(id.to_uppercase())
        .status(PluginStatus::Active)
        .security_level(level)
        .build()
        .unwrap()
}

fn loader(registry: &Registry) -> Arc<PluginLoader> {
    Arc::new(PluginLoader::new(registry.clone(), RuntimeConfig::default()))
}

#[tokio::test]
async fn test_load_order_is_dependencies_modules_hooks_events() {
    let registry = registry();
    registry.register(&plugin("shop", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_dependency(&PluginDependency::new(
            "shop",
            "money",
            "1.0.0",
            r#"
            plugin_data::set("trace", ["D"]);
            export fn cents(x) { x * 100 }
            "#,
        ))
        .unwrap();
    registry
        .register_module(&PluginModule::new(
            "shop",
            "index.rhai",
            r#"
            import { cents } from "money";
            let trace = plugin_data::get("trace");
            trace.push("M");
            plugin_data::set("trace", trace);
            export const PRICE = cents.call(3);
            "#,
        ))
        .unwrap();
    registry
        .register_event(&PluginEvent::new(
            "shop",
            "order.created",
            r#"
            let trace = plugin_data::get("trace");
            trace.push("E");
            plugin_data::set("trace", trace);
            export default |order| order;
            "#,
        ))
        .unwrap();
    registry
        .register_hook(&PluginHook::new(
            "shop",
            "page.render",
            r#"
            let trace = plugin_data::get("trace");
            trace.push("H");
            plugin_data::set("trace", trace);
            export default |page| page;
            "#,
        ))
        .unwrap();

    let loader = loader(&registry);
    let context = loader.load_plugin("shop").await.unwrap();

    assert_eq!(context.data().get("trace").unwrap(), Some(json!(["D", "M", "H", "E"])));
    assert_eq!(context.module("index").unwrap().to_json(), json!({"PRICE": 300}));
}

#[tokio::test]
async fn test_module_aliases_share_one_export() {
    let registry = registry();
    registry.register(&plugin("acme", SecurityLevel::Trusted)).unwrap();
    registry
        .register_module(&PluginModule::new(
            "acme",
            "services/Foo.js",
            "export default #{ name: \"foo\" };",
        ))
        .unwrap();

    let context = loader(&registry).load_plugin("acme").await.unwrap();

    let bare = context.module("services/Foo").unwrap();
    let dotted = context.module("./services/Foo").unwrap();
    let prefixed = context.module("acme/services/Foo").unwrap();
    assert!(Arc::ptr_eq(&bare, &dotted));
    assert!(Arc::ptr_eq(&bare, &prefixed));
    assert_eq!(bare.to_json(), json!({"name": "foo"}));
}

#[tokio::test]
async fn test_modules_require_earlier_modules() {
    let registry = registry();
    registry.register(&plugin("cart", SecurityLevel::Trusted)).unwrap();
    registry
        .register_module(
            &PluginModule::new("cart", "lib/tax.rhai", "export fn with_tax(x) { x * 2 }").with_priority(1),
        )
        .unwrap();
    registry
        .register_module(
            &PluginModule::new(
                "cart",
                "index.rhai",
                "import tax from \"./lib/tax.rhai\";\nexport default tax.with_tax.call(21);",
            )
            .with_priority(2),
        )
        .unwrap();

    let context = loader(&registry).load_plugin("cart").await.unwrap();
    assert_eq!(context.module("index").unwrap().to_json(), json!(42));
}

#[tokio::test]
async fn test_handlers_with_the_same_name_stay_separate() {
    let registry = registry();
    registry.register(&plugin("p", SecurityLevel::Trusted)).unwrap();
    registry
        .register_hook(&PluginHook::new("p", "price.double", "export fn handler(n) { n * 2 }"))
        .unwrap();
    registry
        .register_hook(&PluginHook::new("p", "price.inc", "export fn handler(n) { n + 1 }"))
        .unwrap();

    let loader = loader(&registry);
    loader.load_plugin("p").await.unwrap();
    let dispatcher = Dispatcher::new(loader);

    let doubled = dispatcher.execute_hook("price.double", vec![json!(10)]).await;
    let bumped = dispatcher.execute_hook("price.inc", vec![json!(10)]).await;
    assert_eq!(doubled[0].result, json!(20));
    assert_eq!(bumped[0].result, json!(11));
}

#[tokio::test]
async fn test_private_functions_do_not_leak_between_units() {
    let registry = registry();
    registry.register(&plugin("cart", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_dependency(&PluginDependency::new(
            "cart",
            "money",
            "1.0.0",
            "fn rate() { 100 } export fn cents(x) { x * rate() }",
        ))
        .unwrap();
    registry
        .register_module(
            &PluginModule::new("cart", "tax.rhai", "fn rate() { 2 } export fn apply(x) { x * rate() }").with_priority(1),
        )
        .unwrap();
    registry
        .register_module(
            &PluginModule::new(
                "cart",
                "ship.rhai",
                r#"
                import { cents } from "money";
                import { apply } from "./tax";
                fn rate() { 7 }
                export const TOTAL = apply.call(5) + cents.call(1) + rate();
                "#,
            )
            .with_priority(2),
        )
        .unwrap();

    let context = loader(&registry).load_plugin("cart").await.unwrap();
    assert_eq!(context.module("ship").unwrap().to_json(), json!({"TOTAL": 117}));
}

#[tokio::test]
async fn test_events_run_in_priority_order() {
    let store = Arc::new(RecordingStore::default());
    let registry = Registry::new(store.clone());

    for (id, priority) in [("five", 5), ("one", 1), ("ten", 10)] {
        registry.register(&plugin(id, SecurityLevel::Sandboxed)).unwrap();
        registry
            .register_event(
                &PluginEvent::new(
                    id,
                    "order.created",
                    "export default |order| { plugin_data::set(\"seen\", order.id); };",
                )
                .with_priority(priority),
            )
            .unwrap();
    }

    let loader = loader(&registry);
    let report = loader.load_all_plugins().await.unwrap();
    assert!(report.is_clean());

    let summary = Dispatcher::new(loader)
        .emit_event("order.created", json!({"id": 17}))
        .await;

    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(*store.data_writes.lock().unwrap(), vec!["one", "five", "ten"]);
}

#[tokio::test]
async fn test_failing_hook_is_isolated() {
    let registry = registry();
    let handlers = [
        ("double", "export default |n| n * 2;"),
        ("broken", "export default |n| { throw \"out of stock\"; };"),
        ("square", "export fn handler(n) { n * n }"),
    ];
    for (id, source) in handlers {
        registry.register(&plugin(id, SecurityLevel::Trusted)).unwrap();
        registry
            .register_hook(&PluginHook::new(id, "price.adjust", source))
            .unwrap();
    }

    let loader = loader(&registry);
    loader.load_all_plugins().await.unwrap();
    let outputs = Dispatcher::new(loader)
        .execute_hook("price.adjust", vec![json!(7)])
        .await;

    let results: Vec<_> = outputs
        .iter()
        .map(|o| (o.plugin_id.as_str(), o.result.clone()))
        .collect();
    assert_eq!(results, vec![("double", json!(14)), ("square", json!(49))]);
}

#[tokio::test]
async fn test_hook_priority_ties_keep_load_order() {
    let registry = registry();
    for (id, priority) in [("late", 5), ("first", 0), ("second", 0)] {
        registry.register(&plugin(id, SecurityLevel::Trusted)).unwrap();
        registry
            .register_hook(&PluginHook::new(id, "label", "export default |x| x;").with_priority(priority))
            .unwrap();
    }

    let loader = loader(&registry);
    loader.load_all_plugins().await.unwrap();
    let ids: Vec<_> = Dispatcher::new(loader)
        .execute_hook("label", vec![json!("x")])
        .await
        .into_iter()
        .map(|o| o.plugin_id)
        .collect();
    assert_eq!(ids, vec!["first", "second", "late"]);
}

#[tokio::test]
async fn test_transformed_exports_match_call_based_source() {
    let registry = registry();
    let modern = r#"
        import fmt from "./fmt";
        import { rate, label as name } from "./utils";
        export const TOTAL = rate * 2;
        export default #{ title: fmt.prefix + name };
    "#;
    let manual = r#"
        let fmt = require("./fmt");
        let utils = require("./utils");
        let rate = utils.rate;
        let name = utils.label;
        const TOTAL = rate * 2;
        unit.exports = #{ title: fmt.prefix + name };
        unit.exports.TOTAL = TOTAL;
    "#;
    assert_eq!(transform(manual).unwrap(), manual);

    for (id, main) in [("modern", modern), ("manual", manual)] {
        registry.register(&plugin(id, SecurityLevel::Trusted)).unwrap();
        for module in [
            PluginModule::new(id, "fmt.rhai", "export const prefix = \"Deal: \";").with_priority(0),
            PluginModule::new(id, "utils.rhai", "export const rate = 3;\nexport const label = \"spring\";")
                .with_priority(1),
            PluginModule::new(id, "main.rhai", main).with_priority(2),
        ] {
            registry.register_module(&module).unwrap();
        }
    }

    let loader = loader(&registry);
    let modern = loader.load_plugin("modern").await.unwrap();
    let manual = loader.load_plugin("manual").await.unwrap();

    let expected = json!({"title": "Deal: spring", "TOTAL": 6});
    assert_eq!(modern.module("main").unwrap().to_json(), expected);
    assert_eq!(manual.module("main").unwrap().to_json(), expected);
}

#[tokio::test]
async fn test_disabled_rows_are_never_dispatched() {
    let registry = registry();
    for id in ["on", "off"] {
        registry.register(&plugin(id, SecurityLevel::Trusted)).unwrap();
        registry
            .register_hook(&PluginHook::new(id, "banner", "export default |x| x;").enabled(id == "on"))
            .unwrap();
        registry
            .register_event(&PluginEvent::new(id, "visit", "export default |x| x;").enabled(id == "on"))
            .unwrap();
    }

    let loader = loader(&registry);
    loader.load_all_plugins().await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(&loader));

    let outputs = dispatcher.execute_hook("banner", vec![json!(1)]).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].plugin_id, "on");
    assert_eq!(dispatcher.emit_event("visit", json!({})).await.delivered, 1);

    // Toggling a loaded registration takes effect immediately.
    assert!(loader.context("on").unwrap().set_hook_enabled("banner", false));
    assert!(dispatcher.execute_hook("banner", vec![json!(1)]).await.is_empty());
    assert!(!loader.context("off").unwrap().set_hook_enabled("banner", true));
}

#[tokio::test]
async fn test_reload_rebuilds_from_current_rows() {
    let registry = registry();
    registry.register(&plugin("promo", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_module(&PluginModule::new("promo", "index.rhai", "export default \"v1\";"))
        .unwrap();

    let loader = loader(&registry);
    let first = loader.load_plugin("promo").await.unwrap();
    assert_eq!(first.module("index").unwrap().to_json(), json!("v1"));
    first.data().set("visits", json!(3), None).unwrap();

    registry
        .register_module(&PluginModule::new("promo", "index.rhai", "export default \"v2\";"))
        .unwrap();
    let second = loader.reload_plugin("promo").await.unwrap();

    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(second.module("index").unwrap().to_json(), json!("v2"));
    assert_eq!(second.data().get("visits").unwrap(), Some(json!(3)));
    assert_eq!(loader.loaded_ids(), vec!["promo"]);
}

#[tokio::test]
async fn test_sandboxed_failures_do_not_stop_other_plugins() {
    let registry = registry();
    registry.register(&plugin("spin", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_module(&PluginModule::new(
            "spin",
            "index.rhai",
            "let n = 0; loop { n += 1; }",
        ))
        .unwrap();
    registry.register(&plugin("clock", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_module(&PluginModule::new("clock", "index.rhai", "export default timers::now();"))
        .unwrap();
    registry.register(&plugin("fine", SecurityLevel::Sandboxed)).unwrap();
    registry
        .register_module(&PluginModule::new("fine", "index.rhai", "export default 1;"))
        .unwrap();

    let config = RuntimeConfig::default().with_sandbox(
        SecurityLevel::Sandboxed,
        SandboxConfig::sandboxed().with_timeout(50).with_max_operations(0),
    );
    let loader = PluginLoader::new(registry, config);
    let report = loader.load_all_plugins().await.unwrap();

    assert_eq!(report.loaded, vec!["fine"]);
    let failure = |id: &str| {
        report
            .failed
            .iter()
            .find(|(failed, _)| failed == id)
            .map(|(_, e)| e)
            .unwrap()
    };
    assert!(matches!(failure("spin"), PluginError::Timeout { timeout_ms: 50, .. }));
    assert!(matches!(
        failure("clock"),
        PluginError::CapabilityDenied { capability, .. } if capability == "timers"
    ));
}

#[tokio::test]
async fn test_missing_handler_fails_load() {
    let registry = registry();
    registry.register(&plugin("bare", SecurityLevel::Trusted)).unwrap();
    registry
        .register_hook(&PluginHook::new("bare", "noop", "export default 5;"))
        .unwrap();

    let err = loader(&registry).load_plugin("bare").await.unwrap_err();
    assert!(matches!(err, PluginError::MissingHandler { unit } if unit == "bare#hook:noop"));
}

#[tokio::test]
async fn test_tenant_and_config_filters() {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone());
    for id in ["a", "b", "c"] {
        registry.register(&plugin(id, SecurityLevel::Trusted)).unwrap();
    }
    registry.set_tenant_override("b", "acme", false).unwrap();

    let config = RuntimeConfig::default().with_tenant("acme").disable_plugin("c");
    let loader = PluginLoader::new(registry, config);
    let report = loader.load_all_plugins().await.unwrap();

    assert_eq!(report.loaded, vec!["a"]);
    assert_eq!(report.skipped, vec!["c"]);
    assert_eq!(store.len(Table::TenantOverrides), 1);
}

#[tokio::test]
async fn test_store_outage_surfaces_from_load_all() {
    let store = Arc::new(MemoryStore::new());
    let loader = PluginLoader::new(Registry::new(store.clone()), RuntimeConfig::default());
    store.set_unavailable(true);

    let err = loader.load_all_plugins().await.unwrap_err();
    assert!(err.is_unavailable());
}
