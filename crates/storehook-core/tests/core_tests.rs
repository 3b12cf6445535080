use std::sync::Arc;

use storehook_core::{
    MemoryStore, ModuleScope, Plugin, PluginDependency, PluginEvent, PluginHook, PluginModule,
    PluginStatus, PluginStore, Query, Registry, SecurityLevel, Table,
};

fn setup() -> (Arc<MemoryStore>, Registry) {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone());
    (store, registry)
}

fn active(id: &str) -> Plugin {
    Plugin::builder()
        .id(id)
        .name(id.to_uppercase())
        .status(PluginStatus::Active)
        .build()
        .unwrap()
}

#[test]
fn test_registration_is_idempotent() {
    let (store, registry) = setup();

    let first = Plugin::builder()
        .id("reviews")
        .name("Reviews")
        .version("1.0.0")
        .build()
        .unwrap();
    registry.register(&first).unwrap();

    let second = Plugin::builder()
        .id("reviews")
        .name("Product Reviews")
        .version("1.1.0")
        .security_level(SecurityLevel::Trusted)
        .tags(vec!["ugc".to_string()])
        .build()
        .unwrap();
    registry.register(&second).unwrap();

    assert_eq!(store.len(Table::Plugins), 1);

    let stored = registry.get_plugin("reviews").unwrap().unwrap();
    assert_eq!(stored, second);
}

#[test]
fn test_owned_rows_are_idempotent_per_name() {
    let (store, registry) = setup();
    registry.register(&active("seo")).unwrap();

    registry
        .register_hook(&PluginHook::new("seo", "page.render", "export default |p| p;"))
        .unwrap();
    registry
        .register_hook(&PluginHook::new("seo", "page.render", "export default |p| p;").with_priority(3))
        .unwrap();
    registry
        .register_module(&PluginModule::new("seo", "index.rhai", "1"))
        .unwrap();
    registry
        .register_module(&PluginModule::new("seo", "index.rhai", "2"))
        .unwrap();

    assert_eq!(store.len(Table::Hooks), 1);
    assert_eq!(store.len(Table::Modules), 1);
    assert_eq!(registry.get_hooks("seo").unwrap()[0].priority, 3);
    assert_eq!(registry.get_modules("seo").unwrap()[0].file_content, "2");
}

#[test]
fn test_list_active_skips_inactive_and_tenant_disabled() {
    let (_, registry) = setup();
    registry.register(&active("a")).unwrap();
    registry.register(&active("b")).unwrap();
    registry
        .register(&Plugin::builder().id("c").build().unwrap())
        .unwrap();

    let ids = |plugins: Vec<Plugin>| plugins.into_iter().map(|p| p.id).collect::<Vec<_>>();

    assert_eq!(ids(registry.list_active(None).unwrap()), vec!["a", "b"]);

    registry.set_tenant_override("b", "acme", false).unwrap();
    registry.set_tenant_override("a", "acme", true).unwrap();

    assert_eq!(ids(registry.list_active(Some("acme")).unwrap()), vec!["a"]);
    assert_eq!(ids(registry.list_active(Some("globex")).unwrap()), vec!["a", "b"]);

    registry.set_status("c", PluginStatus::Active).unwrap();
    assert_eq!(ids(registry.list_active(None).unwrap()), vec!["a", "b", "c"]);
}

#[test]
fn test_modules_come_back_enabled_in_priority_order() {
    let (_, registry) = setup();
    registry.register(&active("shop")).unwrap();

    registry
        .register_module(&PluginModule::new("shop", "late.rhai", "3").with_priority(20))
        .unwrap();
    registry
        .register_module(
            &PluginModule::new("shop", "early.rhai", "1")
                .with_priority(-5)
                .with_scope(ModuleScope::Backend),
        )
        .unwrap();
    registry
        .register_module(&PluginModule::new("shop", "off.rhai", "2").enabled(false))
        .unwrap();
    registry
        .register_module(&PluginModule::new("shop", "middle.rhai", "2").with_priority(0))
        .unwrap();

    let names: Vec<_> = registry
        .get_modules("shop")
        .unwrap()
        .into_iter()
        .map(|m| m.file_name)
        .collect();
    assert_eq!(names, vec!["early.rhai", "middle.rhai", "late.rhai"]);
}

#[test]
fn test_dependencies_keep_registration_order() {
    let (_, registry) = setup();
    for name in ["zeta", "alpha", "mid"] {
        registry
            .register_dependency(&PluginDependency::new("p", name, "1.0.0", "unit.exports = 1;"))
            .unwrap();
    }

    let names: Vec<_> = registry
        .get_dependencies("p")
        .unwrap()
        .into_iter()
        .map(|d| d.package_name)
        .collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn test_global_lookups_order_by_priority() {
    let (_, registry) = setup();
    registry
        .register_event(&PluginEvent::new("a", "order.created", "x").with_priority(5))
        .unwrap();
    registry
        .register_event(&PluginEvent::new("b", "order.created", "x").with_priority(1))
        .unwrap();
    registry
        .register_event(&PluginEvent::new("c", "order.created", "x").with_priority(10))
        .unwrap();
    registry
        .register_event(&PluginEvent::new("d", "order.created", "x").enabled(false))
        .unwrap();

    let order: Vec<_> = registry
        .events_named("order.created")
        .unwrap()
        .into_iter()
        .map(|e| e.plugin_id)
        .collect();
    assert_eq!(order, vec!["b", "a", "c"]);

    registry
        .register_hook(&PluginHook::new("a", "cart.total", "x").with_priority(2))
        .unwrap();
    registry
        .register_hook(&PluginHook::new("b", "cart.total", "x").with_priority(-1))
        .unwrap();
    let hooks: Vec<_> = registry
        .hooks_named("cart.total")
        .unwrap()
        .into_iter()
        .map(|h| h.plugin_id)
        .collect();
    assert_eq!(hooks, vec!["b", "a"]);
}

#[test]
fn test_store_errors_propagate_through_registry() {
    let (store, registry) = setup();
    registry.register(&active("a")).unwrap();

    store.set_unavailable(true);
    assert!(registry.list_active(None).unwrap_err().is_unavailable());
    assert!(registry.get_modules("a").unwrap_err().is_unavailable());
    assert!(registry
        .set_data("a", "k", serde_json::json!(1), None)
        .unwrap_err()
        .is_unavailable());
}

#[test]
fn test_status_is_stored_as_text() {
    let (store, registry) = setup();
    registry.register(&active("a")).unwrap();

    let rows = store
        .query(&Query::new(Table::Plugins).filter("status", "active"))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["security_level"], "sandboxed");
}
