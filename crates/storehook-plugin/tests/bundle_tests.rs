//! Installing bundles into a SQLite store and running them.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use storehook_core::{PluginStatus, Registry};
use storehook_plugin::{Bundle, Dispatcher, MANIFEST_FILE, PluginLoader, RuntimeConfig};
use storehook_sqlite::SqliteStore;

fn write(dir: &Path, file: &str, content: &str) {
    let path = dir.join(file);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn pricing_bundle(dir: &Path) {
    write(
        dir,
        MANIFEST_FILE,
        r#"
        id = "pricing"
        name = "Pricing"
        version = "1.0.0"
        status = "active"

        [[dependencies]]
        name = "money"
        version = "2.0.0"
        file = "vendor/money.rhai"

        [[modules]]
        file = "lib/rates.rhai"

        [[hooks]]
        name = "price.adjust"
        file = "hooks/adjust.rhai"

        [[events]]
        name = "order.created"
        file = "events/order.rhai"
        "#,
    );
    write(dir, "vendor/money.rhai", "export fn cents(x) { x * 100 }");
    write(dir, "lib/rates.rhai", "export const MARKUP = 2;");
    write(
        dir,
        "hooks/adjust.rhai",
        r#"
        import { MARKUP } from "./lib/rates";
        import { cents } from "money";
        export default |n| cents.call(n) * MARKUP;
        "#,
    );
    write(
        dir,
        "events/order.rhai",
        "export default |order| plugin_data::set(\"last_order\", order.id);",
    );
}

#[tokio::test]
async fn test_installed_bundle_runs_from_sqlite() {
    let bundle_dir = tempfile::tempdir().unwrap();
    pricing_bundle(bundle_dir.path());

    let db_dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(db_dir.path().join("plugins.db")).unwrap();
    let registry = Registry::new(Arc::new(store));

    let report = Bundle::open(bundle_dir.path())
        .unwrap()
        .install(&registry)
        .unwrap();
    assert_eq!(report.plugin_id, "pricing");
    assert_eq!((report.modules, report.dependencies, report.hooks, report.events), (1, 1, 1, 1));

    let plugin = registry.get_plugin("pricing").unwrap().unwrap();
    assert_eq!(plugin.status, PluginStatus::Active);
    assert_eq!(plugin.dependencies, vec!["money@2.0.0"]);

    let loader = Arc::new(PluginLoader::new(registry.clone(), RuntimeConfig::default()));
    let report = loader.load_all_plugins().await.unwrap();
    assert_eq!(report.loaded, vec!["pricing"]);

    let dispatcher = Dispatcher::new(loader);
    let outputs = dispatcher.execute_hook("price.adjust", vec![json!(3)]).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].result, json!(600));

    let summary = dispatcher.emit_event("order.created", json!({"id": 42})).await;
    assert_eq!(summary.delivered, 1);
    assert_eq!(
        registry.get_data("pricing", "last_order").unwrap().unwrap().value,
        json!(42)
    );
}

#[tokio::test]
async fn test_reinstall_updates_sources() {
    let bundle_dir = tempfile::tempdir().unwrap();
    pricing_bundle(bundle_dir.path());
    let registry = Registry::new(Arc::new(SqliteStore::in_memory().unwrap()));

    Bundle::open(bundle_dir.path()).unwrap().install(&registry).unwrap();
    write(bundle_dir.path(), "lib/rates.rhai", "export const MARKUP = 3;");
    Bundle::open(bundle_dir.path()).unwrap().install(&registry).unwrap();

    assert_eq!(registry.get_modules("pricing").unwrap().len(), 1);

    let loader = Arc::new(PluginLoader::new(registry, RuntimeConfig::default()));
    loader.load_plugin("pricing").await.unwrap();
    let outputs = Dispatcher::new(loader)
        .execute_hook("price.adjust", vec![json!(1)])
        .await;
    assert_eq!(outputs[0].result, json!(300));
}
