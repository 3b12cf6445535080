//! In-process plugin store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::store::{PluginStore, Query, Row, Table};

/// A [`PluginStore`] held entirely in memory.
///
/// Rows keep insertion order, and an upsert that hits an existing key
/// updates the row in place. Used by tests and by embedders that seed
/// plugins programmatically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows currently held in `table`.
    pub fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(&table).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Whether `table` holds no rows.
    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store marked unavailable"));
        }
        Ok(())
    }
}

fn same_key(table: Table, a: &Row, b: &Row) -> bool {
    table.key_columns().iter().all(|k| a.get(*k) == b.get(*k))
}

impl PluginStore for MemoryStore {
    fn query(&self, query: &Query) -> StoreResult<Vec<Row>> {
        self.check_available()?;
        query.validate()?;

        let tables = self.tables.read().map_err(StoreError::unavailable)?;
        let mut rows: Vec<Row> = tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        // Stable sort keeps insertion order among ties.
        rows.sort_by(|a, b| query.compare(a, b));
        Ok(rows)
    }

    fn upsert(&self, table: Table, row: Row) -> StoreResult<()> {
        self.check_available()?;
        table.check_row(&row)?;

        let mut tables = self.tables.write().map_err(StoreError::unavailable)?;
        let rows = tables.entry(table).or_default();
        match rows.iter_mut().find(|existing| same_key(table, existing, &row)) {
            Some(existing) => existing.extend(row),
            None => rows.push(row),
        }
        Ok(())
    }

    fn update(&self, query: &Query, changes: Row) -> StoreResult<usize> {
        self.check_available()?;
        query.validate()?;
        for column in changes.keys() {
            query.table.check_column(column)?;
        }

        let mut tables = self.tables.write().map_err(StoreError::unavailable)?;
        let mut touched = 0;
        if let Some(rows) = tables.get_mut(&query.table) {
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                row.extend(changes.clone());
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn delete(&self, query: &Query) -> StoreResult<usize> {
        self.check_available()?;
        query.validate()?;

        let mut tables = self.tables.write().map_err(StoreError::unavailable)?;
        let Some(rows) = tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !query.matches(r));
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let store = MemoryStore::new();
        store
            .upsert(Table::Hooks, row(json!({"plugin_id": "a", "hook_name": "h", "priority": 1})))
            .unwrap();
        store
            .upsert(Table::Hooks, row(json!({"plugin_id": "b", "hook_name": "h", "priority": 2})))
            .unwrap();
        store
            .upsert(Table::Hooks, row(json!({"plugin_id": "a", "hook_name": "h", "priority": 9})))
            .unwrap();

        let rows = store.query(&Query::new(Table::Hooks)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["plugin_id"], "a");
        assert_eq!(rows[0]["priority"], 9);
    }

    #[test]
    fn test_query_orders_and_filters() {
        let store = MemoryStore::new();
        for (id, priority) in [("x", 5), ("y", 1), ("z", 10)] {
            store
                .upsert(
                    Table::Events,
                    row(json!({"plugin_id": id, "event_name": "e", "priority": priority})),
                )
                .unwrap();
        }

        let rows = store
            .query(&Query::new(Table::Events).filter("event_name", "e").order_by("priority"))
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["plugin_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["y", "x", "z"]);
    }

    #[test]
    fn test_update_and_delete_counts() {
        let store = MemoryStore::new();
        store
            .upsert(Table::Plugins, row(json!({"id": "a", "status": "active"})))
            .unwrap();
        store
            .upsert(Table::Plugins, row(json!({"id": "b", "status": "active"})))
            .unwrap();

        let touched = store
            .update(
                &Query::new(Table::Plugins).filter("id", "a"),
                row(json!({"status": "inactive"})),
            )
            .unwrap();
        assert_eq!(touched, 1);

        let removed = store
            .delete(&Query::new(Table::Plugins).filter("status", "active"))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(Table::Plugins), 1);
    }

    #[test]
    fn test_unavailable_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.query(&Query::new(Table::Plugins)).unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.upsert(Table::Plugins, row(json!({"id": "a"}))).is_err());

        store.set_unavailable(false);
        assert!(store.query(&Query::new(Table::Plugins)).is_ok());
    }
}
