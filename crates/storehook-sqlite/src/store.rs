use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use storehook_core::{Column, ColumnKind, PluginStore, Query, Row, StoreError, StoreResult, Table};

use crate::schema::create_tables;

/// Shared handle to the underlying connection.
pub type DbConnection = Arc<Mutex<Connection>>;

/// A [`PluginStore`] backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: DbConnection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the tables exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(StoreError::unavailable)?;
        tracing::debug!(path = %path.display(), "Opened plugin database");
        Self::from_connection(conn)
    }

    /// A private in-memory database.
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(StoreError::unavailable)?)
    }

    /// Wrap an existing connection, creating the tables if needed.
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        create_tables(&conn).map_err(StoreError::unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The shared connection handle.
    pub fn connection(&self) -> DbConnection {
        Arc::clone(&self.conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(StoreError::unavailable)?;
        f(&conn).map_err(StoreError::unavailable)
    }
}

fn encode(column: Column, value: &Value) -> Result<SqlValue, String> {
    let mismatch = || format!("column '{}' cannot hold {value}", column.name);
    Ok(match (column.kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnKind::Text | ColumnKind::Timestamp, Value::String(s)) => SqlValue::Text(s.clone()),
        (ColumnKind::Integer, Value::Number(n)) => SqlValue::Integer(n.as_i64().ok_or_else(mismatch)?),
        (ColumnKind::Bool, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (ColumnKind::Document, v) => SqlValue::Text(v.to_string()),
        _ => return Err(mismatch()),
    })
}

fn decode(table: Table, column: Column, value: SqlValue) -> StoreResult<Value> {
    let invalid = |message: String| StoreError::InvalidRow { table, message };
    Ok(match (column.kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Text | ColumnKind::Timestamp, SqlValue::Text(s)) => Value::String(s),
        (ColumnKind::Integer, SqlValue::Integer(i)) => Value::from(i),
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnKind::Document, SqlValue::Text(s)) => serde_json::from_str(&s)
            .map_err(|e| invalid(format!("column '{}' holds invalid JSON: {e}", column.name)))?,
        (_, other) => {
            return Err(invalid(format!(
                "column '{}' holds unexpected {:?}",
                column.name,
                other.data_type()
            )));
        }
    })
}

/// `WHERE` clause and bound values for a query's filters.
fn where_clause(query: &Query) -> StoreResult<(String, Vec<SqlValue>)> {
    if query.filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut terms = Vec::with_capacity(query.filters.len());
    let mut values = Vec::with_capacity(query.filters.len());
    for (name, value) in &query.filters {
        let column = query.table.check_column(name)?;
        let value =
            encode(column, value).map_err(|message| StoreError::invalid_query(query.table, message))?;
        // IS compares NULL like any other value.
        terms.push(format!("{name} IS ?"));
        values.push(value);
    }
    Ok((format!(" WHERE {}", terms.join(" AND ")), values))
}

fn encode_row(table: Table, row: &Row) -> StoreResult<(Vec<&'static str>, Vec<SqlValue>)> {
    let mut names = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (name, value) in row {
        let column = table.check_column(name)?;
        let value = encode(column, value).map_err(|message| StoreError::InvalidRow { table, message })?;
        names.push(column.name);
        values.push(value);
    }
    Ok((names, values))
}

impl PluginStore for SqliteStore {
    fn query(&self, query: &Query) -> StoreResult<Vec<Row>> {
        query.validate()?;
        let table = query.table;
        let columns = table.columns();
        let (filter, params) = where_clause(query)?;
        let order = match &query.order_by {
            Some(column) => format!(" ORDER BY {column}, rowid"),
            None => " ORDER BY rowid".to_string(),
        };
        let sql = format!(
            "SELECT {} FROM {}{filter}{order}",
            columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", "),
            table.name()
        );

        let raw: Vec<Vec<SqlValue>> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                (0..columns.len())
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?;
            let collected: rusqlite::Result<Vec<_>> = rows.collect();
            collected
        })?;

        raw.into_iter()
            .map(|values| {
                columns
                    .iter()
                    .zip(values)
                    .map(|(column, value)| Ok((column.name.to_string(), decode(table, *column, value)?)))
                    .collect::<StoreResult<Row>>()
            })
            .collect()
    }

    fn upsert(&self, table: Table, row: Row) -> StoreResult<()> {
        table.check_row(&row)?;
        let (names, values) = encode_row(table, &row)?;
        let keys = table.key_columns();

        let updates: Vec<String> = names
            .iter()
            .filter(|name| !keys.contains(*name))
            .map(|name| format!("{name} = excluded.{name}"))
            .collect();
        let on_conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {on_conflict}",
            table.name(),
            names.join(", "),
            vec!["?"; names.len()].join(", "),
            keys.join(", ")
        );

        self.with_conn(|conn| conn.execute(&sql, params_from_iter(values.iter())))?;
        Ok(())
    }

    fn update(&self, query: &Query, changes: Row) -> StoreResult<usize> {
        query.validate()?;
        if changes.is_empty() {
            return Ok(0);
        }

        let (names, mut values) = encode_row(query.table, &changes)?;
        let (filter, params) = where_clause(query)?;
        values.extend(params);

        let sql = format!(
            "UPDATE {} SET {}{filter}",
            query.table.name(),
            names
                .iter()
                .map(|name| format!("{name} = ?"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.with_conn(|conn| conn.execute(&sql, params_from_iter(values.iter())))
    }

    fn delete(&self, query: &Query) -> StoreResult<usize> {
        query.validate()?;
        let (filter, params) = where_clause(query)?;
        let sql = format!("DELETE FROM {}{filter}", query.table.name());

        self.with_conn(|conn| conn.execute(&sql, params_from_iter(params.iter())))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_rejects_mismatched_kinds() {
        let priority = Table::Hooks.column("priority").unwrap();
        assert!(encode(priority, &json!("high")).is_err());
        assert_eq!(encode(priority, &json!(3)).unwrap(), SqlValue::Integer(3));

        let enabled = Table::Hooks.column("is_enabled").unwrap();
        assert_eq!(encode(enabled, &json!(true)).unwrap(), SqlValue::Integer(1));
    }

    #[test]
    fn test_documents_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert(
                Table::Data,
                row(json!({"plugin_id": "p", "key": "k", "value": {"n": [1, 2]}, "expires_at": null})),
            )
            .unwrap();

        let rows = store.query(&Query::new(Table::Data)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["value"], json!({"n": [1, 2]}));
        assert_eq!(rows[0]["expires_at"], Value::Null);
    }

    #[test]
    fn test_upsert_keeps_row_position() {
        let store = SqliteStore::in_memory().unwrap();
        for (id, priority) in [("a", 1), ("b", 2), ("a", 7)] {
            store
                .upsert(
                    Table::Hooks,
                    row(json!({"plugin_id": id, "hook_name": "h", "handler_function": "x", "priority": priority})),
                )
                .unwrap();
        }

        let rows = store.query(&Query::new(Table::Hooks)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["plugin_id"], "a");
        assert_eq!(rows[0]["priority"], 7);
    }

    #[test]
    fn test_bool_filters_match_integers() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert(
                Table::TenantOverrides,
                row(json!({"plugin_id": "p", "tenant_id": "t", "is_enabled": false})),
            )
            .unwrap();

        let off = store
            .query(&Query::new(Table::TenantOverrides).filter("is_enabled", false))
            .unwrap();
        assert_eq!(off.len(), 1);
        assert_eq!(off[0]["is_enabled"], json!(false));
    }
}
