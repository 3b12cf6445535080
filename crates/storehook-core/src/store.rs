//! Row-level contract for plugin stores.
//!
//! The store is an external collaborator: it knows tables, columns and
//! conflict keys, and nothing about plugins. The [`Registry`](crate::Registry)
//! is the only component that interprets rows.

use std::cmp::Ordering;

use serde_json::Value;
use strum::{Display, EnumIter};

use crate::error::{StoreError, StoreResult};

/// A stored row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Tables the plugin runtime reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Table {
    #[strum(serialize = "plugins")]
    Plugins,
    #[strum(serialize = "plugin_modules")]
    Modules,
    #[strum(serialize = "plugin_dependencies")]
    Dependencies,
    #[strum(serialize = "plugin_hooks")]
    Hooks,
    #[strum(serialize = "plugin_events")]
    Events,
    #[strum(serialize = "plugin_data")]
    Data,
    #[strum(serialize = "plugin_tenants")]
    TenantOverrides,
}

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// UTF-8 text.
    Text,
    /// Signed 64-bit integer.
    Integer,
    /// Boolean flag.
    Bool,
    /// Structured document (object or list).
    Document,
    /// RFC 3339 timestamp, nullable.
    Timestamp,
}

/// A column definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

const PLUGIN_COLUMNS: &[Column] = &[
    col("id", ColumnKind::Text),
    col("name", ColumnKind::Text),
    col("version", ColumnKind::Text),
    col("status", ColumnKind::Text),
    col("security_level", ColumnKind::Text),
    col("manifest", ColumnKind::Document),
    col("permissions", ColumnKind::Document),
    col("dependencies", ColumnKind::Document),
    col("tags", ColumnKind::Document),
];

const MODULE_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("file_name", ColumnKind::Text),
    col("file_content", ColumnKind::Text),
    col("scope", ColumnKind::Text),
    col("load_priority", ColumnKind::Integer),
    col("is_enabled", ColumnKind::Bool),
];

const DEPENDENCY_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("package_name", ColumnKind::Text),
    col("version", ColumnKind::Text),
    col("bundled_code", ColumnKind::Text),
];

const HOOK_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("hook_name", ColumnKind::Text),
    col("handler_function", ColumnKind::Text),
    col("priority", ColumnKind::Integer),
    col("is_enabled", ColumnKind::Bool),
];

const EVENT_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("event_name", ColumnKind::Text),
    col("listener_function", ColumnKind::Text),
    col("priority", ColumnKind::Integer),
    col("is_enabled", ColumnKind::Bool),
];

const DATA_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("key", ColumnKind::Text),
    col("value", ColumnKind::Document),
    col("expires_at", ColumnKind::Timestamp),
];

const TENANT_COLUMNS: &[Column] = &[
    col("plugin_id", ColumnKind::Text),
    col("tenant_id", ColumnKind::Text),
    col("is_enabled", ColumnKind::Bool),
];

impl Table {
    /// Table name as used by the backing store.
    pub fn name(self) -> &'static str {
        match self {
            Self::Plugins => "plugins",
            Self::Modules => "plugin_modules",
            Self::Dependencies => "plugin_dependencies",
            Self::Hooks => "plugin_hooks",
            Self::Events => "plugin_events",
            Self::Data => "plugin_data",
            Self::TenantOverrides => "plugin_tenants",
        }
    }

    /// All columns of this table, in declaration order.
    pub fn columns(self) -> &'static [Column] {
        match self {
            Self::Plugins => PLUGIN_COLUMNS,
            Self::Modules => MODULE_COLUMNS,
            Self::Dependencies => DEPENDENCY_COLUMNS,
            Self::Hooks => HOOK_COLUMNS,
            Self::Events => EVENT_COLUMNS,
            Self::Data => DATA_COLUMNS,
            Self::TenantOverrides => TENANT_COLUMNS,
        }
    }

    /// Columns that identify a row for upsert purposes.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::Plugins => &["id"],
            Self::Modules => &["plugin_id", "file_name"],
            Self::Dependencies => &["plugin_id", "package_name"],
            Self::Hooks => &["plugin_id", "hook_name"],
            Self::Events => &["plugin_id", "event_name"],
            Self::Data => &["plugin_id", "key"],
            Self::TenantOverrides => &["plugin_id", "tenant_id"],
        }
    }

    /// Look up a column by name.
    pub fn column(self, name: &str) -> Option<Column> {
        self.columns().iter().copied().find(|c| c.name == name)
    }

    /// Fail unless `name` is a column of this table.
    pub fn check_column(self, name: &str) -> StoreResult<Column> {
        self.column(name)
            .ok_or_else(|| StoreError::invalid_query(self, format!("unknown column '{name}'")))
    }

    /// Validate that a row carries every key column and no unknown column.
    pub fn check_row(self, row: &Row) -> StoreResult<()> {
        for name in row.keys() {
            self.check_column(name)?;
        }
        for key in self.key_columns() {
            match row.get(*key) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(StoreError::invalid_query(
                        self,
                        format!("missing key column '{key}'"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// An equality-filtered, optionally ordered selection of rows.
#[derive(Debug, Clone)]
pub struct Query {
    /// Table to read.
    pub table: Table,

    /// Column/value pairs that must all match.
    pub filters: Vec<(String, Value)>,

    /// Column to sort ascending by. Ties and unordered queries keep
    /// insertion order.
    pub order_by: Option<String>,
}

impl Query {
    /// Select every row of a table.
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order_by: None,
        }
    }

    /// Require `column == value`.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    /// Sort ascending by `column`.
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    /// Check all referenced columns against the table definition.
    pub fn validate(&self) -> StoreResult<()> {
        for (column, _) in &self.filters {
            self.table.check_column(column)?;
        }
        if let Some(column) = &self.order_by {
            self.table.check_column(column)?;
        }
        Ok(())
    }

    /// Whether a row satisfies every filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters
            .iter()
            .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
    }

    /// Compare two rows by the requested order column.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        match &self.order_by {
            Some(column) => compare_values(
                a.get(column).unwrap_or(&Value::Null),
                b.get(column).unwrap_or(&Value::Null),
            ),
            None => Ordering::Equal,
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Row operations every plugin store must provide.
///
/// Implementations must be safe to share across tasks. They perform no
/// retries of their own beyond what the backing system does.
pub trait PluginStore: Send + Sync {
    /// Select rows matching `query`.
    fn query(&self, query: &Query) -> StoreResult<Vec<Row>>;

    /// Insert `row`, or update the existing row with the same key columns.
    fn upsert(&self, table: Table, row: Row) -> StoreResult<()>;

    /// Apply `changes` to every row matching `query`. Returns the number of
    /// rows touched.
    fn update(&self, query: &Query, changes: Row) -> StoreResult<usize>;

    /// Delete every row matching `query`. Returns the number of rows removed.
    fn delete(&self, query: &Query) -> StoreResult<usize>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_validation_rejects_unknown_columns() {
        let ok = Query::new(Table::Hooks).filter("hook_name", "page.render").order_by("priority");
        assert!(ok.validate().is_ok());

        let bad = Query::new(Table::Hooks).filter("drop table", 1);
        assert!(bad.validate().is_err());

        let bad_order = Query::new(Table::Events).order_by("load_priority");
        assert!(bad_order.validate().is_err());
    }

    #[test]
    fn test_query_matching() {
        let query = Query::new(Table::Hooks)
            .filter("plugin_id", "seo")
            .filter("is_enabled", true);

        assert!(query.matches(&row(json!({"plugin_id": "seo", "is_enabled": true}))));
        assert!(!query.matches(&row(json!({"plugin_id": "seo", "is_enabled": false}))));
        assert!(!query.matches(&row(json!({"plugin_id": "seo"}))));
    }

    #[test]
    fn test_query_ordering_is_numeric() {
        let query = Query::new(Table::Events).order_by("priority");
        let a = row(json!({"priority": 10}));
        let b = row(json!({"priority": 9}));
        assert_eq!(query.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_check_row_requires_key() {
        let table = Table::Data;
        assert!(table.check_row(&row(json!({"plugin_id": "p", "key": "k"}))).is_ok());
        assert!(table.check_row(&row(json!({"plugin_id": "p"}))).is_err());
        assert!(table.check_row(&row(json!({"plugin_id": "p", "key": "k", "x": 1}))).is_err());
    }

    #[test]
    fn test_table_names_match_display() {
        use strum::IntoEnumIterator;
        for table in Table::iter() {
            assert_eq!(table.to_string(), table.name());
        }
    }
}
