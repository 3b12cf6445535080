use rusqlite::Connection;
use storehook_core::{ColumnKind, Table};
use strum::IntoEnumIterator;

/// Create every plugin table that does not exist yet.
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    for table in Table::iter() {
        conn.execute_batch(&table_ddl(table))?;
    }
    Ok(())
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
        ColumnKind::Text | ColumnKind::Document | ColumnKind::Timestamp => "TEXT",
    }
}

fn table_ddl(table: Table) -> String {
    let columns = table
        .columns()
        .iter()
        .map(|c| {
            if table.key_columns().contains(&c.name) {
                format!("{} {} NOT NULL", c.name, sql_type(c.kind))
            } else {
                format!("{} {}", c.name, sql_type(c.kind))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE({}));",
        table.name(),
        columns,
        table.key_columns().join(", ")
    )
}
