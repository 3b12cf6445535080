//! SQLite implementation of the storehook plugin store.
//!
//! One table per [`Table`](storehook_core::Table), created on open. Each
//! table carries a `UNIQUE` constraint over its key columns so that
//! upserts map directly onto `INSERT ... ON CONFLICT DO UPDATE`.

mod schema;
mod store;

pub use schema::create_tables;
pub use store::{DbConnection, SqliteStore};
