//! Error types for store and registry operations.

use thiserror::Error;

use crate::store::Table;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a plugin store or by the registry on top of it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not serve the request.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A query referenced something the table does not have.
    #[error("Invalid query on {table}: {message}")]
    InvalidQuery { table: Table, message: String },

    /// A stored row could not be decoded into a record.
    #[error("Invalid row in {table}: {message}")]
    InvalidRow { table: Table, message: String },

    /// A record could not be encoded into a row.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an unavailable error from any displayable cause.
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: cause.to_string(),
        }
    }

    /// Create an invalid query error.
    pub fn invalid_query(table: Table, message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            table,
            message: message.into(),
        }
    }

    /// Whether the error means the store itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_constructor() {
        let err = StoreError::unavailable("connection refused");
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
    }

    #[test]
    fn test_invalid_query_names_table() {
        let err = StoreError::invalid_query(Table::Hooks, "unknown column 'nope'");
        assert!(!err.is_unavailable());
        assert!(err.to_string().contains("plugin_hooks"));
    }
}
