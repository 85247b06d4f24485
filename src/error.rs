//! Error types shared across the connection layer.

use thiserror::Error;

/// Result type alias for Cistern operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the underlying database drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Postgres(#[from] postgres::Error),

    #[error("unsupported column type '{type_name}' for column '{column}'")]
    UnsupportedType { column: String, type_name: String },
}

/// Error type for connection, pool and statement operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown driver '{0}' (expected one of: sqlite, postgres)")]
    UnknownDriver(String),

    #[error("driver '{driver}' could not be bootstrapped: {reason}")]
    DriverBootstrap { driver: &'static str, reason: String },

    #[error("driver '{driver}' rejected url '{url}': {reason}")]
    UrlRejected {
        driver: &'static str,
        url: String,
        reason: String,
    },

    #[error("failed to open connection: {0}")]
    Connect(#[source] DriverError),

    #[error("connection pool exhausted: all {capacity} connections are leased")]
    PoolExhausted { capacity: usize },

    #[error("connection pool has been shut down")]
    PoolShutDown,

    #[error("connection {0} is not leased from this pool")]
    UnknownLease(u64),

    #[error("statement failed: {sql}: {source}")]
    Statement {
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("expected at most one row from: {sql}")]
    MultipleRows { sql: String },

    #[error("column {column} cannot be read as {expected}: {sql}")]
    Conversion {
        sql: String,
        column: usize,
        expected: &'static str,
    },
}

impl Error {
    /// Wrap a driver failure with the SQL text that caused it.
    pub(crate) fn statement(sql: &str, source: impl Into<DriverError>) -> Self {
        Self::Statement {
            sql: sql.to_string(),
            source: source.into(),
        }
    }

    /// True for pool-state failures the caller may retry after backing off.
    pub fn is_pool_state(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::PoolShutDown | Self::UnknownLease(_)
        )
    }

    /// True for driver bootstrap failures raised while building a factory.
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::UnknownDriver(_)
                | Self::DriverBootstrap { .. }
                | Self::UrlRejected { .. }
                | Self::Connect(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_error_carries_sql() {
        let err = Error::statement(
            "SELECT nope",
            rusqlite::Error::InvalidQuery,
        );
        assert!(err.to_string().contains("SELECT nope"));
        assert!(!err.is_pool_state());
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::PoolShutDown.is_pool_state());
        assert!(Error::PoolExhausted { capacity: 10 }.is_pool_state());
        assert!(Error::UnknownDriver("oracle".into()).is_bootstrap());
        assert!(!Error::PoolShutDown.is_bootstrap());
    }
}
