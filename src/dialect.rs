//! Per-dialect schema introspection.
//!
//! Introspection queries are not portable SQL, so this is the one place where
//! engine differences are allowed to show. The dialect is fixed when the
//! driver is resolved and travels with every [`PooledConnection`].

use crate::connection::PooledConnection;
use crate::error::Result;
use crate::statement::Value;

/// SQL dialect of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Embedded SQLite. Catalog names are compared ASCII upper-cased.
    Sqlite,
    /// PostgreSQL server. Catalog names are compared as supplied.
    Postgres,
}

impl Dialect {
    /// True for the in-process engine.
    pub const fn is_embedded(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    /// Normalize an identifier the way this dialect's catalog compares it.
    ///
    /// SQLite folds case for ASCII letters only, both in `UPPER()` and in
    /// catalog lookups.
    pub fn normalize_identifier(self, identifier: &str) -> String {
        match self {
            Self::Sqlite => identifier.to_ascii_uppercase(),
            Self::Postgres => identifier.to_string(),
        }
    }

    /// Statement that flushes and releases on-disk state before shutdown.
    pub const fn shutdown_statement(self) -> Option<&'static str> {
        match self {
            Self::Sqlite => Some("PRAGMA wal_checkpoint(TRUNCATE)"),
            Self::Postgres => None,
        }
    }

    /// Whether a table named `table` exists.
    pub fn table_exists(self, conn: &PooledConnection, table: &str) -> Result<bool> {
        let sql = match self {
            Self::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_schema \
                 WHERE type IN ('table', 'view') AND UPPER(name) = ?1"
            }
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
        };
        let count = conn
            .statement(sql)
            .execute_long_query(Value::from(self.normalize_identifier(table)))?;
        Ok(count.unwrap_or(0) > 0)
    }

    /// Whether `table` has a column named `column`.
    pub fn column_exists(self, conn: &PooledConnection, table: &str, column: &str) -> Result<bool> {
        let sql = match self {
            Self::Sqlite => "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE UPPER(name) = ?2",
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2"
            }
        };
        let count = conn.statement(sql).execute_long_query([
            Value::from(self.normalize_identifier(table)),
            Value::from(self.normalize_identifier(column)),
        ])?;
        Ok(count.unwrap_or(0) > 0)
    }
}
