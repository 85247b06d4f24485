//! Closed driver registry.
//!
//! Each supported driver identifier maps to an r2d2 connection manager built
//! once per factory. Unknown identifiers are rejected up front so a connection
//! never exists without a known dialect.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use postgres::NoTls;
use r2d2::ManageConnection;
use r2d2_postgres::PostgresConnectionManager;
use r2d2_sqlite::SqliteConnectionManager;
use uuid::Uuid;

use super::ConnectionConfig;
use crate::dialect::Dialect;
use crate::error::{DriverError, Error, Result};

/// URL sentinel asking the factory to locate a storage directory.
pub const DEFAULT_URL: &str = "sqlite:default";
/// Non-persistent fallback URL.
pub const MEMORY_URL: &str = "sqlite::memory:";
/// Database file created inside a located storage directory.
pub const DATABASE_FILE_NAME: &str = "cistern.db";

const SQLITE_PREFIX: &str = "sqlite:";
const SQLITE_MEMORY: &str = ":memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Supported driver identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Embedded SQLite engine
    Sqlite,
    /// PostgreSQL server engine
    Postgres,
}

impl DriverKind {
    /// Look up a driver by identifier (case-insensitive).
    pub fn from_identifier(identifier: &str) -> Result<Self> {
        match identifier.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(Error::UnknownDriver(identifier.to_string())),
        }
    }

    pub const fn identifier(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// Dialect strategy for connections opened by this driver.
    pub const fn dialect(self) -> Dialect {
        match self {
            Self::Sqlite => Dialect::Sqlite,
            Self::Postgres => Dialect::Postgres,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Where a `sqlite:` URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqliteTarget {
    Memory,
    File(PathBuf),
}

/// Parse a `sqlite:` URL, resolving relative paths against `search_path`.
pub(crate) fn parse_sqlite_url(
    url: &str,
    search_path: Option<&Path>,
) -> std::result::Result<SqliteTarget, String> {
    let rest = url
        .strip_prefix(SQLITE_PREFIX)
        .ok_or_else(|| format!("expected a '{SQLITE_PREFIX}' url"))?;

    if rest.is_empty() {
        return Err("missing database path".to_string());
    }
    if rest == SQLITE_MEMORY {
        return Ok(SqliteTarget::Memory);
    }

    let path = PathBuf::from(rest);
    match search_path {
        Some(base) if path.is_relative() => Ok(SqliteTarget::File(base.join(path))),
        _ => Ok(SqliteTarget::File(path)),
    }
}

/// URL of the database file inside a storage directory.
pub(crate) fn file_url(dir: &Path) -> String {
    format!(
        "{SQLITE_PREFIX}{}",
        dir.join(DATABASE_FILE_NAME).display()
    )
}

/// A physical connection as produced by a driver.
pub(crate) enum RawConnection {
    Sqlite(rusqlite::Connection),
    // Client methods take &mut self; statements borrow the connection shared
    Postgres(RefCell<postgres::Client>),
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(_) => f.write_str("Sqlite"),
            Self::Postgres(_) => f.write_str("Postgres"),
        }
    }
}

impl RawConnection {
    pub(crate) fn close(self) -> std::result::Result<(), DriverError> {
        match self {
            Self::Sqlite(conn) => conn.close().map_err(|(_, e)| DriverError::from(e)),
            Self::Postgres(client) => client.into_inner().close().map_err(DriverError::from),
        }
    }
}

/// Driver instance, created once per factory.
pub(crate) enum Driver {
    Sqlite {
        manager: SqliteConnectionManager,
        target: SqliteTarget,
    },
    Postgres(PostgresConnectionManager<NoTls>),
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite { target, .. } => f.debug_struct("Sqlite").field("target", target).finish(),
            Self::Postgres(_) => f.write_str("Postgres"),
        }
    }
}

impl Driver {
    /// Instantiate the driver for a resolved configuration.
    pub(crate) fn build(config: &ConnectionConfig) -> Result<Self> {
        match config.driver {
            DriverKind::Sqlite => Self::build_sqlite(config),
            DriverKind::Postgres => Self::build_postgres(config),
        }
    }

    fn build_sqlite(config: &ConnectionConfig) -> Result<Self> {
        let target = parse_sqlite_url(&config.url, config.driver_path.as_deref()).map_err(
            |reason| Error::UrlRejected {
                driver: DriverKind::Sqlite.identifier(),
                url: config.url.clone(),
                reason,
            },
        )?;

        if config.username.is_some() || config.password.is_some() {
            tracing::debug!("SQLite driver ignores username and password");
        }

        let manager = match &target {
            SqliteTarget::Memory => {
                // Named shared-cache database so every pooled connection sees the same data
                let name = format!(
                    "file:cistern-{}?mode=memory&cache=shared",
                    Uuid::now_v7().simple()
                );
                SqliteConnectionManager::file(name).with_init(|conn| apply_sqlite_pragmas(conn, false))
            }
            SqliteTarget::File(path) => SqliteConnectionManager::file(path)
                .with_init(|conn| apply_sqlite_pragmas(conn, true)),
        };

        Ok(Self::Sqlite { manager, target })
    }

    fn build_postgres(config: &ConnectionConfig) -> Result<Self> {
        let reject = |reason: String| Error::UrlRejected {
            driver: DriverKind::Postgres.identifier(),
            url: config.url.clone(),
            reason,
        };

        let mut pg_config: postgres::Config = config
            .url
            .parse()
            .map_err(|e: postgres::Error| reject(e.to_string()))?;

        if let Some(username) = &config.username {
            pg_config.user(username.as_str());
        }
        if let Some(password) = &config.password {
            pg_config.password(password.as_str());
        }
        if let Some(dir) = &config.driver_path {
            #[cfg(unix)]
            {
                pg_config.host_path(dir);
            }
            #[cfg(not(unix))]
            {
                tracing::warn!(path = %dir.display(), "Socket directories are only supported on unix, ignoring driver path");
            }
        }

        if pg_config.get_hosts().is_empty() {
            return Err(reject("no host specified".to_string()));
        }

        Ok(Self::Postgres(PostgresConnectionManager::new(pg_config, NoTls)))
    }

    /// Open one physical connection.
    pub(crate) fn connect(&self) -> std::result::Result<RawConnection, DriverError> {
        match self {
            Self::Sqlite { manager, .. } => Ok(RawConnection::Sqlite(manager.connect()?)),
            Self::Postgres(manager) => Ok(RawConnection::Postgres(RefCell::new(
                manager.connect()?,
            ))),
        }
    }

    /// Cheap check whether a connection can no longer be used.
    pub(crate) fn has_broken(&self, raw: &mut RawConnection) -> bool {
        match (self, raw) {
            (Self::Sqlite { manager, .. }, RawConnection::Sqlite(conn)) => manager.has_broken(conn),
            (Self::Postgres(manager), RawConnection::Postgres(client)) => {
                manager.has_broken(client.get_mut())
            }
            _ => true,
        }
    }

    /// Whether this driver opens a shared in-memory database.
    pub(crate) fn is_memory(&self) -> bool {
        matches!(
            self,
            Self::Sqlite {
                target: SqliteTarget::Memory,
                ..
            }
        )
    }

    /// Whether this driver writes to a file on disk.
    pub(crate) fn is_file_backed(&self) -> bool {
        matches!(
            self,
            Self::Sqlite {
                target: SqliteTarget::File(_),
                ..
            }
        )
    }
}

/// Connection setup applied to every new SQLite connection.
fn apply_sqlite_pragmas(
    conn: &mut rusqlite::Connection,
    file_backed: bool,
) -> std::result::Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if file_backed {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    Ok(())
}
