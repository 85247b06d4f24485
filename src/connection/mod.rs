//! Connection bootstrap.
//!
//! Provides:
//! - Resolution of driver, URL and credentials from [`Config`]
//! - Storage directory location for the default embedded URL
//! - The [`ConnectionFactory`] that opens physical connections
//! - [`PooledConnection`], a raw connection tagged with its dialect

pub mod driver;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::{keys, Config};
use crate::dialect::Dialect;
use crate::error::{DriverError, Error, Result};
use crate::storage::{StorageLease, StorageLocator, StorageScope};

use driver::{Driver, RawConnection};
pub use driver::{DriverKind, DATABASE_FILE_NAME, DEFAULT_URL, MEMORY_URL};

/// Resolved connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub driver: DriverKind,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra location the driver searches (relative SQLite files, Postgres sockets)
    pub driver_path: Option<PathBuf>,
    /// Storage directory located for the default URL
    pub storage_dir: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Resolve settings from configuration. Empty values count as unset.
    pub fn resolve(config: &Config) -> Result<Self> {
        let driver = DriverKind::from_identifier(
            &config.get(keys::DRIVER, DriverKind::Sqlite.identifier()),
        )?;
        let non_empty = |key: &str| config.get_opt(key).filter(|value| !value.is_empty());

        Ok(Self {
            driver,
            url: config.get(keys::URL, DEFAULT_URL),
            username: non_empty(keys::USERNAME),
            password: non_empty(keys::PASSWORD),
            driver_path: non_empty(keys::DRIVER_PATH).map(PathBuf::from),
            storage_dir: None,
        })
    }

    /// True when the URL asks for a located storage directory.
    pub fn uses_default_url(&self) -> bool {
        self.url == DEFAULT_URL
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("driver_path", &self.driver_path)
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

/// Opens physical connections for one pool.
///
/// The driver is instantiated once here and reused for every connection.
/// When the configured URL is [`DEFAULT_URL`] the factory also owns the
/// storage directory lease until [`release_storage`](Self::release_storage).
/// For an in-memory database it holds one extra connection for the same
/// span, so the data outlives idle reaping.
#[derive(Debug)]
pub struct ConnectionFactory {
    config: ConnectionConfig,
    driver: Driver,
    dialect: Dialect,
    lease: Mutex<Option<StorageLease>>,
    // Keeps a shared in-memory database alive when every pooled connection is closed
    keeper: Mutex<Option<RawConnection>>,
    created: AtomicU64,
}

/// Connection ids are unique across all factories in the process.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionFactory {
    /// Build a factory from configuration.
    ///
    /// `scope` names the storage area used when the URL is [`DEFAULT_URL`].
    /// Without a scope, or when every candidate directory is locked, the
    /// factory falls back to [`MEMORY_URL`].
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error for unknown drivers, a missing driver search
    /// path, or a URL the driver rejects.
    pub fn new(config: &Config, scope: Option<&StorageScope>) -> Result<Self> {
        let mut connection_config = ConnectionConfig::resolve(config)?;
        let mut lease = None;

        if connection_config.uses_default_url() {
            if connection_config.driver != DriverKind::Sqlite {
                return Err(Error::DriverBootstrap {
                    driver: connection_config.driver.identifier(),
                    reason: format!("an explicit url is required (got '{DEFAULT_URL}')"),
                });
            }

            match scope.map(|scope| StorageLocator::new(scope).acquire()) {
                Some(Ok(acquired)) => {
                    connection_config.url = driver::file_url(acquired.dir());
                    connection_config.storage_dir = Some(acquired.dir().to_path_buf());
                    lease = Some(acquired);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Falling back to in-memory storage");
                    connection_config.url = MEMORY_URL.to_string();
                }
                None => {
                    tracing::warn!("No storage scope given, falling back to in-memory storage");
                    connection_config.url = MEMORY_URL.to_string();
                }
            }
        }

        Self::with_lease(connection_config, lease)
    }

    /// Build a factory from already resolved settings.
    pub fn from_connection_config(config: ConnectionConfig) -> Result<Self> {
        Self::with_lease(config, None)
    }

    fn with_lease(config: ConnectionConfig, lease: Option<StorageLease>) -> Result<Self> {
        if let Some(path) = &config.driver_path {
            if !path.is_dir() {
                return Err(Error::DriverBootstrap {
                    driver: config.driver.identifier(),
                    reason: format!("driver search path {} is not a directory", path.display()),
                });
            }
        }

        let driver = Driver::build(&config)?;
        let dialect = config.driver.dialect();
        let keeper = if driver.is_memory() {
            Some(driver.connect().map_err(Error::Connect)?)
        } else {
            None
        };

        tracing::info!(
            driver = %config.driver,
            url = %config.url,
            storage_dir = ?config.storage_dir,
            "Connection factory ready"
        );

        Ok(Self {
            config,
            driver,
            dialect,
            lease: Mutex::new(lease),
            keeper: Mutex::new(keeper),
            created: AtomicU64::new(0),
        })
    }

    /// Open a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] when the driver cannot open a connection.
    pub fn create_connection(&self) -> Result<PooledConnection> {
        let raw = self.driver.connect().map_err(|e| {
            tracing::error!(driver = %self.config.driver, error = %e, "Failed to open connection");
            Error::Connect(e)
        })?;
        self.created.fetch_add(1, Ordering::Relaxed);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, driver = %self.config.driver, "Opened connection");

        Ok(PooledConnection {
            id,
            raw,
            dialect: self.dialect,
        })
    }

    /// Number of physical connections opened so far.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.config.storage_dir.as_deref()
    }

    /// Whether connections write to a database file.
    pub fn is_file_backed(&self) -> bool {
        self.driver.is_file_backed()
    }

    /// Release the storage directory lock and the in-memory keeper
    /// connection, if held. Later calls are no-ops.
    pub fn release_storage(&self) {
        let keeper = self
            .keeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keeper) = keeper {
            if let Err(e) = keeper.close() {
                tracing::warn!(error = %e, "Failed to close in-memory keeper connection");
            }
        }

        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            let dir = lease.dir().to_path_buf();
            if let Err(e) = lease.release() {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to release storage lock");
            }
        }
    }

    /// Check whether a returned connection is unusable.
    pub(crate) fn has_broken(&self, conn: &mut PooledConnection) -> bool {
        self.driver.has_broken(&mut conn.raw)
    }
}

/// A physical connection and its dialect.
///
/// Not safe for concurrent use; the pool hands each one to a single caller.
pub struct PooledConnection {
    id: u64,
    pub(crate) raw: RawConnection,
    dialect: Dialect,
}

impl PooledConnection {
    /// Identifier, unique across every factory in the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Run a script of one or more statements without parameters.
    pub fn execute_script(&self, sql: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let result = match &self.raw {
            RawConnection::Sqlite(conn) => conn.execute_batch(sql).map_err(DriverError::from),
            RawConnection::Postgres(client) => client
                .borrow_mut()
                .batch_execute(sql)
                .map_err(DriverError::from),
        };
        tracing::trace!(
            sql,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Executed script"
        );
        result.map_err(|e| Error::statement(sql, e))
    }

    /// Whether `table` exists, using this connection's dialect.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.dialect.table_exists(self, table)
    }

    /// Whether `column` exists on `table`, using this connection's dialect.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        self.dialect.column_exists(self, table, column)
    }

    /// Close the physical connection.
    pub fn close(self) -> std::result::Result<(), DriverError> {
        let id = self.id;
        let result = self.raw.close();
        tracing::debug!(id, ok = result.is_ok(), "Closed connection");
        result
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}
