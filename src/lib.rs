//! Cistern: an embedded relational storage connection layer.
//!
//! Cistern resolves connection settings, picks an exclusively locked storage
//! directory for the embedded engine, hands out pooled connections and runs
//! parameterized statements against either of two SQL dialects.
//!
//! # Architecture
//!
//! - **Layered configuration**: override registry, TOML resource, defaults
//! - **Lockable storage**: numbered `data[N]` candidates, first lockable wins
//! - **Closed driver registry**: `sqlite` (embedded) and `postgres` (server)
//! - **Fail-fast pool**: bounded leasing, no waiting, explicit shutdown
//! - **Dialect dispatch**: schema introspection per engine
//!
//! # Modules
//!
//! - [`config`]: Key/value resolution with overrides
//! - [`connection`]: Driver bootstrap and the connection factory
//! - [`dialect`]: Per-dialect introspection
//! - [`observability`]: Tracing setup
//! - [`pool`]: Connection pool and idle reaper
//! - [`statement`]: Statement execution, values and rows
//! - [`storage`]: Storage directory locator
//!
//! # Example
//!
//! ```no_run
//! use cistern::config::{Config, Overrides};
//! use cistern::pool::ConnectionPool;
//! use cistern::connection::ConnectionFactory;
//! use cistern::storage::StorageScope;
//!
//! # fn main() -> cistern::Result<()> {
//! let config = Config::load(None, Overrides::from_env());
//! let scope = StorageScope::new("./data", "cistern", "v1", "example");
//! let pool = ConnectionPool::new(ConnectionFactory::new(&config, Some(&scope))?);
//!
//! let count = pool.execute_with_pooled_connection(|conn| {
//!     conn.execute_script("CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY)")?;
//!     conn.statement("SELECT COUNT(*) FROM items").execute_long_query(())
//! })?;
//! println!("{count:?} items");
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // pool::PoolOptions is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes  // r#""# is fine for SQL
)]

pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod observability;
pub mod pool;
pub mod statement;
pub mod storage;

pub use connection::{ConnectionFactory, DriverKind, PooledConnection};
pub use dialect::Dialect;
pub use error::{DriverError, Error, Result};
pub use pool::ConnectionPool;
pub use statement::{Row, Statement, Value};
