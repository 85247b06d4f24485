//! Shared fixtures for Cistern integration tests.
//!
//! Provides:
//! - A temporary storage base directory
//! - Factory and pool builders for in-memory and file-backed SQLite

#![allow(dead_code)]

use std::path::Path;

use cistern::config::{keys, Config, Overrides};
use cistern::connection::{ConnectionFactory, MEMORY_URL};
use cistern::pool::{ConnectionPool, PoolOptions};
use cistern::storage::StorageScope;
use tempfile::TempDir;

/// Test fixture that manages a temporary storage base directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary base directory for located storage
    pub temp_dir: TempDir,
}

impl TestFixture {
    /// Create a new test fixture with a temporary base directory.
    pub fn new() -> Self {
        cistern::observability::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        Self { temp_dir }
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Storage scope under the fixture's base directory.
    pub fn scope(&self, caller_id: &str) -> StorageScope {
        StorageScope::new(self.base(), "cistern-test", "v1", caller_id)
    }

    /// Factory on the default URL, locating storage for `caller_id`.
    pub fn file_factory(&self, caller_id: &str) -> ConnectionFactory {
        ConnectionFactory::new(&Config::default(), Some(&self.scope(caller_id)))
            .expect("failed to build file-backed factory")
    }

    pub fn file_pool(&self, caller_id: &str) -> ConnectionPool {
        ConnectionPool::new(self.file_factory(caller_id))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with the given overrides and no resource file.
pub fn config_with(pairs: &[(&str, &str)]) -> Config {
    let mut overrides = Overrides::new();
    for (key, value) in pairs {
        overrides.set(*key, *value);
    }
    Config::with_overrides(overrides)
}

/// Factory for a fresh shared in-memory database.
pub fn memory_factory() -> ConnectionFactory {
    ConnectionFactory::new(&config_with(&[(keys::URL, MEMORY_URL)]), None)
        .expect("failed to build memory factory")
}

pub fn memory_pool(capacity: usize) -> ConnectionPool {
    ConnectionPool::with_options(memory_factory(), PoolOptions { capacity })
}
