//! Bounded connection pool.
//!
//! Provides:
//! - Fail-fast leasing: exhaustion is reported immediately, never queued
//! - Lease bookkeeping with a caller annotation for leak diagnostics
//! - Idempotent shutdown that flushes the embedded store and releases the
//!   storage lock
//! - An optional background [`IdleReaper`](reaper::IdleReaper)
//!
//! All bookkeeping sits behind a single mutex shared by `get`, `release`,
//! `shutdown` and `reap_idle`.

pub mod reaper;

use std::collections::HashMap;
use std::panic::Location;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::connection::{ConnectionFactory, PooledConnection};
use crate::dialect::Dialect;
use crate::error::{Error, Result};

pub use reaper::{IdleReaper, ReaperConfig};

/// Default number of connections a pool may lease at once.
pub const DEFAULT_CAPACITY: usize = 10;

/// Pool tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of simultaneously leased connections
    pub capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Lifecycle of a pool: `Active → ShuttingDown → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Active,
    ShuttingDown,
    Closed,
}

/// Snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub phase: PoolPhase,
    pub capacity: usize,
    pub available: usize,
    pub leased: usize,
}

/// Diagnostic view of one outstanding lease.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: u64,
    pub annotation: String,
    pub leased_at: Instant,
}

struct IdleConnection {
    conn: PooledConnection,
    idle_since: Instant,
}

struct Lease {
    annotation: String,
    leased_at: Instant,
}

struct PoolState {
    phase: PoolPhase,
    // Oldest first; leasing takes from the back
    available: Vec<IdleConnection>,
    leased: HashMap<u64, Lease>,
}

/// A bounded pool of connections from one [`ConnectionFactory`].
pub struct ConnectionPool {
    factory: ConnectionFactory,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create a pool with [`DEFAULT_CAPACITY`].
    pub fn new(factory: ConnectionFactory) -> Self {
        Self::with_options(factory, PoolOptions::default())
    }

    pub fn with_options(factory: ConnectionFactory, options: PoolOptions) -> Self {
        tracing::debug!(
            capacity = options.capacity,
            dialect = ?factory.dialect(),
            "Created connection pool"
        );
        Self {
            factory,
            capacity: options.capacity,
            state: Mutex::new(PoolState {
                phase: PoolPhase::Active,
                available: Vec::new(),
                leased: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn dialect(&self) -> Dialect {
        self.factory.dialect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lease a connection, annotated with the caller's source location.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolShutDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::PoolExhausted`] when nothing is idle and `capacity`
    ///   connections are already leased
    /// - [`Error::Connect`] when a new connection cannot be opened
    #[track_caller]
    pub fn get(&self) -> Result<PooledConnection> {
        let caller = Location::caller();
        self.get_annotated(format!("{}:{}", caller.file(), caller.line()))
    }

    /// Lease a connection with an explicit annotation.
    pub fn get_annotated(&self, annotation: impl Into<String>) -> Result<PooledConnection> {
        let annotation = annotation.into();
        let mut state = self.lock();
        if state.phase != PoolPhase::Active {
            return Err(Error::PoolShutDown);
        }

        let conn = match state.available.pop() {
            Some(idle) => idle.conn,
            None => {
                if state.leased.len() >= self.capacity {
                    tracing::warn!(
                        capacity = self.capacity,
                        annotation = %annotation,
                        "Connection pool exhausted"
                    );
                    return Err(Error::PoolExhausted {
                        capacity: self.capacity,
                    });
                }
                self.factory.create_connection()?
            }
        };

        tracing::trace!(id = conn.id(), annotation = %annotation, "Leased connection");
        state.leased.insert(
            conn.id(),
            Lease {
                annotation,
                leased_at: Instant::now(),
            },
        );
        Ok(conn)
    }

    /// Return a leased connection to the available set.
    ///
    /// Broken connections are closed instead of being kept.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolShutDown`] after shutdown (the connection is closed)
    /// - [`Error::UnknownLease`] when the connection was not leased here
    pub fn release(&self, mut conn: PooledConnection) -> Result<()> {
        let mut state = self.lock();
        if state.phase != PoolPhase::Active {
            drop(state);
            close_quietly(conn);
            return Err(Error::PoolShutDown);
        }

        let id = conn.id();
        if state.leased.remove(&id).is_none() {
            return Err(Error::UnknownLease(id));
        }

        if self.factory.has_broken(&mut conn) {
            tracing::warn!(id, "Discarding broken connection");
            close_quietly(conn);
            return Ok(());
        }

        tracing::trace!(id, "Released connection");
        state.available.push(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
        Ok(())
    }

    /// Drop a lease whose connection was lost (e.g. during unwinding).
    fn forget_lease(&self, id: u64) {
        if self.lock().leased.remove(&id).is_some() {
            tracing::warn!(id, "Dropped lease of abandoned connection");
        }
    }

    /// Run `task` with a leased connection, releasing it afterwards.
    ///
    /// The connection goes back to the pool whether `task` succeeds or fails.
    /// If `task` panics the connection is closed and its lease removed. An
    /// error from `task` takes precedence over a release error.
    #[track_caller]
    pub fn execute_with_pooled_connection<T, E, F>(&self, task: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&PooledConnection) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let caller = Location::caller();
        let conn = self.get_annotated(format!("{}:{}", caller.file(), caller.line()))?;
        let guard = UnwindGuard {
            pool: self,
            id: conn.id(),
            armed: true,
        };

        let result = task(&conn);
        guard.disarm();
        let released = self.release(conn);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                tracing::warn!(error = %release_error, "Failed to release connection after task error");
                Err(e)
            }
        }
    }

    /// Close idle connections unused for at least `max_idle`, keeping
    /// `min_idle` of them. Returns the number closed.
    pub fn reap_idle(&self, max_idle: Duration, min_idle: usize) -> usize {
        let reaped: Vec<IdleConnection> = {
            let mut state = self.lock();
            if state.phase != PoolPhase::Active {
                return 0;
            }
            let now = Instant::now();
            let excess = state.available.len().saturating_sub(min_idle);
            let stale = state
                .available
                .iter()
                .take(excess)
                .take_while(|idle| now.duration_since(idle.idle_since) >= max_idle)
                .count();
            state.available.drain(..stale).collect()
        };

        let count = reaped.len();
        for idle in reaped {
            close_quietly(idle.conn);
        }
        if count > 0 {
            tracing::debug!(count, "Reaped idle connections");
        }
        count
    }

    /// Drain and close the pool. Later calls do nothing.
    ///
    /// Leased connections are reported as leaks but do not block shutdown.
    /// For a file-backed embedded store the dialect's shutdown statement runs
    /// on one fresh connection before the storage lock is released.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.phase != PoolPhase::Active {
            return;
        }
        state.phase = PoolPhase::ShuttingDown;
        tracing::info!(
            available = state.available.len(),
            leased = state.leased.len(),
            "Shutting down connection pool"
        );

        if !state.leased.is_empty() {
            for (id, lease) in &state.leased {
                tracing::warn!(
                    id,
                    annotation = %lease.annotation,
                    held_ms = lease.leased_at.elapsed().as_millis() as u64,
                    "Connection still leased at shutdown"
                );
            }
            tracing::warn!(count = state.leased.len(), "Connections leaked at shutdown");
        }

        for idle in state.available.drain(..) {
            close_quietly(idle.conn);
        }

        self.flush_embedded_store();
        self.factory.release_storage();

        state.phase = PoolPhase::Closed;
        tracing::info!("Connection pool closed");
    }

    fn flush_embedded_store(&self) {
        let dialect = self.factory.dialect();
        if !dialect.is_embedded() || !self.factory.is_file_backed() {
            return;
        }
        let Some(sql) = dialect.shutdown_statement() else {
            return;
        };

        match self.factory.create_connection() {
            Ok(conn) => {
                if let Err(e) = conn.statement(sql).execute_query((), |_| Ok(())) {
                    tracing::warn!(error = %e, "Shutdown statement failed");
                }
                close_quietly(conn);
            }
            Err(e) => tracing::warn!(error = %e, "Could not open connection for shutdown statement"),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            phase: state.phase,
            capacity: self.capacity,
            available: state.available.len(),
            leased: state.leased.len(),
        }
    }

    /// Outstanding leases, oldest first.
    pub fn leases(&self) -> Vec<LeaseInfo> {
        let mut leases: Vec<LeaseInfo> = self
            .lock()
            .leased
            .iter()
            .map(|(id, lease)| LeaseInfo {
                id: *id,
                annotation: lease.annotation.clone(),
                leased_at: lease.leased_at,
            })
            .collect();
        leases.sort_by_key(|lease| lease.leased_at);
        leases
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Removes the lease if the task unwinds before the connection is released.
struct UnwindGuard<'p> {
    pool: &'p ConnectionPool,
    id: u64,
    armed: bool,
}

impl UnwindGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.forget_lease(self.id);
        }
    }
}

fn close_quietly(conn: PooledConnection) {
    let id = conn.id();
    if let Err(e) = conn.close() {
        tracing::warn!(id, error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, Config, Overrides};
    use crate::connection::MEMORY_URL;

    fn memory_pool(capacity: usize) -> ConnectionPool {
        let mut overrides = Overrides::new();
        overrides.set(keys::URL, MEMORY_URL);
        let factory = ConnectionFactory::new(&Config::with_overrides(overrides), None).unwrap();
        ConnectionPool::with_options(factory, PoolOptions { capacity })
    }

    #[test]
    fn test_get_records_caller_annotation() {
        let pool = memory_pool(2);
        let conn = pool.get().unwrap();

        let leases = pool.leases();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].id, conn.id());
        assert!(leases[0].annotation.contains("pool"));
        pool.release(conn).unwrap();
    }

    #[test]
    fn test_release_of_foreign_connection_fails() {
        let pool = memory_pool(2);
        let other = memory_pool(2);
        let conn = other.get().unwrap();
        let stray = other.factory().create_connection().unwrap();

        assert!(matches!(pool.release(stray), Err(Error::UnknownLease(_))));
        other.release(conn).unwrap();
    }

    #[test]
    fn test_reap_idle_keeps_minimum() {
        let pool = memory_pool(4);
        let conns: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        for conn in conns {
            pool.release(conn).unwrap();
        }

        assert_eq!(pool.reap_idle(Duration::ZERO, 1), 2);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_reap_idle_spares_recent_connections() {
        let pool = memory_pool(4);
        let conn = pool.get().unwrap();
        pool.release(conn).unwrap();

        assert_eq!(pool.reap_idle(Duration::from_secs(3600), 0), 0);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_unwinding_task_drops_lease() {
        let pool = memory_pool(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = pool.execute_with_pooled_connection(|_| panic!("task failed"));
        }));
        assert!(result.is_err());

        let status = pool.status();
        assert_eq!(status.leased, 0);
        // Capacity is not lost
        let conn = pool.get().unwrap();
        pool.release(conn).unwrap();
    }

    #[test]
    fn test_phase_transitions() {
        let pool = memory_pool(1);
        assert_eq!(pool.status().phase, PoolPhase::Active);
        pool.shutdown();
        assert_eq!(pool.status().phase, PoolPhase::Closed);
        assert_eq!(pool.reap_idle(Duration::ZERO, 0), 0);
    }
}
