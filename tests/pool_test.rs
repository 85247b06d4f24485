//! Connection pool integration tests.
//!
//! Tests:
//! - Exhaustion fails fast
//! - Released connections are reused without reopening
//! - Operations after shutdown fail with a state error
//! - Scoped execution releases on task failure
//! - Shutdown with leaked leases completes and frees the storage lock
//! - Connections from another pool are rejected on release
//! - In-memory data survives reaping every idle connection

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cistern::pool::{ConnectionPool, PoolPhase, DEFAULT_CAPACITY};
use cistern::storage::StorageLocator;
use cistern::Error;
use common::{memory_factory, memory_pool, TestFixture};

#[test]
fn test_default_capacity_is_ten() {
    let pool = ConnectionPool::new(memory_factory());
    assert_eq!(pool.capacity(), DEFAULT_CAPACITY);
    assert_eq!(DEFAULT_CAPACITY, 10);
}

#[test]
fn test_exhaustion_fails_fast() {
    let pool = memory_pool(3);
    let held: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();

    for _ in 0..2 {
        match pool.get() {
            Err(Error::PoolExhausted { capacity }) => assert_eq!(capacity, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    for conn in held {
        pool.release(conn).unwrap();
    }
    assert!(pool.get().is_ok());
}

#[test]
fn test_release_then_get_reuses_connection() {
    let pool = memory_pool(2);
    let conn = pool.get().unwrap();
    let id = conn.id();
    pool.release(conn).unwrap();
    assert_eq!(pool.factory().created_count(), 1);

    let again = pool.get().unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(pool.factory().created_count(), 1);
    pool.release(again).unwrap();
}

#[test]
fn test_most_recently_released_is_reused_first() {
    let pool = memory_pool(2);
    let first = pool.get().unwrap();
    let second = pool.get().unwrap();
    let second_id = second.id();
    pool.release(first).unwrap();
    pool.release(second).unwrap();

    let conn = pool.get().unwrap();
    assert_eq!(conn.id(), second_id);
    pool.release(conn).unwrap();
}

#[test]
fn test_get_and_release_fail_after_shutdown() {
    let pool = memory_pool(2);
    let conn = pool.get().unwrap();
    pool.shutdown();

    assert!(matches!(pool.get(), Err(Error::PoolShutDown)));
    assert!(matches!(pool.release(conn), Err(Error::PoolShutDown)));
    assert!(Error::PoolShutDown.is_pool_state());
}

#[test]
fn test_shutdown_is_idempotent() {
    let pool = memory_pool(2);
    pool.shutdown();
    pool.shutdown();
    assert_eq!(pool.status().phase, PoolPhase::Closed);
}

#[test]
fn test_failing_task_releases_connection() {
    let pool = memory_pool(2);
    let conn = pool.get().unwrap();
    pool.release(conn).unwrap();
    let before = pool.status();

    let result: Result<(), Error> = pool.execute_with_pooled_connection(|conn| {
        conn.statement("SELECT * FROM no_such_table").execute_update(())?;
        Ok(())
    });

    assert!(matches!(result, Err(Error::Statement { .. })));
    let after = pool.status();
    assert_eq!(after.available, before.available);
    assert_eq!(after.leased, 0);
}

#[test]
fn test_task_error_type_is_caller_defined() {
    #[derive(Debug)]
    enum AppError {
        Storage(Error),
        Invalid(&'static str),
    }

    impl From<Error> for AppError {
        fn from(e: Error) -> Self {
            Self::Storage(e)
        }
    }

    let pool = memory_pool(1);
    let result: Result<i64, AppError> =
        pool.execute_with_pooled_connection(|_| Err(AppError::Invalid("rejected")));
    assert!(matches!(result, Err(AppError::Invalid("rejected"))));

    pool.shutdown();
    let result: Result<i64, AppError> = pool.execute_with_pooled_connection(|_| Ok(1));
    assert!(matches!(result, Err(AppError::Storage(Error::PoolShutDown))));
}

#[test]
fn test_shutdown_with_leaked_lease_completes() {
    let fixture = TestFixture::new();
    let pool = fixture.file_pool("leaky");
    let dir = pool.factory().storage_dir().unwrap().to_path_buf();

    let leaked = pool.get().unwrap();
    let leases = pool.leases();
    assert_eq!(leases.len(), 1);
    assert!(leases[0].annotation.contains("pool_test.rs"));

    pool.shutdown();
    assert_eq!(pool.status().phase, PoolPhase::Closed);
    drop(leaked);

    // Lock is free again
    let lease = StorageLocator::new(&fixture.scope("leaky")).acquire().unwrap();
    assert_eq!(lease.dir(), dir.as_path());
}

#[test]
fn test_file_backed_data_survives_shutdown() {
    let fixture = TestFixture::new();
    {
        let pool = fixture.file_pool("durable");
        pool.execute_with_pooled_connection(|conn| {
            conn.execute_script("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")?;
            conn.statement("INSERT INTO notes (body) VALUES (?1)")
                .execute_update(cistern::Value::from("kept"))
        })
        .unwrap();
        pool.shutdown();
    }

    let pool = fixture.file_pool("durable");
    let body = pool
        .execute_with_pooled_connection(|conn| {
            conn.statement("SELECT body FROM notes").execute_string_query(())
        })
        .unwrap();
    assert_eq!(body.as_deref(), Some("kept"));
}

#[test]
fn test_dropping_pool_releases_storage() {
    let fixture = TestFixture::new();
    let dir = {
        let pool = fixture.file_pool("dropped");
        pool.factory().storage_dir().unwrap().to_path_buf()
    };

    let pool = fixture.file_pool("dropped");
    assert_eq!(pool.factory().storage_dir(), Some(dir.as_path()));
}

#[test]
fn test_concurrent_leases_never_exceed_capacity() {
    let pool = Arc::new(memory_pool(4));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let mut exhausted = 0;
                for _ in 0..50 {
                    match pool.get() {
                        Ok(conn) => {
                            assert!(pool.status().leased <= 4);
                            pool.release(conn).unwrap();
                        }
                        Err(Error::PoolExhausted { .. }) => exhausted += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                exhausted
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    let status = pool.status();
    assert_eq!(status.leased, 0);
    assert!(pool.factory().created_count() <= 4);
}

#[test]
fn test_release_rejects_connection_from_another_pool() {
    let a = memory_pool(2);
    let b = memory_pool(2);
    let a_conn = a.get().unwrap();
    let b_conn = b.get().unwrap();
    assert_ne!(a_conn.id(), b_conn.id());
    a_conn.execute_script("CREATE TABLE only_in_a (id INTEGER)").unwrap();

    let b_id = b_conn.id();
    match a.release(b_conn) {
        Err(Error::UnknownLease(id)) => assert_eq!(id, b_id),
        other => panic!("expected unknown lease, got {other:?}"),
    }

    // A's own lease is untouched and nothing foreign became available
    assert_eq!(a.status().leased, 1);
    assert_eq!(a.status().available, 0);
    a.release(a_conn).unwrap();
    let conn = a.get().unwrap();
    assert!(conn.table_exists("only_in_a").unwrap());
    a.release(conn).unwrap();
}

#[test]
fn test_memory_data_survives_reaping_all_idle_connections() {
    let pool = memory_pool(2);
    pool.execute_with_pooled_connection(|conn| {
        conn.execute_script("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2);")
    })
    .unwrap();

    assert_eq!(pool.reap_idle(Duration::ZERO, 0), 1);
    assert_eq!(pool.status().available, 0);

    let count = pool
        .execute_with_pooled_connection(|conn| {
            conn.statement("SELECT COUNT(*) FROM t").execute_long_query(())
        })
        .unwrap();
    assert_eq!(count, Some(2));
}
