//! Logging setup.
//!
//! Provides:
//! - Structured tracing to stderr, text or JSON
//! - A quiet subscriber for tests

pub mod tracing;

pub use self::tracing::{init_test_tracing, init_tracing, LogFormat};
