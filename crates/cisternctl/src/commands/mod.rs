//! Subcommand implementations.

pub mod exec;
pub mod locate;
pub mod query;
pub mod schema;
