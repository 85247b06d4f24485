//! Exec command implementation.

use anyhow::{Context, Result};
use cistern::pool::ConnectionPool;
use cistern::Value;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct ExecOutput<'a> {
    sql: &'a str,
    rows_affected: u64,
}

pub fn run(pool: &ConnectionPool, sql: &str, params: Vec<Value>, format: OutputFormat) -> Result<()> {
    let rows_affected = pool
        .execute_with_pooled_connection(|conn| conn.statement(sql).execute_update(params))
        .context("statement failed")?;
    tracing::debug!(rows_affected, "Executed update");

    match format {
        OutputFormat::Text => println!("{} row(s) affected", rows_affected),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&ExecOutput { sql, rows_affected })?
            );
        }
    }

    Ok(())
}
