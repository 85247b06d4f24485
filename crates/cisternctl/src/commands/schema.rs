//! Schema probe commands.

use anyhow::Result;
use cistern::pool::ConnectionPool;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct ExistsOutput<'a> {
    table: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    column: Option<&'a str>,
    exists: bool,
}

pub fn table_exists(pool: &ConnectionPool, table: &str, format: OutputFormat) -> Result<()> {
    let exists = pool.execute_with_pooled_connection(|conn| conn.table_exists(table))?;
    print(
        &ExistsOutput {
            table,
            column: None,
            exists,
        },
        format,
    )
}

pub fn column_exists(
    pool: &ConnectionPool,
    table: &str,
    column: &str,
    format: OutputFormat,
) -> Result<()> {
    let exists = pool.execute_with_pooled_connection(|conn| conn.column_exists(table, column))?;
    print(
        &ExistsOutput {
            table,
            column: Some(column),
            exists,
        },
        format,
    )
}

fn print(output: &ExistsOutput<'_>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", output.exists),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
    }
    Ok(())
}
