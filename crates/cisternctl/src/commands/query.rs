//! Query command implementation.

use anyhow::{Context, Result};
use cistern::pool::ConnectionPool;
use cistern::Value;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct QueryOutput {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    total: usize,
}

pub fn run(pool: &ConnectionPool, sql: &str, params: Vec<Value>, format: OutputFormat) -> Result<()> {
    let mut output = QueryOutput {
        columns: Vec::new(),
        rows: Vec::new(),
        total: 0,
    };

    pool.execute_with_pooled_connection(|conn| {
        conn.statement(sql).execute_query(params, |row| {
            if output.columns.is_empty() {
                output.columns = row.columns().to_vec();
            }
            output.rows.push(row.values().to_vec());
            Ok(())
        })
    })
    .context("query failed")?;
    output.total = output.rows.len();

    match format {
        OutputFormat::Text => {
            if output.rows.is_empty() {
                println!("No rows.");
            } else {
                println!("{}", output.columns.join("\t"));
                for row in &output.rows {
                    let cells: Vec<String> = row.iter().map(render).collect();
                    println!("{}", cells.join("\t"));
                }
                println!();
                println!("Total: {} row(s)", output.total);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Blob(bytes) => value
            .as_string()
            .unwrap_or_else(|| format!("<{} bytes>", bytes.len())),
        other => other.as_string().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_values() {
        assert_eq!(render(&Value::Null), "NULL");
        assert_eq!(render(&Value::Integer(3)), "3");
        assert_eq!(render(&Value::Blob(vec![0xff])), "<1 bytes>");
        assert_eq!(render(&Value::Blob(b"hi".to_vec())), "hi");
    }
}
