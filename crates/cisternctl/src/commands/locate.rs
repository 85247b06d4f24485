//! Locate command implementation.

use anyhow::Result;
use cistern::pool::ConnectionPool;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct LocateOutput {
    driver: String,
    dialect: String,
    url: String,
    storage_dir: Option<String>,
    file_backed: bool,
}

pub fn run(pool: &ConnectionPool, format: OutputFormat) -> Result<()> {
    let factory = pool.factory();
    let config = factory.config();

    // Prove the resolved settings actually open a connection
    pool.execute_with_pooled_connection(|conn| conn.statement("SELECT 1").execute_long_query(()))?;

    let output = LocateOutput {
        driver: config.driver.to_string(),
        dialect: format!("{:?}", factory.dialect()),
        url: config.url.clone(),
        storage_dir: factory.storage_dir().map(|dir| dir.display().to_string()),
        file_backed: factory.is_file_backed(),
    };

    match format {
        OutputFormat::Text => {
            println!("{:<12} {}", "DRIVER", output.driver);
            println!("{:<12} {}", "DIALECT", output.dialect);
            println!("{:<12} {}", "URL", output.url);
            println!(
                "{:<12} {}",
                "STORAGE",
                output.storage_dir.as_deref().unwrap_or("(in memory)")
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
