//! cisternctl: Command-line interface for Cistern.
//!
//! Provides commands for locating storage, running statements and probing
//! the schema from the terminal.

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cistern::config::{Config, Overrides};
use cistern::connection::ConnectionFactory;
use cistern::observability::LogFormat;
use cistern::pool::ConnectionPool;
use cistern::storage::StorageScope;
use cistern::Value;

/// Command-line interface for Cistern.
#[derive(Parser)]
#[command(name = "cisternctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration resource
    #[arg(short, long, env = "CISTERN_CONFIG")]
    config: Option<PathBuf>,

    /// Base directory for located storage
    #[arg(short, long, env = "CISTERN_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Component name in the storage path
    #[arg(long, default_value = "cistern")]
    component: String,

    /// Schema version in the storage path
    #[arg(long, default_value = "v1")]
    schema_version: String,

    /// Caller identity in the storage path
    #[arg(long, default_value = "cli")]
    caller_id: String,

    /// Configuration override (repeatable), e.g. --set driver=postgres
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    overrides: Vec<(String, String)>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    /// Log format on stderr (text, json)
    #[arg(long, env = "CISTERN_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved driver, URL and storage directory
    Locate,
    /// Run an update statement and print the affected row count
    Exec {
        /// SQL statement
        sql: String,
        /// Positional parameter (repeatable; `null`, numbers, else text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Run a query and print its rows
    Query {
        /// SQL query
        sql: String,
        /// Positional parameter (repeatable; `null`, numbers, else text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Check whether a table exists
    TableExists {
        /// Table name
        table: String,
    },
    /// Check whether a table has a column
    ColumnExists {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn params(literals: &[String]) -> Vec<Value> {
    literals.iter().map(|p| Value::from_literal(p)).collect()
}

impl Cli {
    fn open_pool(&self) -> Result<ConnectionPool> {
        let mut cli_overrides = Overrides::new();
        for (key, value) in &self.overrides {
            cli_overrides.set(key, value);
        }
        let config = Config::load(
            self.config.as_deref(),
            Overrides::from_env().merge(cli_overrides),
        );
        let scope = StorageScope::new(
            &self.data_dir,
            &self.component,
            &self.schema_version,
            &self.caller_id,
        );

        let factory =
            ConnectionFactory::new(&config, Some(&scope)).context("failed to open storage")?;
        Ok(ConnectionPool::new(factory))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cistern::observability::init_tracing("cisternctl", cli.log_format);

    let pool = cli.open_pool()?;
    let result = match &cli.command {
        Commands::Locate => commands::locate::run(&pool, cli.output),
        Commands::Exec { sql, params: p } => commands::exec::run(&pool, sql, params(p), cli.output),
        Commands::Query { sql, params: p } => {
            commands::query::run(&pool, sql, params(p), cli.output)
        }
        Commands::TableExists { table } => {
            commands::schema::table_exists(&pool, table, cli.output)
        }
        Commands::ColumnExists { table, column } => {
            commands::schema::column_exists(&pool, table, column, cli.output)
        }
    };
    pool.shutdown();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("url=sqlite::memory:").unwrap(),
            ("url".to_string(), "sqlite::memory:".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_cli_parses_repeated_overrides() {
        let cli = Cli::try_parse_from([
            "cisternctl",
            "--set",
            "driver=sqlite",
            "--set",
            "url=sqlite::memory:",
            "query",
            "SELECT ?1",
            "--param",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.overrides.len(), 2);
        match cli.command {
            Commands::Query { params: p, .. } => assert_eq!(params(&p), vec![Value::Integer(7)]),
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
