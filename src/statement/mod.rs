//! Statement execution.
//!
//! A [`Statement`] binds one SQL text to one [`PooledConnection`]. Each call
//! prepares, binds, executes and releases the prepared form, unless the
//! statement is in batch mode, where the prepared form is kept between calls.
//!
//! Every execution is logged at `trace` with its SQL, elapsed time and row
//! count.

mod value;

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use postgres_types::ToSql;

use crate::connection::driver::RawConnection;
use crate::connection::PooledConnection;
use crate::error::{DriverError, Error, Result};

use value::from_postgres;
pub use value::{IntoParams, Row, Value};

/// Prepared form of a statement, tied to the connection it was prepared on.
enum Prepared<'c> {
    Sqlite(rusqlite::Statement<'c>),
    Postgres {
        client: &'c RefCell<postgres::Client>,
        statement: postgres::Statement,
    },
}

/// Prepare `sql` into `slot` unless it already holds a prepared form.
fn prepare<'c, 's>(
    conn: &'c PooledConnection,
    sql: &str,
    slot: &'s mut Option<Prepared<'c>>,
) -> std::result::Result<&'s mut Prepared<'c>, DriverError> {
    let prepared = match slot.take() {
        Some(prepared) => prepared,
        None => match &conn.raw {
            RawConnection::Sqlite(c) => Prepared::Sqlite(c.prepare(sql)?),
            RawConnection::Postgres(client) => Prepared::Postgres {
                client,
                statement: client.borrow_mut().prepare(sql)?,
            },
        },
    };
    Ok(slot.insert(prepared))
}

fn postgres_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

impl PooledConnection {
    /// Create a statement for `sql` on this connection.
    pub fn statement(&self, sql: impl Into<String>) -> Statement<'_> {
        Statement {
            conn: self,
            sql: sql.into(),
            prepared: None,
            batching: false,
        }
    }
}

/// A reusable, parameterized statement bound to one connection.
pub struct Statement<'c> {
    conn: &'c PooledConnection,
    sql: String,
    prepared: Option<Prepared<'c>>,
    batching: bool,
}

impl<'c> Statement<'c> {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// True between [`begin_batch`](Self::begin_batch) and
    /// [`finish_batch`](Self::finish_batch).
    pub fn is_batching(&self) -> bool {
        self.batching
    }

    /// Prepare once and keep the prepared form for the following executions.
    pub fn begin_batch(&mut self) -> Result<()> {
        prepare(self.conn, &self.sql, &mut self.prepared)
            .map_err(|e| Error::statement(&self.sql, e))?;
        self.batching = true;
        tracing::trace!(sql = %self.sql, "Began batch");
        Ok(())
    }

    /// Release the prepared form kept by batch mode.
    pub fn finish_batch(&mut self) {
        self.batching = false;
        self.prepared = None;
        tracing::trace!(sql = %self.sql, "Finished batch");
    }

    /// Execute and return the number of affected rows.
    ///
    /// On failure the prepared form is discarded and the error carries the
    /// SQL text.
    pub fn execute_update(&mut self, params: impl IntoParams) -> Result<u64> {
        let params = params.into_params();
        let start = Instant::now();

        let result = self.run_update(&params);
        if result.is_err() || !self.batching {
            self.prepared = None;
        }
        let rows = result.map_err(|e| Error::statement(&self.sql, e))?;

        tracing::trace!(
            sql = %self.sql,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            rows,
            "Executed update"
        );
        Ok(rows)
    }

    fn run_update(&mut self, params: &[Value]) -> std::result::Result<u64, DriverError> {
        match prepare(self.conn, &self.sql, &mut self.prepared)? {
            Prepared::Sqlite(stmt) => {
                let rows = stmt.execute(rusqlite::params_from_iter(params))?;
                Ok(rows as u64)
            }
            Prepared::Postgres { client, statement } => Ok(client
                .borrow_mut()
                .execute(&*statement, &postgres_params(params))?),
        }
    }

    /// Stream result rows to `handler`.
    ///
    /// The cursor is closed on every path. Errors returned by `handler` stop
    /// the query and are passed through unchanged.
    pub fn execute_query<F>(&mut self, params: impl IntoParams, mut handler: F) -> Result<()>
    where
        F: FnMut(&Row) -> Result<()>,
    {
        let params = params.into_params();
        let start = Instant::now();
        let mut rows = 0u64;

        let result = self.run_query(&params, &mut |row: &Row| {
            rows += 1;
            handler(row)
        });
        if result.is_err() || !self.batching {
            self.prepared = None;
        }
        result?;

        tracing::trace!(
            sql = %self.sql,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            rows,
            "Executed query"
        );
        Ok(())
    }

    fn run_query(
        &mut self,
        params: &[Value],
        handler: &mut dyn FnMut(&Row) -> Result<()>,
    ) -> Result<()> {
        let sql = self.sql.as_str();
        let prepared =
            prepare(self.conn, sql, &mut self.prepared).map_err(|e| Error::statement(sql, e))?;

        match prepared {
            Prepared::Sqlite(stmt) => {
                let columns: Arc<[String]> =
                    stmt.column_names().into_iter().map(String::from).collect();
                let mut rows = stmt
                    .query(rusqlite::params_from_iter(params))
                    .map_err(|e| Error::statement(sql, e))?;

                while let Some(row) = rows.next().map_err(|e| Error::statement(sql, e))? {
                    let values = (0..columns.len())
                        .map(|idx| row.get_ref(idx).map(Value::from))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|e| Error::statement(sql, e))?;
                    handler(&Row::new(Arc::clone(&columns), values))?;
                }
            }
            Prepared::Postgres { client, statement } => {
                let columns: Arc<[String]> = statement
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
                let result_rows = client
                    .borrow_mut()
                    .query(&*statement, &postgres_params(params))
                    .map_err(|e| Error::statement(sql, e))?;

                for row in &result_rows {
                    let values = (0..columns.len())
                        .map(|idx| from_postgres(row, idx))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(|e| Error::statement(sql, e))?;
                    handler(&Row::new(Arc::clone(&columns), values))?;
                }
            }
        }
        Ok(())
    }

    /// Fetch at most one row; a second row is an error.
    fn single_row(&mut self, params: impl IntoParams) -> Result<Option<Row>> {
        let mut first: Option<Row> = None;
        let mut extra = false;

        let result = self.execute_query(params, |row| {
            if first.is_some() {
                extra = true;
                // Stop streaming; reported below
                return Err(Error::MultipleRows { sql: String::new() });
            }
            first = Some(row.clone());
            Ok(())
        });

        if extra {
            return Err(Error::MultipleRows {
                sql: self.sql.clone(),
            });
        }
        result?;
        Ok(first)
    }

    /// First column of the single row, converted with `convert`.
    fn single_value<T>(
        &mut self,
        params: impl IntoParams,
        expected: &'static str,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Result<Option<T>> {
        let Some(row) = self.single_row(params)? else {
            return Ok(None);
        };
        match row.get(0) {
            None => Err(self.conversion(0, expected)),
            Some(Value::Null) => Ok(None),
            Some(value) => convert(value)
                .map(Some)
                .ok_or_else(|| self.conversion(0, expected)),
        }
    }

    fn conversion(&self, column: usize, expected: &'static str) -> Error {
        Error::Conversion {
            sql: self.sql.clone(),
            column,
            expected,
        }
    }

    /// Single text value. Blob results are decoded as UTF-8.
    pub fn execute_string_query(&mut self, params: impl IntoParams) -> Result<Option<String>> {
        self.single_value(params, "text", Value::as_string)
    }

    /// Single numeric value.
    pub fn execute_numeric_query(&mut self, params: impl IntoParams) -> Result<Option<f64>> {
        self.single_value(params, "numeric", Value::as_f64)
    }

    /// Single 64-bit integer value.
    pub fn execute_long_query(&mut self, params: impl IntoParams) -> Result<Option<i64>> {
        self.single_value(params, "long", Value::as_i64)
    }

    /// Single 32-bit integer value; out-of-range values are conversion errors.
    pub fn execute_int_query(&mut self, params: impl IntoParams) -> Result<Option<i32>> {
        self.single_value(params, "int", |v| v.as_i64().and_then(|i| i32::try_from(i).ok()))
    }

    /// All columns of the single row.
    pub fn execute_multi_column_query(
        &mut self,
        params: impl IntoParams,
    ) -> Result<Option<Vec<Value>>> {
        Ok(self.single_row(params)?.map(Row::into_values))
    }

    /// All columns of the single row as integers; empty when there is no row.
    pub fn execute_query_for_long_array(&mut self, params: impl IntoParams) -> Result<Vec<i64>> {
        let Some(row) = self.single_row(params)? else {
            return Ok(Vec::new());
        };
        row.values()
            .iter()
            .enumerate()
            .map(|(idx, value)| value.as_i64().ok_or_else(|| self.conversion(idx, "long")))
            .collect()
    }
}
