//! Database execution abstraction.
//!
//! [`MedbayExecutor`] is the seam between the transaction core and the
//! driver: a raw statement surface (`execute`, `query`, `batch_execute`)
//! plus the transaction verbs (`begin`, `savepoint`, `release`,
//! `rollback_to`, `commit`, `rollback`) whose default implementations issue
//! the literal session SQL. `may_postgres::Client`, the pooled connection
//! guard and the in-transaction handle all implement it, so the same code
//! paths run against a live session or a recording double.

use crate::isolation::{classify, IsolationLevel};
use crate::metrics::METRICS;
use crate::outcome::MedbayError;
use may_postgres::types::ToSql;
use may_postgres::{Client, Row};
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Trait for executing database operations.
///
/// All methods suspend the calling coroutine while the driver round-trips;
/// none of them may be called while holding a lock.
pub trait MedbayExecutor: Send + Sync {
    /// Execute a parameterized statement, returning the number of rows
    /// affected.
    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, MedbayError>;

    /// Execute a parameterized query, returning all rows.
    fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, MedbayError>;

    /// Execute one or more statements over the simple-query protocol.
    ///
    /// Used for session control where statements must travel as one batch
    /// (`BEGIN; SET TRANSACTION ISOLATION LEVEL SERIALIZABLE`).
    fn batch_execute(&self, sql: &str) -> Result<(), MedbayError>;

    /// Open a transaction at the given isolation level.
    fn begin(&self, isolation: IsolationLevel) -> Result<(), MedbayError> {
        self.batch_execute(isolation.begin_sql())
    }

    /// Establish a savepoint.
    fn savepoint(&self, name: &str) -> Result<(), MedbayError> {
        self.batch_execute(&format!("SAVEPOINT {name}"))
    }

    /// Release a savepoint, keeping its effects.
    fn release(&self, name: &str) -> Result<(), MedbayError> {
        self.batch_execute(&format!("RELEASE SAVEPOINT {name}"))
    }

    /// Roll back to a savepoint, discarding effects since it was set.
    fn rollback_to(&self, name: &str) -> Result<(), MedbayError> {
        self.batch_execute(&format!("ROLLBACK TO SAVEPOINT {name}"))
    }

    /// Commit the open transaction.
    fn commit(&self) -> Result<(), MedbayError> {
        self.batch_execute("COMMIT")
    }

    /// Roll back the open transaction.
    fn rollback(&self) -> Result<(), MedbayError> {
        self.batch_execute("ROLLBACK")
    }
}

impl MedbayExecutor for Client {
    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, MedbayError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(sql).entered();

        let start = Instant::now();
        let result = Client::execute(self, sql, params).map_err(|e| {
            METRICS.record_query_error();
            classify(&e)
        });
        METRICS.record_query_duration(start.elapsed());
        result
    }

    fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, MedbayError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(sql).entered();

        let start = Instant::now();
        let result = Client::query(self, sql, params).map_err(|e| {
            METRICS.record_query_error();
            classify(&e)
        });
        METRICS.record_query_duration(start.elapsed());
        result
    }

    fn batch_execute(&self, sql: &str) -> Result<(), MedbayError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(sql).entered();

        let start = Instant::now();
        let result = Client::batch_execute(self, sql).map_err(|e| {
            METRICS.record_query_error();
            classify(&e)
        });
        METRICS.record_query_duration(start.elapsed());
        result
    }
}

/// Query exactly one row.
///
/// Maps an empty result to [`MedbayError::NotFound`] and more than one row
/// to an internal error, both constructed above the session layer so they
/// never count as statement failures.
///
/// # Errors
///
/// Returns `NotFound` for zero rows, `Internal` (code `multiple-matches`)
/// for more than one, or the underlying statement error.
pub fn query_one<E: MedbayExecutor + ?Sized>(
    executor: &E,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Row, MedbayError> {
    let mut rows = executor.query(sql, params)?;
    match rows.len() {
        1 => Ok(rows.remove(0)),
        0 => Err(MedbayError::not_found("query returned no rows")),
        n => Err(MedbayError::internal_code(
            "multiple-matches",
            format!("query returned {n} rows, expected one"),
        )),
    }
}

/// Query at most one row.
///
/// # Errors
///
/// Returns `Internal` (code `multiple-matches`) for more than one row, or
/// the underlying statement error.
pub fn query_opt<E: MedbayExecutor + ?Sized>(
    executor: &E,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Option<Row>, MedbayError> {
    let mut rows = executor.query(sql, params)?;
    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(rows.remove(0))),
        n => Err(MedbayError::internal_code(
            "multiple-matches",
            format!("query returned {n} rows, expected at most one"),
        )),
    }
}
