//! Test doubles for the transaction core.
//!
//! `RecordingConn` stands in for a PostgreSQL session: it records every
//! statement in order and can be scripted to fail the next statement
//! matching a substring, which is how the abort and conflict paths are
//! exercised without a database. Enabled for this crate's tests and, via
//! the `test-helpers` feature, for downstream integration tests.

use crate::executor::MedbayExecutor;
use crate::outcome::MedbayError;
use crate::pool::ConnectionSource;
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A session double that records statements.
pub struct RecordingConn {
    statements: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, MedbayError)>>,
}

impl RecordingConn {
    pub fn new() -> Self {
        Self {
            statements: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Everything executed so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock(&self.statements).clone()
    }

    /// Fail the next statement containing `pattern` with `error`, once.
    pub fn fail_next_matching(&self, pattern: &str, error: MedbayError) {
        self.lock(&self.failures).push((pattern.to_string(), error));
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, sql: &str) -> Result<(), MedbayError> {
        self.lock(&self.statements).push(sql.to_string());
        let mut failures = self.lock(&self.failures);
        if let Some(pos) = failures.iter().position(|(p, _)| sql.contains(p.as_str())) {
            let (_, error) = failures.remove(pos);
            return Err(error);
        }
        Ok(())
    }
}

impl Default for RecordingConn {
    fn default() -> Self {
        Self::new()
    }
}

impl MedbayExecutor for RecordingConn {
    fn execute(&self, sql: &str, _params: &[&dyn ToSql]) -> Result<u64, MedbayError> {
        self.observe(sql)?;
        Ok(1)
    }

    fn query(&self, sql: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, MedbayError> {
        self.observe(sql)?;
        Ok(Vec::new())
    }

    fn batch_execute(&self, sql: &str) -> Result<(), MedbayError> {
        self.observe(sql)
    }
}

/// A connection source handing out a single shared [`RecordingConn`].
pub struct RecordingSource {
    conn: Arc<RecordingConn>,
    checkouts: AtomicUsize,
}

impl RecordingSource {
    pub fn new(conn: Arc<RecordingConn>) -> Self {
        Self {
            conn,
            checkouts: AtomicUsize::new(0),
        }
    }

    /// How many times a connection was checked out.
    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::Relaxed)
    }
}

impl ConnectionSource for RecordingSource {
    fn checkout(&self) -> Result<Arc<dyn MedbayExecutor>, MedbayError> {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.conn) as Arc<dyn MedbayExecutor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_statements_in_order() {
        let conn = RecordingConn::new();
        conn.batch_execute("BEGIN").unwrap();
        conn.execute("INSERT", &[]).unwrap();
        assert_eq!(conn.statements(), vec!["BEGIN", "INSERT"]);
    }

    #[test]
    fn scripted_failure_fires_once() {
        let conn = RecordingConn::new();
        conn.fail_next_matching("INSERT", MedbayError::unique_conflict("dup"));
        assert!(conn.execute("INSERT INTO t", &[]).is_err());
        assert!(conn.execute("INSERT INTO t", &[]).is_ok());
    }
}
