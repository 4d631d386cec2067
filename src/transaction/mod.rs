//! Nested transaction execution.
//!
//! `with_transaction` runs a closure under a logical transaction. The
//! outermost call checks a connection out of the pool, issues `BEGIN`
//! (optionally at serializable isolation) and commits or rolls back around
//! the closure; nested calls on the same task share the outer connection
//! and are emulated with savepoints, so an inner failure can be contained
//! without losing the outer work. Savepoint names stay internal.
//!
//! `post_commit` queues side effects that must only happen once the
//! outermost transaction durably commits: hooks registered in a frame that
//! rolls back are discarded, surviving hooks run FIFO after `COMMIT`.
//!
//! Once a statement fails inside the transaction the engine aborts the
//! whole block; the context is marked and every further statement fails
//! fast until the outermost call unwinds with a rollback. Cancellation of
//! the driving coroutine unwinds through a guard that rolls back whatever
//! frame was open.

mod ambient;
mod context;

use crate::executor::MedbayExecutor;
use crate::isolation::IsolationLevel;
use crate::metrics::METRICS;
use crate::outcome::MedbayError;
use crate::pool::ConnectionSource;
use context::{PostCommitHook, TxnContext};
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Options for [`with_transaction_opts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Request serializable isolation for the outermost transaction.
    ///
    /// Ignored on a nested call when the outer transaction is already
    /// serializable; requesting it under a weaker outer level is a
    /// programming error and fails.
    pub serializable: bool,
}

impl TransactionOptions {
    fn isolation(self) -> IsolationLevel {
        if self.serializable {
            IsolationLevel::Serializable
        } else {
            IsolationLevel::ReadCommitted
        }
    }
}

/// Run `callback` inside a transaction at default isolation.
///
/// See [`with_transaction_opts`].
///
/// # Examples
///
/// ```no_run
/// use medbay::{with_transaction, DatabaseConfig, MedbayExecutor, MedbayPool};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MedbayPool::connect(&DatabaseConfig::default())?;
/// let inserted = with_transaction(&pool, |txn| {
///     txn.execute("INSERT INTO patient (id) VALUES ($1)", &[&"p1"])
/// })?;
/// assert_eq!(inserted, 1);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the callback's error after rolling back, or the classified
/// commit error.
pub fn with_transaction<T, F>(source: &dyn ConnectionSource, callback: F) -> Result<T, MedbayError>
where
    F: FnOnce(&TxnHandle) -> Result<T, MedbayError>,
{
    with_transaction_opts(source, &TransactionOptions::default(), callback)
}

/// Run `callback` inside a transaction.
///
/// If no transaction is live on the current task, a connection is checked
/// out, `BEGIN` issued, and the transaction committed when the callback
/// returns `Ok` or rolled back when it returns `Err` (or unwinds). If a
/// transaction is already live, the callback runs under a savepoint on the
/// same connection: released on `Ok`, rolled back on `Err` while the outer
/// transaction continues.
///
/// # Errors
///
/// Returns the callback's error after the frame is rolled back, the
/// classified `COMMIT`/`RELEASE` error, or [`MedbayError::TransactionAborted`]
/// once the session block is aborted.
pub fn with_transaction_opts<T, F>(
    source: &dyn ConnectionSource,
    options: &TransactionOptions,
    callback: F,
) -> Result<T, MedbayError>
where
    F: FnOnce(&TxnHandle) -> Result<T, MedbayError>,
{
    match ambient::current() {
        Some(cx) => run_nested(&cx, options, callback),
        None => run_outermost(source, options, callback),
    }
}

/// Queue a hook to run after the outermost transaction commits.
///
/// Must be called from inside a live transaction. Hooks run FIFO in
/// registration order across all frames that survive to the commit; they
/// receive no database handle (the transaction is closed by the time they
/// run) and a hook's error is logged without affecting the committed state
/// or the remaining hooks.
///
/// # Examples
///
/// ```no_run
/// use medbay::{post_commit, with_transaction, DatabaseConfig, MedbayPool};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MedbayPool::connect(&DatabaseConfig::default())?;
/// with_transaction(&pool, |_txn| {
///     post_commit(|| {
///         println!("durably stored");
///         Ok(())
///     })
/// })?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns `Internal` (code `no-active-transaction`) when no transaction is
/// live on the current task.
pub fn post_commit<F>(hook: F) -> Result<(), MedbayError>
where
    F: FnOnce() -> Result<(), MedbayError> + Send + 'static,
{
    match ambient::current() {
        Some(cx) => {
            cx.enqueue_post_commit(Box::new(hook));
            Ok(())
        }
        None => Err(MedbayError::internal_code(
            "no-active-transaction",
            "post_commit requires a live transaction",
        )),
    }
}

/// Connection handle passed to transaction callbacks.
///
/// Statements go to the transaction's connection and fail fast with
/// [`MedbayError::TransactionAborted`] once the block is aborted. The
/// transaction lifecycle itself is owned by [`with_transaction`]; the
/// lifecycle verbs of [`MedbayExecutor`] are rejected on this handle.
pub struct TxnHandle {
    cx: Arc<TxnContext>,
}

impl TxnHandle {
    fn new(cx: Arc<TxnContext>) -> Self {
        Self { cx }
    }

    /// Correlation id of the owning transaction, stable across nesting.
    pub fn transaction_id(&self) -> Uuid {
        self.cx.id()
    }

    /// Current nesting depth (1 = outermost).
    pub fn depth(&self) -> u32 {
        self.cx.depth()
    }

    /// Whether the transaction runs at serializable isolation.
    pub fn serializable(&self) -> bool {
        self.cx.isolation().is_serializable()
    }

    /// Query exactly one row. Zero rows map to `NotFound`.
    ///
    /// # Errors
    ///
    /// See [`crate::executor::query_one`].
    pub fn query_one(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Row, MedbayError> {
        crate::executor::query_one(self, sql, params)
    }

    /// Query at most one row.
    ///
    /// # Errors
    ///
    /// See [`crate::executor::query_opt`].
    pub fn query_opt(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Row>, MedbayError> {
        crate::executor::query_opt(self, sql, params)
    }
}

impl MedbayExecutor for TxnHandle {
    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, MedbayError> {
        self.cx.run(|s| s.execute(sql, params))
    }

    fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, MedbayError> {
        self.cx.run(|s| s.query(sql, params))
    }

    fn batch_execute(&self, sql: &str) -> Result<(), MedbayError> {
        self.cx.run(|s| s.batch_execute(sql))
    }

    fn begin(&self, _isolation: IsolationLevel) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }

    fn savepoint(&self, _name: &str) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }

    fn release(&self, _name: &str) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }

    fn rollback_to(&self, _name: &str) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }

    fn commit(&self) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }

    fn rollback(&self) -> Result<(), MedbayError> {
        Err(managed_lifecycle_error())
    }
}

fn managed_lifecycle_error() -> MedbayError {
    MedbayError::internal_code(
        "managed-transaction",
        "transaction lifecycle is owned by with_transaction; nest another call instead",
    )
}

fn run_outermost<T, F>(
    source: &dyn ConnectionSource,
    options: &TransactionOptions,
    callback: F,
) -> Result<T, MedbayError>
where
    F: FnOnce(&TxnHandle) -> Result<T, MedbayError>,
{
    let session = source.checkout()?;

    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::begin_transaction_span().entered();

    session.begin(options.isolation())?;
    let started = Instant::now();
    let cx = Arc::new(TxnContext::new(session, options.isolation()));
    log::debug!(
        "transaction {} began ({:?})",
        cx.id(),
        cx.isolation()
    );

    ambient::enter(Arc::clone(&cx));
    let mut guard = UnwindGuard::outermost(Arc::clone(&cx));
    let handle = TxnHandle::new(Arc::clone(&cx));
    let result = callback(&handle);
    guard.disarm();

    let outcome = match result {
        Ok(value) => {
            if cx.is_aborted() {
                // The block is dead; a commit attempt converts to rollback.
                rollback_outermost(&cx);
                Err(MedbayError::transaction_aborted())
            } else {
                #[cfg(feature = "tracing")]
                let _span = tracing_helpers::commit_transaction_span().entered();
                match cx.session().commit() {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        log::warn!("commit of transaction {} failed: {e}", cx.id());
                        Err(e)
                    }
                }
            }
        }
        Err(e) => {
            rollback_outermost(&cx);
            Err(e)
        }
    };

    ambient::exit();

    match outcome {
        Ok(value) => {
            METRICS.record_commit(started.elapsed());
            log::debug!("transaction {} committed", cx.id());
            drain_post_commit(cx.take_post_commit());
            Ok(value)
        }
        Err(e) => {
            METRICS.record_rollback(started.elapsed());
            cx.clear_post_commit();
            Err(e)
        }
    }
}

fn run_nested<T, F>(
    cx: &Arc<TxnContext>,
    options: &TransactionOptions,
    callback: F,
) -> Result<T, MedbayError>
where
    F: FnOnce(&TxnHandle) -> Result<T, MedbayError>,
{
    if cx.is_aborted() {
        return Err(MedbayError::transaction_aborted());
    }
    if options.serializable && !cx.isolation().is_serializable() {
        return Err(MedbayError::internal_code(
            "isolation-mismatch",
            "serializable requested inside a transaction running at a weaker level",
        ));
    }

    let (name, pc_start) = cx.next_savepoint();

    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::savepoint_span(&name).entered();

    cx.run(|s| s.savepoint(&name))?;
    cx.push_frame(name.clone(), pc_start);
    log::debug!(
        "transaction {} opened savepoint {name} (depth {})",
        cx.id(),
        cx.depth()
    );

    let mut guard = UnwindGuard::nested(Arc::clone(cx), name.clone(), pc_start);
    let handle = TxnHandle::new(Arc::clone(cx));
    let result = callback(&handle);
    guard.disarm();
    if let Some(frame) = cx.pop_frame() {
        // frames are strictly LIFO; a mismatch means a frame leak
        debug_assert_eq!(frame.name, name);
        debug_assert_eq!(frame.pc_start, pc_start);
    }

    match result {
        Ok(value) => {
            if cx.is_aborted() {
                cx.truncate_post_commit(pc_start);
                attempt_rollback_to(cx, &name);
                Err(MedbayError::transaction_aborted())
            } else {
                match cx.run(|s| s.release(&name)) {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        cx.truncate_post_commit(pc_start);
                        log::warn!(
                            "release of savepoint {name} in transaction {} failed: {e}",
                            cx.id()
                        );
                        Err(e)
                    }
                }
            }
        }
        Err(e) => {
            cx.truncate_post_commit(pc_start);
            if cx.is_aborted() {
                // The engine may refuse while the block is aborted; the
                // unwind continues either way.
                attempt_rollback_to(cx, &name);
                log::warn!(
                    "savepoint {name} unwound in aborted transaction {}: {e}",
                    cx.id()
                );
                Err(MedbayError::transaction_aborted())
            } else {
                rollback_savepoint(cx, &name);
                Err(e)
            }
        }
    }
}

/// Best-effort `ROLLBACK`; the caller already holds the primary error.
fn rollback_outermost(cx: &TxnContext) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::rollback_transaction_span().entered();

    if let Err(e) = cx.session().rollback() {
        log::warn!("rollback of transaction {} failed: {e}", cx.id());
    }
}

/// Roll back and release a savepoint after a contained callback error.
/// Failures are logged, not raised, but leave the session state unknown, so
/// the context is marked aborted.
fn rollback_savepoint(cx: &TxnContext, name: &str) {
    if let Err(e) = cx.session().rollback_to(name) {
        log::warn!("rollback to savepoint {name} failed: {e}");
        cx.mark_aborted();
        return;
    }
    if let Err(e) = cx.session().release(name) {
        log::warn!("release of savepoint {name} failed: {e}");
        cx.mark_aborted();
    }
}

/// `ROLLBACK TO SAVEPOINT` on an already-aborted block; refusal is expected.
fn attempt_rollback_to(cx: &TxnContext, name: &str) {
    if let Err(e) = cx.session().rollback_to(name) {
        log::debug!("rollback to savepoint {name} refused by aborted session: {e}");
    }
}

fn drain_post_commit(hooks: Vec<PostCommitHook>) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::post_commit_span().entered();

    for (index, hook) in hooks.into_iter().enumerate() {
        if let Err(e) = hook() {
            METRICS.record_post_commit_failure();
            log::error!("post-commit hook {index} failed: {e}");
        }
    }
}

/// Rolls the open frame back if the callback unwinds (panic or coroutine
/// cancellation) instead of returning.
struct UnwindGuard {
    cx: Arc<TxnContext>,
    /// `None` for the outermost frame, savepoint name + post-commit
    /// watermark for a nested one.
    frame: Option<(String, usize)>,
    armed: bool,
}

impl UnwindGuard {
    fn outermost(cx: Arc<TxnContext>) -> Self {
        Self {
            cx,
            frame: None,
            armed: true,
        }
    }

    fn nested(cx: Arc<TxnContext>, name: String, pc_start: usize) -> Self {
        Self {
            cx,
            frame: Some((name, pc_start)),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match &self.frame {
            None => {
                log::warn!(
                    "transaction {} unwound without returning; rolling back",
                    self.cx.id()
                );
                rollback_outermost(&self.cx);
                self.cx.clear_post_commit();
                ambient::exit();
            }
            Some((name, pc_start)) => {
                self.cx.truncate_post_commit(*pc_start);
                self.cx.pop_frame();
                if let Err(e) = self.cx.session().rollback_to(name) {
                    log::warn!("rollback to savepoint {name} during unwind failed: {e}");
                    self.cx.mark_aborted();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingConn, RecordingSource};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Mutex;

    fn fixture() -> (Arc<RecordingConn>, RecordingSource) {
        let conn = Arc::new(RecordingConn::new());
        let source = RecordingSource::new(Arc::clone(&conn));
        (conn, source)
    }

    #[test]
    fn commit_flow_issues_begin_then_commit() {
        let (conn, source) = fixture();
        let value = with_transaction(&source, |txn| {
            txn.execute("INSERT INTO patient (id) VALUES ($1)", &[])?;
            Ok(42)
        })
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(
            conn.statements(),
            vec!["BEGIN", "INSERT INTO patient (id) VALUES ($1)", "COMMIT"]
        );
    }

    #[test]
    fn serializable_option_travels_with_begin() {
        let (conn, source) = fixture();
        with_transaction_opts(&source, &TransactionOptions { serializable: true }, |txn| {
            assert!(txn.serializable());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            conn.statements(),
            vec!["BEGIN; SET TRANSACTION ISOLATION LEVEL SERIALIZABLE", "COMMIT"]
        );
    }

    #[test]
    fn callback_error_rolls_back_and_resurfaces() {
        let (conn, source) = fixture();
        let err = with_transaction(&source, |txn| -> Result<(), MedbayError> {
            txn.execute("INSERT INTO patient (id) VALUES ($1)", &[])?;
            Err(MedbayError::validation_expr(
                "Invalid additional property \"foo\"",
                "Patient.foo",
            ))
        })
        .unwrap_err();

        assert!(matches!(err, MedbayError::Validation(_)));
        assert_eq!(err.issue().expression, vec!["Patient.foo"]);
        assert_eq!(
            conn.statements(),
            vec!["BEGIN", "INSERT INTO patient (id) VALUES ($1)", "ROLLBACK"]
        );
    }

    #[test]
    fn nested_commit_uses_savepoint_release() {
        let (conn, source) = fixture();
        with_transaction(&source, |txn| {
            txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
            with_transaction(&source, |inner| {
                inner.execute("INSERT INTO patient (id) VALUES ('p2')", &[])
            })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            conn.statements(),
            vec![
                "BEGIN",
                "INSERT INTO patient (id) VALUES ('p1')",
                "SAVEPOINT sp1",
                "INSERT INTO patient (id) VALUES ('p2')",
                "RELEASE SAVEPOINT sp1",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn nested_rollback_leaves_outer_alive() {
        let (conn, source) = fixture();
        with_transaction(&source, |txn| {
            txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
            let inner = with_transaction(&source, |inner| -> Result<(), MedbayError> {
                inner.execute("INSERT INTO patient (id) VALUES ('p2')", &[])?;
                Err(MedbayError::validation("bad resource"))
            });
            assert!(inner.is_err());
            txn.execute("INSERT INTO patient (id) VALUES ('p3')", &[])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(
            conn.statements(),
            vec![
                "BEGIN",
                "INSERT INTO patient (id) VALUES ('p1')",
                "SAVEPOINT sp1",
                "INSERT INTO patient (id) VALUES ('p2')",
                "ROLLBACK TO SAVEPOINT sp1",
                "RELEASE SAVEPOINT sp1",
                "INSERT INTO patient (id) VALUES ('p3')",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn savepoint_names_are_not_reused() {
        let (conn, source) = fixture();
        with_transaction(&source, |_txn| {
            let _ = with_transaction(&source, |_| -> Result<(), MedbayError> {
                Err(MedbayError::validation("first"))
            });
            with_transaction(&source, |_| Ok(()))?;
            Ok(())
        })
        .unwrap();

        let stmts = conn.statements();
        assert!(stmts.contains(&"SAVEPOINT sp1".to_string()));
        assert!(stmts.contains(&"SAVEPOINT sp2".to_string()));
    }

    #[test]
    fn deeply_nested_frames_unwind_in_order() {
        let (conn, source) = fixture();
        with_transaction(&source, |_| {
            with_transaction(&source, |inner| {
                assert_eq!(inner.depth(), 2);
                with_transaction(&source, |inner2| {
                    assert_eq!(inner2.depth(), 3);
                    Ok(())
                })
            })
        })
        .unwrap();

        assert_eq!(
            conn.statements(),
            vec![
                "BEGIN",
                "SAVEPOINT sp1",
                "SAVEPOINT sp2",
                "RELEASE SAVEPOINT sp2",
                "RELEASE SAVEPOINT sp1",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn nested_call_shares_the_outer_connection() {
        let (_, source) = fixture();
        with_transaction(&source, |_| with_transaction(&source, |_| Ok(()))).unwrap();
        assert_eq!(source.checkouts(), 1);
    }

    #[test]
    fn post_commit_runs_fifo_after_commit() {
        let (_, source) = fixture();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let o3 = Arc::clone(&order);
        with_transaction(&source, |_| {
            post_commit(move || {
                o1.lock().unwrap().push("outer-first");
                Ok(())
            })?;
            with_transaction(&source, |_| {
                post_commit(move || {
                    o2.lock().unwrap().push("inner");
                    Ok(())
                })
            })?;
            post_commit(move || {
                o3.lock().unwrap().push("outer-second");
                Ok(())
            })?;
            // nothing has run while the transaction is open
            assert!(order.lock().unwrap().is_empty());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-first", "inner", "outer-second"]
        );
    }

    #[test]
    fn post_commit_skipped_on_rollback() {
        let (_, source) = fixture();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let result: Result<(), MedbayError> = with_transaction(&source, |_| {
            post_commit(move || {
                *flag.lock().unwrap() = true;
                Ok(())
            })?;
            Err(MedbayError::validation("fail"))
        });

        assert!(result.is_err());
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn post_commit_in_rolled_back_frame_is_discarded() {
        let (_, source) = fixture();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let outer = Arc::clone(&order);
        let inner = Arc::clone(&order);
        with_transaction(&source, |_| {
            post_commit(move || {
                outer.lock().unwrap().push("outer");
                Ok(())
            })?;
            let nested: Result<(), MedbayError> = with_transaction(&source, |_| {
                post_commit(move || {
                    inner.lock().unwrap().push("inner");
                    Ok(())
                })?;
                Err(MedbayError::validation("inner fails"))
            });
            assert!(nested.is_err());
            Ok(())
        })
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer"]);
    }

    #[test]
    fn post_commit_failure_does_not_stop_later_hooks() {
        let (_, source) = fixture();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let r1 = Arc::clone(&ran);
        let r2 = Arc::clone(&ran);
        with_transaction(&source, |_| {
            post_commit(move || {
                r1.lock().unwrap().push("failing");
                Err(MedbayError::internal("hook exploded"))
            })?;
            post_commit(move || {
                r2.lock().unwrap().push("second");
                Ok(())
            })
        })
        .unwrap();

        assert_eq!(*ran.lock().unwrap(), vec!["failing", "second"]);
    }

    #[test]
    fn post_commit_outside_transaction_is_an_error() {
        let err = post_commit(|| Ok(())).unwrap_err();
        assert_eq!(err.code(), "no-active-transaction");
    }

    #[test]
    fn nested_serializable_over_weaker_outer_fails() {
        let (conn, source) = fixture();
        with_transaction(&source, |txn| {
            let err = with_transaction_opts(
                &source,
                &TransactionOptions { serializable: true },
                |_| Ok(()),
            )
            .unwrap_err();
            assert_eq!(err.code(), "isolation-mismatch");
            // the outer transaction is still usable
            txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
            Ok(())
        })
        .unwrap();

        let stmts = conn.statements();
        assert!(!stmts.iter().any(|s| s.starts_with("SAVEPOINT")));
        assert_eq!(stmts.last().unwrap(), "COMMIT");
    }

    #[test]
    fn nested_serializable_over_serializable_outer_is_ignored() {
        let (conn, source) = fixture();
        with_transaction_opts(&source, &TransactionOptions { serializable: true }, |_| {
            with_transaction_opts(
                &source,
                &TransactionOptions { serializable: true },
                |_| Ok(()),
            )
        })
        .unwrap();

        let stmts = conn.statements();
        assert!(stmts.contains(&"SAVEPOINT sp1".to_string()));
        assert_eq!(stmts.last().unwrap(), "COMMIT");
    }

    #[test]
    fn statement_failure_aborts_and_fails_fast() {
        let (conn, source) = fixture();
        let err = with_transaction(&source, |txn| -> Result<(), MedbayError> {
            conn_scripted_failure(&conn);
            let first = txn
                .query("SELECT * FROM tabledoesnotexist", &[])
                .unwrap_err();
            assert_eq!(first.code(), "missing-relation");
            // every further statement is rejected without reaching the session
            let second = txn.execute("SELECT 1", &[]).unwrap_err();
            assert!(matches!(second, MedbayError::TransactionAborted(_)));
            Err(second)
        })
        .unwrap_err();

        assert!(matches!(err, MedbayError::TransactionAborted(_)));
        let stmts = conn.statements();
        // the failed statement reached the session once; the fail-fast one did not
        assert_eq!(
            stmts
                .iter()
                .filter(|s| s.contains("tabledoesnotexist"))
                .count(),
            1
        );
        assert!(!stmts.contains(&"SELECT 1".to_string()));
        assert_eq!(stmts.last().unwrap(), "ROLLBACK");
    }

    fn conn_scripted_failure(conn: &RecordingConn) {
        conn.fail_next_matching(
            "tabledoesnotexist",
            MedbayError::internal_code("missing-relation", "relation \"tabledoesnotexist\" does not exist"),
        );
    }

    #[test]
    fn aborted_nested_frame_surfaces_transaction_aborted_to_outer() {
        let (conn, source) = fixture();
        let err = with_transaction(&source, |txn| {
            txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
            let nested = with_transaction(&source, |inner| {
                conn_scripted_failure(&conn);
                inner.query("SELECT * FROM tabledoesnotexist", &[]).map(|_| ())
            });
            // the nested call surfaces the canonical aborted-block error
            let nested_err = nested.unwrap_err();
            assert!(matches!(nested_err, MedbayError::TransactionAborted(_)));
            assert_eq!(nested_err.issue().text, crate::outcome::ABORTED_BLOCK_TEXT);
            // outer-side reads now fail fast too
            let read = txn.query("SELECT * FROM patient", &[]).unwrap_err();
            assert!(matches!(read, MedbayError::TransactionAborted(_)));
            // outer swallows everything and reports success
            Ok(())
        })
        .unwrap_err();

        // ...but the executor converts the commit into a rollback
        assert!(matches!(err, MedbayError::TransactionAborted(_)));
        let stmts = conn.statements();
        assert!(stmts.contains(&"ROLLBACK TO SAVEPOINT sp1".to_string()));
        assert!(!stmts.contains(&"COMMIT".to_string()));
        assert_eq!(stmts.last().unwrap(), "ROLLBACK");
    }

    #[test]
    fn commit_failure_surfaces_classified_error_and_drops_hooks() {
        let (conn, source) = fixture();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        conn.fail_next_matching(
            "COMMIT",
            MedbayError::serialization_conflict("could not serialize access"),
        );

        let err = with_transaction_opts(&source, &TransactionOptions { serializable: true }, |_| {
            post_commit(move || {
                *flag.lock().unwrap() = true;
                Ok(())
            })
        })
        .unwrap_err();

        assert!(matches!(err, MedbayError::SerializationConflict(_)));
        assert!(err.is_retryable());
        assert!(!*ran.lock().unwrap());
        // no explicit ROLLBACK after a failed COMMIT
        assert!(!conn.statements().contains(&"ROLLBACK".to_string()));
    }

    #[test]
    fn rollback_failure_is_swallowed_in_favor_of_the_primary_error() {
        let (conn, source) = fixture();
        conn.fail_next_matching("ROLLBACK", MedbayError::connection_lost("socket closed"));

        let err = with_transaction(&source, |_| -> Result<(), MedbayError> {
            Err(MedbayError::validation("primary"))
        })
        .unwrap_err();

        assert!(matches!(err, MedbayError::Validation(_)));
        assert_eq!(err.issue().text, "primary");
    }

    #[test]
    fn panic_in_callback_rolls_back_and_clears_ambient() {
        let (conn, source) = fixture();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = with_transaction(&source, |txn| -> Result<(), MedbayError> {
                txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
                panic!("cancelled");
            });
        }));
        assert!(result.is_err());
        assert_eq!(conn.statements().last().unwrap(), "ROLLBACK");

        // the ambient store is clean: a new transaction starts from BEGIN
        with_transaction(&source, |_| Ok(())).unwrap();
        let stmts = conn.statements();
        assert_eq!(stmts[stmts.len() - 2], "BEGIN");
        assert_eq!(stmts.last().unwrap(), "COMMIT");
    }

    #[test]
    fn lifecycle_verbs_are_rejected_on_the_handle() {
        let (_, source) = fixture();
        with_transaction(&source, |txn| {
            assert_eq!(txn.commit().unwrap_err().code(), "managed-transaction");
            assert_eq!(txn.rollback().unwrap_err().code(), "managed-transaction");
            assert_eq!(
                txn.begin(IsolationLevel::Serializable).unwrap_err().code(),
                "managed-transaction"
            );
            assert_eq!(txn.savepoint("x").unwrap_err().code(), "managed-transaction");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn query_one_miss_does_not_abort_the_transaction() {
        let (conn, source) = fixture();
        with_transaction(&source, |txn| {
            let err = txn
                .query_one("SELECT * FROM patient WHERE id = $1", &[])
                .unwrap_err();
            assert!(matches!(err, MedbayError::NotFound(_)));
            // the transaction is still healthy
            txn.execute("INSERT INTO patient (id) VALUES ('p1')", &[])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(conn.statements().last().unwrap(), "COMMIT");
    }

    #[test]
    fn transaction_id_is_stable_across_nesting() {
        let (_, source) = fixture();
        with_transaction(&source, |outer| {
            let outer_id = outer.transaction_id();
            with_transaction(&source, |inner| {
                assert_eq!(inner.transaction_id(), outer_id);
                Ok(())
            })
        })
        .unwrap();
    }
}
