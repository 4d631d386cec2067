//! Isolation levels and engine error classification.
//!
//! This is the adapter between the PostgreSQL session and the crate's error
//! taxonomy: it renders the requested isolation level into session SQL and
//! sorts driver errors (by SQLSTATE) into the [`MedbayError`] variants the
//! repository layer acts on.

use crate::outcome::MedbayError;
use may_postgres::error::SqlState;
use may_postgres::Error as PgError;

/// Transaction isolation level requested by a caller.
///
/// PostgreSQL's default is read committed; serializable is the opt-in for
/// conflict detection on read-then-write races.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Engine default.
    ReadCommitted,
    /// Snapshot isolation with serializability checks at commit.
    Serializable,
}

impl IsolationLevel {
    /// The statement batch that opens a transaction at this level.
    ///
    /// The level is attached in the same batch as `BEGIN` so no other
    /// statement can slip in between.
    pub fn begin_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "BEGIN",
            IsolationLevel::Serializable => {
                "BEGIN; SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
            }
        }
    }

    pub fn is_serializable(self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

/// Classify a driver error into the crate taxonomy.
///
/// Connectivity loss is checked first: a closed connection reports no
/// SQLSTATE. Anything with a SQLSTATE goes through [`classify_sqlstate`];
/// driver-internal errors without one (protocol violations, row decode
/// failures) surface as `Internal`.
pub(crate) fn classify(err: &PgError) -> MedbayError {
    if err.is_closed() {
        return MedbayError::connection_lost(err.to_string());
    }
    match err.code() {
        Some(code) => classify_sqlstate(code, &err.to_string()),
        None => MedbayError::internal_code("db-error", err.to_string()),
    }
}

/// SQLSTATE-to-taxonomy mapping, split out so it can be exercised without a
/// live driver error.
pub(crate) fn classify_sqlstate(code: &SqlState, message: &str) -> MedbayError {
    if *code == SqlState::T_R_SERIALIZATION_FAILURE {
        MedbayError::serialization_conflict(message.to_string())
    } else if *code == SqlState::UNIQUE_VIOLATION {
        MedbayError::unique_conflict(message.to_string())
    } else if *code == SqlState::FOREIGN_KEY_VIOLATION
        || *code == SqlState::CHECK_VIOLATION
        || *code == SqlState::NOT_NULL_VIOLATION
    {
        MedbayError::Validation(crate::outcome::Issue::new(
            crate::outcome::Severity::Error,
            "constraint",
            message.to_string(),
        ))
    } else if *code == SqlState::IN_FAILED_SQL_TRANSACTION {
        // The session already rejected the statement; surface the canonical
        // aborted-block error rather than a per-statement message.
        MedbayError::transaction_aborted()
    } else if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::UNDEFINED_COLUMN {
        MedbayError::internal_code("missing-relation", message.to_string())
    } else if *code == SqlState::CONNECTION_EXCEPTION
        || *code == SqlState::CONNECTION_FAILURE
        || *code == SqlState::CONNECTION_DOES_NOT_EXIST
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
    {
        MedbayError::connection_lost(message.to_string())
    } else {
        MedbayError::internal_code("db-error", message.to_string())
    }
}
