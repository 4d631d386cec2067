//! Structured operation outcomes.
//!
//! Every error surfaced by this crate carries an [`Issue`]: a severity, a
//! short machine-readable code, a human-readable text and optional path
//! expressions identifying the offending fields. The repository layer above
//! embeds issues directly into its wire responses, so they are serde-
//! serializable.

use serde::Serialize;
use std::fmt;

/// Severity of an [`Issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The session or process cannot continue.
    Fatal,
    /// The operation failed.
    Error,
    /// The operation succeeded with caveats.
    Warning,
    /// Informational only.
    Information,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "information",
        };
        f.write_str(s)
    }
}

/// A single structured outcome entry.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    /// How bad it is.
    pub severity: Severity,
    /// Short machine code, e.g. `invalid`, `unique-conflict`, `tx-aborted`.
    pub code: String,
    /// Human-readable description.
    pub text: String,
    /// Path expressions for the offending fields, e.g. `Patient.foo`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expression: Vec<String>,
}

impl Issue {
    pub fn new(severity: Severity, code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            text: text.into(),
            expression: Vec::new(),
        }
    }

    /// Attach a path expression to the issue.
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression.push(expression.into());
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.severity, self.code, self.text)?;
        if !self.expression.is_empty() {
            write!(f, " ({})", self.expression.join(", "))?;
        }
        Ok(())
    }
}

/// Canonical PostgreSQL message for a statement rejected inside an aborted
/// transaction block. Reused for fail-fast errors so callers see the same
/// text whether the rejection came from the engine or from this crate.
pub const ABORTED_BLOCK_TEXT: &str =
    "current transaction is aborted, commands ignored until end of transaction block";

/// Error taxonomy surfaced to the repository layer.
///
/// Each variant wraps an [`Issue`]; the variant tells callers how to react
/// (retry, surface to the client, treat as connectivity loss), the issue
/// tells them what to say.
#[derive(Debug, Clone)]
pub enum MedbayError {
    /// The input is structurally invalid (includes foreign-key and check
    /// violations classified from the engine).
    Validation(Issue),
    /// The requested row does not exist.
    NotFound(Issue),
    /// A unique constraint rejected the write.
    UniqueConflict(Issue),
    /// The engine detected a serialization conflict; retryable at the
    /// caller's discretion.
    SerializationConflict(Issue),
    /// The transaction block is aborted; only rollback is possible.
    TransactionAborted(Issue),
    /// The database connection is gone.
    ConnectionLost(Issue),
    /// Anything else, including programming errors.
    Internal(Issue),
}

impl MedbayError {
    pub fn validation(text: impl Into<String>) -> Self {
        MedbayError::Validation(Issue::new(Severity::Error, "invalid", text))
    }

    /// Validation error pointing at a specific field path.
    pub fn validation_expr(text: impl Into<String>, expression: impl Into<String>) -> Self {
        MedbayError::Validation(
            Issue::new(Severity::Error, "invalid", text).with_expression(expression),
        )
    }

    pub fn not_found(text: impl Into<String>) -> Self {
        MedbayError::NotFound(Issue::new(Severity::Error, "not-found", text))
    }

    pub fn unique_conflict(text: impl Into<String>) -> Self {
        MedbayError::UniqueConflict(Issue::new(Severity::Error, "unique-conflict", text))
    }

    pub fn serialization_conflict(text: impl Into<String>) -> Self {
        MedbayError::SerializationConflict(Issue::new(
            Severity::Error,
            "serialization-conflict",
            text,
        ))
    }

    /// The canonical aborted-block error.
    pub fn transaction_aborted() -> Self {
        MedbayError::TransactionAborted(Issue::new(
            Severity::Error,
            "tx-aborted",
            ABORTED_BLOCK_TEXT,
        ))
    }

    pub fn connection_lost(text: impl Into<String>) -> Self {
        MedbayError::ConnectionLost(Issue::new(Severity::Fatal, "connection-lost", text))
    }

    pub fn internal(text: impl Into<String>) -> Self {
        MedbayError::Internal(Issue::new(Severity::Error, "internal", text))
    }

    /// Internal error with a specific machine code.
    pub fn internal_code(code: &str, text: impl Into<String>) -> Self {
        MedbayError::Internal(Issue::new(Severity::Error, code, text))
    }

    /// The structured outcome carried by this error.
    pub fn issue(&self) -> &Issue {
        match self {
            MedbayError::Validation(i)
            | MedbayError::NotFound(i)
            | MedbayError::UniqueConflict(i)
            | MedbayError::SerializationConflict(i)
            | MedbayError::TransactionAborted(i)
            | MedbayError::ConnectionLost(i)
            | MedbayError::Internal(i) => i,
        }
    }

    pub fn code(&self) -> &str {
        &self.issue().code
    }

    pub fn severity(&self) -> Severity {
        self.issue().severity
    }

    /// Whether the caller may reasonably retry the whole transaction.
    /// Retry policy itself belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MedbayError::SerializationConflict(_))
    }
}

impl fmt::Display for MedbayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MedbayError::Validation(i) => write!(f, "validation error: {}", i),
            MedbayError::NotFound(i) => write!(f, "not found: {}", i),
            MedbayError::UniqueConflict(i) => write!(f, "unique conflict: {}", i),
            MedbayError::SerializationConflict(i) => write!(f, "serialization conflict: {}", i),
            MedbayError::TransactionAborted(i) => write!(f, "transaction aborted: {}", i),
            MedbayError::ConnectionLost(i) => write!(f, "connection lost: {}", i),
            MedbayError::Internal(i) => write!(f, "internal error: {}", i),
        }
    }
}

impl std::error::Error for MedbayError {}
