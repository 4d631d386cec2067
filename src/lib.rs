//! # Medbay
//!
//! Coroutine-native transactional storage core for PostgreSQL-backed
//! resource repositories, built on Rust's `may` runtime.
//!
//! The heart of the crate is [`with_transaction`]: run a closure under a
//! logical transaction that may be nested arbitrarily. The outermost call
//! owns a pooled connection and the physical `BEGIN`/`COMMIT`; nested calls
//! on the same task are emulated with savepoints on the same connection, so
//! an inner failure can be contained without losing the outer work.
//! [`post_commit`] queues side effects that run only once the outermost
//! transaction durably commits.
//!
//! - **may_postgres**: coroutine-native PostgreSQL client (foundation)
//! - **MedbayExecutor**: database execution abstraction
//! - **MedbayPool**: persistent connection pool
//! - **with_transaction / post_commit**: nested transaction executor
//! - **MedbayError / Issue**: structured outcome taxonomy

pub mod config;

// Connection establishment and validation
pub mod connection;

// Database execution abstraction
pub mod executor;

// Isolation levels and engine error classification
pub mod isolation;

pub mod metrics;

// Structured outcomes and the error taxonomy
pub mod outcome;

// Persistent connection pool
pub mod pool;

// Nested transaction executor
pub mod transaction;

// Test doubles, also available to downstream tests via `test-helpers`
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

// Re-export configuration types for convenience
pub use config::DatabaseConfig;

// Re-export connection types for convenience
pub use connection::{check_connection_health, connect, validate_connection_string, ConnectionError};

// Re-export executor types for convenience
pub use executor::{query_one, query_opt, MedbayExecutor};

pub use isolation::IsolationLevel;

pub use outcome::{Issue, MedbayError, Severity};

pub use pool::{ConnectionSource, MedbayPool, PoolStatus, PooledConn};

// Re-export the transaction API for convenience
pub use transaction::{
    post_commit, with_transaction, with_transaction_opts, TransactionOptions, TxnHandle,
};
