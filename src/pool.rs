//! Persistent connection pool.
//!
//! `MedbayPool` holds a fixed set of `may_postgres` connections in a bounded
//! channel. A checkout pops a slot (waiting up to the configured timeout)
//! and hands back a [`PooledConn`] guard; dropping the guard returns the
//! connection. A connection that comes back with an open transaction is
//! rolled back before reuse, and discarded if even that fails.
//!
//! [`ConnectionSource`] is the seam the transaction executor checks
//! connections out through, so tests can substitute a recording double.

use crate::config::DatabaseConfig;
use crate::connection::{self, ConnectionError};
use crate::executor::MedbayExecutor;
use crate::isolation::IsolationLevel;
use crate::metrics::METRICS;
use crate::outcome::MedbayError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use may_postgres::types::ToSql;
use may_postgres::{Client, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Something the transaction executor can check a connection out of.
///
/// The returned executor is exclusively owned by the caller until every
/// clone of the `Arc` is dropped; the pool relies on that exclusivity for
/// transaction-per-connection safety.
pub trait ConnectionSource {
    /// Check out a connection.
    ///
    /// # Errors
    ///
    /// Returns `Internal` (code `pool-timeout`) when no slot frees up in
    /// time, or `ConnectionLost` when the source is shut down.
    fn checkout(&self) -> Result<Arc<dyn MedbayExecutor>, MedbayError>;
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured number of slots.
    pub size: usize,
    /// Slots currently idle.
    pub idle: usize,
}

/// Fixed-size pool of persistent PostgreSQL connections.
pub struct MedbayPool {
    idle: Receiver<Client>,
    returns: Sender<Client>,
    size: usize,
    checkout_timeout: Duration,
}

impl MedbayPool {
    /// Open `max_connections` connections up front.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure; no partial pool is handed out.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        let size = config.max_connections.max(1);
        let (returns, idle) = bounded(size);
        for _ in 0..size {
            let client = connection::connect(&config.url)?;
            // cannot fail: we hold the receiver and sized the channel
            let _ = returns.send(client);
        }
        METRICS.set_pool_size(size as u64);
        log::info!("connection pool ready with {size} slots");
        Ok(Self {
            idle,
            returns,
            size,
            checkout_timeout: Duration::from_secs(config.pool_timeout_seconds),
        })
    }

    /// Check out a connection, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `Internal` (code `pool-timeout`) if every slot stays busy, or
    /// `ConnectionLost` if the pool has been torn down.
    pub fn checkout(&self) -> Result<PooledConn, MedbayError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::checkout_connection_span().entered();

        let start = Instant::now();
        let client = self.idle.recv_timeout(self.checkout_timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => MedbayError::internal_code(
                "pool-timeout",
                format!(
                    "no pooled connection became available within {}s",
                    self.checkout_timeout.as_secs()
                ),
            ),
            RecvTimeoutError::Disconnected => {
                MedbayError::connection_lost("connection pool is shut down")
            }
        })?;
        METRICS.record_connection_wait(start.elapsed());
        Ok(PooledConn {
            client: Some(client),
            returns: self.returns.clone(),
            in_transaction: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size,
            idle: self.idle.len(),
        }
    }

    /// Run `callback` inside a transaction on a pooled connection.
    ///
    /// Convenience for [`crate::transaction::with_transaction`].
    ///
    /// # Errors
    ///
    /// See [`crate::transaction::with_transaction_opts`].
    pub fn with_transaction<T, F>(&self, callback: F) -> Result<T, MedbayError>
    where
        F: FnOnce(&crate::transaction::TxnHandle) -> Result<T, MedbayError>,
    {
        crate::transaction::with_transaction(self, callback)
    }

    /// Run `callback` inside a transaction with explicit options.
    ///
    /// # Errors
    ///
    /// See [`crate::transaction::with_transaction_opts`].
    pub fn with_transaction_opts<T, F>(
        &self,
        options: &crate::transaction::TransactionOptions,
        callback: F,
    ) -> Result<T, MedbayError>
    where
        F: FnOnce(&crate::transaction::TxnHandle) -> Result<T, MedbayError>,
    {
        crate::transaction::with_transaction_opts(self, options, callback)
    }

    #[cfg(test)]
    fn empty_for_test(checkout_timeout: Duration) -> Self {
        let (returns, idle) = bounded(1);
        Self {
            idle,
            returns,
            size: 0,
            checkout_timeout,
        }
    }
}

impl ConnectionSource for MedbayPool {
    fn checkout(&self) -> Result<Arc<dyn MedbayExecutor>, MedbayError> {
        Ok(Arc::new(MedbayPool::checkout(self)?))
    }
}

/// A checked-out connection.
///
/// Tracks whether a transaction is open on the session so the pool never
/// reuses a dirty connection.
pub struct PooledConn {
    client: Option<Client>,
    returns: Sender<Client>,
    in_transaction: AtomicBool,
}

impl PooledConn {
    fn client(&self) -> Result<&Client, MedbayError> {
        self.client
            .as_ref()
            .ok_or_else(|| MedbayError::internal("connection already returned to pool"))
    }

    /// Whether a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Relaxed)
    }

    /// Probe the underlying session with `SELECT 1`.
    pub fn is_healthy(&self) -> bool {
        match &self.client {
            Some(client) => connection::check_connection_health(client),
            None => false,
        }
    }
}

impl MedbayExecutor for PooledConn {
    fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64, MedbayError> {
        MedbayExecutor::execute(self.client()?, sql, params)
    }

    fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, MedbayError> {
        MedbayExecutor::query(self.client()?, sql, params)
    }

    fn batch_execute(&self, sql: &str) -> Result<(), MedbayError> {
        MedbayExecutor::batch_execute(self.client()?, sql)
    }

    fn begin(&self, isolation: IsolationLevel) -> Result<(), MedbayError> {
        MedbayExecutor::batch_execute(self.client()?, isolation.begin_sql())?;
        self.in_transaction.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&self) -> Result<(), MedbayError> {
        MedbayExecutor::batch_execute(self.client()?, "COMMIT")?;
        self.in_transaction.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self) -> Result<(), MedbayError> {
        MedbayExecutor::batch_execute(self.client()?, "ROLLBACK")?;
        self.in_transaction.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        if self.in_transaction.load(Ordering::Relaxed) {
            log::warn!("connection returned to pool with an open transaction; rolling back");
            if let Err(e) = MedbayExecutor::rollback(&client) {
                // Session state is unknown; shrink the pool rather than
                // hand the connection to the next transaction.
                log::error!("discarding connection after failed rollback: {e}");
                return;
            }
        }
        // Send fails only when the pool itself is gone.
        let _ = self.returns.send(client);
    }
}
