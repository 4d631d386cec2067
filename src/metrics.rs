//! Prometheus metrics and tracing spans.
//!
//! Observability is feature-gated:
//! - `metrics`: Prometheus metrics via the OpenTelemetry exporter
//! - `tracing`: spans around connection, query and transaction lifecycle
//!
//! Exposed metrics:
//! - `medbay_pool_size` (gauge): configured pool size
//! - `medbay_connection_wait_time_seconds` (histogram): time spent waiting for a slot
//! - `medbay_query_duration_seconds` (histogram): statement execution time
//! - `medbay_query_errors_total` (counter): failed statements
//! - `medbay_transactions_committed_total` (counter): outermost commits
//! - `medbay_transactions_rolled_back_total` (counter): outermost rollbacks
//! - `medbay_transaction_duration_seconds` (histogram): outermost transaction wall time
//! - `medbay_post_commit_failures_total` (counter): failed post-commit hooks

#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
};
#[cfg(feature = "metrics")]
use opentelemetry_prometheus::PrometheusExporter;
#[cfg(feature = "metrics")]
use std::sync::LazyLock;

#[cfg(feature = "metrics")]
pub struct MedbayMetrics {
    /// Prometheus exporter for scraping.
    pub exporter: PrometheusExporter,
    pub pool_size: Gauge<u64>,
    pub connection_wait_time: Histogram<f64>,
    pub query_duration: Histogram<f64>,
    pub query_errors: Counter<u64>,
    pub transactions_committed: Counter<u64>,
    pub transactions_rolled_back: Counter<u64>,
    pub transaction_duration: Histogram<f64>,
    pub post_commit_failures: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl MedbayMetrics {
    /// Build all instruments and the exporter.
    ///
    /// # Panics
    ///
    /// Panics if the Prometheus exporter cannot be constructed; metrics
    /// initialization failure is a startup error the application should see
    /// immediately.
    #[must_use]
    pub fn init() -> Self {
        #[allow(clippy::expect_used)]
        let exporter = opentelemetry_prometheus::exporter()
            .build()
            .expect("failed to build prometheus exporter");
        let meter = global::meter("medbay");

        let pool_size = meter
            .u64_gauge("medbay_pool_size")
            .with_description("Configured pool size")
            .build();

        let connection_wait_time = meter
            .f64_histogram("medbay_connection_wait_time_seconds")
            .with_description("Time waiting for a pooled connection")
            .build();

        let query_duration = meter
            .f64_histogram("medbay_query_duration_seconds")
            .with_description("Statement execution time")
            .build();

        let query_errors = meter
            .u64_counter("medbay_query_errors_total")
            .with_description("Failed statements")
            .build();

        let transactions_committed = meter
            .u64_counter("medbay_transactions_committed_total")
            .with_description("Outermost transactions committed")
            .build();

        let transactions_rolled_back = meter
            .u64_counter("medbay_transactions_rolled_back_total")
            .with_description("Outermost transactions rolled back")
            .build();

        let transaction_duration = meter
            .f64_histogram("medbay_transaction_duration_seconds")
            .with_description("Outermost transaction wall time")
            .build();

        let post_commit_failures = meter
            .u64_counter("medbay_post_commit_failures_total")
            .with_description("Post-commit hooks that returned an error")
            .build();

        Self {
            exporter,
            pool_size,
            connection_wait_time,
            query_duration,
            query_errors,
            transactions_committed,
            transactions_rolled_back,
            transaction_duration,
            post_commit_failures,
        }
    }

    pub fn record_query_duration(&self, duration: std::time::Duration) {
        self.query_duration.record(duration.as_secs_f64(), &[]);
    }

    pub fn record_query_error(&self) {
        self.query_errors.add(1, &[]);
    }

    pub fn record_connection_wait(&self, duration: std::time::Duration) {
        self.connection_wait_time.record(duration.as_secs_f64(), &[]);
    }

    pub fn set_pool_size(&self, size: u64) {
        self.pool_size.record(size, &[]);
    }

    pub fn record_commit(&self, duration: std::time::Duration) {
        self.transactions_committed.add(1, &[]);
        self.transaction_duration.record(duration.as_secs_f64(), &[]);
    }

    pub fn record_rollback(&self, duration: std::time::Duration) {
        self.transactions_rolled_back.add(1, &[]);
        self.transaction_duration.record(duration.as_secs_f64(), &[]);
    }

    pub fn record_post_commit_failure(&self) {
        self.post_commit_failures.add(1, &[]);
    }
}

#[cfg(feature = "metrics")]
pub static METRICS: LazyLock<MedbayMetrics> = LazyLock::new(MedbayMetrics::init);

/// No-op metrics implementation when the `metrics` feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct MedbayMetrics;

#[cfg(not(feature = "metrics"))]
impl MedbayMetrics {
    pub fn init() -> Self {
        Self
    }

    pub fn record_query_duration(&self, _duration: std::time::Duration) {}
    pub fn record_query_error(&self) {}
    pub fn record_connection_wait(&self, _duration: std::time::Duration) {}
    pub fn set_pool_size(&self, _size: u64) {}
    pub fn record_commit(&self, _duration: std::time::Duration) {}
    pub fn record_rollback(&self, _duration: std::time::Duration) {}
    pub fn record_post_commit_failure(&self) {}
}

#[cfg(not(feature = "metrics"))]
pub static METRICS: MedbayMetrics = MedbayMetrics;

/// Tracing helpers for connection and transaction lifecycle
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::Span;

    pub fn checkout_connection_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.checkout_connection")
    }

    pub fn execute_query_span(query: &str) -> Span {
        tracing::span!(
            tracing::Level::INFO,
            "medbay.execute_query",
            query = %query
        )
    }

    pub fn begin_transaction_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.begin_transaction")
    }

    pub fn savepoint_span(name: &str) -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.savepoint", name = %name)
    }

    pub fn commit_transaction_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.commit_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.rollback_transaction")
    }

    pub fn post_commit_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.post_commit")
    }

    pub fn health_check_span() -> Span {
        tracing::span!(tracing::Level::INFO, "medbay.health_check")
    }
}

/// No-op tracing helpers when the `tracing` feature is disabled
#[cfg(not(feature = "tracing"))]
pub mod tracing_helpers {
    pub fn checkout_connection_span() {}
    pub fn execute_query_span(_query: &str) {}
    pub fn begin_transaction_span() {}
    pub fn savepoint_span(_name: &str) {}
    pub fn commit_transaction_span() {}
    pub fn rollback_transaction_span() {}
    pub fn post_commit_span() {}
    pub fn health_check_span() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_record_without_panicking() {
        let metrics = MedbayMetrics::init();
        metrics.record_query_duration(std::time::Duration::from_millis(5));
        metrics.record_query_error();
        metrics.record_connection_wait(std::time::Duration::from_millis(1));
        metrics.set_pool_size(4);
        metrics.record_commit(std::time::Duration::from_millis(12));
        metrics.record_rollback(std::time::Duration::from_millis(3));
        metrics.record_post_commit_failure();
    }

    #[test]
    #[cfg(feature = "tracing")]
    fn tracing_spans_build() {
        let _s1 = tracing_helpers::begin_transaction_span();
        let _s2 = tracing_helpers::savepoint_span("sp1");
        let _s3 = tracing_helpers::commit_transaction_span();
    }
}
