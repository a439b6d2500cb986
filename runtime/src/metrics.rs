//! Prometheus metrics for the reservation engine.
//!
//! Covers:
//! - Reservation lifecycle transitions and rejections
//! - Expiry sweeps
//! - Settlement payouts
//! - Store commits
//! - Retries of lost races
//!
//! # Example
//!
//! ```rust,no_run
//! use groupbuy_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Exporter setup failures.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The Prometheus exporter could not be configured
    #[error("metrics exporter misconfigured: {0}")]
    Build(String),
    /// Another global recorder refused to be replaced
    #[error("metrics recorder could not be installed: {0}")]
    Install(String),
}

/// Latency buckets shared by every `*_duration_seconds` histogram.
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Scrape endpoint for the worker process.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Serve on `addr` once [`start`](Self::start) is called.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and serve `/metrics` on a background task.
    ///
    /// Needs a running Tokio runtime. When some other recorder is already
    /// installed (tests, a second worker in-process) the call is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".into()), DURATION_BUCKETS)
            .and_then(|builder| builder.with_http_listener(self.addr).build())
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        // Failing here means some recorder is already installed.
        if let Err(e) = metrics::set_global_recorder(recorder) {
            if self.handle.is_none() {
                tracing::warn!(addr = %self.addr, "Metrics recorder already installed, not serving");
                return Ok(());
            }
            return Err(MetricsError::Install(e.to_string()));
        }

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics endpoint stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(%addr, "Serving metrics at /metrics");
        Ok(())
    }

    /// Current metrics in the Prometheus text format, once started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Reservations
    describe_counter!(
        "reservations_created_total",
        "Reservations created"
    );
    describe_counter!(
        "reservations_rejected_total",
        "Reservation operations rejected, labelled by operation and reason code"
    );
    describe_counter!(
        "reservations_transitions_total",
        "Reservation state transitions, labelled by target status"
    );
    describe_counter!(
        "reservations_refunded_units_total",
        "Units refunded"
    );
    describe_counter!(
        "reservations_idempotent_replays_total",
        "Requests answered from a stored idempotency record"
    );

    // Sweeper
    describe_counter!(
        "sweeper_runs_total",
        "Expiry sweeps executed"
    );
    describe_counter!(
        "sweeper_expired_total",
        "Reservations expired by the sweeper"
    );
    describe_counter!(
        "sweeper_raced_total",
        "Sweeper candidates already moved on by a concurrent transition"
    );
    describe_counter!(
        "sweeper_failures_total",
        "Sweeper items that failed"
    );
    describe_histogram!(
        "sweeper_run_duration_seconds",
        "Time taken by one expiry sweep"
    );

    // Settlements
    describe_counter!(
        "settlements_approved_total",
        "Settlements approved"
    );
    describe_counter!(
        "settlements_paid_total",
        "Settlements paid out"
    );
    describe_counter!(
        "settlements_skipped_total",
        "Approved settlements skipped because their payout time is in the future"
    );
    describe_counter!(
        "settlement_batches_total",
        "Payout batches completed"
    );

    // Store
    describe_histogram!(
        "store_commit_duration_seconds",
        "Time taken to apply one atomic commit"
    );
    describe_counter!(
        "store_commit_conflicts_total",
        "Commits rejected by optimistic concurrency checks"
    );

    // Retry
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after retrying"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their retry budget"
    );
}

/// Reservation lifecycle metrics recorder.
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// Record a reservation creation.
    pub fn record_created(qty: u32) {
        counter!("reservations_created_total").increment(1);
        histogram!("reservations_created_qty").record(f64::from(qty));
    }

    /// Record a transition into `status`.
    pub fn record_transition(status: &'static str) {
        counter!("reservations_transitions_total", "status" => status).increment(1);
    }

    /// Record a rejected operation.
    pub fn record_rejected(operation: &'static str, code: &'static str) {
        counter!("reservations_rejected_total", "operation" => operation, "code" => code)
            .increment(1);
    }

    /// Record refunded units.
    pub fn record_refund(units: u32) {
        counter!("reservations_refunded_units_total").increment(u64::from(units));
    }

    /// Record a replay answered from an idempotency record.
    pub fn record_replay(operation: &'static str) {
        counter!("reservations_idempotent_replays_total", "operation" => operation).increment(1);
    }
}

/// Expiry sweeper metrics recorder.
pub struct SweeperMetrics;

impl SweeperMetrics {
    /// Record one sweep.
    pub fn record_run(expired: usize, raced: usize, failed: usize, duration: Duration) {
        counter!("sweeper_runs_total").increment(1);
        counter!("sweeper_expired_total").increment(expired as u64);
        counter!("sweeper_raced_total").increment(raced as u64);
        counter!("sweeper_failures_total").increment(failed as u64);
        histogram!("sweeper_run_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Settlement metrics recorder.
pub struct SettlementMetrics;

impl SettlementMetrics {
    /// Record an approval.
    pub fn record_approved() {
        counter!("settlements_approved_total").increment(1);
    }

    /// Record a completed payout batch.
    pub fn record_batch(paid: usize, skipped: usize) {
        counter!("settlement_batches_total").increment(1);
        counter!("settlements_paid_total").increment(paid as u64);
        counter!("settlements_skipped_total").increment(skipped as u64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt(operation: &'static str) {
        counter!("retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record a success after retrying.
    pub fn record_success(operation: &'static str) {
        counter!("retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record an exhausted retry budget.
    pub fn record_exhausted(operation: &'static str) {
        counter!("retry_exhausted_total", "operation" => operation).increment(1);
    }
}
