//! Background expiry of PENDING reservations whose hold ran out.
//!
//! The sweep only finds candidates; each one is expired through
//! [`ReservationMachine::expire`], so a sweep racing `pay`, another sweep or
//! a lazy expiry on read can never release the same units twice.

use crate::machine::{ExpireOutcome, ReservationMachine};
use groupbuy_core::environment::Clock;
use groupbuy_core::error::EngineError;
use groupbuy_runtime::Shutdown;
use groupbuy_runtime::metrics::SweeperMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Candidates found
    pub scanned: usize,
    /// Expired by this sweep
    pub expired: usize,
    /// Already moved on by a concurrent pay, cancel or expiry
    pub raced: usize,
    /// Failed; retried on the next sweep
    pub failed: usize,
}

/// Periodic expiry scan.
pub struct ExpirySweeper {
    machine: Arc<ReservationMachine>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
}

impl ExpirySweeper {
    /// Sweep at most `batch_limit` reservations per run.
    #[must_use]
    pub fn new(machine: Arc<ReservationMachine>, clock: Arc<dyn Clock>, batch_limit: usize) -> Self {
        Self {
            machine,
            clock,
            batch_limit,
        }
    }

    /// Expire every due PENDING reservation found, up to the batch limit.
    ///
    /// Per-reservation failures are logged and counted; they do not stop
    /// the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the candidate scan itself fails.
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let started = Instant::now();
        let candidates = self
            .machine
            .store()
            .list_expired_pending(self.clock.now(), self.batch_limit)
            .await?;

        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };
        for reservation in candidates {
            match self.machine.expire(reservation.id).await {
                Ok(ExpireOutcome::Expired(_)) => report.expired += 1,
                Ok(ExpireOutcome::Skipped { status }) => {
                    report.raced += 1;
                    debug!(reservation_id = %reservation.id, %status, "Reservation left PENDING before sweep");
                }
                Ok(ExpireOutcome::NotDue { expires_at }) => {
                    report.raced += 1;
                    debug!(reservation_id = %reservation.id, %expires_at, "Reservation not due");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        reservation_id = %reservation.id,
                        offer_id = %reservation.offer_id,
                        error = %err,
                        "Failed to expire reservation"
                    );
                }
            }
        }

        SweeperMetrics::record_run(report.expired, report.raced, report.failed, started.elapsed());
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                raced = report.raced,
                failed = report.failed,
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: &mut Shutdown, interval: Duration) {
        shutdown.spawn_periodic("expiry-sweeper", interval, move || {
            let sweeper = Arc::clone(&self);
            async move {
                if let Err(e) = sweeper.sweep_once().await {
                    error!(error = %e, "Expiry sweep failed");
                }
            }
        });
    }
}
