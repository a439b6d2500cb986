//! Seller settlement approval and batched payout.
//!
//! A settlement opens READY when the buyer confirms arrival. An operator
//! approves it, and [`SettlementBatcher::bulk_mark_paid`] pays approved
//! settlements whose `scheduled_payout_at` has passed. Each batch is
//! bracketed by `paid_batch:{id}:start` and `paid_batch:{id}:end` events;
//! every settlement it pays gets its own `settlement:{id}:paid` event tagged
//! with the batch id. Because those keys are unique, replaying a batch id
//! resumes or returns the earlier result instead of paying twice.

use groupbuy_core::environment::Clock;
use groupbuy_core::error::{ConflictCode, EngineError, StoreError};
use groupbuy_core::store::{Commit, EventQuery, ReservationStore, SettlementWrite};
use groupbuy_core::types::{
    Actor, BLOCK_REASON_FULLY_REFUNDED, EventLog, EventType, ReservationSettlement, SettlementId,
    SettlementStatus,
};
use groupbuy_runtime::metrics::SettlementMetrics;
use groupbuy_runtime::{RetryPolicy, Shutdown, retry_with_predicate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a payout batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidBatch {
    /// Batch id
    pub batch_id: String,
    /// Settlements paid under this batch id
    pub paid_count: usize,
    /// Their ids, in payment order
    pub paid_ids: Vec<SettlementId>,
    /// Approved settlements scanned but not yet due
    pub skipped: usize,
    /// The end event has been written
    pub completed: bool,
}

/// Settlement approval and payout.
pub struct SettlementBatcher {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

fn start_key(batch_id: &str) -> String {
    format!("paid_batch:{batch_id}:start")
}

fn end_key(batch_id: &str) -> String {
    format!("paid_batch:{batch_id}:end")
}

fn require_operator(actor: &Actor, action: &str, id: SettlementId) -> Result<(), EngineError> {
    if actor.is_privileged() {
        Ok(())
    } else {
        Err(EngineError::conflict(
            ConflictCode::NotOwned,
            format!("cannot {action} settlement {id}: {} is not an operator", actor.actor_type()),
        ))
    }
}

impl SettlementBatcher {
    /// Create a batcher with the default retry budget.
    #[must_use]
    pub fn new(store: Arc<dyn ReservationStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry budget for lost status races.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load a settlement.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if it does not exist.
    pub async fn get(&self, id: SettlementId) -> Result<ReservationSettlement, EngineError> {
        self.store
            .get_settlement(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Settlement", id))
    }

    /// Approve a READY settlement for payout.
    ///
    /// Approving an already APPROVED settlement returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is an admin or the system
    /// - `ALREADY_PAID` or `SETTLEMENT_BLOCKED` naming the status
    pub async fn approve(
        &self,
        id: SettlementId,
        actor: Actor,
    ) -> Result<ReservationSettlement, EngineError> {
        require_operator(&actor, "approve", id)?;
        let actor = &actor;
        self.retrying("approve", move || self.approve_once(id, actor))
            .await
    }

    async fn approve_once(
        &self,
        id: SettlementId,
        actor: &Actor,
    ) -> Result<ReservationSettlement, EngineError> {
        let now = self.clock.now();
        let settlement = self.get(id).await?;
        match settlement.status {
            SettlementStatus::Ready => {}
            SettlementStatus::Approved => {
                debug!(settlement_id = %id, "Settlement already approved");
                return Ok(settlement);
            }
            SettlementStatus::Paid => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyPaid,
                    "cannot approve: already PAID",
                ));
            }
            SettlementStatus::Blocked => {
                return Err(EngineError::conflict(
                    ConflictCode::SettlementBlocked,
                    format!(
                        "cannot approve: settlement is BLOCKED ({})",
                        settlement.block_reason.as_deref().unwrap_or("no reason")
                    ),
                ));
            }
        }

        let mut approved = settlement.clone();
        approved.status = SettlementStatus::Approved;
        approved.approved_at = Some(now);

        let event = EventLog::new(
            EventType::SettlementApproved,
            actor,
            format!("settlement:{id}:approve"),
            now,
        )
        .for_settlement(id, settlement.reservation_id)
        .with_meta(serde_json::json!({
            "seller_payout_amount": settlement.seller_payout_amount,
            "scheduled_payout_at": settlement.scheduled_payout_at,
        }));
        self.store
            .commit(
                Commit::new()
                    .settlement(SettlementWrite::Update {
                        settlement: approved.clone(),
                        expected_status: settlement.status,
                    })
                    .event(event),
            )
            .await?;

        SettlementMetrics::record_approved();
        info!(settlement_id = %id, actor = %actor, "Settlement approved");
        Ok(approved)
    }

    /// Pay up to `limit` approved settlements that are due.
    ///
    /// Approved settlements whose `scheduled_payout_at` is still in the
    /// future are counted as skipped and left untouched. BLOCKED settlements
    /// are never selected. A failure on one settlement is logged and the
    /// batch moves on.
    ///
    /// Passing the `batch_id` of an earlier call resumes that batch if it
    /// was interrupted and otherwise returns its recorded result; either
    /// way no settlement is paid twice.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is an admin or the system
    /// - store failures while scanning or writing the batch markers
    pub async fn bulk_mark_paid(
        &self,
        limit: usize,
        actor: Actor,
        batch_id: Option<String>,
    ) -> Result<PaidBatch, EngineError> {
        if !actor.is_privileged() {
            return Err(EngineError::conflict(
                ConflictCode::NotOwned,
                format!("cannot pay settlements: {} is not an operator", actor.actor_type()),
            ));
        }
        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        if self.store.find_event(&end_key(&batch_id)).await?.is_some() {
            debug!(batch_id = %batch_id, "Payout batch already completed");
            return self.recorded_batch(&batch_id).await;
        }

        let now = self.clock.now();
        let start = EventLog::new(EventType::SettlementBatch, &actor, start_key(&batch_id), now)
            .with_meta(serde_json::json!({
                "batch_id": batch_id,
                "phase": "start",
                "limit": limit,
            }));
        match self.store.commit(Commit::new().event(start)).await {
            Ok(_) => info!(batch_id = %batch_id, limit, "Payout batch started"),
            Err(StoreError::DuplicateKey(_)) => {
                info!(batch_id = %batch_id, "Resuming payout batch");
            }
            Err(err) => return Err(err.into()),
        }

        let mut skipped = 0;
        let mut failed = 0;
        for settlement in self
            .store
            .list_settlements(SettlementStatus::Approved, limit)
            .await?
        {
            if settlement.scheduled_payout_at > now {
                skipped += 1;
                debug!(
                    settlement_id = %settlement.id,
                    scheduled_payout_at = %settlement.scheduled_payout_at,
                    "Settlement not yet due"
                );
                continue;
            }
            if let Err(err) = self.mark_paid(&settlement, &actor, &batch_id).await {
                failed += 1;
                warn!(
                    settlement_id = %settlement.id,
                    batch_id = %batch_id,
                    error = %err,
                    "Failed to pay settlement, continuing batch"
                );
            }
        }

        let paid_ids = self.paid_ids(&batch_id).await?;
        let end = EventLog::new(EventType::SettlementBatch, &actor, end_key(&batch_id), now)
            .with_meta(serde_json::json!({
                "batch_id": batch_id,
                "phase": "end",
                "paid_count": paid_ids.len(),
                "paid_ids": paid_ids,
                "skipped": skipped,
                "failed": failed,
            }));
        match self.store.commit(Commit::new().event(end)).await {
            Ok(_) | Err(StoreError::DuplicateKey(_)) => {}
            Err(err) => return Err(err.into()),
        }

        SettlementMetrics::record_batch(paid_ids.len(), skipped);
        info!(
            batch_id = %batch_id,
            paid = paid_ids.len(),
            skipped,
            failed,
            "Payout batch finished"
        );
        self.recorded_batch(&batch_id).await
    }

    async fn mark_paid(
        &self,
        settlement: &ReservationSettlement,
        actor: &Actor,
        batch_id: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut paid = settlement.clone();
        paid.status = SettlementStatus::Paid;
        paid.paid_at = Some(now);

        let event = EventLog::new(
            EventType::SettlementPaid,
            actor,
            format!("settlement:{}:paid", settlement.id),
            now,
        )
        .for_settlement(settlement.id, settlement.reservation_id)
        .with_meta(serde_json::json!({
            "batch_id": batch_id,
            "seller_payout_amount": settlement.seller_payout_amount,
        }));
        self.store
            .commit(
                Commit::new()
                    .settlement(SettlementWrite::Update {
                        settlement: paid,
                        expected_status: SettlementStatus::Approved,
                    })
                    .event(event),
            )
            .await?;

        info!(
            settlement_id = %settlement.id,
            batch_id,
            amount = %settlement.seller_payout_amount,
            "Settlement paid"
        );
        Ok(())
    }

    /// Reconstruct a payout batch from its events.
    ///
    /// Returns `None` if no batch with this id was ever started.
    ///
    /// # Errors
    ///
    /// Store failure.
    pub async fn get_paid_batch(&self, batch_id: &str) -> Result<Option<PaidBatch>, EngineError> {
        if self.store.find_event(&start_key(batch_id)).await?.is_none() {
            return Ok(None);
        }
        self.recorded_batch(batch_id).await.map(Some)
    }

    async fn recorded_batch(&self, batch_id: &str) -> Result<PaidBatch, EngineError> {
        let paid_ids = self.paid_ids(batch_id).await?;
        let end = self.store.find_event(&end_key(batch_id)).await?;
        let skipped = end
            .as_ref()
            .and_then(|e| e.meta.get("skipped"))
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);

        Ok(PaidBatch {
            batch_id: batch_id.to_string(),
            paid_count: paid_ids.len(),
            paid_ids,
            skipped,
            completed: end.is_some(),
        })
    }

    async fn paid_ids(&self, batch_id: &str) -> Result<Vec<SettlementId>, EngineError> {
        let events = self
            .store
            .list_events(EventQuery {
                event_type: Some(EventType::SettlementPaid),
                batch_id: Some(batch_id.to_string()),
                ..EventQuery::default()
            })
            .await?;
        Ok(events.into_iter().filter_map(|e| e.settlement_id).collect())
    }

    /// Hold a settlement back from payout.
    ///
    /// Blocking an already BLOCKED settlement returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is an admin or the system
    /// - `ALREADY_PAID` if the payout already happened
    pub async fn block(
        &self,
        id: SettlementId,
        actor: Actor,
        reason: String,
    ) -> Result<ReservationSettlement, EngineError> {
        require_operator(&actor, "block", id)?;
        let actor = &actor;
        let reason = reason.as_str();
        self.retrying("block", move || self.block_once(id, actor, reason))
            .await
    }

    async fn block_once(
        &self,
        id: SettlementId,
        actor: &Actor,
        reason: &str,
    ) -> Result<ReservationSettlement, EngineError> {
        let now = self.clock.now();
        let settlement = self.get(id).await?;
        match settlement.status {
            SettlementStatus::Blocked => return Ok(settlement),
            SettlementStatus::Paid => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyPaid,
                    "cannot block: already PAID",
                ));
            }
            SettlementStatus::Ready | SettlementStatus::Approved => {}
        }

        let mut blocked = settlement.clone();
        blocked.status = SettlementStatus::Blocked;
        blocked.block_reason = Some(reason.to_owned());

        let event = EventLog::new(
            EventType::SettlementBlocked,
            actor,
            format!("settlement:{id}:block:{}", Uuid::new_v4().simple()),
            now,
        )
        .for_settlement(id, settlement.reservation_id)
        .with_reason(Some(reason.to_owned()))
        .with_meta(serde_json::json!({ "from": settlement.status }));
        self.store
            .commit(
                Commit::new()
                    .settlement(SettlementWrite::Update {
                        settlement: blocked.clone(),
                        expected_status: settlement.status,
                    })
                    .event(event),
            )
            .await?;

        warn!(settlement_id = %id, reason, "Settlement blocked");
        Ok(blocked)
    }

    /// Return a manually blocked settlement to READY.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is an admin or the system
    /// - `INVALID_STATE` if the settlement is not BLOCKED
    /// - `SETTLEMENT_BLOCKED` if it was blocked by a full refund
    pub async fn unblock(
        &self,
        id: SettlementId,
        actor: Actor,
    ) -> Result<ReservationSettlement, EngineError> {
        require_operator(&actor, "unblock", id)?;
        let actor = &actor;
        self.retrying("unblock", move || self.unblock_once(id, actor))
            .await
    }

    async fn unblock_once(
        &self,
        id: SettlementId,
        actor: &Actor,
    ) -> Result<ReservationSettlement, EngineError> {
        let now = self.clock.now();
        let settlement = self.get(id).await?;
        if settlement.status != SettlementStatus::Blocked {
            return Err(EngineError::conflict(
                ConflictCode::InvalidState,
                format!("cannot unblock: settlement is {}", settlement.status),
            ));
        }
        if settlement.block_reason.as_deref() == Some(BLOCK_REASON_FULLY_REFUNDED) {
            return Err(EngineError::conflict(
                ConflictCode::SettlementBlocked,
                "cannot unblock: reservation was fully refunded",
            ));
        }

        let mut ready = settlement.clone();
        ready.status = SettlementStatus::Ready;
        ready.block_reason = None;

        let event = EventLog::new(
            EventType::SettlementUnblocked,
            actor,
            format!("settlement:{id}:unblock:{}", Uuid::new_v4().simple()),
            now,
        )
        .for_settlement(id, settlement.reservation_id)
        .with_reason(settlement.block_reason.clone());
        self.store
            .commit(
                Commit::new()
                    .settlement(SettlementWrite::Update {
                        settlement: ready.clone(),
                        expected_status: SettlementStatus::Blocked,
                    })
                    .event(event),
            )
            .await?;

        info!(settlement_id = %id, "Settlement unblocked");
        Ok(ready)
    }

    /// Run a system payout batch of up to `limit` settlements every
    /// `interval` until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: &mut Shutdown, interval: Duration, limit: usize) {
        shutdown.spawn_periodic("settlement-batcher", interval, move || {
            let batcher = Arc::clone(&self);
            async move {
                if let Err(e) = batcher.bulk_mark_paid(limit, Actor::System, None).await {
                    error!(error = %e, "Payout batch failed");
                }
            }
        });
    }

    async fn retrying<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        retry_with_predicate(&self.retry, operation, attempt, EngineError::is_retryable)
            .await
            .map_err(|err| {
                if err.is_retryable() {
                    EngineError::conflict(
                        ConflictCode::ConcurrentModification,
                        format!("{operation}: settlement changed concurrently, retry later"),
                    )
                } else {
                    err
                }
            })
    }
}
