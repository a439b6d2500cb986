//! Refund requests and the effects a refund decision has on stored rows.
//!
//! The amounts themselves come from
//! [`PolicyEngine::refund_decision`](groupbuy_core::policy::PolicyEngine::refund_decision).
//! Preview and execute build the same [`RefundPlan`]; execute then turns it
//! into [`RefundEffects`] and commits them.

use chrono::{DateTime, Utc};
use groupbuy_core::error::EngineError;
use groupbuy_core::policy::{PolicyBundle, RefundDecision, RefundTrigger};
use groupbuy_core::store::SettlementWrite;
use groupbuy_core::types::{
    Actor, BLOCK_REASON_FULLY_REFUNDED, EventLog, EventType, PointEntry, PointHolder, Reservation,
    ReservationSettlement, ReservationStatus, SettlementStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A refund of some or all of a reservation's remaining units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Who asks for the refund
    pub actor: Actor,
    /// Units to refund; `None` refunds everything that remains
    pub quantity: Option<u32>,
    /// Explicit trigger; only admins may pick one other than their own
    pub trigger: Option<RefundTrigger>,
    /// Free-text reason recorded on the event
    pub reason: Option<String>,
    /// Client idempotency key
    pub idempotency_key: Option<String>,
}

impl RefundRequest {
    /// Refund every remaining unit on behalf of `actor`.
    #[must_use]
    pub const fn new(actor: Actor) -> Self {
        Self {
            actor,
            quantity: None,
            trigger: None,
            reason: None,
            idempotency_key: None,
        }
    }

    /// Refund only `quantity` units.
    #[must_use]
    pub const fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Override the trigger derived from the actor.
    #[must_use]
    pub const fn with_trigger(mut self, trigger: RefundTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Trigger to evaluate a refund under.
///
/// Buyers, sellers and the system always refund under their own trigger.
/// Admins may name any trigger, which is how `DISPUTE_RESOLVE` is reached.
pub(crate) fn resolve_trigger(
    actor: &Actor,
    requested: Option<RefundTrigger>,
) -> Result<RefundTrigger, EngineError> {
    let derived = RefundTrigger::for_actor(actor);
    match requested {
        None => Ok(derived),
        Some(trigger) if trigger == derived || matches!(actor, Actor::Admin(_)) => Ok(trigger),
        Some(trigger) => Err(EngineError::InvalidRequest(format!(
            "{} may not request refund trigger {trigger:?}",
            actor.actor_type()
        ))),
    }
}

/// Everything a refund is evaluated against.
pub(crate) struct RefundPlan {
    /// Bundle the decision was computed with
    pub(crate) policy: Arc<PolicyBundle>,
    /// Settlement row, if the reservation was delivered
    pub(crate) settlement: Option<ReservationSettlement>,
    /// Computed decision
    pub(crate) decision: RefundDecision,
}

/// Rows and ledger entries a refund writes.
pub(crate) struct RefundEffects {
    pub(crate) reservation: Reservation,
    pub(crate) settlement: Option<SettlementWrite>,
    pub(crate) settlement_event: Option<EventLog>,
    pub(crate) points: Option<PointEntry>,
}

pub(crate) fn effects(
    reservation: &Reservation,
    plan: &RefundPlan,
    actor: &Actor,
    now: DateTime<Utc>,
) -> RefundEffects {
    let decision = &plan.decision;

    let mut next = reservation.next_version();
    next.refunded_qty = decision.refunded_qty_after;
    next.refunded_amount_total += decision.amount_total;
    next.points_revoked += decision.points_reversal;
    if decision.fully_refunded {
        next.status = ReservationStatus::Cancelled;
        next.cancelled_at = Some(now);
    }

    let points = (decision.points_reversal > 0).then(|| PointEntry {
        holder: PointHolder::Buyer(reservation.buyer_id),
        amount: -decision.points_reversal,
        reason: "refund points reversal".into(),
        idempotency_key: format!(
            "pt:refund:{}:{}",
            reservation.id, decision.refunded_qty_after
        ),
        created_at: now,
    });

    // A paid-out settlement is recovered from the seller instead of re-priced.
    let (settlement, settlement_event) = match &plan.settlement {
        Some(current) if current.status != SettlementStatus::Paid => {
            let amounts = plan
                .policy
                .engine()
                .settlement_amounts(next.net_paid(), current.commission_rate_bp);
            let mut updated = current.clone();
            updated.buyer_paid_amount = amounts.buyer_paid;
            updated.pg_fee_amount = amounts.pg_fee;
            updated.platform_commission_amount = amounts.platform_commission;
            updated.seller_payout_amount = amounts.seller_payout;

            let event_type = if decision.fully_refunded {
                updated.status = SettlementStatus::Blocked;
                updated.block_reason = Some(BLOCK_REASON_FULLY_REFUNDED.to_string());
                EventType::SettlementBlocked
            } else {
                EventType::SettlementAdjusted
            };
            let event = EventLog::new(
                event_type,
                actor,
                format!(
                    "settlement:{}:refund:{}",
                    current.id, decision.refunded_qty_after
                ),
                now,
            )
            .for_settlement(current.id, reservation.id)
            .with_meta(serde_json::json!({
                "buyer_paid_amount": updated.buyer_paid_amount,
                "seller_payout_amount": updated.seller_payout_amount,
                "status": updated.status,
            }));

            (
                Some(SettlementWrite::Update {
                    settlement: updated,
                    expected_status: current.status,
                }),
                Some(event),
            )
        }
        _ => (None, None),
    };

    RefundEffects {
        reservation: next,
        settlement,
        settlement_event,
        points,
    }
}
