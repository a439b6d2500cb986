//! Reservation lifecycle.
//!
//! ```text
//!            pay               mark_shipped          arrival_confirm
//! PENDING ---------> PAID ----------------> SHIPPED ----------------> DELIVERED
//!    |                 \                       |                          |
//!    | expire           \ cancel / full refund |                          |
//!    v                   v                     v                          v
//! EXPIRED             CANCELLED <--------------+--------------------------+
//! ```
//!
//! Every transition is one [`Commit`]: the reservation write (guarded by the
//! version that was read), the offer counter delta from
//! [`InventoryLedger`], the audit event, any point entries and the
//! idempotency record. Lost version races are retried under the machine's
//! [`RetryPolicy`]; once the budget is spent the caller gets
//! `CONCURRENT_MODIFICATION`.
//!
//! Guards run in a fixed order and the first failure wins: ownership,
//! double action, expiry, then the offer's cancel window.

use crate::ledger::InventoryLedger;
use crate::refund::{self, RefundPlan, RefundRequest};
use chrono::{DateTime, Duration, Utc};
use groupbuy_core::environment::Clock;
use groupbuy_core::error::{ConflictCode, EngineError, StoreError};
use groupbuy_core::policy::{
    PolicyHandle, RefundContext, RefundDecision, RefundTrigger, SettlementState,
};
use groupbuy_core::store::{
    Commit, CommitOutcome, IdempotencyRecord, ReservationStore, ReservationWrite, SettlementWrite,
};
use groupbuy_core::types::{
    Actor, BuyerId, CancelRule, DealId, EventLog, EventType, Money, Offer, OfferId, PointEntry,
    PointHolder, Reservation, ReservationId, ReservationPhase, ReservationSettlement,
    ReservationStatus, SettlementId, SettlementStatus,
};
use groupbuy_runtime::metrics::ReservationMetrics;
use groupbuy_runtime::{RetryPolicy, retry_with_predicate};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Input to [`ReservationMachine::create_reservation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReservation {
    /// Deal the offer belongs to
    pub deal_id: DealId,
    /// Offer to reserve from
    pub offer_id: OfferId,
    /// Buyer placing the hold
    pub buyer_id: BuyerId,
    /// Units to hold
    pub qty: u32,
    /// Hold length; the policy default when `None`
    pub hold_minutes: Option<u32>,
    /// Client idempotency key
    pub idempotency_key: Option<String>,
}

impl CreateReservation {
    /// Hold `qty` units of `offer` for `buyer_id` with the default hold.
    #[must_use]
    pub const fn new(offer: &Offer, buyer_id: BuyerId, qty: u32) -> Self {
        Self {
            deal_id: offer.deal_id,
            offer_id: offer.id,
            buyer_id,
            qty,
            hold_minutes: None,
            idempotency_key: None,
        }
    }

    /// Hold for `minutes` instead of the policy default.
    #[must_use]
    pub const fn with_hold_minutes(mut self, minutes: u32) -> Self {
        self.hold_minutes = Some(minutes);
        self
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of [`ReservationMachine::expire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// This call moved the reservation to EXPIRED and released its units.
    Expired(Reservation),
    /// The reservation had already left PENDING.
    Skipped {
        /// Status found
        status: ReservationStatus,
    },
    /// The hold has not run out yet.
    NotDue {
        /// Current deadline
        expires_at: DateTime<Utc>,
    },
}

/// A buyer's points balance and grade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerPoints {
    /// Buyer
    pub buyer_id: BuyerId,
    /// Sum of the buyer's point entries
    pub balance: i64,
    /// Grade name for the balance under the active policy
    pub grade: String,
}

/// Idempotency key bound to the request it was first used with.
struct Idempotency<'a> {
    key: &'a str,
    operation: &'static str,
    fingerprint: String,
}

impl<'a> Idempotency<'a> {
    fn new(key: Option<&'a str>, operation: &'static str, fingerprint: String) -> Option<Self> {
        key.map(|key| Self {
            key,
            operation,
            fingerprint,
        })
    }

    fn record(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord, EngineError> {
        Ok(IdempotencyRecord {
            key: self.key.to_owned(),
            operation: self.operation.to_owned(),
            fingerprint: self.fingerprint.clone(),
            reservation_id: reservation.id,
            response: serde_json::to_value(reservation).map_err(StoreError::from)?,
            created_at: now,
        })
    }
}

fn record_for(
    idem: Option<&Idempotency<'_>>,
    reservation: &Reservation,
    now: DateTime<Utc>,
) -> Result<Option<IdempotencyRecord>, EngineError> {
    idem.map(|i| i.record(reservation, now)).transpose()
}

fn update(next: Reservation, read: &Reservation) -> ReservationWrite {
    ReservationWrite::Update {
        reservation: next,
        expected_version: read.version,
    }
}

fn reservation_event(
    event_type: EventType,
    actor: &Actor,
    reservation: &Reservation,
    suffix: &str,
    now: DateTime<Utc>,
) -> EventLog {
    EventLog::new(
        event_type,
        actor,
        format!("reservation:{}:{suffix}", reservation.id),
        now,
    )
    .for_reservation(reservation.id, reservation.offer_id)
}

fn not_owned(action: &str, reservation: &Reservation, actor: &Actor) -> EngineError {
    EngineError::conflict(
        ConflictCode::NotOwned,
        format!("cannot {action}: reservation {} is not owned by {actor}", reservation.id),
    )
}

/// The acting buyer owns the reservation, or the actor is privileged.
fn ensure_buyer(actor: &Actor, reservation: &Reservation, action: &str) -> Result<(), EngineError> {
    match actor {
        Actor::Buyer(buyer) if *buyer == reservation.buyer_id => Ok(()),
        a if a.is_privileged() => Ok(()),
        _ => Err(not_owned(action, reservation, actor)),
    }
}

/// The acting seller owns the offer, or the actor is privileged.
fn ensure_seller(
    actor: &Actor,
    offer: &Offer,
    reservation: &Reservation,
    action: &str,
) -> Result<(), EngineError> {
    match actor {
        Actor::Seller(seller) if *seller == offer.seller_id => Ok(()),
        a if a.is_privileged() => Ok(()),
        _ => Err(not_owned(action, reservation, actor)),
    }
}

/// Either party to the reservation, or a privileged actor.
fn ensure_party(
    actor: &Actor,
    offer: &Offer,
    reservation: &Reservation,
    action: &str,
) -> Result<(), EngineError> {
    ensure_buyer(actor, reservation, action)
        .or_else(|_| ensure_seller(actor, offer, reservation, action))
}

/// Offer-level rule for buyer cancellation of a paid reservation.
fn check_cancel_window(
    offer: &Offer,
    reservation: &Reservation,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let shipped = matches!(
        reservation.status,
        ReservationStatus::Shipped | ReservationStatus::Delivered
    );
    match offer.cancel_rule {
        CancelRule::UntilShipped | CancelRule::NoCancelAfterShipping if shipped => {
            Err(EngineError::conflict(
                ConflictCode::CancelNotAllowedAfterShipped,
                format!("cannot cancel: already {}", reservation.status),
            ))
        }
        CancelRule::WithinDaysAfterDelivery { days } => match reservation.delivered_at {
            Some(delivered_at)
                if reservation.status == ReservationStatus::Delivered
                    && now > delivered_at + Duration::days(i64::from(days)) =>
            {
                Err(EngineError::conflict(
                    ConflictCode::CancelPeriodExpired,
                    format!("cannot cancel: window closed {days} days after delivery"),
                ))
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

/// Reservation state machine.
///
/// Cheap to share behind an `Arc`; every operation reads the clock and the
/// active policy bundle at call time.
pub struct ReservationMachine {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    policy: Arc<PolicyHandle>,
    retry: RetryPolicy,
}

impl ReservationMachine {
    /// Create a machine with the default retry budget.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<PolicyHandle>,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry budget for lost version races.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Store the machine writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Hold `qty` units of an offer for a buyer.
    ///
    /// # Errors
    ///
    /// - `INVALID_QUANTITY` if `qty` is zero
    /// - [`EngineError::InvalidRequest`] if the hold is out of range
    /// - [`EngineError::NotFound`] if the offer is not part of the deal
    /// - `INVALID_STATE` if the offer is inactive or past its deadline
    /// - `INSUFFICIENT_CAPACITY` if the units are not available
    /// - `IDEMPOTENCY_KEY_REUSED` if the key was used for another request
    pub async fn create_reservation(
        &self,
        request: CreateReservation,
    ) -> Result<Reservation, EngineError> {
        let fingerprint = format!(
            "{}:{}:{}:{}:{:?}",
            request.deal_id, request.offer_id, request.buyer_id, request.qty, request.hold_minutes
        );
        let idem = Idempotency::new(request.idempotency_key.as_deref(), "create", fingerprint);
        let idem = idem.as_ref();
        let request = &request;
        self.run("create", idem, move || self.create_once(request, idem))
            .await
    }

    /// Pay for a PENDING reservation.
    ///
    /// A hold that has run out is expired on the spot and its units
    /// released, even if the sweeper has not reached it yet.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` if `actor` is another buyer or a seller
    /// - `ALREADY_PAID`, `EXPIRED` or `ALREADY_CANCELLED` naming the status
    /// - `EXPIRED` if the hold ran out
    pub async fn pay(
        &self,
        id: ReservationId,
        actor: Actor,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let idem = Idempotency::new(idempotency_key, "pay", format!("{id}:{actor}"));
        let idem = idem.as_ref();
        let actor = &actor;
        self.run("pay", idem, move || self.pay_once(id, actor, idem))
            .await
    }

    /// Expire a PENDING reservation whose hold ran out.
    ///
    /// Safe to call concurrently with itself and with `pay`: exactly one
    /// transition out of PENDING wins, and the loser reports
    /// [`ExpireOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] or a store failure.
    pub async fn expire(&self, id: ReservationId) -> Result<ExpireOutcome, EngineError> {
        self.retrying("expire", move || self.expire_once(id)).await
    }

    /// Cancel a reservation.
    ///
    /// PENDING holds are released. Paid reservations are refunded in full
    /// for their remaining units, subject to the offer's cancel rule when
    /// the buyer cancels.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` if `actor` is not a party to the reservation
    /// - `ALREADY_CANCELLED` / `INVALID_STATE` naming the status
    /// - `CANCEL_NOT_ALLOWED_AFTER_SHIPPED` or `CANCEL_PERIOD_EXPIRED`
    /// - any refund policy rejection
    pub async fn cancel(
        &self,
        id: ReservationId,
        actor: Actor,
        reason: Option<String>,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let idem = Idempotency::new(
            idempotency_key,
            "cancel",
            format!("{id}:{actor}:{reason:?}"),
        );
        let idem = idem.as_ref();
        let actor = &actor;
        let reason = reason.as_deref();
        self.run("cancel", idem, move || {
            self.cancel_once(id, actor, reason, idem)
        })
        .await
    }

    /// Record that the seller shipped a PAID reservation.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is the offer's seller or privileged
    /// - `INVALID_STATE` / `ALREADY_CANCELLED` naming the status
    pub async fn mark_shipped(
        &self,
        id: ReservationId,
        actor: Actor,
        tracking_number: Option<String>,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let idem = Idempotency::new(
            idempotency_key,
            "ship",
            format!("{id}:{actor}:{tracking_number:?}"),
        );
        let idem = idem.as_ref();
        let actor = &actor;
        let tracking = tracking_number.as_deref();
        self.run("ship", idem, move || {
            self.mark_shipped_once(id, actor, tracking, idem)
        })
        .await
    }

    /// Record that the buyer received a SHIPPED reservation and open its
    /// settlement.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` unless `actor` is the buyer or privileged
    /// - `INVALID_STATE` / `ALREADY_CANCELLED` naming the status
    pub async fn arrival_confirm(
        &self,
        id: ReservationId,
        actor: Actor,
        idempotency_key: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let idem = Idempotency::new(idempotency_key, "arrival_confirm", format!("{id}:{actor}"));
        let idem = idem.as_ref();
        let actor = &actor;
        self.run("arrival_confirm", idem, move || {
            self.arrival_confirm_once(id, actor, idem)
        })
        .await
    }

    /// Compute the refund `refund` would apply, without writing anything.
    ///
    /// # Errors
    ///
    /// The same rejections `refund` would return.
    pub async fn refund_preview(
        &self,
        id: ReservationId,
        actor: Actor,
        quantity: Option<u32>,
        trigger: Option<RefundTrigger>,
    ) -> Result<RefundDecision, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        let offer = self.load_offer(reservation.offer_id).await?;
        ensure_party(&actor, &offer, &reservation, "refund")?;
        let plan = self
            .refund_plan(&reservation, &actor, quantity, trigger, now)
            .await?;
        Ok(plan.decision)
    }

    /// Refund some or all remaining units of a paid reservation.
    ///
    /// Refunding the last unit cancels the reservation.
    ///
    /// # Errors
    ///
    /// - `NOT_OWNED` if `actor` is not a party to the reservation
    /// - `INVALID_STATE`, `ALREADY_CANCELLED` or `ALREADY_REFUNDED`
    /// - `REFUND_NOT_ALLOWED`, `REFUND_QUANTITY_EXCEEDED`, `INVALID_QUANTITY`
    pub async fn refund(
        &self,
        id: ReservationId,
        request: RefundRequest,
    ) -> Result<Reservation, EngineError> {
        let fingerprint = format!(
            "{id}:{}:{:?}:{:?}",
            request.actor, request.quantity, request.trigger
        );
        let idem = Idempotency::new(request.idempotency_key.as_deref(), "refund", fingerprint);
        let idem = idem.as_ref();
        let request = &request;
        self.run("refund", idem, move || self.refund_once(id, request, idem))
            .await
    }

    /// Load a reservation, expiring it first if its hold ran out.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the reservation does not exist.
    pub async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        let reservation = self.load(id).await?;
        if !reservation.is_due_to_expire(self.clock.now()) {
            return Ok(reservation);
        }
        match self.expire(id).await? {
            ExpireOutcome::Expired(expired) => Ok(expired),
            ExpireOutcome::Skipped { .. } | ExpireOutcome::NotDue { .. } => self.load(id).await,
        }
    }

    /// Display phase of a reservation under the active policy.
    #[must_use]
    pub fn phase(&self, reservation: &Reservation) -> ReservationPhase {
        reservation.phase(self.clock.now(), self.policy.current().time.cooling_days)
    }

    /// A buyer's points balance and grade.
    ///
    /// # Errors
    ///
    /// Store failure.
    pub async fn buyer_points(&self, buyer_id: BuyerId) -> Result<BuyerPoints, EngineError> {
        let balance = self
            .store
            .points_balance(PointHolder::Buyer(buyer_id))
            .await?;
        let policy = self.policy.current();
        Ok(BuyerPoints {
            buyer_id,
            balance,
            grade: policy.engine().buyer_grade(balance).to_string(),
        })
    }

    // ========================================================================
    // Single attempts
    // ========================================================================

    async fn create_once(
        &self,
        request: &CreateReservation,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let policy = self.policy.current();

        if request.qty == 0 {
            return Err(EngineError::conflict(
                ConflictCode::InvalidQuantity,
                "qty must be > 0",
            ));
        }
        let hold = policy
            .engine()
            .hold_duration(request.hold_minutes)
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "hold_minutes must be between 1 and {}",
                    policy.time.max_hold_minutes
                ))
            })?;

        let offer = self.load_offer(request.offer_id).await?;
        if offer.deal_id != request.deal_id {
            return Err(EngineError::not_found(
                "Offer",
                format!("{} in deal {}", request.offer_id, request.deal_id),
            ));
        }
        if !offer.is_active {
            return Err(EngineError::conflict(
                ConflictCode::InvalidState,
                format!("offer {} is not accepting reservations", offer.id),
            ));
        }
        if let Some(deadline) = offer.deadline_at.filter(|d| *d <= now) {
            return Err(EngineError::conflict(
                ConflictCode::InvalidState,
                format!("offer {} closed at {deadline}", offer.id),
            ));
        }

        let amount_goods = offer.price.times(request.qty);
        let amount_shipping = offer
            .shipping_mode
            .shipping_amount(offer.shipping_fee, request.qty);
        let reservation = Reservation {
            id: ReservationId::new(),
            deal_id: request.deal_id,
            offer_id: offer.id,
            buyer_id: request.buyer_id,
            qty: request.qty,
            status: ReservationStatus::Pending,
            amount_goods,
            amount_shipping,
            amount_total: amount_goods + amount_shipping,
            created_at: now,
            expires_at: now + hold,
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            expired_at: None,
            tracking_number: None,
            refunded_qty: 0,
            refunded_amount_total: Money::ZERO,
            points_awarded: 0,
            points_revoked: 0,
            idempotency_key: idem.map(|i| i.key.to_owned()),
            version: 0,
        };

        let event = reservation_event(
            EventType::ReservationCreated,
            &Actor::Buyer(request.buyer_id),
            &reservation,
            "created",
            now,
        )
        .with_meta(serde_json::json!({
            "qty": reservation.qty,
            "amount_total": reservation.amount_total,
            "expires_at": reservation.expires_at,
        }));

        self.commit(
            Commit::new()
                .reservation(ReservationWrite::Insert(reservation.clone()))
                .offer(InventoryLedger::reserve(offer.id, request.qty))
                .event(event)
                .idempotency(record_for(idem, &reservation, now)?),
        )
        .await?;

        ReservationMetrics::record_created(reservation.qty);
        info!(
            reservation_id = %reservation.id,
            offer_id = %offer.id,
            qty = reservation.qty,
            expires_at = %reservation.expires_at,
            "Reservation created"
        );
        Ok(reservation)
    }

    async fn pay_once(
        &self,
        id: ReservationId,
        actor: &Actor,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        ensure_buyer(actor, &reservation, "pay")?;

        match reservation.status {
            ReservationStatus::Pending => {}
            ReservationStatus::Paid | ReservationStatus::Shipped | ReservationStatus::Delivered => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyPaid,
                    format!("cannot pay: already {}", reservation.status),
                ));
            }
            ReservationStatus::Expired => {
                return Err(EngineError::conflict(
                    ConflictCode::Expired,
                    "cannot pay: already EXPIRED",
                ));
            }
            ReservationStatus::Cancelled => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyCancelled,
                    "cannot pay: already CANCELLED",
                ));
            }
        }

        if reservation.is_due_to_expire(now) {
            self.persist_expiry(&reservation, &Actor::System, now)
                .await?;
            return Err(EngineError::conflict(
                ConflictCode::Expired,
                format!("cannot pay: hold expired at {}", reservation.expires_at),
            ));
        }

        let policy = self.policy.current();
        let offer = self.load_offer(reservation.offer_id).await?;

        let mut paid = reservation.next_version();
        paid.status = ReservationStatus::Paid;
        paid.paid_at = Some(now);
        paid.points_awarded = policy.points.buyer_paid;

        let event = reservation_event(EventType::ReservationPaid, actor, &reservation, "paid", now)
            .with_meta(serde_json::json!({
                "qty": reservation.qty,
                "amount_total": reservation.amount_total,
            }));
        let mut commit = Commit::new()
            .reservation(update(paid.clone(), &reservation))
            .offer(InventoryLedger::commit_sale(
                offer.id,
                reservation.qty,
                InventoryLedger::sold_out_award(&offer, &policy, now),
            ))
            .event(event)
            .idempotency(record_for(idem, &paid, now)?);
        if policy.points.buyer_paid > 0 {
            commit = commit.points(PointEntry {
                holder: PointHolder::Buyer(reservation.buyer_id),
                amount: policy.points.buyer_paid,
                reason: "reservation paid".into(),
                idempotency_key: format!("pt:paid:{}", reservation.id),
                created_at: now,
            });
        }

        let outcome = self.commit(commit).await?;
        ReservationMetrics::record_transition(ReservationStatus::Paid.as_str());
        info!(
            reservation_id = %reservation.id,
            offer_id = %offer.id,
            qty = reservation.qty,
            from = %reservation.status,
            to = %paid.status,
            "Reservation paid"
        );
        if outcome.offer_confirmed {
            info!(offer_id = %offer.id, capacity = offer.capacity, "Offer sold out and confirmed");
        }
        Ok(paid)
    }

    async fn expire_once(&self, id: ReservationId) -> Result<ExpireOutcome, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        if reservation.status != ReservationStatus::Pending {
            return Ok(ExpireOutcome::Skipped {
                status: reservation.status,
            });
        }
        if reservation.expires_at > now {
            return Ok(ExpireOutcome::NotDue {
                expires_at: reservation.expires_at,
            });
        }
        let expired = self
            .persist_expiry(&reservation, &Actor::System, now)
            .await?;
        Ok(ExpireOutcome::Expired(expired))
    }

    async fn persist_expiry(
        &self,
        reservation: &Reservation,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let mut expired = reservation.next_version();
        expired.status = ReservationStatus::Expired;
        expired.expired_at = Some(now);

        let event = reservation_event(
            EventType::ReservationExpired,
            actor,
            reservation,
            "expired",
            now,
        )
        .with_meta(serde_json::json!({
            "qty": reservation.qty,
            "expires_at": reservation.expires_at,
        }));
        self.commit(
            Commit::new()
                .reservation(update(expired.clone(), reservation))
                .offer(InventoryLedger::release(reservation.offer_id, reservation.qty))
                .event(event),
        )
        .await?;

        ReservationMetrics::record_transition(ReservationStatus::Expired.as_str());
        info!(
            reservation_id = %reservation.id,
            offer_id = %reservation.offer_id,
            qty = reservation.qty,
            from = %reservation.status,
            to = %expired.status,
            "Reservation expired"
        );
        Ok(expired)
    }

    async fn cancel_once(
        &self,
        id: ReservationId,
        actor: &Actor,
        reason: Option<&str>,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        let offer = self.load_offer(reservation.offer_id).await?;
        ensure_party(actor, &offer, &reservation, "cancel")?;

        match reservation.status {
            ReservationStatus::Cancelled => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyCancelled,
                    "cannot cancel: already CANCELLED",
                ));
            }
            ReservationStatus::Expired => {
                return Err(EngineError::conflict(
                    ConflictCode::InvalidState,
                    "cannot cancel: already EXPIRED",
                ));
            }
            ReservationStatus::Pending => {
                return self
                    .cancel_pending(&reservation, actor, reason, idem, now)
                    .await;
            }
            ReservationStatus::Paid | ReservationStatus::Shipped | ReservationStatus::Delivered => {}
        }

        if matches!(actor, Actor::Buyer(_)) {
            check_cancel_window(&offer, &reservation, now)?;
        }

        let plan = self
            .refund_plan(&reservation, actor, None, None, now)
            .await?;
        let event = reservation_event(
            EventType::ReservationCancelled,
            actor,
            &reservation,
            "cancelled",
            now,
        )
        .with_reason(reason.map(str::to_owned))
        .with_meta(serde_json::to_value(&plan.decision).map_err(StoreError::from)?);
        self.apply_refund(&reservation, &plan, actor, event, idem, now)
            .await
    }

    async fn cancel_pending(
        &self,
        reservation: &Reservation,
        actor: &Actor,
        reason: Option<&str>,
        idem: Option<&Idempotency<'_>>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        if reservation.is_due_to_expire(now) {
            self.persist_expiry(reservation, &Actor::System, now)
                .await?;
            return Err(EngineError::conflict(
                ConflictCode::Expired,
                format!("cannot cancel: hold expired at {}", reservation.expires_at),
            ));
        }

        let mut cancelled = reservation.next_version();
        cancelled.status = ReservationStatus::Cancelled;
        cancelled.cancelled_at = Some(now);

        let event = reservation_event(
            EventType::ReservationCancelled,
            actor,
            reservation,
            "cancelled",
            now,
        )
        .with_reason(reason.map(str::to_owned))
        .with_meta(serde_json::json!({ "qty": reservation.qty }));
        self.commit(
            Commit::new()
                .reservation(update(cancelled.clone(), reservation))
                .offer(InventoryLedger::release(reservation.offer_id, reservation.qty))
                .event(event)
                .idempotency(record_for(idem, &cancelled, now)?),
        )
        .await?;

        ReservationMetrics::record_transition(ReservationStatus::Cancelled.as_str());
        info!(
            reservation_id = %reservation.id,
            offer_id = %reservation.offer_id,
            qty = reservation.qty,
            from = %reservation.status,
            to = %cancelled.status,
            "Reservation cancelled"
        );
        Ok(cancelled)
    }

    async fn mark_shipped_once(
        &self,
        id: ReservationId,
        actor: &Actor,
        tracking_number: Option<&str>,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        let offer = self.load_offer(reservation.offer_id).await?;
        ensure_seller(actor, &offer, &reservation, "ship")?;

        match reservation.status {
            ReservationStatus::Paid => {}
            ReservationStatus::Cancelled => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyCancelled,
                    "cannot ship: already CANCELLED",
                ));
            }
            status => {
                return Err(EngineError::conflict(
                    ConflictCode::InvalidState,
                    format!("cannot ship: reservation is {status}"),
                ));
            }
        }

        let mut shipped = reservation.next_version();
        shipped.status = ReservationStatus::Shipped;
        shipped.shipped_at = Some(now);
        if let Some(tracking) = tracking_number {
            shipped.tracking_number = Some(tracking.to_owned());
        }

        let event = reservation_event(
            EventType::ReservationShipped,
            actor,
            &reservation,
            "shipped",
            now,
        )
        .with_meta(serde_json::json!({ "tracking_number": shipped.tracking_number }));
        self.commit(
            Commit::new()
                .reservation(update(shipped.clone(), &reservation))
                .event(event)
                .idempotency(record_for(idem, &shipped, now)?),
        )
        .await?;

        ReservationMetrics::record_transition(ReservationStatus::Shipped.as_str());
        info!(
            reservation_id = %reservation.id,
            offer_id = %offer.id,
            from = %reservation.status,
            to = %shipped.status,
            "Reservation shipped"
        );
        Ok(shipped)
    }

    async fn arrival_confirm_once(
        &self,
        id: ReservationId,
        actor: &Actor,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        ensure_buyer(actor, &reservation, "confirm arrival")?;

        match reservation.status {
            ReservationStatus::Shipped => {}
            ReservationStatus::Cancelled => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyCancelled,
                    "cannot confirm arrival: already CANCELLED",
                ));
            }
            status => {
                return Err(EngineError::conflict(
                    ConflictCode::InvalidState,
                    format!("cannot confirm arrival: reservation is {status}"),
                ));
            }
        }

        let offer = self.load_offer(reservation.offer_id).await?;
        let stats = self.store.seller_stats(offer.seller_id).await?;
        let policy = self.policy.current();
        let engine = policy.engine();

        let mut delivered = reservation.next_version();
        delivered.status = ReservationStatus::Delivered;
        delivered.delivered_at = Some(now);

        let commission_rate_bp = engine.commission_rate_bp(stats);
        let amounts = engine.settlement_amounts(delivered.net_paid(), commission_rate_bp);
        let settlement = ReservationSettlement {
            id: SettlementId::new(),
            reservation_id: reservation.id,
            offer_id: offer.id,
            seller_id: offer.seller_id,
            buyer_paid_amount: amounts.buyer_paid,
            pg_fee_amount: amounts.pg_fee,
            platform_commission_amount: amounts.platform_commission,
            seller_payout_amount: amounts.seller_payout,
            commission_rate_bp,
            status: SettlementStatus::Ready,
            created_at: now,
            approved_at: None,
            paid_at: None,
            scheduled_payout_at: engine.scheduled_payout_at(now),
            block_reason: None,
        };

        let delivered_event = reservation_event(
            EventType::ReservationDelivered,
            actor,
            &reservation,
            "delivered",
            now,
        );
        let settlement_event = EventLog::new(
            EventType::SettlementCreated,
            actor,
            format!("settlement:{}:created", settlement.id),
            now,
        )
        .for_settlement(settlement.id, reservation.id)
        .with_meta(serde_json::json!({
            "buyer_paid_amount": settlement.buyer_paid_amount,
            "seller_payout_amount": settlement.seller_payout_amount,
            "commission_rate_bp": commission_rate_bp,
            "scheduled_payout_at": settlement.scheduled_payout_at,
        }));

        self.commit(
            Commit::new()
                .reservation(update(delivered.clone(), &reservation))
                .settlement(SettlementWrite::Insert(settlement.clone()))
                .event(delivered_event)
                .event(settlement_event)
                .idempotency(record_for(idem, &delivered, now)?),
        )
        .await?;

        ReservationMetrics::record_transition(ReservationStatus::Delivered.as_str());
        info!(
            reservation_id = %reservation.id,
            settlement_id = %settlement.id,
            from = %reservation.status,
            to = %delivered.status,
            scheduled_payout_at = %settlement.scheduled_payout_at,
            "Arrival confirmed, settlement opened"
        );
        Ok(delivered)
    }

    async fn refund_once(
        &self,
        id: ReservationId,
        request: &RefundRequest,
        idem: Option<&Idempotency<'_>>,
    ) -> Result<Reservation, EngineError> {
        let now = self.clock.now();
        let reservation = self.load(id).await?;
        let offer = self.load_offer(reservation.offer_id).await?;
        ensure_party(&request.actor, &offer, &reservation, "refund")?;

        let plan = self
            .refund_plan(
                &reservation,
                &request.actor,
                request.quantity,
                request.trigger,
                now,
            )
            .await?;
        let event = reservation_event(
            EventType::ReservationRefunded,
            &request.actor,
            &reservation,
            &format!("refund:{}", plan.decision.refunded_qty_after),
            now,
        )
        .with_reason(request.reason.clone())
        .with_meta(serde_json::to_value(&plan.decision).map_err(StoreError::from)?);
        self.apply_refund(&reservation, &plan, &request.actor, event, idem, now)
            .await
    }

    // ========================================================================
    // Refund path shared by preview, refund and paid cancel
    // ========================================================================

    async fn refund_plan(
        &self,
        reservation: &Reservation,
        actor: &Actor,
        quantity: Option<u32>,
        trigger: Option<RefundTrigger>,
        now: DateTime<Utc>,
    ) -> Result<RefundPlan, EngineError> {
        match reservation.status {
            ReservationStatus::Paid | ReservationStatus::Shipped | ReservationStatus::Delivered => {}
            ReservationStatus::Cancelled
                if reservation.paid_at.is_some() && reservation.is_fully_refunded() =>
            {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyRefunded,
                    "cannot refund: already fully refunded",
                ));
            }
            ReservationStatus::Cancelled => {
                return Err(EngineError::conflict(
                    ConflictCode::AlreadyCancelled,
                    "cannot refund: already CANCELLED",
                ));
            }
            status => {
                return Err(EngineError::conflict(
                    ConflictCode::InvalidState,
                    format!("cannot refund: reservation is {status}"),
                ));
            }
        }

        let trigger = refund::resolve_trigger(actor, trigger)?;
        let settlement = self
            .store
            .get_settlement_for_reservation(reservation.id)
            .await?;
        let settlement_state = if settlement
            .as_ref()
            .is_some_and(|s| s.status == SettlementStatus::Paid)
        {
            SettlementState::SettledToSeller
        } else {
            SettlementState::NotSettled
        };

        let policy = self.policy.current();
        let decision = policy.engine().refund_decision(RefundContext {
            reservation,
            quantity: quantity.unwrap_or_else(|| reservation.remaining_qty()),
            trigger,
            settlement: settlement_state,
            now,
        })?;

        Ok(RefundPlan {
            policy,
            settlement,
            decision,
        })
    }

    async fn apply_refund(
        &self,
        reservation: &Reservation,
        plan: &RefundPlan,
        actor: &Actor,
        event: EventLog,
        idem: Option<&Idempotency<'_>>,
        now: DateTime<Utc>,
    ) -> Result<Reservation, EngineError> {
        let effects = refund::effects(reservation, plan, actor, now);
        let decision = &plan.decision;

        let mut commit = Commit::new()
            .reservation(update(effects.reservation.clone(), reservation))
            .offer(InventoryLedger::refund_sale(
                reservation.offer_id,
                decision.quantity,
            ))
            .event(event)
            .idempotency(record_for(idem, &effects.reservation, now)?);
        if let Some(write) = effects.settlement {
            commit = commit.settlement(write);
        }
        if let Some(event) = effects.settlement_event {
            commit = commit.event(event);
        }
        if let Some(points) = effects.points {
            commit = commit.points(points);
        }
        self.commit(commit).await?;

        ReservationMetrics::record_refund(decision.quantity);
        if decision.fully_refunded {
            ReservationMetrics::record_transition(ReservationStatus::Cancelled.as_str());
        }
        info!(
            reservation_id = %reservation.id,
            offer_id = %reservation.offer_id,
            qty = decision.quantity,
            amount = %decision.amount_total,
            trigger = ?decision.trigger,
            from = %reservation.status,
            to = %effects.reservation.status,
            "Reservation refunded"
        );
        Ok(effects.reservation)
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn load(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Reservation", id))
    }

    async fn load_offer(&self, id: OfferId) -> Result<Offer, EngineError> {
        self.store
            .get_offer(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Offer", id))
    }

    async fn commit(&self, commit: Commit) -> Result<CommitOutcome, EngineError> {
        self.store
            .commit(commit)
            .await
            .map_err(InventoryLedger::map_error)
    }

    async fn replay(&self, idem: &Idempotency<'_>) -> Result<Option<Reservation>, EngineError> {
        let Some(record) = self.store.find_idempotency(idem.key).await? else {
            return Ok(None);
        };
        if record.operation != idem.operation || record.fingerprint != idem.fingerprint {
            return Err(EngineError::conflict(
                ConflictCode::IdempotencyKeyReused,
                format!(
                    "idempotency key {} was already used for a different {} request",
                    idem.key, record.operation
                ),
            ));
        }

        debug!(
            key = idem.key,
            operation = idem.operation,
            reservation_id = %record.reservation_id,
            "Replaying recorded response"
        );
        ReservationMetrics::record_replay(idem.operation);
        let reservation = serde_json::from_value(record.response).map_err(StoreError::from)?;
        Ok(Some(reservation))
    }

    /// Run one idempotent mutation with replay and bounded retries.
    async fn run<F, Fut>(
        &self,
        operation: &'static str,
        idem: Option<&Idempotency<'_>>,
        attempt: F,
    ) -> Result<Reservation, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Reservation, EngineError>>,
    {
        let attempt = &attempt;
        self.retrying(operation, move || async move {
            if let Some(idem) = idem {
                if let Some(replayed) = self.replay(idem).await? {
                    return Ok(replayed);
                }
            }
            match attempt().await {
                // A concurrent request with the same key committed first.
                Err(err @ EngineError::Store(StoreError::DuplicateKey(_))) => match idem {
                    Some(idem) => self.replay(idem).await?.ok_or(err),
                    None => Err(err),
                },
                other => other,
            }
        })
        .await
    }

    async fn retrying<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let result =
            retry_with_predicate(&self.retry, operation, attempt, EngineError::is_retryable).await;

        result.map_err(|err| {
            let err = if err.is_retryable() {
                EngineError::conflict(
                    ConflictCode::ConcurrentModification,
                    format!("{operation}: reservation changed concurrently, retry later"),
                )
            } else {
                err
            };
            if let Some(code) = err.conflict_code() {
                ReservationMetrics::record_rejected(operation, code.as_str());
                debug!(operation, code = code.as_str(), error = %err, "Operation rejected");
            }
            err
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use groupbuy_core::types::SellerId;
    use groupbuy_testing::{helpers, test_clock};

    fn delivered(now: DateTime<Utc>) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            deal_id: DealId::new(),
            offer_id: OfferId::new(),
            buyer_id: BuyerId::new(),
            qty: 1,
            status: ReservationStatus::Delivered,
            amount_goods: Money::won(10_000),
            amount_shipping: Money::ZERO,
            amount_total: Money::won(10_000),
            created_at: now,
            expires_at: now,
            paid_at: Some(now),
            shipped_at: Some(now),
            delivered_at: Some(now),
            cancelled_at: None,
            expired_at: None,
            tracking_number: None,
            refunded_qty: 0,
            refunded_amount_total: Money::ZERO,
            points_awarded: 20,
            points_revoked: 0,
            idempotency_key: None,
            version: 3,
        }
    }

    #[test]
    fn ownership_guards() {
        let now = test_clock().now();
        let offer = helpers::offer(1, now);
        let r = delivered(now);

        assert!(ensure_buyer(&Actor::Buyer(r.buyer_id), &r, "pay").is_ok());
        assert!(ensure_buyer(&Actor::System, &r, "pay").is_ok());
        let err = ensure_buyer(&Actor::Buyer(BuyerId::new()), &r, "pay").unwrap_err();
        assert_eq!(err.conflict_code(), Some(ConflictCode::NotOwned));

        assert!(ensure_seller(&Actor::Seller(offer.seller_id), &offer, &r, "ship").is_ok());
        assert!(ensure_seller(&Actor::Seller(SellerId::new()), &offer, &r, "ship").is_err());
        assert!(ensure_seller(&Actor::Buyer(r.buyer_id), &offer, &r, "ship").is_err());

        assert!(ensure_party(&Actor::Buyer(r.buyer_id), &offer, &r, "cancel").is_ok());
        assert!(ensure_party(&Actor::Seller(offer.seller_id), &offer, &r, "cancel").is_ok());
    }

    #[test]
    fn cancel_window_rules() {
        let now = test_clock().now();
        let r = delivered(now);
        let base = helpers::offer(1, now);

        let err = check_cancel_window(&base, &r, now).unwrap_err();
        assert_eq!(
            err.conflict_code(),
            Some(ConflictCode::CancelNotAllowedAfterShipped)
        );
        assert_eq!(err.to_string(), "cannot cancel: already DELIVERED");

        let within = base.clone().with_cancel_rule(CancelRule::WithinDaysAfterDelivery { days: 3 });
        assert!(check_cancel_window(&within, &r, now + Duration::days(3)).is_ok());
        let err = check_cancel_window(&within, &r, now + Duration::days(4)).unwrap_err();
        assert_eq!(err.conflict_code(), Some(ConflictCode::CancelPeriodExpired));

        let mut paid = r;
        paid.status = ReservationStatus::Paid;
        assert!(check_cancel_window(&base, &paid, now).is_ok());
    }

    #[test]
    fn idempotency_record_snapshots_the_response() {
        let now = test_clock().now();
        let r = delivered(now);
        let idem = Idempotency::new(Some("k-1"), "pay", "fp".into()).unwrap();
        let record = idem.record(&r, now).unwrap();
        assert_eq!(record.key, "k-1");
        assert_eq!(record.operation, "pay");
        let back: Reservation = serde_json::from_value(record.response).unwrap();
        assert_eq!(back, r);

        assert!(Idempotency::new(None, "pay", "fp".into()).is_none());
    }
}
