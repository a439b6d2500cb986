//! Domain types for offers, reservations, settlements and the audit log.
//!
//! Identifiers are UUID newtypes. Money is an integer amount of the single
//! settlement currency's minor unit (won), so no floating point ever touches
//! an amount. Quantities are `u32`; counter deltas are signed `i64`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a group-buy deal
    DealId
);
uuid_id!(
    /// Unique identifier for a seller offer
    OfferId
);
uuid_id!(
    /// Unique identifier for a reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for a seller settlement
    SettlementId
);
uuid_id!(
    /// Unique identifier for a buyer
    BuyerId
);
uuid_id!(
    /// Unique identifier for a seller
    SellerId
);
uuid_id!(
    /// Unique identifier for an operator with administrative privileges
    AdminId
);

// ============================================================================
// Money
// ============================================================================

/// Amount in the settlement currency's minor unit.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Create from a whole number of won
    #[must_use]
    pub const fn won(amount: i64) -> Self {
        Self(amount)
    }

    /// Raw amount
    #[must_use]
    pub const fn amount(self) -> i64 {
        self.0
    }

    /// Multiply by a quantity
    #[must_use]
    pub const fn times(self, qty: u32) -> Self {
        Self(self.0 * qty as i64)
    }

    /// True if the amount is zero
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Clamp negative amounts to zero
    #[must_use]
    pub const fn non_negative(self) -> Self {
        if self.0 < 0 { Self(0) } else { self }
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "₩{}", self.0)
    }
}

// ============================================================================
// Actors
// ============================================================================

/// Who is performing an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A buyer acting on their own reservation
    Buyer(BuyerId),
    /// A seller acting on reservations against their offers
    Seller(SellerId),
    /// Privileged operator
    Admin(AdminId),
    /// Background jobs (sweeper, batcher)
    System,
}

impl Actor {
    /// Actor type as stored in the audit log
    #[must_use]
    pub const fn actor_type(&self) -> &'static str {
        match self {
            Self::Buyer(_) => "buyer",
            Self::Seller(_) => "seller",
            Self::Admin(_) => "admin",
            Self::System => "system",
        }
    }

    /// Actor id as stored in the audit log
    #[must_use]
    pub fn actor_id(&self) -> Option<String> {
        match self {
            Self::Buyer(id) => Some(id.to_string()),
            Self::Seller(id) => Some(id.to_string()),
            Self::Admin(id) => Some(id.to_string()),
            Self::System => None,
        }
    }

    /// True for admin and system actors
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        matches!(self, Self::Admin(_) | Self::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actor_id() {
            Some(id) => write!(f, "{}:{id}", self.actor_type()),
            None => f.write_str(self.actor_type()),
        }
    }
}

// ============================================================================
// Offer
// ============================================================================

/// How shipping is charged on a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShippingMode {
    /// Shipping is part of the price
    Included,
    /// One shipping fee per reservation regardless of quantity
    PerReservation,
    /// Shipping fee multiplied by quantity
    PerQty,
}

impl ShippingMode {
    /// Shipping charged for `qty` units
    #[must_use]
    pub const fn shipping_amount(self, fee: Money, qty: u32) -> Money {
        match self {
            Self::Included => Money::ZERO,
            Self::PerReservation => fee,
            Self::PerQty => fee.times(qty),
        }
    }

    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Included => "INCLUDED",
            Self::PerReservation => "PER_RESERVATION",
            Self::PerQty => "PER_QTY",
        }
    }

    /// Parse from the database representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCLUDED" => Some(Self::Included),
            "PER_RESERVATION" => Some(Self::PerReservation),
            "PER_QTY" => Some(Self::PerQty),
            _ => None,
        }
    }
}

/// Offer-level rule for buyer cancellation of a paid reservation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelRule {
    /// Buyer may cancel until the seller ships
    #[default]
    UntilShipped,
    /// Buyer may never cancel once the item is on its way
    NoCancelAfterShipping,
    /// Buyer may cancel until `days` after delivery
    WithinDaysAfterDelivery {
        /// Window length in days
        days: u32,
    },
}

impl CancelRule {
    /// Database representation of the rule kind
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UntilShipped => "UNTIL_SHIPPED",
            Self::NoCancelAfterShipping => "NO_CANCEL_AFTER_SHIPPING",
            Self::WithinDaysAfterDelivery { .. } => "WITHIN_DAYS_AFTER_DELIVERY",
        }
    }

    /// Window length, if the rule has one
    #[must_use]
    pub const fn days(&self) -> Option<u32> {
        match self {
            Self::WithinDaysAfterDelivery { days } => Some(*days),
            _ => None,
        }
    }

    /// Rebuild from the stored kind and optional day count
    #[must_use]
    pub fn from_parts(kind: &str, days: Option<u32>) -> Option<Self> {
        match (kind, days) {
            ("UNTIL_SHIPPED", _) => Some(Self::UntilShipped),
            ("NO_CANCEL_AFTER_SHIPPING", _) => Some(Self::NoCancelAfterShipping),
            ("WITHIN_DAYS_AFTER_DELIVERY", Some(days)) => {
                Some(Self::WithinDaysAfterDelivery { days })
            }
            _ => None,
        }
    }
}

/// A seller's sellable quantity and price for a deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier
    pub id: OfferId,
    /// Deal this offer belongs to
    pub deal_id: DealId,
    /// Owning seller
    pub seller_id: SellerId,
    /// Unit price
    pub price: Money,
    /// Total sellable quantity
    pub capacity: u32,
    /// Quantity held by PENDING reservations
    pub reserved_qty: u32,
    /// Quantity paid and not refunded
    pub sold_qty: u32,
    /// Shipping charge mode
    pub shipping_mode: ShippingMode,
    /// Shipping fee (interpreted per `shipping_mode`)
    pub shipping_fee: Money,
    /// Buyer cancellation rule
    pub cancel_rule: CancelRule,
    /// Whether new reservations are accepted
    pub is_active: bool,
    /// Set once `sold_qty` first reaches `capacity`; never reset
    pub is_confirmed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optional cutoff for new reservations
    pub deadline_at: Option<DateTime<Utc>>,
}

impl Offer {
    /// Create an active offer with default shipping and cancel rules.
    #[must_use]
    pub fn new(
        deal_id: DealId,
        seller_id: SellerId,
        price: Money,
        capacity: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OfferId::new(),
            deal_id,
            seller_id,
            price,
            capacity,
            reserved_qty: 0,
            sold_qty: 0,
            shipping_mode: ShippingMode::Included,
            shipping_fee: Money::ZERO,
            cancel_rule: CancelRule::default(),
            is_active: true,
            is_confirmed: false,
            created_at,
            deadline_at: None,
        }
    }

    /// Set the shipping mode and fee
    #[must_use]
    pub const fn with_shipping(mut self, mode: ShippingMode, fee: Money) -> Self {
        self.shipping_mode = mode;
        self.shipping_fee = fee;
        self
    }

    /// Set the cancel rule
    #[must_use]
    pub const fn with_cancel_rule(mut self, rule: CancelRule) -> Self {
        self.cancel_rule = rule;
        self
    }

    /// Set the reservation deadline
    #[must_use]
    pub const fn with_deadline(mut self, deadline_at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }

    /// Units neither held nor sold
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.reserved_qty + self.sold_qty)
    }

    /// `reserved_qty + sold_qty <= capacity`
    #[must_use]
    pub const fn within_capacity(&self) -> bool {
        self.reserved_qty as u64 + self.sold_qty as u64 <= self.capacity as u64
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Coarse lifecycle phase of a reservation.
///
/// This is the single authoritative state. Timestamps record when each
/// transition happened but are never consulted to infer the phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Holding capacity, awaiting payment
    Pending,
    /// Paid, awaiting shipment
    Paid,
    /// Shipped by the seller
    Shipped,
    /// Arrival confirmed by the buyer
    Delivered,
    /// Cancelled or fully refunded
    Cancelled,
    /// Hold timed out before payment
    Expired,
}

impl ReservationStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse from the database representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PAID" => Some(Self::Paid),
            "SHIPPED" => Some(Self::Shipped),
            "DELIVERED" => Some(Self::Delivered),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Paid and not cancelled: the reservation holds sold units.
    #[must_use]
    pub const fn is_paid(&self) -> bool {
        matches!(self, Self::Paid | Self::Shipped | Self::Delivered)
    }

    /// No further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buyer's time-boxed claim on offer quantity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Deal identifier
    pub deal_id: DealId,
    /// Offer the quantity is claimed against
    pub offer_id: OfferId,
    /// Owning buyer
    pub buyer_id: BuyerId,
    /// Claimed quantity
    pub qty: u32,
    /// Current lifecycle phase
    pub status: ReservationStatus,
    /// Goods amount snapshot (`price * qty`)
    pub amount_goods: Money,
    /// Shipping amount snapshot
    pub amount_shipping: Money,
    /// Total charged
    pub amount_total: Money,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Hold deadline
    pub expires_at: DateTime<Utc>,
    /// Paid
    pub paid_at: Option<DateTime<Utc>>,
    /// Shipped
    pub shipped_at: Option<DateTime<Utc>>,
    /// Arrival confirmed
    pub delivered_at: Option<DateTime<Utc>>,
    /// Cancelled or fully refunded
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Expired
    pub expired_at: Option<DateTime<Utc>>,
    /// Carrier tracking reference
    pub tracking_number: Option<String>,
    /// Units refunded so far
    pub refunded_qty: u32,
    /// Money refunded so far
    pub refunded_amount_total: Money,
    /// Points awarded on payment
    pub points_awarded: i64,
    /// Points reversed by refunds so far
    pub points_revoked: i64,
    /// Idempotency key of the creating request
    pub idempotency_key: Option<String>,
    /// Optimistic concurrency version, bumped on every update
    pub version: u64,
}

impl Reservation {
    /// Units not yet refunded
    #[must_use]
    pub const fn remaining_qty(&self) -> u32 {
        self.qty.saturating_sub(self.refunded_qty)
    }

    /// `refunded_qty == qty`
    #[must_use]
    pub const fn is_fully_refunded(&self) -> bool {
        self.refunded_qty >= self.qty
    }

    /// PENDING and past its hold deadline
    #[must_use]
    pub fn is_due_to_expire(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.expires_at <= now
    }

    /// Money paid and not yet refunded
    #[must_use]
    pub fn net_paid(&self) -> Money {
        (self.amount_total - self.refunded_amount_total).non_negative()
    }

    /// Copy with the next version number, ready to be written back.
    #[must_use]
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// Display phase combining status, refund ledger and cooling window.
    #[must_use]
    pub fn phase(&self, now: DateTime<Utc>, cooling_days: u32) -> ReservationPhase {
        match self.status {
            ReservationStatus::Pending if self.expires_at <= now => {
                ReservationPhase::PendingExpired
            }
            ReservationStatus::Pending => ReservationPhase::Pending,
            ReservationStatus::Paid => ReservationPhase::PaidWaitShip,
            ReservationStatus::Shipped => ReservationPhase::Shipped,
            ReservationStatus::Delivered => match self.delivered_at {
                Some(at) if now > at + Duration::days(i64::from(cooling_days)) => {
                    ReservationPhase::DeliveredAfterCooling
                }
                _ => ReservationPhase::DeliveredCooling,
            },
            ReservationStatus::Cancelled if self.refunded_qty > 0 => {
                ReservationPhase::FullyRefunded
            }
            ReservationStatus::Cancelled => ReservationPhase::Cancelled,
            ReservationStatus::Expired => ReservationPhase::Expired,
        }
    }
}

/// Fine-grained phase for display and reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationPhase {
    /// Awaiting payment
    Pending,
    /// Awaiting payment but past the hold deadline
    PendingExpired,
    /// Paid, not yet shipped
    PaidWaitShip,
    /// In transit
    Shipped,
    /// Delivered, refund window open
    DeliveredCooling,
    /// Delivered, refund window closed
    DeliveredAfterCooling,
    /// Every unit refunded
    FullyRefunded,
    /// Cancelled before payment
    Cancelled,
    /// Timed out
    Expired,
}

// ============================================================================
// Settlement
// ============================================================================

/// Settlement payout status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    /// Created on delivery, awaiting approval
    Ready,
    /// Approved, waiting for its payout time
    Approved,
    /// Paid out to the seller
    Paid,
    /// Held for manual intervention
    Blocked,
}

impl SettlementStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Approved => "APPROVED",
            Self::Paid => "PAID",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Parse from the database representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "APPROVED" => Some(Self::Approved),
            "PAID" => Some(Self::Paid),
            "BLOCKED" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block reason recorded when every unit of a reservation was refunded
/// before payout.
pub const BLOCK_REASON_FULLY_REFUNDED: &str = "FULLY_REFUNDED";

/// One payable record per delivered reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSettlement {
    /// Settlement identifier
    pub id: SettlementId,
    /// Reservation being settled (unique)
    pub reservation_id: ReservationId,
    /// Offer the reservation was against
    pub offer_id: OfferId,
    /// Seller receiving the payout
    pub seller_id: SellerId,
    /// Money the buyer paid, net of refunds
    pub buyer_paid_amount: Money,
    /// Payment gateway fee
    pub pg_fee_amount: Money,
    /// Platform commission
    pub platform_commission_amount: Money,
    /// Amount due to the seller
    pub seller_payout_amount: Money,
    /// Commission rate applied, in basis points
    pub commission_rate_bp: u32,
    /// Payout status
    pub status: SettlementStatus,
    /// Created
    pub created_at: DateTime<Utc>,
    /// Approved
    pub approved_at: Option<DateTime<Utc>>,
    /// Paid out
    pub paid_at: Option<DateTime<Utc>>,
    /// Earliest payout time
    pub scheduled_payout_at: DateTime<Utc>,
    /// Why the settlement is blocked
    pub block_reason: Option<String>,
}

// ============================================================================
// Event log and points
// ============================================================================

/// Kind of audit event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Reservation created
    ReservationCreated,
    /// Reservation paid
    ReservationPaid,
    /// Reservation expired
    ReservationExpired,
    /// Reservation cancelled
    ReservationCancelled,
    /// Reservation shipped
    ReservationShipped,
    /// Arrival confirmed
    ReservationDelivered,
    /// Partial or full refund
    ReservationRefunded,
    /// Offer sold out for the first time
    OfferConfirmed,
    /// Settlement created
    SettlementCreated,
    /// Settlement approved
    SettlementApproved,
    /// Settlement paid out
    SettlementPaid,
    /// Settlement re-priced after a refund
    SettlementAdjusted,
    /// Settlement blocked
    SettlementBlocked,
    /// Settlement released from a block
    SettlementUnblocked,
    /// Payout batch start/end marker
    SettlementBatch,
}

impl EventType {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReservationCreated => "RESERVATION_CREATED",
            Self::ReservationPaid => "RESERVATION_PAID",
            Self::ReservationExpired => "RESERVATION_EXPIRED",
            Self::ReservationCancelled => "RESERVATION_CANCELLED",
            Self::ReservationShipped => "RESERVATION_SHIPPED",
            Self::ReservationDelivered => "RESERVATION_DELIVERED",
            Self::ReservationRefunded => "RESERVATION_REFUNDED",
            Self::OfferConfirmed => "OFFER_CONFIRMED",
            Self::SettlementCreated => "SETTLEMENT_CREATED",
            Self::SettlementApproved => "SETTLE_APPROVE",
            Self::SettlementPaid => "SETTLE_PAID",
            Self::SettlementAdjusted => "SETTLEMENT_ADJUSTED",
            Self::SettlementBlocked => "SETTLEMENT_BLOCKED",
            Self::SettlementUnblocked => "SETTLEMENT_UNBLOCKED",
            Self::SettlementBatch => "SETTLE_BATCH",
        }
    }

    /// Parse from the database representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::ReservationCreated,
            Self::ReservationPaid,
            Self::ReservationExpired,
            Self::ReservationCancelled,
            Self::ReservationShipped,
            Self::ReservationDelivered,
            Self::ReservationRefunded,
            Self::OfferConfirmed,
            Self::SettlementCreated,
            Self::SettlementApproved,
            Self::SettlementPaid,
            Self::SettlementAdjusted,
            Self::SettlementBlocked,
            Self::SettlementUnblocked,
            Self::SettlementBatch,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

/// Append-only audit record.
///
/// The unique `idempotency_key` doubles as the dedup ledger for retried
/// operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    /// Event kind
    pub event_type: EventType,
    /// `buyer` / `seller` / `admin` / `system`
    pub actor_type: String,
    /// Actor identifier, if any
    pub actor_id: Option<String>,
    /// Free-form reason
    pub reason: Option<String>,
    /// Unique key
    pub idempotency_key: String,
    /// Structured payload
    pub meta: serde_json::Value,
    /// Related reservation
    pub reservation_id: Option<ReservationId>,
    /// Related offer
    pub offer_id: Option<OfferId>,
    /// Related settlement
    pub settlement_id: Option<SettlementId>,
    /// Written at
    pub created_at: DateTime<Utc>,
}

impl EventLog {
    /// Start an event with an empty payload.
    #[must_use]
    pub fn new(
        event_type: EventType,
        actor: &Actor,
        idempotency_key: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            actor_type: actor.actor_type().to_string(),
            actor_id: actor.actor_id(),
            reason: None,
            idempotency_key: idempotency_key.into(),
            meta: serde_json::Value::Null,
            reservation_id: None,
            offer_id: None,
            settlement_id: None,
            created_at,
        }
    }

    /// Attach a reason
    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    /// Attach a payload
    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    /// Attach the reservation and its offer
    #[must_use]
    pub const fn for_reservation(mut self, reservation_id: ReservationId, offer_id: OfferId) -> Self {
        self.reservation_id = Some(reservation_id);
        self.offer_id = Some(offer_id);
        self
    }

    /// Attach the settlement and its reservation
    #[must_use]
    pub const fn for_settlement(
        mut self,
        settlement_id: SettlementId,
        reservation_id: ReservationId,
    ) -> Self {
        self.settlement_id = Some(settlement_id);
        self.reservation_id = Some(reservation_id);
        self
    }

    /// Attach the offer
    #[must_use]
    pub const fn for_offer(mut self, offer_id: OfferId) -> Self {
        self.offer_id = Some(offer_id);
        self
    }
}

/// Owner of a points balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PointHolder {
    /// Buyer balance
    Buyer(BuyerId),
    /// Seller balance
    Seller(SellerId),
}

impl PointHolder {
    /// Database representation of the holder type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Buyer(_) => "buyer",
            Self::Seller(_) => "seller",
        }
    }

    /// Holder identifier
    #[must_use]
    pub const fn id(&self) -> Uuid {
        match self {
            Self::Buyer(id) => *id.as_uuid(),
            Self::Seller(id) => *id.as_uuid(),
        }
    }
}

/// Append-only points ledger entry. Balances are sums of entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointEntry {
    /// Who the points belong to
    pub holder: PointHolder,
    /// Signed amount
    pub amount: i64,
    /// Human-readable reason
    pub reason: String,
    /// Unique key, e.g. `pt:paid:{reservation_id}`
    pub idempotency_key: String,
    /// Written at
    pub created_at: DateTime<Utc>,
}

/// Seller history used to resolve the commission level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerStats {
    /// Delivered reservations across all of the seller's offers
    pub completed_sales: u64,
    /// Adjusted rating, when the review collaborator provides one
    pub rating: Option<f64>,
}
