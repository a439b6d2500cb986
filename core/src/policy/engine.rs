//! Pure policy functions. No I/O, no clock: `now` is always an argument.

use super::{BASIS_POINTS, PolicyBundle, SellerLevelRule};
use crate::error::{ConflictCode, EngineError};
use crate::types::{Actor, Money, Reservation, ReservationStatus, SellerStats};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a reservation stands relative to shipping and the cooling window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingState {
    /// Not shipped yet
    BeforeShipping,
    /// In transit
    ShippedNotDelivered,
    /// Delivered, window open
    WithinCooling,
    /// Delivered, window closed
    AfterCooling,
}

/// What caused a refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundTrigger {
    /// Buyer changed their mind
    BuyerCancel,
    /// Seller cannot fulfil
    SellerCancel,
    /// Operator override
    AdminForce,
    /// Platform failure
    SystemError,
    /// Outcome of a dispute
    DisputeResolve,
}

impl RefundTrigger {
    /// Default trigger for an actor
    #[must_use]
    pub const fn for_actor(actor: &Actor) -> Self {
        match actor {
            Actor::Buyer(_) => Self::BuyerCancel,
            Actor::Seller(_) => Self::SellerCancel,
            Actor::Admin(_) => Self::AdminForce,
            Actor::System => Self::SystemError,
        }
    }

    /// Party at fault
    #[must_use]
    pub const fn fault_party(self) -> FaultParty {
        match self {
            Self::BuyerCancel => FaultParty::Buyer,
            Self::SellerCancel => FaultParty::Seller,
            Self::AdminForce | Self::SystemError => FaultParty::System,
            Self::DisputeResolve => FaultParty::Dispute,
        }
    }
}

/// Party whose action triggered a refund.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultParty {
    /// Buyer
    Buyer,
    /// Seller
    Seller,
    /// Platform
    System,
    /// Dispute outcome
    Dispute,
}

/// Party absorbing a fee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeBearer {
    /// Buyer
    Buyer,
    /// Seller
    Seller,
    /// Platform
    Platform,
}

/// Whether the seller has already been paid for the reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    /// No payout yet
    NotSettled,
    /// Payout done
    SettledToSeller,
}

/// Inputs to a refund decision.
#[derive(Clone, Copy, Debug)]
pub struct RefundContext<'a> {
    /// Reservation being refunded
    pub reservation: &'a Reservation,
    /// Units to refund
    pub quantity: u32,
    /// Cause
    pub trigger: RefundTrigger,
    /// Payout state
    pub settlement: SettlementState,
    /// Evaluation time
    pub now: DateTime<Utc>,
}

/// Refund amounts and fee allocation. Preview and execution both produce
/// this from the same inputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundDecision {
    /// Units refunded by this decision
    pub quantity: u32,
    /// Cause
    pub trigger: RefundTrigger,
    /// Party at fault
    pub fault: FaultParty,
    /// Cooling state at evaluation time
    pub cooling: CoolingState,
    /// Payout state at evaluation time
    pub settlement: SettlementState,
    /// Goods portion
    pub goods_amount: Money,
    /// Shipping portion
    pub shipping_amount: Money,
    /// Total returned to the buyer
    pub amount_total: Money,
    /// Whether shipping is refunded
    pub refund_shipping: bool,
    /// Who absorbs the gateway fee
    pub pg_fee_bearer: FeeBearer,
    /// Who absorbs the platform commission
    pub platform_fee_bearer: FeeBearer,
    /// Refund through the payment gateway
    pub use_pg_refund: bool,
    /// Amount to claw back from an already-paid seller
    pub settlement_recovery: Money,
    /// Points to reverse (positive number)
    pub points_reversal: i64,
    /// `refunded_qty` after applying
    pub refunded_qty_after: u32,
    /// Every unit refunded after applying
    pub fully_refunded: bool,
}

/// Fee split of a settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAmounts {
    /// Buyer payment net of refunds
    pub buyer_paid: Money,
    /// Gateway fee
    pub pg_fee: Money,
    /// Platform commission
    pub platform_commission: Money,
    /// Due to the seller
    pub seller_payout: Money,
}

/// Buyer trust tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustTier {
    /// Tier name
    pub name: String,
    /// Deposit in basis points
    pub deposit_rate_bp: u32,
    /// Participation restricted
    pub restricted: bool,
}

/// Policy decisions over one bundle snapshot.
#[derive(Clone, Copy, Debug)]
pub struct PolicyEngine<'a> {
    bundle: &'a PolicyBundle,
}

fn apply_bp(amount: Money, rate_bp: u32) -> Money {
    let scaled = i128::from(amount.amount()) * i128::from(rate_bp) / i128::from(BASIS_POINTS);
    Money::won(i64::try_from(scaled).unwrap_or(i64::MAX))
}

impl<'a> PolicyEngine<'a> {
    /// Engine over `bundle`.
    #[must_use]
    pub const fn new(bundle: &'a PolicyBundle) -> Self {
        Self { bundle }
    }

    /// Hold duration for a request, or `None` if out of range.
    #[must_use]
    pub fn hold_duration(&self, requested_minutes: Option<u32>) -> Option<Duration> {
        let t = &self.bundle.time;
        let minutes = requested_minutes.unwrap_or(t.reservation_hold_minutes);
        (1..=t.max_hold_minutes)
            .contains(&minutes)
            .then(|| Duration::minutes(i64::from(minutes)))
    }

    /// End of the cooling window for a delivery time.
    #[must_use]
    pub fn cooling_ends_at(&self, delivered_at: DateTime<Utc>) -> DateTime<Utc> {
        delivered_at + Duration::days(i64::from(self.bundle.time.cooling_days))
    }

    /// Earliest payout: cooling end plus the payout delay.
    #[must_use]
    pub fn scheduled_payout_at(&self, delivered_at: DateTime<Utc>) -> DateTime<Utc> {
        self.cooling_ends_at(delivered_at)
            + Duration::days(i64::from(self.bundle.time.payout_delay_days))
    }

    /// Cooling state of a reservation, driven by its status.
    #[must_use]
    pub fn cooling_state(&self, reservation: &Reservation, now: DateTime<Utc>) -> CoolingState {
        match reservation.status {
            ReservationStatus::Shipped => CoolingState::ShippedNotDelivered,
            ReservationStatus::Delivered => match reservation.delivered_at {
                Some(at) if now > self.cooling_ends_at(at) => CoolingState::AfterCooling,
                _ => CoolingState::WithinCooling,
            },
            _ => CoolingState::BeforeShipping,
        }
    }

    /// Lowest-commission level the seller qualifies for.
    #[must_use]
    pub fn seller_level(&self, stats: SellerStats) -> Option<&'a SellerLevelRule> {
        let bundle: &'a PolicyBundle = self.bundle;
        let rating = stats.rating.unwrap_or(0.0);
        bundle
            .fees
            .seller_levels
            .iter()
            .filter(|level| {
                stats.completed_sales >= level.min_orders
                    && level.max_orders.is_none_or(|max| stats.completed_sales <= max)
                    && level.min_rating.is_none_or(|min| rating >= min)
            })
            .min_by_key(|level| level.commission_rate_bp)
    }

    /// Commission rate for a seller, clamped to the policy floor and ceiling.
    #[must_use]
    pub fn commission_rate_bp(&self, stats: SellerStats) -> u32 {
        let fees = &self.bundle.fees;
        let rate = self.seller_level(stats).map_or(
            fees.seller_levels
                .iter()
                .map(|level| level.commission_rate_bp)
                .max()
                .unwrap_or(fees.commission_ceiling_bp),
            |level| level.commission_rate_bp,
        );
        rate.clamp(fees.commission_floor_bp, fees.commission_ceiling_bp)
    }

    /// Split a buyer payment into gateway fee, commission and payout.
    #[must_use]
    pub fn settlement_amounts(&self, buyer_paid: Money, commission_rate_bp: u32) -> SettlementAmounts {
        let buyer_paid = buyer_paid.non_negative();
        let pg_fee = apply_bp(buyer_paid, self.bundle.fees.pg_fee_rate_bp);
        let platform_commission = apply_bp(buyer_paid, commission_rate_bp);
        SettlementAmounts {
            buyer_paid,
            pg_fee,
            platform_commission,
            seller_payout: (buyer_paid - pg_fee - platform_commission).non_negative(),
        }
    }

    /// Grade name for a buyer points balance.
    #[must_use]
    pub fn buyer_grade(&self, points: i64) -> &'a str {
        let bundle: &'a PolicyBundle = self.bundle;
        let grades = &bundle.points.buyer_grades;
        grades
            .iter()
            .filter(|g| points >= g.min_points)
            .max_by_key(|g| g.min_points)
            .or_else(|| grades.iter().min_by_key(|g| g.min_points))
            .map_or("", |g| g.name.as_str())
    }

    /// Trust tier from participation history.
    #[must_use]
    pub fn trust_tier(&self, participations: u32, fulfillments: u32) -> TrustTier {
        let trust = &self.bundle.trust;
        let rate_bp = if participations == 0 {
            0
        } else {
            let rate = u64::from(fulfillments.min(participations)) * u64::from(BASIS_POINTS)
                / u64::from(participations);
            u32::try_from(rate).unwrap_or(BASIS_POINTS)
        };

        if participations >= trust.restricted.min_participations
            && rate_bp <= trust.restricted.max_fulfillment_bp
        {
            return TrustTier {
                name: trust.restricted.name.clone(),
                deposit_rate_bp: trust.restricted.deposit_rate_bp,
                restricted: true,
            };
        }

        trust
            .tiers
            .iter()
            .find(|t| participations >= t.min_participations && rate_bp >= t.min_fulfillment_bp)
            .or_else(|| trust.tiers.last())
            .map_or_else(
                || TrustTier {
                    name: trust.restricted.name.clone(),
                    deposit_rate_bp: trust.restricted.deposit_rate_bp,
                    restricted: false,
                },
                |t| TrustTier {
                    name: t.name.clone(),
                    deposit_rate_bp: t.deposit_rate_bp,
                    restricted: false,
                },
            )
    }

    /// Deposit owed on `amount` by a buyer with this history.
    #[must_use]
    pub fn deposit_amount(&self, amount: Money, participations: u32, fulfillments: u32) -> Money {
        apply_bp(amount, self.trust_tier(participations, fulfillments).deposit_rate_bp)
    }

    /// Points to reverse when `refunded_before..refunded_after` of `qty`
    /// units are refunded.
    ///
    /// Cumulative reversal after `k` units is `floor(awarded * k / qty)`, so
    /// the total across any sequence of partial refunds is exactly
    /// `awarded` once every unit is refunded.
    #[must_use]
    pub fn points_reversal(awarded: i64, qty: u32, refunded_before: u32, refunded_after: u32) -> i64 {
        if qty == 0 || awarded <= 0 {
            return 0;
        }
        let cumulative = |k: u32| awarded * i64::from(k.min(qty)) / i64::from(qty);
        cumulative(refunded_after) - cumulative(refunded_before)
    }

    /// Decide a refund: amounts, shipping gate, fee burden and points.
    ///
    /// # Errors
    ///
    /// - `INVALID_QUANTITY` if `quantity` is zero
    /// - `REFUND_QUANTITY_EXCEEDED` if it exceeds the unrefunded units
    /// - `REFUND_NOT_ALLOWED` if refunds are disabled or the buyer asks
    ///   after the cooling window closed
    pub fn refund_decision(&self, ctx: RefundContext<'_>) -> Result<RefundDecision, EngineError> {
        let policy = &self.bundle.refund;
        let r = ctx.reservation;

        if !policy.enabled {
            return Err(EngineError::conflict(
                ConflictCode::RefundNotAllowed,
                "refund not allowed: refunds are disabled by policy",
            ));
        }
        if ctx.quantity == 0 {
            return Err(EngineError::conflict(
                ConflictCode::InvalidQuantity,
                "refund quantity must be > 0",
            ));
        }
        if ctx.quantity > r.remaining_qty() {
            return Err(EngineError::conflict(
                ConflictCode::RefundQuantityExceeded,
                format!(
                    "refund quantity {} exceeds refundable {} (qty={}, refunded={})",
                    ctx.quantity,
                    r.remaining_qty(),
                    r.qty,
                    r.refunded_qty
                ),
            ));
        }

        let cooling = self.cooling_state(r, ctx.now);
        let fault = ctx.trigger.fault_party();
        if fault == FaultParty::Buyer && cooling == CoolingState::AfterCooling {
            return Err(EngineError::conflict(
                ConflictCode::RefundNotAllowed,
                "refund not allowed: cooling period has ended",
            ));
        }

        let refund_shipping = match cooling {
            CoolingState::BeforeShipping => true,
            CoolingState::ShippedNotDelivered | CoolingState::WithinCooling => {
                ctx.trigger != RefundTrigger::BuyerCancel
            }
            CoolingState::AfterCooling => ctx.trigger == RefundTrigger::DisputeResolve,
        };

        let refunded_qty_after = r.refunded_qty + ctx.quantity;
        let units = r.refunded_qty..refunded_qty_after;
        let allocate = |total: Money| {
            Money::won(policy.rounding.allocate(
                total.amount(),
                r.qty,
                policy.remainder_strategy,
                units.clone(),
            ))
        };
        let goods_amount = allocate(r.amount_goods);
        let shipping_amount = if refund_shipping {
            allocate(r.amount_shipping)
        } else {
            Money::ZERO
        };
        let amount_total = goods_amount + shipping_amount;

        let bearer = match fault {
            FaultParty::Buyer => FeeBearer::Buyer,
            FaultParty::Seller => FeeBearer::Seller,
            FaultParty::System | FaultParty::Dispute => FeeBearer::Platform,
        };
        let settled = ctx.settlement == SettlementState::SettledToSeller;

        Ok(RefundDecision {
            quantity: ctx.quantity,
            trigger: ctx.trigger,
            fault,
            cooling,
            settlement: ctx.settlement,
            goods_amount,
            shipping_amount,
            amount_total,
            refund_shipping,
            pg_fee_bearer: bearer,
            platform_fee_bearer: bearer,
            use_pg_refund: !settled,
            settlement_recovery: if settled { amount_total } else { Money::ZERO },
            points_reversal: Self::points_reversal(
                r.points_awarded,
                r.qty,
                r.refunded_qty,
                refunded_qty_after,
            ),
            refunded_qty_after,
            fully_refunded: refunded_qty_after == r.qty,
        })
    }
}
