//! Business policy: fee rates, time windows, rounding, points and trust tiers.
//!
//! A [`PolicyBundle`] is a typed, validated snapshot of every tunable the
//! engine consults. Components never read policy from globals; they hold a
//! [`PolicyHandle`] and take an `Arc` snapshot per operation, so one
//! operation always sees one consistent bundle even while a reload happens.
//!
//! # Example
//!
//! ```
//! use groupbuy_core::policy::{PolicyBundle, PolicyHandle};
//!
//! let handle = PolicyHandle::default();
//! assert_eq!(handle.current().time.cooling_days, 7);
//!
//! let mut next = PolicyBundle::default();
//! next.time.cooling_days = 14;
//! handle.reload(next).unwrap();
//! assert_eq!(handle.current().time.cooling_days, 14);
//! ```

mod engine;
mod rounding;

pub use engine::{
    CoolingState, FaultParty, FeeBearer, PolicyEngine, RefundContext, RefundDecision,
    RefundTrigger, SettlementAmounts, SettlementState, TrustTier,
};
pub use rounding::{RemainderStrategy, Rounding, RoundingMode};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// One basis point is 1/100 of a percent.
pub const BASIS_POINTS: u32 = 10_000;

/// Malformed or out-of-range policy configuration. Fatal at load time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyValidationError {
    /// Bundle could not be read.
    #[error("Failed to read policy bundle: {0}")]
    Io(String),

    /// Bundle is not valid JSON for the schema.
    #[error("Failed to parse policy bundle: {0}")]
    Parse(String),

    /// A field is out of range.
    #[error("Invalid policy field `{field}`: {reason}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> PolicyValidationError {
    PolicyValidationError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Time windows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimePolicy {
    /// Hold used when a request does not name one
    pub reservation_hold_minutes: u32,
    /// Longest hold a request may ask for
    pub max_hold_minutes: u32,
    /// Days after delivery during which buyer refunds are accepted
    pub cooling_days: u32,
    /// Days after cooling closes before a settlement may be paid
    pub payout_delay_days: u32,
}

impl Default for TimePolicy {
    fn default() -> Self {
        Self {
            reservation_hold_minutes: 5,
            max_hold_minutes: 1_440,
            cooling_days: 7,
            payout_delay_days: 30,
        }
    }
}

/// Commission level a seller qualifies for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SellerLevelRule {
    /// Display name, e.g. `Lv.3`
    pub name: String,
    /// Minimum completed sales
    pub min_orders: u64,
    /// Maximum completed sales, unbounded if absent
    pub max_orders: Option<u64>,
    /// Minimum adjusted rating, none required if absent
    pub min_rating: Option<f64>,
    /// Commission in basis points
    pub commission_rate_bp: u32,
}

impl SellerLevelRule {
    fn new(
        name: &str,
        min_orders: u64,
        max_orders: Option<u64>,
        min_rating: Option<f64>,
        commission_rate_bp: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_orders,
            max_orders,
            min_rating,
            commission_rate_bp,
        }
    }
}

/// Payment gateway fee and platform commission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeePolicy {
    /// Gateway fee in basis points of the buyer payment
    pub pg_fee_rate_bp: u32,
    /// Seller levels, any order
    pub seller_levels: Vec<SellerLevelRule>,
    /// Lowest commission ever charged
    pub commission_floor_bp: u32,
    /// Highest commission ever charged
    pub commission_ceiling_bp: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            pg_fee_rate_bp: 330,
            seller_levels: vec![
                SellerLevelRule::new("Lv.6", 0, Some(20), None, 350),
                SellerLevelRule::new("Lv.5", 21, Some(40), Some(4.0), 300),
                SellerLevelRule::new("Lv.4", 41, Some(60), Some(4.0), 280),
                SellerLevelRule::new("Lv.3", 61, Some(100), Some(4.0), 270),
                SellerLevelRule::new("Lv.2", 101, None, Some(4.0), 250),
                SellerLevelRule::new("Lv.1", 101, None, Some(4.5), 200),
            ],
            commission_floor_bp: 200,
            commission_ceiling_bp: 1_500,
        }
    }
}

/// Named grade reached at a points balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradeRule {
    /// Grade name
    pub name: String,
    /// Minimum balance
    pub min_points: i64,
}

/// Points awards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PointsPolicy {
    /// Buyer award per paid reservation
    pub buyer_paid: i64,
    /// Seller award when an offer sells out
    pub seller_offer_confirmed: i64,
    /// Buyer grades, any order
    pub buyer_grades: Vec<GradeRule>,
}

impl Default for PointsPolicy {
    fn default() -> Self {
        let grade = |name: &str, min_points| GradeRule {
            name: name.to_string(),
            min_points,
        };
        Self {
            buyer_paid: 20,
            seller_offer_confirmed: 30,
            buyer_grades: vec![
                grade("PLATINUM", 500),
                grade("GOLD", 201),
                grade("SILVER", 51),
                grade("BRONZE", 0),
            ],
        }
    }
}

/// Refund switches and rounding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefundPolicy {
    /// Master switch
    pub enabled: bool,
    /// Per-unit rounding
    pub rounding: Rounding,
    /// Which unit absorbs the rounding remainder
    pub remainder_strategy: RemainderStrategy,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            rounding: Rounding::default(),
            remainder_strategy: RemainderStrategy::GiveToLast,
        }
    }
}

/// Buyer trust tier by participation history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustTierRule {
    /// Tier name
    pub name: String,
    /// Minimum participations
    pub min_participations: u32,
    /// Minimum fulfillment rate in basis points
    pub min_fulfillment_bp: u32,
    /// Deposit in basis points of the order amount
    pub deposit_rate_bp: u32,
}

/// Tier for buyers who rarely complete what they join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestrictedTierRule {
    /// Tier name
    pub name: String,
    /// Participations before the restriction can apply
    pub min_participations: u32,
    /// Fulfillment rate at or below which the restriction applies
    pub max_fulfillment_bp: u32,
    /// Deposit in basis points
    pub deposit_rate_bp: u32,
}

/// Trust tiers and deposits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustPolicy {
    /// Regular tiers, most trusted first
    pub tiers: Vec<TrustTierRule>,
    /// Restricted tier, checked before the regular tiers
    pub restricted: RestrictedTierRule,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        let tier = |name: &str, min_participations, min_fulfillment_bp, deposit_rate_bp| {
            TrustTierRule {
                name: name.to_string(),
                min_participations,
                min_fulfillment_bp,
                deposit_rate_bp,
            }
        };
        Self {
            tiers: vec![
                tier("T1", 10, 9_500, 0),
                tier("T2", 0, 8_600, 500),
                tier("T3", 0, 6_100, 800),
                tier("T4", 0, 0, 1_000),
            ],
            restricted: RestrictedTierRule {
                name: "T5".to_string(),
                min_participations: 5,
                max_fulfillment_bp: 2_000,
                deposit_rate_bp: 1_000,
            },
        }
    }
}

/// Every tunable the engine consults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyBundle {
    /// Free-form version label for audit logs
    pub version: String,
    /// Time windows
    pub time: TimePolicy,
    /// Fees
    pub fees: FeePolicy,
    /// Points
    pub points: PointsPolicy,
    /// Refunds
    pub refund: RefundPolicy,
    /// Trust tiers
    pub trust: TrustPolicy,
}

impl Default for PolicyBundle {
    fn default() -> Self {
        Self {
            version: "default".to_string(),
            time: TimePolicy::default(),
            fees: FeePolicy::default(),
            points: PointsPolicy::default(),
            refund: RefundPolicy::default(),
            trust: TrustPolicy::default(),
        }
    }
}

impl PolicyBundle {
    /// Parse and validate a JSON bundle. Missing sections take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError`] on malformed JSON or out-of-range
    /// values.
    pub fn from_json_str(json: &str) -> Result<Self, PolicyValidationError> {
        let bundle: Self = serde_json::from_str(json)
            .map_err(|e| PolicyValidationError::Parse(e.to_string()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Read, parse and validate a JSON bundle from disk.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError`] if the file cannot be read or the
    /// bundle is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyValidationError> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PolicyValidationError::Io(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json_str(&json)
    }

    /// Pure engine over this bundle.
    #[must_use]
    pub const fn engine(&self) -> PolicyEngine<'_> {
        PolicyEngine::new(self)
    }

    /// Check every field is in range.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        self.validate_time()?;
        self.validate_fees()?;
        self.validate_points()?;
        self.refund.rounding.validate()?;
        self.validate_trust()
    }

    fn validate_time(&self) -> Result<(), PolicyValidationError> {
        let t = &self.time;
        if t.max_hold_minutes == 0 || t.max_hold_minutes > 10_080 {
            return Err(invalid("time.max_hold_minutes", "must be within 1..=10080"));
        }
        if t.reservation_hold_minutes == 0 || t.reservation_hold_minutes > t.max_hold_minutes {
            return Err(invalid(
                "time.reservation_hold_minutes",
                format!("must be within 1..={}", t.max_hold_minutes),
            ));
        }
        if t.cooling_days > 365 {
            return Err(invalid("time.cooling_days", "must be at most 365"));
        }
        if t.payout_delay_days > 365 {
            return Err(invalid("time.payout_delay_days", "must be at most 365"));
        }
        Ok(())
    }

    fn validate_fees(&self) -> Result<(), PolicyValidationError> {
        let f = &self.fees;
        if f.pg_fee_rate_bp > BASIS_POINTS {
            return Err(invalid("fees.pg_fee_rate_bp", "must be at most 10000"));
        }
        if f.commission_floor_bp > f.commission_ceiling_bp || f.commission_ceiling_bp > BASIS_POINTS
        {
            return Err(invalid(
                "fees.commission_ceiling_bp",
                "floor must not exceed ceiling, ceiling must be at most 10000",
            ));
        }
        if f.pg_fee_rate_bp + f.commission_ceiling_bp > BASIS_POINTS / 2 {
            return Err(invalid(
                "fees.pg_fee_rate_bp",
                format!(
                    "pg fee + commission ceiling too high: {} + {}",
                    f.pg_fee_rate_bp, f.commission_ceiling_bp
                ),
            ));
        }
        if f.seller_levels.is_empty() {
            return Err(invalid("fees.seller_levels", "at least one level is required"));
        }
        if !f.seller_levels.iter().any(|l| l.min_orders == 0 && l.min_rating.is_none()) {
            return Err(invalid(
                "fees.seller_levels",
                "one level must accept new sellers without a rating",
            ));
        }
        for level in &f.seller_levels {
            if level.max_orders.is_some_and(|max| max < level.min_orders) {
                return Err(invalid(
                    "fees.seller_levels",
                    format!("{}: max_orders below min_orders", level.name),
                ));
            }
            if level.min_rating.is_some_and(|r| !(0.0..=5.0).contains(&r)) {
                return Err(invalid(
                    "fees.seller_levels",
                    format!("{}: min_rating must be within 0..=5", level.name),
                ));
            }
            if level.commission_rate_bp > BASIS_POINTS {
                return Err(invalid(
                    "fees.seller_levels",
                    format!("{}: commission above 10000 bp", level.name),
                ));
            }
        }
        Ok(())
    }

    fn validate_points(&self) -> Result<(), PolicyValidationError> {
        let p = &self.points;
        if p.buyer_paid < 0 {
            return Err(invalid("points.buyer_paid", "must not be negative"));
        }
        if p.seller_offer_confirmed < 0 {
            return Err(invalid("points.seller_offer_confirmed", "must not be negative"));
        }
        if p.buyer_grades.is_empty() {
            return Err(invalid("points.buyer_grades", "at least one grade is required"));
        }
        Ok(())
    }

    fn validate_trust(&self) -> Result<(), PolicyValidationError> {
        let t = &self.trust;
        if t.tiers.is_empty() {
            return Err(invalid("trust.tiers", "at least one tier is required"));
        }
        let out_of_range = t.tiers.iter().any(|tier| {
            tier.min_fulfillment_bp > BASIS_POINTS || tier.deposit_rate_bp > BASIS_POINTS
        });
        if out_of_range
            || t.restricted.max_fulfillment_bp > BASIS_POINTS
            || t.restricted.deposit_rate_bp > BASIS_POINTS
        {
            return Err(invalid("trust", "rates must be at most 10000 bp"));
        }
        Ok(())
    }
}

/// Reloadable, shared policy.
///
/// [`current`](Self::current) hands out an immutable snapshot;
/// [`reload`](Self::reload) validates a new bundle and swaps it in whole.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<PolicyBundle>>,
}

impl PolicyHandle {
    /// Wrap a bundle after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError`] if the bundle is invalid.
    pub fn new(bundle: PolicyBundle) -> Result<Self, PolicyValidationError> {
        bundle.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(bundle)),
        })
    }

    /// Snapshot of the active bundle.
    #[must_use]
    pub fn current(&self) -> Arc<PolicyBundle> {
        Arc::clone(&self.current.read())
    }

    /// Validate `bundle` and make it the active one.
    ///
    /// On error the active bundle is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError`] if the bundle is invalid.
    pub fn reload(&self, bundle: PolicyBundle) -> Result<(), PolicyValidationError> {
        bundle.validate()?;
        let version = bundle.version.clone();
        *self.current.write() = Arc::new(bundle);
        tracing::info!(policy_version = %version, "Policy bundle reloaded");
        Ok(())
    }

    /// Reload from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError`] if the file cannot be read or the
    /// bundle is invalid.
    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<(), PolicyValidationError> {
        self.reload(PolicyBundle::from_path(path)?)
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicyBundle::default())),
        }
    }
}
