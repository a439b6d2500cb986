//! Offer inventory ledger.
//!
//! Capacity is never checked here and then written elsewhere. The ledger
//! only *describes* a counter change as an [`OfferDelta`]; the store applies
//! it with the capacity guard inside the same atomic step, together with the
//! reservation write that caused it. What the ledger owns is the mapping of
//! each lifecycle step onto a delta, the translation of counter failures
//! into caller-facing errors, and the read-side views (snapshot, audit).
//!
//! | Step           | `reserved_qty` | `sold_qty` |
//! |----------------|----------------|------------|
//! | reserve        | `+qty`         |            |
//! | release        | `-qty`         |            |
//! | commit sale    | `-qty`         | `+qty`     |
//! | refund sale    |                | `-qty`     |

use chrono::{DateTime, Utc};
use groupbuy_core::error::{ConflictCode, EngineError, StoreError};
use groupbuy_core::policy::PolicyBundle;
use groupbuy_core::store::{OfferDelta, ReservationStore, SoldOutAward};
use groupbuy_core::types::{Actor, EventLog, EventType, Offer, OfferId, ReservationStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time view of an offer's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// Offer id
    pub offer_id: OfferId,
    /// Fixed capacity
    pub capacity: u32,
    /// Held by PENDING reservations
    pub reserved: u32,
    /// Paid and not refunded
    pub sold: u32,
    /// `capacity - reserved - sold`
    pub available: u32,
    /// Sold out at least once
    pub is_confirmed: bool,
}

impl From<&Offer> for InventorySnapshot {
    fn from(offer: &Offer) -> Self {
        Self {
            offer_id: offer.id,
            capacity: offer.capacity,
            reserved: offer.reserved_qty,
            sold: offer.sold_qty,
            available: offer.available(),
            is_confirmed: offer.is_confirmed,
        }
    }
}

/// Recorded counters compared against the reservation rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAudit {
    /// Offer id
    pub offer_id: OfferId,
    /// Counters as stored on the offer
    pub recorded: InventorySnapshot,
    /// `reserved_qty` recomputed from PENDING reservations
    pub computed_reserved: u32,
    /// `sold_qty` recomputed from paid, unrefunded units
    pub computed_sold: u32,
    /// Human-readable mismatches; empty when consistent
    pub mismatches: Vec<String>,
}

impl InventoryAudit {
    /// Counters agree with the reservation rows and stay within capacity.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Capacity accounting for offers.
#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn ReservationStore>,
}

impl InventoryLedger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    /// Hold `qty` units for a new PENDING reservation.
    #[must_use]
    pub fn reserve(offer_id: OfferId, qty: u32) -> OfferDelta {
        OfferDelta {
            offer_id,
            reserved: i64::from(qty),
            sold: 0,
            on_sold_out: None,
        }
    }

    /// Return `qty` held units to the pool.
    #[must_use]
    pub fn release(offer_id: OfferId, qty: u32) -> OfferDelta {
        OfferDelta {
            offer_id,
            reserved: -i64::from(qty),
            sold: 0,
            on_sold_out: None,
        }
    }

    /// Move `qty` held units to sold.
    ///
    /// If this sale fills the offer for the first time the store flips
    /// `is_confirmed` and applies `award` in the same commit.
    #[must_use]
    pub fn commit_sale(offer_id: OfferId, qty: u32, award: SoldOutAward) -> OfferDelta {
        OfferDelta {
            offer_id,
            reserved: -i64::from(qty),
            sold: i64::from(qty),
            on_sold_out: Some(award),
        }
    }

    /// Return `qty` refunded units from sold to the pool.
    #[must_use]
    pub fn refund_sale(offer_id: OfferId, qty: u32) -> OfferDelta {
        OfferDelta {
            offer_id,
            reserved: 0,
            sold: -i64::from(qty),
            on_sold_out: None,
        }
    }

    /// Seller award for an offer selling out.
    #[must_use]
    pub fn sold_out_award(offer: &Offer, policy: &PolicyBundle, at: DateTime<Utc>) -> SoldOutAward {
        SoldOutAward {
            seller_id: offer.seller_id,
            points: policy.points.seller_offer_confirmed,
            event: EventLog::new(
                EventType::OfferConfirmed,
                &Actor::System,
                format!("offer:{}:confirmed", offer.id),
                at,
            )
            .for_offer(offer.id)
            .with_meta(serde_json::json!({ "capacity": offer.capacity })),
        }
    }

    /// Translate a failed commit into the error callers see.
    ///
    /// A lost capacity check becomes `INSUFFICIENT_CAPACITY`. A counter
    /// underflow means a transition released units it never held, so it is
    /// logged loudly and surfaced as an internal error.
    #[must_use]
    pub fn map_error(err: StoreError) -> EngineError {
        match err {
            StoreError::CapacityExceeded { available } => EngineError::conflict(
                ConflictCode::InsufficientCapacity,
                format!("not enough capacity (remain={available})"),
            ),
            StoreError::CounterUnderflow {
                ref offer_id,
                counter,
            } => {
                tracing::error!(offer_id = %offer_id, counter, "Offer counter would go negative");
                EngineError::Store(err)
            }
            other => EngineError::Store(other),
        }
    }

    /// Register a new offer.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidRequest`] for a zero capacity, a negative
    ///   price or fee, or non-zero starting counters
    /// - [`EngineError::Store`] if the insert fails
    pub async fn open_offer(&self, offer: Offer) -> Result<Offer, EngineError> {
        if offer.capacity == 0 {
            return Err(EngineError::InvalidRequest("capacity must be > 0".into()));
        }
        if offer.price.amount() < 0 || offer.shipping_fee.amount() < 0 {
            return Err(EngineError::InvalidRequest(
                "price and shipping fee must be >= 0".into(),
            ));
        }
        if offer.reserved_qty != 0 || offer.sold_qty != 0 || offer.is_confirmed {
            return Err(EngineError::InvalidRequest(
                "a new offer starts with empty counters".into(),
            ));
        }

        let offer = self.store.insert_offer(offer).await?;
        tracing::info!(
            offer_id = %offer.id,
            deal_id = %offer.deal_id,
            capacity = offer.capacity,
            "Offer opened"
        );
        Ok(offer)
    }

    /// Current counters for an offer.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the offer does not exist.
    pub async fn snapshot(&self, offer_id: OfferId) -> Result<InventorySnapshot, EngineError> {
        let offer = self
            .store
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Offer", offer_id))?;
        Ok(InventorySnapshot::from(&offer))
    }

    /// Recompute an offer's counters from its reservations.
    ///
    /// `reserved` is the sum of PENDING quantities; `sold` is the sum of
    /// `qty - refunded_qty` over every reservation that was ever paid.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the offer does not exist.
    pub async fn audit(&self, offer_id: OfferId) -> Result<InventoryAudit, EngineError> {
        let offer = self
            .store
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Offer", offer_id))?;
        let reservations = self.store.list_reservations_for_offer(offer_id).await?;

        let computed_reserved: u32 = reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Pending)
            .map(|r| r.qty)
            .sum();
        let computed_sold: u32 = reservations
            .iter()
            .filter(|r| r.paid_at.is_some())
            .map(groupbuy_core::types::Reservation::remaining_qty)
            .sum();

        let mut mismatches = Vec::new();
        if offer.reserved_qty != computed_reserved {
            mismatches.push(format!(
                "reserved_qty={} but pending reservations hold {computed_reserved}",
                offer.reserved_qty
            ));
        }
        if offer.sold_qty != computed_sold {
            mismatches.push(format!(
                "sold_qty={} but paid reservations hold {computed_sold}",
                offer.sold_qty
            ));
        }
        if !offer.within_capacity() {
            mismatches.push(format!(
                "reserved_qty + sold_qty = {} exceeds capacity {}",
                u64::from(offer.reserved_qty) + u64::from(offer.sold_qty),
                offer.capacity
            ));
        }

        if !mismatches.is_empty() {
            tracing::warn!(offer_id = %offer_id, ?mismatches, "Inventory audit found mismatches");
        }

        Ok(InventoryAudit {
            offer_id,
            recorded: InventorySnapshot::from(&offer),
            computed_reserved,
            computed_sold,
            mismatches,
        })
    }
}
