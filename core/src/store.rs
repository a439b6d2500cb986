//! Persistence abstraction for offers, reservations and settlements.
//!
//! Every state transition is expressed as one [`Commit`]: the reservation
//! row write, the offer counter deltas, an optional settlement write, the
//! audit events, point entries and the idempotency record. A store applies a
//! commit all-or-nothing.
//!
//! # Concurrency contract
//!
//! - Offer counters change only through [`OfferDelta`]. The store checks
//!   `reserved_qty + sold_qty <= capacity` and non-negativity in the same
//!   atomic step as the increment, never as a separate pre-check.
//! - Reservation updates carry the version the writer read and fail with
//!   [`StoreError::VersionConflict`] if the row moved on.
//! - Settlement updates carry the status the writer read and fail with
//!   [`StoreError::StatusMismatch`] otherwise.
//! - Event and idempotency keys are unique; duplicates fail the commit with
//!   [`StoreError::DuplicateKey`]. Point keys are unique too, but a
//!   duplicate point entry is silently skipped so a points award can never
//!   be applied twice.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `groupbuy-postgres`): production implementation
//! - `InMemoryStore` (in `groupbuy-testing`): fast, deterministic testing
//!
//! The trait uses explicit `Pin<Box<dyn Future>>` returns so it stays
//! dyn-compatible and can be shared as `Arc<dyn ReservationStore>`.

use crate::error::StoreError;
use crate::types::{
    EventLog, EventType, Offer, OfferId, PointEntry, PointHolder, Reservation, ReservationId,
    ReservationSettlement, SellerId, SellerStats, SettlementId, SettlementStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Reservation row write.
#[derive(Clone, Debug)]
pub enum ReservationWrite {
    /// New row
    Insert(Reservation),
    /// Replace the row if its version still equals `expected_version`.
    Update {
        /// New row contents; `version` must be `expected_version + 1`
        reservation: Reservation,
        /// Version the writer read
        expected_version: u64,
    },
}

impl ReservationWrite {
    /// Row being written
    #[must_use]
    pub const fn reservation(&self) -> &Reservation {
        match self {
            Self::Insert(reservation) | Self::Update { reservation, .. } => reservation,
        }
    }
}

/// Points and event emitted when an offer sells out for the first time.
#[derive(Clone, Debug)]
pub struct SoldOutAward {
    /// Seller receiving the award
    pub seller_id: SellerId,
    /// Points to award
    pub points: i64,
    /// Event recorded alongside the flag flip
    pub event: EventLog,
}

/// Signed change to an offer's counters.
#[derive(Clone, Debug)]
pub struct OfferDelta {
    /// Offer to update
    pub offer_id: OfferId,
    /// Change to `reserved_qty`
    pub reserved: i64,
    /// Change to `sold_qty`
    pub sold: i64,
    /// Applied only if this delta makes `sold_qty == capacity` while the
    /// offer is not yet confirmed.
    pub on_sold_out: Option<SoldOutAward>,
}

/// Settlement row write.
#[derive(Clone, Debug)]
pub enum SettlementWrite {
    /// New row; `reservation_id` is unique.
    Insert(ReservationSettlement),
    /// Replace the row if its status still equals `expected_status`.
    Update {
        /// New row contents
        settlement: ReservationSettlement,
        /// Status the writer read
        expected_status: SettlementStatus,
    },
}

/// Stored outcome of an idempotent request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client-supplied key
    pub key: String,
    /// Operation name, e.g. `pay`
    pub operation: String,
    /// Canonical description of the request inputs
    pub fingerprint: String,
    /// Reservation the request acted on
    pub reservation_id: ReservationId,
    /// Serialized response returned to the first caller
    pub response: serde_json::Value,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

/// Everything one state transition writes.
#[derive(Clone, Debug, Default)]
pub struct Commit {
    /// Reservation write
    pub reservation: Option<ReservationWrite>,
    /// Offer counter change
    pub offer: Option<OfferDelta>,
    /// Settlement write
    pub settlement: Option<SettlementWrite>,
    /// Audit events
    pub events: Vec<EventLog>,
    /// Point ledger entries
    pub points: Vec<PointEntry>,
    /// Idempotency record
    pub idempotency: Option<IdempotencyRecord>,
}

impl Commit {
    /// Empty commit
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reservation write
    #[must_use]
    pub fn reservation(mut self, write: ReservationWrite) -> Self {
        self.reservation = Some(write);
        self
    }

    /// Set the offer counter change
    #[must_use]
    pub fn offer(mut self, delta: OfferDelta) -> Self {
        self.offer = Some(delta);
        self
    }

    /// Set the settlement write
    #[must_use]
    pub fn settlement(mut self, write: SettlementWrite) -> Self {
        self.settlement = Some(write);
        self
    }

    /// Add an audit event
    #[must_use]
    pub fn event(mut self, event: EventLog) -> Self {
        self.events.push(event);
        self
    }

    /// Add a points entry
    #[must_use]
    pub fn points(mut self, entry: PointEntry) -> Self {
        self.points.push(entry);
        self
    }

    /// Attach the idempotency record
    #[must_use]
    pub fn idempotency(mut self, record: Option<IdempotencyRecord>) -> Self {
        self.idempotency = record;
        self
    }
}

/// What a commit changed beyond what the caller wrote.
#[derive(Clone, Debug, Default)]
pub struct CommitOutcome {
    /// Offer after the counter change
    pub offer: Option<Offer>,
    /// The offer flipped to confirmed in this commit
    pub offer_confirmed: bool,
}

/// Filter for [`ReservationStore::list_events`]. Unset fields match all.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    /// Event kind
    pub event_type: Option<EventType>,
    /// Related reservation
    pub reservation_id: Option<ReservationId>,
    /// Related settlement
    pub settlement_id: Option<SettlementId>,
    /// `meta.batch_id`
    pub batch_id: Option<String>,
}

/// Persistence for the reservation engine.
pub trait ReservationStore: Send + Sync {
    /// Create an offer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] if the id exists.
    fn insert_offer(&self, offer: Offer) -> StoreFuture<'_, Offer>;

    /// Load an offer.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn get_offer(&self, id: OfferId) -> StoreFuture<'_, Option<Offer>>;

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>>;

    /// All reservations against an offer, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn list_reservations_for_offer(&self, id: OfferId) -> StoreFuture<'_, Vec<Reservation>>;

    /// PENDING reservations with `expires_at <= now`, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Reservation>>;

    /// Load a settlement.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn get_settlement(&self, id: SettlementId) -> StoreFuture<'_, Option<ReservationSettlement>>;

    /// Load the settlement for a reservation.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn get_settlement_for_reservation(
        &self,
        id: ReservationId,
    ) -> StoreFuture<'_, Option<ReservationSettlement>>;

    /// Settlements in `status`, earliest `scheduled_payout_at` first.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn list_settlements(
        &self,
        status: SettlementStatus,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReservationSettlement>>;

    /// Delivered-sales history for a seller.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn seller_stats(&self, seller_id: SellerId) -> StoreFuture<'_, SellerStats>;

    /// Look up an idempotency record.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn find_idempotency(&self, key: &str) -> StoreFuture<'_, Option<IdempotencyRecord>>;

    /// Look up an event by its unique key.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn find_event(&self, key: &str) -> StoreFuture<'_, Option<EventLog>>;

    /// Events matching a filter, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn list_events(&self, query: EventQuery) -> StoreFuture<'_, Vec<EventLog>>;

    /// Sum of a holder's point entries.
    ///
    /// # Errors
    ///
    /// Returns error on database failure.
    fn points_balance(&self, holder: PointHolder) -> StoreFuture<'_, i64>;

    /// Apply a commit atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::CapacityExceeded`] / [`StoreError::CounterUnderflow`]
    ///   if the offer delta violates the counter invariant
    /// - [`StoreError::VersionConflict`] / [`StoreError::StatusMismatch`]
    ///   if a row changed since it was read
    /// - [`StoreError::DuplicateKey`] on a repeated event or idempotency key
    /// - [`StoreError::NotFound`] if a referenced row is missing
    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitOutcome>;
}
