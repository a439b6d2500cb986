//! In-memory [`ReservationStore`] for fast, deterministic tests.
//!
//! All state sits behind one mutex, so every [`Commit`] is validated and
//! applied as a single step. The checks mirror the `PostgreSQL` store: the
//! capacity guard, version and status checks, and unique event and
//! idempotency keys.

use chrono::{DateTime, Utc};
use groupbuy_core::error::StoreError;
use groupbuy_core::store::{
    Commit, CommitOutcome, EventQuery, IdempotencyRecord, OfferDelta, ReservationStore,
    ReservationWrite, SettlementWrite, StoreFuture,
};
use groupbuy_core::types::{
    EventLog, Offer, OfferId, PointEntry, PointHolder, Reservation, ReservationId,
    ReservationSettlement, ReservationStatus, SellerId, SellerStats, SettlementId,
    SettlementStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::ready;
use std::time::Duration;

#[derive(Default)]
struct State {
    offers: HashMap<OfferId, Offer>,
    reservations: HashMap<ReservationId, Reservation>,
    settlements: HashMap<SettlementId, ReservationSettlement>,
    events: Vec<EventLog>,
    event_keys: HashSet<String>,
    points: Vec<PointEntry>,
    point_keys: HashSet<String>,
    idempotency: HashMap<String, IdempotencyRecord>,
    injected_failures: VecDeque<StoreError>,
    commit_latency: Option<Duration>,
    commits: usize,
}

/// In-memory store.
///
/// # Example
///
/// ```
/// use groupbuy_testing::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.commit_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commits fail with these errors, in order, before any
    /// validation runs.
    pub fn inject_commit_failures(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.state.lock().injected_failures.extend(errors);
    }

    /// Delay every commit by `latency` before it is validated.
    ///
    /// Widens the window between a caller's reads and its commit, the way a
    /// database round trip does. Needs a Tokio runtime with time enabled.
    pub fn set_commit_latency(&self, latency: Option<Duration>) {
        self.state.lock().commit_latency = latency;
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    /// Every event, in insertion order.
    #[must_use]
    pub fn events(&self) -> Vec<EventLog> {
        self.state.lock().events.clone()
    }

    /// Every point entry, in insertion order.
    #[must_use]
    pub fn point_entries(&self) -> Vec<PointEntry> {
        self.state.lock().points.clone()
    }

    /// Overwrite a reservation row without any checks.
    ///
    /// For arranging states that have no engine operation, such as an old
    /// delivery date.
    pub fn put_reservation(&self, reservation: Reservation) {
        self.state
            .lock()
            .reservations
            .insert(reservation.id, reservation);
    }

    /// Overwrite a settlement row without any checks.
    pub fn put_settlement(&self, settlement: ReservationSettlement) {
        self.state.lock().settlements.insert(settlement.id, settlement);
    }
}

impl State {
    fn validate(&self, commit: &Commit) -> Result<(), StoreError> {
        // Keys first: a request replayed under its idempotency key must see
        // DuplicateKey, not whatever guard the first request already used up.
        if let Some(record) = &commit.idempotency {
            if self.idempotency.contains_key(&record.key) {
                return Err(StoreError::DuplicateKey(record.key.clone()));
            }
        }
        let mut keys = HashSet::new();
        for event in &commit.events {
            if self.event_keys.contains(&event.idempotency_key)
                || !keys.insert(event.idempotency_key.as_str())
            {
                return Err(StoreError::DuplicateKey(event.idempotency_key.clone()));
            }
        }

        if let Some(write) = &commit.reservation {
            self.check_reservation(write)?;
        }
        if let Some(delta) = &commit.offer {
            self.check_offer(delta)?;
        }
        if let Some(write) = &commit.settlement {
            self.check_settlement(write)?;
        }
        Ok(())
    }

    fn check_reservation(&self, write: &ReservationWrite) -> Result<(), StoreError> {
        match write {
            ReservationWrite::Insert(reservation) => {
                if self.reservations.contains_key(&reservation.id) {
                    return Err(StoreError::DuplicateKey(reservation.id.to_string()));
                }
            }
            ReservationWrite::Update {
                reservation,
                expected_version,
            } => {
                let current = self.reservations.get(&reservation.id).ok_or_else(|| {
                    StoreError::NotFound {
                        entity: "reservation",
                        id: reservation.id.to_string(),
                    }
                })?;
                if current.version != *expected_version {
                    return Err(StoreError::VersionConflict {
                        entity: "reservation",
                        id: reservation.id.to_string(),
                        expected: *expected_version,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_offer(&self, delta: &OfferDelta) -> Result<(), StoreError> {
        let offer = self
            .offers
            .get(&delta.offer_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "offer",
                id: delta.offer_id.to_string(),
            })?;
        let reserved = i64::from(offer.reserved_qty) + delta.reserved;
        let sold = i64::from(offer.sold_qty) + delta.sold;
        if reserved < 0 {
            return Err(StoreError::CounterUnderflow {
                offer_id: offer.id.to_string(),
                counter: "reserved_qty",
            });
        }
        if sold < 0 {
            return Err(StoreError::CounterUnderflow {
                offer_id: offer.id.to_string(),
                counter: "sold_qty",
            });
        }
        if reserved + sold > i64::from(offer.capacity) {
            return Err(StoreError::CapacityExceeded {
                available: offer.available(),
            });
        }
        Ok(())
    }

    fn check_settlement(&self, write: &SettlementWrite) -> Result<(), StoreError> {
        match write {
            SettlementWrite::Insert(settlement) => {
                let taken = self.settlements.contains_key(&settlement.id)
                    || self
                        .settlements
                        .values()
                        .any(|s| s.reservation_id == settlement.reservation_id);
                if taken {
                    return Err(StoreError::DuplicateKey(format!(
                        "settlement for reservation {}",
                        settlement.reservation_id
                    )));
                }
            }
            SettlementWrite::Update {
                settlement,
                expected_status,
            } => {
                let current = self.settlements.get(&settlement.id).ok_or_else(|| {
                    StoreError::NotFound {
                        entity: "settlement",
                        id: settlement.id.to_string(),
                    }
                })?;
                if current.status != *expected_status {
                    return Err(StoreError::StatusMismatch {
                        id: settlement.id.to_string(),
                        expected: expected_status.as_str().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn push_event(&mut self, event: EventLog) {
        if self.event_keys.insert(event.idempotency_key.clone()) {
            self.events.push(event);
        }
    }

    fn push_points(&mut self, entry: PointEntry) {
        if self.point_keys.insert(entry.idempotency_key.clone()) {
            self.points.push(entry);
        }
    }

    fn apply(&mut self, commit: Commit) -> Result<CommitOutcome, StoreError> {
        if let Some(err) = self.injected_failures.pop_front() {
            return Err(err);
        }
        self.validate(&commit)?;

        let mut outcome = CommitOutcome::default();
        let mut award = None;

        if let Some(delta) = commit.offer {
            if let Some(offer) = self.offers.get_mut(&delta.offer_id) {
                // Both values were range-checked in validate().
                offer.reserved_qty =
                    u32::try_from(i64::from(offer.reserved_qty) + delta.reserved).unwrap_or(0);
                offer.sold_qty = u32::try_from(i64::from(offer.sold_qty) + delta.sold).unwrap_or(0);
                if offer.sold_qty == offer.capacity && !offer.is_confirmed {
                    if let Some(sold_out) = delta.on_sold_out {
                        offer.is_confirmed = true;
                        outcome.offer_confirmed = true;
                        award = Some((offer.id, sold_out));
                    }
                }
                outcome.offer = Some(offer.clone());
            }
        }

        if let Some(write) = commit.reservation {
            let reservation = match write {
                ReservationWrite::Insert(r) | ReservationWrite::Update { reservation: r, .. } => r,
            };
            self.reservations.insert(reservation.id, reservation);
        }

        if let Some(write) = commit.settlement {
            let settlement = match write {
                SettlementWrite::Insert(s) | SettlementWrite::Update { settlement: s, .. } => s,
            };
            self.settlements.insert(settlement.id, settlement);
        }

        for event in commit.events {
            self.push_event(event);
        }
        for entry in commit.points {
            self.push_points(entry);
        }
        if let Some((offer_id, sold_out)) = award {
            let at = sold_out.event.created_at;
            let key = format!("pt:offer_confirmed:{offer_id}");
            self.push_event(sold_out.event);
            self.push_points(PointEntry {
                holder: PointHolder::Seller(sold_out.seller_id),
                amount: sold_out.points,
                reason: "offer confirmed".to_string(),
                idempotency_key: key,
                created_at: at,
            });
        }
        if let Some(record) = commit.idempotency {
            self.idempotency.insert(record.key.clone(), record);
        }

        self.commits += 1;
        Ok(outcome)
    }
}

fn matches_query(event: &EventLog, query: &EventQuery) -> bool {
    query.event_type.is_none_or(|t| t == event.event_type)
        && query
            .reservation_id
            .is_none_or(|id| event.reservation_id == Some(id))
        && query
            .settlement_id
            .is_none_or(|id| event.settlement_id == Some(id))
        && query.batch_id.as_deref().is_none_or(|batch| {
            event.meta.get("batch_id").and_then(serde_json::Value::as_str) == Some(batch)
        })
}

impl ReservationStore for InMemoryStore {
    fn insert_offer(&self, offer: Offer) -> StoreFuture<'_, Offer> {
        let mut state = self.state.lock();
        let result = if state.offers.contains_key(&offer.id) {
            Err(StoreError::DuplicateKey(offer.id.to_string()))
        } else {
            state.offers.insert(offer.id, offer.clone());
            Ok(offer)
        };
        Box::pin(ready(result))
    }

    fn get_offer(&self, id: OfferId) -> StoreFuture<'_, Option<Offer>> {
        let offer = self.state.lock().offers.get(&id).cloned();
        Box::pin(ready(Ok(offer)))
    }

    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        let reservation = self.state.lock().reservations.get(&id).cloned();
        Box::pin(ready(Ok(reservation)))
    }

    fn list_reservations_for_offer(&self, id: OfferId) -> StoreFuture<'_, Vec<Reservation>> {
        let mut rows: Vec<Reservation> = self
            .state
            .lock()
            .reservations
            .values()
            .filter(|r| r.offer_id == id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Box::pin(ready(Ok(rows)))
    }

    fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        let mut rows: Vec<Reservation> = self
            .state
            .lock()
            .reservations
            .values()
            .filter(|r| r.is_due_to_expire(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        rows.truncate(limit);
        Box::pin(ready(Ok(rows)))
    }

    fn get_settlement(&self, id: SettlementId) -> StoreFuture<'_, Option<ReservationSettlement>> {
        let settlement = self.state.lock().settlements.get(&id).cloned();
        Box::pin(ready(Ok(settlement)))
    }

    fn get_settlement_for_reservation(
        &self,
        id: ReservationId,
    ) -> StoreFuture<'_, Option<ReservationSettlement>> {
        let settlement = self
            .state
            .lock()
            .settlements
            .values()
            .find(|s| s.reservation_id == id)
            .cloned();
        Box::pin(ready(Ok(settlement)))
    }

    fn list_settlements(
        &self,
        status: SettlementStatus,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReservationSettlement>> {
        let mut rows: Vec<ReservationSettlement> = self
            .state
            .lock()
            .settlements
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.scheduled_payout_at);
        rows.truncate(limit);
        Box::pin(ready(Ok(rows)))
    }

    fn seller_stats(&self, seller_id: SellerId) -> StoreFuture<'_, SellerStats> {
        let state = self.state.lock();
        let completed_sales = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Delivered)
            .filter(|r| {
                state
                    .offers
                    .get(&r.offer_id)
                    .is_some_and(|o| o.seller_id == seller_id)
            })
            .count() as u64;
        Box::pin(ready(Ok(SellerStats {
            completed_sales,
            rating: None,
        })))
    }

    fn find_idempotency(&self, key: &str) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        let record = self.state.lock().idempotency.get(key).cloned();
        Box::pin(ready(Ok(record)))
    }

    fn find_event(&self, key: &str) -> StoreFuture<'_, Option<EventLog>> {
        let event = self
            .state
            .lock()
            .events
            .iter()
            .find(|e| e.idempotency_key == key)
            .cloned();
        Box::pin(ready(Ok(event)))
    }

    fn list_events(&self, query: EventQuery) -> StoreFuture<'_, Vec<EventLog>> {
        let events = self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| matches_query(e, &query))
            .cloned()
            .collect();
        Box::pin(ready(Ok(events)))
    }

    fn points_balance(&self, holder: PointHolder) -> StoreFuture<'_, i64> {
        let balance = self
            .state
            .lock()
            .points
            .iter()
            .filter(|p| p.holder == holder)
            .map(|p| p.amount)
            .sum();
        Box::pin(ready(Ok(balance)))
    }

    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitOutcome> {
        let latency = self.state.lock().commit_latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.state.lock().apply(commit)
        })
    }
}
