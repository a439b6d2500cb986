//! Shared setup for the engine integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use groupbuy_core::environment::Clock;
use groupbuy_core::policy::{PolicyBundle, PolicyHandle};
use groupbuy_core::store::ReservationStore;
use groupbuy_core::types::{Actor, AdminId, BuyerId, Offer, Reservation};
use groupbuy_reservations::{
    CreateReservation, ExpirySweeper, InventoryLedger, ReservationMachine, SettlementBatcher,
};
use groupbuy_runtime::RetryPolicy;
use groupbuy_testing::{InMemoryStore, ManualClock, helpers, test_clock};
use std::sync::Arc;

/// Engine wired to an in-memory store and a manual clock.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub policy: Arc<PolicyHandle>,
    pub ledger: InventoryLedger,
    pub machine: Arc<ReservationMachine>,
    pub batcher: SettlementBatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(helpers::policy())
    }

    pub fn with_policy(bundle: PolicyBundle) -> Self {
        Self::build(bundle, RetryPolicy::default())
    }

    /// Harness whose machine and batcher give up after `max_retries`.
    pub fn with_retry(max_retries: usize) -> Self {
        let retry = RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(std::time::Duration::from_millis(1))
            .jitter(false)
            .build();
        Self::build(helpers::policy(), retry)
    }

    fn build(bundle: PolicyBundle, retry: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at(test_clock().now()));
        let policy = Arc::new(PolicyHandle::new(bundle).expect("valid policy"));

        let dyn_store: Arc<dyn ReservationStore> = store.clone();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let machine = Arc::new(
            ReservationMachine::new(dyn_store.clone(), dyn_clock.clone(), policy.clone())
                .with_retry(retry.clone()),
        );
        let batcher = SettlementBatcher::new(dyn_store.clone(), dyn_clock).with_retry(retry);

        Self {
            store,
            clock,
            policy,
            ledger: InventoryLedger::new(dyn_store),
            machine,
            batcher,
        }
    }

    pub fn sweeper(&self, batch_limit: usize) -> ExpirySweeper {
        let clock: Arc<dyn Clock> = self.clock.clone();
        ExpirySweeper::new(self.machine.clone(), clock, batch_limit)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Open a default offer with `capacity` units.
    pub async fn offer(&self, capacity: u32) -> Offer {
        self.open(helpers::offer(capacity, self.now())).await
    }

    pub async fn open(&self, offer: Offer) -> Offer {
        self.ledger.open_offer(offer).await.expect("open offer")
    }

    /// PENDING reservation for a fresh buyer.
    pub async fn reserve(&self, offer: &Offer, qty: u32) -> Reservation {
        self.machine
            .create_reservation(CreateReservation::new(offer, BuyerId::new(), qty))
            .await
            .expect("create reservation")
    }

    pub async fn paid(&self, offer: &Offer, qty: u32) -> Reservation {
        let r = self.reserve(offer, qty).await;
        self.machine
            .pay(r.id, Actor::Buyer(r.buyer_id), None)
            .await
            .expect("pay")
    }

    pub async fn shipped(&self, offer: &Offer, qty: u32) -> Reservation {
        let r = self.paid(offer, qty).await;
        self.machine
            .mark_shipped(r.id, Actor::Seller(offer.seller_id), Some("TRK-1".into()), None)
            .await
            .expect("ship")
    }

    pub async fn delivered(&self, offer: &Offer, qty: u32) -> Reservation {
        let r = self.shipped(offer, qty).await;
        self.machine
            .arrival_confirm(r.id, Actor::Buyer(r.buyer_id), None)
            .await
            .expect("arrival confirm")
    }

    pub async fn reload(&self, r: &Reservation) -> Reservation {
        self.store
            .get_reservation(r.id)
            .await
            .unwrap()
            .expect("reservation exists")
    }

    /// Audit the offer and fail on any counter drift.
    pub async fn assert_consistent(&self, offer: &Offer) {
        let audit = self.ledger.audit(offer.id).await.unwrap();
        assert!(audit.is_consistent(), "audit mismatches: {:?}", audit.mismatches);
    }
}

pub fn admin() -> Actor {
    Actor::Admin(AdminId::new())
}
