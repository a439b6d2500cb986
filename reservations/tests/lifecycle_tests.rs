//! Reservation lifecycle: holds, payment, expiry, cancellation, shipping
//! and arrival.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::Duration;
use common::{Harness, admin};
use groupbuy_core::error::{ConflictCode, EngineError};
use groupbuy_core::store::{EventQuery, ReservationStore};
use groupbuy_core::types::{
    Actor, BuyerId, CancelRule, DealId, EventType, Money, PointHolder, ReservationPhase,
    ReservationStatus, SellerId, SettlementStatus, ShippingMode,
};
use groupbuy_reservations::{CreateReservation, ExpireOutcome};
use groupbuy_testing::helpers;

fn code(err: &EngineError) -> Option<ConflictCode> {
    err.conflict_code()
}

#[tokio::test]
async fn create_holds_capacity_and_snapshots_amounts() {
    let h = Harness::new();
    let offer = h
        .open(
            helpers::offer(5, h.now()).with_shipping(ShippingMode::PerQty, Money::won(500)),
        )
        .await;

    let r = h.reserve(&offer, 2).await;
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.amount_goods, Money::won(20_000));
    assert_eq!(r.amount_shipping, Money::won(1_000));
    assert_eq!(r.amount_total, Money::won(21_000));
    assert_eq!(r.expires_at, h.now() + Duration::minutes(5));

    let snapshot = h.ledger.snapshot(offer.id).await.unwrap();
    assert_eq!(snapshot.reserved, 2);
    assert_eq!(snapshot.available, 3);

    let created = h
        .store
        .list_events(EventQuery {
            event_type: Some(EventType::ReservationCreated),
            reservation_id: Some(r.id),
            ..EventQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].actor_type, "buyer");
}

#[tokio::test]
async fn create_rejects_bad_requests() {
    let h = Harness::new();
    let offer = h.offer(2).await;

    let err = h
        .machine
        .create_reservation(CreateReservation::new(&offer, BuyerId::new(), 0))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InvalidQuantity));

    let err = h
        .machine
        .create_reservation(CreateReservation::new(&offer, BuyerId::new(), 1).with_hold_minutes(0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut wrong_deal = CreateReservation::new(&offer, BuyerId::new(), 1);
    wrong_deal.deal_id = DealId::new();
    let err = h.machine.create_reservation(wrong_deal).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));

    let err = h
        .machine
        .create_reservation(CreateReservation::new(&offer, BuyerId::new(), 3))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InsufficientCapacity));
    assert_eq!(err.to_string(), "not enough capacity (remain=2)");

    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().reserved, 0);
}

#[tokio::test]
async fn create_rejects_closed_offers() {
    let h = Harness::new();
    let mut inactive = helpers::offer(2, h.now());
    inactive.is_active = false;
    let inactive = h.open(inactive).await;
    let err = h
        .machine
        .create_reservation(CreateReservation::new(&inactive, BuyerId::new(), 1))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InvalidState));

    let past = h.open(helpers::offer(2, h.now()).with_deadline(h.now())).await;
    let err = h
        .machine
        .create_reservation(CreateReservation::new(&past, BuyerId::new(), 1))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InvalidState));
}

#[tokio::test]
async fn capacity_one_admits_a_single_hold() {
    let h = Harness::new();
    let offer = h.offer(1).await;

    let first = h.reserve(&offer, 1).await;
    let err = h
        .machine
        .create_reservation(CreateReservation::new(&offer, BuyerId::new(), 1))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InsufficientCapacity));

    // Releasing the first hold frees the unit again.
    h.machine
        .cancel(first.id, Actor::Buyer(first.buyer_id), None, None)
        .await
        .unwrap();
    h.reserve(&offer, 1).await;
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn pay_moves_units_to_sold_and_awards_points() {
    let h = Harness::new();
    let offer = h.offer(3).await;
    let r = h.paid(&offer, 2).await;

    assert_eq!(r.status, ReservationStatus::Paid);
    assert_eq!(r.paid_at, Some(h.now()));
    assert_eq!(r.points_awarded, 20);

    let snapshot = h.ledger.snapshot(offer.id).await.unwrap();
    assert_eq!((snapshot.reserved, snapshot.sold), (0, 2));
    assert!(!snapshot.is_confirmed);

    let points = h.machine.buyer_points(r.buyer_id).await.unwrap();
    assert_eq!(points.balance, 20);
    assert_eq!(points.grade, "BRONZE");
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn selling_out_confirms_the_offer_once() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let a = h.paid(&offer, 1).await;
    h.paid(&offer, 1).await;

    let snapshot = h.ledger.snapshot(offer.id).await.unwrap();
    assert!(snapshot.is_confirmed);
    assert_eq!(snapshot.available, 0);

    let seller = PointHolder::Seller(offer.seller_id);
    assert_eq!(h.store.points_balance(seller).await.unwrap(), 30);

    // A refund and a second sell-out do not confirm or award again.
    h.machine
        .cancel(a.id, Actor::Buyer(a.buyer_id), None, None)
        .await
        .unwrap();
    h.paid(&offer, 1).await;
    assert_eq!(h.store.points_balance(seller).await.unwrap(), 30);
    let confirmed = h
        .store
        .list_events(EventQuery {
            event_type: Some(EventType::OfferConfirmed),
            ..EventQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn pay_guards_run_in_order() {
    let h = Harness::new();
    let offer = h.offer(3).await;
    let r = h.paid(&offer, 1).await;

    // Ownership is checked before the double-pay guard.
    let err = h
        .machine
        .pay(r.id, Actor::Buyer(BuyerId::new()), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::NotOwned));
    let err = h
        .machine
        .pay(r.id, Actor::Seller(offer.seller_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::NotOwned));

    let err = h
        .machine
        .pay(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::AlreadyPaid));
    assert_eq!(err.to_string(), "cannot pay: already PAID");

    let cancelled = h.reserve(&offer, 1).await;
    h.machine
        .cancel(cancelled.id, Actor::Buyer(cancelled.buyer_id), None, None)
        .await
        .unwrap();
    let err = h
        .machine
        .pay(cancelled.id, Actor::Buyer(cancelled.buyer_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::AlreadyCancelled));
}

#[tokio::test]
async fn paying_a_lapsed_hold_expires_it() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.reserve(&offer, 2).await;

    h.advance(Duration::minutes(5));
    let err = h
        .machine
        .pay(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::Expired));
    assert!(err.to_string().starts_with("cannot pay: hold expired at"));

    let stored = h.reload(&r).await;
    assert_eq!(stored.status, ReservationStatus::Expired);
    assert_eq!(stored.expired_at, Some(h.now()));
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().reserved, 0);

    let err = h
        .machine
        .pay(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot pay: already EXPIRED");
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn expire_is_a_single_transition() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.reserve(&offer, 1).await;

    let outcome = h.machine.expire(r.id).await.unwrap();
    assert_eq!(
        outcome,
        ExpireOutcome::NotDue {
            expires_at: r.expires_at
        }
    );

    h.advance(Duration::minutes(6));
    assert!(matches!(
        h.machine.expire(r.id).await.unwrap(),
        ExpireOutcome::Expired(_)
    ));
    assert_eq!(
        h.machine.expire(r.id).await.unwrap(),
        ExpireOutcome::Skipped {
            status: ReservationStatus::Expired
        }
    );

    let expired_events = h
        .store
        .list_events(EventQuery {
            event_type: Some(EventType::ReservationExpired),
            reservation_id: Some(r.id),
            ..EventQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(expired_events.len(), 1);
    assert_eq!(expired_events[0].actor_type, "system");
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn reading_a_lapsed_hold_expires_it() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let r = h.reserve(&offer, 1).await;
    assert_eq!(h.machine.phase(&r), ReservationPhase::Pending);

    h.advance(Duration::minutes(10));
    assert_eq!(h.machine.phase(&r), ReservationPhase::PendingExpired);

    let read = h.machine.get_reservation(r.id).await.unwrap();
    assert_eq!(read.status, ReservationStatus::Expired);
    assert_eq!(h.machine.phase(&read), ReservationPhase::Expired);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().available, 1);
}

#[tokio::test]
async fn cancel_pending_releases_the_hold() {
    let h = Harness::new();
    let offer = h.offer(3).await;
    let r = h.reserve(&offer, 3).await;

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(BuyerId::new()), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::NotOwned));

    let cancelled = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), Some("changed my mind".into()), None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.refunded_qty, 0);
    assert_eq!(h.machine.phase(&cancelled), ReservationPhase::Cancelled);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().available, 3);

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::AlreadyCancelled));
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn cancelling_a_lapsed_hold_reports_expired() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let r = h.reserve(&offer, 1).await;
    h.advance(Duration::minutes(5));

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::Expired));
    assert_eq!(h.reload(&r).await.status, ReservationStatus::Expired);

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InvalidState));
}

#[tokio::test]
async fn cancel_paid_refunds_everything() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.paid(&offer, 2).await;

    let cancelled = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.refunded_qty, 2);
    assert_eq!(cancelled.refunded_amount_total, Money::won(20_000));
    assert_eq!(cancelled.points_revoked, 20);
    assert_eq!(h.machine.phase(&cancelled), ReservationPhase::FullyRefunded);

    assert_eq!(h.machine.buyer_points(r.buyer_id).await.unwrap().balance, 0);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().sold, 0);
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn buyer_cannot_cancel_after_shipping_by_default() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.shipped(&offer, 1).await;

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::CancelNotAllowedAfterShipped));
    assert_eq!(err.to_string(), "cannot cancel: already SHIPPED");

    // The seller is not bound by the buyer's cancel window.
    let cancelled = h
        .machine
        .cancel(r.id, Actor::Seller(offer.seller_id), Some("out of stock".into()), None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn cancel_window_counts_from_delivery() {
    let h = Harness::new();
    let offer = h
        .open(
            helpers::offer(2, h.now())
                .with_cancel_rule(CancelRule::WithinDaysAfterDelivery { days: 3 }),
        )
        .await;

    let early = h.delivered(&offer, 1).await;
    h.advance(Duration::days(2));
    let cancelled = h
        .machine
        .cancel(early.id, Actor::Buyer(early.buyer_id), None, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let late = h.delivered(&offer, 1).await;
    h.advance(Duration::days(3) + Duration::seconds(1));
    let err = h
        .machine
        .cancel(late.id, Actor::Buyer(late.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::CancelPeriodExpired));
    assert_eq!(h.reload(&late).await.status, ReservationStatus::Delivered);
}

#[tokio::test]
async fn shipping_and_arrival_open_a_settlement() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.paid(&offer, 2).await;

    let err = h
        .machine
        .mark_shipped(r.id, Actor::Seller(SellerId::new()), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::NotOwned));

    let shipped = h
        .machine
        .mark_shipped(r.id, Actor::Seller(offer.seller_id), Some("TRK-9".into()), None)
        .await
        .unwrap();
    assert_eq!(shipped.status, ReservationStatus::Shipped);
    assert_eq!(shipped.tracking_number.as_deref(), Some("TRK-9"));

    let err = h
        .machine
        .mark_shipped(r.id, Actor::Seller(offer.seller_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::InvalidState));

    let err = h
        .machine
        .arrival_confirm(r.id, Actor::Seller(offer.seller_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::NotOwned));

    let delivered = h
        .machine
        .arrival_confirm(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap();
    assert_eq!(delivered.status, ReservationStatus::Delivered);
    assert_eq!(h.machine.phase(&delivered), ReservationPhase::DeliveredCooling);

    let settlement = h
        .store
        .get_settlement_for_reservation(r.id)
        .await
        .unwrap()
        .expect("settlement opened");
    assert_eq!(settlement.status, SettlementStatus::Ready);
    assert_eq!(settlement.seller_id, offer.seller_id);
    assert_eq!(settlement.buyer_paid_amount, Money::won(20_000));
    // New seller: Lv.6 at 3.5%, plus the 3.3% gateway fee.
    assert_eq!(settlement.commission_rate_bp, 350);
    assert_eq!(settlement.pg_fee_amount, Money::won(660));
    assert_eq!(settlement.platform_commission_amount, Money::won(700));
    assert_eq!(settlement.seller_payout_amount, Money::won(18_640));
    assert_eq!(settlement.scheduled_payout_at, h.now() + Duration::days(37));

    h.advance(Duration::days(8));
    assert_eq!(
        h.machine.phase(&delivered),
        ReservationPhase::DeliveredAfterCooling
    );
}

#[tokio::test]
async fn admin_may_act_on_any_reservation() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let r = h.reserve(&offer, 1).await;

    let paid = h.machine.pay(r.id, admin(), None).await.unwrap();
    assert_eq!(paid.status, ReservationStatus::Paid);
    let shipped = h.machine.mark_shipped(r.id, admin(), None, None).await.unwrap();
    assert_eq!(shipped.status, ReservationStatus::Shipped);
}

#[tokio::test]
async fn idempotent_pay_replays_the_first_response() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.reserve(&offer, 1).await;
    let buyer = Actor::Buyer(r.buyer_id);

    let first = h.machine.pay(r.id, buyer, Some("pay-1")).await.unwrap();
    let commits = h.store.commit_count();

    h.advance(Duration::minutes(1));
    let replay = h.machine.pay(r.id, buyer, Some("pay-1")).await.unwrap();
    assert_eq!(replay, first);
    assert_eq!(h.store.commit_count(), commits);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().sold, 1);

    // Same key, different request.
    let other = h.reserve(&offer, 1).await;
    let err = h
        .machine
        .pay(other.id, Actor::Buyer(other.buyer_id), Some("pay-1"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::IdempotencyKeyReused));
    assert_eq!(h.reload(&other).await.status, ReservationStatus::Pending);
}

#[tokio::test]
async fn idempotent_create_returns_the_same_reservation() {
    let h = Harness::new();
    let offer = h.offer(5).await;
    let buyer = BuyerId::new();
    let request = CreateReservation::new(&offer, buyer, 2).with_idempotency_key("create-1");

    let first = h.machine.create_reservation(request.clone()).await.unwrap();
    let again = h.machine.create_reservation(request).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().reserved, 2);

    let err = h
        .machine
        .create_reservation(CreateReservation::new(&offer, buyer, 3).with_idempotency_key("create-1"))
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::IdempotencyKeyReused));
}

#[tokio::test]
async fn exhausted_retries_surface_as_concurrent_modification() {
    let h = Harness::with_retry(2);
    let offer = h.offer(1).await;
    let r = h.reserve(&offer, 1).await;

    let conflict = groupbuy_core::error::StoreError::VersionConflict {
        entity: "reservation",
        id: r.id.to_string(),
        expected: r.version,
    };
    h.store.inject_commit_failures(vec![conflict.clone(); 3]);
    let err = h
        .machine
        .pay(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap_err();
    assert_eq!(code(&err), Some(ConflictCode::ConcurrentModification));
    assert_eq!(h.reload(&r).await.status, ReservationStatus::Pending);

    // Within budget the operation goes through.
    h.store.inject_commit_failures(vec![conflict; 2]);
    let paid = h
        .machine
        .pay(r.id, Actor::Buyer(r.buyer_id), None)
        .await
        .unwrap();
    assert_eq!(paid.status, ReservationStatus::Paid);
    h.assert_consistent(&offer).await;
}
