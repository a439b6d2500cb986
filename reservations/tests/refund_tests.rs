//! Partial and full refunds, previews and their effect on settlements.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::Duration;
use common::{Harness, admin};
use groupbuy_core::error::{ConflictCode, EngineError};
use groupbuy_core::policy::{RefundTrigger, SettlementState};
use groupbuy_core::store::{EventQuery, ReservationStore};
use groupbuy_core::types::{
    Actor, BLOCK_REASON_FULLY_REFUNDED, EventType, Money, Offer, ReservationStatus,
    SettlementStatus, ShippingMode,
};
use groupbuy_reservations::RefundRequest;
use groupbuy_testing::{helpers, properties};
use proptest::prelude::*;

async fn offer_with_shipping(h: &Harness, capacity: u32) -> Offer {
    h.open(
        helpers::offer(capacity, h.now())
            .with_shipping(ShippingMode::PerReservation, Money::won(3_000)),
    )
    .await
}

#[tokio::test]
async fn partial_refunds_add_up_to_the_whole() {
    let h = Harness::new();
    let offer = offer_with_shipping(&h, 3).await;
    let r = h.delivered(&offer, 3).await;
    let buyer = Actor::Buyer(r.buyer_id);
    assert_eq!(r.amount_total, Money::won(33_000));

    let mut revoked = Vec::new();
    let mut last = r.clone();
    for step in 1..=3u32 {
        let next = h
            .machine
            .refund(r.id, RefundRequest::new(buyer).with_quantity(1))
            .await
            .unwrap();
        assert_eq!(next.refunded_qty, step);
        // Buyer refunds inside the cooling window keep the shipping charge.
        assert_eq!(
            next.refunded_amount_total - last.refunded_amount_total,
            Money::won(10_000)
        );
        revoked.push(next.points_revoked - last.points_revoked);
        last = next;
    }

    assert_eq!(revoked, vec![6, 7, 7]);
    assert_eq!(last.points_revoked, last.points_awarded);
    assert_eq!(last.status, ReservationStatus::Cancelled);
    assert_eq!(h.machine.buyer_points(r.buyer_id).await.unwrap().balance, 0);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().sold, 0);

    let err = h
        .machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(1))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::AlreadyRefunded));
    h.assert_consistent(&offer).await;
}

#[tokio::test]
async fn refunds_reprice_and_finally_block_the_settlement() {
    let h = Harness::new();
    let offer = offer_with_shipping(&h, 3).await;
    let r = h.delivered(&offer, 3).await;
    let buyer = Actor::Buyer(r.buyer_id);

    h.machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(1))
        .await
        .unwrap();
    let settlement = h
        .store
        .get_settlement_for_reservation(r.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settlement.status, SettlementStatus::Ready);
    assert_eq!(settlement.buyer_paid_amount, Money::won(23_000));

    h.machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(2))
        .await
        .unwrap();
    let settlement = h.batcher.get(settlement.id).await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Blocked);
    assert_eq!(
        settlement.block_reason.as_deref(),
        Some(BLOCK_REASON_FULLY_REFUNDED)
    );

    let events = h
        .store
        .list_events(EventQuery {
            settlement_id: Some(settlement.id),
            ..EventQuery::default()
        })
        .await
        .unwrap();
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::SettlementCreated,
            EventType::SettlementAdjusted,
            EventType::SettlementBlocked,
        ]
    );

    // A refund block cannot be lifted by hand.
    let err = h.batcher.unblock(settlement.id, admin()).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::SettlementBlocked));
}

#[tokio::test]
async fn preview_matches_execution_and_writes_nothing() {
    let h = Harness::new();
    let offer = offer_with_shipping(&h, 3).await;
    let r = h.paid(&offer, 3).await;
    let buyer = Actor::Buyer(r.buyer_id);

    let commits = h.store.commit_count();
    let preview = h
        .machine
        .refund_preview(r.id, buyer, Some(2), None)
        .await
        .unwrap();
    assert_eq!(h.store.commit_count(), commits);
    assert_eq!(preview.trigger, RefundTrigger::BuyerCancel);
    assert!(preview.refund_shipping);
    assert_eq!(preview.goods_amount, Money::won(20_000));
    assert_eq!(preview.shipping_amount, Money::won(2_000));
    assert!(!preview.fully_refunded);

    let refunded = h
        .machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(2))
        .await
        .unwrap();
    assert_eq!(refunded.refunded_amount_total, preview.amount_total);
    assert_eq!(refunded.points_revoked, preview.points_reversal);
    assert_eq!(refunded.refunded_qty, preview.refunded_qty_after);

    let event = h
        .store
        .find_event(&format!("reservation:{}:refund:2", r.id))
        .await
        .unwrap()
        .expect("refund event");
    assert_eq!(event.event_type, EventType::ReservationRefunded);
    assert_eq!(event.meta["amount_total"], serde_json::json!(preview.amount_total));
}

#[tokio::test]
async fn refund_quantity_is_validated() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.paid(&offer, 2).await;
    let buyer = Actor::Buyer(r.buyer_id);

    let err = h
        .machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(3))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::RefundQuantityExceeded));

    let err = h
        .machine
        .refund(r.id, RefundRequest::new(buyer).with_quantity(0))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::InvalidQuantity));
    assert_eq!(h.reload(&r).await.refunded_qty, 0);
}

#[tokio::test]
async fn refund_requires_a_paid_reservation() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let r = h.reserve(&offer, 1).await;
    let buyer = Actor::Buyer(r.buyer_id);

    let err = h
        .machine
        .refund(r.id, RefundRequest::new(buyer))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::InvalidState));

    h.machine.cancel(r.id, buyer, None, None).await.unwrap();
    let err = h
        .machine
        .refund(r.id, RefundRequest::new(buyer))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::AlreadyCancelled));
}

#[tokio::test]
async fn buyer_refund_closes_with_the_cooling_window() {
    let h = Harness::new();
    let offer = offer_with_shipping(&h, 1).await;
    let r = h.delivered(&offer, 1).await;
    h.advance(Duration::days(7) + Duration::seconds(1));

    let err = h
        .machine
        .refund(r.id, RefundRequest::new(Actor::Buyer(r.buyer_id)))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::RefundNotAllowed));

    // Buyers cannot escalate their own trigger.
    let err = h
        .machine
        .refund(
            r.id,
            RefundRequest::new(Actor::Buyer(r.buyer_id)).with_trigger(RefundTrigger::DisputeResolve),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    // A dispute outcome still refunds, shipping included.
    let refunded = h
        .machine
        .refund(
            r.id,
            RefundRequest::new(admin())
                .with_trigger(RefundTrigger::DisputeResolve)
                .with_reason("item never matched listing"),
        )
        .await
        .unwrap();
    assert_eq!(refunded.refunded_amount_total, Money::won(13_000));
    assert_eq!(refunded.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn seller_fault_refunds_shipping_after_delivery() {
    let h = Harness::new();
    let offer = offer_with_shipping(&h, 1).await;
    let r = h.delivered(&offer, 1).await;

    let preview = h
        .machine
        .refund_preview(r.id, Actor::Seller(offer.seller_id), None, None)
        .await
        .unwrap();
    assert_eq!(preview.trigger, RefundTrigger::SellerCancel);
    assert!(preview.refund_shipping);
    assert_eq!(preview.amount_total, Money::won(13_000));

    let buyer_view = h
        .machine
        .refund_preview(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap();
    assert!(!buyer_view.refund_shipping);
    assert_eq!(buyer_view.amount_total, Money::won(10_000));
}

#[tokio::test]
async fn refund_after_payout_recovers_from_the_seller() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let r = h.delivered(&offer, 1).await;
    let settlement = h
        .store
        .get_settlement_for_reservation(r.id)
        .await
        .unwrap()
        .unwrap();
    h.batcher.approve(settlement.id, admin()).await.unwrap();
    h.advance(Duration::days(38));
    let batch = h.batcher.bulk_mark_paid(10, Actor::System, None).await.unwrap();
    assert_eq!(batch.paid_ids, vec![settlement.id]);

    let request = RefundRequest::new(admin()).with_trigger(RefundTrigger::DisputeResolve);
    let preview = h
        .machine
        .refund_preview(r.id, admin(), None, request.trigger)
        .await
        .unwrap();
    assert_eq!(preview.settlement, SettlementState::SettledToSeller);
    assert!(!preview.use_pg_refund);
    assert_eq!(preview.settlement_recovery, preview.amount_total);

    h.machine.refund(r.id, request).await.unwrap();
    let after = h.batcher.get(settlement.id).await.unwrap();
    assert_eq!(after.status, SettlementStatus::Paid);
    assert_eq!(after.buyer_paid_amount, settlement.buyer_paid_amount);
}

#[tokio::test]
async fn disabled_refunds_block_paid_cancellation() {
    let mut bundle = helpers::policy();
    bundle.refund.enabled = false;
    let h = Harness::with_policy(bundle);
    let offer = h.offer(1).await;
    let r = h.paid(&offer, 1).await;

    let err = h
        .machine
        .cancel(r.id, Actor::Buyer(r.buyer_id), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::RefundNotAllowed));
    assert_eq!(h.reload(&r).await.status, ReservationStatus::Paid);
}

#[tokio::test]
async fn idempotent_refund_applies_once() {
    let h = Harness::new();
    let offer = h.offer(3).await;
    let r = h.paid(&offer, 3).await;
    let request = RefundRequest::new(Actor::Buyer(r.buyer_id))
        .with_quantity(1)
        .with_idempotency_key("refund-1");

    let first = h.machine.refund(r.id, request.clone()).await.unwrap();
    let again = h.machine.refund(r.id, request).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(h.reload(&r).await.refunded_qty, 1);
    assert_eq!(h.ledger.snapshot(offer.id).await.unwrap().sold, 2);
    h.assert_consistent(&offer).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn unit_refunds_before_shipping_return_the_whole_charge(
        (mode, fee) in properties::shipping(),
        rule in properties::cancel_rule(),
        qty in 1u32..=6,
        cancel_first in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let h = Harness::new();
            let offer = h
                .open(
                    helpers::offer(qty, h.now())
                        .with_shipping(mode, fee)
                        .with_cancel_rule(rule),
                )
                .await;
            let r = h.paid(&offer, qty).await;
            let buyer = Actor::Buyer(r.buyer_id);

            let done = if cancel_first {
                h.machine.cancel(r.id, buyer, None, None).await.unwrap()
            } else {
                let mut last = r.clone();
                for _ in 0..qty {
                    last = h
                        .machine
                        .refund(r.id, RefundRequest::new(buyer).with_quantity(1))
                        .await
                        .unwrap();
                }
                last
            };

            assert_eq!(done.status, ReservationStatus::Cancelled);
            assert_eq!(done.refunded_qty, qty);
            assert_eq!(done.refunded_amount_total, r.amount_total);
            assert_eq!(done.points_revoked, done.points_awarded);
            h.assert_consistent(&offer).await;
        });
    }
}
