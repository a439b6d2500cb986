//! Settlement approval, blocking and batched payout.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use chrono::Duration;
use common::{Harness, admin};
use groupbuy_core::error::{ConflictCode, StoreError};
use groupbuy_core::store::{Commit, EventQuery, ReservationStore};
use groupbuy_core::types::{
    Actor, BuyerId, EventLog, EventType, Offer, ReservationSettlement, SettlementStatus,
};

async fn settlement_for(h: &Harness, offer: &Offer) -> ReservationSettlement {
    let r = h.delivered(offer, 1).await;
    h.store
        .get_settlement_for_reservation(r.id)
        .await
        .unwrap()
        .expect("settlement opened on arrival")
}

#[tokio::test]
async fn approve_is_operator_only_and_repeatable() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let s = settlement_for(&h, &offer).await;

    let err = h
        .batcher
        .approve(s.id, Actor::Seller(offer.seller_id))
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::NotOwned));

    let approved = h.batcher.approve(s.id, admin()).await.unwrap();
    assert_eq!(approved.status, SettlementStatus::Approved);
    assert_eq!(approved.approved_at, Some(h.now()));

    let again = h.batcher.approve(s.id, admin()).await.unwrap();
    assert_eq!(again, approved);
    let approvals = h
        .store
        .list_events(EventQuery {
            event_type: Some(EventType::SettlementApproved),
            settlement_id: Some(s.id),
            ..EventQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(approvals.len(), 1);
}

#[tokio::test]
async fn batch_pays_only_due_approved_settlements() {
    let h = Harness::new();
    let offer = h.offer(4).await;

    let due = settlement_for(&h, &offer).await;
    let blocked = settlement_for(&h, &offer).await;
    let unapproved = settlement_for(&h, &offer).await;
    h.batcher.approve(due.id, admin()).await.unwrap();
    h.batcher.approve(blocked.id, admin()).await.unwrap();
    h.batcher
        .block(blocked.id, admin(), "chargeback review".into())
        .await
        .unwrap();

    h.advance(Duration::days(20));
    let future = settlement_for(&h, &offer).await;
    h.batcher.approve(future.id, admin()).await.unwrap();

    // Past the first three payout dates but not the fourth.
    h.advance(Duration::days(18));
    let batch = h
        .batcher
        .bulk_mark_paid(50, Actor::System, Some("batch-1".into()))
        .await
        .unwrap();
    assert_eq!(batch.batch_id, "batch-1");
    assert_eq!(batch.paid_ids, vec![due.id]);
    assert_eq!(batch.paid_count, 1);
    assert_eq!(batch.skipped, 1);
    assert!(batch.completed);

    let paid = h.batcher.get(due.id).await.unwrap();
    assert_eq!(paid.status, SettlementStatus::Paid);
    assert_eq!(paid.paid_at, Some(h.now()));
    assert_eq!(
        h.batcher.get(future.id).await.unwrap().status,
        SettlementStatus::Approved
    );
    assert_eq!(
        h.batcher.get(blocked.id).await.unwrap().status,
        SettlementStatus::Blocked
    );
    assert_eq!(
        h.batcher.get(unapproved.id).await.unwrap().status,
        SettlementStatus::Ready
    );

    let start = h.store.find_event("paid_batch:batch-1:start").await.unwrap();
    let end = h.store.find_event("paid_batch:batch-1:end").await.unwrap();
    assert!(start.is_some());
    let end = end.expect("end marker");
    assert_eq!(end.meta["paid_count"], 1);
    assert_eq!(end.meta["skipped"], 1);
}

#[tokio::test]
async fn replaying_a_batch_id_pays_nothing_twice() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let first = settlement_for(&h, &offer).await;
    h.batcher.approve(first.id, admin()).await.unwrap();
    h.advance(Duration::days(40));

    let batch = h
        .batcher
        .bulk_mark_paid(10, admin(), Some("nightly".into()))
        .await
        .unwrap();
    assert_eq!(batch.paid_ids, vec![first.id]);

    // A settlement approved after the batch ran is not swept into it.
    let second = settlement_for(&h, &offer).await;
    h.batcher.approve(second.id, admin()).await.unwrap();
    h.advance(Duration::days(40));

    let commits = h.store.commit_count();
    let replay = h
        .batcher
        .bulk_mark_paid(10, admin(), Some("nightly".into()))
        .await
        .unwrap();
    assert_eq!(replay, batch);
    assert_eq!(h.store.commit_count(), commits);
    assert_eq!(
        h.batcher.get(second.id).await.unwrap().status,
        SettlementStatus::Approved
    );

    let looked_up = h.batcher.get_paid_batch("nightly").await.unwrap();
    assert_eq!(looked_up, Some(batch));
    assert_eq!(h.batcher.get_paid_batch("never-ran").await.unwrap(), None);
}

#[tokio::test]
async fn batch_limit_caps_each_run() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let a = settlement_for(&h, &offer).await;
    let b = settlement_for(&h, &offer).await;
    h.batcher.approve(a.id, admin()).await.unwrap();
    h.batcher.approve(b.id, admin()).await.unwrap();
    h.advance(Duration::days(40));

    let commits = h.store.commit_count();
    let first = h
        .batcher
        .bulk_mark_paid(1, Actor::System, Some("small".into()))
        .await
        .unwrap();
    // Start marker, one payout, end marker.
    assert_eq!(h.store.commit_count(), commits + 3);
    assert_eq!(first.paid_count, 1);

    let second = h
        .batcher
        .bulk_mark_paid(10, Actor::System, Some("small-2".into()))
        .await
        .unwrap();
    assert_eq!(second.paid_count, 1);
    assert_ne!(second.paid_ids, first.paid_ids);

    let paid = h
        .store
        .list_settlements(SettlementStatus::Paid, 10)
        .await
        .unwrap();
    assert_eq!(paid.len(), 2);
}

#[tokio::test]
async fn started_batch_resumes_under_its_id() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let s = settlement_for(&h, &offer).await;
    h.batcher.approve(s.id, admin()).await.unwrap();
    h.advance(Duration::days(40));

    // A worker wrote the start marker and died before paying anything.
    let start = EventLog::new(
        EventType::SettlementBatch,
        &Actor::System,
        "paid_batch:crashed:start",
        h.now(),
    )
    .with_meta(serde_json::json!({ "batch_id": "crashed", "phase": "start" }));
    h.store.commit(Commit::new().event(start)).await.unwrap();

    let interrupted = h.batcher.get_paid_batch("crashed").await.unwrap().unwrap();
    assert!(!interrupted.completed);
    assert_eq!(interrupted.paid_count, 0);

    let resumed = h
        .batcher
        .bulk_mark_paid(10, Actor::System, Some("crashed".into()))
        .await
        .unwrap();
    assert!(resumed.completed);
    assert_eq!(resumed.paid_ids, vec![s.id]);
}

#[tokio::test]
async fn failed_payouts_are_counted_and_left_approved() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let s = settlement_for(&h, &offer).await;
    h.batcher.approve(s.id, admin()).await.unwrap();
    h.advance(Duration::days(40));

    // The start marker reports as already written, then the payout fails.
    h.store.inject_commit_failures([
        StoreError::DuplicateKey("paid_batch:flaky:start".into()),
        StoreError::Database("connection reset".into()),
    ]);
    let batch = h
        .batcher
        .bulk_mark_paid(10, Actor::System, Some("flaky".into()))
        .await
        .unwrap();
    assert_eq!(batch.paid_count, 0);
    assert!(batch.completed);
    let end = h.store.find_event("paid_batch:flaky:end").await.unwrap().unwrap();
    assert_eq!(end.meta["failed"], 1);
    assert_eq!(
        h.batcher.get(s.id).await.unwrap().status,
        SettlementStatus::Approved
    );

    let err = h
        .batcher
        .bulk_mark_paid(10, Actor::Buyer(BuyerId::new()), None)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::NotOwned));

    let retry = h
        .batcher
        .bulk_mark_paid(10, Actor::System, None)
        .await
        .unwrap();
    assert_eq!(retry.paid_ids, vec![s.id]);
}

#[tokio::test]
async fn block_and_unblock() {
    let h = Harness::new();
    let offer = h.offer(2).await;
    let s = settlement_for(&h, &offer).await;

    let blocked = h
        .batcher
        .block(s.id, admin(), "fraud check".into())
        .await
        .unwrap();
    assert_eq!(blocked.status, SettlementStatus::Blocked);
    assert_eq!(blocked.block_reason.as_deref(), Some("fraud check"));
    assert_eq!(
        h.batcher
            .block(s.id, admin(), "again".into())
            .await
            .unwrap(),
        blocked
    );

    let err = h.batcher.approve(s.id, admin()).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::SettlementBlocked));

    let ready = h.batcher.unblock(s.id, admin()).await.unwrap();
    assert_eq!(ready.status, SettlementStatus::Ready);
    assert_eq!(ready.block_reason, None);

    let err = h.batcher.unblock(s.id, admin()).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::InvalidState));

    let err = h
        .batcher
        .block(s.id, Actor::Seller(offer.seller_id), "mine".into())
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::NotOwned));
}

#[tokio::test]
async fn paid_settlements_cannot_be_blocked() {
    let h = Harness::new();
    let offer = h.offer(1).await;
    let s = settlement_for(&h, &offer).await;
    h.batcher.approve(s.id, admin()).await.unwrap();
    h.advance(Duration::days(40));
    h.batcher.bulk_mark_paid(10, Actor::System, None).await.unwrap();

    let err = h
        .batcher
        .block(s.id, admin(), "late dispute".into())
        .await
        .unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::AlreadyPaid));
    let err = h.batcher.approve(s.id, admin()).await.unwrap_err();
    assert_eq!(err.conflict_code(), Some(ConflictCode::AlreadyPaid));
}
