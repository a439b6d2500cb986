//! Transactional application of a [`Commit`].

use crate::rows::{OFFER_COLUMNS, db_err, qty_param, row_to_offer, version_param};
use groupbuy_core::error::StoreError;
use groupbuy_core::store::{
    Commit, CommitOutcome, IdempotencyRecord, OfferDelta, ReservationWrite, SettlementWrite,
    SoldOutAward,
};
use groupbuy_core::types::{
    EventLog, OfferId, PointEntry, PointHolder, Reservation, ReservationSettlement,
};
use sqlx::{PgConnection, PgPool};
use std::time::Instant;

/// Apply every write in `commit` in one transaction.
pub(crate) async fn apply(pool: &PgPool, commit: Commit) -> Result<CommitOutcome, StoreError> {
    let started = Instant::now();
    let result = apply_in_transaction(pool, commit).await;

    metrics::histogram!("store_commit_duration_seconds").record(started.elapsed().as_secs_f64());
    if let Err(err) = &result {
        if err.is_retryable() || matches!(err, StoreError::CapacityExceeded { .. }) {
            metrics::counter!("store_commit_conflicts_total", "kind" => conflict_kind(err))
                .increment(1);
        }
    }
    result
}

const fn conflict_kind(err: &StoreError) -> &'static str {
    match err {
        StoreError::VersionConflict { .. } => "version",
        StoreError::StatusMismatch { .. } => "status",
        StoreError::CapacityExceeded { .. } => "capacity",
        _ => "contention",
    }
}

async fn apply_in_transaction(pool: &PgPool, commit: Commit) -> Result<CommitOutcome, StoreError> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    let mut outcome = CommitOutcome::default();

    // The idempotency key goes in before any guard. A concurrent request with
    // the same key blocks on the unique index here, then fails with
    // DuplicateKey and replays, instead of failing on capacity the first
    // request already took.
    if let Some(record) = &commit.idempotency {
        insert_idempotency(&mut *tx, record).await?;
    }

    // Reservation row next, then the offer row: a stale writer fails on its
    // version before touching any counter.
    if let Some(ReservationWrite::Update {
        reservation,
        expected_version,
    }) = &commit.reservation
    {
        lock_reservation(&mut *tx, reservation, *expected_version).await?;
    }

    if let Some(delta) = commit.offer {
        let award = apply_offer_delta(&mut *tx, &delta, &mut outcome).await?;
        if let Some(award) = award {
            insert_sold_out_award(&mut *tx, delta.offer_id, award).await?;
        }
    }

    if let Some(write) = &commit.reservation {
        write_reservation(&mut *tx, write).await?;
    }

    if let Some(write) = &commit.settlement {
        write_settlement(&mut *tx, write).await?;
    }

    for event in &commit.events {
        insert_event(&mut *tx, event, false).await?;
    }

    for entry in &commit.points {
        insert_points(&mut *tx, entry).await?;
    }

    tx.commit().await.map_err(db_err)?;
    Ok(outcome)
}

async fn apply_offer_delta(
    conn: &mut PgConnection,
    delta: &OfferDelta,
    outcome: &mut CommitOutcome,
) -> Result<Option<SoldOutAward>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1 FOR UPDATE"
    ))
    .bind(*delta.offer_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or_else(|| StoreError::NotFound {
        entity: "offer",
        id: delta.offer_id.to_string(),
    })?;
    let current = row_to_offer(&row)?;

    let reserved = i64::from(current.reserved_qty) + delta.reserved;
    let sold = i64::from(current.sold_qty) + delta.sold;
    if reserved < 0 || sold < 0 {
        return Err(StoreError::CounterUnderflow {
            offer_id: current.id.to_string(),
            counter: if reserved < 0 { "reserved_qty" } else { "sold_qty" },
        });
    }

    let confirm = delta.on_sold_out.is_some()
        && !current.is_confirmed
        && sold == i64::from(current.capacity);

    // The WHERE clause repeats the capacity check so the increment and the
    // check are one statement.
    let updated = sqlx::query(&format!(
        "UPDATE offers \
         SET reserved_qty = reserved_qty + $2, \
             sold_qty = sold_qty + $3, \
             is_confirmed = is_confirmed OR $4 \
         WHERE id = $1 \
           AND reserved_qty + $2 >= 0 \
           AND sold_qty + $3 >= 0 \
           AND reserved_qty + sold_qty + $2 + $3 <= capacity \
         RETURNING {OFFER_COLUMNS}"
    ))
    .bind(*delta.offer_id.as_uuid())
    .bind(delta.reserved)
    .bind(delta.sold)
    .bind(confirm)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?
    .ok_or(StoreError::CapacityExceeded {
        available: current.available(),
    })?;

    let offer = row_to_offer(&updated)?;
    tracing::trace!(
        offer_id = %offer.id,
        reserved_qty = offer.reserved_qty,
        sold_qty = offer.sold_qty,
        capacity = offer.capacity,
        "Offer counters updated"
    );
    outcome.offer = Some(offer);
    outcome.offer_confirmed = confirm;
    Ok(if confirm { delta.on_sold_out.clone() } else { None })
}

async fn insert_sold_out_award(
    conn: &mut PgConnection,
    offer_id: OfferId,
    award: SoldOutAward,
) -> Result<(), StoreError> {
    insert_event(conn, &award.event, true).await?;
    insert_points(
        conn,
        &PointEntry {
            holder: PointHolder::Seller(award.seller_id),
            amount: award.points,
            reason: "offer confirmed".to_string(),
            idempotency_key: format!("pt:offer_confirmed:{offer_id}"),
            created_at: award.event.created_at,
        },
    )
    .await
}

async fn lock_reservation(
    conn: &mut PgConnection,
    r: &Reservation,
    expected_version: u64,
) -> Result<(), StoreError> {
    let current: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM reservations WHERE id = $1 FOR UPDATE")
            .bind(*r.id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;

    match current {
        None => Err(StoreError::NotFound {
            entity: "reservation",
            id: r.id.to_string(),
        }),
        Some((version,)) if version == version_param(expected_version)? => Ok(()),
        Some(_) => Err(StoreError::VersionConflict {
            entity: "reservation",
            id: r.id.to_string(),
            expected: expected_version,
        }),
    }
}

async fn write_reservation(
    conn: &mut PgConnection,
    write: &ReservationWrite,
) -> Result<(), StoreError> {
    match write {
        ReservationWrite::Insert(r) => {
            sqlx::query(
                r"
                INSERT INTO reservations (
                    id, deal_id, offer_id, buyer_id, qty, status,
                    amount_goods, amount_shipping, amount_total,
                    created_at, expires_at, paid_at, shipped_at, delivered_at,
                    cancelled_at, expired_at, tracking_number,
                    refunded_qty, refunded_amount_total, points_awarded, points_revoked,
                    idempotency_key, version
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
                )
                ",
            )
            .bind(*r.id.as_uuid())
            .bind(*r.deal_id.as_uuid())
            .bind(*r.offer_id.as_uuid())
            .bind(*r.buyer_id.as_uuid())
            .bind(qty_param(r.qty))
            .bind(r.status.as_str())
            .bind(r.amount_goods.amount())
            .bind(r.amount_shipping.amount())
            .bind(r.amount_total.amount())
            .bind(r.created_at)
            .bind(r.expires_at)
            .bind(r.paid_at)
            .bind(r.shipped_at)
            .bind(r.delivered_at)
            .bind(r.cancelled_at)
            .bind(r.expired_at)
            .bind(&r.tracking_number)
            .bind(qty_param(r.refunded_qty))
            .bind(r.refunded_amount_total.amount())
            .bind(r.points_awarded)
            .bind(r.points_revoked)
            .bind(&r.idempotency_key)
            .bind(version_param(r.version)?)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        ReservationWrite::Update {
            reservation,
            expected_version,
        } => update_reservation(conn, reservation, *expected_version).await?,
    }
    Ok(())
}

async fn update_reservation(
    conn: &mut PgConnection,
    r: &Reservation,
    expected_version: u64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r"
        UPDATE reservations
        SET status = $3,
            paid_at = $4,
            shipped_at = $5,
            delivered_at = $6,
            cancelled_at = $7,
            expired_at = $8,
            tracking_number = $9,
            refunded_qty = $10,
            refunded_amount_total = $11,
            points_awarded = $12,
            points_revoked = $13,
            version = $14
        WHERE id = $1 AND version = $2
        ",
    )
    .bind(*r.id.as_uuid())
    .bind(version_param(expected_version)?)
    .bind(r.status.as_str())
    .bind(r.paid_at)
    .bind(r.shipped_at)
    .bind(r.delivered_at)
    .bind(r.cancelled_at)
    .bind(r.expired_at)
    .bind(&r.tracking_number)
    .bind(qty_param(r.refunded_qty))
    .bind(r.refunded_amount_total.amount())
    .bind(r.points_awarded)
    .bind(r.points_revoked)
    .bind(version_param(r.version)?)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            entity: "reservation",
            id: r.id.to_string(),
            expected: expected_version,
        });
    }
    Ok(())
}

async fn write_settlement(
    conn: &mut PgConnection,
    write: &SettlementWrite,
) -> Result<(), StoreError> {
    match write {
        SettlementWrite::Insert(s) => {
            sqlx::query(
                r"
                INSERT INTO reservation_settlements (
                    id, reservation_id, offer_id, seller_id,
                    buyer_paid_amount, pg_fee_amount, platform_commission_amount,
                    seller_payout_amount, commission_rate_bp, status,
                    created_at, approved_at, paid_at, scheduled_payout_at, block_reason
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(*s.id.as_uuid())
            .bind(*s.reservation_id.as_uuid())
            .bind(*s.offer_id.as_uuid())
            .bind(*s.seller_id.as_uuid())
            .bind(s.buyer_paid_amount.amount())
            .bind(s.pg_fee_amount.amount())
            .bind(s.platform_commission_amount.amount())
            .bind(s.seller_payout_amount.amount())
            .bind(qty_param(s.commission_rate_bp))
            .bind(s.status.as_str())
            .bind(s.created_at)
            .bind(s.approved_at)
            .bind(s.paid_at)
            .bind(s.scheduled_payout_at)
            .bind(&s.block_reason)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        SettlementWrite::Update {
            settlement,
            expected_status,
        } => {
            let s: &ReservationSettlement = settlement;
            let result = sqlx::query(
                r"
                UPDATE reservation_settlements
                SET buyer_paid_amount = $3,
                    pg_fee_amount = $4,
                    platform_commission_amount = $5,
                    seller_payout_amount = $6,
                    status = $7,
                    approved_at = $8,
                    paid_at = $9,
                    block_reason = $10
                WHERE id = $1 AND status = $2
                ",
            )
            .bind(*s.id.as_uuid())
            .bind(expected_status.as_str())
            .bind(s.buyer_paid_amount.amount())
            .bind(s.pg_fee_amount.amount())
            .bind(s.platform_commission_amount.amount())
            .bind(s.seller_payout_amount.amount())
            .bind(s.status.as_str())
            .bind(s.approved_at)
            .bind(s.paid_at)
            .bind(&s.block_reason)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::StatusMismatch {
                    id: s.id.to_string(),
                    expected: expected_status.as_str().to_string(),
                });
            }
        }
    }
    Ok(())
}

async fn insert_event(
    conn: &mut PgConnection,
    event: &EventLog,
    skip_duplicate: bool,
) -> Result<(), StoreError> {
    let on_conflict = if skip_duplicate {
        "ON CONFLICT (idempotency_key) DO NOTHING"
    } else {
        ""
    };
    sqlx::query(&format!(
        "INSERT INTO event_logs (
            event_type, actor_type, actor_id, reason, idempotency_key, meta,
            reservation_id, offer_id, settlement_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) {on_conflict}"
    ))
    .bind(event.event_type.as_str())
    .bind(&event.actor_type)
    .bind(&event.actor_id)
    .bind(&event.reason)
    .bind(&event.idempotency_key)
    .bind(&event.meta)
    .bind(event.reservation_id.map(|id| *id.as_uuid()))
    .bind(event.offer_id.map(|id| *id.as_uuid()))
    .bind(event.settlement_id.map(|id| *id.as_uuid()))
    .bind(event.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_points(conn: &mut PgConnection, entry: &PointEntry) -> Result<(), StoreError> {
    let result = sqlx::query(
        r"
        INSERT INTO point_entries (holder_type, holder_id, amount, reason, idempotency_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) DO NOTHING
        ",
    )
    .bind(entry.holder.kind())
    .bind(entry.holder.id())
    .bind(entry.amount)
    .bind(&entry.reason)
    .bind(&entry.idempotency_key)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        tracing::debug!(key = %entry.idempotency_key, "Point entry already recorded");
    }
    Ok(())
}

async fn insert_idempotency(
    conn: &mut PgConnection,
    record: &IdempotencyRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO idempotency_records (key, operation, fingerprint, reservation_id, response, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
    )
    .bind(&record.key)
    .bind(&record.operation)
    .bind(&record.fingerprint)
    .bind(*record.reservation_id.as_uuid())
    .bind(&record.response)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}
