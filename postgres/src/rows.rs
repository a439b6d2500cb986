//! Row decoding and error mapping.

use groupbuy_core::error::StoreError;
use groupbuy_core::store::IdempotencyRecord;
use groupbuy_core::types::{
    BuyerId, CancelRule, DealId, EventLog, EventType, Money, Offer, OfferId, Reservation,
    ReservationId, ReservationSettlement, ReservationStatus, SellerId, SettlementId,
    SettlementStatus, ShippingMode,
};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Columns selected for an offer.
pub(crate) const OFFER_COLUMNS: &str = "id, deal_id, seller_id, price, capacity, reserved_qty, \
     sold_qty, shipping_mode, shipping_fee, cancel_rule, cancel_within_days, is_active, \
     is_confirmed, created_at, deadline_at";

/// Columns selected for a reservation.
pub(crate) const RESERVATION_COLUMNS: &str = "id, deal_id, offer_id, buyer_id, qty, status, \
     amount_goods, amount_shipping, amount_total, created_at, expires_at, paid_at, shipped_at, \
     delivered_at, cancelled_at, expired_at, tracking_number, refunded_qty, \
     refunded_amount_total, points_awarded, points_revoked, idempotency_key, version";

/// Columns selected for a settlement.
pub(crate) const SETTLEMENT_COLUMNS: &str = "id, reservation_id, offer_id, seller_id, \
     buyer_paid_amount, pg_fee_amount, platform_commission_amount, seller_payout_amount, \
     commission_rate_bp, status, created_at, approved_at, paid_at, scheduled_payout_at, \
     block_reason";

/// Columns selected for an event.
pub(crate) const EVENT_COLUMNS: &str = "event_type, actor_type, actor_id, reason, \
     idempotency_key, meta, reservation_id, offer_id, settlement_id, created_at";

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Map a sqlx error onto the store taxonomy.
pub(crate) fn db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::DuplicateKey(
                db.constraint().unwrap_or_else(|| db.message()).to_string(),
            );
        }
        if matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED)
        ) {
            return StoreError::Contention(db.message().to_string());
        }
    }
    StoreError::Database(err.to_string())
}

fn corrupt(column: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("invalid {column}: {value}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(db_err)
}

fn qty(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = get(row, column)?;
    u32::try_from(value).map_err(|_| corrupt(column, value))
}

fn money(row: &PgRow, column: &str) -> Result<Money, StoreError> {
    Ok(Money::won(get(row, column)?))
}

fn uuid(row: &PgRow, column: &str) -> Result<Uuid, StoreError> {
    get(row, column)
}

fn opt_uuid(row: &PgRow, column: &str) -> Result<Option<Uuid>, StoreError> {
    get(row, column)
}

/// Encode a quantity for a BIGINT column.
pub(crate) fn qty_param(value: u32) -> i64 {
    i64::from(value)
}

/// Encode a version for a BIGINT column.
pub(crate) fn version_param(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| corrupt("version", value))
}

pub(crate) fn row_to_offer(row: &PgRow) -> Result<Offer, StoreError> {
    let mode: String = get(row, "shipping_mode")?;
    let rule: String = get(row, "cancel_rule")?;
    let days: Option<i64> = get(row, "cancel_within_days")?;
    let days = days
        .map(|d| u32::try_from(d).map_err(|_| corrupt("cancel_within_days", d)))
        .transpose()?;

    Ok(Offer {
        id: OfferId::from_uuid(uuid(row, "id")?),
        deal_id: DealId::from_uuid(uuid(row, "deal_id")?),
        seller_id: SellerId::from_uuid(uuid(row, "seller_id")?),
        price: money(row, "price")?,
        capacity: qty(row, "capacity")?,
        reserved_qty: qty(row, "reserved_qty")?,
        sold_qty: qty(row, "sold_qty")?,
        shipping_mode: ShippingMode::parse(&mode).ok_or_else(|| corrupt("shipping_mode", &mode))?,
        shipping_fee: money(row, "shipping_fee")?,
        cancel_rule: CancelRule::from_parts(&rule, days)
            .ok_or_else(|| corrupt("cancel_rule", &rule))?,
        is_active: get(row, "is_active")?,
        is_confirmed: get(row, "is_confirmed")?,
        created_at: get(row, "created_at")?,
        deadline_at: get(row, "deadline_at")?,
    })
}

pub(crate) fn row_to_reservation(row: &PgRow) -> Result<Reservation, StoreError> {
    let status: String = get(row, "status")?;
    let version: i64 = get(row, "version")?;

    Ok(Reservation {
        id: ReservationId::from_uuid(uuid(row, "id")?),
        deal_id: DealId::from_uuid(uuid(row, "deal_id")?),
        offer_id: OfferId::from_uuid(uuid(row, "offer_id")?),
        buyer_id: BuyerId::from_uuid(uuid(row, "buyer_id")?),
        qty: qty(row, "qty")?,
        status: ReservationStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        amount_goods: money(row, "amount_goods")?,
        amount_shipping: money(row, "amount_shipping")?,
        amount_total: money(row, "amount_total")?,
        created_at: get(row, "created_at")?,
        expires_at: get(row, "expires_at")?,
        paid_at: get(row, "paid_at")?,
        shipped_at: get(row, "shipped_at")?,
        delivered_at: get(row, "delivered_at")?,
        cancelled_at: get(row, "cancelled_at")?,
        expired_at: get(row, "expired_at")?,
        tracking_number: get(row, "tracking_number")?,
        refunded_qty: qty(row, "refunded_qty")?,
        refunded_amount_total: money(row, "refunded_amount_total")?,
        points_awarded: get(row, "points_awarded")?,
        points_revoked: get(row, "points_revoked")?,
        idempotency_key: get(row, "idempotency_key")?,
        version: u64::try_from(version).map_err(|_| corrupt("version", version))?,
    })
}

pub(crate) fn row_to_settlement(row: &PgRow) -> Result<ReservationSettlement, StoreError> {
    let status: String = get(row, "status")?;

    Ok(ReservationSettlement {
        id: SettlementId::from_uuid(uuid(row, "id")?),
        reservation_id: ReservationId::from_uuid(uuid(row, "reservation_id")?),
        offer_id: OfferId::from_uuid(uuid(row, "offer_id")?),
        seller_id: SellerId::from_uuid(uuid(row, "seller_id")?),
        buyer_paid_amount: money(row, "buyer_paid_amount")?,
        pg_fee_amount: money(row, "pg_fee_amount")?,
        platform_commission_amount: money(row, "platform_commission_amount")?,
        seller_payout_amount: money(row, "seller_payout_amount")?,
        commission_rate_bp: qty(row, "commission_rate_bp")?,
        status: SettlementStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        created_at: get(row, "created_at")?,
        approved_at: get(row, "approved_at")?,
        paid_at: get(row, "paid_at")?,
        scheduled_payout_at: get(row, "scheduled_payout_at")?,
        block_reason: get(row, "block_reason")?,
    })
}

pub(crate) fn row_to_event(row: &PgRow) -> Result<EventLog, StoreError> {
    let event_type: String = get(row, "event_type")?;

    Ok(EventLog {
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| corrupt("event_type", &event_type))?,
        actor_type: get(row, "actor_type")?,
        actor_id: get(row, "actor_id")?,
        reason: get(row, "reason")?,
        idempotency_key: get(row, "idempotency_key")?,
        meta: get(row, "meta")?,
        reservation_id: opt_uuid(row, "reservation_id")?.map(ReservationId::from_uuid),
        offer_id: opt_uuid(row, "offer_id")?.map(OfferId::from_uuid),
        settlement_id: opt_uuid(row, "settlement_id")?.map(SettlementId::from_uuid),
        created_at: get(row, "created_at")?,
    })
}

pub(crate) fn row_to_idempotency(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    Ok(IdempotencyRecord {
        key: get(row, "key")?,
        operation: get(row, "operation")?,
        fingerprint: get(row, "fingerprint")?,
        reservation_id: ReservationId::from_uuid(uuid(row, "reservation_id")?),
        response: get(row, "response")?,
        created_at: get(row, "created_at")?,
    })
}
