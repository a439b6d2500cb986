//! `PostgreSQL` persistence for the group-buy reservation engine.
//!
//! [`PostgresStore`] implements [`ReservationStore`] with sqlx. Each
//! [`Commit`] runs in one transaction:
//!
//! 1. Lock the reservation row being updated and check its version
//! 2. Lock the offer row (`SELECT ... FOR UPDATE`) and apply the counter
//!    delta with a conditional `UPDATE` whose `WHERE` clause re-checks
//!    `reserved_qty + sold_qty <= capacity` and non-negativity
//! 3. Write the reservation, guarded by its version
//! 4. Write the settlement, guarded by its status
//! 5. Insert audit events, point entries and the idempotency record
//!
//! Any failure rolls the whole transaction back.
//!
//! # Example
//!
//! ```no_run
//! use groupbuy_postgres::PostgresStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresStore::connect("postgres://localhost/groupbuy").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod commit;
mod rows;

use chrono::{DateTime, Utc};
use groupbuy_core::error::StoreError;
use groupbuy_core::store::{
    Commit, CommitOutcome, EventQuery, IdempotencyRecord, ReservationStore, StoreFuture,
};
use groupbuy_core::types::{
    EventLog, Offer, OfferId, PointHolder, Reservation, ReservationId, ReservationSettlement,
    SellerId, SellerStats, SettlementId, SettlementStatus,
};
use rows::{
    EVENT_COLUMNS, OFFER_COLUMNS, RESERVATION_COLUMNS, SETTLEMENT_COLUMNS, db_err, qty_param,
    row_to_event, row_to_idempotency, row_to_offer, row_to_reservation, row_to_settlement,
};
use sqlx::PgPool;

/// `PostgreSQL`-backed [`ReservationStore`].
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::from_pool(pool))
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    async fn fetch_reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn fetch_settlement(
        &self,
        column: &'static str,
        id: uuid::Uuid,
    ) -> Result<Option<ReservationSettlement>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SETTLEMENT_COLUMNS} FROM reservation_settlements WHERE {column} = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_settlement).transpose()
    }
}

#[allow(clippy::cast_possible_wrap)] // Limits are small, i64 is safe
const fn limit_param(limit: usize) -> i64 {
    limit as i64
}

impl ReservationStore for PostgresStore {
    fn insert_offer(&self, offer: Offer) -> StoreFuture<'_, Offer> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO offers (
                    id, deal_id, seller_id, price, capacity, reserved_qty, sold_qty,
                    shipping_mode, shipping_fee, cancel_rule, cancel_within_days,
                    is_active, is_confirmed, created_at, deadline_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ",
            )
            .bind(*offer.id.as_uuid())
            .bind(*offer.deal_id.as_uuid())
            .bind(*offer.seller_id.as_uuid())
            .bind(offer.price.amount())
            .bind(qty_param(offer.capacity))
            .bind(qty_param(offer.reserved_qty))
            .bind(qty_param(offer.sold_qty))
            .bind(offer.shipping_mode.as_str())
            .bind(offer.shipping_fee.amount())
            .bind(offer.cancel_rule.as_str())
            .bind(offer.cancel_rule.days().map(qty_param))
            .bind(offer.is_active)
            .bind(offer.is_confirmed)
            .bind(offer.created_at)
            .bind(offer.deadline_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            tracing::debug!(offer_id = %offer.id, capacity = offer.capacity, "Offer created");
            Ok(offer)
        })
    }

    fn get_offer(&self, id: OfferId) -> StoreFuture<'_, Option<Offer>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1"))
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            row.as_ref().map(row_to_offer).transpose()
        })
    }

    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(self.fetch_reservation(id))
    }

    fn list_reservations_for_offer(&self, id: OfferId) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE offer_id = $1 ORDER BY created_at ASC"
            ))
            .bind(*id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_reservation).collect()
        })
    }

    fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE status = 'PENDING' AND expires_at <= $1 \
                 ORDER BY expires_at ASC LIMIT $2"
            ))
            .bind(now)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_reservation).collect()
        })
    }

    fn get_settlement(&self, id: SettlementId) -> StoreFuture<'_, Option<ReservationSettlement>> {
        Box::pin(self.fetch_settlement("id", *id.as_uuid()))
    }

    fn get_settlement_for_reservation(
        &self,
        id: ReservationId,
    ) -> StoreFuture<'_, Option<ReservationSettlement>> {
        Box::pin(self.fetch_settlement("reservation_id", *id.as_uuid()))
    }

    fn list_settlements(
        &self,
        status: SettlementStatus,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReservationSettlement>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {SETTLEMENT_COLUMNS} FROM reservation_settlements \
                 WHERE status = $1 ORDER BY scheduled_payout_at ASC, id ASC LIMIT $2"
            ))
            .bind(status.as_str())
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_settlement).collect()
        })
    }

    fn seller_stats(&self, seller_id: SellerId) -> StoreFuture<'_, SellerStats> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM reservations r
                JOIN offers o ON o.id = r.offer_id
                WHERE o.seller_id = $1 AND r.status = 'DELIVERED'
                ",
            )
            .bind(*seller_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            Ok(SellerStats {
                completed_sales: u64::try_from(count).unwrap_or(0),
                rating: None,
            })
        })
    }

    fn find_idempotency(&self, key: &str) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        let key = key.to_owned();
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT key, operation, fingerprint, reservation_id, response, created_at
                FROM idempotency_records
                WHERE key = $1
                ",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            row.as_ref().map(row_to_idempotency).transpose()
        })
    }

    fn find_event(&self, key: &str) -> StoreFuture<'_, Option<EventLog>> {
        let key = key.to_owned();
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM event_logs WHERE idempotency_key = $1"
            ))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            row.as_ref().map(row_to_event).transpose()
        })
    }

    fn list_events(&self, query: EventQuery) -> StoreFuture<'_, Vec<EventLog>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM event_logs \
                 WHERE ($1::text IS NULL OR event_type = $1) \
                   AND ($2::uuid IS NULL OR reservation_id = $2) \
                   AND ($3::uuid IS NULL OR settlement_id = $3) \
                   AND ($4::text IS NULL OR meta->>'batch_id' = $4) \
                 ORDER BY id ASC"
            ))
            .bind(query.event_type.map(|t| t.as_str()))
            .bind(query.reservation_id.map(|id| *id.as_uuid()))
            .bind(query.settlement_id.map(|id| *id.as_uuid()))
            .bind(query.batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            rows.iter().map(row_to_event).collect()
        })
    }

    fn points_balance(&self, holder: PointHolder) -> StoreFuture<'_, i64> {
        Box::pin(async move {
            let (balance,): (Option<i64>,) = sqlx::query_as(
                r"
                SELECT SUM(amount)::BIGINT
                FROM point_entries
                WHERE holder_type = $1 AND holder_id = $2
                ",
            )
            .bind(holder.kind())
            .bind(holder.id())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            Ok(balance.unwrap_or(0))
        })
    }

    fn commit(&self, commit: Commit) -> StoreFuture<'_, CommitOutcome> {
        Box::pin(commit::apply(&self.pool, commit))
    }
}
