//! # Groupbuy Reservations
//!
//! Offer capacity accounting and the reservation lifecycle.
//!
//! ## Components
//!
//! - [`InventoryLedger`]: capacity deltas, counter snapshots and audits
//! - [`ReservationMachine`]: create, pay, expire, cancel, ship, confirm
//!   arrival and refund, each as one atomic store commit
//! - [`ExpirySweeper`]: periodic expiry of holds that ran out
//! - [`SettlementBatcher`]: settlement approval and batched payout
//!
//! All components share an `Arc<dyn ReservationStore>`, a
//! [`Clock`](groupbuy_core::environment::Clock) and a
//! [`PolicyHandle`](groupbuy_core::policy::PolicyHandle).
//!
//! ## Example
//!
//! ```no_run
//! use groupbuy_core::environment::SystemClock;
//! use groupbuy_core::policy::PolicyHandle;
//! use groupbuy_core::types::{Actor, BuyerId, DealId, Money, Offer, SellerId};
//! use groupbuy_postgres::PostgresStore;
//! use groupbuy_reservations::{CreateReservation, InventoryLedger, ReservationMachine};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(PostgresStore::connect("postgres://localhost/groupbuy").await?);
//! let ledger = InventoryLedger::new(store.clone());
//! let machine = ReservationMachine::new(
//!     store,
//!     Arc::new(SystemClock),
//!     Arc::new(PolicyHandle::default()),
//! );
//!
//! let offer = Offer::new(DealId::new(), SellerId::new(), Money::won(10_000), 5, chrono::Utc::now());
//! let offer = ledger.open_offer(offer).await?;
//!
//! let buyer = BuyerId::new();
//! let reservation = machine
//!     .create_reservation(CreateReservation::new(&offer, buyer, 2))
//!     .await?;
//! machine.pay(reservation.id, Actor::Buyer(buyer), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ledger;
pub mod machine;
pub mod refund;
pub mod settlement;
pub mod sweeper;

pub use config::Config;
pub use ledger::{InventoryAudit, InventoryLedger, InventorySnapshot};
pub use machine::{BuyerPoints, CreateReservation, ExpireOutcome, ReservationMachine};
pub use refund::RefundRequest;
pub use settlement::{PaidBatch, SettlementBatcher};
pub use sweeper::{ExpirySweeper, SweepReport};
