//! # Groupbuy Core
//!
//! Domain model and policy for group-buy offer capacity and the reservation
//! lifecycle.
//!
//! ## Core Concepts
//!
//! - **Offer**: a seller's fixed quantity for a deal, with `reserved` and
//!   `sold` counters that never exceed `capacity`
//! - **Reservation**: a buyer's time-boxed claim on offer quantity that
//!   moves through `PENDING -> PAID -> SHIPPED -> DELIVERED`, or ends
//!   `EXPIRED`/`CANCELLED`
//! - **Settlement**: the seller payout derived from a delivered reservation
//! - **Policy**: a validated, reloadable bundle of fee rates, windows,
//!   rounding and points rules, evaluated by the pure [`policy::PolicyEngine`]
//! - **Store**: the [`store::ReservationStore`] trait that applies each state
//!   transition as one atomic [`store::Commit`]
//!
//! This crate performs no I/O of its own. Persistence lives in
//! `groupbuy-postgres` (production) and `groupbuy-testing` (in-memory).

pub mod error;
pub mod policy;
pub mod store;
pub mod types;

pub use error::{ConflictCode, EngineError, StoreError};

/// Environment traits for dependency injection.
///
/// All external dependencies are abstracted behind traits and injected
/// into components instead of being read from ambient globals.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use groupbuy_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
