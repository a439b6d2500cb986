//! # Groupbuy Testing
//!
//! Testing utilities for the group-buy reservation engine.
//!
//! This crate provides:
//! - Deterministic [`Clock`] implementations
//! - [`InMemoryStore`], a [`ReservationStore`](groupbuy_core::store::ReservationStore)
//!   with the same atomicity and conflict rules as the database store
//! - Fixtures for offers and policy bundles
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```
//! use groupbuy_core::environment::Clock;
//! use groupbuy_testing::{InMemoryStore, ManualClock, helpers};
//!
//! let clock = ManualClock::at(groupbuy_testing::test_clock().now());
//! let store = InMemoryStore::new();
//! let offer = helpers::offer(5, clock.now());
//! assert_eq!(offer.capacity, 5);
//! # drop(store);
//! ```

use chrono::{DateTime, Utc};
use groupbuy_core::environment::Clock;

pub mod memory_store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use parking_lot::Mutex;

    /// Clock frozen at one instant.
    ///
    /// ```
    /// use groupbuy_core::environment::Clock;
    /// use groupbuy_testing::mocks::FixedClock;
    ///
    /// let clock = groupbuy_testing::test_clock();
    /// assert_eq!(clock.now(), clock.now());
    /// # let _: FixedClock = clock;
    /// ```
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(DateTime<Utc>);

    impl FixedClock {
        /// Freeze at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self(time)
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Clock that only moves when a test moves it.
    ///
    /// Shared as `Arc<ManualClock>` between the test and the engine so hold
    /// deadlines and cooling windows can be crossed without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub fn at(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock();
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock()
        }
    }

    /// 2025-01-01T00:00:00Z as a Unix timestamp.
    const TEST_EPOCH: i64 = 1_735_689_600;

    /// Clock frozen at 2025-01-01 00:00:00 UTC, the start of every fixture.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is a constant in range.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(TEST_EPOCH, 0).expect("epoch in range"))
    }
}

/// Fixtures for common test scenarios.
pub mod helpers {
    use super::{DateTime, Utc};
    use groupbuy_core::policy::PolicyBundle;
    use groupbuy_core::types::{DealId, Money, Offer, SellerId};

    /// Unit price used by [`offer`]
    pub const UNIT_PRICE: Money = Money::won(10_000);

    /// Active offer for a fresh deal and seller, shipping included.
    #[must_use]
    pub fn offer(capacity: u32, created_at: DateTime<Utc>) -> Offer {
        Offer::new(
            DealId::new(),
            SellerId::new(),
            UNIT_PRICE,
            capacity,
            created_at,
        )
    }

    /// Default policy bundle with refunds enabled.
    #[must_use]
    pub fn policy() -> PolicyBundle {
        PolicyBundle::default()
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use groupbuy_core::types::{CancelRule, Money, ShippingMode};
    use proptest::prelude::*;

    /// Offer capacities small enough to exhaust in a test.
    pub fn capacity() -> impl Strategy<Value = u32> {
        1u32..=20
    }

    /// Requested quantities, including some larger than any capacity above.
    pub fn quantity() -> impl Strategy<Value = u32> {
        1u32..=25
    }

    /// Any shipping mode with a fee in a realistic range.
    pub fn shipping() -> impl Strategy<Value = (ShippingMode, Money)> {
        let mode = prop_oneof![
            Just(ShippingMode::Included),
            Just(ShippingMode::PerReservation),
            Just(ShippingMode::PerQty),
        ];
        (mode, 0i64..=10_000).prop_map(|(mode, fee)| (mode, Money::won(fee)))
    }

    /// Any cancel rule.
    pub fn cancel_rule() -> impl Strategy<Value = CancelRule> {
        prop_oneof![
            Just(CancelRule::UntilShipped),
            Just(CancelRule::NoCancelAfterShipping),
            (0u32..=30).prop_map(|days| CancelRule::WithinDaysAfterDelivery { days }),
        ]
    }
}

pub use memory_store::InMemoryStore;
pub use mocks::{FixedClock, ManualClock, test_clock};
