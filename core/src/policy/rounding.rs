//! Integer rounding and per-unit allocation of amounts.
//!
//! An amount paid for `n` units is split into `n` per-unit shares. Each share
//! is the rounded average; the difference between the total and the sum of
//! rounded shares (positive or negative) lands on the first or last unit.
//! Shares always sum to the total, so refunding every unit in any sequence
//! of partial refunds returns exactly what was paid.

use super::PolicyValidationError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Rounding direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundingMode {
    /// Toward zero
    Floor,
    /// Away from zero
    Ceil,
    /// To nearest, ties away from zero
    HalfUp,
}

/// Which unit absorbs the rounding remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemainderStrategy {
    /// The first unit refunded
    GiveToFirst,
    /// The last unit refunded
    GiveToLast,
}

/// Rounding mode plus the unit amounts are rounded to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rounding {
    /// Direction
    pub mode: RoundingMode,
    /// Granularity, 1..=1000
    pub unit: i64,
}

impl Default for Rounding {
    fn default() -> Self {
        Self {
            mode: RoundingMode::Floor,
            unit: 1,
        }
    }
}

impl Rounding {
    /// Check the unit is within 1..=1000.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyValidationError::Invalid`] otherwise.
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if (1..=1_000).contains(&self.unit) {
            Ok(())
        } else {
            Err(PolicyValidationError::Invalid {
                field: "refund.rounding.unit",
                reason: format!("must be within 1..=1000, got {}", self.unit),
            })
        }
    }

    /// Round the non-negative ratio `numerator / denominator` to a multiple
    /// of `unit`.
    #[must_use]
    pub fn ratio(&self, numerator: i64, denominator: i64) -> i64 {
        if denominator <= 0 {
            return 0;
        }
        let unit = i128::from(self.unit.max(1));
        let step = i128::from(denominator) * unit;
        let n = i128::from(numerator);
        let units = match self.mode {
            RoundingMode::Floor => n.div_euclid(step),
            RoundingMode::Ceil => (n + step - 1).div_euclid(step),
            RoundingMode::HalfUp => (2 * n + step).div_euclid(2 * step),
        };
        i64::try_from(units * unit).unwrap_or(i64::MAX)
    }

    /// Sum of the shares of units `range` when `total` is split over `parts`.
    ///
    /// Units outside `0..parts` contribute nothing.
    #[must_use]
    pub fn allocate(
        &self,
        total: i64,
        parts: u32,
        strategy: RemainderStrategy,
        range: Range<u32>,
    ) -> i64 {
        if parts == 0 || total <= 0 {
            return 0;
        }
        let start = range.start.min(parts);
        let end = range.end.min(parts);
        if start >= end {
            return 0;
        }

        let n = i64::from(parts);
        let mut base = self.ratio(total, n);
        // Rounding up can overshoot small totals; the remainder unit must
        // never go negative.
        if base.saturating_mul(n - 1) > total {
            base = total / n;
        }
        let remainder = total - base * n;
        let remainder_unit = match strategy {
            RemainderStrategy::GiveToFirst => 0,
            RemainderStrategy::GiveToLast => parts - 1,
        };

        let mut sum = base * i64::from(end - start);
        if (start..end).contains(&remainder_unit) {
            sum += remainder;
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const fn rounding(mode: RoundingMode, unit: i64) -> Rounding {
        Rounding { mode, unit }
    }

    #[test]
    fn ratio_modes() {
        assert_eq!(rounding(RoundingMode::Floor, 10).ratio(10_000, 3), 3_330);
        assert_eq!(rounding(RoundingMode::Ceil, 10).ratio(10_000, 3), 3_340);
        assert_eq!(rounding(RoundingMode::HalfUp, 10).ratio(10_000, 3), 3_330);
        assert_eq!(rounding(RoundingMode::HalfUp, 1).ratio(5, 2), 3);
        assert_eq!(rounding(RoundingMode::Floor, 1).ratio(5, 2), 2);
        assert_eq!(rounding(RoundingMode::Ceil, 100).ratio(100, 1), 100);
    }

    #[test]
    fn remainder_goes_to_configured_unit() {
        let r = rounding(RoundingMode::Floor, 10);
        // 10000 / 3 -> 3330, 3330, 3340
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToLast, 0..1), 3_330);
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToLast, 2..3), 3_340);
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToFirst, 0..1), 3_340);
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToFirst, 2..3), 3_330);
    }

    #[test]
    fn ceil_remainder_is_negative() {
        let r = rounding(RoundingMode::Ceil, 10);
        // 10000 / 3 -> 3340, 3340, 3320
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToLast, 0..2), 6_680);
        assert_eq!(r.allocate(10_000, 3, RemainderStrategy::GiveToLast, 2..3), 3_320);
    }

    #[test]
    fn small_totals_never_go_negative() {
        let r = rounding(RoundingMode::Ceil, 1_000);
        for unit in 0..3 {
            assert!(r.allocate(5, 3, RemainderStrategy::GiveToLast, unit..unit + 1) >= 0);
        }
        assert_eq!(r.allocate(5, 3, RemainderStrategy::GiveToLast, 0..3), 5);
    }

    proptest! {
        #[test]
        fn shares_sum_to_total(
            total in 0i64..10_000_000,
            parts in 1u32..50,
            unit in 1i64..=1_000,
            mode in prop_oneof![
                Just(RoundingMode::Floor),
                Just(RoundingMode::Ceil),
                Just(RoundingMode::HalfUp),
            ],
            first in any::<bool>(),
            cut in 0u32..50,
        ) {
            let r = rounding(mode, unit);
            let strategy = if first {
                RemainderStrategy::GiveToFirst
            } else {
                RemainderStrategy::GiveToLast
            };
            let cut = cut.min(parts);
            let head = r.allocate(total, parts, strategy, 0..cut);
            let tail = r.allocate(total, parts, strategy, cut..parts);
            prop_assert_eq!(head + tail, total);
            for i in 0..parts {
                prop_assert!(r.allocate(total, parts, strategy, i..i + 1) >= 0);
            }
        }
    }
}
