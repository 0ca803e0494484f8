//! Money types with exact integer arithmetic
//!
//! Amounts are carried as signed counts of minor currency units (pence,
//! cents). The engine is single-currency, so no currency code travels with
//! the amount. Percentages are held as `rust_decimal::Decimal` so that rates
//! such as 17.5% apply without any floating-point step.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during money operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Overflow during calculation")]
    Overflow,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid split: {0}")]
    InvalidSplit(String),
}

/// A monetary amount in integer minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero minor units
    pub const ZERO: Money = Money(0);

    /// Creates Money from an integer amount in minor units (e.g., pence)
    pub const fn from_minor(minor_units: i64) -> Self {
        Self(minor_units)
    }

    /// Creates a zero amount
    pub const fn zero() -> Self {
        Self::ZERO
    }

    /// Returns the amount in minor units
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns true if the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the amount is strictly positive
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Returns true if the amount is negative
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Checked addition
    pub fn checked_add(&self, other: Money) -> Result<Money, MoneyError> {
        self.0.checked_add(other.0).map(Money).ok_or(MoneyError::Overflow)
    }

    /// Checked subtraction
    pub fn checked_sub(&self, other: Money) -> Result<Money, MoneyError> {
        self.0.checked_sub(other.0).map(Money).ok_or(MoneyError::Overflow)
    }

    /// Multiplies by an integer quantity
    pub fn checked_mul(&self, factor: i64) -> Result<Money, MoneyError> {
        self.0.checked_mul(factor).map(Money).ok_or(MoneyError::Overflow)
    }

    /// Clamps negative amounts to zero
    pub fn floor_zero(&self) -> Money {
        Money(self.0.max(0))
    }

    /// Sums an iterator of amounts, failing on overflow
    pub fn sum<I>(amounts: I) -> Result<Money, MoneyError>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }

    /// Splits the amount into `parts` near-equal shares.
    ///
    /// Every share receives `self / parts`; the integer-division remainder is
    /// added to the final share, so the shares always sum back to `self`.
    ///
    /// # Errors
    ///
    /// Returns error if `parts` is zero or the amount is negative
    pub fn split(&self, parts: u32) -> Result<Vec<Money>, MoneyError> {
        if parts == 0 {
            return Err(MoneyError::InvalidSplit("Cannot split into zero parts".to_string()));
        }
        if self.is_negative() {
            return Err(MoneyError::InvalidSplit(format!(
                "Cannot split negative amount {}",
                self.0
            )));
        }

        let n = i64::from(parts);
        let base = self.0 / n;
        let remainder = self.0 % n;

        let mut shares = vec![Money(base); parts as usize];
        if let Some(last) = shares.last_mut() {
            last.0 = base + remainder;
        }
        Ok(shares)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Money {
    fn from(minor_units: i64) -> Self {
        Money(minor_units)
    }
}

/// A percentage between 0 and 100 inclusive (e.g., a VAT rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percentage(Decimal);

impl Percentage {
    /// Zero percent
    pub const ZERO: Percentage = Percentage(Decimal::ZERO);

    /// Creates a percentage from a value in `[0, 100]` (e.g., 20 for 20%)
    pub fn new(percent: Decimal) -> Result<Self, MoneyError> {
        if percent < Decimal::ZERO || percent > dec!(100) {
            return Err(MoneyError::InvalidAmount(format!(
                "Percentage {} is outside 0-100",
                percent
            )));
        }
        Ok(Self(percent))
    }

    /// Returns the percentage value (20 for 20%)
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Applies the percentage to an amount, rounding half-up to the nearest
    /// minor unit (9999 at 20% is 1999.8, which rounds to 2000).
    pub fn apply_half_up(&self, amount: Money) -> Result<Money, MoneyError> {
        if amount.is_negative() {
            return Err(MoneyError::InvalidAmount(format!(
                "Cannot apply a percentage to negative amount {}",
                amount
            )));
        }

        let exact = Decimal::from(amount.minor())
            .checked_mul(self.0)
            .and_then(|scaled| scaled.checked_div(dec!(100)))
            .ok_or(MoneyError::Overflow)?;

        // Amounts are non-negative here, so away-from-zero is half-up.
        exact
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .map(Money::from_minor)
            .ok_or(MoneyError::Overflow)
    }
}

impl TryFrom<Decimal> for Percentage {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Percentage::new(value)
    }
}

impl From<Percentage> for Decimal {
    fn from(value: Percentage) -> Self {
        value.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0.normalize())
    }
}
