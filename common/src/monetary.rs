//! Monetary amounts in the ledger's single currency of account.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{LedgerError, Result};

/// An amount in the smallest currency unit.
///
/// Signed so that invalid requests (zero or negative) can be represented and
/// rejected; balances and transaction amounts are never negative once stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pennies(i64);

impl Pennies {
    /// Zero pennies.
    pub const ZERO: Pennies = Pennies(0);

    /// Wrap a raw value.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Validate a requested transaction amount.
    pub fn positive(value: i64) -> Result<Self> {
        if value <= 0 {
            return Err(LedgerError::InvalidAmount { amount: value });
        }
        Ok(Self(value))
    }

    /// Get the raw value.
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Check if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Apply a signed delta, `None` on overflow.
    pub fn checked_add(self, delta: i64) -> Option<Self> {
        self.0.checked_add(delta).map(Self)
    }

    /// Amount in major units, e.g. `1234` pennies is `12.34`.
    pub fn to_major(&self) -> Decimal {
        Decimal::new(self.0, 2)
    }
}

impl fmt::Display for Pennies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pennies> for i64 {
    fn from(p: Pennies) -> Self {
        p.0
    }
}
