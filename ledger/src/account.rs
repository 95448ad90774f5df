//! Account records and the account store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use penny_common::{AccountId, Pennies, Result};

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Caller-assigned account identifier.
    pub id: AccountId,
    /// Current balance, never negative.
    pub balance: Pennies,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with a zero balance.
    pub fn new(id: AccountId) -> Self {
        let now = Utc::now();

        Self {
            id,
            balance: Pennies::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Holds one non-negative balance per account.
///
/// Implementations must make `adjust_balance` indivisible: for a negative
/// delta, no other caller may observe or modify the balance between the
/// sufficiency check and the write.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create the account with a zero balance if it does not exist yet.
    async fn ensure_account(&self, account_id: &AccountId) -> Result<()>;

    /// Fetch the full account record.
    async fn account(&self, account_id: &AccountId) -> Result<Account>;

    /// Current balance of an ensured account.
    async fn get_balance(&self, account_id: &AccountId) -> Result<Pennies> {
        Ok(self.account(account_id).await?.balance)
    }

    /// Apply `balance += delta` atomically and return the new balance.
    ///
    /// Fails with `InsufficientFunds` if the result would be negative and with
    /// `AccountNotFound` if the account was never ensured.
    async fn adjust_balance(&self, account_id: &AccountId, delta: i64) -> Result<Pennies>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_is_empty() {
        let account = Account::new(AccountId::new("alice"));

        assert_eq!(account.balance, Pennies::ZERO);
        assert_eq!(account.created_at, account.updated_at);
    }
}
