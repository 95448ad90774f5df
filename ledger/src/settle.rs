//! Combined balance and state write for backends that can make it atomic.

use async_trait::async_trait;

use penny_common::{Pennies, Result, Transaction, TransactionId};

/// Applies a pending transaction to its account and confirms it as one unit.
///
/// On success both writes are durable; on any error neither is. A retry after
/// an ambiguous failure therefore either finds the transaction `Confirmed` or
/// applies it exactly once.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Apply the transaction's balance delta and mark it `Confirmed`.
    ///
    /// Fails with `InsufficientFunds` when a debit would overdraw the account
    /// and with `InvalidState` when the transaction already left `Pending`.
    /// Returns the new balance with the confirmed transaction.
    async fn apply_and_confirm(&self, transaction_id: TransactionId)
        -> Result<(Pennies, Transaction)>;
}
