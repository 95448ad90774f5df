//! Append-only transaction journal contract.

use async_trait::async_trait;

use penny_common::{AccountId, NewTransaction, Outcome, Result, Transaction, TransactionId};

/// Records every deposit and withdrawal attempt with its lifecycle state.
///
/// Transactions are never deleted. The only mutation is the single move out of
/// `Pending`, which `mark_terminal` performs as an atomic check-and-set.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Record a pending transaction and return its fresh identifier.
    ///
    /// Fails with `InvalidAmount` unless the amount is strictly positive.
    async fn create(&self, new: NewTransaction) -> Result<TransactionId>;

    /// Fetch a transaction.
    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction>;

    /// Move a pending transaction to `Confirmed` or `Aborted`.
    ///
    /// Fails with `InvalidState` when the transaction already left `Pending`.
    async fn mark_terminal(
        &self,
        transaction_id: TransactionId,
        outcome: Outcome,
    ) -> Result<Transaction>;

    /// All transactions for one account, oldest first.
    async fn list_for_account(&self, account_id: &AccountId) -> Result<Vec<Transaction>>;
}
