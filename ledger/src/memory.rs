//! In-memory backends built on `DashMap`.
//!
//! Balance adjustments run while holding the shard write guard for the account,
//! so check-and-apply is a single critical section per account. Different
//! accounts usually live in different shards and proceed in parallel.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use penny_common::{
    AccountId, LedgerError, NewTransaction, Outcome, Pennies, Result, Transaction,
    TransactionId,
};

use crate::account::{Account, AccountStore};
use crate::journal::TransactionLedger;

/// Switch for simulating an unreachable backend.
#[derive(Debug)]
struct Availability(AtomicBool);

impl Availability {
    fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }

    fn check(&self, backend: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LedgerError::StoreUnavailable(format!("{} is offline", backend)))
        }
    }
}

/// Account store kept in process memory.
#[derive(Debug)]
pub struct MemoryAccountStore {
    accounts: DashMap<AccountId, Account>,
    availability: Availability,
}

impl MemoryAccountStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            availability: Availability::new(),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }

    /// Number of provisioned accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Check if no account was provisioned yet.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn ensure_account(&self, account_id: &AccountId) -> Result<()> {
        self.availability.check("account store")?;

        self.accounts
            .entry(account_id.clone())
            .or_insert_with(|| {
                debug!(account_id = %account_id, "Provisioning account");
                Account::new(account_id.clone())
            });
        Ok(())
    }

    async fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.availability.check("account store")?;

        self.accounts
            .get(account_id)
            .map(|a| a.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    async fn adjust_balance(&self, account_id: &AccountId, delta: i64) -> Result<Pennies> {
        self.availability.check("account store")?;

        // The guard holds the shard write lock until the end of this scope.
        let mut account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;

        let next = account
            .balance
            .checked_add(delta)
            .ok_or(LedgerError::InvalidAmount { amount: delta })?;

        if next.is_negative() {
            return Err(LedgerError::InsufficientFunds {
                account_id: account_id.clone(),
                available: account.balance,
                requested: Pennies::new(delta.saturating_neg()),
            });
        }

        account.balance = next;
        account.updated_at = Utc::now();
        Ok(next)
    }
}

/// Transaction ledger kept in process memory.
#[derive(Debug)]
pub struct MemoryTransactionLedger {
    /// Transactions by ID.
    transactions: DashMap<TransactionId, Transaction>,
    /// Transaction IDs by account, in creation order.
    by_account: DashMap<AccountId, Vec<TransactionId>>,
    availability: Availability,
}

impl MemoryTransactionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            by_account: DashMap::new(),
            availability: Availability::new(),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }

    /// Total number of recorded transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Check if nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Number of transactions still pending.
    pub fn pending_count(&self) -> usize {
        self.transactions.iter().filter(|t| t.is_pending()).count()
    }
}

impl Default for MemoryTransactionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionLedger for MemoryTransactionLedger {
    async fn create(&self, new: NewTransaction) -> Result<TransactionId> {
        self.availability.check("transaction ledger")?;

        if !new.amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                amount: new.amount.value(),
            });
        }

        let id = TransactionId::new();
        let account_id = new.account_id.clone();
        self.transactions.insert(id, Transaction::pending(id, new));

        // Index by account
        self.by_account
            .entry(account_id)
            .or_insert_with(Vec::new)
            .push(id);

        Ok(id)
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.availability.check("transaction ledger")?;

        self.transactions
            .get(&transaction_id)
            .map(|t| t.clone())
            .ok_or(LedgerError::TransactionNotFound(transaction_id))
    }

    async fn mark_terminal(
        &self,
        transaction_id: TransactionId,
        outcome: Outcome,
    ) -> Result<Transaction> {
        self.availability.check("transaction ledger")?;

        let mut tx = self
            .transactions
            .get_mut(&transaction_id)
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;

        tx.finish(outcome).map_err(|e| LedgerError::InvalidState {
            transaction_id,
            state: e.from,
        })?;

        Ok(tx.clone())
    }

    async fn list_for_account(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.availability.check("transaction ledger")?;

        Ok(self
            .by_account
            .get(account_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.transactions.get(id).map(|t| t.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
