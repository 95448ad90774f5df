//! Settlement logic for individual transactions.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use penny_common::{
    AbortReason, Direction, LedgerError, Outcome, Pennies, Result, Transaction, TransactionId,
    TransactionState,
};
use penny_ledger::{AccountStore, SettlementStore, TransactionLedger};

use crate::claims::{ClaimGuard, SettlementClaims};
use crate::metrics::SharedMetrics;

/// Applies pending transactions to balances.
///
/// With a [`SettlementStore`] the balance write and the `Confirmed` write are
/// one atomic unit. Without one the balance is written first and the state
/// second; when the second write fails the processor reverses the first, or
/// records the transaction as `Confirmed` when the reversal is impossible. A
/// transaction whose outcome cannot be reconciled either way is quarantined so
/// that no retry applies it twice.
pub struct SettlementProcessor {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn TransactionLedger>,
    atomic: Option<Arc<dyn SettlementStore>>,
    claims: SettlementClaims,
    metrics: SharedMetrics,
}

/// Why applying a transaction failed.
#[derive(Debug)]
enum ApplyError {
    /// Balance and state are both as they were.
    Untouched(LedgerError),
    /// The balance moved and the state could not be recorded.
    Unresolved(LedgerError),
}

impl SettlementProcessor {
    /// Create a new settlement processor.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn TransactionLedger>,
        claims: SettlementClaims,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            accounts,
            ledger,
            atomic: None,
            claims,
            metrics,
        }
    }

    /// Apply balance and state writes through `store` in one unit.
    pub fn with_settlement_store(mut self, store: Arc<dyn SettlementStore>) -> Self {
        self.atomic = Some(store);
        self
    }

    /// Credit a pending deposit and mark it confirmed.
    ///
    /// Errors propagate to the caller. When the deposit is still `Pending`
    /// afterwards its balance is untouched and the confirmation can be retried.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn confirm_deposit(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let claim = self.claim(transaction_id, Direction::Deposit)?;

        let tx = self.ledger.get(transaction_id).await?;
        expect_pending(&tx, Direction::Deposit)?;

        match self.apply(&tx).await {
            Ok((balance, confirmed)) => {
                self.metrics.deposit_confirmed();
                info!(
                    transaction_id = %tx.id,
                    account_id = %tx.account_id,
                    amount = %tx.amount,
                    balance = %balance,
                    "Deposit confirmed"
                );
                Ok(confirmed)
            }
            Err(ApplyError::Untouched(e)) => Err(e),
            Err(ApplyError::Unresolved(e)) => {
                self.quarantine(claim, &tx, &e);
                Err(e)
            }
        }
    }

    /// Debit a pending withdrawal, or abort it.
    ///
    /// Returns the transaction in its terminal state. An `Err` means the
    /// outcome could not be recorded (unknown ID, already settled, the ledger
    /// unreachable, or the transaction quarantined).
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn settle_withdrawal(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let claim = self.claim(transaction_id, Direction::Withdrawal)?;

        let tx = self.ledger.get(transaction_id).await?;
        expect_pending(&tx, Direction::Withdrawal)?;

        match self.apply(&tx).await {
            Ok((balance, confirmed)) => {
                self.metrics.withdrawal_confirmed();
                info!(
                    transaction_id = %tx.id,
                    account_id = %tx.account_id,
                    amount = %tx.amount,
                    balance = %balance,
                    "Withdrawal confirmed"
                );
                Ok(confirmed)
            }
            // Finalized elsewhere.
            Err(ApplyError::Untouched(e @ LedgerError::InvalidState { .. })) => Err(e),
            Err(ApplyError::Untouched(e @ LedgerError::InsufficientFunds { .. })) => {
                warn!(
                    transaction_id = %tx.id,
                    account_id = %tx.account_id,
                    error = %e,
                    "Withdrawal aborted"
                );
                self.abort(&tx, AbortReason::InsufficientFunds).await
            }
            Err(ApplyError::Untouched(e)) => {
                error!(
                    transaction_id = %tx.id,
                    account_id = %tx.account_id,
                    error = %e,
                    code = e.error_code(),
                    "Balance adjustment failed during settlement"
                );
                self.abort(&tx, abort_reason_for(&e)).await
            }
            Err(ApplyError::Unresolved(e)) => {
                self.quarantine(claim, &tx, &e);
                Err(e)
            }
        }
    }

    fn claim(&self, transaction_id: TransactionId, direction: Direction) -> Result<ClaimGuard> {
        self.claims
            .try_claim(transaction_id, direction)
            .ok_or(LedgerError::InvalidState {
                transaction_id,
                state: TransactionState::Pending,
            })
    }

    /// Write the balance change and mark the transaction confirmed.
    async fn apply(
        &self,
        tx: &Transaction,
    ) -> std::result::Result<(Pennies, Transaction), ApplyError> {
        if let Some(store) = &self.atomic {
            return store
                .apply_and_confirm(tx.id)
                .await
                .map_err(ApplyError::Untouched);
        }

        let balance = self
            .accounts
            .adjust_balance(&tx.account_id, tx.balance_delta())
            .await
            .map_err(ApplyError::Untouched)?;

        match self.ledger.mark_terminal(tx.id, Outcome::Confirmed).await {
            Ok(confirmed) => Ok((balance, confirmed)),
            Err(e) => self.recover(tx, e).await.map(|confirmed| (balance, confirmed)),
        }
    }

    /// Reconcile after the balance write landed and the state write failed.
    async fn recover(
        &self,
        tx: &Transaction,
        cause: LedgerError,
    ) -> std::result::Result<Transaction, ApplyError> {
        // The state write may have landed even though the call failed.
        let current = match self.ledger.get(tx.id).await {
            Ok(current) => current,
            Err(e) => {
                error!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Transaction state unreadable after balance write"
                );
                return Err(ApplyError::Unresolved(cause));
            }
        };
        if current.state == TransactionState::Confirmed {
            return Ok(current);
        }

        self.metrics.compensation();
        warn!(
            transaction_id = %tx.id,
            account_id = %tx.account_id,
            error = %cause,
            "State write failed after balance write, reversing"
        );

        let reversal_error = match self
            .accounts
            .adjust_balance(&tx.account_id, -tx.balance_delta())
            .await
        {
            Ok(_) => return Err(ApplyError::Untouched(cause)),
            Err(e) => e,
        };

        // The money already moved, so Confirmed is the true outcome.
        warn!(
            transaction_id = %tx.id,
            account_id = %tx.account_id,
            error = %reversal_error,
            "Reversal failed, recording transaction as confirmed"
        );
        self.ledger
            .mark_terminal(tx.id, Outcome::Confirmed)
            .await
            .map_err(|_| ApplyError::Unresolved(cause))
    }

    /// Keep the claim so no settlement path touches the transaction again.
    fn quarantine(&self, claim: ClaimGuard, tx: &Transaction, cause: &LedgerError) {
        self.metrics.quarantine();
        error!(
            transaction_id = %tx.id,
            account_id = %tx.account_id,
            amount = %tx.amount,
            direction = %tx.direction,
            error = %cause,
            "Balance and state disagree, transaction quarantined for manual correction"
        );
        claim.quarantine();
    }

    async fn abort(&self, tx: &Transaction, reason: AbortReason) -> Result<Transaction> {
        match self
            .ledger
            .mark_terminal(tx.id, Outcome::Aborted(reason))
            .await
        {
            Ok(aborted) => {
                self.metrics.withdrawal_aborted();
                Ok(aborted)
            }
            Err(e) => {
                error!(
                    transaction_id = %tx.id,
                    reason = %reason,
                    error = %e,
                    "Could not record abort, transaction left pending"
                );
                Err(e)
            }
        }
    }
}

fn expect_pending(tx: &Transaction, direction: Direction) -> Result<()> {
    if tx.direction != direction || !tx.is_pending() {
        return Err(LedgerError::InvalidState {
            transaction_id: tx.id,
            state: tx.state,
        });
    }
    Ok(())
}

/// Convert a settlement error to the reason recorded on the transaction.
fn abort_reason_for(error: &LedgerError) -> AbortReason {
    match error {
        LedgerError::InsufficientFunds { .. } => AbortReason::InsufficientFunds,
        LedgerError::AccountNotFound(_) => AbortReason::AccountNotFound,
        LedgerError::StoreUnavailable(_) => AbortReason::StoreUnavailable,
        _ => AbortReason::Internal,
    }
}
