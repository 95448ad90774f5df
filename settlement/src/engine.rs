//! Settlement engine: the only component that mutates balances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use penny_common::{
    AccountId, LedgerError, NewTransaction, Pennies, Result, Transaction, TransactionId,
    TransactionState,
};
use penny_ledger::{
    postgres, AccountStore, MemoryAccountStore, MemoryTransactionLedger, PgAccountStore,
    PgSettlementStore, PgTransactionLedger, SettlementStore, TransactionLedger,
};

use crate::claims::{Claim, SettlementClaims};
use crate::config::{DepositMode, EngineConfig, SettlementConfig};
use crate::metrics::{EngineMetrics, MetricsSnapshot, SharedMetrics};
use crate::processor::SettlementProcessor;
use crate::requests::{
    checked_account, DepositReceipt, DepositRequest, WithdrawalReceipt, WithdrawalRequest,
};
use crate::state::EngineState;

/// Orchestrates deposits and withdrawals over an account store and a
/// transaction ledger.
///
/// Withdrawals are accepted synchronously and settled by a detached task after
/// the verification delay; callers learn the outcome by polling the
/// transaction.
pub struct SettlementEngine {
    /// Configuration.
    config: SettlementConfig,
    /// Current engine state.
    state: Arc<RwLock<EngineState>>,
    /// Balances.
    accounts: Arc<dyn AccountStore>,
    /// Transaction journal.
    ledger: Arc<dyn TransactionLedger>,
    /// Settlement logic shared with background tasks.
    processor: Arc<SettlementProcessor>,
    /// Claims held by the processor.
    claims: SettlementClaims,
    /// Bounds settlements executing at once.
    permits: Arc<Semaphore>,
    /// Settlements dispatched but not finished.
    in_flight: Arc<InFlight>,
    metrics: SharedMetrics,
}

impl SettlementEngine {
    /// Create an engine over the given stores.
    ///
    /// Balance and state are written separately; a failed state write is
    /// reconciled by the processor.
    pub fn new(
        config: SettlementConfig,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn TransactionLedger>,
    ) -> Self {
        Self::build(config, accounts, ledger, None)
    }

    /// Create an engine that writes balance and state through `settlement` in
    /// one atomic unit.
    pub fn with_settlement_store(
        config: SettlementConfig,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn TransactionLedger>,
        settlement: Arc<dyn SettlementStore>,
    ) -> Self {
        Self::build(config, accounts, ledger, Some(settlement))
    }

    fn build(
        config: SettlementConfig,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn TransactionLedger>,
        settlement: Option<Arc<dyn SettlementStore>>,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let claims = SettlementClaims::new();
        let mut processor = SettlementProcessor::new(
            accounts.clone(),
            ledger.clone(),
            claims.clone(),
            metrics.clone(),
        );
        if let Some(store) = settlement {
            processor = processor.with_settlement_store(store);
        }
        let permits = Arc::new(Semaphore::new(config.max_concurrent_settlements));

        Self {
            config,
            state: Arc::new(RwLock::new(EngineState::Running)),
            accounts,
            ledger,
            processor: Arc::new(processor),
            claims,
            permits,
            in_flight: Arc::new(InFlight::default()),
            metrics,
        }
    }

    /// Create an engine over fresh in-memory stores.
    pub fn in_memory(config: SettlementConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryAccountStore::new()),
            Arc::new(MemoryTransactionLedger::new()),
        )
    }

    /// Create an engine over the backend named by the storage configuration.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        config.validate().map_err(LedgerError::Configuration)?;

        match &config.storage.database_url {
            Some(url) => {
                let pool = postgres::connect(
                    url,
                    config.storage.max_connections,
                    config.storage.acquire_timeout,
                )
                .await?;
                postgres::migrate(&pool).await?;
                info!(max_connections = config.storage.max_connections, "Using Postgres storage");

                Ok(Self::with_settlement_store(
                    config.settlement.clone(),
                    Arc::new(PgAccountStore::new(pool.clone())),
                    Arc::new(PgTransactionLedger::new(pool.clone())),
                    Arc::new(PgSettlementStore::new(pool)),
                ))
            }
            None => {
                info!("Using in-memory storage");
                Ok(Self::in_memory(config.settlement.clone()))
            }
        }
    }

    /// Record a deposit, creating the account on first use.
    ///
    /// In two-step mode the deposit stays pending until its confirmation link
    /// is followed. In immediate mode it is credited before this returns.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn request_deposit(&self, account_id: AccountId, amount: i64) -> Result<DepositReceipt> {
        self.ensure_running()?;
        let amount = Pennies::positive(amount)?;

        self.accounts.ensure_account(&account_id).await?;
        let transaction_id = self
            .ledger
            .create(NewTransaction::deposit(account_id.clone(), amount))
            .await?;
        self.metrics.deposit_requested();

        info!(
            transaction_id = %transaction_id,
            amount = %amount,
            mode = ?self.config.deposit_mode,
            "Deposit requested"
        );

        let state = match self.config.deposit_mode {
            DepositMode::TwoStep => TransactionState::Pending,
            DepositMode::Immediate => self.processor.confirm_deposit(transaction_id).await?.state,
        };

        Ok(DepositReceipt {
            transaction_id,
            confirmation_link: self.confirmation_link(transaction_id),
            state,
        })
    }

    /// Credit a pending deposit.
    pub async fn confirm_deposit(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.ensure_running()?;
        self.processor.confirm_deposit(transaction_id).await
    }

    /// Accept a withdrawal and schedule its settlement.
    ///
    /// Success means only that the request was recorded. Unknown accounts are
    /// rejected here, before any transaction is written.
    #[instrument(skip(self, callback_url), fields(account_id = %account_id))]
    pub async fn request_withdrawal(
        &self,
        account_id: AccountId,
        amount: i64,
        callback_url: Option<String>,
    ) -> Result<WithdrawalReceipt> {
        self.ensure_running()?;
        let amount = Pennies::positive(amount)?;

        let balance = self.accounts.get_balance(&account_id).await?;
        let transaction_id = self
            .ledger
            .create(NewTransaction::withdrawal(account_id, amount, callback_url))
            .await?;
        self.metrics.withdrawal_requested();

        info!(
            transaction_id = %transaction_id,
            amount = %amount,
            balance = %balance,
            "Withdrawal accepted"
        );

        self.dispatch(transaction_id);

        Ok(WithdrawalReceipt::accepted(transaction_id))
    }

    /// Settle a pending withdrawal now, bypassing the verification delay.
    pub async fn settle_withdrawal(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.ensure_running()?;
        self.processor.settle_withdrawal(transaction_id).await
    }

    /// Handle a deposit request body.
    pub async fn submit_deposit(&self, request: DepositRequest) -> Result<DepositReceipt> {
        checked_account(&request.account_id)?;
        self.request_deposit(request.account_id, request.amount).await
    }

    /// Handle a withdrawal request body.
    pub async fn submit_withdrawal(&self, request: WithdrawalRequest) -> Result<WithdrawalReceipt> {
        checked_account(&request.account_id)?;
        self.request_withdrawal(request.account_id, request.amount, request.callback_url)
            .await
    }

    /// Current balance of an account.
    pub async fn balance(&self, account_id: &AccountId) -> Result<Pennies> {
        self.accounts.get_balance(account_id).await
    }

    /// Look up a transaction.
    pub async fn transaction(&self, transaction_id: TransactionId) -> Result<Transaction> {
        self.ledger.get(transaction_id).await
    }

    /// All transactions of an account, oldest first.
    pub async fn history(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.ledger.list_for_account(account_id).await
    }

    /// Transactions held back because their balance and state disagree.
    pub fn quarantined(&self) -> Vec<Claim> {
        self.claims.quarantined()
    }

    /// Let settlement touch a quarantined transaction again, once its balance
    /// was corrected by hand. Returns `false` if it was not quarantined.
    pub fn release_quarantine(&self, transaction_id: TransactionId) -> bool {
        self.claims.release(&transaction_id)
    }

    /// Get current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics in Prometheus text format.
    pub fn prometheus_metrics(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Check if the engine is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state().accepts_requests()
    }

    /// Settlements dispatched but not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Wait until every dispatched settlement has finished.
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Stop accepting requests and wait for in-flight settlements.
    ///
    /// Settlements still running when the drain timeout expires keep running
    /// detached; their transactions may remain pending.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if !state.accepts_requests() {
                return;
            }
            *state = EngineState::Draining;
        }

        info!(in_flight = self.in_flight(), "Draining settlements");

        let drained = tokio::time::timeout(self.config.drain_timeout, self.in_flight.wait_idle())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "Drain timed out, unfinished withdrawals may stay pending"
            );
        }

        *self.state.write() = EngineState::Stopped;
        info!("Settlement engine stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_accepting_requests() {
            Ok(())
        } else {
            Err(LedgerError::ShuttingDown)
        }
    }

    fn confirmation_link(&self, transaction_id: TransactionId) -> String {
        format!(
            "{}/{}",
            self.config.confirmation_base_url.trim_end_matches('/'),
            transaction_id
        )
    }

    /// Spawn the detached settlement of a withdrawal.
    fn dispatch(&self, transaction_id: TransactionId) {
        let ticket = SettlementTicket::issue(self.in_flight.clone(), self.metrics.clone());
        let processor = self.processor.clone();
        let permits = self.permits.clone();
        let metrics = self.metrics.clone();
        let delay = self.config.verification_delay;
        let timeout = self.config.settlement_timeout;

        tokio::spawn(async move {
            let _ticket = ticket;

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(transaction_id = %transaction_id, "Settlement permits closed");
                    return;
                }
            };

            // Once started a settlement runs to completion; the timeout only
            // reports it as overdue.
            let settlement = processor.settle_withdrawal(transaction_id);
            tokio::pin!(settlement);
            let outcome = match tokio::time::timeout(timeout, &mut settlement).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    metrics.settlement_timeout();
                    warn!(
                        transaction_id = %transaction_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Settlement overdue, waiting for it to finish"
                    );
                    settlement.await
                }
            };

            match outcome {
                Ok(tx) => {
                    debug!(transaction_id = %transaction_id, state = %tx.state, "Settlement finished");
                }
                Err(e) => {
                    error!(
                        transaction_id = %transaction_id,
                        error = %e,
                        code = e.error_code(),
                        "Settlement outcome not recorded"
                    );
                }
            }
        });
    }
}

/// Count of dispatched settlements with a wakeup for when it reaches zero.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent finish is not missed.
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a settlement task for its whole life.
struct SettlementTicket {
    in_flight: Arc<InFlight>,
    metrics: SharedMetrics,
}

impl SettlementTicket {
    fn issue(in_flight: Arc<InFlight>, metrics: SharedMetrics) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        metrics.settlement_started();
        Self { in_flight, metrics }
    }
}

impl Drop for SettlementTicket {
    fn drop(&mut self) {
        self.metrics.settlement_finished();
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
