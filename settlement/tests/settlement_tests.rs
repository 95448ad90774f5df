use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio_test::{assert_err, assert_ok};

use penny_common::{
    AbortReason, AccountId, Direction, LedgerError, NewTransaction, Outcome, Pennies, Result,
    Transaction, TransactionId, TransactionState,
};
use penny_ledger::{
    Account, AccountStore, MemoryAccountStore, MemoryTransactionLedger, TransactionLedger,
};
use penny_settlement::{
    DepositRequest, EngineState, SettlementConfig, SettlementEngine, WithdrawalRequest,
};

fn test_config() -> SettlementConfig {
    SettlementConfig {
        verification_delay: Duration::ZERO,
        settlement_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

struct Harness {
    engine: Arc<SettlementEngine>,
    accounts: Arc<MemoryAccountStore>,
    ledger: Arc<MemoryTransactionLedger>,
}

fn harness(config: SettlementConfig) -> Harness {
    let accounts = Arc::new(MemoryAccountStore::new());
    let ledger = Arc::new(MemoryTransactionLedger::new());
    let engine = Arc::new(SettlementEngine::new(config, accounts.clone(), ledger.clone()));
    Harness {
        engine,
        accounts,
        ledger,
    }
}

async fn fund(engine: &SettlementEngine, account_id: &AccountId, amount: i64) {
    let receipt = assert_ok!(engine.request_deposit(account_id.clone(), amount).await);
    assert_ok!(engine.confirm_deposit(receipt.transaction_id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_never_overdraw() {
    let h = harness(test_config());
    let alice = AccountId::new("alice");
    fund(&h.engine, &alice, 100).await;

    let (first, second) = tokio::join!(
        h.engine.request_withdrawal(alice.clone(), 60, None),
        h.engine.request_withdrawal(alice.clone(), 60, None),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    h.engine.wait_idle().await;

    let a = h.engine.transaction(first.transaction_id).await.unwrap();
    let b = h.engine.transaction(second.transaction_id).await.unwrap();
    let mut states = vec![a.state, b.state];
    states.sort_by_key(|s| s.as_str());
    assert_eq!(states, vec![TransactionState::Aborted, TransactionState::Confirmed]);

    let aborted = if a.state == TransactionState::Aborted { a } else { b };
    assert_eq!(aborted.abort_reason, Some(AbortReason::InsufficientFunds));
    assert_eq!(h.engine.balance(&alice).await.unwrap(), Pennies::new(40));

    let metrics = h.engine.metrics();
    assert_eq!(metrics.withdrawals_confirmed, 1);
    assert_eq!(metrics.withdrawals_aborted, 1);
    assert_eq!(metrics.settlements_active, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_withdrawals_settle_exactly_the_balance() {
    let h = harness(test_config());
    let bob = AccountId::new("bob");
    fund(&h.engine, &bob, 1_000).await;

    let mut handles = Vec::new();
    for _ in 0..40 {
        let engine = h.engine.clone();
        let bob = bob.clone();
        handles.push(tokio::spawn(async move {
            engine.request_withdrawal(bob, 30, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    h.engine.wait_idle().await;

    let history = h.engine.history(&bob).await.unwrap();
    let confirmed = history
        .iter()
        .filter(|tx| tx.direction == Direction::Withdrawal && tx.state == TransactionState::Confirmed)
        .count();

    // 1000 / 30 = 33 withdrawals fit, 10 pennies remain.
    assert_eq!(confirmed, 33);
    assert_eq!(h.engine.balance(&bob).await.unwrap(), Pennies::new(10));
    assert_eq!(h.ledger.pending_count(), 0);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected_without_side_effects() {
    let h = harness(test_config());
    let alice = AccountId::new("alice");
    fund(&h.engine, &alice, 100).await;

    for amount in [0, -5] {
        assert_eq!(
            h.engine.request_deposit(alice.clone(), amount).await,
            Err(LedgerError::InvalidAmount { amount })
        );
        assert_eq!(
            h.engine.request_withdrawal(alice.clone(), amount, None).await,
            Err(LedgerError::InvalidAmount { amount })
        );
    }

    assert_eq!(h.engine.balance(&alice).await.unwrap(), Pennies::new(100));
    assert_eq!(h.engine.history(&alice).await.unwrap().len(), 1);
}

#[tokio::test]
async fn withdrawal_from_unknown_account_creates_nothing() {
    let h = harness(test_config());
    let ghost = AccountId::new("ghost");

    assert_eq!(
        h.engine.request_withdrawal(ghost.clone(), 10, None).await,
        Err(LedgerError::AccountNotFound(ghost.clone()))
    );
    assert!(h.ledger.is_empty());
    assert!(h.accounts.is_empty());
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test]
async fn deposit_round_trip() {
    let h = harness(test_config());
    let carol = AccountId::new("carol");

    let receipt = h.engine.request_deposit(carol.clone(), 500).await.unwrap();
    assert_eq!(receipt.state, TransactionState::Pending);
    assert_eq!(h.engine.balance(&carol).await.unwrap(), Pennies::ZERO);

    let confirmed = h.engine.confirm_deposit(receipt.transaction_id).await.unwrap();

    assert_eq!(confirmed.state, TransactionState::Confirmed);
    assert!(confirmed.settled_at.is_some());
    assert_eq!(h.engine.balance(&carol).await.unwrap(), Pennies::new(500));
}

#[tokio::test]
async fn deposit_confirmation_is_idempotent() {
    let h = harness(test_config());
    let carol = AccountId::new("carol");
    let receipt = h.engine.request_deposit(carol.clone(), 500).await.unwrap();

    h.engine.confirm_deposit(receipt.transaction_id).await.unwrap();
    let err = h
        .engine
        .confirm_deposit(receipt.transaction_id)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LedgerError::InvalidState {
            transaction_id: receipt.transaction_id,
            state: TransactionState::Confirmed,
        }
    );
    assert_eq!(h.engine.balance(&carol).await.unwrap(), Pennies::new(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_confirmations_credit_once() {
    let h = harness(test_config());
    let dave = AccountId::new("dave");
    let receipt = h.engine.request_deposit(dave.clone(), 75).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let id = receipt.transaction_id;
        handles.push(tokio::spawn(async move { engine.confirm_deposit(id).await }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(h.engine.balance(&dave).await.unwrap(), Pennies::new(75));
}

#[tokio::test]
async fn withdrawal_aborts_when_account_store_goes_offline() {
    let mut config = test_config();
    config.verification_delay = Duration::from_millis(100);
    let h = harness(config);
    let erin = AccountId::new("erin");
    fund(&h.engine, &erin, 100).await;

    let receipt = h.engine.request_withdrawal(erin.clone(), 30, None).await.unwrap();
    h.accounts.set_available(false);
    h.engine.wait_idle().await;
    h.accounts.set_available(true);

    let tx = h.engine.transaction(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Aborted);
    assert_eq!(tx.abort_reason, Some(AbortReason::StoreUnavailable));
    assert_eq!(h.engine.balance(&erin).await.unwrap(), Pennies::new(100));
}

#[tokio::test]
async fn unreachable_store_is_reported_to_synchronous_callers() {
    let h = harness(test_config());
    let frank = AccountId::new("frank");
    fund(&h.engine, &frank, 100).await;

    h.ledger.set_available(false);
    let err = assert_err!(h.engine.request_withdrawal(frank.clone(), 10, None).await);
    assert!(err.is_retryable());
    h.ledger.set_available(true);

    h.accounts.set_available(false);
    let receipt_err = h.engine.request_deposit(frank.clone(), 10).await.unwrap_err();
    assert!(matches!(receipt_err, LedgerError::StoreUnavailable(_)));
    h.accounts.set_available(true);

    assert_eq!(h.engine.balance(&frank).await.unwrap(), Pennies::new(100));
    assert_eq!(h.engine.history(&frank).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_state_write_reverses_deposit_credit() {
    let h = harness(test_config());
    let gina = AccountId::new("gina");
    let receipt = h.engine.request_deposit(gina.clone(), 40).await.unwrap();

    // Ledger reachable for the read, unreachable for the state write.
    let ledger = FlakyLedger::new(h.ledger.clone());
    let engine = SettlementEngine::new(test_config(), h.accounts.clone(), ledger.clone());
    ledger.fail_next_writes(1);

    let err = engine.confirm_deposit(receipt.transaction_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.balance(&gina).await.unwrap(), Pennies::ZERO);
    assert_eq!(engine.metrics().compensations, 1);
    assert!(h.ledger.get(receipt.transaction_id).await.unwrap().is_pending());
    assert!(engine.quarantined().is_empty());

    engine.confirm_deposit(receipt.transaction_id).await.unwrap();
    assert_eq!(engine.balance(&gina).await.unwrap(), Pennies::new(40));
}

#[tokio::test]
async fn spent_deposit_credit_is_recorded_as_confirmed() {
    let h = harness(test_config());
    let lena = AccountId::new("lena");
    let receipt = h.engine.request_deposit(lena.clone(), 40).await.unwrap();

    // A withdrawal spends the credit while the deposit's state write fails.
    let ledger = FlakyLedger::new(h.ledger.clone());
    ledger.spend_on_failure(h.accounts.clone(), lena.clone(), 40);
    let engine = SettlementEngine::new(test_config(), h.accounts.clone(), ledger.clone());
    ledger.fail_next_writes(1);

    let tx = engine.confirm_deposit(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert_eq!(engine.balance(&lena).await.unwrap(), Pennies::ZERO);

    assert!(matches!(
        engine.confirm_deposit(receipt.transaction_id).await,
        Err(LedgerError::InvalidState {
            state: TransactionState::Confirmed,
            ..
        })
    ));
    assert_eq!(engine.balance(&lena).await.unwrap(), Pennies::ZERO);
}

#[tokio::test]
async fn unreconcilable_deposit_is_quarantined_not_credited_twice() {
    let h = harness(test_config());
    let mia = AccountId::new("mia");
    let receipt = h.engine.request_deposit(mia.clone(), 40).await.unwrap();

    let ledger = FlakyLedger::new(h.ledger.clone());
    ledger.spend_on_failure(h.accounts.clone(), mia.clone(), 40);
    let engine = SettlementEngine::new(test_config(), h.accounts.clone(), ledger.clone());
    ledger.fail_next_writes(usize::MAX);

    assert_err!(engine.confirm_deposit(receipt.transaction_id).await);
    assert_eq!(engine.metrics().quarantines, 1);
    let held = engine.quarantined();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].transaction_id, receipt.transaction_id);

    // Ledger back online: the deposit is still pending but cannot be re-applied.
    ledger.fail_next_writes(0);
    assert!(matches!(
        engine.confirm_deposit(receipt.transaction_id).await,
        Err(LedgerError::InvalidState {
            state: TransactionState::Pending,
            ..
        })
    ));
    assert_eq!(engine.balance(&mia).await.unwrap(), Pennies::ZERO);

    assert!(engine.release_quarantine(receipt.transaction_id));
    assert!(engine.quarantined().is_empty());
}

#[tokio::test]
async fn slow_balance_write_is_reported_and_still_settles() {
    let mut config = test_config();
    config.settlement_timeout = Duration::from_millis(50);
    let accounts = Arc::new(SlowAccounts::new(Duration::from_millis(300)));
    let ledger = Arc::new(MemoryTransactionLedger::new());
    let engine = SettlementEngine::new(config, accounts.clone(), ledger.clone());
    let hana = AccountId::new("hana");
    accounts.inner.ensure_account(&hana).await.unwrap();
    accounts.inner.adjust_balance(&hana, 100).await.unwrap();

    let receipt = engine.request_withdrawal(hana.clone(), 10, None).await.unwrap();
    engine.wait_idle().await;

    let tx = engine.transaction(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert_eq!(engine.balance(&hana).await.unwrap(), Pennies::new(90));
    assert_eq!(engine.metrics().settlement_timeouts, 1);
}

#[tokio::test]
async fn stalled_state_write_is_never_cut_short() {
    let mut config = test_config();
    config.settlement_timeout = Duration::from_millis(50);
    let accounts = Arc::new(MemoryAccountStore::new());
    let ledger = Arc::new(SlowLedger::new(Duration::from_millis(500)));
    let engine = SettlementEngine::new(config, accounts.clone(), ledger.clone());
    let nora = AccountId::new("nora");
    accounts.ensure_account(&nora).await.unwrap();
    accounts.adjust_balance(&nora, 100).await.unwrap();

    let receipt = engine.request_withdrawal(nora.clone(), 60, None).await.unwrap();

    // Past the timeout, debit applied, state write still stalled.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.metrics().settlement_timeouts, 1);
    assert!(matches!(
        engine.settle_withdrawal(receipt.transaction_id).await,
        Err(LedgerError::InvalidState {
            state: TransactionState::Pending,
            ..
        })
    ));

    engine.wait_idle().await;

    let tx = engine.transaction(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert_eq!(engine.balance(&nora).await.unwrap(), Pennies::new(40));
    assert_eq!(engine.metrics().withdrawals_confirmed, 1);
    assert_eq!(engine.metrics().withdrawals_aborted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verification_delay_does_not_hold_a_settlement_slot() {
    let mut config = test_config();
    config.verification_delay = Duration::from_millis(300);
    config.max_concurrent_settlements = 1;
    let h = harness(config);
    let omar = AccountId::new("omar");
    fund(&h.engine, &omar, 100).await;

    let started = std::time::Instant::now();
    h.engine.request_withdrawal(omar.clone(), 10, None).await.unwrap();
    h.engine.request_withdrawal(omar.clone(), 10, None).await.unwrap();
    h.engine.wait_idle().await;

    // Both delays overlap; a slot held through the delay would serialize them.
    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(h.engine.balance(&omar).await.unwrap(), Pennies::new(80));
}

#[tokio::test]
async fn shutdown_drains_in_flight_settlements() {
    let mut config = test_config();
    config.verification_delay = Duration::from_millis(50);
    let h = harness(config);
    let ivan = AccountId::new("ivan");
    fund(&h.engine, &ivan, 100).await;

    let receipt = h.engine.request_withdrawal(ivan.clone(), 25, None).await.unwrap();
    assert_eq!(h.engine.in_flight(), 1);

    h.engine.shutdown().await;

    assert_eq!(h.engine.state(), EngineState::Stopped);
    assert_eq!(h.engine.in_flight(), 0);
    let tx = h.engine.transaction(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert_eq!(
        h.engine.request_withdrawal(ivan, 1, None).await,
        Err(LedgerError::ShuttingDown)
    );
}

#[tokio::test]
async fn request_bodies_flow_through_the_engine() {
    let h = harness(test_config());

    let deposit: DepositRequest =
        serde_json::from_str(r#"{"userId":"judy","count":300}"#).unwrap();
    let receipt = h.engine.submit_deposit(deposit).await.unwrap();
    h.engine.confirm_deposit(receipt.transaction_id).await.unwrap();

    let withdrawal: WithdrawalRequest = serde_json::from_str(
        r#"{"userId":"judy","count":120,"url":"https://shop.example.test/hook"}"#,
    )
    .unwrap();
    let receipt = h.engine.submit_withdrawal(withdrawal).await.unwrap();
    assert_eq!(
        receipt.message,
        "We have already started processing your request"
    );
    h.engine.wait_idle().await;

    let tx = h.engine.transaction(receipt.transaction_id).await.unwrap();
    assert_eq!(tx.callback_url.as_deref(), Some("https://shop.example.test/hook"));
    assert_eq!(tx.state, TransactionState::Confirmed);
    assert_eq!(
        h.engine.balance(&AccountId::new("judy")).await.unwrap(),
        Pennies::new(180)
    );

    let blank = DepositRequest {
        account_id: AccountId::new(""),
        amount: 5,
    };
    assert!(matches!(
        h.engine.submit_deposit(blank).await,
        Err(LedgerError::AccountNotFound(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn balance_equals_confirmed_history(
        ops in prop::collection::vec((any::<bool>(), 1i64..200), 1..25)
    ) {
        tokio_test::block_on(async {
            let h = harness(test_config());
            let kim = AccountId::new("kim");
            h.accounts.ensure_account(&kim).await.unwrap();

            for (is_deposit, amount) in ops {
                if is_deposit {
                    fund(&h.engine, &kim, amount).await;
                } else {
                    h.engine.request_withdrawal(kim.clone(), amount, None).await.unwrap();
                }
            }
            h.engine.wait_idle().await;

            let expected: i64 = h
                .engine
                .history(&kim)
                .await
                .unwrap()
                .iter()
                .filter(|tx| tx.state == TransactionState::Confirmed)
                .map(|tx| tx.balance_delta())
                .sum();
            let balance = h.engine.balance(&kim).await.unwrap();

            assert!(!balance.is_negative());
            assert_eq!(balance.value(), expected);
            assert_eq!(h.ledger.pending_count(), 0);
        });
    }
}

/// Transaction ledger whose next state writes fail, optionally spending the
/// account's funds at the moment of the first failure.
struct FlakyLedger {
    inner: Arc<MemoryTransactionLedger>,
    failures_left: AtomicUsize,
    spend: Mutex<Option<(Arc<MemoryAccountStore>, AccountId, i64)>>,
}

impl FlakyLedger {
    fn new(inner: Arc<MemoryTransactionLedger>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicUsize::new(0),
            spend: Mutex::new(None),
        })
    }

    fn fail_next_writes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn spend_on_failure(
        &self,
        accounts: Arc<MemoryAccountStore>,
        account_id: AccountId,
        amount: i64,
    ) {
        *self.spend.lock().unwrap() = Some((accounts, account_id, amount));
    }
}

#[async_trait]
impl TransactionLedger for FlakyLedger {
    async fn create(&self, new: NewTransaction) -> Result<TransactionId> {
        self.inner.create(new).await
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.inner.get(id).await
    }

    async fn mark_terminal(&self, id: TransactionId, outcome: Outcome) -> Result<Transaction> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !failing {
            return self.inner.mark_terminal(id, outcome).await;
        }

        let spend = self.spend.lock().unwrap().take();
        if let Some((accounts, account_id, amount)) = spend {
            accounts.adjust_balance(&account_id, -amount).await?;
        }
        Err(LedgerError::StoreUnavailable("write rejected".into()))
    }

    async fn list_for_account(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.inner.list_for_account(account_id).await
    }
}

/// Transaction ledger that stalls before every state write.
struct SlowLedger {
    inner: MemoryTransactionLedger,
    stall: Duration,
}

impl SlowLedger {
    fn new(stall: Duration) -> Self {
        Self {
            inner: MemoryTransactionLedger::new(),
            stall,
        }
    }
}

#[async_trait]
impl TransactionLedger for SlowLedger {
    async fn create(&self, new: NewTransaction) -> Result<TransactionId> {
        self.inner.create(new).await
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.inner.get(id).await
    }

    async fn mark_terminal(&self, id: TransactionId, outcome: Outcome) -> Result<Transaction> {
        tokio::time::sleep(self.stall).await;
        self.inner.mark_terminal(id, outcome).await
    }

    async fn list_for_account(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        self.inner.list_for_account(account_id).await
    }
}

/// Account store that stalls before every balance write.
struct SlowAccounts {
    inner: MemoryAccountStore,
    stall: Duration,
}

impl SlowAccounts {
    fn new(stall: Duration) -> Self {
        Self {
            inner: MemoryAccountStore::new(),
            stall,
        }
    }
}

#[async_trait]
impl AccountStore for SlowAccounts {
    async fn ensure_account(&self, account_id: &AccountId) -> Result<()> {
        self.inner.ensure_account(account_id).await
    }

    async fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.inner.account(account_id).await
    }

    async fn adjust_balance(&self, account_id: &AccountId, delta: i64) -> Result<Pennies> {
        tokio::time::sleep(self.stall).await;
        self.inner.adjust_balance(account_id, delta).await
    }
}
