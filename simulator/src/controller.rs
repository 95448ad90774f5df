//! Simulation controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use penny_common::{AccountId, LedgerError, TransactionId};
use penny_ledger::{MemoryAccountStore, MemoryTransactionLedger};
use penny_settlement::{EngineConfig, MetricsSnapshot, SettlementEngine};

use crate::metrics::{RequestSummary, SimulationMetrics};
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioOptions, ScenarioStep};

/// Handles for injecting faults into the in-memory backends.
struct FaultHandles {
    accounts: Arc<MemoryAccountStore>,
    ledger: Arc<MemoryTransactionLedger>,
}

/// Drives one engine through scenarios.
pub struct SimulationController {
    engine: Arc<SettlementEngine>,
    /// `None` on the Postgres backend.
    faults: Option<FaultHandles>,
    /// Random number generator.
    rng: StdRng,
    /// Keeps account IDs unique per run on a shared database.
    run_tag: String,
    /// Logical account names touched so far.
    accounts: BTreeMap<String, AccountId>,
    /// Confirmation link of the latest deposit.
    last_link: Option<String>,
    metrics: SimulationMetrics,
    failed_assertions: Vec<String>,
}

impl SimulationController {
    /// Create a controller over the backend the configuration names.
    pub async fn new(config: &EngineConfig, seed: Option<u64>) -> anyhow::Result<Self> {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let (engine, faults) = if config.storage.database_url.is_some() {
            (SettlementEngine::connect(config).await?, None)
        } else {
            let accounts = Arc::new(MemoryAccountStore::new());
            let ledger = Arc::new(MemoryTransactionLedger::new());
            let engine = SettlementEngine::new(
                config.settlement.clone(),
                accounts.clone(),
                ledger.clone(),
            );
            (engine, Some(FaultHandles { accounts, ledger }))
        };

        let run_tag = Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(run_tag = %run_tag, in_memory = faults.is_some(), "Simulation initialized");

        Ok(Self {
            engine: Arc::new(engine),
            faults,
            rng,
            run_tag,
            accounts: BTreeMap::new(),
            last_link: None,
            metrics: SimulationMetrics::new(),
            failed_assertions: Vec::new(),
        })
    }

    /// Build a scenario, drawing randomness from the controller's seed.
    pub fn scenario(&mut self, name: &str, options: &ScenarioOptions) -> anyhow::Result<Scenario> {
        Scenario::load(name, options, &mut self.rng)
    }

    /// Run a scenario and report on it.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<SimulationReport> {
        info!(
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Running scenario: {}",
            scenario.description
        );

        let start = Instant::now();
        for step in &scenario.steps {
            self.execute_step(step).await?;
        }
        self.engine.wait_idle().await;

        self.report(&scenario.name, start.elapsed()).await
    }

    /// Stop the engine.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Deposit {
                account,
                amount,
                confirm,
            } => {
                let account_id = self.account(account);
                let started = Instant::now();
                match self.engine.request_deposit(account_id, *amount).await {
                    Ok(receipt) => {
                        self.record(started, Ok(()));
                        self.last_link = Some(receipt.confirmation_link);
                        if *confirm {
                            self.confirm_last().await;
                        }
                    }
                    Err(e) => self.record(started, Err(e)),
                }
            }
            ScenarioStep::ConfirmLast { times } => {
                for _ in 0..*times {
                    self.confirm_last().await;
                }
            }
            ScenarioStep::Withdraw { account, amount } => {
                let account_id = self.account(account);
                let started = Instant::now();
                let result = self
                    .engine
                    .request_withdrawal(account_id, *amount, None)
                    .await;
                self.record(started, result.map(|_| ()));
            }
            ScenarioStep::Burst {
                account,
                count,
                amount,
            } => {
                let account_id = self.account(account);
                let started = Instant::now();
                let requests = (0..*count).map(|_| {
                    self.engine
                        .request_withdrawal(account_id.clone(), *amount, None)
                });
                let results = join_all(requests).await;
                for result in results {
                    self.record(started, result.map(|_| ()));
                }
            }
            ScenarioStep::Settle => {
                self.engine.wait_idle().await;
            }
            ScenarioStep::InjectFault { fault_type } => self.set_fault(Some(*fault_type)),
            ScenarioStep::ClearFaults => self.set_fault(None),
            ScenarioStep::Assert { condition } => self.check(condition).await?,
        }

        Ok(())
    }

    /// Follow the latest confirmation link the way a payer's browser would.
    async fn confirm_last(&mut self) {
        let Some(link) = self.last_link.clone() else {
            warn!("No deposit to confirm");
            return;
        };

        let started = Instant::now();
        let result = match link.rsplit('/').next().map(TransactionId::parse) {
            Some(Ok(transaction_id)) => self.engine.confirm_deposit(transaction_id).await,
            _ => {
                warn!(link = %link, "Malformed confirmation link");
                return;
            }
        };
        self.record(started, result.map(|_| ()));
    }

    fn record(&mut self, started: Instant, result: Result<(), LedgerError>) {
        match result {
            Ok(()) => self
                .metrics
                .record_accepted(started.elapsed().as_micros() as u64),
            Err(e) => self.metrics.record_rejected(e.error_code()),
        }
    }

    fn account(&mut self, name: &str) -> AccountId {
        let run_tag = &self.run_tag;
        self.accounts
            .entry(name.to_string())
            .or_insert_with(|| AccountId::new(format!("sim-{}-{}", run_tag, name)))
            .clone()
    }

    fn set_fault(&self, fault: Option<FaultType>) {
        let Some(handles) = &self.faults else {
            warn!(fault = ?fault, "Fault injection needs the in-memory backend, skipping");
            return;
        };

        handles
            .accounts
            .set_available(!matches!(fault, Some(FaultType::AccountStoreOffline)));
        handles
            .ledger
            .set_available(!matches!(fault, Some(FaultType::LedgerOffline)));
        info!(fault = ?fault, "Fault state changed");
    }

    async fn check(&mut self, condition: &AssertCondition) -> anyhow::Result<()> {
        let failure = match condition {
            AssertCondition::BalanceEquals { account, amount } => {
                let account_id = self.account(account);
                let balance = self.engine.balance(&account_id).await?;
                (balance.value() != *amount).then(|| {
                    format!("balance of {} is {}, expected {}", account, balance, amount)
                })
            }
            AssertCondition::RejectedAtLeast { count } => {
                let rejected = self.metrics.rejected_requests;
                (rejected < *count)
                    .then(|| format!("{} requests rejected, expected at least {}", rejected, count))
            }
        };

        match failure {
            Some(message) => {
                warn!(assertion = %message, "Assertion failed");
                self.failed_assertions.push(message);
            }
            None => info!(condition = ?condition, "Assertion passed"),
        }
        Ok(())
    }

    async fn report(&mut self, scenario: &str, elapsed: Duration) -> anyhow::Result<SimulationReport> {
        let mut balances = BTreeMap::new();
        for (name, account_id) in &self.accounts {
            match self.engine.balance(account_id).await {
                Ok(balance) => {
                    balances.insert(
                        name.clone(),
                        BalanceReport {
                            pennies: balance.value(),
                            amount: balance.to_major(),
                        },
                    );
                }
                // Only ever referenced by rejected withdrawals.
                Err(LedgerError::AccountNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let negative_balances = balances.values().any(|b| b.pennies < 0);
        if negative_balances {
            self.failed_assertions
                .push("an account balance went negative".to_string());
        }

        Ok(SimulationReport {
            scenario: scenario.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            requests: self.metrics.summary(),
            engine: self.engine.metrics(),
            balances,
            negative_balances,
            failed_assertions: self.failed_assertions.clone(),
        })
    }
}

/// Final balance of one account.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub pennies: i64,
    /// Balance in whole currency units.
    pub amount: Decimal,
}

/// Printed when a scenario finishes.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub elapsed_ms: u64,
    pub requests: RequestSummary,
    pub engine: MetricsSnapshot,
    pub balances: BTreeMap<String, BalanceReport>,
    pub negative_balances: bool,
    pub failed_assertions: Vec<String>,
}

impl SimulationReport {
    /// Check if every assertion held.
    pub fn passed(&self) -> bool {
        !self.negative_balances && self.failed_assertions.is_empty()
    }
}
