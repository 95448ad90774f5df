//! Simulation scenarios.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Accounts are named logically; the controller maps
/// names to account IDs unique to the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Pause for a while.
    Wait { millis: u64 },
    /// Request a deposit, optionally following its confirmation link.
    Deposit {
        account: String,
        amount: i64,
        confirm: bool,
    },
    /// Follow the confirmation link of the last deposit, `times` times.
    ConfirmLast { times: usize },
    /// Request one withdrawal.
    Withdraw { account: String, amount: i64 },
    /// Request `count` withdrawals at once.
    Burst {
        account: String,
        count: usize,
        amount: i64,
    },
    /// Wait for every dispatched settlement.
    Settle,
    /// Inject a fault.
    InjectFault { fault_type: FaultType },
    /// Clear all faults.
    ClearFaults,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FaultType {
    /// Account store unreachable.
    AccountStoreOffline,
    /// Transaction ledger unreachable.
    LedgerOffline,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Account balance equals the given pennies.
    BalanceEquals { account: String, amount: i64 },
    /// At least this many requests were rejected.
    RejectedAtLeast { count: u64 },
}

/// Knobs for generated scenarios.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioOptions {
    /// Accounts touched by the random scenario.
    pub accounts: usize,
    /// Operations in the random scenario.
    pub operations: usize,
    /// Concurrent withdrawals in the contention scenario.
    pub burst: usize,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            accounts: 5,
            operations: 200,
            burst: 50,
        }
    }
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str, options: &ScenarioOptions, rng: &mut StdRng) -> anyhow::Result<Self> {
        match name {
            "contention" => Ok(Self::contention(options.burst)),
            "round-trip" => Ok(Self::round_trip()),
            "failure-recovery" => Ok(Self::failure_recovery()),
            "random" => Ok(Self::random(options, rng)),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Overlapping withdrawals against one funded account.
    fn contention(burst: usize) -> Self {
        let burst = burst.max(2);
        let funded = 10 * (burst as i64 / 2);

        Self {
            name: "contention".to_string(),
            description: "Concurrent withdrawals racing for one balance".to_string(),
            steps: vec![
                ScenarioStep::Deposit {
                    account: "alice".to_string(),
                    amount: 100,
                    confirm: true,
                },
                ScenarioStep::Burst {
                    account: "alice".to_string(),
                    count: 2,
                    amount: 60,
                },
                ScenarioStep::Settle,
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "alice".to_string(),
                        amount: 40,
                    },
                },
                // Half of the burst fits the balance.
                ScenarioStep::Deposit {
                    account: "bob".to_string(),
                    amount: funded,
                    confirm: true,
                },
                ScenarioStep::Burst {
                    account: "bob".to_string(),
                    count: burst,
                    amount: 10,
                },
                ScenarioStep::Settle,
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "bob".to_string(),
                        amount: 0,
                    },
                },
            ],
        }
    }

    /// Deposit, confirm twice, withdraw it all.
    fn round_trip() -> Self {
        Self {
            name: "round-trip".to_string(),
            description: "Two-step deposit with a repeated confirmation".to_string(),
            steps: vec![
                ScenarioStep::Deposit {
                    account: "carol".to_string(),
                    amount: 500,
                    confirm: false,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "carol".to_string(),
                        amount: 0,
                    },
                },
                ScenarioStep::ConfirmLast { times: 2 },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "carol".to_string(),
                        amount: 500,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::RejectedAtLeast { count: 1 },
                },
                ScenarioStep::Withdraw {
                    account: "carol".to_string(),
                    amount: 500,
                },
                ScenarioStep::Settle,
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "carol".to_string(),
                        amount: 0,
                    },
                },
            ],
        }
    }

    /// Requests fail while a store is down and succeed after it returns.
    fn failure_recovery() -> Self {
        Self {
            name: "failure-recovery".to_string(),
            description: "Store outage and recovery".to_string(),
            steps: vec![
                ScenarioStep::Deposit {
                    account: "dave".to_string(),
                    amount: 300,
                    confirm: true,
                },
                ScenarioStep::InjectFault {
                    fault_type: FaultType::AccountStoreOffline,
                },
                // Rejected, nothing recorded
                ScenarioStep::Withdraw {
                    account: "dave".to_string(),
                    amount: 100,
                },
                ScenarioStep::ClearFaults,
                ScenarioStep::InjectFault {
                    fault_type: FaultType::LedgerOffline,
                },
                ScenarioStep::Deposit {
                    account: "dave".to_string(),
                    amount: 50,
                    confirm: true,
                },
                ScenarioStep::ClearFaults,
                ScenarioStep::Assert {
                    condition: AssertCondition::RejectedAtLeast { count: 2 },
                },
                ScenarioStep::Withdraw {
                    account: "dave".to_string(),
                    amount: 100,
                },
                ScenarioStep::Settle,
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        account: "dave".to_string(),
                        amount: 200,
                    },
                },
            ],
        }
    }

    /// Seeded random mix of deposits and withdrawals across accounts.
    fn random(options: &ScenarioOptions, rng: &mut StdRng) -> Self {
        let accounts = options.accounts.max(1);
        let mut steps = Vec::with_capacity(options.operations + options.operations / 20 + 1);

        for i in 0..options.operations {
            let account = format!("user-{}", rng.gen_range(0..accounts));
            let roll = rng.gen_range(0..100);

            let step = if roll < 45 {
                ScenarioStep::Deposit {
                    account,
                    amount: rng.gen_range(1..500),
                    confirm: true,
                }
            } else if roll < 55 {
                ScenarioStep::Deposit {
                    account,
                    amount: rng.gen_range(1..500),
                    confirm: false,
                }
            } else if roll < 90 {
                ScenarioStep::Withdraw {
                    account,
                    amount: rng.gen_range(1..400),
                }
            } else {
                ScenarioStep::Burst {
                    account,
                    count: rng.gen_range(2..8),
                    amount: rng.gen_range(1..200),
                }
            };
            steps.push(step);

            if (i + 1) % 20 == 0 {
                steps.push(ScenarioStep::Settle);
            }
        }
        steps.push(ScenarioStep::Settle);

        Self {
            name: "random".to_string(),
            description: format!(
                "{} random operations across {} accounts",
                options.operations, accounts
            ),
            steps,
        }
    }
}
