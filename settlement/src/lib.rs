//! Penny Settlement Engine
//!
//! Orchestrates deposits and withdrawals over the account store and the
//! transaction ledger. It is the only component that changes balances, and it
//! guarantees a balance never goes negative even under concurrent withdrawals.

pub mod claims;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod processor;
pub mod requests;
pub mod state;

pub use claims::Claim;
pub use config::{DepositMode, EngineConfig, SettlementConfig, StorageConfig};
pub use engine::SettlementEngine;
pub use metrics::MetricsSnapshot;
pub use requests::{DepositReceipt, DepositRequest, WithdrawalReceipt, WithdrawalRequest};
pub use state::EngineState;
