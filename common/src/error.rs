//! Error types for ledger operations.

use crate::{AccountId, Pennies, TransactionId, TransactionState};
use thiserror::Error;

/// Main error type for ledger and settlement operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Requested amount is zero or negative.
    #[error("Invalid amount: {amount} (must be positive)")]
    InvalidAmount { amount: i64 },

    /// Account was never provisioned.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Transaction ID is unknown.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Withdrawal would make the balance negative.
    #[error("Insufficient funds in {account_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        available: Pennies,
        requested: Pennies,
    },

    /// Transition attempted on a transaction that cannot take it.
    #[error("Transaction {transaction_id} is {state}")]
    InvalidState {
        transaction_id: TransactionId,
        state: TransactionState,
    },

    /// Persistence backend unreachable or failing.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Engine is draining and refuses new work.
    #[error("Settlement engine is shutting down")]
    ShuttingDown,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::StoreUnavailable(_) | LedgerError::ShuttingDown
        )
    }

    /// Get error code for responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount { .. } => "INVALID_AMOUNT",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::InvalidState { .. } => "INVALID_STATE",
            LedgerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            LedgerError::ShuttingDown => "SHUTTING_DOWN",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
