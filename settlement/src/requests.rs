//! Request and receipt bodies exchanged with clients.

use serde::{Deserialize, Serialize};

use penny_common::{AccountId, LedgerError, Result, TransactionId, TransactionState};

/// Message returned for every accepted withdrawal.
pub const WITHDRAWAL_ACCEPTED: &str = "We have already started processing your request";

/// Deposit request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    #[serde(rename = "userId")]
    pub account_id: AccountId,
    #[serde(rename = "count")]
    pub amount: i64,
}

/// Withdrawal request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    #[serde(rename = "userId")]
    pub account_id: AccountId,
    #[serde(rename = "count")]
    pub amount: i64,
    /// Stored with the transaction, never called.
    #[serde(rename = "url", default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Reply to a deposit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub transaction_id: TransactionId,
    /// Link the payer follows to confirm the deposit.
    pub confirmation_link: String,
    pub state: TransactionState,
}

/// Reply to a withdrawal request. The outcome arrives later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalReceipt {
    pub transaction_id: TransactionId,
    pub message: String,
}

impl WithdrawalReceipt {
    pub fn accepted(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            message: WITHDRAWAL_ACCEPTED.to_string(),
        }
    }
}

/// A malformed account ID names no account.
pub(crate) fn checked_account(account_id: &AccountId) -> Result<()> {
    if account_id.is_valid() {
        Ok(())
    } else {
        Err(LedgerError::AccountNotFound(account_id.clone()))
    }
}
