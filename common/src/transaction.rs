//! Transaction types and state machine.

use crate::{AccountId, Pennies, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Money into the account.
    Deposit,
    /// Money out of the account.
    Withdrawal,
}

impl Direction {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deposit => "DEPOSIT",
            Direction::Withdrawal => "WITHDRAWAL",
        }
    }

    /// Signed balance delta for an amount moving in this direction.
    pub fn signed(&self, amount: Pennies) -> i64 {
        match self {
            Direction::Deposit => amount.value(),
            Direction::Withdrawal => -amount.value(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(Direction::Deposit),
            "WITHDRAWAL" => Ok(Direction::Withdrawal),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Accepted, balance not yet touched.
    Pending,
    /// Balance adjusted.
    Confirmed,
    /// Will never touch the balance.
    Aborted,
}

impl TransactionState {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionState::Confirmed | TransactionState::Aborted)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionState] {
        match self {
            TransactionState::Pending => &[TransactionState::Confirmed, TransactionState::Aborted],
            TransactionState::Confirmed => &[],
            TransactionState::Aborted => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "PENDING",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionState::Pending),
            "CONFIRMED" => Ok(TransactionState::Confirmed),
            "ABORTED" => Ok(TransactionState::Aborted),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    /// Withdrawal would have made the balance negative.
    InsufficientFunds,
    /// Account disappeared between request and settlement.
    AccountNotFound,
    /// Persistence was unreachable during settlement.
    StoreUnavailable,
    /// Anything else, including a reversed settlement.
    Internal,
}

impl AbortReason {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::InsufficientFunds => "INSUFFICIENT_FUNDS",
            AbortReason::AccountNotFound => "ACCOUNT_NOT_FOUND",
            AbortReason::StoreUnavailable => "STORE_UNAVAILABLE",
            AbortReason::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AbortReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSUFFICIENT_FUNDS" => Ok(AbortReason::InsufficientFunds),
            "ACCOUNT_NOT_FOUND" => Ok(AbortReason::AccountNotFound),
            "STORE_UNAVAILABLE" => Ok(AbortReason::StoreUnavailable),
            "INTERNAL" => Ok(AbortReason::Internal),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Terminal outcome applied to a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Confirmed,
    Aborted(AbortReason),
}

impl Outcome {
    /// State the transaction ends up in.
    pub fn state(&self) -> TransactionState {
        match self {
            Outcome::Confirmed => TransactionState::Confirmed,
            Outcome::Aborted(_) => TransactionState::Aborted,
        }
    }

    /// Abort reason, if any.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Outcome::Confirmed => None,
            Outcome::Aborted(reason) => Some(*reason),
        }
    }
}

/// Fields supplied when recording a new transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub amount: Pennies,
    pub direction: Direction,
    pub note: String,
    pub callback_url: Option<String>,
}

impl NewTransaction {
    /// A deposit with the default note.
    pub fn deposit(account_id: AccountId, amount: Pennies) -> Self {
        Self {
            account_id,
            amount,
            direction: Direction::Deposit,
            note: format!("Deposit of {} pennies", amount),
            callback_url: None,
        }
    }

    /// A withdrawal with the default note.
    pub fn withdrawal(account_id: AccountId, amount: Pennies, callback_url: Option<String>) -> Self {
        Self {
            account_id,
            amount,
            direction: Direction::Withdrawal,
            note: format!("Withdrawal of {} pennies", amount),
            callback_url,
        }
    }
}

/// A recorded deposit or withdrawal attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique transaction identifier.
    pub id: TransactionId,
    /// Account the money moves in or out of.
    pub account_id: AccountId,
    /// Always positive.
    pub amount: Pennies,
    pub direction: Direction,
    /// Current state.
    pub state: TransactionState,
    /// Set exactly when `state` is `Aborted`.
    pub abort_reason: Option<AbortReason>,
    /// Free-text description.
    pub note: String,
    /// Accepted with withdrawal requests and stored; never called.
    pub callback_url: Option<String>,
    /// When the transaction was recorded.
    pub created_at: DateTime<Utc>,
    /// When the transaction left `Pending`.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Build a pending transaction.
    pub fn pending(id: TransactionId, new: NewTransaction) -> Self {
        Self {
            id,
            account_id: new.account_id,
            amount: new.amount,
            direction: new.direction,
            state: TransactionState::Pending,
            abort_reason: None,
            note: new.note,
            callback_url: new.callback_url,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    /// Check if the transaction is still pending.
    pub fn is_pending(&self) -> bool {
        self.state == TransactionState::Pending
    }

    /// Signed balance delta this transaction applies when confirmed.
    pub fn balance_delta(&self) -> i64 {
        self.direction.signed(self.amount)
    }

    /// Move to a terminal state.
    pub fn finish(&mut self, outcome: Outcome) -> Result<(), InvalidTransition> {
        let next = outcome.state();
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        self.abort_reason = outcome.abort_reason();
        self.settled_at = Some(Utc::now());
        Ok(())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: TransactionState,
    pub to: TransactionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}
