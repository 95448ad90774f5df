//! Postgres backends.
//!
//! The balance check and the write happen inside one conditional `UPDATE`, so
//! Postgres' row lock serializes concurrent adjustments of the same account.
//! A `CHECK (balance >= 0)` constraint backs the invariant at the schema level.
//! [`PgSettlementStore`] runs the balance update and the state update of one
//! settlement inside a single database transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, instrument};
use uuid::Uuid;

use penny_common::{
    AbortReason, AccountId, LedgerError, NewTransaction, Outcome, Pennies, Result, Transaction,
    TransactionId, TransactionState, UnknownVariant,
};

use crate::account::{Account, AccountStore};
use crate::journal::TransactionLedger;
use crate::settle::SettlementStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        account_id  TEXT PRIMARY KEY,
        balance     BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        transaction_id  UUID PRIMARY KEY,
        account_id      TEXT NOT NULL REFERENCES accounts (account_id),
        amount          BIGINT NOT NULL CHECK (amount > 0),
        direction       TEXT NOT NULL,
        state           TEXT NOT NULL,
        abort_reason    TEXT,
        note            TEXT NOT NULL,
        callback_url    TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        settled_at      TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS transactions_account_idx
        ON transactions (account_id, created_at)
    "#,
];

const TRANSACTION_COLUMNS: &str = "transaction_id, account_id, amount, direction, state, \
     abort_reason, note, callback_url, created_at, settled_at";

/// Guarded balance update; returns no row when the account is missing or the
/// result would be negative.
const ADJUST_BALANCE: &str = r#"
    UPDATE accounts
    SET balance = balance + $2,
        updated_at = NOW()
    WHERE account_id = $1 AND balance + $2 >= 0
    RETURNING balance
"#;

/// Foreign key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Open a connection pool.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .map_err(|e| store_error("connect", e))
}

/// Create the tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| store_error("migrate", e))?;
    }
    info!("Ledger schema ready");
    Ok(())
}

fn store_error(operation: &str, e: sqlx::Error) -> LedgerError {
    LedgerError::StoreUnavailable(format!("{}: {}", operation, e))
}

fn decode_error(e: UnknownVariant) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

/// Account store backed by the `accounts` table.
#[derive(Debug, Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &PgRow) -> std::result::Result<Account, sqlx::Error> {
    Ok(Account {
        id: AccountId::new(row.try_get::<String, _>("account_id")?),
        balance: Pennies::new(row.try_get("balance")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AccountStore for PgAccountStore {
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn ensure_account(&self, account_id: &AccountId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, balance)
            VALUES ($1, 0)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("ensure_account", e))?;

        Ok(())
    }

    async fn account(&self, account_id: &AccountId) -> Result<Account> {
        let row = sqlx::query(
            r#"
            SELECT account_id, balance, created_at, updated_at
            FROM accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("account", e))?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;

        account_from_row(&row).map_err(|e| store_error("account", e))
    }

    async fn get_balance(&self, account_id: &AccountId) -> Result<Pennies> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1")
                .bind(account_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("get_balance", e))?;

        balance
            .map(Pennies::new)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn adjust_balance(&self, account_id: &AccountId, delta: i64) -> Result<Pennies> {
        let updated: Option<i64> = sqlx::query_scalar(ADJUST_BALANCE)
            .bind(account_id.as_str())
            .bind(delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("adjust_balance", e))?;

        if let Some(balance) = updated {
            return Ok(Pennies::new(balance));
        }

        // Nothing matched: either the account is missing or the guard failed.
        let available = self.get_balance(account_id).await?;
        Err(LedgerError::InsufficientFunds {
            account_id: account_id.clone(),
            available,
            requested: Pennies::new(delta.saturating_neg()),
        })
    }
}

/// Transaction ledger backed by the `transactions` table.
#[derive(Debug, Clone)]
pub struct PgTransactionLedger {
    pool: PgPool,
}

impl PgTransactionLedger {
    /// Create a ledger over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn transaction_from_row(row: &PgRow) -> std::result::Result<Transaction, sqlx::Error> {
    let direction: String = row.try_get("direction")?;
    let state: String = row.try_get("state")?;
    let abort_reason: Option<String> = row.try_get("abort_reason")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        amount: Pennies::new(row.try_get("amount")?),
        direction: direction.parse().map_err(decode_error)?,
        state: state.parse().map_err(decode_error)?,
        abort_reason: abort_reason
            .map(|r| r.parse::<AbortReason>())
            .transpose()
            .map_err(decode_error)?,
        note: row.try_get("note")?,
        callback_url: row.try_get("callback_url")?,
        created_at,
        settled_at: row.try_get("settled_at")?,
    })
}

#[async_trait]
impl TransactionLedger for PgTransactionLedger {
    #[instrument(skip(self, new), fields(account_id = %new.account_id, amount = %new.amount))]
    async fn create(&self, new: NewTransaction) -> Result<TransactionId> {
        if !new.amount.is_positive() {
            return Err(LedgerError::InvalidAmount {
                amount: new.amount.value(),
            });
        }

        let id = TransactionId::new();
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                transaction_id, account_id, amount, direction, state,
                note, callback_url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*id.as_uuid())
        .bind(new.account_id.as_str())
        .bind(new.amount.value())
        .bind(new.direction.as_str())
        .bind(TransactionState::Pending.as_str())
        .bind(&new.note)
        .bind(new.callback_url.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                Err(LedgerError::AccountNotFound(new.account_id))
            }
            Err(e) => Err(store_error("create_transaction", e)),
        }
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Transaction> {
        let query = format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(*transaction_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("get_transaction", e))?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;

        transaction_from_row(&row).map_err(|e| store_error("get_transaction", e))
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn mark_terminal(
        &self,
        transaction_id: TransactionId,
        outcome: Outcome,
    ) -> Result<Transaction> {
        let query = format!(
            r#"
            UPDATE transactions
            SET state = $2, abort_reason = $3, settled_at = NOW()
            WHERE transaction_id = $1 AND state = $4
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(*transaction_id.as_uuid())
            .bind(outcome.state().as_str())
            .bind(outcome.abort_reason().map(|r| r.as_str()))
            .bind(TransactionState::Pending.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("mark_terminal", e))?;

        match row {
            Some(row) => transaction_from_row(&row).map_err(|e| store_error("mark_terminal", e)),
            None => {
                // Unknown, or someone else already moved it out of Pending.
                let current = self.get(transaction_id).await?;
                Err(LedgerError::InvalidState {
                    transaction_id,
                    state: current.state,
                })
            }
        }
    }

    async fn list_for_account(&self, account_id: &AccountId) -> Result<Vec<Transaction>> {
        let query = format!(
            "SELECT {} FROM transactions WHERE account_id = $1 ORDER BY created_at, transaction_id",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(account_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error("list_for_account", e))?;

        rows.iter()
            .map(transaction_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| store_error("list_for_account", e))
    }
}

/// Settles a transaction against both tables in one database transaction.
#[derive(Debug, Clone)]
pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn apply_and_confirm(
        &self,
        transaction_id: TransactionId,
    ) -> Result<(Pennies, Transaction)> {
        // Dropping `db` before commit rolls everything back.
        let mut db = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin_settlement", e))?;

        let query = format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(*transaction_id.as_uuid())
            .fetch_optional(&mut *db)
            .await
            .map_err(|e| store_error("settle", e))?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        let tx = transaction_from_row(&row).map_err(|e| store_error("settle", e))?;

        if !tx.is_pending() {
            return Err(LedgerError::InvalidState {
                transaction_id,
                state: tx.state,
            });
        }

        let updated: Option<i64> = sqlx::query_scalar(ADJUST_BALANCE)
            .bind(tx.account_id.as_str())
            .bind(tx.balance_delta())
            .fetch_optional(&mut *db)
            .await
            .map_err(|e| store_error("settle", e))?;

        let balance = match updated {
            Some(balance) => Pennies::new(balance),
            None => {
                let available: Option<i64> =
                    sqlx::query_scalar("SELECT balance FROM accounts WHERE account_id = $1")
                        .bind(tx.account_id.as_str())
                        .fetch_optional(&mut *db)
                        .await
                        .map_err(|e| store_error("settle", e))?;

                return Err(match available {
                    Some(available) => LedgerError::InsufficientFunds {
                        account_id: tx.account_id.clone(),
                        available: Pennies::new(available),
                        requested: tx.amount,
                    },
                    None => LedgerError::AccountNotFound(tx.account_id.clone()),
                });
            }
        };

        let query = format!(
            r#"
            UPDATE transactions
            SET state = $2, abort_reason = NULL, settled_at = NOW()
            WHERE transaction_id = $1
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(*transaction_id.as_uuid())
            .bind(TransactionState::Confirmed.as_str())
            .fetch_one(&mut *db)
            .await
            .map_err(|e| store_error("settle", e))?;
        let confirmed = transaction_from_row(&row).map_err(|e| store_error("settle", e))?;

        db.commit()
            .await
            .map_err(|e| store_error("commit_settlement", e))?;

        Ok((balance, confirmed))
    }
}
