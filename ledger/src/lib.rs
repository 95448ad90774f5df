//! Penny Ledger Storage
//!
//! The two passive, consistency-enforcing data holders behind the settlement
//! engine: the account store (balances) and the transaction ledger (journal of
//! every money-movement attempt). Each has an in-memory and a Postgres backend.
//! Postgres also applies a balance change and its state write in one database
//! transaction through [`SettlementStore`].

pub mod account;
pub mod journal;
pub mod memory;
pub mod postgres;
pub mod settle;

pub use account::{Account, AccountStore};
pub use journal::TransactionLedger;
pub use memory::{MemoryAccountStore, MemoryTransactionLedger};
pub use postgres::{PgAccountStore, PgSettlementStore, PgTransactionLedger};
pub use settle::SettlementStore;
