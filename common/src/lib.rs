//! Penny Common Types
//!
//! Shared types for the Penny balance ledger: identifiers, amounts in pennies,
//! the transaction state machine and the error type every crate returns.

pub mod error;
pub mod identifiers;
pub mod monetary;
pub mod transaction;

pub use error::*;
pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
