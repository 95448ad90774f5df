//! In-process claims on transactions being settled.
//!
//! A claim makes "settle transaction X" mutually exclusive within one engine:
//! a second ConfirmDeposit or SettleWithdrawal for the same ID fails fast while
//! the first is still writing. The ledger's atomic `mark_terminal` remains the
//! durable guard across processes.
//!
//! A quarantined claim outlives its guard. It keeps a transaction whose balance
//! and state disagree away from every settlement path until an operator
//! releases it.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use penny_common::{Direction, TransactionId};

/// A claim on one transaction.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Transaction being settled.
    pub transaction_id: TransactionId,
    /// Which settlement path holds it.
    pub direction: Direction,
    /// When the claim was taken.
    pub claimed_at: Instant,
    /// Kept after its settlement finished.
    pub quarantined: bool,
}

/// Table of active claims.
#[derive(Debug, Clone, Default)]
pub struct SettlementClaims {
    claims: Arc<DashMap<TransactionId, Claim>>,
}

impl SettlementClaims {
    /// Create an empty claim table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a transaction, `None` if someone else holds it.
    pub fn try_claim(&self, transaction_id: TransactionId, direction: Direction) -> Option<ClaimGuard> {
        match self.claims.entry(transaction_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Claim {
                    transaction_id,
                    direction,
                    claimed_at: Instant::now(),
                    quarantined: false,
                });
                debug!(transaction_id = %transaction_id, "Claim taken");
                Some(ClaimGuard {
                    claims: self.claims.clone(),
                    transaction_id,
                    kept: false,
                })
            }
        }
    }

    /// Claims kept by quarantine, oldest first.
    pub fn quarantined(&self) -> Vec<Claim> {
        let mut kept: Vec<Claim> = self
            .claims
            .iter()
            .filter(|c| c.quarantined)
            .map(|c| c.clone())
            .collect();
        kept.sort_by_key(|c| c.claimed_at);
        kept
    }

    /// Drop a quarantined claim. Active claims are left alone.
    pub fn release(&self, transaction_id: &TransactionId) -> bool {
        let released = self
            .claims
            .remove_if(transaction_id, |_, claim| claim.quarantined)
            .is_some();
        if released {
            warn!(transaction_id = %transaction_id, "Quarantine released");
        }
        released
    }

    /// Number of active claims, quarantined ones included.
    pub fn active_count(&self) -> usize {
        self.claims.len()
    }
}

/// Releases its claim when dropped, including on early return or panic.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: Arc<DashMap<TransactionId, Claim>>,
    transaction_id: TransactionId,
    kept: bool,
}

impl ClaimGuard {
    /// Keep the claim after this guard is gone.
    pub fn quarantine(mut self) {
        if let Some(mut claim) = self.claims.get_mut(&self.transaction_id) {
            claim.quarantined = true;
        }
        self.kept = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        self.claims.remove(&self.transaction_id);
        debug!(transaction_id = %self.transaction_id, "Claim released");
    }
}
