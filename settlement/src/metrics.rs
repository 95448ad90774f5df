//! Metrics collection for settlement monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Settlement engine metrics.
pub struct EngineMetrics {
    /// Deposit requests accepted.
    pub deposits_requested: AtomicU64,
    /// Deposits credited.
    pub deposits_confirmed: AtomicU64,
    /// Withdrawal requests accepted.
    pub withdrawals_requested: AtomicU64,
    /// Withdrawals debited.
    pub withdrawals_confirmed: AtomicU64,
    /// Withdrawals aborted.
    pub withdrawals_aborted: AtomicU64,
    /// Settlements dispatched but not finished.
    pub settlements_active: AtomicU64,
    /// Settlements that hit the timeout.
    pub settlement_timeouts: AtomicU64,
    /// Balance writes reversed because the state write failed.
    pub compensations: AtomicU64,
    /// Transactions quarantined because balance and state disagree.
    pub quarantines: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            deposits_requested: AtomicU64::new(0),
            deposits_confirmed: AtomicU64::new(0),
            withdrawals_requested: AtomicU64::new(0),
            withdrawals_confirmed: AtomicU64::new(0),
            withdrawals_aborted: AtomicU64::new(0),
            settlements_active: AtomicU64::new(0),
            settlement_timeouts: AtomicU64::new(0),
            compensations: AtomicU64::new(0),
            quarantines: AtomicU64::new(0),
        }
    }

    /// Record an accepted deposit request.
    pub fn deposit_requested(&self) {
        self.deposits_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a credited deposit.
    pub fn deposit_confirmed(&self) {
        self.deposits_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted withdrawal request.
    pub fn withdrawal_requested(&self) {
        self.withdrawals_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a debited withdrawal.
    pub fn withdrawal_confirmed(&self) {
        self.withdrawals_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an aborted withdrawal.
    pub fn withdrawal_aborted(&self) {
        self.withdrawals_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settlement dispatched to the background.
    pub fn settlement_started(&self) {
        self.settlements_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settlement task finishing, whatever the outcome.
    pub fn settlement_finished(&self) {
        self.settlements_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a settlement timeout.
    pub fn settlement_timeout(&self) {
        self.settlement_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reversed balance write.
    pub fn compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a quarantined transaction.
    pub fn quarantine(&self) {
        self.quarantines.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deposits_requested: self.deposits_requested.load(Ordering::Relaxed),
            deposits_confirmed: self.deposits_confirmed.load(Ordering::Relaxed),
            withdrawals_requested: self.withdrawals_requested.load(Ordering::Relaxed),
            withdrawals_confirmed: self.withdrawals_confirmed.load(Ordering::Relaxed),
            withdrawals_aborted: self.withdrawals_aborted.load(Ordering::Relaxed),
            settlements_active: self.settlements_active.load(Ordering::Relaxed),
            settlement_timeouts: self.settlement_timeouts.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            quarantines: self.quarantines.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP penny_deposits_requested Total deposit requests accepted
# TYPE penny_deposits_requested counter
penny_deposits_requested {}

# HELP penny_deposits_confirmed Total deposits credited
# TYPE penny_deposits_confirmed counter
penny_deposits_confirmed {}

# HELP penny_withdrawals_requested Total withdrawal requests accepted
# TYPE penny_withdrawals_requested counter
penny_withdrawals_requested {}

# HELP penny_withdrawals_confirmed Total withdrawals debited
# TYPE penny_withdrawals_confirmed counter
penny_withdrawals_confirmed {}

# HELP penny_withdrawals_aborted Total withdrawals aborted
# TYPE penny_withdrawals_aborted counter
penny_withdrawals_aborted {}

# HELP penny_settlements_active Current in-flight settlements
# TYPE penny_settlements_active gauge
penny_settlements_active {}

# HELP penny_settlement_timeouts Total settlement timeouts
# TYPE penny_settlement_timeouts counter
penny_settlement_timeouts {}

# HELP penny_compensations Total reversed balance writes
# TYPE penny_compensations counter
penny_compensations {}

# HELP penny_quarantines Total transactions quarantined for manual correction
# TYPE penny_quarantines counter
penny_quarantines {}
"#,
            snapshot.deposits_requested,
            snapshot.deposits_confirmed,
            snapshot.withdrawals_requested,
            snapshot.withdrawals_confirmed,
            snapshot.withdrawals_aborted,
            snapshot.settlements_active,
            snapshot.settlement_timeouts,
            snapshot.compensations,
            snapshot.quarantines,
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub deposits_requested: u64,
    pub deposits_confirmed: u64,
    pub withdrawals_requested: u64,
    pub withdrawals_confirmed: u64,
    pub withdrawals_aborted: u64,
    pub settlements_active: u64,
    pub settlement_timeouts: u64,
    pub compensations: u64,
    pub quarantines: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<EngineMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = EngineMetrics::new();

        metrics.withdrawal_requested();
        metrics.withdrawal_requested();
        metrics.settlement_started();
        metrics.settlement_started();
        metrics.withdrawal_confirmed();
        metrics.settlement_finished();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.withdrawals_requested, 2);
        assert_eq!(snapshot.withdrawals_confirmed, 1);
        assert_eq!(snapshot.settlements_active, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = EngineMetrics::new();
        metrics.deposit_requested();

        let output = metrics.to_prometheus();
        assert!(output.contains("penny_deposits_requested 1"));
        assert!(output.contains("penny_withdrawals_aborted 0"));
        assert!(output.contains("penny_quarantines 0"));
    }
}
