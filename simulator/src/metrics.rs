//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

/// Client-side view of the requests a simulation issued.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total requests issued.
    pub total_requests: u64,
    /// Requests the engine accepted.
    pub accepted_requests: u64,
    /// Requests the engine rejected.
    pub rejected_requests: u64,
    /// Rejections by error code.
    rejections: BTreeMap<&'static str, u64>,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            accepted_requests: 0,
            rejected_requests: 0,
            rejections: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record an accepted request.
    pub fn record_accepted(&mut self, latency_us: u64) {
        self.total_requests += 1;
        self.accepted_requests += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record a rejected request.
    pub fn record_rejected(&mut self, code: &'static str) {
        self.total_requests += 1;
        self.rejected_requests += 1;
        *self.rejections.entry(code).or_insert(0) += 1;
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get percentile latency.
    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get acceptance rate.
    pub fn acceptance_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }

        self.accepted_requests as f64 / self.total_requests as f64
    }

    /// Serializable summary.
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            total: self.total_requests,
            accepted: self.accepted_requests,
            rejected: self.rejected_requests,
            rejections: self
                .rejections
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            acceptance_rate: self.acceptance_rate(),
            average_latency_us: self.average_latency_us(),
            p50_latency_us: self.percentile_latency(50),
            p99_latency_us: self.percentile_latency(99),
        }
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Request totals as printed in the report.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub total: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rejections: BTreeMap<String, u64>,
    pub acceptance_rate: f64,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
}
