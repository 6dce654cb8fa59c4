//! Engine-level run metrics
//!
//! Aggregated usage across recent runs, kept separate from the per-run
//! [`StepMetrics`](crate::flow::context::StepMetrics) list the context
//! carries. History is bounded; the oldest entries are evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use ulid::Ulid;

/// Maximum run entries retained in history
pub const MAX_RUN_METRICS: usize = 100;

/// Summary of one completed flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Run identifier
    pub run_id: Ulid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run
    pub duration: Duration,
    /// Steps that recorded metrics
    pub steps: usize,
    /// Total input tokens
    pub tokens_in: u64,
    /// Total output tokens
    pub tokens_out: u64,
    /// Total cost in US dollars
    pub cost_usd: f64,
    /// Whether the run produced a result
    pub success: bool,
}

/// Aggregate statistics over the retained history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Runs currently in history
    pub runs: usize,
    /// Successful runs in history
    pub successful_runs: usize,
    /// Fraction of runs that succeeded
    pub success_rate: f64,
    /// Mean run duration
    pub average_duration: Duration,
    /// Total cost across retained runs
    pub total_cost_usd: f64,
}

/// Bounded history of recent run metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetrics {
    history: VecDeque<RunMetrics>,
}

impl FlowMetrics {
    /// Create empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed run, evicting the oldest entry past the bound
    pub fn record_run(&mut self, metrics: RunMetrics) {
        if self.history.len() >= MAX_RUN_METRICS {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    /// Retained run entries, oldest first
    pub fn history(&self) -> impl Iterator<Item = &RunMetrics> {
        self.history.iter()
    }

    /// Metrics for a specific run, when still retained
    pub fn run(&self, run_id: &Ulid) -> Option<&RunMetrics> {
        self.history.iter().find(|entry| entry.run_id == *run_id)
    }

    /// Summarize the retained history
    pub fn summary(&self) -> MetricsSummary {
        let runs = self.history.len();
        let successful_runs = self.history.iter().filter(|entry| entry.success).count();
        let total_duration: Duration = self.history.iter().map(|entry| entry.duration).sum();
        let average_duration = if runs > 0 {
            total_duration / runs as u32
        } else {
            Duration::ZERO
        };
        let success_rate = if runs > 0 {
            successful_runs as f64 / runs as f64
        } else {
            0.0
        };
        MetricsSummary {
            runs,
            successful_runs,
            success_rate,
            average_duration,
            total_cost_usd: self.history.iter().map(|entry| entry.cost_usd).sum(),
        }
    }

    /// Drop all retained history
    pub fn clear(&mut self) {
        self.history.clear();
    }
}
