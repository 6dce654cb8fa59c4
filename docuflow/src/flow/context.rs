//! Per-run execution context
//!
//! The context is the mutable state a flow run threads through its steps:
//! artifacts written by completed steps, per-step usage metrics, and the
//! running token and cost totals.

use crate::flow::definition::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Usage and timing recorded for one completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Step that produced these metrics
    pub step_id: StepId,
    /// Provider binding that served the call, `vendor:model`
    pub provider_key: Option<String>,
    /// Wall-clock duration of the step
    pub duration: Duration,
    /// Input tokens consumed across all attempts and consensus runs
    pub tokens_in: u64,
    /// Output tokens produced across all attempts and consensus runs
    pub tokens_out: u64,
    /// Cost in US dollars across all attempts and consensus runs
    pub cost_usd: f64,
    /// Agreement ratio when the step ran under consensus
    pub consensus_agreement: Option<f64>,
}

/// Mutable state for one flow run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    artifacts: HashMap<StepId, Value>,
    metrics: Vec<StepMetrics>,
    last_artifact: Option<StepId>,
}

impl ExecutionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's output artifact
    pub fn set_artifact(&mut self, step_id: StepId, value: Value) {
        self.last_artifact = Some(step_id.clone());
        self.artifacts.insert(step_id, value);
    }

    /// Look up an artifact by the step that wrote it
    pub fn artifact(&self, step_id: &StepId) -> Option<&Value> {
        self.artifacts.get(step_id)
    }

    /// The artifact written by the most recently completed step
    pub fn last_artifact(&self) -> Option<&Value> {
        self.last_artifact
            .as_ref()
            .and_then(|step_id| self.artifacts.get(step_id))
    }

    /// All recorded artifacts
    pub fn artifacts(&self) -> &HashMap<StepId, Value> {
        &self.artifacts
    }

    /// Append metrics for a completed step
    pub fn record_metrics(&mut self, metrics: StepMetrics) {
        self.metrics.push(metrics);
    }

    /// Step metrics in completion order
    pub fn metrics(&self) -> &[StepMetrics] {
        &self.metrics
    }

    /// Fold a child run's metrics into this context, preserving order
    pub fn merge_metrics_from(&mut self, child: &ExecutionContext) {
        self.metrics.extend_from_slice(&child.metrics);
    }

    /// Total input tokens across recorded steps
    pub fn total_tokens_in(&self) -> u64 {
        self.metrics.iter().map(|m| m.tokens_in).sum()
    }

    /// Total output tokens across recorded steps
    pub fn total_tokens_out(&self) -> u64 {
        self.metrics.iter().map(|m| m.tokens_out).sum()
    }

    /// Total cost in US dollars across recorded steps
    pub fn total_cost_usd(&self) -> f64 {
        self.metrics.iter().map(|m| m.cost_usd).sum()
    }
}
