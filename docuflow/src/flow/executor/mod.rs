//! Flow execution
//!
//! The executor walks a compiled [`ExecutableFlow`] step by step, invoking
//! providers through the resilience layer and emitting lifecycle events
//! through the hook dispatcher. One executor serves any number of runs;
//! per-run state lives in the [`ExecutionContext`].

mod batch;
mod core;
#[cfg(test)]
mod tests;

use crate::flow::consensus::ConsensusError;
use crate::flow::context::ExecutionContext;
use crate::flow::definition::{ProviderRef, StepId};
use crate::flow::hooks::{HookDispatcher, TraceContext};
use crate::flow::metrics::{FlowMetrics, MetricsSummary, RunMetrics};
use crate::flow::resilience::{CircuitBreakerRegistry, ResilienceError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use ulid::Ulid;

/// Hard bound on nested flow depth (triggers, branches, item flows)
///
/// Registered flows may reference each other, so a cycle is representable;
/// this bound turns it into a deterministic failure instead of unbounded
/// recursion.
pub const MAX_FLOW_DEPTH: usize = 32;

/// What went wrong inside a step
#[derive(Debug, Error)]
pub enum ExecutionErrorKind {
    /// Every provider in the step's chain was exhausted or skipped
    #[error(transparent)]
    Providers(#[from] ResilienceError),
    /// Consensus voting could not resolve
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    /// A classifier produced a label with no mapped branch
    #[error("no branch mapped for label '{0}'")]
    UnmappedBranch(String),
    /// A classifier produced output that is not a usable label
    #[error("classifier output is not a string label")]
    InvalidLabel,
    /// A splitter produced output that is not an array
    #[error("splitter output is not an array")]
    InvalidSplit,
    /// Too few for-each items succeeded
    #[error("only {succeeded} of {items} items succeeded, {required} required")]
    BatchBelowThreshold {
        /// Items that succeeded
        succeeded: usize,
        /// Items processed
        items: usize,
        /// Configured floor
        required: usize,
    },
    /// A sub-flow exceeded its deadline
    #[error("sub-flow timed out after {0:?}")]
    Timeout(Duration),
    /// An input mapping referenced an artifact that was never written
    #[error("no artifact recorded for step '{0}'")]
    MissingArtifact(StepId),
    /// An input mapping could not be applied
    #[error("input mapping failed: {0}")]
    InputMapping(String),
    /// The flow input failed its validation requirement
    #[error("input validation failed: {0}")]
    InputValidation(String),
    /// A provider reference had no binding at run time
    #[error("no binding for provider '{0}'")]
    MissingBinding(ProviderRef),
    /// An output transform could not be applied
    #[error("output transform failed: {0}")]
    OutputTransform(String),
    /// Nested flows exceeded [`MAX_FLOW_DEPTH`]
    #[error("flow nesting exceeded depth {0}")]
    DepthExceeded(usize),
    /// A sub-flow failed
    #[error("{0}")]
    SubFlow(Box<ExecutionError>),
}

/// A step failure, carrying the step that raised it
#[derive(Debug)]
pub struct ExecutionError {
    /// Step that failed, when the failure is attributable to one
    pub step_id: Option<StepId>,
    /// The underlying failure
    pub kind: ExecutionErrorKind,
}

impl ExecutionError {
    pub(crate) fn at(step_id: &StepId, kind: impl Into<ExecutionErrorKind>) -> Self {
        Self {
            step_id: Some(step_id.clone()),
            kind: kind.into(),
        }
    }

    pub(crate) fn flow(kind: ExecutionErrorKind) -> Self {
        Self {
            step_id: None,
            kind,
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step_id) => write!(f, "step '{step_id}': {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Result type for execution operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// A completed flow run
#[derive(Debug)]
pub struct FlowOutcome {
    /// The flow's result value
    pub result: Value,
    /// Artifacts and step metrics accumulated by the run
    pub context: ExecutionContext,
    /// Correlation identifiers for the run
    pub trace: TraceContext,
}

impl FlowOutcome {
    /// The run's identifier
    pub fn run_id(&self) -> Ulid {
        self.trace.run_id
    }
}

/// Executes compiled flows
///
/// Shared state is deliberately small: the hook dispatcher, the circuit
/// breaker registry, and a bounded history of run metrics. Everything else
/// is per run.
pub struct FlowExecutor {
    pub(crate) hooks: HookDispatcher,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    metrics: Mutex<FlowMetrics>,
}

impl FlowExecutor {
    /// Create an executor with no hooks and default breaker thresholds
    pub fn new() -> Self {
        Self {
            hooks: HookDispatcher::new(),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            metrics: Mutex::new(FlowMetrics::new()),
        }
    }

    /// Set the hook dispatcher
    pub fn with_hooks(mut self, hooks: HookDispatcher) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share an externally owned circuit breaker registry
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Summary of recent run metrics
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.lock_metrics().summary()
    }

    /// Retained metrics for a specific run, when still in history
    pub fn run_metrics(&self, run_id: &Ulid) -> Option<RunMetrics> {
        self.lock_metrics().run(run_id).cloned()
    }

    pub(crate) fn lock_metrics(&self) -> std::sync::MutexGuard<'_, FlowMetrics> {
        // A poisoned lock only means another run panicked mid-record;
        // the history itself is still usable
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FlowExecutor {
    fn default() -> Self {
        Self::new()
    }
}
