//! Observability hook contract and dispatch
//!
//! Implementors of [`ExecutionHooks`] receive lifecycle events for every
//! flow run. All methods have no-op defaults, so a hook implements only
//! the events it cares about. Hook failures never affect execution: a
//! returned error or a panic inside a hook is logged and swallowed by
//! the dispatcher.

use crate::flow::context::StepMetrics;
use crate::flow::definition::StepId;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ulid::Ulid;

/// Error a hook can report to the dispatcher
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Create a hook error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for hook methods
pub type HookResult = Result<(), HookError>;

/// Correlation identifiers carried through a run and its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Unique identifier for this run
    pub run_id: Ulid,
    /// Run that spawned this one, when executed as a child
    pub parent_run_id: Option<Ulid>,
}

impl TraceContext {
    /// Create a root trace with a fresh run ID
    pub fn new() -> Self {
        Self {
            run_id: Ulid::new(),
            parent_run_id: None,
        }
    }

    /// Derive a child trace that records this run as its parent
    pub fn child(&self) -> Self {
        Self {
            run_id: Ulid::new(),
            parent_run_id: Some(self.run_id),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A lifecycle event emitted during flow execution
///
/// Events own their payloads so they can outlive the execution state that
/// produced them when dispatched fire-and-forget.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A flow run began
    FlowStarted {
        /// The run's input value
        input: Value,
    },
    /// A flow run produced a result
    FlowCompleted {
        /// The run's result value
        result: Value,
    },
    /// A flow run failed
    FlowFailed {
        /// Rendered execution error
        error: String,
    },
    /// A step began executing
    StepStarted {
        /// Step identifier
        step_id: StepId,
        /// Step kind name
        kind: &'static str,
    },
    /// A step completed successfully
    StepCompleted {
        /// Step identifier
        step_id: StepId,
        /// Usage recorded for the step
        metrics: StepMetrics,
    },
    /// A step failed
    StepFailed {
        /// Step identifier
        step_id: StepId,
        /// Rendered step error
        error: String,
    },
    /// A provider call is about to be made
    ProviderRequested {
        /// Step identifier
        step_id: StepId,
        /// Provider binding, `vendor:model`
        provider_key: String,
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// A provider call returned a response
    ProviderResponded {
        /// Step identifier
        step_id: StepId,
        /// Provider binding, `vendor:model`
        provider_key: String,
        /// Attempt number, starting at 1
        attempt: u32,
        /// Whether the call succeeded
        success: bool,
        /// Wall time spent in the call
        duration: Duration,
    },
    /// A provider call failed and will be retried after a delay
    RetryScheduled {
        /// Step identifier
        step_id: StepId,
        /// Provider binding being retried
        provider_key: String,
        /// Attempt number that just failed, starting at 1
        attempt: u32,
        /// Wait before the next attempt
        delay: Duration,
        /// Rendered provider error
        error: String,
    },
    /// A provider was exhausted and the chain moved to the next binding
    FallbackTriggered {
        /// Step identifier
        step_id: StepId,
        /// Provider binding that was abandoned
        from_key: String,
        /// Provider binding taking over
        to_key: String,
    },
    /// An open circuit breaker skipped a provider without an attempt
    CircuitRejected {
        /// Step identifier
        step_id: StepId,
        /// Provider binding, `vendor:model`
        provider_key: String,
    },
    /// A provider's circuit breaker opened
    CircuitOpened {
        /// Provider binding, `vendor:model`
        provider_key: String,
    },
    /// A provider's circuit breaker closed after a successful trial
    CircuitClosed {
        /// Provider binding, `vendor:model`
        provider_key: String,
    },
    /// Consensus execution began for a step
    ConsensusStarted {
        /// Step identifier
        step_id: StepId,
        /// Number of runs requested
        runs: u32,
    },
    /// One consensus run finished
    ConsensusRunCompleted {
        /// Step identifier
        step_id: StepId,
        /// Run position, starting at 0
        run: u32,
        /// Whether the run produced a response
        success: bool,
    },
    /// Consensus execution resolved to a value
    ConsensusResolved {
        /// Step identifier
        step_id: StepId,
        /// Agreeing runs over total runs
        agreement: f64,
        /// Runs that completed successfully
        successes: u32,
        /// Total runs executed
        runs: u32,
    },
    /// A for-each step split its input and began processing items
    BatchStarted {
        /// Step identifier
        step_id: StepId,
        /// Number of items to process
        items: usize,
    },
    /// One for-each item finished
    BatchItemCompleted {
        /// Step identifier
        step_id: StepId,
        /// Item position in the split
        index: usize,
        /// Whether the item flow succeeded
        success: bool,
        /// Wall time spent on the item
        duration: Duration,
    },
    /// A for-each step finished all items
    BatchCompleted {
        /// Step identifier
        step_id: StepId,
        /// Items that succeeded
        succeeded: usize,
        /// Items that failed
        failed: usize,
    },
}

impl FlowEvent {
    /// Event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow_started",
            FlowEvent::FlowCompleted { .. } => "flow_completed",
            FlowEvent::FlowFailed { .. } => "flow_failed",
            FlowEvent::StepStarted { .. } => "step_started",
            FlowEvent::StepCompleted { .. } => "step_completed",
            FlowEvent::StepFailed { .. } => "step_failed",
            FlowEvent::ProviderRequested { .. } => "provider_requested",
            FlowEvent::ProviderResponded { .. } => "provider_responded",
            FlowEvent::RetryScheduled { .. } => "retry_scheduled",
            FlowEvent::FallbackTriggered { .. } => "fallback_triggered",
            FlowEvent::CircuitRejected { .. } => "circuit_rejected",
            FlowEvent::CircuitOpened { .. } => "circuit_opened",
            FlowEvent::CircuitClosed { .. } => "circuit_closed",
            FlowEvent::ConsensusStarted { .. } => "consensus_started",
            FlowEvent::ConsensusRunCompleted { .. } => "consensus_run_completed",
            FlowEvent::ConsensusResolved { .. } => "consensus_resolved",
            FlowEvent::BatchStarted { .. } => "batch_started",
            FlowEvent::BatchItemCompleted { .. } => "batch_item_completed",
            FlowEvent::BatchCompleted { .. } => "batch_completed",
        }
    }

    /// Whether the event marks a run boundary and is exempt from sampling
    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            FlowEvent::FlowStarted { .. }
                | FlowEvent::FlowCompleted { .. }
                | FlowEvent::FlowFailed { .. }
        )
    }
}

/// Observer of flow execution events
///
/// Every method has a no-op default. Returning an error from a method does
/// not affect the run: the dispatcher logs it and calls
/// [`ExecutionHooks::on_hook_error`] on the same hook.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// A flow run began
    async fn on_flow_started(&self, _trace: &TraceContext, _input: &Value) -> HookResult {
        Ok(())
    }

    /// A flow run produced a result
    async fn on_flow_completed(&self, _trace: &TraceContext, _result: &Value) -> HookResult {
        Ok(())
    }

    /// A flow run failed
    async fn on_flow_failed(&self, _trace: &TraceContext, _error: &str) -> HookResult {
        Ok(())
    }

    /// A step began executing
    async fn on_step_started(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _kind: &str,
    ) -> HookResult {
        Ok(())
    }

    /// A step completed successfully
    async fn on_step_completed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _metrics: &StepMetrics,
    ) -> HookResult {
        Ok(())
    }

    /// A step failed
    async fn on_step_failed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _error: &str,
    ) -> HookResult {
        Ok(())
    }

    /// A provider call is about to be made
    async fn on_provider_requested(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _provider_key: &str,
        _attempt: u32,
    ) -> HookResult {
        Ok(())
    }

    /// A provider call returned a response
    async fn on_provider_responded(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _provider_key: &str,
        _attempt: u32,
        _success: bool,
        _duration: Duration,
    ) -> HookResult {
        Ok(())
    }

    /// A provider call failed and will be retried after a delay
    async fn on_retry_scheduled(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _provider_key: &str,
        _attempt: u32,
        _delay: Duration,
        _error: &str,
    ) -> HookResult {
        Ok(())
    }

    /// A provider was exhausted and the chain moved to the next binding
    async fn on_fallback(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _from_key: &str,
        _to_key: &str,
    ) -> HookResult {
        Ok(())
    }

    /// An open circuit breaker skipped a provider without an attempt
    async fn on_circuit_rejected(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _provider_key: &str,
    ) -> HookResult {
        Ok(())
    }

    /// A provider's circuit breaker opened
    async fn on_circuit_opened(&self, _trace: &TraceContext, _provider_key: &str) -> HookResult {
        Ok(())
    }

    /// A provider's circuit breaker closed after a successful trial
    async fn on_circuit_closed(&self, _trace: &TraceContext, _provider_key: &str) -> HookResult {
        Ok(())
    }

    /// Consensus execution began for a step
    async fn on_consensus_started(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _runs: u32,
    ) -> HookResult {
        Ok(())
    }

    /// One consensus run finished
    async fn on_consensus_run_completed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _run: u32,
        _success: bool,
    ) -> HookResult {
        Ok(())
    }

    /// Consensus execution resolved to a value
    async fn on_consensus_resolved(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _agreement: f64,
        _successes: u32,
        _runs: u32,
    ) -> HookResult {
        Ok(())
    }

    /// A for-each step split its input and began processing items
    async fn on_batch_started(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _items: usize,
    ) -> HookResult {
        Ok(())
    }

    /// One for-each item finished
    async fn on_batch_item_completed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _index: usize,
        _success: bool,
        _duration: Duration,
    ) -> HookResult {
        Ok(())
    }

    /// A for-each step finished all items
    async fn on_batch_completed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        _succeeded: usize,
        _failed: usize,
    ) -> HookResult {
        Ok(())
    }

    /// Another method on this hook returned an error or panicked
    ///
    /// Errors returned from this method are dropped.
    async fn on_hook_error(&self, _trace: &TraceContext, _error: &HookError) -> HookResult {
        Ok(())
    }
}

/// How dispatched events relate to execution timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Await hook completion before execution continues
    #[default]
    Blocking,
    /// Spawn hook delivery and continue immediately
    FireAndForget,
}

/// Fans execution events out to registered hooks
///
/// The dispatcher isolates the engine from its observers: hook errors and
/// panics are logged at `warn` and reported back through
/// [`ExecutionHooks::on_hook_error`], never surfaced to the run.
#[derive(Clone, Default)]
pub struct HookDispatcher {
    hooks: Vec<Arc<dyn ExecutionHooks>>,
    mode: DispatchMode,
    sampling_rate: Option<f64>,
}

impl HookDispatcher {
    /// Create a dispatcher with no hooks, blocking mode, and no sampling
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatch mode
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sample non-lifecycle events at the given rate in `[0.0, 1.0]`
    ///
    /// Run boundary events (flow started, completed, failed) are always
    /// delivered regardless of the rate.
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Register a hook
    pub fn add_hook(&mut self, hook: Arc<dyn ExecutionHooks>) {
        self.hooks.push(hook);
    }

    /// Whether any hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Deliver an event to all registered hooks
    pub async fn dispatch(&self, trace: &TraceContext, event: FlowEvent) {
        if self.hooks.is_empty() {
            return;
        }
        if let Some(rate) = self.sampling_rate {
            if !event.is_lifecycle() && rand::random::<f64>() >= rate {
                return;
            }
        }

        match self.mode {
            DispatchMode::Blocking => {
                for hook in &self.hooks {
                    deliver(hook.as_ref(), trace, &event).await;
                }
            }
            DispatchMode::FireAndForget => {
                let hooks = self.hooks.clone();
                let trace = trace.clone();
                tokio::spawn(async move {
                    for hook in &hooks {
                        deliver(hook.as_ref(), &trace, &event).await;
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.hooks.len())
            .field("mode", &self.mode)
            .field("sampling_rate", &self.sampling_rate)
            .finish()
    }
}

/// Deliver one event to one hook, containing any error or panic
async fn deliver(hook: &dyn ExecutionHooks, trace: &TraceContext, event: &FlowEvent) {
    let call = route(hook, trace, event);
    let outcome = AssertUnwindSafe(call).catch_unwind().await;

    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "hook panicked".to_string());
            HookError::new(message)
        }
    };

    tracing::warn!(
        run_id = %trace.run_id,
        event = event.name(),
        error = %error,
        "hook failed"
    );
    // Report back to the hook itself; a failure here is dropped
    let report = hook.on_hook_error(trace, &error);
    let _ = AssertUnwindSafe(report).catch_unwind().await;
}

/// Route an owned event to the matching trait method
async fn route(hook: &dyn ExecutionHooks, trace: &TraceContext, event: &FlowEvent) -> HookResult {
    match event {
        FlowEvent::FlowStarted { input } => hook.on_flow_started(trace, input).await,
        FlowEvent::FlowCompleted { result } => hook.on_flow_completed(trace, result).await,
        FlowEvent::FlowFailed { error } => hook.on_flow_failed(trace, error).await,
        FlowEvent::StepStarted { step_id, kind } => {
            hook.on_step_started(trace, step_id, kind).await
        }
        FlowEvent::StepCompleted { step_id, metrics } => {
            hook.on_step_completed(trace, step_id, metrics).await
        }
        FlowEvent::StepFailed { step_id, error } => {
            hook.on_step_failed(trace, step_id, error).await
        }
        FlowEvent::ProviderRequested {
            step_id,
            provider_key,
            attempt,
        } => {
            hook.on_provider_requested(trace, step_id, provider_key, *attempt)
                .await
        }
        FlowEvent::ProviderResponded {
            step_id,
            provider_key,
            attempt,
            success,
            duration,
        } => {
            hook.on_provider_responded(trace, step_id, provider_key, *attempt, *success, *duration)
                .await
        }
        FlowEvent::RetryScheduled {
            step_id,
            provider_key,
            attempt,
            delay,
            error,
        } => {
            hook.on_retry_scheduled(trace, step_id, provider_key, *attempt, *delay, error)
                .await
        }
        FlowEvent::FallbackTriggered {
            step_id,
            from_key,
            to_key,
        } => hook.on_fallback(trace, step_id, from_key, to_key).await,
        FlowEvent::CircuitRejected {
            step_id,
            provider_key,
        } => {
            hook.on_circuit_rejected(trace, step_id, provider_key)
                .await
        }
        FlowEvent::CircuitOpened { provider_key } => {
            hook.on_circuit_opened(trace, provider_key).await
        }
        FlowEvent::CircuitClosed { provider_key } => {
            hook.on_circuit_closed(trace, provider_key).await
        }
        FlowEvent::ConsensusStarted { step_id, runs } => {
            hook.on_consensus_started(trace, step_id, *runs).await
        }
        FlowEvent::ConsensusRunCompleted {
            step_id,
            run,
            success,
        } => {
            hook.on_consensus_run_completed(trace, step_id, *run, *success)
                .await
        }
        FlowEvent::ConsensusResolved {
            step_id,
            agreement,
            successes,
            runs,
        } => {
            hook.on_consensus_resolved(trace, step_id, *agreement, *successes, *runs)
                .await
        }
        FlowEvent::BatchStarted { step_id, items } => {
            hook.on_batch_started(trace, step_id, *items).await
        }
        FlowEvent::BatchItemCompleted {
            step_id,
            index,
            success,
            duration,
        } => {
            hook.on_batch_item_completed(trace, step_id, *index, *success, *duration)
                .await
        }
        FlowEvent::BatchCompleted {
            step_id,
            succeeded,
            failed,
        } => {
            hook.on_batch_completed(trace, step_id, *succeeded, *failed)
                .await
        }
    }
}
