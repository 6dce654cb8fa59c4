//! Flow execution engine
//!
//! A flow is a declarative pipeline of document-processing steps backed by
//! external AI providers. The lifecycle has three phases:
//!
//! 1. **Define**: build a [`FlowDefinition`] (or deserialize one) out of
//!    steps referencing named providers and sub-flows.
//! 2. **Build**: resolve it against a [`ProviderRegistry`] and
//!    [`FlowRegistry`] with [`build_flow`], which validates everything up
//!    front and produces an [`ExecutableFlow`].
//! 3. **Execute**: run it with a [`FlowExecutor`], which drives providers
//!    through the resilience layer (retries, fallback chains, circuit
//!    breakers), optionally under consensus, and reports lifecycle events
//!    to registered [`ExecutionHooks`].

pub mod build;
pub mod consensus;
pub mod context;
pub mod definition;
pub mod executor;
pub mod hooks;
pub mod metrics;
pub mod provider;
pub mod resilience;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use build::{build_flow, BuildError, BuildResult, CompiledNode, CompiledStep, ExecutableFlow};
pub use consensus::{run_consensus, ConsensusError, ConsensusOutcome, ConsensusResult};
pub use context::{ExecutionContext, StepMetrics};
pub use definition::{
    ConsensusConfig, DefinitionError, FlowDefinition, FlowId, FlowOrRef, InputMapping,
    MappingSource, NodeConfig, NodeKind, OutputSource, OutputTransform, ProviderRef, RetryConfig,
    Step, StepId, TiePolicy, VotingStrategy, FORMAT_VERSION,
};
pub use executor::{
    ExecutionError, ExecutionErrorKind, ExecutionResult, FlowExecutor, FlowOutcome,
    MAX_FLOW_DEPTH,
};
pub use hooks::{
    DispatchMode, ExecutionHooks, FlowEvent, HookDispatcher, HookError, HookResult, TraceContext,
};
pub use metrics::{FlowMetrics, MetricsSummary, RunMetrics, MAX_RUN_METRICS};
pub use provider::{
    FlowRegistry, OcrProvider, ProviderError, ProviderInstance, ProviderRegistry,
    ProviderResponse, ProviderResult, VlmProvider,
};
pub use resilience::{
    BreakerConfig, CircuitBreakerRegistry, FallbackManager, ResilienceError, RetryPolicy,
};
