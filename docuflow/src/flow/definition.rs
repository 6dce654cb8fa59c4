//! Declarative flow definition model
//!
//! A flow is an ordered list of steps executed against a document input.
//! Definitions are pure data: they can be serialized, hashed, and diffed,
//! and carry no behavior of their own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// The single definition format version this engine understands
pub const FORMAT_VERSION: &str = "1.0.0";

/// Errors that can occur when creating definition-related types
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Step ID cannot be empty or whitespace only
    #[error("Step ID cannot be empty or whitespace only")]
    EmptyStepId,
    /// Flow ID cannot be empty or whitespace only
    #[error("Flow ID cannot be empty or whitespace only")]
    EmptyFlowId,
    /// Provider ref cannot be empty or whitespace only
    #[error("Provider ref cannot be empty or whitespace only")]
    EmptyProviderRef,
}

/// Result type for definition operations
pub type DefinitionResult<T> = Result<T, DefinitionError>;

macro_rules! string_id {
    ($name:ident, $error:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier
            ///
            /// # Panics
            /// Panics if the value is empty or whitespace only. For non-panicking
            /// creation, use `try_new` instead.
            pub fn new(value: impl Into<String>) -> Self {
                Self::try_new(value).expect(concat!(
                    stringify!($name),
                    " cannot be empty or whitespace only"
                ))
            }

            /// Create a new identifier, returning an error for invalid input
            pub fn try_new(value: impl Into<String>) -> DefinitionResult<Self> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DefinitionError::$error);
                }
                Ok(Self(value))
            }

            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(StepId, EmptyStepId, "Unique identifier for a step within a flow");
string_id!(FlowId, EmptyFlowId, "Name of a registered sub-flow");
string_id!(
    ProviderRef,
    EmptyProviderRef,
    "Reference to a provider binding in the provider registry"
);

/// Capability a provider-backed node requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Raw document in, structured document out
    Ocr,
    /// Document plus schema in, JSON out
    Vlm,
}

impl NodeKind {
    /// Get the string representation of the node kind
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Ocr => "ocr",
            NodeKind::Vlm => "vlm",
        }
    }
}

/// Retry and backoff settings for one node's fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries per fallback provider
    pub max_retries: u32,
    /// Distinct retry budget for the first provider in the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_max_retries: Option<u32>,
    /// Base backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            primary_max_retries: None,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Voting strategy for consensus execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    /// The most frequent result wins if it strictly exceeds half the successful runs
    Majority,
    /// All successful runs must agree
    Unanimous,
}

/// What to do when no group of runs meets the voting threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Pick uniformly among the leading groups
    Random,
    /// Fail the step
    Fail,
    /// Perform exactly one additional run and re-vote once
    Retry,
}

/// Consensus settings for a node: run it N times and vote on the result
///
/// Results are grouped by whole-value equality. Per-field voting is a
/// possible extension of this type (a comparison-granularity field), not
/// something the engine implements today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Number of runs to execute
    pub runs: u32,
    /// Voting strategy applied to successful runs
    pub strategy: VotingStrategy,
    /// Tie resolution policy
    pub on_tie: TiePolicy,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            runs: 3,
            strategy: VotingStrategy::Majority,
            on_tie: TiePolicy::Fail,
        }
    }
}

/// Configuration for one provider-backed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Capability this node requires of its providers
    pub kind: NodeKind,
    /// Fallback chain, primary provider first
    pub providers: Vec<ProviderRef>,
    /// Extraction schema handed to VLM-style providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Retry policy override for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Consensus settings; absent means a single invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusConfig>,
}

impl NodeConfig {
    /// Create an OCR-style node over a fallback chain
    pub fn ocr(providers: Vec<ProviderRef>) -> Self {
        Self {
            kind: NodeKind::Ocr,
            providers,
            schema: None,
            retry: None,
            consensus: None,
        }
    }

    /// Create a VLM-style node over a fallback chain
    pub fn vlm(providers: Vec<ProviderRef>, schema: Option<Value>) -> Self {
        Self {
            kind: NodeKind::Vlm,
            providers,
            schema,
            retry: None,
            consensus: None,
        }
    }

    /// Set the retry policy for this node
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Enable consensus execution for this node
    pub fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = Some(consensus);
        self
    }
}

/// A sub-flow given inline or by reference into the sub-flow registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowOrRef {
    /// Reference to a registered sub-flow by name
    Ref(FlowId),
    /// Sub-flow defined in place
    Inline(FlowDefinition),
}

/// How a trigger step computes the child flow's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InputMapping {
    /// Pass the parent step input through unchanged
    Passthrough,
    /// Take a single field out of the input envelope
    UnwrapEnvelope {
        /// Field to extract
        field: String,
    },
    /// Pull an artifact written by an earlier step
    FromArtifact {
        /// Step whose artifact is read
        step: StepId,
        /// Optional JSON pointer into the artifact
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Shallow-merge the input object with an earlier artifact
    MergeWithArtifact {
        /// Step whose artifact is merged over the input
        step: StepId,
    },
    /// Build a new object from named sources
    Construct {
        /// Field name to source mapping
        fields: BTreeMap<String, MappingSource>,
    },
}

/// One source feeding a constructed trigger input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum MappingSource {
    /// The parent step input
    Input,
    /// An artifact written by an earlier step
    Artifact {
        /// Step whose artifact is read
        step: StepId,
        /// Optional JSON pointer into the artifact
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

/// Which artifacts an output step reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSource {
    /// A single step's artifact
    Single(StepId),
    /// Several steps' artifacts, in the listed order
    Many(Vec<StepId>),
}

/// Transform applied to the gathered output artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutputTransform {
    /// The first source value
    First,
    /// The last source value
    Last,
    /// Shallow-merge object sources in order, later sources winning
    Merge,
    /// Merge, then keep only the named fields
    Pick {
        /// Fields to keep
        fields: Vec<String>,
    },
}

/// One unit of work in a flow
///
/// The enum is closed on purpose: the executor dispatches with an exhaustive
/// match, so a new step kind cannot be added without updating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// One provider invocation
    Standard {
        /// Step identifier, unique within the flow
        id: StepId,
        /// Provider node configuration
        node: NodeConfig,
    },
    /// A classification call selects exactly one branch by label
    Conditional {
        /// Step identifier, unique within the flow
        id: StepId,
        /// Classifier node; its output label selects the branch
        classifier: NodeConfig,
        /// Branch label to sub-flow mapping
        branches: BTreeMap<String, FlowOrRef>,
    },
    /// A splitter call partitions the input; the item flow runs once per item
    ForEach {
        /// Step identifier, unique within the flow
        id: StepId,
        /// Splitter node; must produce an array of items
        splitter: NodeConfig,
        /// Flow executed once per item
        item_flow: FlowOrRef,
        /// Worker pool size; defaults to the engine-wide bound
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<usize>,
        /// Minimum successful items for the step to succeed; defaults to 1
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_successes: Option<usize>,
    },
    /// Invoke a named sub-flow from the registry
    Trigger {
        /// Step identifier, unique within the flow
        id: StepId,
        /// Registered sub-flow to run
        flow_ref: FlowId,
        /// Provider binding remaps applied for the child run
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_overrides: Option<BTreeMap<ProviderRef, ProviderRef>>,
        /// How the child input is computed from the parent context
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_mapping: Option<InputMapping>,
        /// Merge child step metrics into the parent's metric list
        #[serde(default)]
        merge_metrics: bool,
        /// Deadline for the child run, in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Pull named artifacts out of the context to form the flow result
    Output {
        /// Step identifier, unique within the flow
        id: StepId,
        /// Optional display name for the result
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Artifacts to read
        source: OutputSource,
        /// Transform applied to the gathered artifacts
        transform: OutputTransform,
    },
}

impl Step {
    /// Get the step's identifier
    pub fn id(&self) -> &StepId {
        match self {
            Step::Standard { id, .. }
            | Step::Conditional { id, .. }
            | Step::ForEach { id, .. }
            | Step::Trigger { id, .. }
            | Step::Output { id, .. } => id,
        }
    }

    /// Get the step kind name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            Step::Standard { .. } => "standard",
            Step::Conditional { .. } => "conditional",
            Step::ForEach { .. } => "for_each",
            Step::Trigger { .. } => "trigger",
            Step::Output { .. } => "output",
        }
    }
}

/// A declarative pipeline of steps executed against a document input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Definition format version; must equal [`FORMAT_VERSION`]
    pub format_version: String,
    /// Steps in execution order
    pub steps: Vec<Step>,
    /// Optional input requirement checked before the first step runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_validation: Option<Value>,
}

impl FlowDefinition {
    /// Create a new definition at the current format version
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            steps,
            input_validation: None,
        }
    }

    /// Require a non-null input matching the given descriptor
    pub fn with_input_validation(mut self, validation: Value) -> Self {
        self.input_validation = Some(validation);
        self
    }
}
