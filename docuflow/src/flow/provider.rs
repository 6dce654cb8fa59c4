//! Provider abstraction and registries
//!
//! Providers are the external AI services a flow invokes. The engine never
//! talks to a vendor directly: it resolves [`ProviderRef`]s against a
//! [`ProviderRegistry`] at build time and calls the resulting
//! [`ProviderInstance`]s at run time.

use crate::flow::definition::{FlowDefinition, FlowId, NodeKind, ProviderRef};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Successful provider invocation: the value plus usage accounting
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Provider output as JSON
    pub value: Value,
    /// Input tokens consumed
    pub tokens_in: u64,
    /// Output tokens produced
    pub tokens_out: u64,
    /// Cost of the call in US dollars
    pub cost_usd: f64,
}

impl ProviderResponse {
    /// Create a response carrying only a value, with zeroed usage
    pub fn from_value(value: Value) -> Self {
        Self {
            value,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
        }
    }
}

/// Failed provider invocation
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable failure description
    pub message: String,
    /// HTTP-style status code, when the vendor reported one
    pub status: Option<u16>,
    /// Vendor-requested wait before retrying
    pub retry_after: Option<Duration>,
}

/// Status codes that indicate a transient failure worth retrying
const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Message fragments that indicate a transient failure when no status is set
const RETRYABLE_PATTERNS: [&str; 5] = [
    "rate limit",
    "timeout",
    "timed out",
    "overloaded",
    "connection",
];

impl ProviderError {
    /// Create an error from a message alone
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Create an error carrying a vendor status code
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// Attach a vendor-requested retry delay
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether retrying this call could plausibly succeed
    ///
    /// A status code, when present, is authoritative. Without one the
    /// message is scanned for known transient-failure wording.
    pub fn is_retryable(&self) -> bool {
        if let Some(status) = self.status {
            return RETRYABLE_STATUS.contains(&status);
        }
        let message = self.message.to_lowercase();
        RETRYABLE_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A provider that turns a raw document into structured document JSON
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Stable identity of this binding, `vendor:model`
    fn key(&self) -> &str;

    /// Process a document input into structured output
    async fn process(&self, input: Value) -> ProviderResult<ProviderResponse>;
}

/// A provider that extracts schema-shaped JSON from a document
#[async_trait]
pub trait VlmProvider: Send + Sync {
    /// Stable identity of this binding, `vendor:model`
    fn key(&self) -> &str;

    /// Extract values matching the schema from the input
    async fn extract(&self, input: Value, schema: Option<&Value>)
        -> ProviderResult<ProviderResponse>;
}

/// A resolved provider binding of either capability
#[derive(Clone)]
pub enum ProviderInstance {
    /// OCR-capable binding
    Ocr(Arc<dyn OcrProvider>),
    /// VLM-capable binding
    Vlm(Arc<dyn VlmProvider>),
}

impl ProviderInstance {
    /// The capability this instance satisfies
    pub fn kind(&self) -> NodeKind {
        match self {
            ProviderInstance::Ocr(_) => NodeKind::Ocr,
            ProviderInstance::Vlm(_) => NodeKind::Vlm,
        }
    }

    /// Stable identity of the underlying binding, `vendor:model`
    pub fn key(&self) -> &str {
        match self {
            ProviderInstance::Ocr(provider) => provider.key(),
            ProviderInstance::Vlm(provider) => provider.key(),
        }
    }

    /// Invoke the provider with the given input and optional schema
    ///
    /// OCR instances ignore the schema.
    pub async fn invoke(
        &self,
        input: Value,
        schema: Option<&Value>,
    ) -> ProviderResult<ProviderResponse> {
        match self {
            ProviderInstance::Ocr(provider) => provider.process(input).await,
            ProviderInstance::Vlm(provider) => provider.extract(input, schema).await,
        }
    }
}

impl std::fmt::Debug for ProviderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInstance")
            .field("kind", &self.kind().as_str())
            .field("key", &self.key())
            .finish()
    }
}

/// Named provider bindings available to flow builds
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    bindings: HashMap<ProviderRef, ProviderInstance>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an OCR provider under a reference name
    pub fn register_ocr(&mut self, name: impl Into<ProviderRef>, provider: Arc<dyn OcrProvider>) {
        self.bindings
            .insert(name.into(), ProviderInstance::Ocr(provider));
    }

    /// Register a VLM provider under a reference name
    pub fn register_vlm(&mut self, name: impl Into<ProviderRef>, provider: Arc<dyn VlmProvider>) {
        self.bindings
            .insert(name.into(), ProviderInstance::Vlm(provider));
    }

    /// Look up a binding by reference
    pub fn get(&self, name: &ProviderRef) -> Option<&ProviderInstance> {
        self.bindings.get(name)
    }

    /// Whether a binding exists for the reference
    pub fn contains(&self, name: &ProviderRef) -> bool {
        self.bindings.contains_key(name)
    }

    /// Number of registered bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the registry has no bindings
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Named sub-flow definitions referenced by trigger steps and branch refs
#[derive(Default, Clone)]
pub struct FlowRegistry {
    flows: HashMap<FlowId, Arc<FlowDefinition>>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sub-flow under a name, replacing any previous entry
    pub fn register(&mut self, name: impl Into<FlowId>, flow: FlowDefinition) {
        self.flows.insert(name.into(), Arc::new(flow));
    }

    /// Look up a sub-flow by name
    pub fn get(&self, name: &FlowId) -> Option<&Arc<FlowDefinition>> {
        self.flows.get(name)
    }

    /// Whether a sub-flow exists for the name
    pub fn contains(&self, name: &FlowId) -> bool {
        self.flows.contains_key(name)
    }
}
