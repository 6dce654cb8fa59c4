//! # Docuflow
//!
//! A flow execution engine for document processing over AI vision and
//! extraction providers.
//!
//! Flows are declarative pipelines: OCR and extraction steps, conditional
//! routing on classifier output, fan-out over split documents, and nested
//! sub-flow invocation. The engine supplies what production use of flaky
//! vendor APIs demands: retry with exponential backoff, provider fallback
//! chains, per-provider circuit breakers, multi-run consensus voting, and
//! an observability hook surface.
//!
//! ## Example
//!
//! ```no_run
//! use docuflow::flow::{
//!     build_flow, FlowDefinition, FlowExecutor, FlowRegistry, NodeConfig, ProviderRef,
//!     ProviderRegistry, Step,
//! };
//! use serde_json::json;
//!
//! # async fn run(providers: ProviderRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let definition = FlowDefinition::new(vec![
//!     Step::Standard {
//!         id: "ocr".into(),
//!         node: NodeConfig::ocr(vec![ProviderRef::new("mistral-ocr")]),
//!     },
//!     Step::Standard {
//!         id: "extract".into(),
//!         node: NodeConfig::vlm(
//!             vec![ProviderRef::new("gpt-vision"), ProviderRef::new("claude-vision")],
//!             Some(json!({"type": "object"})),
//!         ),
//!     },
//! ]);
//!
//! let executable = build_flow(&definition, &providers, &FlowRegistry::new())?;
//! let executor = FlowExecutor::new();
//! let outcome = executor.execute(&executable, json!({"document": "..."})).await?;
//! println!("{}", outcome.result);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod flow;

pub use flow::{
    build_flow, BuildError, ExecutableFlow, ExecutionError, ExecutionHooks, FlowDefinition,
    FlowExecutor, FlowOutcome, FlowRegistry, HookDispatcher, OcrProvider, ProviderRegistry,
    VlmProvider,
};
