//! Build-time flow resolution
//!
//! A [`FlowDefinition`] is validated and compiled into an [`ExecutableFlow`]
//! before anything runs: provider references are resolved against the
//! registry, sub-flows (inline or registered) are compiled into a shared
//! arena and referenced by index, and per-step defaults are applied. The
//! executor then never touches either registry, and a build error can name
//! every problem in the definition at once rather than failing on the first.

use crate::flow::definition::{
    ConsensusConfig, FlowDefinition, FlowId, FlowOrRef, InputMapping, MappingSource, NodeConfig,
    NodeKind, OutputSource, OutputTransform, ProviderRef, Step, StepId, FORMAT_VERSION,
};
use crate::flow::provider::{FlowRegistry, ProviderInstance, ProviderRegistry};
use crate::flow::resilience::RetryPolicy;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Worker pool size for for-each steps that do not set one
pub const DEFAULT_FOREACH_CONCURRENCY: usize = 4;

/// Successful item floor for for-each steps that do not set one
pub const DEFAULT_MIN_SUCCESSES: usize = 1;

/// One or more problems found while building a flow
///
/// Validation does not stop at the first problem; `issues` lists everything
/// found in a single pass over the definition and its sub-flows.
#[derive(Debug, Error)]
#[error("flow build failed: {}", issues.join("; "))]
pub struct BuildError {
    /// Every problem found, in discovery order
    pub issues: Vec<String>,
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Index of a compiled flow in the executable's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowIndex(pub(crate) usize);

/// A provider node with references validated and defaults applied
#[derive(Debug, Clone)]
pub struct CompiledNode {
    /// Capability the node requires
    pub kind: NodeKind,
    /// Fallback chain, primary first; resolved at run time so trigger
    /// overrides can redirect references
    pub providers: Vec<ProviderRef>,
    /// Extraction schema for VLM-style providers
    pub schema: Option<Value>,
    /// Retry schedule for the chain
    pub retry: RetryPolicy,
    /// Consensus settings, when enabled
    pub consensus: Option<ConsensusConfig>,
}

/// A step with sub-flows resolved to arena indexes
#[derive(Debug, Clone)]
pub enum CompiledStep {
    /// One provider invocation
    Standard {
        /// Step identifier
        id: StepId,
        /// Resolved node
        node: CompiledNode,
    },
    /// Classification selecting one branch
    Conditional {
        /// Step identifier
        id: StepId,
        /// Resolved classifier node
        classifier: CompiledNode,
        /// Branch label to compiled flow
        branches: BTreeMap<String, FlowIndex>,
    },
    /// Split and fan out over items
    ForEach {
        /// Step identifier
        id: StepId,
        /// Resolved splitter node
        splitter: CompiledNode,
        /// Compiled item flow
        item_flow: FlowIndex,
        /// Worker pool size
        concurrency: usize,
        /// Minimum successful items for the step to succeed
        min_successes: usize,
    },
    /// Invoke a compiled sub-flow
    Trigger {
        /// Step identifier
        id: StepId,
        /// Compiled child flow
        flow: FlowIndex,
        /// Provider redirections applied for the child run
        provider_overrides: Option<BTreeMap<ProviderRef, ProviderRef>>,
        /// How the child input is computed
        input_mapping: Option<InputMapping>,
        /// Merge child metrics into the parent context
        merge_metrics: bool,
        /// Deadline for the child run
        timeout: Option<Duration>,
    },
    /// Form the flow result from recorded artifacts
    Output {
        /// Step identifier
        id: StepId,
        /// Optional display name
        name: Option<String>,
        /// Artifacts to read
        source: OutputSource,
        /// Transform applied to the gathered artifacts
        transform: OutputTransform,
    },
}

impl CompiledStep {
    /// The step's identifier
    pub fn id(&self) -> &StepId {
        match self {
            CompiledStep::Standard { id, .. }
            | CompiledStep::Conditional { id, .. }
            | CompiledStep::ForEach { id, .. }
            | CompiledStep::Trigger { id, .. }
            | CompiledStep::Output { id, .. } => id,
        }
    }

    /// The step kind name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            CompiledStep::Standard { .. } => "standard",
            CompiledStep::Conditional { .. } => "conditional",
            CompiledStep::ForEach { .. } => "for_each",
            CompiledStep::Trigger { .. } => "trigger",
            CompiledStep::Output { .. } => "output",
        }
    }
}

/// One compiled flow in the arena
#[derive(Debug, Clone, Default)]
pub struct CompiledFlow {
    /// Steps in execution order
    pub steps: Vec<CompiledStep>,
    /// Input requirement checked before the first step
    pub input_validation: Option<Value>,
}

/// A fully resolved flow ready to execute
///
/// Holds every compiled flow the run can reach plus the provider bindings
/// they reference. Cheap to clone per run is not a goal; executions borrow
/// it.
pub struct ExecutableFlow {
    pub(crate) arena: Vec<CompiledFlow>,
    pub(crate) root: FlowIndex,
    pub(crate) bindings: HashMap<ProviderRef, ProviderInstance>,
}

impl ExecutableFlow {
    /// The root compiled flow
    pub(crate) fn flow(&self, index: FlowIndex) -> &CompiledFlow {
        &self.arena[index.0]
    }

    /// Index of the root flow
    pub(crate) fn root(&self) -> FlowIndex {
        self.root
    }

    /// Resolved binding for a provider reference
    pub(crate) fn binding(&self, name: &ProviderRef) -> Option<&ProviderInstance> {
        self.bindings.get(name)
    }

    /// Number of distinct flows reachable from the root
    pub fn flow_count(&self) -> usize {
        self.arena.len()
    }
}

impl std::fmt::Debug for ExecutableFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableFlow")
            .field("flows", &self.arena.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Validate a definition and compile it against the registries
pub fn build_flow(
    definition: &FlowDefinition,
    providers: &ProviderRegistry,
    flows: &FlowRegistry,
) -> BuildResult<ExecutableFlow> {
    let mut builder = Builder {
        providers,
        flows,
        arena: Vec::new(),
        resolved: HashMap::new(),
        bindings: HashMap::new(),
        issues: Vec::new(),
    };

    let root = builder.compile(definition, "root");

    if builder.issues.is_empty() {
        Ok(ExecutableFlow {
            arena: builder.arena,
            root,
            bindings: builder.bindings,
        })
    } else {
        Err(BuildError {
            issues: builder.issues,
        })
    }
}

struct Builder<'a> {
    providers: &'a ProviderRegistry,
    flows: &'a FlowRegistry,
    arena: Vec<CompiledFlow>,
    resolved: HashMap<FlowId, FlowIndex>,
    bindings: HashMap<ProviderRef, ProviderInstance>,
    issues: Vec<String>,
}

impl Builder<'_> {
    /// Compile one flow into the arena, returning its index
    ///
    /// The slot is reserved before the steps compile so registered flows
    /// that reference each other resolve without recursing forever.
    fn compile(&mut self, definition: &FlowDefinition, label: &str) -> FlowIndex {
        let index = FlowIndex(self.arena.len());
        self.arena.push(CompiledFlow::default());
        self.compile_into(definition, label, index);
        index
    }

    fn compile_into(&mut self, definition: &FlowDefinition, label: &str, index: FlowIndex) {
        if definition.format_version != FORMAT_VERSION {
            self.issues.push(format!(
                "{label}: unsupported format version '{}', expected '{FORMAT_VERSION}'",
                definition.format_version
            ));
        }

        let mut seen_ids: HashSet<&StepId> = HashSet::new();
        let mut steps = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            if !seen_ids.insert(step.id()) {
                self.issues
                    .push(format!("{label}: duplicate step id '{}'", step.id()));
            }
            steps.push(self.compile_step(step, label, &seen_ids));
        }

        self.arena[index.0] = CompiledFlow {
            steps,
            input_validation: definition.input_validation.clone(),
        };
    }

    fn compile_step(
        &mut self,
        step: &Step,
        label: &str,
        earlier_ids: &HashSet<&StepId>,
    ) -> CompiledStep {
        match step {
            Step::Standard { id, node } => CompiledStep::Standard {
                id: id.clone(),
                node: self.compile_node(node, label, id),
            },
            Step::Conditional {
                id,
                classifier,
                branches,
            } => {
                if branches.is_empty() {
                    self.issues
                        .push(format!("{label}: conditional '{id}' has no branches"));
                }
                let classifier = self.compile_node(classifier, label, id);
                let branches = branches
                    .iter()
                    .map(|(branch, flow)| {
                        let branch_label = format!("{label}/{id}[{branch}]");
                        (branch.clone(), self.resolve_flow(flow, &branch_label))
                    })
                    .collect();
                CompiledStep::Conditional {
                    id: id.clone(),
                    classifier,
                    branches,
                }
            }
            Step::ForEach {
                id,
                splitter,
                item_flow,
                concurrency,
                min_successes,
            } => {
                if concurrency == &Some(0) {
                    self.issues
                        .push(format!("{label}: for_each '{id}' concurrency must be at least 1"));
                }
                if min_successes == &Some(0) {
                    self.issues.push(format!(
                        "{label}: for_each '{id}' min_successes must be at least 1"
                    ));
                }
                let item_label = format!("{label}/{id}[item]");
                CompiledStep::ForEach {
                    id: id.clone(),
                    splitter: self.compile_node(splitter, label, id),
                    item_flow: self.resolve_flow(item_flow, &item_label),
                    concurrency: concurrency.unwrap_or(DEFAULT_FOREACH_CONCURRENCY).max(1),
                    min_successes: min_successes.unwrap_or(DEFAULT_MIN_SUCCESSES).max(1),
                }
            }
            Step::Trigger {
                id,
                flow_ref,
                provider_overrides,
                input_mapping,
                merge_metrics,
                timeout_ms,
            } => {
                if timeout_ms == &Some(0) {
                    self.issues
                        .push(format!("{label}: trigger '{id}' timeout must be at least 1ms"));
                }
                if let Some(overrides) = provider_overrides {
                    for replacement in overrides.values() {
                        self.resolve_binding(replacement, label, id);
                    }
                }
                if let Some(mapping) = input_mapping {
                    self.check_mapping(mapping, label, id, earlier_ids);
                }
                let flow = self.resolve_flow(&FlowOrRef::Ref(flow_ref.clone()), label);
                CompiledStep::Trigger {
                    id: id.clone(),
                    flow,
                    provider_overrides: provider_overrides.clone(),
                    input_mapping: input_mapping.clone(),
                    merge_metrics: *merge_metrics,
                    timeout: timeout_ms.map(Duration::from_millis),
                }
            }
            Step::Output {
                id,
                name,
                source,
                transform,
            } => {
                let sources: Vec<&StepId> = match source {
                    OutputSource::Single(step_id) => vec![step_id],
                    OutputSource::Many(step_ids) => {
                        if step_ids.is_empty() {
                            self.issues
                                .push(format!("{label}: output '{id}' has no sources"));
                        }
                        step_ids.iter().collect()
                    }
                };
                for source_id in sources {
                    if !earlier_ids.contains(source_id) || source_id == id {
                        self.issues.push(format!(
                            "{label}: output '{id}' reads '{source_id}', which is not an earlier step"
                        ));
                    }
                }
                CompiledStep::Output {
                    id: id.clone(),
                    name: name.clone(),
                    source: source.clone(),
                    transform: transform.clone(),
                }
            }
        }
    }

    fn compile_node(&mut self, node: &NodeConfig, label: &str, step_id: &StepId) -> CompiledNode {
        if node.providers.is_empty() {
            self.issues
                .push(format!("{label}: step '{step_id}' has no providers"));
        }
        for provider in &node.providers {
            if let Some(instance) = self.resolve_binding(provider, label, step_id) {
                if instance.kind() != node.kind {
                    self.issues.push(format!(
                        "{label}: step '{step_id}' needs a {} provider but '{provider}' is {}",
                        node.kind.as_str(),
                        instance.kind().as_str()
                    ));
                }
            }
        }
        if let Some(consensus) = &node.consensus {
            if consensus.runs == 0 {
                self.issues.push(format!(
                    "{label}: step '{step_id}' consensus requires at least one run"
                ));
            }
        }
        CompiledNode {
            kind: node.kind,
            providers: node.providers.clone(),
            schema: node.schema.clone(),
            retry: node
                .retry
                .as_ref()
                .map(RetryPolicy::from_config)
                .unwrap_or_default(),
            consensus: node.consensus.clone(),
        }
    }

    /// Resolve a provider reference, recording the binding for the executable
    fn resolve_binding(
        &mut self,
        provider: &ProviderRef,
        label: &str,
        step_id: &StepId,
    ) -> Option<ProviderInstance> {
        match self.providers.get(provider) {
            Some(instance) => {
                self.bindings
                    .entry(provider.clone())
                    .or_insert_with(|| instance.clone());
                Some(instance.clone())
            }
            None => {
                self.issues.push(format!(
                    "{label}: step '{step_id}' references unknown provider '{provider}'"
                ));
                None
            }
        }
    }

    /// Resolve an inline or registered sub-flow to an arena index
    fn resolve_flow(&mut self, flow: &FlowOrRef, label: &str) -> FlowIndex {
        match flow {
            FlowOrRef::Inline(definition) => self.compile(definition, label),
            FlowOrRef::Ref(flow_id) => {
                if let Some(&index) = self.resolved.get(flow_id) {
                    return index;
                }
                match self.flows.get(flow_id) {
                    Some(definition) => {
                        // Reserve before compiling so mutually referencing
                        // flows terminate
                        let index = FlowIndex(self.arena.len());
                        self.arena.push(CompiledFlow::default());
                        self.resolved.insert(flow_id.clone(), index);
                        let definition = definition.clone();
                        self.compile_into(definition.as_ref(), &format!("flow '{flow_id}'"), index);
                        index
                    }
                    None => {
                        self.issues
                            .push(format!("{label}: unknown flow '{flow_id}'"));
                        FlowIndex(usize::MAX)
                    }
                }
            }
        }
    }

    fn check_mapping(
        &mut self,
        mapping: &InputMapping,
        label: &str,
        step_id: &StepId,
        earlier_ids: &HashSet<&StepId>,
    ) {
        let check_artifact = |source: &StepId, issues: &mut Vec<String>| {
            if !earlier_ids.contains(source) || source == step_id {
                issues.push(format!(
                    "{label}: trigger '{step_id}' maps artifact of '{source}', which is not an earlier step"
                ));
            }
        };
        match mapping {
            InputMapping::Passthrough | InputMapping::UnwrapEnvelope { .. } => {}
            InputMapping::FromArtifact { step, .. }
            | InputMapping::MergeWithArtifact { step } => {
                check_artifact(step, &mut self.issues);
            }
            InputMapping::Construct { fields } => {
                for source in fields.values() {
                    if let MappingSource::Artifact { step, .. } = source {
                        check_artifact(step, &mut self.issues);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::NodeKind;
    use crate::flow::test_helpers::registry_with;
    use serde_json::json;

    fn providers() -> ProviderRegistry {
        registry_with(&[
            ("ocr-a", NodeKind::Ocr, json!({"text": "a"})),
            ("ocr-b", NodeKind::Ocr, json!({"text": "b"})),
            ("vlm-a", NodeKind::Vlm, json!({"label": "invoice"})),
        ])
    }

    fn standard(id: &str, provider: &str) -> Step {
        Step::Standard {
            id: StepId::new(id),
            node: NodeConfig::ocr(vec![ProviderRef::new(provider)]),
        }
    }

    #[test]
    fn test_build_resolves_reachable_flows_once() {
        let mut flows = FlowRegistry::new();
        flows.register(
            "shared",
            FlowDefinition::new(vec![standard("inner", "ocr-a")]),
        );

        let definition = FlowDefinition::new(vec![
            Step::Trigger {
                id: StepId::new("first"),
                flow_ref: FlowId::new("shared"),
                provider_overrides: None,
                input_mapping: None,
                merge_metrics: false,
                timeout_ms: None,
            },
            Step::Trigger {
                id: StepId::new("second"),
                flow_ref: FlowId::new("shared"),
                provider_overrides: None,
                input_mapping: None,
                merge_metrics: false,
                timeout_ms: None,
            },
        ]);

        let executable = build_flow(&definition, &providers(), &flows).unwrap();
        // Root plus one shared flow, compiled once despite two references
        assert_eq!(executable.flow_count(), 2);
    }

    #[test]
    fn test_build_collects_every_issue_in_one_pass() {
        let definition = FlowDefinition {
            format_version: "0.9.0".to_string(),
            steps: vec![
                standard("dup", "ocr-a"),
                standard("dup", "missing-provider"),
                Step::Standard {
                    id: StepId::new("empty"),
                    node: NodeConfig::ocr(vec![]),
                },
                Step::Output {
                    id: StepId::new("out"),
                    name: None,
                    source: OutputSource::Single(StepId::new("nonexistent")),
                    transform: OutputTransform::First,
                },
            ],
            input_validation: None,
        };

        let error = build_flow(&definition, &providers(), &FlowRegistry::new()).unwrap_err();
        let rendered = error.issues.join("\n");
        assert!(rendered.contains("unsupported format version '0.9.0'"));
        assert!(rendered.contains("duplicate step id 'dup'"));
        assert!(rendered.contains("unknown provider 'missing-provider'"));
        assert!(rendered.contains("step 'empty' has no providers"));
        assert!(rendered.contains("output 'out' reads 'nonexistent'"));
        assert_eq!(error.issues.len(), 5);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let definition = FlowDefinition::new(vec![Step::Standard {
            id: StepId::new("extract"),
            node: NodeConfig::vlm(vec![ProviderRef::new("ocr-a")], None),
        }]);

        let error = build_flow(&definition, &providers(), &FlowRegistry::new()).unwrap_err();
        assert!(error.issues[0].contains("needs a vlm provider but 'ocr-a' is ocr"));
    }

    #[test]
    fn test_unknown_flow_ref_is_rejected() {
        let definition = FlowDefinition::new(vec![Step::Trigger {
            id: StepId::new("enrich"),
            flow_ref: FlowId::new("nope"),
            provider_overrides: None,
            input_mapping: None,
            merge_metrics: false,
            timeout_ms: None,
        }]);

        let error = build_flow(&definition, &providers(), &FlowRegistry::new()).unwrap_err();
        assert!(error.issues[0].contains("unknown flow 'nope'"));
    }

    #[test]
    fn test_override_target_must_resolve() {
        let mut flows = FlowRegistry::new();
        flows.register("child", FlowDefinition::new(vec![standard("inner", "ocr-a")]));

        let mut overrides = BTreeMap::new();
        overrides.insert(ProviderRef::new("ocr-a"), ProviderRef::new("ghost"));
        let definition = FlowDefinition::new(vec![Step::Trigger {
            id: StepId::new("enrich"),
            flow_ref: FlowId::new("child"),
            provider_overrides: Some(overrides),
            input_mapping: None,
            merge_metrics: false,
            timeout_ms: None,
        }]);

        let error = build_flow(&definition, &providers(), &flows).unwrap_err();
        assert!(error.issues[0].contains("unknown provider 'ghost'"));
    }

    #[test]
    fn test_foreach_defaults_applied() {
        let definition = FlowDefinition::new(vec![Step::ForEach {
            id: StepId::new("pages"),
            splitter: NodeConfig::ocr(vec![ProviderRef::new("ocr-a")]),
            item_flow: FlowOrRef::Inline(FlowDefinition::new(vec![standard("item", "ocr-b")])),
            concurrency: None,
            min_successes: None,
        }]);

        let executable = build_flow(&definition, &providers(), &FlowRegistry::new()).unwrap();
        match &executable.flow(executable.root()).steps[0] {
            CompiledStep::ForEach {
                concurrency,
                min_successes,
                ..
            } => {
                assert_eq!(*concurrency, DEFAULT_FOREACH_CONCURRENCY);
                assert_eq!(*min_successes, DEFAULT_MIN_SUCCESSES);
            }
            other => panic!("expected for_each, got {other:?}"),
        }
    }

    #[test]
    fn test_bindings_cover_overrides_and_chains() {
        let mut flows = FlowRegistry::new();
        flows.register("child", FlowDefinition::new(vec![standard("inner", "ocr-a")]));

        let mut overrides = BTreeMap::new();
        overrides.insert(ProviderRef::new("ocr-a"), ProviderRef::new("ocr-b"));
        let definition = FlowDefinition::new(vec![Step::Trigger {
            id: StepId::new("enrich"),
            flow_ref: FlowId::new("child"),
            provider_overrides: Some(overrides),
            input_mapping: None,
            merge_metrics: false,
            timeout_ms: None,
        }]);

        let executable = build_flow(&definition, &providers(), &flows).unwrap();
        assert!(executable.binding(&ProviderRef::new("ocr-a")).is_some());
        assert!(executable.binding(&ProviderRef::new("ocr-b")).is_some());
    }
}
