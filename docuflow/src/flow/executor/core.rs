//! Core execution loop
//!
//! Steps run sequentially; the artifact of each completed step becomes the
//! input of the next. Sub-flows (branches, item flows, triggers) recurse
//! through [`FlowExecutor::execute_flow`] with a depth bound.

use super::{
    ExecutionError, ExecutionErrorKind, ExecutionResult, FlowExecutor, FlowOutcome, MAX_FLOW_DEPTH,
};
use crate::flow::build::{CompiledNode, CompiledStep, ExecutableFlow, FlowIndex};
use crate::flow::consensus::run_consensus;
use crate::flow::context::{ExecutionContext, StepMetrics};
use crate::flow::definition::{
    InputMapping, MappingSource, OutputSource, OutputTransform, ProviderRef, StepId,
};
use crate::flow::hooks::{FlowEvent, TraceContext};
use crate::flow::metrics::RunMetrics;
use crate::flow::provider::{ProviderError, ProviderInstance};
use crate::flow::resilience::FallbackManager;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Usage attributed to one step
#[derive(Debug, Default)]
pub(super) struct NodeUsage {
    pub provider_key: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub agreement: Option<f64>,
}

/// Result of one step, plus whether it ends the flow
pub(super) struct StepOutcome {
    pub artifact: Value,
    pub usage: NodeUsage,
    pub finished: bool,
}

impl FlowExecutor {
    /// Execute a compiled flow against an input, with a fresh trace
    pub async fn execute(
        &self,
        executable: &ExecutableFlow,
        input: Value,
    ) -> ExecutionResult<FlowOutcome> {
        self.execute_traced(executable, input, TraceContext::new())
            .await
    }

    /// Execute a compiled flow under an existing trace context
    pub async fn execute_traced(
        &self,
        executable: &ExecutableFlow,
        input: Value,
        trace: TraceContext,
    ) -> ExecutionResult<FlowOutcome> {
        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!(run_id = %trace.run_id, "flow run started");
        self.hooks
            .dispatch(
                &trace,
                FlowEvent::FlowStarted {
                    input: input.clone(),
                },
            )
            .await;

        let mut context = ExecutionContext::new();
        let overrides = HashMap::new();
        let result = self
            .execute_flow(
                executable,
                executable.root(),
                input,
                &mut context,
                &trace,
                &overrides,
                0,
            )
            .await;

        self.lock_metrics().record_run(RunMetrics {
            run_id: trace.run_id,
            started_at,
            duration: start.elapsed(),
            steps: context.metrics().len(),
            tokens_in: context.total_tokens_in(),
            tokens_out: context.total_tokens_out(),
            cost_usd: context.total_cost_usd(),
            success: result.is_ok(),
        });

        match result {
            Ok(result) => {
                tracing::info!(
                    run_id = %trace.run_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    cost_usd = context.total_cost_usd(),
                    "flow run completed"
                );
                self.hooks
                    .dispatch(
                        &trace,
                        FlowEvent::FlowCompleted {
                            result: result.clone(),
                        },
                    )
                    .await;
                Ok(FlowOutcome {
                    result,
                    context,
                    trace,
                })
            }
            Err(error) => {
                tracing::warn!(run_id = %trace.run_id, error = %error, "flow run failed");
                self.hooks
                    .dispatch(
                        &trace,
                        FlowEvent::FlowFailed {
                            error: error.to_string(),
                        },
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Run one flow in the arena; boxed because sub-flows recurse
    pub(super) fn execute_flow<'a>(
        &'a self,
        executable: &'a ExecutableFlow,
        index: FlowIndex,
        input: Value,
        context: &'a mut ExecutionContext,
        trace: &'a TraceContext,
        overrides: &'a HashMap<ProviderRef, ProviderRef>,
        depth: usize,
    ) -> BoxFuture<'a, ExecutionResult<Value>> {
        Box::pin(async move {
            if depth >= MAX_FLOW_DEPTH {
                return Err(ExecutionError::flow(ExecutionErrorKind::DepthExceeded(
                    MAX_FLOW_DEPTH,
                )));
            }

            let flow = executable.flow(index);
            if let Some(validation) = &flow.input_validation {
                validate_input(&input, validation).map_err(ExecutionError::flow)?;
            }

            let mut current = input;
            for step in &flow.steps {
                let step_id = step.id().clone();
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::StepStarted {
                            step_id: step_id.clone(),
                            kind: step.kind_name(),
                        },
                    )
                    .await;
                let step_start = Instant::now();

                match self
                    .run_step(executable, step, &current, context, trace, overrides, depth)
                    .await
                {
                    Ok(outcome) => {
                        let metrics = StepMetrics {
                            step_id: step_id.clone(),
                            provider_key: outcome.usage.provider_key,
                            duration: step_start.elapsed(),
                            tokens_in: outcome.usage.tokens_in,
                            tokens_out: outcome.usage.tokens_out,
                            cost_usd: outcome.usage.cost_usd,
                            consensus_agreement: outcome.usage.agreement,
                        };
                        context.set_artifact(step_id.clone(), outcome.artifact.clone());
                        context.record_metrics(metrics.clone());
                        self.hooks
                            .dispatch(trace, FlowEvent::StepCompleted { step_id, metrics })
                            .await;
                        current = outcome.artifact;
                        if outcome.finished {
                            return Ok(current);
                        }
                    }
                    Err(error) => {
                        self.hooks
                            .dispatch(
                                trace,
                                FlowEvent::StepFailed {
                                    step_id,
                                    error: error.to_string(),
                                },
                            )
                            .await;
                        return Err(error);
                    }
                }
            }
            Ok(current)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        executable: &ExecutableFlow,
        step: &CompiledStep,
        input: &Value,
        context: &mut ExecutionContext,
        trace: &TraceContext,
        overrides: &HashMap<ProviderRef, ProviderRef>,
        depth: usize,
    ) -> ExecutionResult<StepOutcome> {
        match step {
            CompiledStep::Standard { id, node } => {
                let (value, usage) = self
                    .run_node(executable, node, id, input, trace, overrides)
                    .await
                    .map_err(|kind| ExecutionError::at(id, kind))?;
                Ok(StepOutcome {
                    artifact: value,
                    usage,
                    finished: false,
                })
            }
            CompiledStep::Conditional {
                id,
                classifier,
                branches,
            } => {
                let (label_value, mut usage) = self
                    .run_node(executable, classifier, id, input, trace, overrides)
                    .await
                    .map_err(|kind| ExecutionError::at(id, kind))?;
                let label = extract_label(&label_value)
                    .ok_or_else(|| ExecutionError::at(id, ExecutionErrorKind::InvalidLabel))?;
                let branch = *branches.get(&label).ok_or_else(|| {
                    ExecutionError::at(id, ExecutionErrorKind::UnmappedBranch(label.clone()))
                })?;
                tracing::debug!(step_id = %id, label = %label, "conditional selected branch");

                // The branch sees the conditional's input, not the label
                let mut child = ExecutionContext::new();
                let result = self
                    .execute_flow(
                        executable,
                        branch,
                        input.clone(),
                        &mut child,
                        trace,
                        overrides,
                        depth + 1,
                    )
                    .await
                    .map_err(|error| {
                        ExecutionError::at(id, ExecutionErrorKind::SubFlow(Box::new(error)))
                    })?;

                for (child_id, value) in child.artifacts() {
                    context.set_artifact(
                        StepId::from(format!("{id}.{child_id}")),
                        value.clone(),
                    );
                }
                usage.tokens_in += child.total_tokens_in();
                usage.tokens_out += child.total_tokens_out();
                usage.cost_usd += child.total_cost_usd();
                Ok(StepOutcome {
                    artifact: result,
                    usage,
                    finished: false,
                })
            }
            CompiledStep::ForEach {
                id,
                splitter,
                item_flow,
                concurrency,
                min_successes,
            } => {
                self.run_for_each(
                    executable,
                    id,
                    splitter,
                    *item_flow,
                    *concurrency,
                    *min_successes,
                    input,
                    trace,
                    overrides,
                    depth,
                )
                .await
            }
            CompiledStep::Trigger {
                id,
                flow,
                provider_overrides,
                input_mapping,
                merge_metrics,
                timeout,
            } => {
                let child_input = map_input(input_mapping.as_ref(), input, context)
                    .map_err(|kind| ExecutionError::at(id, kind))?;
                let merged = match provider_overrides {
                    Some(step_overrides) => {
                        let mut merged = overrides.clone();
                        for (from, to) in step_overrides {
                            merged.insert(from.clone(), to.clone());
                        }
                        merged
                    }
                    None => overrides.clone(),
                };

                let child_trace = trace.child();
                let mut child = ExecutionContext::new();
                let child_run = self.execute_flow(
                    executable,
                    *flow,
                    child_input,
                    &mut child,
                    &child_trace,
                    &merged,
                    depth + 1,
                );
                let result = match timeout {
                    Some(deadline) => tokio::time::timeout(*deadline, child_run)
                        .await
                        .map_err(|_| {
                            ExecutionError::at(id, ExecutionErrorKind::Timeout(*deadline))
                        })?,
                    None => child_run.await,
                };
                let result = result.map_err(|error| {
                    ExecutionError::at(id, ExecutionErrorKind::SubFlow(Box::new(error)))
                })?;

                // When child metrics merge into the parent list, the trigger
                // row itself stays zeroed so usage is not counted twice
                let usage = if *merge_metrics {
                    context.merge_metrics_from(&child);
                    NodeUsage::default()
                } else {
                    NodeUsage {
                        provider_key: None,
                        tokens_in: child.total_tokens_in(),
                        tokens_out: child.total_tokens_out(),
                        cost_usd: child.total_cost_usd(),
                        agreement: None,
                    }
                };
                Ok(StepOutcome {
                    artifact: result,
                    usage,
                    finished: false,
                })
            }
            CompiledStep::Output {
                id,
                name,
                source,
                transform,
            } => {
                let source_ids: Vec<&StepId> = match source {
                    OutputSource::Single(step_id) => vec![step_id],
                    OutputSource::Many(step_ids) => step_ids.iter().collect(),
                };
                let mut values = Vec::with_capacity(source_ids.len());
                for source_id in source_ids {
                    let value = context.artifact(source_id).cloned().ok_or_else(|| {
                        ExecutionError::at(
                            id,
                            ExecutionErrorKind::MissingArtifact(source_id.clone()),
                        )
                    })?;
                    values.push(value);
                }
                let value = apply_transform(transform, values)
                    .map_err(|kind| ExecutionError::at(id, kind))?;
                if let Some(name) = name {
                    tracing::debug!(step_id = %id, output = %name, "flow output produced");
                }
                Ok(StepOutcome {
                    artifact: value,
                    usage: NodeUsage::default(),
                    finished: true,
                })
            }
        }
    }

    /// Invoke one provider node: fallback chain, with consensus when enabled
    pub(super) async fn run_node(
        &self,
        executable: &ExecutableFlow,
        node: &CompiledNode,
        step_id: &StepId,
        input: &Value,
        trace: &TraceContext,
        overrides: &HashMap<ProviderRef, ProviderRef>,
    ) -> Result<(Value, NodeUsage), ExecutionErrorKind> {
        let mut pairs: Vec<(ProviderRef, String)> = Vec::with_capacity(node.providers.len());
        let mut instances: Vec<ProviderInstance> = Vec::with_capacity(node.providers.len());
        for provider in &node.providers {
            let effective = overrides.get(provider).unwrap_or(provider);
            let instance = executable
                .binding(effective)
                .ok_or_else(|| ExecutionErrorKind::MissingBinding(effective.clone()))?;
            pairs.push((provider.clone(), instance.key().to_string()));
            instances.push(instance.clone());
        }

        let manager = FallbackManager::new(&node.retry, &self.breakers, &self.hooks);
        let input = input.clone();
        let schema = node.schema.clone();

        match &node.consensus {
            None => {
                let outcome = manager
                    .call_with_fallback(trace, step_id, &pairs, |chain_index| {
                        let instance = instances[chain_index].clone();
                        let input = input.clone();
                        let schema = schema.clone();
                        async move { instance.invoke(input, schema.as_ref()).await }
                    })
                    .await?;
                let usage = NodeUsage {
                    provider_key: Some(outcome.provider_key),
                    tokens_in: outcome.response.tokens_in,
                    tokens_out: outcome.response.tokens_out,
                    cost_usd: outcome.response.cost_usd,
                    agreement: None,
                };
                Ok((outcome.response.value, usage))
            }
            Some(consensus) => {
                let outcome = run_consensus(&self.hooks, trace, step_id, consensus, |_run| {
                    let instances = instances.clone();
                    let input = input.clone();
                    let schema = schema.clone();
                    let chain_call =
                        manager.call_with_fallback(trace, step_id, &pairs, move |chain_index| {
                            let instance = instances[chain_index].clone();
                            let input = input.clone();
                            let schema = schema.clone();
                            async move { instance.invoke(input, schema.as_ref()).await }
                        });
                    async move {
                        chain_call
                            .await
                            .map(|outcome| outcome.response)
                            .map_err(|error| ProviderError::new(error.to_string()))
                    }
                })
                .await?;

                let (tokens_in, tokens_out, cost_usd) = outcome.total_usage();
                let usage = NodeUsage {
                    provider_key: None,
                    tokens_in,
                    tokens_out,
                    cost_usd,
                    agreement: Some(outcome.agreement),
                };
                Ok((outcome.agreed, usage))
            }
        }
    }
}

/// Pull a branch label out of a classifier's output
fn extract_label(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("label").and_then(Value::as_str))
        .map(str::to_string)
}

/// Check a flow input against its validation descriptor
fn validate_input(input: &Value, descriptor: &Value) -> Result<(), ExecutionErrorKind> {
    if input.is_null() {
        return Err(ExecutionErrorKind::InputValidation(
            "input is null".to_string(),
        ));
    }
    if let Some(required) = descriptor.get("required").and_then(Value::as_array) {
        let object = input.as_object().ok_or_else(|| {
            ExecutionErrorKind::InputValidation("input is not an object".to_string())
        })?;
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(ExecutionErrorKind::InputValidation(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }
    Ok(())
}

/// Compute a trigger's child input from the parent state
fn map_input(
    mapping: Option<&InputMapping>,
    input: &Value,
    context: &ExecutionContext,
) -> Result<Value, ExecutionErrorKind> {
    let Some(mapping) = mapping else {
        return Ok(input.clone());
    };

    let read_artifact = |step: &StepId, path: Option<&String>| {
        let artifact = context
            .artifact(step)
            .ok_or_else(|| ExecutionErrorKind::MissingArtifact(step.clone()))?;
        match path {
            None => Ok(artifact.clone()),
            Some(pointer) => artifact.pointer(pointer).cloned().ok_or_else(|| {
                ExecutionErrorKind::InputMapping(format!(
                    "path '{pointer}' not found in artifact of '{step}'"
                ))
            }),
        }
    };

    match mapping {
        InputMapping::Passthrough => Ok(input.clone()),
        InputMapping::UnwrapEnvelope { field } => {
            input.get(field).cloned().ok_or_else(|| {
                ExecutionErrorKind::InputMapping(format!("field '{field}' missing from input"))
            })
        }
        InputMapping::FromArtifact { step, path } => read_artifact(step, path.as_ref()),
        InputMapping::MergeWithArtifact { step } => {
            let artifact = read_artifact(step, None)?;
            let base = input.as_object().ok_or_else(|| {
                ExecutionErrorKind::InputMapping("input is not an object".to_string())
            })?;
            let overlay = artifact.as_object().ok_or_else(|| {
                ExecutionErrorKind::InputMapping(format!(
                    "artifact of '{step}' is not an object"
                ))
            })?;
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(merged))
        }
        InputMapping::Construct { fields } => {
            let mut object = Map::with_capacity(fields.len());
            for (name, source) in fields {
                let value = match source {
                    MappingSource::Input => input.clone(),
                    MappingSource::Artifact { step, path } => read_artifact(step, path.as_ref())?,
                };
                object.insert(name.clone(), value);
            }
            Ok(Value::Object(object))
        }
    }
}

/// Apply an output transform to gathered artifacts
fn apply_transform(
    transform: &OutputTransform,
    values: Vec<Value>,
) -> Result<Value, ExecutionErrorKind> {
    let merge = |values: &[Value]| -> Result<Map<String, Value>, ExecutionErrorKind> {
        let mut merged = Map::new();
        for value in values {
            let object = value.as_object().ok_or_else(|| {
                ExecutionErrorKind::OutputTransform(
                    "merge requires object artifacts".to_string(),
                )
            })?;
            for (key, value) in object {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(merged)
    };

    match transform {
        OutputTransform::First => values.into_iter().next().ok_or_else(|| {
            ExecutionErrorKind::OutputTransform("no source values".to_string())
        }),
        OutputTransform::Last => values.into_iter().next_back().ok_or_else(|| {
            ExecutionErrorKind::OutputTransform("no source values".to_string())
        }),
        OutputTransform::Merge => Ok(Value::Object(merge(&values)?)),
        OutputTransform::Pick { fields } => {
            let mut merged = merge(&values)?;
            merged.retain(|key, _| fields.iter().any(|field| field == key));
            Ok(Value::Object(merged))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_label_from_string_and_object() {
        assert_eq!(extract_label(&json!("invoice")), Some("invoice".to_string()));
        assert_eq!(
            extract_label(&json!({"label": "receipt", "confidence": 0.9})),
            Some("receipt".to_string())
        );
        assert_eq!(extract_label(&json!(42)), None);
        assert_eq!(extract_label(&json!({"kind": "invoice"})), None);
    }

    #[test]
    fn test_validate_input_required_fields() {
        let descriptor = json!({"required": ["document", "pages"]});
        assert!(validate_input(&json!({"document": "x", "pages": 3}), &descriptor).is_ok());
        assert!(matches!(
            validate_input(&json!({"document": "x"}), &descriptor),
            Err(ExecutionErrorKind::InputValidation(message)) if message.contains("pages")
        ));
        assert!(validate_input(&Value::Null, &json!({})).is_err());
    }

    #[test]
    fn test_map_input_construct() {
        let mut context = ExecutionContext::new();
        context.set_artifact(StepId::new("ocr"), json!({"text": "hello", "pages": [1, 2]}));

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("raw".to_string(), MappingSource::Input);
        fields.insert(
            "first_page".to_string(),
            MappingSource::Artifact {
                step: StepId::new("ocr"),
                path: Some("/pages/0".to_string()),
            },
        );

        let mapped = map_input(
            Some(&InputMapping::Construct { fields }),
            &json!("raw-doc"),
            &context,
        )
        .unwrap();
        assert_eq!(mapped, json!({"raw": "raw-doc", "first_page": 1}));
    }

    #[test]
    fn test_map_input_merge_with_artifact() {
        let mut context = ExecutionContext::new();
        context.set_artifact(StepId::new("meta"), json!({"vendor": "acme", "pages": 2}));

        let mapped = map_input(
            Some(&InputMapping::MergeWithArtifact {
                step: StepId::new("meta"),
            }),
            &json!({"document": "x", "pages": 1}),
            &context,
        )
        .unwrap();
        // Artifact keys win on collision
        assert_eq!(mapped, json!({"document": "x", "vendor": "acme", "pages": 2}));
    }

    #[test]
    fn test_apply_transform_pick() {
        let values = vec![json!({"a": 1, "b": 2}), json!({"b": 3, "c": 4})];
        let picked = apply_transform(
            &OutputTransform::Pick {
                fields: vec!["b".to_string(), "c".to_string()],
            },
            values,
        )
        .unwrap();
        assert_eq!(picked, json!({"b": 3, "c": 4}));
    }

    #[test]
    fn test_apply_transform_merge_rejects_non_objects() {
        let result = apply_transform(&OutputTransform::Merge, vec![json!([1, 2])]);
        assert!(matches!(
            result,
            Err(ExecutionErrorKind::OutputTransform(_))
        ));
    }
}
