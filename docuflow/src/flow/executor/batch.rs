//! For-each fan-out
//!
//! The splitter partitions the step input into items; the item flow runs
//! once per item on a bounded worker pool. Item failures are isolated into
//! the aggregate rather than failing the step, and aggregate order follows
//! input order regardless of completion order.

use super::core::StepOutcome;
use super::{ExecutionError, ExecutionErrorKind, ExecutionResult, FlowExecutor};
use crate::flow::build::{CompiledNode, ExecutableFlow, FlowIndex};
use crate::flow::context::ExecutionContext;
use crate::flow::definition::{ProviderRef, StepId};
use crate::flow::hooks::{FlowEvent, TraceContext};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;

impl FlowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn run_for_each(
        &self,
        executable: &ExecutableFlow,
        step_id: &StepId,
        splitter: &CompiledNode,
        item_flow: FlowIndex,
        concurrency: usize,
        min_successes: usize,
        input: &Value,
        trace: &TraceContext,
        overrides: &HashMap<ProviderRef, ProviderRef>,
        depth: usize,
    ) -> ExecutionResult<StepOutcome> {
        let (split_value, mut usage) = self
            .run_node(executable, splitter, step_id, input, trace, overrides)
            .await
            .map_err(|kind| ExecutionError::at(step_id, kind))?;
        let items = match split_value {
            Value::Array(items) => items,
            _ => return Err(ExecutionError::at(step_id, ExecutionErrorKind::InvalidSplit)),
        };

        self.hooks
            .dispatch(
                trace,
                FlowEvent::BatchStarted {
                    step_id: step_id.clone(),
                    items: items.len(),
                },
            )
            .await;

        let total = items.len();
        let mut completed = stream::iter(items.into_iter().enumerate().map(|(index, item)| {
            async move {
                let mut child = ExecutionContext::new();
                let started = Instant::now();
                let result = self
                    .execute_flow(
                        executable,
                        item_flow,
                        item,
                        &mut child,
                        trace,
                        overrides,
                        depth + 1,
                    )
                    .await;
                let duration = started.elapsed();
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::BatchItemCompleted {
                            step_id: step_id.clone(),
                            index,
                            success: result.is_ok(),
                            duration,
                        },
                    )
                    .await;
                (index, result, duration, child)
            }
        }))
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
        completed.sort_by_key(|(index, _, _, _)| *index);

        let mut aggregate = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        for (_, result, duration, child) in completed {
            usage.tokens_in += child.total_tokens_in();
            usage.tokens_out += child.total_tokens_out();
            usage.cost_usd += child.total_cost_usd();
            let duration_ms = duration.as_millis() as u64;
            match result {
                Ok(value) => {
                    succeeded += 1;
                    aggregate.push(json!({
                        "status": "success",
                        "value": value,
                        "duration_ms": duration_ms,
                    }));
                }
                Err(error) => {
                    tracing::debug!(step_id = %step_id, error = %error, "batch item failed");
                    aggregate.push(json!({
                        "status": "failed",
                        "error": error.to_string(),
                        "duration_ms": duration_ms,
                    }));
                }
            }
        }

        self.hooks
            .dispatch(
                trace,
                FlowEvent::BatchCompleted {
                    step_id: step_id.clone(),
                    succeeded,
                    failed: total - succeeded,
                },
            )
            .await;

        // An empty split is a successful no-op, not a threshold failure
        if total > 0 && succeeded < min_successes {
            return Err(ExecutionError::at(
                step_id,
                ExecutionErrorKind::BatchBelowThreshold {
                    succeeded,
                    items: total,
                    required: min_successes,
                },
            ));
        }

        Ok(StepOutcome {
            artifact: Value::Array(aggregate),
            usage,
            finished: false,
        })
    }
}
