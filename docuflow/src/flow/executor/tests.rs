//! End-to-end executor tests over in-memory providers

use super::*;
use crate::flow::build::build_flow;
use crate::flow::definition::{
    ConsensusConfig, FlowDefinition, FlowId, FlowOrRef, InputMapping, NodeConfig, NodeKind,
    OutputSource, OutputTransform, ProviderRef, RetryConfig, Step, TiePolicy, VotingStrategy,
};
use crate::flow::provider::{
    FlowRegistry, OcrProvider, ProviderError, ProviderRegistry, ProviderResponse, ProviderResult,
    VlmProvider,
};
use crate::flow::resilience::{BreakerConfig, CircuitBreakerRegistry};
use crate::flow::test_helpers::{registry_with, RecordingHooks, ScriptedProvider, StaticProvider};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// OCR provider that rejects inputs equal to "bad"
struct SelectiveProvider {
    key: String,
}

#[async_trait]
impl OcrProvider for SelectiveProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn process(&self, input: Value) -> ProviderResult<ProviderResponse> {
        if input == json!("bad") {
            Err(ProviderError::with_status("unprocessable item", 422))
        } else {
            Ok(ProviderResponse::from_value(json!({"item": input})))
        }
    }
}

/// VLM provider that sleeps before answering
struct SlowProvider {
    key: String,
    delay: Duration,
}

#[async_trait]
impl VlmProvider for SlowProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn extract(
        &self,
        _input: Value,
        _schema: Option<&Value>,
    ) -> ProviderResult<ProviderResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(ProviderResponse::from_value(json!("slow")))
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 1,
        primary_max_retries: None,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

fn standard(id: &str, node: NodeConfig) -> Step {
    Step::Standard {
        id: id.into(),
        node,
    }
}

fn trigger(id: &str, flow_ref: &str) -> Step {
    Step::Trigger {
        id: id.into(),
        flow_ref: FlowId::new(flow_ref),
        provider_overrides: None,
        input_mapping: None,
        merge_metrics: false,
        timeout_ms: None,
    }
}

#[tokio::test]
async fn test_linear_flow_pipelines_artifacts() {
    let providers = registry_with(&[
        ("ocr", NodeKind::Ocr, json!({"text": "hello"})),
        ("extract", NodeKind::Vlm, json!({"total": 42})),
    ]);
    let definition = FlowDefinition::new(vec![
        standard("ocr", NodeConfig::ocr(vec![ProviderRef::new("ocr")])),
        standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("extract")], Some(json!({"type": "object"}))),
        ),
    ]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let executor = FlowExecutor::new();
    let outcome = executor.execute(&executable, json!("raw-doc")).await.unwrap();

    assert_eq!(outcome.result, json!({"total": 42}));
    assert_eq!(
        outcome.context.artifact(&"ocr".into()),
        Some(&json!({"text": "hello"}))
    );
    let step_ids: Vec<_> = outcome
        .context
        .metrics()
        .iter()
        .map(|m| m.step_id.as_str())
        .collect();
    assert_eq!(step_ids, vec!["ocr", "extract"]);
}

#[tokio::test]
async fn test_hooks_observe_run_lifecycle() {
    let providers = registry_with(&[("ocr", NodeKind::Ocr, json!({"text": "x"}))]);
    let definition = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("ocr")]),
    )]);
    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();

    let recording = RecordingHooks::new();
    let mut hooks = crate::flow::hooks::HookDispatcher::new();
    hooks.add_hook(recording.clone());
    let executor = FlowExecutor::new().with_hooks(hooks);

    executor.execute(&executable, json!("doc")).await.unwrap();
    assert_eq!(
        recording.events(),
        vec![
            "flow_started",
            "step_started:ocr",
            "step_completed:ocr",
            "flow_completed"
        ]
    );
}

#[tokio::test]
async fn test_fallback_chain_end_to_end() {
    let mut providers = ProviderRegistry::new();
    providers.register_ocr(
        "a",
        Arc::new(ScriptedProvider::new(
            "vendor:a",
            vec![
                Err(ProviderError::with_status("overloaded", 503)),
                Err(ProviderError::with_status("overloaded", 503)),
            ],
        )),
    );
    providers.register_ocr(
        "b",
        Arc::new(StaticProvider::new("vendor:b", json!({"from": "b"}))),
    );

    let definition = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("a"), ProviderRef::new("b")])
            .with_retry(fast_retry()),
    )]);
    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();

    let breakers = Arc::new(CircuitBreakerRegistry::with_config(BreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(60),
    }));
    let executor = FlowExecutor::new().with_breakers(breakers.clone());
    let outcome = executor.execute(&executable, json!("doc")).await.unwrap();

    assert_eq!(outcome.result, json!({"from": "b"}));
    // A exhausted once: one breaker count, threshold not reached
    assert_eq!(breakers.failure_count("vendor:a"), 1);
    assert!(!breakers.is_open("vendor:a"));
    let metrics = &outcome.context.metrics()[0];
    assert_eq!(metrics.provider_key.as_deref(), Some("vendor:b"));
}

#[tokio::test]
async fn test_non_retryable_failure_skips_retry_budget() {
    let mut providers = ProviderRegistry::new();
    // If the exhausted script were retried, the second entry would win and
    // the result would come from A instead of B
    providers.register_ocr(
        "a",
        Arc::new(ScriptedProvider::new(
            "vendor:a",
            vec![
                Err(ProviderError::with_status("bad request", 422)),
                Ok(ProviderResponse::from_value(json!({"from": "a"}))),
            ],
        )),
    );
    providers.register_ocr(
        "b",
        Arc::new(StaticProvider::new("vendor:b", json!({"from": "b"}))),
    );

    let definition = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("a"), ProviderRef::new("b")]).with_retry(
            RetryConfig {
                max_retries: 3,
                ..fast_retry()
            },
        ),
    )]);
    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();

    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let executor = FlowExecutor::new().with_breakers(breakers.clone());
    let outcome = executor.execute(&executable, json!("doc")).await.unwrap();

    assert_eq!(outcome.result, json!({"from": "b"}));
    assert_eq!(breakers.failure_count("vendor:a"), 1);
}

#[tokio::test]
async fn test_conditional_routes_by_label() {
    let providers = registry_with(&[
        ("classify", NodeKind::Vlm, json!({"label": "invoice", "confidence": 0.93})),
        ("invoice-extract", NodeKind::Vlm, json!({"total": 120})),
        ("receipt-extract", NodeKind::Vlm, json!({"merchant": "acme"})),
    ]);

    let mut branches = BTreeMap::new();
    branches.insert(
        "invoice".to_string(),
        FlowOrRef::Inline(FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("invoice-extract")], None),
        )])),
    );
    branches.insert(
        "receipt".to_string(),
        FlowOrRef::Inline(FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("receipt-extract")], None),
        )])),
    );
    let definition = FlowDefinition::new(vec![Step::Conditional {
        id: "route".into(),
        classifier: NodeConfig::vlm(vec![ProviderRef::new("classify")], None),
        branches,
    }]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let executor = FlowExecutor::new();
    let outcome = executor.execute(&executable, json!("doc")).await.unwrap();

    assert_eq!(outcome.result, json!({"total": 120}));
    // Branch artifacts are namespaced under the conditional's id
    assert_eq!(
        outcome.context.artifact(&"route.extract".into()),
        Some(&json!({"total": 120}))
    );
}

#[tokio::test]
async fn test_conditional_unmapped_label_fails_deterministically() {
    let providers = registry_with(&[
        ("classify", NodeKind::Vlm, json!("contract")),
        ("invoice-extract", NodeKind::Vlm, json!({})),
    ]);
    let mut branches = BTreeMap::new();
    branches.insert(
        "invoice".to_string(),
        FlowOrRef::Inline(FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("invoice-extract")], None),
        )])),
    );
    let definition = FlowDefinition::new(vec![Step::Conditional {
        id: "route".into(),
        classifier: NodeConfig::vlm(vec![ProviderRef::new("classify")], None),
        branches,
    }]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let error = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap_err();

    assert_eq!(error.step_id, Some("route".into()));
    assert!(matches!(
        error.kind,
        ExecutionErrorKind::UnmappedBranch(label) if label == "contract"
    ));
}

#[tokio::test]
async fn test_for_each_isolates_item_failures_in_order() {
    let mut providers = ProviderRegistry::new();
    providers.register_ocr(
        "split",
        Arc::new(StaticProvider::new(
            "test:split",
            json!(["first", "bad", "third"]),
        )),
    );
    providers.register_ocr(
        "item",
        Arc::new(SelectiveProvider {
            key: "test:item".to_string(),
        }),
    );

    let item_flow = FlowOrRef::Inline(FlowDefinition::new(vec![standard(
        "process",
        NodeConfig::ocr(vec![ProviderRef::new("item")]),
    )]));
    let definition = FlowDefinition::new(vec![Step::ForEach {
        id: "pages".into(),
        splitter: NodeConfig::ocr(vec![ProviderRef::new("split")]),
        item_flow,
        concurrency: Some(2),
        min_successes: None,
    }]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let outcome = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap();

    let aggregate = outcome.result.as_array().unwrap();
    assert_eq!(aggregate.len(), 3);
    assert_eq!(aggregate[0]["status"], "success");
    assert_eq!(aggregate[0]["value"], json!({"item": "first"}));
    assert_eq!(aggregate[1]["status"], "failed");
    assert!(aggregate[1]["error"].as_str().unwrap().contains("unprocessable"));
    assert_eq!(aggregate[2]["status"], "success");
    // Every entry carries its own wall time, failures included
    for entry in aggregate {
        assert!(entry["duration_ms"].is_u64());
    }
}

#[tokio::test]
async fn test_for_each_fails_below_min_successes() {
    let mut providers = ProviderRegistry::new();
    providers.register_ocr(
        "split",
        Arc::new(StaticProvider::new("test:split", json!(["bad", "bad", "ok"]))),
    );
    providers.register_ocr(
        "item",
        Arc::new(SelectiveProvider {
            key: "test:item".to_string(),
        }),
    );

    let definition = FlowDefinition::new(vec![Step::ForEach {
        id: "pages".into(),
        splitter: NodeConfig::ocr(vec![ProviderRef::new("split")]),
        item_flow: FlowOrRef::Inline(FlowDefinition::new(vec![standard(
            "process",
            NodeConfig::ocr(vec![ProviderRef::new("item")]),
        )])),
        concurrency: None,
        min_successes: Some(2),
    }]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let error = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap_err();

    assert!(matches!(
        error.kind,
        ExecutionErrorKind::BatchBelowThreshold {
            succeeded: 1,
            items: 3,
            required: 2,
        }
    ));
}

#[tokio::test]
async fn test_trigger_maps_input_and_merges_metrics() {
    let providers = registry_with(&[
        ("ocr", NodeKind::Ocr, json!({"text": "hello", "pages": 2})),
        ("extract", NodeKind::Vlm, json!({"total": 7})),
    ]);
    let mut flows = FlowRegistry::new();
    flows.register(
        "enrichment",
        FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("extract")], None),
        )]),
    );

    let definition = FlowDefinition::new(vec![
        standard("ocr", NodeConfig::ocr(vec![ProviderRef::new("ocr")])),
        Step::Trigger {
            id: "enrich".into(),
            flow_ref: FlowId::new("enrichment"),
            provider_overrides: None,
            input_mapping: Some(InputMapping::FromArtifact {
                step: "ocr".into(),
                path: Some("/text".to_string()),
            }),
            merge_metrics: true,
            timeout_ms: None,
        },
    ]);

    let executable = build_flow(&definition, &providers, &flows).unwrap();
    let outcome = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap();

    assert_eq!(outcome.result, json!({"total": 7}));
    let step_ids: Vec<_> = outcome
        .context
        .metrics()
        .iter()
        .map(|m| m.step_id.as_str())
        .collect();
    // Child metrics merged ahead of the trigger's own row
    assert_eq!(step_ids, vec!["ocr", "extract", "enrich"]);
    // Usage is counted once: the merged child row carries it, the trigger row is zeroed
    assert_eq!(outcome.context.total_tokens_in(), 20);
}

#[tokio::test]
async fn test_trigger_provider_override_redirects_binding() {
    let providers = registry_with(&[
        ("vlm-a", NodeKind::Vlm, json!({"from": "a"})),
        ("vlm-b", NodeKind::Vlm, json!({"from": "b"})),
    ]);
    let mut flows = FlowRegistry::new();
    flows.register(
        "child",
        FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("vlm-a")], None),
        )]),
    );

    let mut overrides = BTreeMap::new();
    overrides.insert(ProviderRef::new("vlm-a"), ProviderRef::new("vlm-b"));
    let definition = FlowDefinition::new(vec![Step::Trigger {
        id: "run-child".into(),
        flow_ref: FlowId::new("child"),
        provider_overrides: Some(overrides),
        input_mapping: None,
        merge_metrics: false,
        timeout_ms: None,
    }]);

    let executable = build_flow(&definition, &providers, &flows).unwrap();
    let outcome = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap();
    assert_eq!(outcome.result, json!({"from": "b"}));
}

#[tokio::test]
async fn test_trigger_timeout() {
    let mut providers = ProviderRegistry::new();
    providers.register_vlm(
        "slow",
        Arc::new(SlowProvider {
            key: "test:slow".to_string(),
            delay: Duration::from_millis(200),
        }),
    );
    let mut flows = FlowRegistry::new();
    flows.register(
        "slow-child",
        FlowDefinition::new(vec![standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("slow")], None),
        )]),
    );

    let definition = FlowDefinition::new(vec![Step::Trigger {
        id: "deadline".into(),
        flow_ref: FlowId::new("slow-child"),
        provider_overrides: None,
        input_mapping: None,
        merge_metrics: false,
        timeout_ms: Some(10),
    }]);

    let executable = build_flow(&definition, &providers, &flows).unwrap();
    let error = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap_err();

    assert_eq!(error.step_id, Some("deadline".into()));
    assert!(matches!(error.kind, ExecutionErrorKind::Timeout(_)));
}

#[tokio::test]
async fn test_consensus_majority_end_to_end() {
    let mut providers = ProviderRegistry::new();
    providers.register_vlm(
        "extract",
        Arc::new(ScriptedProvider::new(
            "vendor:extract",
            vec![
                Ok(ProviderResponse::from_value(json!({"total": 10}))),
                Ok(ProviderResponse::from_value(json!({"total": 10}))),
                Ok(ProviderResponse::from_value(json!({"total": 99}))),
            ],
        )),
    );

    let definition = FlowDefinition::new(vec![standard(
        "extract",
        NodeConfig::vlm(vec![ProviderRef::new("extract")], None).with_consensus(
            ConsensusConfig {
                runs: 3,
                strategy: VotingStrategy::Majority,
                on_tie: TiePolicy::Fail,
            },
        ),
    )]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let outcome = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap();

    assert_eq!(outcome.result, json!({"total": 10}));
    let metrics = &outcome.context.metrics()[0];
    let agreement = metrics.consensus_agreement.unwrap();
    assert!((agreement - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_output_step_ends_flow_early() {
    let mut providers = registry_with(&[
        ("ocr", NodeKind::Ocr, json!({"text": "hi", "pages": 1})),
        ("extract", NodeKind::Vlm, json!({"total": 3, "vendor": "acme"})),
    ]);
    let never_called = Arc::new(ScriptedProvider::new("test:never", vec![]));
    providers.register_ocr("never", never_called);

    let definition = FlowDefinition::new(vec![
        standard("ocr", NodeConfig::ocr(vec![ProviderRef::new("ocr")])),
        standard(
            "extract",
            NodeConfig::vlm(vec![ProviderRef::new("extract")], None),
        ),
        Step::Output {
            id: "result".into(),
            name: Some("document".to_string()),
            source: OutputSource::Many(vec!["ocr".into(), "extract".into()]),
            transform: OutputTransform::Pick {
                fields: vec!["text".to_string(), "total".to_string()],
            },
        },
        standard("unreached", NodeConfig::ocr(vec![ProviderRef::new("never")])),
    ]);

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let outcome = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap();

    assert_eq!(outcome.result, json!({"text": "hi", "total": 3}));
    // The step after the output never ran
    assert!(outcome.context.artifact(&"unreached".into()).is_none());
}

#[tokio::test]
async fn test_input_validation_rejects_bad_input() {
    let providers = registry_with(&[("ocr", NodeKind::Ocr, json!({}))]);
    let definition = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("ocr")]),
    )])
    .with_input_validation(json!({"required": ["document"]}));

    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();
    let executor = FlowExecutor::new();

    let error = executor
        .execute(&executable, json!({"other": 1}))
        .await
        .unwrap_err();
    assert!(matches!(error.kind, ExecutionErrorKind::InputValidation(_)));

    executor
        .execute(&executable, json!({"document": "x"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_self_referencing_flow_hits_depth_bound() {
    let providers = ProviderRegistry::new();
    let mut flows = FlowRegistry::new();
    flows.register(
        "loop",
        FlowDefinition::new(vec![trigger("again", "loop")]),
    );
    let definition = FlowDefinition::new(vec![trigger("start", "loop")]);

    let executable = build_flow(&definition, &providers, &flows).unwrap();
    let error = FlowExecutor::new()
        .execute(&executable, json!("doc"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("nesting exceeded"));
}

#[tokio::test]
async fn test_failing_hook_never_fails_the_flow() {
    struct BrokenHook;

    #[async_trait]
    impl crate::flow::hooks::ExecutionHooks for BrokenHook {
        async fn on_flow_started(
            &self,
            _trace: &crate::flow::hooks::TraceContext,
            _input: &Value,
        ) -> crate::flow::hooks::HookResult {
            Err(crate::flow::hooks::HookError::new("sink down"))
        }

        async fn on_step_completed(
            &self,
            _trace: &crate::flow::hooks::TraceContext,
            _step_id: &crate::flow::definition::StepId,
            _metrics: &crate::flow::context::StepMetrics,
        ) -> crate::flow::hooks::HookResult {
            panic!("hook bug");
        }
    }

    let providers = registry_with(&[("ocr", NodeKind::Ocr, json!({"text": "x"}))]);
    let definition = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("ocr")]),
    )]);
    let executable = build_flow(&definition, &providers, &FlowRegistry::new()).unwrap();

    let mut hooks = crate::flow::hooks::HookDispatcher::new();
    hooks.add_hook(Arc::new(BrokenHook));
    let executor = FlowExecutor::new().with_hooks(hooks);

    let outcome = executor.execute(&executable, json!("doc")).await.unwrap();
    assert_eq!(outcome.result, json!({"text": "x"}));
}

#[tokio::test]
async fn test_run_metrics_history_records_outcomes() {
    let providers = registry_with(&[("ocr", NodeKind::Ocr, json!({"text": "x"}))]);
    let ok_flow = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("ocr")]),
    )]);
    let bad_flow = FlowDefinition::new(vec![standard(
        "ocr",
        NodeConfig::ocr(vec![ProviderRef::new("ocr")]),
    )])
    .with_input_validation(json!({"required": ["document"]}));

    let ok_exec = build_flow(&ok_flow, &providers, &FlowRegistry::new()).unwrap();
    let bad_exec = build_flow(&bad_flow, &providers, &FlowRegistry::new()).unwrap();

    let executor = FlowExecutor::new();
    let outcome = executor.execute(&ok_exec, json!("doc")).await.unwrap();
    let _ = executor.execute(&bad_exec, json!("doc")).await;

    let summary = executor.metrics_summary();
    assert_eq!(summary.runs, 2);
    assert_eq!(summary.successful_runs, 1);

    let run = executor.run_metrics(&outcome.run_id()).unwrap();
    assert!(run.success);
    assert_eq!(run.steps, 1);
}
