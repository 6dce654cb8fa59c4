//! Shared fixtures for flow tests

use crate::flow::context::StepMetrics;
use crate::flow::definition::{NodeKind, StepId};
use crate::flow::hooks::{ExecutionHooks, HookResult, TraceContext};
use crate::flow::provider::{
    OcrProvider, ProviderError, ProviderRegistry, ProviderResponse, ProviderResult, VlmProvider,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider that always returns the same value
pub struct StaticProvider {
    key: String,
    value: Value,
}

impl StaticProvider {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[async_trait]
impl OcrProvider for StaticProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn process(&self, _input: Value) -> ProviderResult<ProviderResponse> {
        Ok(ProviderResponse {
            value: self.value.clone(),
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: 0.001,
        })
    }
}

#[async_trait]
impl VlmProvider for StaticProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn extract(
        &self,
        _input: Value,
        _schema: Option<&Value>,
    ) -> ProviderResult<ProviderResponse> {
        Ok(ProviderResponse {
            value: self.value.clone(),
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: 0.001,
        })
    }
}

/// Provider that replays a scripted sequence of results, then errors
pub struct ScriptedProvider {
    key: String,
    script: Mutex<VecDeque<ProviderResult<ProviderResponse>>>,
}

impl ScriptedProvider {
    pub fn new(
        key: impl Into<String>,
        script: impl IntoIterator<Item = ProviderResult<ProviderResponse>>,
    ) -> Self {
        Self {
            key: key.into(),
            script: Mutex::new(script.into_iter().collect()),
        }
    }

    fn next(&self) -> ProviderResult<ProviderResponse> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::new("script exhausted")))
    }
}

#[async_trait]
impl OcrProvider for ScriptedProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn process(&self, _input: Value) -> ProviderResult<ProviderResponse> {
        self.next()
    }
}

#[async_trait]
impl VlmProvider for ScriptedProvider {
    fn key(&self) -> &str {
        &self.key
    }

    async fn extract(
        &self,
        _input: Value,
        _schema: Option<&Value>,
    ) -> ProviderResult<ProviderResponse> {
        self.next()
    }
}

/// Hook that records event names in arrival order
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

#[async_trait]
impl ExecutionHooks for RecordingHooks {
    async fn on_flow_started(&self, _trace: &TraceContext, _input: &Value) -> HookResult {
        self.record("flow_started");
        Ok(())
    }

    async fn on_flow_completed(&self, _trace: &TraceContext, _result: &Value) -> HookResult {
        self.record("flow_completed");
        Ok(())
    }

    async fn on_flow_failed(&self, _trace: &TraceContext, _error: &str) -> HookResult {
        self.record("flow_failed");
        Ok(())
    }

    async fn on_step_started(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        _kind: &str,
    ) -> HookResult {
        self.record(&format!("step_started:{step_id}"));
        Ok(())
    }

    async fn on_step_completed(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        _metrics: &StepMetrics,
    ) -> HookResult {
        self.record(&format!("step_completed:{step_id}"));
        Ok(())
    }

    async fn on_step_failed(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        _error: &str,
    ) -> HookResult {
        self.record(&format!("step_failed:{step_id}"));
        Ok(())
    }

    async fn on_fallback(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        from_key: &str,
        to_key: &str,
    ) -> HookResult {
        self.record(&format!("fallback:{from_key}->{to_key}"));
        Ok(())
    }

    async fn on_circuit_rejected(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        provider_key: &str,
    ) -> HookResult {
        self.record(&format!("circuit_rejected:{provider_key}"));
        Ok(())
    }

    async fn on_circuit_opened(&self, _trace: &TraceContext, provider_key: &str) -> HookResult {
        self.record(&format!("circuit_opened:{provider_key}"));
        Ok(())
    }

    async fn on_consensus_resolved(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        _agreement: f64,
        _successes: u32,
        _runs: u32,
    ) -> HookResult {
        self.record(&format!("consensus_resolved:{step_id}"));
        Ok(())
    }

    async fn on_batch_started(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        items: usize,
    ) -> HookResult {
        self.record(&format!("batch_started:{step_id}:{items}"));
        Ok(())
    }

    async fn on_batch_item_completed(
        &self,
        _trace: &TraceContext,
        _step_id: &StepId,
        index: usize,
        success: bool,
        _duration: Duration,
    ) -> HookResult {
        self.record(&format!("batch_item:{index}:{success}"));
        Ok(())
    }

    async fn on_batch_completed(
        &self,
        _trace: &TraceContext,
        step_id: &StepId,
        succeeded: usize,
        failed: usize,
    ) -> HookResult {
        self.record(&format!("batch_completed:{step_id}:{succeeded}:{failed}"));
        Ok(())
    }
}

/// Build a registry of [`StaticProvider`]s from `(name, kind, value)` entries
///
/// Each binding's key is `test:{name}`.
pub fn registry_with(entries: &[(&str, NodeKind, Value)]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for (name, kind, value) in entries {
        let provider = Arc::new(StaticProvider::new(format!("test:{name}"), value.clone()));
        match kind {
            NodeKind::Ocr => registry.register_ocr(*name, provider as Arc<dyn OcrProvider>),
            NodeKind::Vlm => registry.register_vlm(*name, provider as Arc<dyn VlmProvider>),
        }
    }
    registry
}
