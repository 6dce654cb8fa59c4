//! Retry, backoff, fallback, and circuit breaking
//!
//! The resilience layer sits between the executor and the providers. Every
//! provider call for a step goes through [`FallbackManager::call_with_fallback`],
//! which walks the step's fallback chain, retries each provider with
//! exponential backoff, and consults the per-provider circuit breakers.

use crate::flow::definition::{ProviderRef, RetryConfig, StepId};
use crate::flow::hooks::{FlowEvent, HookDispatcher, TraceContext};
use crate::flow::provider::{ProviderError, ProviderResponse, ProviderResult};
use dashmap::DashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cap on the backoff exponent; beyond this the ceiling applies anyway
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Maximum random jitter added to each computed delay
const JITTER_MS: u64 = 1000;

/// Retry schedule for one fallback chain, derived from [`RetryConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries per non-primary provider
    pub max_retries: u32,
    /// Retries for the first provider in the chain
    pub primary_max_retries: u32,
    /// Base backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from node configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            primary_max_retries: config.primary_max_retries.unwrap_or(config.max_retries),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Retry budget for the provider at the given chain position
    pub fn retries_for(&self, chain_index: usize) -> u32 {
        if chain_index == 0 {
            self.primary_max_retries
        } else {
            self.max_retries
        }
    }

    /// Delay before the retry following a failed attempt
    ///
    /// Exponential in the attempt number with random jitter, capped at
    /// `max_delay`. A vendor-supplied `Retry-After` overrides the computed
    /// delay but is still capped.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(requested) = retry_after {
            return requested.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        let jitter = Duration::from_millis(rand::random::<u64>() % JITTER_MS);
        backoff.saturating_add(jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a provider's breaker
    pub failure_threshold: u32,
    /// Quiet period after which an open breaker allows one trial call
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-provider breaker state, keyed by `vendor:model`
#[derive(Debug, Clone, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
    opened_at: Option<Instant>,
    trial_granted_at: Option<Instant>,
}

/// Outcome of asking the breaker whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Breaker closed, call freely
    Allow,
    /// Breaker open but the reset timeout elapsed; this is the single trial
    AllowTrial,
    /// Breaker open, skip the provider without an attempt
    Reject,
}

/// Shared circuit breaker state for all providers in a process
///
/// The registry is plain data with no global instance: callers create one
/// and pass it wherever it is needed, so tests get isolated breaker state
/// for free.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, BreakerState>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry with default thresholds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with explicit thresholds
    pub fn with_config(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Ask whether a call to the keyed provider may proceed
    ///
    /// When an open breaker's reset timeout has elapsed, exactly one caller
    /// receives [`BreakerDecision::AllowTrial`]; concurrent callers are
    /// rejected until that trial resolves. A trial whose caller never
    /// reports an outcome (a timed-out child flow abandons its call
    /// mid-flight) expires after another reset timeout, so the breaker
    /// always returns to granting trials.
    pub fn check(&self, key: &str) -> BreakerDecision {
        let mut state = self.breakers.entry(key.to_string()).or_default();
        if !state.open {
            return BreakerDecision::Allow;
        }
        let elapsed = state
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(false);
        let trial_available = state
            .trial_granted_at
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true);
        if elapsed && trial_available {
            state.trial_granted_at = Some(Instant::now());
            BreakerDecision::AllowTrial
        } else {
            BreakerDecision::Reject
        }
    }

    /// Record a successful call; fully resets the keyed breaker
    ///
    /// Returns `true` when this closed a previously open breaker.
    pub fn record_success(&self, key: &str) -> bool {
        let mut state = self.breakers.entry(key.to_string()).or_default();
        let was_open = state.open;
        *state = BreakerState::default();
        was_open
    }

    /// Record a failed call (one exhausted provider, not one attempt)
    ///
    /// Returns `true` when this opened a previously closed breaker. A
    /// failed half-open trial re-opens silently.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut state = self.breakers.entry(key.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.open {
            // Failed trial: restart the quiet period
            state.opened_at = Some(Instant::now());
            state.trial_granted_at = None;
            return false;
        }
        if state.consecutive_failures >= self.config.failure_threshold {
            state.open = true;
            state.opened_at = Some(Instant::now());
            state.trial_granted_at = None;
            return true;
        }
        false
    }

    /// Consecutive failure count for a keyed provider
    pub fn failure_count(&self, key: &str) -> u32 {
        self.breakers
            .get(key)
            .map(|state| state.consecutive_failures)
            .unwrap_or(0)
    }

    /// Whether the keyed provider's breaker is currently open
    pub fn is_open(&self, key: &str) -> bool {
        self.breakers.get(key).map(|state| state.open).unwrap_or(false)
    }
}

/// Why one provider in a chain did not produce a result
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// All attempts failed; carries the last error
    Failed(ProviderError),
    /// The provider was skipped because its breaker was open
    CircuitOpen,
}

/// Record of one provider's participation in an exhausted chain
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    /// Provider reference from the chain
    pub provider: ProviderRef,
    /// Resolved binding key, `vendor:model`
    pub key: String,
    /// Attempts made, zero when the breaker skipped the provider
    pub attempts: u32,
    /// Why the provider did not produce a result
    pub outcome: AttemptOutcome,
}

/// Errors from walking a fallback chain
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The chain has no providers
    #[error("fallback chain is empty")]
    NoProviders,
    /// Every provider in the chain was exhausted or skipped
    #[error("all providers exhausted: {}", format_attempts(.attempts))]
    Exhausted {
        /// Per-provider outcomes in chain order
        attempts: Vec<ProviderAttempt>,
    },
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| match &attempt.outcome {
            AttemptOutcome::Failed(error) => format!(
                "{} ({} attempts): {}",
                attempt.key, attempt.attempts, error
            ),
            AttemptOutcome::CircuitOpen => format!("{} (circuit open)", attempt.key),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a successful fallback call
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    /// The winning provider's response
    pub response: ProviderResponse,
    /// Chain position of the provider that served the call
    pub chain_index: usize,
    /// Resolved binding key of that provider
    pub provider_key: String,
    /// Attempts made against that provider, including the successful one
    pub attempts: u32,
}

/// Walks a fallback chain with retries, backoff, and circuit breaking
pub struct FallbackManager<'a> {
    policy: &'a RetryPolicy,
    breakers: &'a CircuitBreakerRegistry,
    hooks: &'a HookDispatcher,
}

impl<'a> FallbackManager<'a> {
    /// Create a manager over shared retry and breaker state
    pub fn new(
        policy: &'a RetryPolicy,
        breakers: &'a CircuitBreakerRegistry,
        hooks: &'a HookDispatcher,
    ) -> Self {
        Self {
            policy,
            breakers,
            hooks,
        }
    }

    /// Invoke the chain until one provider succeeds
    ///
    /// `chain` pairs each provider reference with its resolved binding key.
    /// `invoke` is called with a chain position and must perform one attempt
    /// against that provider. Providers are tried in order; each gets its
    /// retry budget before the chain advances. Non-retryable errors abandon
    /// the provider immediately. Providers with open breakers are skipped
    /// without an attempt; breaker bookkeeping counts one failure per
    /// exhausted provider, not per attempt.
    pub async fn call_with_fallback<F, Fut>(
        &self,
        trace: &TraceContext,
        step_id: &StepId,
        chain: &[(ProviderRef, String)],
        mut invoke: F,
    ) -> Result<FallbackOutcome, ResilienceError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ProviderResult<ProviderResponse>>,
    {
        if chain.is_empty() {
            return Err(ResilienceError::NoProviders);
        }

        let mut failures: Vec<ProviderAttempt> = Vec::new();

        for (chain_index, (provider, key)) in chain.iter().enumerate() {
            if chain_index > 0 {
                let from_key = failures
                    .last()
                    .map(|attempt| attempt.key.clone())
                    .unwrap_or_default();
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::FallbackTriggered {
                            step_id: step_id.clone(),
                            from_key,
                            to_key: key.clone(),
                        },
                    )
                    .await;
            }

            let decision = self.breakers.check(key);
            if decision == BreakerDecision::Reject {
                tracing::debug!(step_id = %step_id, provider = %key, "skipping provider, circuit open");
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::CircuitRejected {
                            step_id: step_id.clone(),
                            provider_key: key.clone(),
                        },
                    )
                    .await;
                failures.push(ProviderAttempt {
                    provider: provider.clone(),
                    key: key.clone(),
                    attempts: 0,
                    outcome: AttemptOutcome::CircuitOpen,
                });
                continue;
            }

            let budget = self.policy.retries_for(chain_index);
            let mut attempt = 0u32;
            let last_error = loop {
                attempt += 1;
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::ProviderRequested {
                            step_id: step_id.clone(),
                            provider_key: key.clone(),
                            attempt,
                        },
                    )
                    .await;
                let started = Instant::now();
                // A null value is not a valid response; the attempt fails so
                // the chain can retry or advance instead of committing null
                let result = match invoke(chain_index).await {
                    Ok(response) if response.value.is_null() => {
                        Err(ProviderError::new("provider returned a null value"))
                    }
                    other => other,
                };
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::ProviderResponded {
                            step_id: step_id.clone(),
                            provider_key: key.clone(),
                            attempt,
                            success: result.is_ok(),
                            duration: started.elapsed(),
                        },
                    )
                    .await;
                match result {
                    Ok(response) => {
                        if self.breakers.record_success(key) {
                            self.hooks
                                .dispatch(
                                    trace,
                                    FlowEvent::CircuitClosed {
                                        provider_key: key.clone(),
                                    },
                                )
                                .await;
                        }
                        return Ok(FallbackOutcome {
                            response,
                            chain_index,
                            provider_key: key.clone(),
                            attempts: attempt,
                        });
                    }
                    Err(error) => {
                        if !error.is_retryable() || attempt > budget {
                            break error;
                        }
                        let delay = self.policy.delay_for_attempt(attempt, error.retry_after);
                        self.hooks
                            .dispatch(
                                trace,
                                FlowEvent::RetryScheduled {
                                    step_id: step_id.clone(),
                                    provider_key: key.clone(),
                                    attempt,
                                    delay,
                                    error: error.to_string(),
                                },
                            )
                            .await;
                        tracing::debug!(
                            step_id = %step_id,
                            provider = %key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying provider after failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            };

            if self.breakers.record_failure(key) {
                self.hooks
                    .dispatch(
                        trace,
                        FlowEvent::CircuitOpened {
                            provider_key: key.clone(),
                        },
                    )
                    .await;
            }
            failures.push(ProviderAttempt {
                provider: provider.clone(),
                key: key.clone(),
                attempts: attempt,
                outcome: AttemptOutcome::Failed(last_error),
            });
        }

        Err(ResilienceError::Exhausted { attempts: failures })
    }
}
