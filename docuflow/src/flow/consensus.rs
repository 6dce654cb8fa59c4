//! Consensus execution: run a node several times and vote on the result
//!
//! Runs execute concurrently and are attributed by run index, so outcome
//! order never depends on completion order. Values are grouped by
//! whole-value equality over their canonical JSON rendering.

use crate::flow::definition::{ConsensusConfig, StepId, TiePolicy, VotingStrategy};
use crate::flow::hooks::{FlowEvent, HookDispatcher, TraceContext};
use crate::flow::provider::{ProviderError, ProviderResponse, ProviderResult};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;

/// Outcome of one run inside a consensus round
#[derive(Debug, Clone)]
pub struct ConsensusRun {
    /// Run position, stable across completion order
    pub index: u32,
    /// The run's result, or the provider error that ended it
    pub result: Result<ProviderResponse, ProviderError>,
}

/// A resolved consensus round
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    /// The winning value
    pub agreed: Value,
    /// Runs agreeing with the winner over total runs executed
    pub agreement: f64,
    /// Every run's outcome, in run-index order
    pub runs: Vec<ConsensusRun>,
}

impl ConsensusOutcome {
    /// Number of runs that completed successfully
    pub fn successes(&self) -> u32 {
        self.runs.iter().filter(|run| run.result.is_ok()).count() as u32
    }

    /// Aggregate usage across every run, including losing and failed ones
    pub fn total_usage(&self) -> (u64, u64, f64) {
        self.runs
            .iter()
            .filter_map(|run| run.result.as_ref().ok())
            .fold((0, 0, 0.0), |(tin, tout, cost), response| {
                (
                    tin + response.tokens_in,
                    tout + response.tokens_out,
                    cost + response.cost_usd,
                )
            })
    }
}

/// Errors from a consensus round
#[derive(Debug, Clone, Error)]
pub enum ConsensusError {
    /// Consensus requires at least one run
    #[error("consensus requires at least one run")]
    ZeroRuns,
    /// Every run failed; carries the last error
    #[error("all {runs} consensus runs failed: {last_error}")]
    AllRunsFailed {
        /// Total runs executed
        runs: u32,
        /// The last run's error
        last_error: ProviderError,
    },
    /// No value met the voting threshold and the tie policy was `Fail`,
    /// or a tie persisted after the single `Retry` run
    #[error("no consensus among {successes} successful runs ({leaders} values tied at {votes} votes)")]
    Unresolved {
        /// Successful runs in the round
        successes: u32,
        /// Number of values tied for the lead
        leaders: usize,
        /// Votes held by each leading value
        votes: u32,
    },
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Execute `config.runs` concurrent runs of a node and vote on the results
///
/// `invoke` is called once per run with the run index and must perform a
/// full node invocation, fallback chain included. Individual run failures
/// are tolerated as long as voting can still resolve; agreement is always
/// measured against the total number of runs, so failed runs drag it down.
pub async fn run_consensus<F, Fut>(
    hooks: &HookDispatcher,
    trace: &TraceContext,
    step_id: &StepId,
    config: &ConsensusConfig,
    mut invoke: F,
) -> ConsensusResult<ConsensusOutcome>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderResult<ProviderResponse>>,
{
    if config.runs == 0 {
        return Err(ConsensusError::ZeroRuns);
    }

    hooks
        .dispatch(
            trace,
            FlowEvent::ConsensusStarted {
                step_id: step_id.clone(),
                runs: config.runs,
            },
        )
        .await;

    let mut runs = execute_round(hooks, trace, step_id, 0..config.runs, &mut invoke).await;
    let mut resolution = resolve(&runs, config.strategy);

    if let Resolution::Tied { .. } = resolution {
        if config.on_tie == TiePolicy::Retry {
            // One extra run, one re-vote; ties never recurse
            let extra =
                execute_round(hooks, trace, step_id, config.runs..config.runs + 1, &mut invoke)
                    .await;
            runs.extend(extra);
            resolution = resolve(&runs, config.strategy);
        }
    }

    let total = runs.len() as u32;
    let outcome = match resolution {
        Resolution::Decided { value, votes } => ConsensusOutcome {
            agreed: value,
            agreement: f64::from(votes) / f64::from(total),
            runs,
        },
        Resolution::Tied { leaders, votes } => match config.on_tie {
            TiePolicy::Random => {
                let pick = rand::thread_rng().gen_range(0..leaders.len());
                ConsensusOutcome {
                    agreed: leaders[pick].clone(),
                    agreement: f64::from(votes) / f64::from(total),
                    runs,
                }
            }
            TiePolicy::Fail | TiePolicy::Retry => {
                return Err(ConsensusError::Unresolved {
                    successes: runs.iter().filter(|run| run.result.is_ok()).count() as u32,
                    leaders: leaders.len(),
                    votes,
                });
            }
        },
        Resolution::AllFailed { last_error } => {
            return Err(ConsensusError::AllRunsFailed {
                runs: total,
                last_error,
            });
        }
    };

    hooks
        .dispatch(
            trace,
            FlowEvent::ConsensusResolved {
                step_id: step_id.clone(),
                agreement: outcome.agreement,
                successes: outcome.successes(),
                runs: total,
            },
        )
        .await;

    Ok(outcome)
}

/// Run the given indexes concurrently, returning outcomes in index order
async fn execute_round<F, Fut>(
    hooks: &HookDispatcher,
    trace: &TraceContext,
    step_id: &StepId,
    indexes: std::ops::Range<u32>,
    invoke: &mut F,
) -> Vec<ConsensusRun>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderResult<ProviderResponse>>,
{
    let mut pending = FuturesUnordered::new();
    for index in indexes {
        let future = invoke(index);
        pending.push(async move {
            ConsensusRun {
                index,
                result: future.await,
            }
        });
    }

    let mut runs: Vec<ConsensusRun> = Vec::with_capacity(pending.len());
    while let Some(run) = pending.next().await {
        hooks
            .dispatch(
                trace,
                FlowEvent::ConsensusRunCompleted {
                    step_id: step_id.clone(),
                    run: run.index,
                    success: run.result.is_ok(),
                },
            )
            .await;
        runs.push(run);
    }
    runs.sort_by_key(|run| run.index);
    runs
}

enum Resolution {
    Decided { value: Value, votes: u32 },
    Tied { leaders: Vec<Value>, votes: u32 },
    AllFailed { last_error: ProviderError },
}

/// Group successful runs by canonical JSON and apply the voting strategy
fn resolve(runs: &[ConsensusRun], strategy: VotingStrategy) -> Resolution {
    let mut groups: HashMap<String, (Value, u32)> = HashMap::new();
    let mut successes = 0u32;
    let mut last_error: Option<&ProviderError> = None;

    for run in runs {
        match &run.result {
            Ok(response) => {
                successes += 1;
                // serde_json renders object keys sorted, so equal values
                // always produce the same string
                let key = response.value.to_string();
                groups
                    .entry(key)
                    .or_insert_with(|| (response.value.clone(), 0))
                    .1 += 1;
            }
            Err(error) => last_error = Some(error),
        }
    }

    if successes == 0 {
        let last_error = last_error
            .cloned()
            .unwrap_or_else(|| ProviderError::new("no runs executed"));
        return Resolution::AllFailed { last_error };
    }

    let top_votes = groups.values().map(|(_, votes)| *votes).max().unwrap_or(0);
    let mut leaders: Vec<Value> = groups
        .into_values()
        .filter(|(_, votes)| *votes == top_votes)
        .map(|(value, _)| value)
        .collect();

    let decided = match strategy {
        // Strictly more than half the successful runs
        VotingStrategy::Majority => leaders.len() == 1 && top_votes * 2 > successes,
        VotingStrategy::Unanimous => leaders.len() == 1 && top_votes == successes,
    };

    if decided {
        let value = leaders.swap_remove(0);
        Resolution::Decided {
            value,
            votes: top_votes,
        }
    } else {
        Resolution::Tied {
            leaders,
            votes: top_votes,
        }
    }
}
