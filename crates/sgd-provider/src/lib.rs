// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy-routed provider client: per-task model routing with ordered
//! fallbacks, retry with jittered backoff, per-task timeout and cost cap,
//! and a named circuit breaker (`provider:<task>`) per task.

mod http;

pub use http::{ModelEndpoint, openrouter_style_invoke};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sgd_breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTask {
    Planner,
    Critic,
    Image,
    Canon,
}

impl ProviderTask {
    fn label(self) -> &'static str {
        match self {
            ProviderTask::Planner => "planner",
            ProviderTask::Critic => "critic",
            ProviderTask::Image => "image",
            ProviderTask::Canon => "canon",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub primary: String,
    pub fallbacks: Vec<String>,
    pub timeout: Duration,
    pub max_cost_usd: Option<f64>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ProviderPolicy {
    pub tasks: HashMap<ProviderTask, TaskPolicy>,
}

impl ProviderPolicy {
    pub fn get(&self, task: ProviderTask) -> Option<&TaskPolicy> {
        self.tasks.get(&task)
    }
}

/// Per-1k-token rate table, flat-rate fallback for image tasks without
/// token-based pricing. Mirrors the original's static model cost map.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
    pub flat_per_call: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct RateTable(HashMap<String, ModelRates>);

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, rates: ModelRates) {
        self.0.insert(model.into(), rates);
    }

    /// Default fallback when a model has no explicit entry: a conservative
    /// token-based rate, matching the original's unknown-model fallback.
    fn rates_for(&self, model: &str) -> ModelRates {
        self.0.get(model).cloned().unwrap_or(ModelRates {
            prompt_per_1k: 0.01,
            completion_per_1k: 0.03,
            flat_per_call: None,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderResponse {
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: ProviderUsage,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub task: ProviderTask,
    pub model: String,
    pub attempt: u32,
    pub latency: Duration,
    pub cost_usd: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider task {task:?} exhausted all models, last cause: {last_cause}")]
    Exhausted { task: ProviderTask, last_cause: String },
    #[error("no policy configured for task {0:?}")]
    NoPolicy(ProviderTask),
    #[error("cost cap exceeded: {cost_usd} > {max_cost_usd}")]
    CostCapExceeded { cost_usd: f64, max_cost_usd: f64 },
    #[error("transport error: {0}")]
    Transport(String),
}

fn cost_from_response(response: &ProviderResponse, rates: &ModelRates) -> f64 {
    if let Some(cost) = response.cost_usd {
        return cost;
    }
    if let Some(flat) = rates.flat_per_call {
        return flat;
    }
    let prompt_cost = (response.usage.prompt_tokens as f64 / 1000.0) * rates.prompt_per_1k;
    let completion_cost = (response.usage.completion_tokens as f64 / 1000.0) * rates.completion_per_1k;
    prompt_cost + completion_cost
}

fn jittered_backoff(backoff_ms: u64, attempt: u32) -> Duration {
    let base = backoff_ms.saturating_mul(u64::from(attempt));
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    let jitter = nanos % backoff_ms.max(1);
    Duration::from_millis(base + jitter)
}

/// Invoked once per attempt with the resolved model name and the call's
/// payload (prompt/instruction/parameters, task-shaped); returns the raw
/// provider response or a transport-level error string.
pub type InvokeFn = Arc<dyn Fn(String, ProviderTask, serde_json::Value) -> ProviderInvocation + Send + Sync>;
pub type ProviderInvocation =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<ProviderResponse, String>> + Send>>;

pub struct ProviderClient {
    policy: ProviderPolicy,
    rates: RateTable,
    breakers: HashMap<ProviderTask, CircuitBreaker>,
    invoke: InvokeFn,
}

impl ProviderClient {
    pub fn new(policy: ProviderPolicy, rates: RateTable, invoke: InvokeFn) -> Self {
        let breakers = [
            ProviderTask::Planner,
            ProviderTask::Critic,
            ProviderTask::Image,
            ProviderTask::Canon,
        ]
        .into_iter()
        .map(|task| {
            (
                task,
                CircuitBreaker::new(format!("provider:{}", task.label()), BreakerConfig::default()),
            )
        })
        .collect();

        ProviderClient {
            policy,
            rates,
            breakers,
            invoke,
        }
    }

    pub fn breaker_for(&self, task: ProviderTask) -> Option<&CircuitBreaker> {
        self.breakers.get(&task)
    }

    /// Execute `task` with `payload`, routing through the primary model then
    /// fallbacks in order, retrying each model per its policy before moving
    /// on. `payload` is passed unchanged to every attempt across every model.
    pub async fn execute(
        &self,
        task: ProviderTask,
        payload: serde_json::Value,
    ) -> Result<(ProviderResponse, LlmCallRecord), ProviderError> {
        let policy = self
            .policy
            .get(task)
            .ok_or(ProviderError::NoPolicy(task))?
            .clone();
        let breaker = self.breakers.get(&task).expect("breaker initialized for every task");

        let models: Vec<&String> = std::iter::once(&policy.primary).chain(policy.fallbacks.iter()).collect();
        let mut last_cause = String::new();

        for model in models {
            let rates = self.rates.rates_for(model);

            for attempt in 1..=policy.retry.max_attempts {
                let started = std::time::Instant::now();
                let model_name = model.clone();
                let invoke = self.invoke.clone();
                let call_payload = payload.clone();

                let call_result = breaker
                    .call(
                        || async move {
                            tokio::time::timeout(policy.timeout, invoke(model_name, task, call_payload))
                                .await
                                .map_err(|_| "provider call timed out".to_string())?
                        },
                        |_e: &String| false,
                    )
                    .await;

                match call_result {
                    Ok(response) => {
                        let cost_usd = cost_from_response(&response, &rates);
                        if let Some(max_cost) = policy.max_cost_usd
                            && cost_usd > max_cost
                        {
                            last_cause = format!("cost cap exceeded for model {model}: {cost_usd} > {max_cost}");
                            tracing::warn!(task = task.label(), model, cost_usd, max_cost, "cost cap exceeded, treating as failure");
                        } else {
                            let record = LlmCallRecord {
                                task,
                                model: model.clone(),
                                attempt,
                                latency: started.elapsed(),
                                cost_usd,
                                prompt_tokens: response.usage.prompt_tokens,
                                completion_tokens: response.usage.completion_tokens,
                            };
                            return Ok((response, record));
                        }
                    }
                    Err(BreakerError::Open { name }) => {
                        last_cause = format!("breaker {name} open");
                        break;
                    }
                    Err(BreakerError::Inner(e)) => {
                        last_cause = e;
                    }
                }

                if attempt < policy.retry.max_attempts {
                    tokio::time::sleep(jittered_backoff(policy.retry.backoff_ms, attempt)).await;
                }
            }
        }

        Err(ProviderError::Exhausted { task, last_cause })
    }
}
