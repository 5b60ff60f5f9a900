//! Session IDs and cost tracking for benchmark runs.
//!
//! Each session attempt gets a unique `session_id` so a resumed run can be
//! told apart from the attempt it replaces. Token usage and estimated cost
//! accumulate in a [`CostTracker`] that is persisted with the run artifact.

use crate::UsageInfo;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique ID for one session attempt.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Use a counter to handle sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("s-{ts:x}-{count:04x}")
}

/// USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const fn per_million(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
        }
    }

    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (f64::from(prompt_tokens) * self.input_per_million
            + f64::from(completion_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::per_million(3.0, 15.0)
    }
}

/// Rough rates for the model families runs are usually compared on, first
/// match wins. Anything else falls back to [`ModelPricing::default`]; set
/// `[pricing]` in the config file for exact numbers.
const KNOWN_RATES: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing::per_million(15.0, 75.0)),
    ("sonnet", ModelPricing::per_million(3.0, 15.0)),
    ("haiku", ModelPricing::per_million(0.8, 4.0)),
    ("gpt-4o-mini", ModelPricing::per_million(0.15, 0.6)),
    ("gpt-4o", ModelPricing::per_million(2.5, 10.0)),
    ("deepseek", ModelPricing::per_million(0.27, 1.1)),
];

/// Look up rates by the model name after the provider prefix, so
/// `"my-org/custom-sonnet"` matches but `"sonnet-labs/foo"` does not.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    KNOWN_RATES
        .iter()
        .find(|(family, _)| name.contains(family))
        .map(|(_, rates)| rates.clone())
        .unwrap_or_default()
}

/// Cumulative token usage and cost for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostTracker {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    /// Prompt tokens served from the provider's prompt cache.
    #[serde(default)]
    pub total_cached_tokens: u64,
    /// Model requests that returned a response (including ones retried).
    #[serde(default)]
    pub requests: u32,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record token usage for one request.
    pub fn record(&mut self, prompt_tokens: u32, completion_tokens: u32, pricing: &ModelPricing) {
        self.requests += 1;
        self.total_prompt_tokens += prompt_tokens as u64;
        self.total_completion_tokens += completion_tokens as u64;
        self.estimated_cost_usd += pricing.estimate_cost(prompt_tokens, completion_tokens);
    }

    /// Record the usage block of a response. A missing block still counts
    /// as a request.
    pub fn record_usage(&mut self, usage: Option<&UsageInfo>, pricing: &ModelPricing) {
        match usage {
            Some(u) => {
                self.record(
                    u.prompt_tokens.unwrap_or(0),
                    u.completion_tokens.unwrap_or(0),
                    pricing,
                );
                self.total_cached_tokens += u.cached_tokens() as u64;
            }
            None => self.record(0, 0, pricing),
        }
    }

    /// Fold another tracker into this one.
    pub fn merge(&mut self, other: &CostTracker) {
        self.total_prompt_tokens += other.total_prompt_tokens;
        self.total_completion_tokens += other.total_completion_tokens;
        self.total_cached_tokens += other.total_cached_tokens;
        self.requests += other.requests;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }

    /// Total tokens consumed.
    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "tokens: {} prompt ({} cached) + {} completion = {} total over {} request(s), est. cost: ${:.4}",
            self.total_prompt_tokens,
            self.total_cached_tokens,
            self.total_completion_tokens,
            self.total_tokens(),
            self.requests,
            self.estimated_cost_usd,
        )
    }
}
