//! Configuration for a benchmark session.
//!
//! One immutable [`SessionConfig`] is built before any session starts and is
//! shared by reference with the controller and the request executor. Nothing
//! in a session reads process environment variables.
//!
//! ```ignore
//! let config = SessionConfig::new("anthropic/claude-sonnet-4")
//!     .with_budget(Budget::new(128_000, 8_192).with_trigger_threshold(90_000))
//!     .with_strategy(CompactionStrategy::PartialReset { ratio: 0.5, keep_last_tool_call: true })
//!     .with_retries(6);
//! config.validate()?;
//! ```
//!
//! The binary layers an optional TOML file ([`ConfigFile`]) over the
//! defaults, then applies CLI flags on top.

use crate::api::retry::RetryConfig;
use crate::api::tracing::{ModelPricing, pricing_for_model};
use crate::context::budget::{Budget, MEMORY_WARNING_TEXT};
use crate::context::cache::DEFAULT_MAX_BREAKPOINTS;
use crate::context::summarizer::SummarizerConfig;
use crate::{ReasoningConfig, ReasoningEffort, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for optional session features.
///
/// When `enabled` is `false`, the feature is skipped regardless of the
/// inner config values.
#[derive(Debug, Clone)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Feature configs ───────────────────────────────────────────────

/// Prompt-cache breakpoint placement.
#[derive(Debug, Clone)]
pub struct CacheBreakpointConfig {
    /// Provider limit on breakpoints per request.
    pub max_breakpoints: usize,
}

impl Default for CacheBreakpointConfig {
    fn default() -> Self {
        Self {
            max_breakpoints: DEFAULT_MAX_BREAKPOINTS,
        }
    }
}

/// The "persist your state" notice inserted ahead of compaction.
#[derive(Debug, Clone)]
pub struct MemoryWarningConfig {
    /// Fraction of `trigger_threshold` at which the notice is inserted.
    pub ratio: f64,
    pub message: String,
}

impl Default for MemoryWarningConfig {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            message: MEMORY_WARNING_TEXT.to_string(),
        }
    }
}

pub type SessionCacheConfig = Toggle<CacheBreakpointConfig>;
pub type SessionMemoryWarningConfig = Toggle<MemoryWarningConfig>;

// ── Compaction strategy ───────────────────────────────────────────

/// What to do once the conversation passes `trigger_threshold`.
///
/// Exactly one strategy per session. FIFO trim is a separate switch
/// ([`SessionConfig::trim_on_overflow`]) because it guards the hard limit,
/// not the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// Never compact at the trigger.
    #[default]
    None,
    /// Strip the earliest `ratio` of tool-call pairs.
    PartialReset {
        ratio: f64,
        #[serde(default = "default_true")]
        keep_last_tool_call: bool,
    },
    /// Replace the history with a model-written carry-over summary.
    Summarize,
    /// Blank reasoning on all but the newest `keep_thinking` assistant turns.
    ClearReasoning {
        #[serde(default = "default_keep_thinking")]
        keep_thinking: usize,
    },
}

fn default_true() -> bool {
    true
}

fn default_keep_thinking() -> usize {
    1
}

impl CompactionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CompactionStrategy::None => "none",
            CompactionStrategy::PartialReset { .. } => "partial_reset",
            CompactionStrategy::Summarize => "summarize",
            CompactionStrategy::ClearReasoning { .. } => "clear_reasoning",
        }
    }
}

// ── Session config ────────────────────────────────────────────────

/// Everything a session needs to know, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model identifier (e.g. `"anthropic/claude-sonnet-4"`).
    pub model: String,
    /// Context budget. `reserved_output_tokens` doubles as the per-response
    /// `max_tokens`.
    pub budget: Budget,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub reasoning: Option<ReasoningConfig>,
    /// Retry policy for model requests.
    pub retry: RetryConfig,
    /// Compaction applied at the trigger threshold.
    pub strategy: CompactionStrategy,
    /// FIFO trim whenever the request would exceed `available`.
    pub trim_on_overflow: bool,
    /// Summary request settings (used by [`CompactionStrategy::Summarize`]).
    pub summarizer: SummarizerConfig,
    pub cache_breakpoints: SessionCacheConfig,
    pub memory_warning: SessionMemoryWarningConfig,
    /// Model calls before the session is cut off as truncated.
    pub max_turns: u32,
    /// Calibrated characters-per-token for the fallback estimator.
    pub chars_per_token: Option<f64>,
    /// Token rates for cost accounting. `None` uses the built-in table.
    pub pricing: Option<ModelPricing>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            budget: Budget::default(),
            temperature: None,
            top_p: None,
            reasoning: None,
            retry: RetryConfig::default(),
            strategy: CompactionStrategy::None,
            trim_on_overflow: true,
            summarizer: SummarizerConfig::default(),
            cache_breakpoints: SessionCacheConfig::default(),
            memory_warning: SessionMemoryWarningConfig::default(),
            max_turns: 200,
            chars_per_token: None,
            pricing: None,
        }
    }
}

impl SessionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_trim_on_overflow(mut self, trim: bool) -> Self {
        self.trim_on_overflow = trim;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the retry count, keeping the other backoff defaults.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Configured rates, else the built-in estimate for `model`.
    pub fn model_pricing(&self) -> ModelPricing {
        self.pricing
            .clone()
            .unwrap_or_else(|| pricing_for_model(&self.model))
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    /// Per-response token limit sent with each request.
    pub fn max_response_tokens(&self) -> u32 {
        u32::try_from(self.budget.reserved_output_tokens).unwrap_or(u32::MAX)
    }

    /// Reject configurations that cannot run correctly.
    pub fn validate(&self) -> Result<(), SessionError> {
        let fail = |msg: String| Err(SessionError::Config(msg));

        if self.model.trim().is_empty() {
            return fail("model must not be empty".into());
        }
        if self.budget.available() == 0 {
            return fail(format!(
                "reserved_output_tokens ({}) leaves no room in a {}-token window",
                self.budget.reserved_output_tokens, self.budget.max_context_tokens
            ));
        }
        if self.budget.trigger_threshold > self.budget.available() {
            return fail(format!(
                "trigger_threshold ({}) exceeds available tokens ({})",
                self.budget.trigger_threshold,
                self.budget.available()
            ));
        }
        match &self.strategy {
            CompactionStrategy::Summarize if self.trim_on_overflow => {
                return fail(
                    "the summarize strategy cannot be combined with trim_on_overflow".into(),
                );
            }
            CompactionStrategy::PartialReset { ratio, .. } if !(0.0..=1.0).contains(ratio) => {
                return fail(format!("partial_reset ratio {ratio} is outside [0, 1]"));
            }
            _ => {}
        }
        if self.memory_warning.enabled {
            let ratio = self.memory_warning.config.ratio;
            if !(ratio > 0.0 && ratio < 1.0) {
                return fail(format!("memory_warning_ratio {ratio} is outside (0, 1)"));
            }
        }
        if self.max_turns == 0 {
            return fail("max_turns must be at least 1".into());
        }
        if let Some(p) = &self.pricing {
            let valid = |rate: f64| rate.is_finite() && rate >= 0.0;
            if !valid(p.input_per_million) || !valid(p.output_per_million) {
                return fail("pricing rates must be non-negative".into());
            }
        }
        Ok(())
    }
}

// ── TOML file ─────────────────────────────────────────────────────

/// On-disk configuration (`--config bench.toml`). Every field is optional;
/// unset fields keep the value underneath.
///
/// ```toml
/// model = "anthropic/claude-sonnet-4"
/// max_context_tokens = 128000
/// reserved_output_tokens = 8192
/// trigger_threshold = 90000
/// trim_on_overflow = true
/// max_retries = 6
///
/// [strategy]
/// kind = "partial_reset"
/// ratio = 0.5
/// keep_last_tool_call = true
///
/// [pricing]
/// input_per_million = 3.0
/// output_per_million = 15.0
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_context_tokens: Option<usize>,
    pub reserved_output_tokens: Option<usize>,
    pub trigger_threshold: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub strategy: Option<CompactionStrategy>,
    pub trim_on_overflow: Option<bool>,
    pub summary_model: Option<String>,
    pub max_summary_tokens: Option<u32>,
    /// `0` disables cache breakpoints.
    pub cache_breakpoints: Option<usize>,
    /// `0` disables the memory-warning turn.
    pub memory_warning_ratio: Option<f64>,
    pub max_turns: Option<u32>,
    pub chars_per_token: Option<f64>,
    pub workers: Option<usize>,
    pub runs_per_config: Option<usize>,
    /// USD per million tokens, for models the built-in table misprices.
    pub pricing: Option<ModelPricing>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay the fields set in this file onto `base`.
    pub fn apply(&self, mut base: SessionConfig) -> SessionConfig {
        if let Some(model) = &self.model {
            base.model = model.clone();
        }

        let window_changed =
            self.max_context_tokens.is_some() || self.reserved_output_tokens.is_some();
        if window_changed {
            let budget = Budget::new(
                self.max_context_tokens
                    .unwrap_or(base.budget.max_context_tokens),
                self.reserved_output_tokens
                    .unwrap_or(base.budget.reserved_output_tokens),
            );
            base.budget = budget;
        }
        if let Some(trigger) = self.trigger_threshold {
            base.budget.trigger_threshold = trigger;
        }

        if self.temperature.is_some() {
            base.temperature = self.temperature;
        }
        if self.top_p.is_some() {
            base.top_p = self.top_p;
        }
        if let Some(effort) = &self.reasoning_effort {
            base.reasoning = Some(ReasoningConfig {
                effort: Some(effort.clone()),
                max_tokens: None,
            });
        }

        if let Some(n) = self.max_retries {
            base.retry.max_retries = n;
        }
        if let Some(ms) = self.initial_delay_ms {
            base.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            base.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(strategy) = &self.strategy {
            base.strategy = strategy.clone();
        }
        if let Some(trim) = self.trim_on_overflow {
            base.trim_on_overflow = trim;
        }
        if self.summary_model.is_some() {
            base.summarizer.model = self.summary_model.clone();
        }
        if let Some(n) = self.max_summary_tokens {
            base.summarizer.max_summary_tokens = n;
        }

        match self.cache_breakpoints {
            Some(0) => base.cache_breakpoints = SessionCacheConfig::disabled(),
            Some(n) => {
                base.cache_breakpoints =
                    SessionCacheConfig::enabled(CacheBreakpointConfig { max_breakpoints: n })
            }
            None => {}
        }
        match self.memory_warning_ratio {
            Some(r) if r == 0.0 => base.memory_warning = SessionMemoryWarningConfig::disabled(),
            Some(r) => {
                base.memory_warning.enabled = true;
                base.memory_warning.config.ratio = r;
            }
            None => {}
        }

        if let Some(n) = self.max_turns {
            base.max_turns = n;
        }
        if self.chars_per_token.is_some() {
            base.chars_per_token = self.chars_per_token;
        }
        if self.pricing.is_some() {
            base.pricing = self.pricing.clone();
        }
        base
    }
}
