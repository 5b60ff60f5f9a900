//! Context budget: how many tokens a session may put on the wire, and where
//! shrinking starts.

use serde::{Deserialize, Serialize};

/// Default context window size in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

/// Default tokens reserved for the model's response.
pub const DEFAULT_OUTPUT_RESERVE: usize = 8_192;

/// Token budget for one session. Immutable once the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum context window in tokens.
    pub max_context_tokens: usize,
    /// Tokens reserved for generation.
    pub reserved_output_tokens: usize,
    /// Conversation size at which compaction begins.
    pub trigger_threshold: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW, DEFAULT_OUTPUT_RESERVE)
    }
}

impl Budget {
    /// Budget with the trigger at 80% of the available window.
    pub fn new(max_context_tokens: usize, reserved_output_tokens: usize) -> Self {
        let available = max_context_tokens.saturating_sub(reserved_output_tokens);
        Self {
            max_context_tokens,
            reserved_output_tokens,
            trigger_threshold: available * 4 / 5,
        }
    }

    pub fn with_trigger_threshold(mut self, tokens: usize) -> Self {
        self.trigger_threshold = tokens;
        self
    }

    /// Tokens the conversation plus tool schema may occupy.
    pub fn available(&self) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    pub fn usage(&self, estimated_tokens: usize) -> ContextUsage {
        let available = self.available();
        ContextUsage {
            estimated_tokens,
            available,
            trigger_threshold: self.trigger_threshold,
            usage_pct: if available > 0 {
                estimated_tokens as f64 / available as f64
            } else {
                1.0
            },
        }
    }
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    pub estimated_tokens: usize,
    pub available: usize,
    pub trigger_threshold: usize,
    /// Usage as a fraction of `available` (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn over_trigger(&self) -> bool {
        self.estimated_tokens > self.trigger_threshold
    }

    pub fn over_available(&self) -> bool {
        self.estimated_tokens > self.available
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {}, trigger {})",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.available,
            self.trigger_threshold,
        )
    }
}

/// Default text of the memory-warning turn.
pub const MEMORY_WARNING_TEXT: &str = "\
[Context notice: this conversation is approaching its context limit and older \
turns will soon be compacted. Persist any state you will need later (notes, \
partial results, plans) using your tools now.]";

/// Latch for the memory-warning turn.
///
/// Fires once when usage enters `[trigger * ratio, trigger)` and re-arms only
/// after usage drops back below the warning level.
#[derive(Debug, Clone)]
pub struct MemoryWarning {
    ratio: f64,
    fired: bool,
}

impl MemoryWarning {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            fired: false,
        }
    }

    fn warning_level(&self, budget: &Budget) -> usize {
        (budget.trigger_threshold as f64 * self.ratio).floor() as usize
    }

    /// Whether a warning turn should be inserted now. Updates the latch.
    pub fn check(&mut self, budget: &Budget, estimated_tokens: usize) -> bool {
        let level = self.warning_level(budget);
        if estimated_tokens < level {
            self.fired = false;
            return false;
        }
        if estimated_tokens >= budget.trigger_threshold || self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
