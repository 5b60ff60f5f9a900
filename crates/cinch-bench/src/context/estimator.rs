//! Token estimation for conversations and tool schemas.
//!
//! Estimates are per-turn sums, so removing a turn or stripping a field from
//! one never increases the total.

use super::turn::Turn;
use crate::ToolDef;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed per-message framing cost (role, separators).
const PER_TURN_OVERHEAD: usize = 4;

/// Turns a conversation plus tool schema into a token count.
///
/// Implementations must be deterministic and must score each turn
/// independently of its neighbours.
pub trait TokenEstimator: Send + Sync {
    /// Tokens contributed by one turn.
    fn estimate_turn(&self, turn: &Turn) -> usize;

    /// Tokens contributed by the tool definitions sent with every request.
    fn estimate_tools(&self, tools: &[ToolDef]) -> usize;

    fn estimate(&self, turns: &[Turn], tools: &[ToolDef]) -> usize {
        turns.iter().map(|t| self.estimate_turn(t)).sum::<usize>() + self.estimate_tools(tools)
    }
}

/// Text of a turn that is billed as prompt tokens.
fn turn_text_len(turn: &Turn) -> usize {
    let mut chars = turn.content.len();
    for call in &turn.tool_calls {
        chars += call.id.len() + call.function.name.len() + call.function.arguments.len();
    }
    chars += turn.tool_call_id.as_ref().map_or(0, String::len);
    chars += turn.reasoning_content.as_ref().map_or(0, String::len);
    chars += turn
        .reasoning_details
        .as_ref()
        .map_or(0, |d| d.to_string().len());
    chars
}

fn tools_json(tools: &[ToolDef]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    serde_json::to_string(tools).unwrap_or_default()
}

/// Fixed characters-per-token estimator. Used when no tokenizer is
/// available.
#[derive(Debug, Clone)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Create an estimator with a calibrated ratio. Pass `None` to use the
    /// default. Non-positive ratios fall back to the default.
    pub fn with_calibration(calibrated_cpt: Option<f64>) -> Self {
        let cpt = calibrated_cpt
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        Self {
            chars_per_token: cpt,
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    fn tokens_for(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::with_calibration(None)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate_turn(&self, turn: &Turn) -> usize {
        self.tokens_for(turn_text_len(turn)) + PER_TURN_OVERHEAD
    }

    fn estimate_tools(&self, tools: &[ToolDef]) -> usize {
        self.tokens_for(tools_json(tools).len())
    }
}

/// BPE estimator backed by `cl100k_base`. Falls back to the character ratio
/// if the encoder cannot be loaded.
#[cfg(feature = "tiktoken")]
pub mod bpe {
    use super::*;
    use std::sync::OnceLock;

    static CL100K_BASE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();

    fn encoder() -> Option<&'static tiktoken_rs::CoreBPE> {
        CL100K_BASE
            .get_or_init(|| tiktoken_rs::cl100k_base().ok())
            .as_ref()
    }

    #[derive(Debug, Clone, Default)]
    pub struct BpeEstimator {
        fallback: CharRatioEstimator,
    }

    impl BpeEstimator {
        pub fn new() -> Self {
            Self::default()
        }

        fn count(&self, text: &str) -> usize {
            match encoder() {
                Some(bpe) => bpe.encode_with_special_tokens(text).len(),
                None => self.fallback.tokens_for(text.len()),
            }
        }
    }

    impl TokenEstimator for BpeEstimator {
        fn estimate_turn(&self, turn: &Turn) -> usize {
            let mut tokens = self.count(&turn.content) + PER_TURN_OVERHEAD;
            for call in &turn.tool_calls {
                tokens += self.count(&call.function.name) + self.count(&call.function.arguments);
                tokens += self.count(&call.id);
            }
            if let Some(id) = &turn.tool_call_id {
                tokens += self.count(id);
            }
            if let Some(r) = &turn.reasoning_content {
                tokens += self.count(r);
            }
            if let Some(d) = &turn.reasoning_details {
                tokens += self.count(&d.to_string());
            }
            tokens
        }

        fn estimate_tools(&self, tools: &[ToolDef]) -> usize {
            self.count(&tools_json(tools))
        }
    }
}

/// The estimator used by default: BPE when compiled in, else the ratio.
pub fn default_estimator(chars_per_token: Option<f64>) -> Box<dyn TokenEstimator> {
    #[cfg(feature = "tiktoken")]
    {
        let _ = chars_per_token;
        Box::new(bpe::BpeEstimator::new())
    }
    #[cfg(not(feature = "tiktoken"))]
    {
        Box::new(CharRatioEstimator::with_calibration(chars_per_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::context::turn::Conversation;

    #[test]
    fn estimate_is_deterministic() {
        let est = CharRatioEstimator::default();
        let mut conv = Conversation::with_prompt("a".repeat(700));
        conv.push(Turn::assistant("b".repeat(350)));
        let a = est.estimate(conv.turns(), &[]);
        let b = est.estimate(conv.turns(), &[]);
        assert_eq!(a, b);
        // 700/3.5 + 350/3.5 + 2 overheads
        assert_eq!(a, 200 + 100 + 2 * PER_TURN_OVERHEAD);
    }

    #[test]
    fn removal_never_increases_estimate() {
        let est = CharRatioEstimator::default();
        let mut conv = Conversation::with_prompt("task");
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(conv.push(Turn::assistant(format!("step {i} {}", "x".repeat(i * 13)))));
        }
        let mut prev = est.estimate(conv.turns(), &[]);
        for id in ids {
            conv.remove_ids(&std::collections::HashSet::from([id]));
            let now = est.estimate(conv.turns(), &[]);
            assert!(now <= prev);
            prev = now;
        }
    }

    #[test]
    fn tool_calls_and_reasoning_are_counted() {
        let est = CharRatioEstimator::default();
        let plain = Turn::assistant("hi");
        let heavy = Turn::assistant("hi")
            .with_tool_calls(vec![ToolCall::function("c1", "grep", "x".repeat(100))])
            .with_reasoning(Some("r".repeat(70)), None);
        assert!(est.estimate_turn(&heavy) > est.estimate_turn(&plain) + 40);
    }

    #[test]
    fn tools_add_to_total() {
        let est = CharRatioEstimator::default();
        let tools = vec![ToolDef::new(
            "search",
            "Search the corpus",
            serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        )];
        let conv = Conversation::with_prompt("task");
        assert!(est.estimate(conv.turns(), &tools) > est.estimate(conv.turns(), &[]));
        assert_eq!(est.estimate_tools(&[]), 0);
    }

    #[test]
    fn calibration_rejects_nonsense_ratio() {
        assert_eq!(
            CharRatioEstimator::with_calibration(Some(0.0)).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
        assert_eq!(
            CharRatioEstimator::with_calibration(Some(4.0)).chars_per_token(),
            4.0
        );
    }
}
