//! Carry-over summaries for the summarize strategy.
//!
//! The summary request is the full conversation followed by one extra user
//! turn asking for a carry-over summary. On success the editor replaces the
//! whole history with `[prompt, summary turn]`.

use super::turn::Conversation;
use crate::{ChatRequest, MessageRole, ToolChoice, ToolDef, WireContent, WireMessage};

/// Instruction appended to the conversation when requesting a summary.
const SUMMARIZATION_PROMPT: &str = "\
Your context window is nearly full and the conversation so far is about to be \
replaced by a summary. Write a carry-over summary that lets you continue the \
task without the earlier messages. Focus on:
- What was accomplished (completed subtasks, tool results that matter)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- Exact identifiers, paths, values, and error messages still needed
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the conversation. Do not infer or extrapolate.
- Preserve identifiers and error messages verbatim.
- Do not call any tools. Reply with the summary text only.";

/// Header placed above the summary in the replacement turn.
const SUMMARY_HEADER: &str = "[Summary of the conversation so far]";

/// Configuration for summary requests.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Model to use for summarization. `None` uses the session model.
    pub model: Option<String>,
    /// Maximum tokens for the summarization response.
    pub max_summary_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_summary_tokens: 4096,
        }
    }
}

impl SummarizerConfig {
    /// Get the model to use for summarization.
    pub fn summary_model<'a>(&'a self, main_model: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(main_model)
    }

    /// Build the one-off summary request.
    ///
    /// Tools are declared so that earlier tool calls in the history stay
    /// valid, but `tool_choice` is `none`.
    pub fn build_request(
        &self,
        conv: &Conversation,
        tools: &[ToolDef],
        main_model: &str,
    ) -> ChatRequest {
        let mut messages = conv.to_wire();
        messages.push(WireMessage {
            role: MessageRole::User,
            content: Some(WireContent::Text(SUMMARIZATION_PROMPT.to_string())),
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
            reasoning_details: None,
        });

        ChatRequest {
            model: self.summary_model(main_model).to_string(),
            messages,
            max_tokens: self.max_summary_tokens,
            tools: (!tools.is_empty()).then(|| tools.to_vec()),
            tool_choice: (!tools.is_empty()).then_some(ToolChoice::None),
            ..Default::default()
        }
    }
}

/// Text of the user turn that replaces the history.
pub fn summary_turn_text(summary: &str) -> String {
    format!("{SUMMARY_HEADER}\n\n{}", summary.trim())
}
