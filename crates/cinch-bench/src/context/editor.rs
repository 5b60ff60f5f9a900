//! Structural edits that shrink a conversation without breaking it.
//!
//! Every operation leaves the first turn untouched, keeps each tool call
//! paired with its result, and reports which turns it removed or modified so
//! ID-keyed bookkeeping (cache breakpoints) can be reconciled.

use super::estimator::TokenEstimator;
use super::invariants::unresolved_span;
use super::turn::{Conversation, TurnId};
use crate::ToolDef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Which edit produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Trim,
    PartialReset,
    Summarize,
    ClearReasoning,
}

/// What an edit did to the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditReport {
    pub kind: EditKind,
    pub removed: Vec<TurnId>,
    pub modified: Vec<TurnId>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl EditReport {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn tokens_freed(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

/// Result of a trim pass.
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub report: EditReport,
    /// Nothing more could be removed and the conversation is still over
    /// budget. Fatal for the session.
    pub exceeds_after_trim: bool,
}

/// Applies shrinking strategies to a conversation.
pub struct StructuralEditor<'a> {
    estimator: &'a dyn TokenEstimator,
    tools: &'a [ToolDef],
}

impl<'a> StructuralEditor<'a> {
    pub fn new(estimator: &'a dyn TokenEstimator, tools: &'a [ToolDef]) -> Self {
        Self { estimator, tools }
    }

    /// Estimated tokens of the conversation plus the tool schema.
    pub fn estimate(&self, conv: &Conversation) -> usize {
        self.estimator.estimate(conv.turns(), self.tools)
    }

    /// Tool schema counted by [`estimate`](Self::estimate).
    pub fn tools(&self) -> &'a [ToolDef] {
        self.tools
    }

    fn report(
        &self,
        kind: EditKind,
        conv: &Conversation,
        tokens_before: usize,
        removed: Vec<TurnId>,
        modified: Vec<TurnId>,
    ) -> EditReport {
        EditReport {
            kind,
            removed,
            modified,
            tokens_before,
            tokens_after: self.estimate(conv),
        }
    }

    // ── Trim ───────────────────────────────────────────────────────

    /// FIFO trim until the estimate fits in `available`.
    ///
    /// Each step deletes the earliest assistant turn after the prompt along
    /// with every tool turn answering its calls. With no assistant turn left,
    /// the earliest non-prompt user turn goes instead. Idempotent once the
    /// conversation fits.
    pub fn trim(&self, conv: &mut Conversation, available: usize) -> TrimOutcome {
        let tokens_before = self.estimate(conv);
        let mut removed = Vec::new();
        let mut tokens = tokens_before;

        while tokens > available {
            let Some(victims) = next_trim_victims(conv) else {
                debug!(tokens, available, "trim cannot remove anything further");
                let report = self.report(EditKind::Trim, conv, tokens_before, removed, vec![]);
                return TrimOutcome {
                    report,
                    exceeds_after_trim: true,
                };
            };
            removed.extend(conv.remove_ids(&victims));
            tokens = self.estimate(conv);
        }

        TrimOutcome {
            report: self.report(EditKind::Trim, conv, tokens_before, removed, vec![]),
            exceeds_after_trim: false,
        }
    }

    // ── Partial reset ──────────────────────────────────────────────

    /// Drop the earliest `floor(ratio * eligible)` tool-call pairs.
    ///
    /// The assistant turn of each dropped pair stays in place with its text
    /// but loses its `tool_calls`; its tool turns are deleted. With
    /// `keep_last_tool_call`, the most recent pair is never eligible.
    pub fn partial_reset(
        &self,
        conv: &mut Conversation,
        ratio: f64,
        keep_last_tool_call: bool,
    ) -> EditReport {
        let tokens_before = self.estimate(conv);
        let mut pairs = resolved_pairs(conv);
        if keep_last_tool_call {
            pairs.pop();
        }
        let count = (ratio.clamp(0.0, 1.0) * pairs.len() as f64).floor() as usize;

        let mut modified = Vec::with_capacity(count);
        let mut results = HashSet::new();
        for (assistant, tool_turns) in pairs.into_iter().take(count) {
            if let Some(turn) = conv.get_mut(assistant) {
                turn.tool_calls.clear();
                modified.push(assistant);
            }
            results.extend(tool_turns);
        }
        let removed = conv.remove_ids(&results);

        self.report(EditKind::PartialReset, conv, tokens_before, removed, modified)
    }

    // ── Reasoning clearer ──────────────────────────────────────────

    /// Blank reasoning on every assistant turn except the newest
    /// `keep_thinking` ones, and drop reasoning sidecars entirely.
    pub fn clear_reasoning(&self, conv: &mut Conversation, keep_thinking: usize) -> EditReport {
        let tokens_before = self.estimate(conv);
        let assistant_count = conv.turns().iter().filter(|t| t.is_assistant()).count();
        let clear_count = assistant_count.saturating_sub(keep_thinking);

        let mut modified = Vec::new();
        for turn in conv
            .turns_mut()
            .iter_mut()
            .filter(|t| t.is_assistant())
            .take(clear_count)
        {
            if !turn.has_reasoning() {
                continue;
            }
            if turn.reasoning_content.is_some() {
                turn.reasoning_content = Some(String::new());
            }
            turn.reasoning_details = None;
            modified.push(turn.id);
        }

        self.report(EditKind::ClearReasoning, conv, tokens_before, vec![], modified)
    }

    // ── Summary replacement ────────────────────────────────────────

    /// Replace the conversation with `[prompt, summary]`.
    pub fn apply_summary(&self, conv: &mut Conversation, summary: &str) -> EditReport {
        let tokens_before = self.estimate(conv);
        let removed = conv.replace_with_summary(summary);
        self.report(EditKind::Summarize, conv, tokens_before, removed, vec![])
    }
}

/// The turns the next trim step removes, or `None` if only the prompt (or an
/// in-flight span) is left.
fn next_trim_victims(conv: &Conversation) -> Option<HashSet<TurnId>> {
    let turns = conv.turns();
    let span = unresolved_span(turns);
    let is_candidate = |i: usize| i > 0 && !span.contains(&i);

    let assistant = turns
        .iter()
        .enumerate()
        .find(|(i, t)| is_candidate(*i) && t.is_assistant())
        .map(|(_, t)| t);
    if let Some(assistant) = assistant {
        let call_ids: HashSet<&str> = assistant.call_ids().collect();
        let mut victims: HashSet<TurnId> = turns
            .iter()
            .filter(|t| {
                t.is_tool()
                    && t.tool_call_id
                        .as_deref()
                        .is_some_and(|id| call_ids.contains(id))
            })
            .map(|t| t.id)
            .collect();
        victims.insert(assistant.id);
        return Some(victims);
    }

    turns
        .iter()
        .enumerate()
        .find(|(i, t)| is_candidate(*i) && !t.is_tool())
        .map(|(_, t)| HashSet::from([t.id]))
}

/// Every completed (assistant-with-calls, tool results) pair, oldest first.
fn resolved_pairs(conv: &Conversation) -> Vec<(TurnId, Vec<TurnId>)> {
    let turns = conv.turns();
    let span = unresolved_span(turns);
    turns
        .iter()
        .enumerate()
        .filter(|(i, t)| t.has_tool_calls() && !span.contains(i))
        .map(|(i, assistant)| {
            let call_ids: HashSet<&str> = assistant.call_ids().collect();
            let results = turns[i + 1..]
                .iter()
                .take_while(|t| t.is_tool())
                .filter(|t| {
                    t.tool_call_id
                        .as_deref()
                        .is_some_and(|id| call_ids.contains(id))
                })
                .map(|t| t.id)
                .collect();
            (assistant.id, results)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::context::estimator::CharRatioEstimator;
    use crate::context::invariants::check_pairing;
    use crate::context::turn::Turn;

    fn exchange(conv: &mut Conversation, call_id: &str, text: &str, result_len: usize) {
        conv.push(
            Turn::assistant(text)
                .with_tool_calls(vec![ToolCall::function(call_id, "read", "{}")]),
        );
        conv.push(Turn::tool_result(call_id, "r".repeat(result_len)));
    }

    fn conversation_with_pairs(n: usize) -> Conversation {
        let mut conv = Conversation::with_prompt("solve the task");
        for i in 0..n {
            exchange(&mut conv, &format!("c{i}"), &format!("step {i}"), 350);
        }
        conv
    }

    fn tool_call_ids(conv: &Conversation) -> Vec<String> {
        conv.turns()
            .iter()
            .flat_map(|t| t.call_ids().map(str::to_string))
            .collect()
    }

    #[test]
    fn trim_removes_earliest_pairs_until_under_budget() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(10);
        let before = editor.estimate(&conv);
        let available = before / 2;

        let out = editor.trim(&mut conv, available);
        assert!(!out.exceeds_after_trim);
        assert!(editor.estimate(&conv) <= available);
        assert_eq!(out.report.tokens_before, before);
        assert_eq!(out.report.removed.len() % 2, 0, "pairs leave together");
        check_pairing(conv.turns()).unwrap();

        // Oldest calls went first; the newest survives.
        let ids = tool_call_ids(&conv);
        assert!(!ids.contains(&"c0".to_string()));
        assert!(ids.contains(&"c9".to_string()));
        assert_eq!(conv.turns()[0].content, "solve the task");
    }

    #[test]
    fn trim_is_idempotent_once_under_budget() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(6);
        let available = editor.estimate(&conv) / 2;

        editor.trim(&mut conv, available);
        let len = conv.len();
        let again = editor.trim(&mut conv, available);
        assert!(again.report.is_noop());
        assert!(!again.exceeds_after_trim);
        assert_eq!(conv.len(), len);
    }

    #[test]
    fn trim_reports_exceeded_when_only_prompt_remains() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = Conversation::with_prompt("p".repeat(3_500));
        exchange(&mut conv, "c0", "x", 10);

        let out = editor.trim(&mut conv, 100);
        assert!(out.exceeds_after_trim);
        assert_eq!(conv.len(), 1);
        assert_eq!(out.report.removed.len(), 2);
    }

    #[test]
    fn trim_falls_back_to_user_turns() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = Conversation::with_prompt("task");
        let summary = conv.push(Turn::user("s".repeat(3_500)));

        let out = editor.trim(&mut conv, 50);
        assert!(!out.exceeds_after_trim);
        assert_eq!(out.report.removed, vec![summary]);
    }

    #[test]
    fn partial_reset_ratio_zero_is_noop() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(5);
        let report = editor.partial_reset(&mut conv, 0.0, false);
        assert!(report.is_noop());
        assert_eq!(conv.len(), 11);
        assert_eq!(report.tokens_before, report.tokens_after);
    }

    #[test]
    fn partial_reset_ratio_one_keeps_last_pair() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(5);
        let report = editor.partial_reset(&mut conv, 1.0, true);

        assert_eq!(report.modified.len(), 4);
        assert_eq!(report.removed.len(), 4);
        assert_eq!(tool_call_ids(&conv), vec!["c4".to_string()]);
        check_pairing(conv.turns()).unwrap();
        // Assistant turns keep their text.
        assert_eq!(
            conv.turns().iter().filter(|t| t.is_assistant()).count(),
            5
        );
        assert_eq!(conv.turns()[1].content, "step 0");
        assert!(report.tokens_after < report.tokens_before);
    }

    #[test]
    fn partial_reset_floors_the_count() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(5);
        // 4 eligible * 0.6 = 2.4 -> 2
        let report = editor.partial_reset(&mut conv, 0.6, true);
        assert_eq!(report.modified.len(), 2);
        assert_eq!(
            tool_call_ids(&conv),
            vec!["c2".to_string(), "c3".to_string(), "c4".to_string()]
        );
    }

    #[test]
    fn partial_reset_without_keep_last_can_clear_everything() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(3);
        editor.partial_reset(&mut conv, 1.0, false);
        assert!(tool_call_ids(&conv).is_empty());
        assert!(conv.turns().iter().all(|t| !t.is_tool()));
        check_pairing(conv.turns()).unwrap();
    }

    #[test]
    fn partial_reset_handles_multi_call_turns() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = Conversation::with_prompt("task");
        conv.push(Turn::assistant("both").with_tool_calls(vec![
            ToolCall::function("a", "read", "{}"),
            ToolCall::function("b", "read", "{}"),
        ]));
        conv.push(Turn::tool_result("a", "1"));
        conv.push(Turn::tool_result("b", "2"));
        exchange(&mut conv, "c", "last", 10);

        let report = editor.partial_reset(&mut conv, 1.0, true);
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.modified.len(), 1);
        check_pairing(conv.turns()).unwrap();
    }

    #[test]
    fn clear_reasoning_keeps_newest() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = Conversation::with_prompt("task");
        for i in 0..4 {
            conv.push(Turn::assistant(format!("a{i}")).with_reasoning(
                Some("think ".repeat(50)),
                Some(serde_json::json!([{"type": "signature", "i": i}])),
            ));
        }

        let report = editor.clear_reasoning(&mut conv, 1);
        assert_eq!(report.modified.len(), 3);
        assert!(report.removed.is_empty());
        let assistants: Vec<_> = conv.turns().iter().filter(|t| t.is_assistant()).collect();
        for t in &assistants[..3] {
            assert_eq!(t.reasoning_content.as_deref(), Some(""));
            assert!(t.reasoning_details.is_none());
            assert!(!t.content.is_empty(), "content untouched");
        }
        assert!(assistants[3].has_reasoning());

        // Second pass finds nothing left to clear.
        assert!(editor.clear_reasoning(&mut conv, 1).is_noop());
    }

    #[test]
    fn apply_summary_replaces_history() {
        let est = CharRatioEstimator::default();
        let editor = StructuralEditor::new(&est, &[]);
        let mut conv = conversation_with_pairs(4);
        let report = editor.apply_summary(&mut conv, "carry-over: read four files");
        assert_eq!(report.removed.len(), 8);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.turns()[1].content, "carry-over: read four files");
        check_pairing(conv.turns()).unwrap();
        assert!(report.tokens_after < report.tokens_before);
    }
}
