//! Turns and the per-session conversation arena.
//!
//! Every turn gets a [`TurnId`] when it is appended. IDs are never reused
//! within a conversation, so anything that refers back into the history
//! (cache breakpoints, edit reports) holds IDs and resolves them to positions
//! only when needed.

use crate::{ContentPart, MessageRole, ToolCall, WireContent, WireMessage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stable identity of a turn within one conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One message in a conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Turn {
    pub id: TurnId,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Provider-side prompt-cache breakpoint. Opaque to content.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_marker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<serde_json::Value>,
}

impl Turn {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: TurnId(0),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            cache_marker: false,
            reasoning_content: None,
            reasoning_details: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_reasoning(
        mut self,
        content: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        self.reasoning_content = content;
        self.reasoning_details = details;
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    pub fn is_tool(&self) -> bool {
        self.role == MessageRole::Tool
    }

    /// An assistant turn that requested at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.is_assistant() && !self.tool_calls.is_empty()
    }

    pub fn call_ids(&self) -> impl Iterator<Item = &str> {
        self.tool_calls.iter().map(|c| c.id.as_str())
    }

    /// Whether this turn carries any reasoning payload.
    pub fn has_reasoning(&self) -> bool {
        self.reasoning_content.as_deref().is_some_and(|r| !r.is_empty())
            || self.reasoning_details.is_some()
    }

    /// Convert to the wire representation. A cache marker turns the content
    /// into a single cached text part.
    pub fn to_wire(&self) -> WireMessage {
        let content = if self.content.is_empty() && self.has_tool_calls() {
            None
        } else if self.cache_marker && !self.content.is_empty() {
            Some(WireContent::Parts(vec![ContentPart::cached_text(
                self.content.clone(),
            )]))
        } else {
            Some(WireContent::Text(self.content.clone()))
        };

        WireMessage {
            role: self.role,
            content,
            tool_calls: (!self.tool_calls.is_empty()).then(|| self.tool_calls.clone()),
            tool_call_id: self.tool_call_id.clone(),
            reasoning_content: self
                .reasoning_content
                .clone()
                .filter(|_| self.is_assistant()),
            reasoning_details: self
                .reasoning_details
                .clone()
                .filter(|_| self.is_assistant()),
        }
    }
}

/// Ordered turns of one session, owned by its runner.
///
/// The first turn is the task prompt. Turns are only ever appended, removed,
/// or replaced; never reordered.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    next_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation from the task's user prompt.
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Turn::user(prompt));
        conv
    }

    /// Append a turn, assigning it a fresh ID.
    pub fn push(&mut self, mut turn: Turn) -> TurnId {
        let id = TurnId(self.next_id);
        self.next_id += 1;
        turn.id = id;
        self.turns.push(turn);
        id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub(crate) fn turns_mut(&mut self) -> &mut [Turn] {
        &mut self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn first(&self) -> Option<&Turn> {
        self.turns.first()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Current position of a turn, if it is still present.
    pub fn position(&self, id: TurnId) -> Option<usize> {
        // IDs are strictly increasing along the vector.
        self.turns.binary_search_by_key(&id, |t| t.id).ok()
    }

    pub fn get(&self, id: TurnId) -> Option<&Turn> {
        self.position(id).map(|i| &self.turns[i])
    }

    pub(crate) fn get_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        self.position(id).map(|i| &mut self.turns[i])
    }

    /// Remove the given turns. The first turn is never removed. Returns the
    /// IDs actually removed, in conversation order.
    pub(crate) fn remove_ids(&mut self, ids: &HashSet<TurnId>) -> Vec<TurnId> {
        let first = self.turns.first().map(|t| t.id);
        let mut removed = Vec::new();
        self.turns.retain(|t| {
            if Some(t.id) != first && ids.contains(&t.id) {
                removed.push(t.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Replace everything after the first turn with a single user turn
    /// carrying `summary`. Returns the removed IDs.
    pub(crate) fn replace_with_summary(&mut self, summary: impl Into<String>) -> Vec<TurnId> {
        let removed: Vec<TurnId> = self.turns.iter().skip(1).map(|t| t.id).collect();
        self.turns.truncate(1);
        self.push(Turn::user(summary));
        removed
    }

    /// Text of the most recent assistant turn that has any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.is_assistant())
            .map(|t| t.content.as_str())
            .find(|c| !c.is_empty())
    }

    pub fn count_role(&self, role: MessageRole) -> usize {
        self.turns.iter().filter(|t| t.role == role).count()
    }

    pub fn to_wire(&self) -> Vec<WireMessage> {
        self.turns.iter().map(Turn::to_wire).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_exchange(conv: &mut Conversation, call_id: &str) -> (TurnId, TurnId) {
        let a = conv.push(
            Turn::assistant("").with_tool_calls(vec![ToolCall::function(call_id, "ls", "{}")]),
        );
        let t = conv.push(Turn::tool_result(call_id, "ok"));
        (a, t)
    }

    #[test]
    fn ids_are_stable_across_removal() {
        let mut conv = Conversation::with_prompt("task");
        let (a, t) = tool_exchange(&mut conv, "c1");
        let late = conv.push(Turn::assistant("done"));

        assert_eq!(conv.position(late), Some(3));
        let removed = conv.remove_ids(&HashSet::from([a, t]));
        assert_eq!(removed, vec![a, t]);
        assert_eq!(conv.position(late), Some(1));
        assert_eq!(conv.get(late).unwrap().content, "done");
        assert!(conv.position(a).is_none());
    }

    #[test]
    fn ids_not_reused_after_removal() {
        let mut conv = Conversation::with_prompt("task");
        let a = conv.push(Turn::assistant("x"));
        conv.remove_ids(&HashSet::from([a]));
        let b = conv.push(Turn::assistant("y"));
        assert!(b > a);
    }

    #[test]
    fn first_turn_is_never_removed() {
        let mut conv = Conversation::with_prompt("task");
        let first = conv.first().unwrap().id;
        let removed = conv.remove_ids(&HashSet::from([first]));
        assert!(removed.is_empty());
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn summary_replacement_keeps_prompt() {
        let mut conv = Conversation::with_prompt("task");
        tool_exchange(&mut conv, "c1");
        conv.push(Turn::assistant("thinking"));
        let removed = conv.replace_with_summary("so far: listed files");
        assert_eq!(removed.len(), 3);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.turns()[0].content, "task");
        assert_eq!(conv.turns()[1].role, MessageRole::User);
        assert_eq!(conv.turns()[1].content, "so far: listed files");
    }

    #[test]
    fn last_assistant_text_skips_tool_call_turns() {
        let mut conv = Conversation::with_prompt("task");
        conv.push(Turn::assistant("first answer"));
        tool_exchange(&mut conv, "c1");
        assert_eq!(conv.last_assistant_text(), Some("first answer"));
    }

    #[test]
    fn wire_omits_empty_content_on_tool_call_turns() {
        let turn =
            Turn::assistant("").with_tool_calls(vec![ToolCall::function("c1", "ls", "{}")]);
        let json = serde_json::to_value(turn.to_wire()).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["id"], "c1");
    }

    #[test]
    fn wire_marks_cache_breakpoint() {
        let mut turn = Turn::user("big prefix");
        turn.cache_marker = true;
        let json = serde_json::to_value(turn.to_wire()).unwrap();
        assert_eq!(json["content"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(json["content"][0]["text"], "big prefix");
    }

    #[test]
    fn wire_sends_reasoning_back_on_assistant_only() {
        let turn = Turn::assistant("answer")
            .with_reasoning(Some("because".into()), Some(serde_json::json!([{"sig": 1}])));
        let json = serde_json::to_value(turn.to_wire()).unwrap();
        assert_eq!(json["reasoning_content"], "because");
        assert!(json["reasoning_details"].is_array());

        let user = Turn::user("q").with_reasoning(Some("leak".into()), None);
        let json = serde_json::to_value(user.to_wire()).unwrap();
        assert!(json.get("reasoning_content").is_none());
    }

    #[test]
    fn conversation_round_trips_through_json() {
        let mut conv = Conversation::with_prompt("task");
        tool_exchange(&mut conv, "c1");
        let json = serde_json::to_string(&conv).unwrap();
        let mut back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 3);
        let next = back.push(Turn::assistant("more"));
        assert_eq!(next, TurnId(3));
    }
}
