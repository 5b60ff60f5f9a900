//! Tool-call/result pairing checks.
//!
//! Every assistant tool call must be answered by exactly one tool turn with
//! the matching `tool_call_id`. The answers follow the assistant turn
//! directly, contiguously, and in call order.

use super::turn::Turn;
use std::collections::HashSet;
use std::ops::Range;

/// A broken pairing, reported with the position where it was detected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingViolation {
    #[error("turn {position}: tool call `{call_id}` has no matching result")]
    MissingResult { position: usize, call_id: String },
    #[error("turn {position}: expected result for `{expected}`, found `{found}`")]
    OutOfOrder {
        position: usize,
        expected: String,
        found: String,
    },
    #[error("turn {position}: tool result `{call_id}` answers no pending call")]
    OrphanResult { position: usize, call_id: String },
    #[error("turn {position}: tool call id `{call_id}` used more than once")]
    DuplicateCall { position: usize, call_id: String },
}

/// Check the pairing invariant over a complete conversation.
pub fn check_pairing(turns: &[Turn]) -> Result<(), PairingViolation> {
    let mut seen_calls: HashSet<&str> = HashSet::new();
    let mut i = 0;
    while i < turns.len() {
        let turn = &turns[i];
        if turn.is_tool() {
            return Err(PairingViolation::OrphanResult {
                position: i,
                call_id: turn.tool_call_id.clone().unwrap_or_default(),
            });
        }
        let owner = i;
        i += 1;
        if !turn.has_tool_calls() {
            continue;
        }
        for call_id in turn.call_ids() {
            if !seen_calls.insert(call_id) {
                return Err(PairingViolation::DuplicateCall {
                    position: owner,
                    call_id: call_id.to_string(),
                });
            }
            match turns.get(i) {
                Some(result) if result.is_tool() => {
                    let found = result.tool_call_id.as_deref().unwrap_or_default();
                    if found != call_id {
                        return Err(PairingViolation::OutOfOrder {
                            position: i,
                            expected: call_id.to_string(),
                            found: found.to_string(),
                        });
                    }
                    i += 1;
                }
                _ => {
                    return Err(PairingViolation::MissingResult {
                        position: i,
                        call_id: call_id.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Positions of a trailing tool-call span whose results are not all present
/// yet. Empty when the conversation is at rest.
pub fn unresolved_span(turns: &[Turn]) -> Range<usize> {
    let Some(start) = turns.iter().rposition(Turn::has_tool_calls) else {
        return turns.len()..turns.len();
    };
    let answered = turns[start + 1..]
        .iter()
        .take_while(|t| t.is_tool())
        .count();
    if answered < turns[start].tool_calls.len() {
        start..turns.len()
    } else {
        turns.len()..turns.len()
    }
}
