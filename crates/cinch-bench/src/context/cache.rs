//! Provider-side prompt-cache breakpoints.
//!
//! Breakpoints are held as [`TurnId`]s and only resolved to positions on
//! demand, so edits never shift them. After an edit, IDs whose turns are gone
//! or sit inside an unresolved tool-call span are dropped.

use super::invariants::unresolved_span;
use super::turn::{Conversation, TurnId};
use tracing::debug;

/// Providers accept at most four cache breakpoints per request.
pub const DEFAULT_MAX_BREAKPOINTS: usize = 4;

/// Whether a breakpoint should be added before model call `turn` (1-based):
/// 10, 20, 40, 80, then every 40.
pub fn is_milestone(turn: usize) -> bool {
    matches!(turn, 10 | 20 | 40 | 80) || (turn > 80 && (turn - 80) % 40 == 0)
}

/// Bounded set of cache breakpoints, oldest first.
#[derive(Debug, Clone)]
pub struct CacheBreakpointSet {
    ids: Vec<TurnId>,
    capacity: usize,
}

impl Default for CacheBreakpointSet {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BREAKPOINTS)
    }
}

impl CacheBreakpointSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: Vec::new(),
            capacity,
        }
    }

    pub fn ids(&self) -> &[TurnId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// At a milestone, add the newest eligible turn as a breakpoint.
    ///
    /// Eligible: present, not already a breakpoint, has text content, and
    /// not inside an unresolved tool-call span. When full, the oldest
    /// breakpoint is evicted.
    pub fn maybe_extend(&mut self, conv: &mut Conversation, turn: usize) -> Option<TurnId> {
        if self.capacity == 0 || !is_milestone(turn) {
            return None;
        }
        self.reconcile(conv);

        let turns = conv.turns();
        let span = unresolved_span(turns);
        let candidate = turns
            .iter()
            .enumerate()
            .rev()
            .find(|(i, t)| {
                !span.contains(i) && !t.content.is_empty() && !self.ids.contains(&t.id)
            })
            .map(|(_, t)| t.id)?;

        self.ids.push(candidate);
        if self.ids.len() > self.capacity {
            let evicted = self.ids.remove(0);
            debug!(%evicted, "cache breakpoint evicted");
        }
        self.sync_markers(conv);
        Some(candidate)
    }

    /// Drop breakpoints whose turns were removed or are now inside an
    /// unresolved span. Returns the dropped IDs.
    pub fn reconcile(&mut self, conv: &Conversation) -> Vec<TurnId> {
        let span = unresolved_span(conv.turns());
        let mut dropped = Vec::new();
        self.ids.retain(|id| match conv.position(*id) {
            Some(pos) if !span.contains(&pos) => true,
            _ => {
                dropped.push(*id);
                false
            }
        });
        dropped
    }

    /// Apply an edit's removed list, then reconcile and re-mark turns.
    pub fn on_edit(&mut self, conv: &mut Conversation, removed: &[TurnId]) -> Vec<TurnId> {
        let mut dropped: Vec<TurnId> = self
            .ids
            .iter()
            .copied()
            .filter(|id| removed.contains(id))
            .collect();
        self.ids.retain(|id| !removed.contains(id));
        dropped.extend(self.reconcile(conv));
        self.sync_markers(conv);
        dropped
    }

    /// Current positions of the breakpoints, oldest first.
    pub fn positions(&self, conv: &Conversation) -> Vec<usize> {
        self.ids.iter().filter_map(|id| conv.position(*id)).collect()
    }

    /// Set `cache_marker` on exactly the breakpoint turns.
    pub fn sync_markers(&self, conv: &mut Conversation) {
        for turn in conv.turns_mut() {
            turn.cache_marker = self.ids.contains(&turn.id);
        }
    }
}
