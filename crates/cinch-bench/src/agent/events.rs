//! Events and handlers for a benchmark session.
//!
//! The [`Controller`](super::controller::Controller) reports everything it
//! does through [`SessionEvent`] values: turn start, model responses, tool
//! results, compaction, trimming, cache breakpoints. Callers implement
//! [`EventHandler`] to observe them for logging, progress output, or tests.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures that may return a response |
//! | [`EventObserver`] | Closures that only observe |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::context::ContextUsage;
use crate::context::editor::{EditKind, EditReport};
use crate::context::turn::TurnId;
use tracing::{debug, error, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the controller during a session.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// A model call is about to be made.
    TurnStart {
        turn: u32,
        max_turns: u32,
        context_usage: &'a ContextUsage,
    },
    /// The executor returned a classified response.
    ModelResponded {
        turn: u32,
        kind: &'static str,
        attempts: u32,
    },
    /// Assistant text (final answer or commentary next to tool calls).
    Text(&'a str),
    /// Reasoning content returned with the response.
    Reasoning(&'a str),
    /// A tool call is about to be dispatched.
    ToolExecuting { name: &'a str, arguments: &'a str },
    /// A tool call produced its result turn.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    /// Token usage reported for this turn's successful request.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// The "persist your state" notice was appended.
    MemoryWarning { tokens: usize, trigger_threshold: usize },
    /// The trigger threshold was crossed and compaction is about to run.
    /// Handlers may return [`EventResponse::InjectMessage`] to append a user
    /// turn that the compaction will see.
    PreCompaction { strategy: &'static str, tokens: usize },
    /// A structural edit changed the conversation.
    EditApplied(&'a EditReport),
    /// The summary request failed; the conversation is unchanged.
    SummaryFailed { error: &'a str },
    /// A cache breakpoint was placed.
    BreakpointAdded { id: TurnId, turn: u32 },
    /// Breakpoints invalidated by an edit.
    BreakpointsDropped { ids: &'a [TurnId] },
    /// The session hit `max_turns`.
    TurnLimitReached { max_turns: u32 },
    /// The model produced a final answer.
    Finished { turns: u32 },
    /// The session ended with an unrecoverable error.
    Fatal { error: &'a str },
}

/// Response from an event handler for events that accept feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    /// Append a user message to the conversation.
    InjectMessage(String),
}

/// Handler for session events.
///
/// Most events are informational and the return value is ignored. For
/// [`SessionEvent::PreCompaction`], returning
/// `Some(EventResponse::InjectMessage(text))` appends `text` as a user turn
/// before the strategy runs.
///
/// ```ignore
/// struct Progress;
///
/// impl EventHandler for Progress {
///     fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
///         if let SessionEvent::EditApplied(report) = event {
///             eprintln!("{:?} freed {} tokens", report.kind, report.tokens_freed());
///         }
///         None
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| match event {
///     SessionEvent::PreCompaction { .. } => {
///         Some(EventResponse::InjectMessage("Write your notes first.".into()))
///     }
///     _ => None,
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&SessionEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Adapts an observation-only closure into an [`EventHandler`].
pub struct EventObserver<F>(F)
where
    F: Fn(&SessionEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&SessionEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
        (self.0)(event);
        None
    }
}

/// An event handler that delegates to multiple inner handlers.
///
/// Events are dispatched to all handlers in order. The first non-`None`
/// response is returned.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(progress, ProgressHandler::new());
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain. Handlers are called in registration order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
        let mut first = None;
        for handler in &self.handlers {
            let response = handler.on_event(event);
            if first.is_none() {
                first = response;
            }
        }
        first
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &SessionEvent<'_>) -> Option<EventResponse> {
        match event {
            SessionEvent::TurnStart {
                turn,
                max_turns,
                context_usage,
            } => {
                info!("[turn {turn}/{max_turns}] {}", context_usage.to_log_string());
            }
            SessionEvent::ModelResponded {
                turn,
                kind,
                attempts,
            } => {
                debug!(turn, kind, attempts, "model responded");
            }
            SessionEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "LLM text: {preview}{}",
                    if text.chars().count() > 200 { "..." } else { "" }
                );
            }
            SessionEvent::Reasoning(text) => {
                debug!("LLM reasoning: {} chars", text.chars().count());
            }
            SessionEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            SessionEvent::ToolResult {
                name,
                result,
                is_error,
                ..
            } => {
                if *is_error {
                    debug!("Tool {name} failed: {} bytes", result.len());
                } else {
                    debug!("Tool {name} result: {} bytes", result.len());
                }
            }
            SessionEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            SessionEvent::MemoryWarning {
                tokens,
                trigger_threshold,
            } => {
                info!(tokens, trigger_threshold, "memory warning inserted");
            }
            SessionEvent::PreCompaction { strategy, tokens } => {
                debug!(strategy, tokens, "trigger threshold crossed");
            }
            SessionEvent::EditApplied(report) => {
                let kind = match report.kind {
                    EditKind::Trim => "trim",
                    EditKind::PartialReset => "partial reset",
                    EditKind::Summarize => "summary",
                    EditKind::ClearReasoning => "reasoning clear",
                };
                info!(
                    tokens_before = report.tokens_before,
                    tokens_after = report.tokens_after,
                    removed = report.removed.len(),
                    modified = report.modified.len(),
                    "{kind} applied"
                );
            }
            SessionEvent::SummaryFailed { error } => {
                warn!("Summary request failed, will retry next turn: {error}");
            }
            SessionEvent::BreakpointAdded { id, turn } => {
                debug!("Cache breakpoint at {id} (turn {turn})");
            }
            SessionEvent::BreakpointsDropped { ids } => {
                debug!("{} cache breakpoint(s) dropped after edit", ids.len());
            }
            SessionEvent::TurnLimitReached { max_turns } => {
                info!("Session hit turn limit ({max_turns})");
            }
            SessionEvent::Finished { turns } => {
                info!("Session finished after {turns} turn(s)");
            }
            SessionEvent::Fatal { error } => {
                error!("Session failed: {error}");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_returns_first_response_and_calls_all() {
        let seen = Arc::new(Mutex::new(0u32));
        let s = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(NoopHandler)
            .with(FnEventHandler::new(|_| {
                Some(EventResponse::InjectMessage("first".into()))
            }))
            .with(FnEventHandler::new(|_| {
                Some(EventResponse::InjectMessage("second".into()))
            }))
            .with(EventObserver::new(move |_| *s.lock().unwrap() += 1));

        let response = handler.on_event(&SessionEvent::PreCompaction {
            strategy: "summarize",
            tokens: 10,
        });
        assert_eq!(response, Some(EventResponse::InjectMessage("first".into())));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn with_if_false_skips_handler() {
        let handler = CompositeEventHandler::new()
            .with_if(false, FnEventHandler::new(|_| {
                Some(EventResponse::InjectMessage("x".into()))
            }));
        assert!(handler.on_event(&SessionEvent::Finished { turns: 1 }).is_none());
    }

    #[test]
    fn logging_handler_never_responds() {
        let report = EditReport {
            kind: EditKind::Trim,
            removed: vec![TurnId(1)],
            modified: vec![],
            tokens_before: 100,
            tokens_after: 50,
        };
        assert!(LoggingHandler.on_event(&SessionEvent::EditApplied(&report)).is_none());
        assert!(
            LoggingHandler
                .on_event(&SessionEvent::Fatal { error: "boom" })
                .is_none()
        );
    }
}
