//! Context-budget controller: one model turn at a time.
//!
//! Each call to [`Controller::step`] walks the state machine once:
//!
//! ```text
//! AwaitModel ──► ModelResponded ──► AwaitTools ──► ToolsResolved ──► AwaitModel
//!                      │
//!                      └──► Done (plain text)      any ──► Fatal
//! ```
//!
//! Before the call the controller places cache breakpoints and trims a
//! conversation that no longer fits. After tool results are in it checks the
//! trigger threshold and applies the session's compaction strategy. All
//! edits go through the [`StructuralEditor`] and are reported so cache
//! breakpoints can be reconciled before the next request.

use super::artifact::{EditEvent, RunArtifact, RunCounters};
use super::config::{CompactionStrategy, SessionConfig};
use super::events::{EventHandler, EventResponse, SessionEvent};
use crate::api::executor::{RequestExecutor, ResponseKind};
use crate::context::budget::MemoryWarning;
use crate::context::cache::CacheBreakpointSet;
use crate::context::editor::{EditReport, StructuralEditor};
use crate::context::estimator::TokenEstimator;
use crate::context::summarizer::summary_turn_text;
use crate::context::turn::{Conversation, Turn};
use crate::env::ToolExecutor;
use crate::{ChatCompletion, SessionError, ToolCall, ToolDef};
use tracing::debug;

/// Where the controller is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    AwaitModel,
    ModelResponded,
    AwaitTools,
    ToolsResolved,
    Done,
    Fatal,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Done | ControllerState::Fatal)
    }
}

/// Result of one [`Controller::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Tools ran (or the provider paused); call the model again.
    Continue,
    /// The model produced a final answer.
    Answer(String),
    /// `max_turns` model calls have been made.
    TurnLimit,
}

pub struct Controller<'a> {
    config: &'a SessionConfig,
    editor: StructuralEditor<'a>,
    executor: RequestExecutor<'a>,
    tools: &'a dyn ToolExecutor,
    events: &'a dyn EventHandler,
    breakpoints: Option<CacheBreakpointSet>,
    memory_warning: Option<MemoryWarning>,
    state: ControllerState,
    turn: u32,
    edits: Vec<EditEvent>,
    counters: RunCounters,
}

impl<'a> Controller<'a> {
    pub fn new(
        config: &'a SessionConfig,
        estimator: &'a dyn TokenEstimator,
        tool_defs: &'a [ToolDef],
        executor: RequestExecutor<'a>,
        tools: &'a dyn ToolExecutor,
        events: &'a dyn EventHandler,
    ) -> Self {
        let breakpoints = config
            .cache_breakpoints
            .enabled
            .then(|| CacheBreakpointSet::new(config.cache_breakpoints.config.max_breakpoints));
        let memory_warning = config
            .memory_warning
            .enabled
            .then(|| MemoryWarning::new(config.memory_warning.config.ratio));
        Self {
            config,
            editor: StructuralEditor::new(estimator, tool_defs),
            executor,
            tools,
            events,
            breakpoints,
            memory_warning,
            state: ControllerState::AwaitModel,
            turn: 0,
            edits: Vec::new(),
            counters: RunCounters::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Model calls made so far.
    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn editor(&self) -> &StructuralEditor<'a> {
        &self.editor
    }

    pub fn breakpoints(&self) -> Option<&CacheBreakpointSet> {
        self.breakpoints.as_ref()
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    /// Move edits, counters, and costs gathered since the last call into
    /// the artifact.
    pub fn record_into(&mut self, artifact: &mut RunArtifact) {
        artifact.edits.append(&mut self.edits);
        artifact.counters = self.counters.clone();
        artifact.costs = self.executor.costs().clone();
        artifact.updated_at = chrono::Utc::now();
    }

    /// Run one full turn.
    ///
    /// `Err` means the session is over: structural overflow or a request
    /// that could not be completed.
    pub async fn step(&mut self, conv: &mut Conversation) -> Result<TurnOutcome, SessionError> {
        // ── AwaitModel ──
        self.state = ControllerState::AwaitModel;
        if self.turn >= self.config.max_turns {
            self.events.on_event(&SessionEvent::TurnLimitReached {
                max_turns: self.config.max_turns,
            });
            self.state = ControllerState::Done;
            return Ok(TurnOutcome::TurnLimit);
        }
        self.turn += 1;

        let budget = self.config.budget;
        let usage = budget.usage(self.editor.estimate(conv));
        self.events.on_event(&SessionEvent::TurnStart {
            turn: self.turn,
            max_turns: self.config.max_turns,
            context_usage: &usage,
        });

        if self.config.trim_on_overflow && usage.over_available() {
            let outcome = self.editor.trim(conv, budget.available());
            let exceeded = outcome.exceeds_after_trim;
            let tokens = outcome.report.tokens_after;
            self.record_edit(conv, outcome.report);
            if exceeded {
                return Err(self.fail(SessionError::StructuralOverflow {
                    tokens,
                    available: budget.available(),
                }));
            }
        }

        if let Some(set) = self.breakpoints.as_mut()
            && let Some(id) = set.maybe_extend(conv, self.turn as usize)
        {
            self.events.on_event(&SessionEvent::BreakpointAdded {
                id,
                turn: self.turn,
            });
        }

        let response = match self.executor.send(conv, &self.editor).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e)),
        };
        for report in response.trims {
            self.record_edit(conv, report);
        }
        self.counters.retries = self.executor.retries();

        // ── ModelResponded ──
        self.state = ControllerState::ModelResponded;
        self.events.on_event(&SessionEvent::ModelResponded {
            turn: self.turn,
            kind: response.kind.label(),
            attempts: response.attempts,
        });
        if let Some(usage) = &response.completion.usage {
            self.events.on_event(&SessionEvent::TokenUsage {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
            });
        }

        let completion = response.completion;
        match response.kind {
            ResponseKind::Malformed(message) => {
                Err(self.fail(SessionError::RetriesExhausted(message)))
            }
            ResponseKind::PlainText(text) => {
                self.push_assistant(conv, &completion, Vec::new());
                self.state = ControllerState::Done;
                self.events
                    .on_event(&SessionEvent::Finished { turns: self.turn });
                Ok(TurnOutcome::Answer(text))
            }
            ResponseKind::Paused | ResponseKind::ServerToolOnly => {
                self.push_assistant(conv, &completion, Vec::new());
                self.state = ControllerState::ToolsResolved;
                self.after_tools(conv).await?;
                Ok(TurnOutcome::Continue)
            }
            ResponseKind::ToolCalls(calls) => {
                self.push_assistant(conv, &completion, calls.clone());

                // ── AwaitTools ──
                self.state = ControllerState::AwaitTools;
                self.dispatch_tools(conv, &calls).await;

                // ── ToolsResolved ──
                self.state = ControllerState::ToolsResolved;
                self.after_tools(conv).await?;
                Ok(TurnOutcome::Continue)
            }
        }
    }

    fn push_assistant(&mut self, conv: &mut Conversation, completion: &ChatCompletion, calls: Vec<ToolCall>) {
        let text = completion.content.clone().unwrap_or_default();
        if !text.is_empty() {
            self.events.on_event(&SessionEvent::Text(&text));
        }
        if let Some(reasoning) = completion.reasoning.as_deref() {
            self.events.on_event(&SessionEvent::Reasoning(reasoning));
        }
        conv.push(
            Turn::assistant(text)
                .with_tool_calls(calls)
                .with_reasoning(
                    completion.reasoning.clone(),
                    completion.reasoning_details.clone(),
                ),
        );
        self.counters.turns += 1;
    }

    /// Run every call and append the results in call order.
    async fn dispatch_tools(&mut self, conv: &mut Conversation, calls: &[ToolCall]) {
        let tools = self.tools;
        let events = self.events;
        let futures = calls.iter().map(|call| {
            events.on_event(&SessionEvent::ToolExecuting {
                name: &call.function.name,
                arguments: &call.function.arguments,
            });
            tools.execute(&call.function.name, &call.function.arguments, &call.id)
        });
        let outcomes = futures::future::join_all(futures).await;

        for (call, outcome) in calls.iter().zip(outcomes) {
            if !outcome.parsed {
                debug!(tool = %call.function.name, "model called an unknown tool");
            }
            self.counters.tool_calls += 1;
            if outcome.is_error {
                self.counters.tool_errors += 1;
            }
            self.events.on_event(&SessionEvent::ToolResult {
                name: &call.function.name,
                call_id: &call.id,
                result: &outcome.text,
                is_error: outcome.is_error,
            });
            conv.push(Turn::tool_result(&call.id, outcome.text));
        }
    }

    /// Memory warning, then the threshold check and compaction.
    async fn after_tools(&mut self, conv: &mut Conversation) -> Result<(), SessionError> {
        let budget = self.config.budget;
        let tokens = self.editor.estimate(conv);

        if let Some(warning) = self.memory_warning.as_mut()
            && warning.check(&budget, tokens)
        {
            conv.push(Turn::user(self.config.memory_warning.config.message.clone()));
            self.counters.memory_warnings += 1;
            self.events.on_event(&SessionEvent::MemoryWarning {
                tokens,
                trigger_threshold: budget.trigger_threshold,
            });
        }

        let tokens = self.editor.estimate(conv);
        if tokens <= budget.trigger_threshold || self.config.strategy == CompactionStrategy::None {
            self.state = ControllerState::AwaitModel;
            return Ok(());
        }

        if let Some(EventResponse::InjectMessage(text)) =
            self.events.on_event(&SessionEvent::PreCompaction {
                strategy: self.config.strategy.name(),
                tokens,
            })
        {
            conv.push(Turn::user(text));
        }

        let report = match &self.config.strategy {
            CompactionStrategy::None => None,
            CompactionStrategy::PartialReset {
                ratio,
                keep_last_tool_call,
            } => Some(
                self.editor
                    .partial_reset(conv, *ratio, *keep_last_tool_call),
            ),
            CompactionStrategy::ClearReasoning { keep_thinking } => {
                Some(self.editor.clear_reasoning(conv, *keep_thinking))
            }
            CompactionStrategy::Summarize => self.summarize(conv).await,
        };
        if let Some(report) = report {
            self.record_edit(conv, report);
        }

        self.state = ControllerState::AwaitModel;
        Ok(())
    }

    /// Ask the model for a carry-over summary and swap it in. A failed or
    /// empty summary leaves the conversation unchanged.
    async fn summarize(&mut self, conv: &mut Conversation) -> Option<EditReport> {
        let request = self.config.summarizer.build_request(
            conv,
            self.editor.tools(),
            &self.config.model,
        );
        let error = match self.executor.complete(&request).await {
            Ok(completion) => match completion.content.as_deref().map(str::trim) {
                Some(summary) if !summary.is_empty() => {
                    return Some(self.editor.apply_summary(conv, &summary_turn_text(summary)));
                }
                _ => "summary response had no content".to_string(),
            },
            Err(e) => e,
        };
        self.counters.retries = self.executor.retries();
        self.events
            .on_event(&SessionEvent::SummaryFailed { error: &error });
        None
    }

    /// Log an edit, reconcile breakpoints, and emit events. No-op edits are
    /// dropped.
    fn record_edit(&mut self, conv: &mut Conversation, report: EditReport) {
        if report.is_noop() {
            return;
        }
        if let Some(set) = self.breakpoints.as_mut() {
            let dropped = set.on_edit(conv, &report.removed);
            if !dropped.is_empty() {
                self.events
                    .on_event(&SessionEvent::BreakpointsDropped { ids: &dropped });
            }
        }
        self.events.on_event(&SessionEvent::EditApplied(&report));
        self.edits.push(EditEvent {
            turn: self.turn,
            report,
        });
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.state = ControllerState::Fatal;
        let message = err.to_string();
        self.events
            .on_event(&SessionEvent::Fatal { error: &message });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{EventObserver, FnEventHandler, NoopHandler};
    use crate::api::executor::CredentialPool;
    use crate::api::retry::RetryConfig;
    use crate::context::budget::Budget;
    use crate::context::editor::EditKind;
    use crate::context::estimator::CharRatioEstimator;
    use crate::context::invariants::check_pairing;
    use crate::env::{NoTools, ToolFuture, ToolOutcome};
    use crate::{ApiError, ChatApi, ChatFuture, ChatRequest};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Scripted {
        replies: Mutex<VecDeque<Result<ChatCompletion, ApiError>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ChatCompletion, ApiError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChatApi for Scripted {
        fn chat<'a>(&'a self, body: &'a ChatRequest, _api_key: &'a str) -> ChatFuture<'a> {
            self.requests.lock().unwrap().push(body.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::Transport("script exhausted".into())));
            Box::pin(async move { reply })
        }
    }

    struct Echo;

    impl ToolExecutor for Echo {
        fn definitions(&self) -> Vec<ToolDef> {
            vec![ToolDef::new(
                "echo",
                "Echo input",
                serde_json::json!({"type": "object"}),
            )]
        }

        fn execute<'a>(&'a self, name: &'a str, arguments: &'a str, _id: &'a str) -> ToolFuture<'a> {
            Box::pin(async move {
                if name == "echo" {
                    ToolOutcome::ok(format!("echo: {arguments}"))
                } else {
                    ToolOutcome::not_found(name)
                }
            })
        }
    }

    fn text(s: &str) -> Result<ChatCompletion, ApiError> {
        Ok(ChatCompletion {
            content: Some(s.into()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        })
    }

    fn calls(ids: &[(&str, &str)], payload: &str) -> Result<ChatCompletion, ApiError> {
        Ok(ChatCompletion {
            tool_calls: ids
                .iter()
                .map(|(id, name)| ToolCall::function(*id, *name, payload))
                .collect(),
            finish_reason: Some("tool_calls".into()),
            ..Default::default()
        })
    }

    fn make_config() -> SessionConfig {
        SessionConfig::default().with_retry(RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: false,
        })
    }

    fn keys() -> CredentialPool {
        CredentialPool::from_csv("k").unwrap()
    }

    #[tokio::test]
    async fn tool_turn_then_answer() {
        let api = Scripted::new(vec![calls(&[("c1", "echo"), ("c2", "nope")], "{}"), text("done")]);
        let config = make_config();
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        assert_eq!(ctl.step(&mut conv).await.unwrap(), TurnOutcome::Continue);
        assert_eq!(ctl.state(), ControllerState::AwaitModel);
        assert_eq!(conv.len(), 4);
        assert_eq!(conv.turns()[2].content, "echo: {}");
        assert!(conv.turns()[3].content.contains("not found"));
        check_pairing(conv.turns()).unwrap();
        assert_eq!(ctl.counters().tool_calls, 2);
        assert_eq!(ctl.counters().tool_errors, 1);

        assert_eq!(
            ctl.step(&mut conv).await.unwrap(),
            TurnOutcome::Answer("done".into())
        );
        assert_eq!(ctl.state(), ControllerState::Done);
        assert_eq!(conv.last().unwrap().content, "done");

        let sent = api.requests.lock().unwrap();
        assert_eq!(sent[0].tools.as_ref().map(Vec::len), Some(1));
        assert_eq!(sent[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        let api = Scripted::new(vec![]);
        let config = make_config();
        let est = CharRatioEstimator::default();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &[], exec, &NoTools, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        let err = ctl.step(&mut conv).await.unwrap_err();
        assert!(matches!(err, SessionError::RetriesExhausted(_)));
        assert!(err.to_string().starts_with(crate::RETRIES_EXHAUSTED));
        assert_eq!(ctl.state(), ControllerState::Fatal);
    }

    #[tokio::test]
    async fn turn_limit_stops_before_calling() {
        let api = Scripted::new(vec![calls(&[("c1", "echo")], "{}")]);
        let config = make_config().with_max_turns(1);
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        assert_eq!(ctl.step(&mut conv).await.unwrap(), TurnOutcome::Continue);
        assert_eq!(ctl.step(&mut conv).await.unwrap(), TurnOutcome::TurnLimit);
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_reset_applies_over_trigger() {
        let big = "x".repeat(2_000);
        let mut replies: Vec<_> = (0..4)
            .map(|i| calls(&[(&*format!("c{i}"), "echo")], &big))
            .collect();
        replies.push(text("done"));
        let api = Scripted::new(replies);
        let config = make_config()
            .with_budget(Budget::new(100_000, 1_000).with_trigger_threshold(2_500))
            .with_strategy(CompactionStrategy::PartialReset {
                ratio: 1.0,
                keep_last_tool_call: true,
            });
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        while ctl.step(&mut conv).await.unwrap() == TurnOutcome::Continue {}

        let mut artifact = RunArtifact::new("cfg", 0, "static_prompt", "m");
        ctl.record_into(&mut artifact);
        assert!(
            artifact
                .edits
                .iter()
                .any(|e| e.report.kind == EditKind::PartialReset)
        );
        check_pairing(conv.turns()).unwrap();
        assert_eq!(conv.first().unwrap().content, "task");
    }

    #[tokio::test]
    async fn summarize_replaces_history_and_failure_retries_next_turn() {
        let big = "y".repeat(3_000);
        let api = Scripted::new(vec![
            calls(&[("c0", "echo")], &big),
            // Summary attempt fails (empty content).
            text(""),
            calls(&[("c1", "echo")], "{}"),
            // Second attempt succeeds.
            text("read two files"),
            text("final"),
        ]);
        let config = make_config()
            .with_trim_on_overflow(false)
            .with_budget(Budget::new(100_000, 1_000).with_trigger_threshold(500))
            .with_strategy(CompactionStrategy::Summarize);
        config.validate().unwrap();
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let failures = Arc::new(Mutex::new(0));
        let f = failures.clone();
        let observer = EventObserver::new(move |e| {
            if let SessionEvent::SummaryFailed { .. } = e {
                *f.lock().unwrap() += 1;
            }
        });
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &observer);
        let mut conv = Conversation::with_prompt("task");

        ctl.step(&mut conv).await.unwrap();
        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(conv.len(), 3, "unchanged after failed summary");

        ctl.step(&mut conv).await.unwrap();
        assert_eq!(conv.len(), 2);
        assert!(conv.turns()[1].content.contains("read two files"));

        let sent = api.requests.lock().unwrap();
        assert_eq!(sent[3].tool_choice, Some(crate::ToolChoice::None));
        drop(sent);

        assert_eq!(
            ctl.step(&mut conv).await.unwrap(),
            TurnOutcome::Answer("final".into())
        );
    }

    #[tokio::test]
    async fn memory_warning_inserted_once_before_trigger() {
        let api = Scripted::new(vec![
            calls(&[("c0", "echo")], &"z".repeat(1_400)),
            calls(&[("c1", "echo")], "{}"),
            text("done"),
        ]);
        let config = make_config()
            .with_budget(Budget::new(100_000, 1_000).with_trigger_threshold(1_000));
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        while ctl.step(&mut conv).await.unwrap() == TurnOutcome::Continue {}
        assert_eq!(ctl.counters().memory_warnings, 1);
        let warning = &config.memory_warning.config.message;
        assert_eq!(
            conv.turns().iter().filter(|t| &t.content == warning).count(),
            1
        );
    }

    #[tokio::test]
    async fn pre_compaction_injection_is_appended() {
        let api = Scripted::new(vec![calls(&[("c0", "echo")], &"w".repeat(2_000)), text("ok")]);
        let config = make_config()
            .with_budget(Budget::new(100_000, 1_000).with_trigger_threshold(200))
            .with_strategy(CompactionStrategy::ClearReasoning { keep_thinking: 1 });
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let handler = FnEventHandler::new(|e| match e {
            SessionEvent::PreCompaction { .. } => {
                Some(EventResponse::InjectMessage("save notes".into()))
            }
            _ => None,
        });
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &handler);
        let mut conv = Conversation::with_prompt("task");

        ctl.step(&mut conv).await.unwrap();
        assert_eq!(conv.last().unwrap().content, "save notes");
        check_pairing(conv.turns()).unwrap();
    }

    #[tokio::test]
    async fn cache_breakpoint_placed_at_milestone() {
        let replies: Vec<_> = (0..10)
            .map(|i| calls(&[(&*format!("c{i}"), "echo")], "{}"))
            .collect();
        let api = Scripted::new(replies);
        let config = make_config();
        let est = CharRatioEstimator::default();
        let defs = Echo.definitions();
        let exec = RequestExecutor::new(&api, &config, keys());
        let mut ctl = Controller::new(&config, &est, &defs, exec, &Echo, &NoopHandler);
        let mut conv = Conversation::with_prompt("task");

        for _ in 0..10 {
            ctl.step(&mut conv).await.unwrap();
        }
        assert_eq!(ctl.breakpoints().map(CacheBreakpointSet::len), Some(1));
        let sent = api.requests.lock().unwrap();
        let last = serde_json::to_value(&sent[9]).unwrap();
        let marked = last["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["content"][0]["cache_control"]["type"] == "ephemeral")
            .count();
        assert_eq!(marked, 1);
    }
}
