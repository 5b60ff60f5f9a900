//! Request executor: one model turn with retries, backoff, credential
//! rotation, and response classification.
//!
//! The executor owns everything between "the controller wants a response"
//! and "here is a usable response": building the wire request, re-trying
//! transient failures invisibly, rotating API keys, trimming an outgoing
//! request that no longer fits, and sorting the result into a
//! [`ResponseKind`]. Only exhausted retries and non-retryable client errors
//! surface as [`ResponseKind::Malformed`].

use super::retry::{FailureClass, classify_error};
use super::tracing::{CostTracker, ModelPricing};
use crate::agent::config::SessionConfig;
use crate::context::editor::{EditReport, StructuralEditor};
use crate::context::turn::Conversation;
use crate::{
    ApiError, ChatApi, ChatCompletion, ChatRequest, SessionError, ToolCall, ToolChoice, ToolDef,
};
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Credentials ───────────────────────────────────────────────────

/// Round-robin pool of API keys.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    keys: Vec<String>,
    current: usize,
    rotations: u32,
}

impl CredentialPool {
    /// Build a pool from non-empty keys. Fails when none remain.
    pub fn new<I, S>(keys: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(Into::into)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(SessionError::Config("no API keys configured".into()));
        }
        Ok(Self {
            keys,
            current: 0,
            rotations: 0,
        })
    }

    /// Parse a comma-separated key list (`CINCH_BENCH_API_KEYS`).
    pub fn from_csv(csv: &str) -> Result<Self, SessionError> {
        Self::new(csv.split(','))
    }

    /// Same keys, starting at `offset` so parallel sessions spread load.
    pub fn starting_at(&self, offset: usize) -> Self {
        Self {
            keys: self.keys.clone(),
            current: offset % self.keys.len(),
            rotations: 0,
        }
    }

    pub fn current(&self) -> &str {
        &self.keys[self.current]
    }

    pub fn rotate(&mut self) {
        self.current = (self.current + 1) % self.keys.len();
        self.rotations += 1;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn rotations(&self) -> u32 {
        self.rotations
    }
}

// ── Response classification ───────────────────────────────────────

/// What the model's response means for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Client-side tool calls to dispatch, regardless of finish reason.
    ToolCalls(Vec<ToolCall>),
    /// A final text answer.
    PlainText(String),
    /// The provider paused a long turn (`finish_reason = "pause_turn"`).
    Paused,
    /// Only provider-executed tool blocks; nothing to dispatch.
    ServerToolOnly,
    /// Retries exhausted or a non-retryable rejection.
    Malformed(String),
}

impl ResponseKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResponseKind::ToolCalls(_) => "tool_calls",
            ResponseKind::PlainText(_) => "plain_text",
            ResponseKind::Paused => "paused",
            ResponseKind::ServerToolOnly => "server_tool_only",
            ResponseKind::Malformed(_) => "malformed",
        }
    }
}

/// Sort a completion into a [`ResponseKind`], or explain why it should be
/// retried. Tool calls are detected from the message body, not the finish
/// reason.
pub fn classify_response(completion: &ChatCompletion) -> Result<ResponseKind, String> {
    match completion.finish_reason.as_deref() {
        Some("error") => return Err("provider finished with an error".into()),
        Some("length") => return Err("output truncated (finish_reason=length)".into()),
        _ => {}
    }
    if !completion.tool_calls.is_empty() {
        return Ok(ResponseKind::ToolCalls(completion.tool_calls.clone()));
    }
    match completion.finish_reason.as_deref() {
        Some("pause_turn") => return Ok(ResponseKind::Paused),
        Some("server_tool_use") => return Ok(ResponseKind::ServerToolOnly),
        _ => {}
    }
    match completion.content.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(ResponseKind::PlainText(text.to_string())),
        _ => Err("empty response with no tool calls".into()),
    }
}

/// A classified response plus how it was obtained.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub kind: ResponseKind,
    /// The last completion received. Default when none arrived.
    pub completion: ChatCompletion,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Trims applied to the outgoing request during this call.
    pub trims: Vec<EditReport>,
}

// ── Executor ──────────────────────────────────────────────────────

enum Reaction {
    Retry(Option<Duration>),
    Overflow,
    GiveUp,
}

/// Sends a conversation to the model on behalf of one session.
pub struct RequestExecutor<'a> {
    api: &'a dyn ChatApi,
    config: &'a SessionConfig,
    credentials: CredentialPool,
    pricing: ModelPricing,
    costs: CostTracker,
    seed: Option<u64>,
    retries: u32,
    consecutive_server_errors: u32,
}

impl<'a> RequestExecutor<'a> {
    pub fn new(api: &'a dyn ChatApi, config: &'a SessionConfig, credentials: CredentialPool) -> Self {
        Self {
            api,
            config,
            credentials,
            pricing: config.model_pricing(),
            costs: CostTracker::new(),
            seed: None,
            retries: 0,
            consecutive_server_errors: 0,
        }
    }

    /// Sampling seed sent with every request.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Resume cost accounting from a previous attempt.
    pub fn with_costs(mut self, costs: CostTracker) -> Self {
        self.costs = costs;
        self
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Retries performed over the executor's lifetime.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn credentials(&self) -> &CredentialPool {
        &self.credentials
    }

    /// Build the wire request for the current conversation.
    pub fn build_request(&self, conv: &Conversation, tools: &[ToolDef]) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: conv.to_wire(),
            max_tokens: self.config.max_response_tokens(),
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            seed: self.seed,
            tools: (!tools.is_empty()).then(|| tools.to_vec()),
            tool_choice: (!tools.is_empty()).then_some(ToolChoice::Auto),
            reasoning: self.config.reasoning.clone(),
        }
    }

    /// Obtain a usable response for the conversation.
    ///
    /// Trims `conv` in place when the outgoing request would exceed the
    /// budget (or the provider says it does) and `trim_on_overflow` is set.
    /// Returns `Err` only when trimming cannot make the request fit.
    pub async fn send(
        &mut self,
        conv: &mut Conversation,
        editor: &StructuralEditor<'_>,
    ) -> Result<ModelResponse, SessionError> {
        let available = self.config.budget.available();
        let mut trims = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if self.config.trim_on_overflow && editor.estimate(conv) > available {
                warn!(
                    tokens = editor.estimate(conv),
                    available, "outgoing request over budget, trimming"
                );
                trims.push(trim_to(conv, editor, available)?);
            }

            let request = self.build_request(conv, editor.tools());
            let key = self.credentials.current().to_string();
            let (error, delay) = match self.api.chat(&request, &key).await {
                Ok(completion) => {
                    self.costs
                        .record_usage(completion.usage.as_ref(), &self.pricing);
                    self.consecutive_server_errors = 0;
                    match classify_response(&completion) {
                        Ok(kind) => {
                            debug!(attempt, kind = kind.label(), "model responded");
                            return Ok(ModelResponse {
                                kind,
                                completion,
                                attempts: attempt + 1,
                                trims,
                            });
                        }
                        Err(reason) => (reason, None),
                    }
                }
                Err(err) => match self.react(&err, attempt) {
                    Reaction::Retry(delay) => (err.to_string(), delay),
                    Reaction::Overflow if self.config.trim_on_overflow => {
                        let target = (editor.estimate(conv) * 9 / 10).min(available);
                        warn!(target, "provider rejected request as too long, trimming");
                        trims.push(trim_to(conv, editor, target)?);
                        (err.to_string(), Some(Duration::ZERO))
                    }
                    Reaction::Overflow | Reaction::GiveUp => {
                        return Ok(malformed(
                            format!("{} attempt(s), not retryable: {err}", attempt + 1),
                            attempt + 1,
                            trims,
                        ));
                    }
                },
            };

            if attempt >= self.config.retry.max_retries {
                warn!(attempts = attempt + 1, %error, "giving up on model request");
                return Ok(malformed(
                    format!("{} attempt(s), last error: {error}", attempt + 1),
                    attempt + 1,
                    trims,
                ));
            }

            let delay = delay.unwrap_or_else(|| self.config.retry.delay_for_attempt(attempt));
            warn!(
                attempt = attempt + 1,
                max_retries = self.config.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying model request"
            );
            attempt += 1;
            self.retries += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Send a one-off request (a summary) with the same retry policy but no
    /// trimming or classification. `Err` carries the last error.
    pub async fn complete(&mut self, request: &ChatRequest) -> Result<ChatCompletion, String> {
        let mut attempt: u32 = 0;
        loop {
            let key = self.credentials.current().to_string();
            let (error, delay) = match self.api.chat(request, &key).await {
                Ok(completion) => {
                    self.costs
                        .record_usage(completion.usage.as_ref(), &self.pricing);
                    self.consecutive_server_errors = 0;
                    return Ok(completion);
                }
                Err(err) => match self.react(&err, attempt) {
                    Reaction::Retry(delay) => (err.to_string(), delay),
                    Reaction::Overflow | Reaction::GiveUp => return Err(err.to_string()),
                },
            };
            if attempt >= self.config.retry.max_retries {
                return Err(error);
            }
            let delay = delay.unwrap_or_else(|| self.config.retry.delay_for_attempt(attempt));
            attempt += 1;
            self.retries += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Apply the rotation policy for a failed attempt and say what to do.
    fn react(&mut self, err: &ApiError, attempt: u32) -> Reaction {
        match classify_error(err) {
            FailureClass::Auth => {
                self.rotate("authentication failed");
                Reaction::Retry(Some(Duration::ZERO))
            }
            FailureClass::RateLimited { retry_after } => {
                self.rotate("rate limited");
                Reaction::Retry(Some(
                    self.config.retry.delay_with_hint(attempt, retry_after),
                ))
            }
            FailureClass::Transient => {
                self.consecutive_server_errors += 1;
                if self.consecutive_server_errors % 2 == 0 {
                    self.rotate("repeated server errors");
                }
                Reaction::Retry(None)
            }
            FailureClass::ContextOverflow => Reaction::Overflow,
            FailureClass::Fatal => Reaction::GiveUp,
        }
    }

    fn rotate(&mut self, reason: &str) {
        if self.credentials.len() > 1 {
            self.credentials.rotate();
            info!(
                reason,
                key_index = self.credentials.current,
                keys = self.credentials.len(),
                "rotating API key"
            );
        }
    }
}

fn malformed(message: String, attempts: u32, trims: Vec<EditReport>) -> ModelResponse {
    ModelResponse {
        kind: ResponseKind::Malformed(message),
        completion: ChatCompletion::default(),
        attempts,
        trims,
    }
}

fn trim_to(
    conv: &mut Conversation,
    editor: &StructuralEditor<'_>,
    target: usize,
) -> Result<EditReport, SessionError> {
    let outcome = editor.trim(conv, target);
    if outcome.exceeds_after_trim {
        return Err(SessionError::StructuralOverflow {
            tokens: outcome.report.tokens_after,
            available: target,
        });
    }
    Ok(outcome.report)
}
