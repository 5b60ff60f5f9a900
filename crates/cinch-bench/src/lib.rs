//! Context-budgeted agent sessions and a resumable parallel benchmark runner.
//!
//! `cinch-bench` drives multi-turn tool-use conversations against an
//! OpenAI-compatible chat completions endpoint and keeps each conversation
//! inside the model's context window for an unbounded number of turns. Many
//! such sessions are fanned out across a worker pool, persisted after every
//! turn, and resumed after a crash or interrupt.
//!
//! # Where to find things
//!
//! - **Conversation model:** [`Turn`](context::turn::Turn) and
//!   [`Conversation`](context::turn::Conversation), an arena of turns with
//!   stable IDs. The tool-call/result pairing check lives in
//!   [`context::invariants`].
//!
//! - **Shrinking the conversation:** [`StructuralEditor`](context::editor::StructuralEditor)
//!   implements trim, partial reset, summary replacement, and reasoning
//!   clearing. Token counts come from a [`TokenEstimator`](context::estimator::TokenEstimator).
//!
//! - **Talking to the model:** [`ChatApi`] is the transport seam and
//!   [`HttpChatClient`] the production implementation.
//!   [`RequestExecutor`](api::executor::RequestExecutor) layers retry, backoff,
//!   credential rotation, and response classification on top.
//!
//! - **Running a session:** [`SessionRunner`](agent::session::SessionRunner)
//!   loops the [`Controller`](agent::controller::Controller) state machine
//!   until the model produces a final answer, then scores it with the
//!   [`Environment`](env::Environment).
//!
//! - **Running a batch:** [`run::tasks`] expands task declarations into
//!   config groups, [`Orchestrator`](run::pool::Orchestrator) fans them out,
//!   and [`ResumeScanner`](run::resume::ResumeScanner) decides what to re-run.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Turns, token estimation, budget, structural edits, cache breakpoints |
//! | [`api`] | Request executor, retry policy, cost tracking |
//! | [`agent`] | Session config, controller state machine, session runner, events, artifacts |
//! | [`env`] | Environment and tool-execution collaborators |
//! | [`run`] | Task expansion, worker pool, summary, resume |

pub mod agent;
pub mod api;
pub mod context;
pub mod env;
pub mod exit_codes;
pub mod logging;
pub mod run;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for benchmark sessions.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// ```
/// use cinch_bench::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct GrepArgs {
///     pattern: String,
///     #[serde(default)]
///     path: Option<String>,
/// }
///
/// let schema = json_schema_for::<GrepArgs>();
/// assert_eq!(schema["type"], "object");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body (OpenAI-compatible). Unused optional fields
/// are omitted from serialization.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,

    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// How the model may use the declared tools.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

/// Reasoning effort level for extended thinking / chain-of-thought models.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    High,
    Medium,
    Low,
    Minimal,
}

/// Configuration for extended thinking / reasoning tokens.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message as sent over the wire.
#[derive(Serialize, Clone, Debug)]
pub struct WireMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<serde_json::Value>,
}

/// Message content: a bare string, or content parts when a cache
/// breakpoint is attached.
#[derive(Serialize, Clone, Debug)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A text content part, optionally carrying a prompt-cache breakpoint.
#[derive(Serialize, Clone, Debug)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: "text",
            text: text.into(),
            cache_control: None,
        }
    }

    /// A text part marked as a prompt-cache breakpoint.
    pub fn cached_text(text: impl Into<String>) -> Self {
        Self {
            cache_control: Some(CacheControl::ephemeral()),
            ..Self::text(text)
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self { kind: "ephemeral" }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    reasoning_details: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from [`ChatApi::chat`].
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
    /// Reasoning / extended thinking content returned by the model.
    pub reasoning: Option<String>,
    /// Provider-specific reasoning sidecar (signatures, encrypted blocks).
    pub reasoning_details: Option<serde_json::Value>,
}

/// Token usage statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PromptTokensDetails {
    pub cached_tokens: Option<u32>,
}

impl UsageInfo {
    /// Prompt tokens served from the provider's prompt cache.
    pub fn cached_tokens(&self) -> u32 {
        self.prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}

/// Decode a successful (2xx) response body.
pub fn parse_completion(text: &str) -> Result<ChatCompletion, ApiError> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))?;

    if let Some(err) = parsed.error {
        return Err(ApiError::Provider(err.message));
    }

    let choice = parsed.choices.and_then(|c| c.into_iter().next());
    Ok(match choice {
        Some(c) => ChatCompletion {
            content: c.message.content,
            tool_calls: c.message.tool_calls.unwrap_or_default(),
            usage: parsed.usage,
            finish_reason: c.finish_reason,
            reasoning: c.message.reasoning_content.or(c.message.reasoning),
            reasoning_details: c.message.reasoning_details,
        },
        None => ChatCompletion {
            usage: parsed.usage,
            ..Default::default()
        },
    })
}

// ── Errors ─────────────────────────────────────────────────────────

/// Failure of a single chat request attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        /// Parsed `retry-after` header, if the provider sent one.
        retry_after: Option<Duration>,
    },
    /// The request never produced a response (DNS, connect, timeout).
    #[error("request failed: {0}")]
    Transport(String),
    /// The body could not be decoded.
    #[error("failed to parse response: {0}")]
    Decode(String),
    /// A 2xx response carrying an `error` object.
    #[error("provider error: {0}")]
    Provider(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Prefix of the error recorded when a request exhausts its retries. The
/// resume scanner matches on it.
pub const RETRIES_EXHAUSTED: &str = "request retries exhausted";

/// Prefix of the error recorded when trimming cannot bring a conversation
/// under budget.
pub const STRUCTURAL_OVERFLOW: &str = "context budget exceeded after trimming";

/// Why a session stopped without an answer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Only the prompt (or an in-flight tool span) is left and the estimate
    /// is still above the available budget.
    #[error("{marker}: {tokens} tokens > {available} available", marker = STRUCTURAL_OVERFLOW)]
    StructuralOverflow { tokens: usize, available: usize },

    /// The request executor gave up on a turn.
    #[error("{marker}: {0}", marker = RETRIES_EXHAUSTED)]
    RetriesExhausted(String),

    #[error(transparent)]
    Environment(#[from] env::EnvError),

    #[error(transparent)]
    Persistence(#[from] agent::artifact::ArtifactError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

// ── Transport seam ─────────────────────────────────────────────────

/// Boxed future returned by [`ChatApi::chat`].
pub type ChatFuture<'a> = Pin<Box<dyn Future<Output = Result<ChatCompletion, ApiError>> + Send + 'a>>;

/// One chat completion round-trip with a given credential.
///
/// The executor owns retries and credential choice; implementors perform a
/// single attempt.
pub trait ChatApi: Send + Sync {
    fn chat<'a>(&'a self, body: &'a ChatRequest, api_key: &'a str) -> ChatFuture<'a>;
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct HttpChatClient {
    client: reqwest::Client,
    url: String,
}

impl HttpChatClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cinch-bench/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn send(&self, body: &ChatRequest, api_key: &str) -> Result<ChatCompletion, ApiError> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(api::retry::parse_retry_after);
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(format!("failed to read response: {e}")))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: text,
                retry_after,
            });
        }

        let completion = parse_completion(&text)?;
        debug!(
            "LLM output: {} chars text, {} tool call(s), finish={:?}",
            completion.content.as_ref().map_or(0, |s| s.len()),
            completion.tool_calls.len(),
            completion.finish_reason,
        );
        Ok(completion)
    }
}

impl ChatApi for HttpChatClient {
    fn chat<'a>(&'a self, body: &'a ChatRequest, api_key: &'a str) -> ChatFuture<'a> {
        Box::pin(self.send(body, api_key))
    }
}
