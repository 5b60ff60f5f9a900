//! Environment and tool-execution collaborators.
//!
//! A session talks to two collaborators it does not own:
//!
//! - An [`Environment`] produces the task prompt on [`reset`](Environment::reset)
//!   and scores the final answer on [`step`](Environment::step), exactly once
//!   per session.
//! - A [`ToolExecutor`] runs the model's tool calls and always answers with
//!   a [`ToolOutcome`], even for unknown tools, so every call gets a result.
//!
//! Environments are built by name from an [`EnvironmentRegistry`]. The
//! registry ships [`static_prompt`]; embedders register their own classes.

pub mod command_tools;
pub mod static_prompt;

use crate::ToolDef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use command_tools::{CommandToolExecutor, ToolConfig};
pub use static_prompt::StaticPromptEnv;

// ── Environment ────────────────────────────────────────────────────

/// Boxed future returned by [`Environment`] methods.
pub type EnvFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EnvError>> + Send + 'a>>;

/// What the agent sees at the start of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// The task prompt, used as the first user turn.
    pub prompt: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// The scored outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: String,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    #[serde(default)]
    pub info: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("unknown environment class '{0}'")]
    UnknownClass(String),
    #[error("invalid parameters for '{env_class}': {message}")]
    InvalidParams { env_class: String, message: String },
    #[error("environment failed: {0}")]
    Failed(String),
}

/// A benchmark environment.
pub trait Environment: Send {
    /// Start a new episode and return the task prompt.
    fn reset(&mut self) -> EnvFuture<'_, Observation>;

    /// Score the final answer. `truncated` is set when the session hit its
    /// turn limit.
    fn step<'a>(&'a mut self, final_action: &'a str, truncated: bool)
    -> EnvFuture<'a, StepResult>;
}

/// Builds an environment from a task's `env_params`.
pub type EnvFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Environment>, EnvError> + Send + Sync>;

/// Environment classes by name.
#[derive(Clone, Default)]
pub struct EnvironmentRegistry {
    factories: BTreeMap<String, EnvFactory>,
}

impl EnvironmentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in classes.
    pub fn with_builtins() -> Self {
        Self::new().with(static_prompt::CLASS, |params| {
            Ok(Box::new(StaticPromptEnv::from_params(params)?) as Box<dyn Environment>)
        })
    }

    /// Register a class (builder pattern). Replaces any existing entry.
    pub fn with<F>(mut self, env_class: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Environment>, EnvError>
            + Send
            + Sync
            + 'static,
    {
        self.register(env_class, factory);
        self
    }

    pub fn register<F>(&mut self, env_class: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Environment>, EnvError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(env_class.into(), Arc::new(factory));
    }

    pub fn contains(&self, env_class: &str) -> bool {
        self.factories.contains_key(env_class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        env_class: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn Environment>, EnvError> {
        let factory = self
            .factories
            .get(env_class)
            .ok_or_else(|| EnvError::UnknownClass(env_class.to_string()))?;
        factory(params)
    }
}

impl std::fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Tool execution ─────────────────────────────────────────────────

/// Result of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// `false` when the tool name was not recognised.
    pub parsed: bool,
    pub is_error: bool,
    pub text: String,
}

impl ToolOutcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            parsed: true,
            is_error: false,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            parsed: true,
            is_error: true,
            text: text.into(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self {
            parsed: false,
            is_error: true,
            text: format!("Error: tool '{name}' not found"),
        }
    }
}

/// Boxed future returned by [`ToolExecutor::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutcome> + Send + 'a>>;

/// Runs tool calls on behalf of a session.
pub trait ToolExecutor: Send + Sync {
    /// Tool schema declared to the model.
    fn definitions(&self) -> Vec<ToolDef>;

    /// Execute one call. Must not fail: errors become
    /// [`ToolOutcome::error`] text the model can read.
    fn execute<'a>(&'a self, name: &'a str, arguments: &'a str, call_id: &'a str)
    -> ToolFuture<'a>;
}

/// An executor with no tools. Every call is "not found".
pub struct NoTools;

impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDef> {
        Vec::new()
    }

    fn execute<'a>(
        &'a self,
        name: &'a str,
        _arguments: &'a str,
        _call_id: &'a str,
    ) -> ToolFuture<'a> {
        Box::pin(async move { ToolOutcome::not_found(name) })
    }
}
