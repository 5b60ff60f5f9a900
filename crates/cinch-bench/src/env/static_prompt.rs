//! Built-in `static_prompt` environment: a fixed prompt and an optional
//! expected answer.
//!
//! ```json
//! {"env_class": "static_prompt",
//!  "env_params": {"prompt": "What is 17 * 23?", "answer": "391", "match": "contains"}}
//! ```

use super::{EnvError, EnvFuture, Environment, Observation, StepResult};
use serde::Deserialize;

pub const CLASS: &str = "static_prompt";

/// How the final answer is compared with the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Whole answer equals the expected text (trimmed, case-insensitive).
    Exact,
    /// Expected text appears anywhere in the answer (case-insensitive).
    #[default]
    Contains,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Params {
    prompt: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default, rename = "match")]
    match_mode: MatchMode,
    /// Accepted so seeded configs validate; the prompt is fixed.
    #[serde(default)]
    #[allow(dead_code)]
    seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StaticPromptEnv {
    prompt: String,
    answer: Option<String>,
    match_mode: MatchMode,
}

impl StaticPromptEnv {
    pub fn new(prompt: impl Into<String>, answer: Option<String>) -> Self {
        Self {
            prompt: prompt.into(),
            answer,
            match_mode: MatchMode::default(),
        }
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Self, EnvError> {
        let p: Params =
            serde_json::from_value(params.clone()).map_err(|e| EnvError::InvalidParams {
                env_class: CLASS.to_string(),
                message: e.to_string(),
            })?;
        if p.prompt.trim().is_empty() {
            return Err(EnvError::InvalidParams {
                env_class: CLASS.to_string(),
                message: "prompt must not be empty".into(),
            });
        }
        Ok(Self::new(p.prompt, p.answer).with_match_mode(p.match_mode))
    }

    fn score(&self, final_action: &str) -> Option<bool> {
        let expected = self.answer.as_deref()?.trim().to_lowercase();
        let actual = final_action.trim().to_lowercase();
        Some(match self.match_mode {
            MatchMode::Exact => actual == expected,
            MatchMode::Contains => actual.contains(&expected),
        })
    }
}

impl Environment for StaticPromptEnv {
    fn reset(&mut self) -> EnvFuture<'_, Observation> {
        let obs = Observation {
            prompt: self.prompt.clone(),
            info: serde_json::json!({"env_class": CLASS}),
        };
        Box::pin(async move { Ok(obs) })
    }

    fn step<'a>(
        &'a mut self,
        final_action: &'a str,
        truncated: bool,
    ) -> EnvFuture<'a, StepResult> {
        Box::pin(async move {
            let scored = self.score(final_action);
            let correct = scored.unwrap_or(false);
            Ok(StepResult {
                observation: if correct { "correct" } else { "incorrect" }.to_string(),
                reward: if correct { 1.0 } else { 0.0 },
                terminated: !truncated,
                truncated,
                info: serde_json::json!({
                    "scored": scored.is_some(),
                    "expected": self.answer,
                }),
            })
        })
    }
}
