//! One end-to-end benchmark session.
//!
//! [`SessionRunner::run`] resets the environment, loops the
//! [`Controller`] until the model answers (or the session fails, hits its
//! turn limit, or is interrupted), scores the answer with the environment,
//! and writes the [`RunArtifact`] after every turn so a crash loses at most
//! the turn in flight.

use super::artifact::{ArtifactStore, RunArtifact, RunStatus};
use super::config::SessionConfig;
use super::controller::{Controller, TurnOutcome};
use super::events::EventHandler;
use crate::api::executor::{CredentialPool, RequestExecutor};
use crate::context::estimator::default_estimator;
use crate::context::turn::{Conversation, Turn};
use crate::env::{Environment, ToolExecutor};
use crate::run::tasks::RunTask;
use crate::{ChatApi, SessionError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Runs sessions against one model endpoint.
pub struct SessionRunner<'a> {
    api: &'a dyn ChatApi,
    config: &'a SessionConfig,
    store: &'a ArtifactStore,
    events: &'a dyn EventHandler,
    cancel: CancellationToken,
}

impl<'a> SessionRunner<'a> {
    pub fn new(
        api: &'a dyn ChatApi,
        config: &'a SessionConfig,
        store: &'a ArtifactStore,
        events: &'a dyn EventHandler,
    ) -> Self {
        Self {
            api,
            config,
            store,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop at the next turn boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `task` to the end and return its final artifact.
    ///
    /// Session failures (structural overflow, exhausted retries,
    /// environment errors) are recorded in the artifact, not returned.
    /// `Err` means the artifact itself could not be written.
    pub async fn run(
        &self,
        task: &RunTask,
        env: Box<dyn Environment>,
        tools: &dyn ToolExecutor,
        credentials: CredentialPool,
    ) -> Result<RunArtifact, SessionError> {
        let span = info_span!("session", config_id = %task.config_id, run_id = task.run_id);
        self.run_inner(task, env, tools, credentials)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        task: &RunTask,
        mut env: Box<dyn Environment>,
        tools: &dyn ToolExecutor,
        credentials: CredentialPool,
    ) -> Result<RunArtifact, SessionError> {
        let mut artifact = RunArtifact::new(
            &task.config_id,
            task.run_id,
            &task.env_class,
            &self.config.model,
        );
        artifact.name = task.name.clone();
        artifact.seed = task.seed;
        self.store.save(&artifact)?;

        let observation = match env.reset().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!("environment reset failed: {e}");
                artifact.finish(RunStatus::Error, Some(e.to_string()));
                self.store.save(&artifact)?;
                return Ok(artifact);
            }
        };
        artifact.conversation = Conversation::with_prompt(observation.prompt);
        self.store.save(&artifact)?;
        info!(session_id = %artifact.session_id, "session started");

        let estimator = default_estimator(self.config.chars_per_token);
        let tool_defs = tools.definitions();
        let executor =
            RequestExecutor::new(self.api, self.config, credentials).with_seed(task.seed);
        let mut controller = Controller::new(
            self.config,
            estimator.as_ref(),
            &tool_defs,
            executor,
            tools,
            self.events,
        );

        loop {
            if self.cancel.is_cancelled() {
                info!("interrupted at turn boundary");
                controller.record_into(&mut artifact);
                artifact.finish(RunStatus::Interrupted, Some("interrupted".into()));
                break;
            }

            let outcome = controller.step(&mut artifact.conversation).await;
            controller.record_into(&mut artifact);

            match outcome {
                Ok(TurnOutcome::Continue) => {
                    self.store.save(&artifact)?;
                }
                Ok(TurnOutcome::Answer(answer)) => {
                    self.score(&mut artifact, env.as_mut(), &answer, false)
                        .await;
                    break;
                }
                Ok(TurnOutcome::TurnLimit) => {
                    let answer = artifact
                        .conversation
                        .last_assistant_text()
                        .unwrap_or_default()
                        .to_string();
                    self.score(&mut artifact, env.as_mut(), &answer, true)
                        .await;
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    artifact
                        .conversation
                        .push(Turn::assistant(format!("Error: {message}")));
                    artifact.finish(RunStatus::Fatal, Some(message));
                    break;
                }
            }
        }

        self.store.save(&artifact)?;
        info!(
            status = ?artifact.status,
            turns = artifact.counters.turns,
            reward = ?artifact.reward(),
            "{}",
            artifact.costs.summary()
        );
        Ok(artifact)
    }

    /// Call the environment's `step` exactly once and record the outcome.
    async fn score(
        &self,
        artifact: &mut RunArtifact,
        env: &mut dyn Environment,
        answer: &str,
        truncated: bool,
    ) {
        match env.step(answer, truncated).await {
            Ok(result) => {
                artifact.outcome = Some(result);
                let status = if truncated {
                    RunStatus::Truncated
                } else {
                    RunStatus::Completed
                };
                artifact.finish(status, None);
            }
            Err(e) => {
                warn!("scoring failed: {e}");
                artifact.finish(RunStatus::Error, Some(e.to_string()));
            }
        }
    }
}
