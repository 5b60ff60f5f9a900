//! Parallel run orchestration.
//!
//! [`Orchestrator::run`] consults the [`ResumeScanner`], then fans the
//! remaining tasks out over a `JoinSet` bounded by a semaphore of `workers`
//! permits. Each worker owns one session; the only shared state is the
//! output directory, written to disjoint per-run files.
//!
//! Cancellation: once the token fires, tasks not yet holding a permit are
//! skipped and in-flight sessions stop at their next turn boundary.

use super::resume::ResumeScanner;
use super::summary::BatchSummary;
use super::tasks::RunTask;
use crate::agent::artifact::{ArtifactStore, RunArtifact, RunStatus};
use crate::agent::config::SessionConfig;
use crate::agent::events::{EventHandler, NoopHandler};
use crate::agent::session::SessionRunner;
use crate::api::executor::CredentialPool;
use crate::env::{CommandToolExecutor, EnvironmentRegistry};
use crate::{ChatApi, exit_codes};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default number of concurrent sessions.
pub const DEFAULT_WORKERS: usize = 4;

/// Result of one [`Orchestrator::run`] call.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Artifacts of the runs executed by this call.
    pub executed: Vec<RunArtifact>,
    /// Runs already done before this call.
    pub already_done: usize,
    /// Runs never scheduled because of cancellation.
    pub skipped: usize,
    pub interrupted: bool,
    pub summary: BatchSummary,
}

impl BatchOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_codes::INTERRUPTED
        } else if self.skipped == 0 && self.summary.overall.all_done() {
            exit_codes::OK
        } else {
            exit_codes::FAILED
        }
    }
}

/// Everything one worker needs, cloned per task.
#[derive(Clone)]
struct Worker {
    api: Arc<dyn ChatApi>,
    config: Arc<SessionConfig>,
    registry: Arc<EnvironmentRegistry>,
    store: ArtifactStore,
    events: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    tool_workdir: Option<PathBuf>,
}

impl Worker {
    async fn execute(&self, task: &RunTask, credentials: CredentialPool) -> RunArtifact {
        let env = match self.registry.build(&task.env_class, &task.env_params) {
            Ok(env) => env,
            Err(e) => return self.record_failure(task, e.to_string()),
        };
        let mut tools = CommandToolExecutor::new(task.tool_configs.clone());
        if let Some(dir) = &self.tool_workdir {
            tools = tools.with_workdir(dir);
        }

        let runner =
            SessionRunner::new(self.api.as_ref(), &self.config, &self.store, self.events.as_ref())
                .with_cancellation(self.cancel.clone());
        match runner.run(task, env, &tools, credentials).await {
            Ok(artifact) => artifact,
            Err(e) => self.record_failure(task, e.to_string()),
        }
    }

    /// Record a task that failed outside the session loop as `status=error`.
    fn record_failure(&self, task: &RunTask, message: String) -> RunArtifact {
        error!("{}: {message}", task.key());
        let mut artifact = match self.store.load(&task.config_id, task.run_id) {
            Ok(Some(existing)) => existing,
            _ => {
                let mut fresh =
                    RunArtifact::new(&task.config_id, task.run_id, &task.env_class, &self.config.model);
                fresh.name = task.name.clone();
                fresh.seed = task.seed;
                fresh
            }
        };
        artifact.finish(RunStatus::Error, Some(message));
        if let Err(e) = self.store.save(&artifact) {
            warn!("{}: could not write error artifact: {e}", task.key());
        }
        artifact
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

/// Supervisor for a batch of runs.
pub struct Orchestrator {
    worker: Worker,
    credentials: CredentialPool,
    workers: usize,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        config: SessionConfig,
        credentials: CredentialPool,
        store: ArtifactStore,
    ) -> Self {
        Self {
            worker: Worker {
                api,
                config: Arc::new(config),
                registry: Arc::new(EnvironmentRegistry::with_builtins()),
                store,
                events: Arc::new(NoopHandler),
                cancel: CancellationToken::new(),
                tool_workdir: None,
            },
            credentials,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_registry(mut self, registry: EnvironmentRegistry) -> Self {
        self.worker.registry = Arc::new(registry);
        self
    }

    pub fn with_events(mut self, events: impl EventHandler + 'static) -> Self {
        self.worker.events = Arc::new(events);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.worker.cancel = cancel;
        self
    }

    /// Working directory for command tools.
    pub fn with_tool_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.worker.tool_workdir = Some(dir.into());
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.worker.cancel.clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.worker.store
    }

    /// Run every task in `tasks` that is not already done, then write the
    /// batch summary over all of `tasks`.
    pub async fn run(&self, tasks: &[RunTask]) -> BatchOutcome {
        let plan = ResumeScanner::new(&self.worker.store).scan(tasks);
        let already_done = plan.done();
        let pending = plan.to_run();
        info!(
            total = tasks.len(),
            pending = pending.len(),
            workers = self.workers,
            "starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        let mut skipped = 0;

        for (index, task) in pending.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.worker.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                skipped = pending.len() - index;
                warn!("cancelled: {skipped} task(s) not scheduled");
                break;
            };

            let worker = self.worker.clone();
            let credentials = self.credentials.starting_at(index);
            let task = task.clone();
            set.spawn(async move {
                let _permit = permit;
                let run = AssertUnwindSafe(worker.execute(&task, credentials))
                    .catch_unwind()
                    .await;
                match run {
                    Ok(artifact) => artifact,
                    Err(payload) => worker.record_failure(&task, panic_message(payload.as_ref())),
                }
            });
        }

        let mut executed = Vec::with_capacity(pending.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(artifact) => {
                    info!(
                        "{}/run_{} finished: {:?}",
                        artifact.config_id, artifact.run_id, artifact.status
                    );
                    executed.push(artifact);
                }
                Err(e) => error!("worker task failed to join: {e}"),
            }
        }

        let summary = self.summarize(tasks, &executed);
        if let Err(e) = summary.write(&self.worker.store) {
            error!("failed to write summary: {e}");
        }

        BatchOutcome {
            executed,
            already_done,
            skipped,
            interrupted: self.worker.cancel.is_cancelled(),
            summary,
        }
    }

    /// Summary over the latest artifact of every declared task.
    fn summarize(&self, tasks: &[RunTask], executed: &[RunArtifact]) -> BatchSummary {
        let mut latest: HashMap<(String, usize), RunArtifact> = executed
            .iter()
            .map(|a| ((a.config_id.clone(), a.run_id), a.clone()))
            .collect();
        let mut artifacts = Vec::with_capacity(tasks.len());
        for task in tasks {
            let key = (task.config_id.clone(), task.run_id);
            if let Some(a) = latest.remove(&key) {
                artifacts.push(a);
            } else if let Ok(Some(a)) = self.worker.store.load(&task.config_id, task.run_id) {
                artifacts.push(a);
            }
        }
        BatchSummary::from_artifacts(&self.worker.config.model, &artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvError, EnvFuture, Environment, Observation, StepResult};
    use crate::{ApiError, ChatCompletion, ChatFuture, ChatRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with the same text.
    struct Answering {
        calls: AtomicUsize,
    }

    impl ChatApi for Answering {
        fn chat<'a>(&'a self, _body: &'a ChatRequest, _key: &'a str) -> ChatFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok::<_, ApiError>(ChatCompletion {
                    content: Some("4".into()),
                    finish_reason: Some("stop".into()),
                    ..Default::default()
                })
            })
        }
    }

    struct PanickingEnv;

    impl Environment for PanickingEnv {
        fn reset(&mut self) -> EnvFuture<'_, Observation> {
            Box::pin(async { panic!("dataset missing") })
        }

        fn step<'a>(&'a mut self, _a: &'a str, _t: bool) -> EnvFuture<'a, StepResult> {
            Box::pin(async { Err(EnvError::Failed("unreachable".into())) })
        }
    }

    fn make_task(config_id: &str, run_id: usize, env_class: &str) -> RunTask {
        RunTask {
            config_id: config_id.into(),
            run_id,
            name: None,
            env_class: env_class.into(),
            env_params: serde_json::json!({"prompt": "2+2?", "answer": "4"}),
            tool_configs: vec![],
            seed: None,
        }
    }

    fn make_orchestrator(dir: &std::path::Path) -> (Orchestrator, Arc<Answering>) {
        let api = Arc::new(Answering {
            calls: AtomicUsize::new(0),
        });
        let registry = EnvironmentRegistry::with_builtins()
            .with("panics", |_| Ok(Box::new(PanickingEnv) as Box<dyn Environment>));
        let orch = Orchestrator::new(
            api.clone(),
            SessionConfig::default(),
            CredentialPool::from_csv("k1,k2").unwrap(),
            ArtifactStore::new(dir),
        )
        .with_registry(registry)
        .with_workers(2);
        (orch, api)
    }

    #[tokio::test]
    async fn runs_all_tasks_and_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, api) = make_orchestrator(dir.path());
        let tasks: Vec<_> = (0..3).map(|i| make_task("cfg", i, "static_prompt")).collect();

        let outcome = orch.run(&tasks).await;
        assert_eq!(outcome.executed.len(), 3);
        assert_eq!(outcome.summary.groups["cfg"].accuracy, Some(1.0));
        assert_eq!(outcome.exit_code(), exit_codes::OK);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert!(orch.store().summary_path().exists());

        // Second run finds everything done.
        let again = orch.run(&tasks).await;
        assert!(again.executed.is_empty());
        assert_eq!(again.already_done, 3);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bad_tasks_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = make_orchestrator(dir.path());
        let tasks = vec![
            make_task("ok", 0, "static_prompt"),
            make_task("unknown", 0, "no_such_env"),
            make_task("boom", 0, "panics"),
        ];

        let outcome = orch.run(&tasks).await;
        assert_eq!(outcome.executed.len(), 3);
        assert_eq!(outcome.summary.groups["ok"].completed, 1);
        assert_eq!(outcome.summary.groups["unknown"].errors, 1);
        assert_eq!(outcome.summary.groups["boom"].errors, 1);
        assert_eq!(outcome.exit_code(), exit_codes::FAILED);

        let boom = orch.store().load("boom", 0).unwrap().unwrap();
        assert!(boom.error.unwrap().contains("dataset missing"));
    }

    #[tokio::test]
    async fn cancelled_batch_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, api) = make_orchestrator(dir.path());
        orch.cancellation().cancel();
        let tasks: Vec<_> = (0..2).map(|i| make_task("cfg", i, "static_prompt")).collect();

        let outcome = orch.run(&tasks).await;
        assert!(outcome.interrupted);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.exit_code(), exit_codes::INTERRUPTED);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }
}
