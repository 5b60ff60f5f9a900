//! Decide which runs still need to execute.
//!
//! The scanner only reads artifacts; [`ResumeScanner::clean`] is the one
//! operation that deletes anything, and only artifacts classified as failed.

use super::tasks::RunTask;
use crate::agent::artifact::{ArtifactError, ArtifactStore, RunArtifact};
use crate::{RETRIES_EXHAUSTED, STRUCTURAL_OVERFLOW};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Where one `(config_id, run_id)` stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResumeState {
    NeverStarted,
    Failed { reason: String },
    Done,
}

impl ResumeState {
    pub fn needs_run(&self) -> bool {
        !matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeEntry {
    pub task: RunTask,
    #[serde(flatten)]
    pub state: ResumeState,
}

/// Scanner output, in task order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumePlan {
    pub entries: Vec<ResumeEntry>,
}

impl ResumePlan {
    /// Tasks to execute to reach full completion.
    pub fn to_run(&self) -> Vec<RunTask> {
        self.entries
            .iter()
            .filter(|e| e.state.needs_run())
            .map(|e| e.task.clone())
            .collect()
    }

    pub fn done(&self) -> usize {
        self.count(|s| matches!(s, ResumeState::Done))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ResumeState::Failed { .. }))
    }

    pub fn never_started(&self) -> usize {
        self.count(|s| matches!(s, ResumeState::NeverStarted))
    }

    fn count(&self, pred: impl Fn(&ResumeState) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.state)).count()
    }
}

pub struct ResumeScanner<'a> {
    store: &'a ArtifactStore,
    patterns: Vec<String>,
}

impl<'a> ResumeScanner<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self {
            store,
            patterns: vec![RETRIES_EXHAUSTED.to_string(), STRUCTURAL_OVERFLOW.to_string()],
        }
    }

    /// Replace the terminal-error patterns matched against the last turn.
    pub fn with_patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn classify(&self, task: &RunTask) -> ResumeState {
        match self.store.load(&task.config_id, task.run_id) {
            Ok(None) => ResumeState::NeverStarted,
            Ok(Some(artifact)) => self.classify_artifact(&artifact),
            Err(e) => {
                warn!("{}: unreadable artifact: {e}", task.key());
                ResumeState::Failed {
                    reason: format!("unreadable artifact: {e}"),
                }
            }
        }
    }

    fn classify_artifact(&self, artifact: &RunArtifact) -> ResumeState {
        if let Some(last) = artifact.conversation.last()
            && let Some(pattern) = self.patterns.iter().find(|p| last.content.contains(p.as_str()))
        {
            return ResumeState::Failed {
                reason: format!("last turn matches '{pattern}'"),
            };
        }
        if !artifact.completed {
            return ResumeState::Failed {
                reason: format!("status {:?}", artifact.status).to_lowercase(),
            };
        }
        ResumeState::Done
    }

    /// Classify every task. Artifacts for runs not in `tasks` are ignored.
    pub fn scan(&self, tasks: &[RunTask]) -> ResumePlan {
        let entries: Vec<ResumeEntry> = tasks
            .iter()
            .map(|task| {
                let state = self.classify(task);
                debug!("{}: {state:?}", task.key());
                ResumeEntry {
                    task: task.clone(),
                    state,
                }
            })
            .collect();
        let plan = ResumePlan { entries };
        info!(
            done = plan.done(),
            failed = plan.failed(),
            never_started = plan.never_started(),
            "resume scan"
        );
        plan
    }

    /// Delete the artifacts of failed runs. Returns how many were removed.
    pub fn clean(&self, plan: &ResumePlan) -> Result<usize, ArtifactError> {
        let mut removed = 0;
        for entry in &plan.entries {
            if matches!(entry.state, ResumeState::Failed { .. })
                && self.store.remove(&entry.task.config_id, entry.task.run_id)?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("removed {removed} failed artifact(s)");
        }
        Ok(removed)
    }
}
