//! Per-run artifacts on disk.
//!
//! Every run writes one JSON file, rewritten after each turn, that holds the
//! full conversation, every structural edit, usage counters, and the final
//! outcome. It is the only durable state the resume scanner looks at.
//!
//! Directory layout:
//! ```text
//! output/
//!   summary.json
//!   arith-3f9c1a2b7d4e/
//!     run_0.json
//!     run_1.json
//! ```

use crate::api::tracing::CostTracker;
use crate::context::editor::EditReport;
use crate::context::turn::Conversation;
use crate::env::StepResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Artifact ───────────────────────────────────────────────────────

/// How a run ended (or that it has not ended yet).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// In progress, or killed before it could finish.
    Running,
    /// The model gave a final answer and the environment scored it.
    Completed,
    /// Cut off at `max_turns`; still scored.
    Truncated,
    /// Structural overflow or exhausted retries.
    Fatal,
    /// The task could not run (bad config, environment failure, panic).
    Error,
    /// Stopped by an interrupt at a turn boundary.
    Interrupted,
}

impl RunStatus {
    /// Whether a run in this state needs no further work.
    pub fn is_done(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Truncated)
    }
}

/// A structural edit together with the turn at which it was applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EditEvent {
    pub turn: u32,
    #[serde(flatten)]
    pub report: EditReport,
}

/// Per-run counters.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    /// Model calls that produced a usable response.
    pub turns: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    /// Invisible retries performed by the request executor.
    pub retries: u32,
    pub memory_warnings: u32,
}

/// Everything persisted about one `(config_id, run_id)`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunArtifact {
    pub config_id: String,
    pub run_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub env_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub model: String,
    /// Unique per attempt, so a resumed run is distinguishable.
    pub session_id: String,
    pub status: RunStatus,
    /// `true` once the run reached a scored end. Never set for fatal runs.
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub conversation: Conversation,
    #[serde(default)]
    pub edits: Vec<EditEvent>,
    #[serde(default)]
    pub costs: CostTracker,
    #[serde(default)]
    pub counters: RunCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunArtifact {
    /// A fresh artifact in the `Running` state with an empty conversation.
    pub fn new(
        config_id: impl Into<String>,
        run_id: usize,
        env_class: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            config_id: config_id.into(),
            run_id,
            name: None,
            env_class: env_class.into(),
            seed: None,
            model: model.into(),
            session_id: crate::api::tracing::generate_session_id(),
            status: RunStatus::Running,
            completed: false,
            error: None,
            conversation: Conversation::new(),
            edits: Vec::new(),
            costs: CostTracker::default(),
            counters: RunCounters::default(),
            outcome: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Mark the run finished in `status`. `completed` follows
    /// [`RunStatus::is_done`].
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.completed = status.is_done();
        self.error = error;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn reward(&self) -> Option<f64> {
        self.outcome.as_ref().map(|o| o.reward)
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ArtifactError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── Store ──────────────────────────────────────────────────────────

/// Atomic write: serialize to a temp file beside `path`, then rename into
/// place. Readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ArtifactError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let json = serde_json::to_string_pretty(value).map_err(|e| ArtifactError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(&tmp_path, json).map_err(|e| ArtifactError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| ArtifactError::io(path, e))?;
    Ok(())
}

/// Read and parse a JSON file. `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ArtifactError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArtifactError::io(path, e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ArtifactError::Json {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Reads and writes run artifacts under an output directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<config_id>/run_<run_id>.json`
    pub fn path(&self, config_id: &str, run_id: usize) -> PathBuf {
        self.root.join(config_id).join(format!("run_{run_id}.json"))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    pub fn save(&self, artifact: &RunArtifact) -> Result<(), ArtifactError> {
        write_json_atomic(&self.path(&artifact.config_id, artifact.run_id), artifact)
    }

    pub fn load(&self, config_id: &str, run_id: usize) -> Result<Option<RunArtifact>, ArtifactError> {
        read_json(&self.path(config_id, run_id))
    }

    /// Delete a run's artifact. Missing files are not an error.
    pub fn remove(&self, config_id: &str, run_id: usize) -> Result<bool, ArtifactError> {
        let path = self.path(config_id, run_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArtifactError::io(&path, e)),
        }
    }
}
