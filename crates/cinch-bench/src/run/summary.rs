//! Batch summary written to `<output>/summary.json`.

use crate::agent::artifact::{ArtifactError, ArtifactStore, RunArtifact, RunStatus, write_json_atomic};
use crate::api::tracing::CostTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate statistics over a set of runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub runs: usize,
    pub completed: usize,
    pub truncated: usize,
    pub fatal: usize,
    pub errors: usize,
    pub interrupted: usize,
    /// Mean reward over scored runs.
    pub mean_reward: Option<f64>,
    /// Share of scored runs with reward > 0.
    pub accuracy: Option<f64>,
    pub mean_turns: f64,
    /// Usage and cost summed over every run.
    pub costs: CostTracker,
}

impl RunStats {
    fn from_artifacts<'a>(artifacts: impl IntoIterator<Item = &'a RunArtifact>) -> Self {
        let mut stats = Self::default();
        let mut rewards = Vec::new();
        let mut turns = 0u64;
        for a in artifacts {
            stats.runs += 1;
            match a.status {
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Truncated => stats.truncated += 1,
                RunStatus::Fatal => stats.fatal += 1,
                RunStatus::Error => stats.errors += 1,
                RunStatus::Interrupted | RunStatus::Running => stats.interrupted += 1,
            }
            if let Some(r) = a.reward() {
                rewards.push(r);
            }
            turns += u64::from(a.counters.turns);
            stats.costs.merge(&a.costs);
        }
        if !rewards.is_empty() {
            let n = rewards.len() as f64;
            stats.mean_reward = Some(rewards.iter().sum::<f64>() / n);
            stats.accuracy = Some(rewards.iter().filter(|r| **r > 0.0).count() as f64 / n);
        }
        if stats.runs > 0 {
            stats.mean_turns = turns as f64 / stats.runs as f64;
        }
        stats
    }

    /// Every run finished as completed or truncated.
    pub fn all_done(&self) -> bool {
        self.completed + self.truncated == self.runs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub overall: RunStats,
    /// Keyed by `config_id`.
    pub groups: BTreeMap<String, RunStats>,
}

impl BatchSummary {
    pub fn from_artifacts(model: &str, artifacts: &[RunArtifact]) -> Self {
        let mut by_group: BTreeMap<String, Vec<&RunArtifact>> = BTreeMap::new();
        for a in artifacts {
            by_group.entry(a.config_id.clone()).or_default().push(a);
        }
        Self {
            model: model.to_string(),
            generated_at: Utc::now(),
            overall: RunStats::from_artifacts(artifacts),
            groups: by_group
                .into_iter()
                .map(|(id, runs)| (id, RunStats::from_artifacts(runs)))
                .collect(),
        }
    }

    pub fn write(&self, store: &ArtifactStore) -> Result<(), ArtifactError> {
        write_json_atomic(&store.summary_path(), self)
    }

    /// Multi-line report for the terminal.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} run(s): {} completed, {} truncated, {} fatal, {} error(s), {} interrupted",
            self.overall.runs,
            self.overall.completed,
            self.overall.truncated,
            self.overall.fatal,
            self.overall.errors,
            self.overall.interrupted,
        );
        for (id, s) in &self.groups {
            out.push_str(&format!(
                "\n  {id}: {}/{} completed, accuracy {}, mean turns {:.1}, cost ${:.4}",
                s.completed + s.truncated,
                s.runs,
                s.accuracy
                    .map(|a| format!("{:.1}%", a * 100.0))
                    .unwrap_or_else(|| "n/a".into()),
                s.mean_turns,
                s.costs.estimated_cost_usd,
            ));
        }
        out
    }
}
