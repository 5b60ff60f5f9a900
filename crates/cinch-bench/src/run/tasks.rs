//! Task declarations and their expansion into concrete runs.
//!
//! A task file is a JSON array of [`TaskDecl`]. Declarations that differ
//! only in `env_params.seed` form one config group sharing a `config_id`;
//! each group is expanded into `max(len(group), runs_per_config)` runs.

use crate::env::ToolConfig;
use crate::json_schema_for;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Number of hex digits of the declaration hash kept in a `config_id`.
const CONFIG_HASH_LEN: usize = 12;

/// One entry in a task file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    /// Human-readable label, used as the `config_id` prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Registered environment class, e.g. `static_prompt`.
    pub env_class: String,
    /// Parameters passed to the environment factory. `seed` is excluded
    /// from config grouping.
    #[serde(default = "empty_params")]
    pub env_params: serde_json::Value,
    /// Tools exposed to the model for this task.
    #[serde(default)]
    pub tool_configs: Vec<ToolConfig>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TaskDecl {
    pub fn seed(&self) -> Option<u64> {
        self.env_params.get("seed").and_then(serde_json::Value::as_u64)
    }

    /// Stable identifier shared by every declaration in the same config group.
    pub fn config_id(&self) -> String {
        let mut params = self.env_params.clone();
        if let Some(map) = params.as_object_mut() {
            map.remove("seed");
        }
        // serde_json maps are sorted, so this serialization is canonical.
        let canonical = serde_json::json!({
            "name": self.name,
            "env_class": self.env_class,
            "env_params": params,
            "tool_configs": self.tool_configs,
        })
        .to_string();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let hash = digest.get(..CONFIG_HASH_LEN).unwrap_or(&digest);

        let label = self.name.as_deref().unwrap_or(&self.env_class);
        format!("{}-{hash}", slugify(label))
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes.
fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

/// Declarations sharing a `config_id`, in declaration order.
#[derive(Debug, Clone)]
pub struct ConfigGroup {
    pub config_id: String,
    pub members: Vec<TaskDecl>,
}

/// The unit of work handed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    pub config_id: String,
    pub run_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub env_class: String,
    pub env_params: serde_json::Value,
    #[serde(default)]
    pub tool_configs: Vec<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl RunTask {
    /// `config_id/run_<n>`, used in logs and resume listings.
    pub fn key(&self) -> String {
        format!("{}/run_{}", self.config_id, self.run_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskFileError {
    #[error("failed to read task file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task file does not match the declaration schema:\n{}", .0.join("\n"))]
    Schema(Vec<String>),
    #[error("declaration schema is invalid: {0}")]
    InvalidSchema(String),
    #[error("task file declares no tasks")]
    Empty,
}

/// JSON Schema of a task file (an array of [`TaskDecl`]).
pub fn task_file_schema() -> serde_json::Value {
    json_schema_for::<Vec<TaskDecl>>()
}

/// Read and validate a task file.
pub fn load_declarations(path: &Path) -> Result<Vec<TaskDecl>, TaskFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| TaskFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_declarations(&text)
}

/// Validate task-file JSON against the declaration schema, then deserialize.
pub fn parse_declarations(text: &str) -> Result<Vec<TaskDecl>, TaskFileError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    validate_against(&task_file_schema(), &value)?;

    let decls: Vec<TaskDecl> = serde_json::from_value(value)?;
    if decls.is_empty() {
        return Err(TaskFileError::Empty);
    }
    Ok(decls)
}

fn validate_against(schema: &serde_json::Value, value: &serde_json::Value) -> Result<(), TaskFileError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| TaskFileError::InvalidSchema(e.to_string()))?;
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TaskFileError::Schema(errors))
    }
}

/// Group declarations by `config_id`, keeping first-seen order.
pub fn group(decls: Vec<TaskDecl>) -> Vec<ConfigGroup> {
    let mut groups: Vec<ConfigGroup> = Vec::new();
    for decl in decls {
        let config_id = decl.config_id();
        match groups.iter_mut().find(|g| g.config_id == config_id) {
            Some(group) => group.members.push(decl),
            None => groups.push(ConfigGroup {
                config_id,
                members: vec![decl],
            }),
        }
    }
    groups
}

/// Expand groups into runs. Run `i` of a group uses member `i mod len`, so
/// seeds are cycled when `runs_per_config` exceeds the group size.
pub fn expand(groups: &[ConfigGroup], runs_per_config: usize) -> Vec<RunTask> {
    let mut tasks = Vec::new();
    for group in groups {
        let runs = group.members.len().max(runs_per_config);
        debug!(
            config_id = %group.config_id,
            members = group.members.len(),
            runs,
            "expanding config group"
        );
        for run_id in 0..runs {
            let decl = &group.members[run_id % group.members.len()];
            tasks.push(RunTask {
                config_id: group.config_id.clone(),
                run_id,
                name: decl.name.clone(),
                env_class: decl.env_class.clone(),
                env_params: decl.env_params.clone(),
                tool_configs: decl.tool_configs.clone(),
                seed: decl.seed(),
            });
        }
    }
    tasks
}

/// Parse, group, and expand in one call.
pub fn plan(decls: Vec<TaskDecl>, runs_per_config: usize) -> Vec<RunTask> {
    expand(&group(decls), runs_per_config)
}
