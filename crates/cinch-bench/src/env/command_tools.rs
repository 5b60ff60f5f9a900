//! Tools declared in task files and run as shell commands.
//!
//! Each entry of a task's `tool_configs` becomes one function tool. The
//! command template uses `{{param}}` placeholders that are replaced by the
//! call's arguments (single-quoted for the shell); placeholders with no
//! matching argument are removed.
//!
//! ```json
//! {"name": "word_count",
//!  "description": "Count words in a file",
//!  "parameters": {"type": "object", "properties": {"path": {"type": "string"}}},
//!  "command": "wc -w {{path}}"}
//! ```

use super::{ToolExecutor, ToolFuture, ToolOutcome};
use crate::ToolDef;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;

/// One tool as declared in a task file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
    /// Shell command template with `{{param}}` placeholders.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolConfig {
    pub fn definition(&self) -> ToolDef {
        ToolDef::new(&self.name, &self.description, self.parameters.clone())
    }
}

/// Executes [`ToolConfig`] commands with `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandToolExecutor {
    tools: Vec<ToolConfig>,
    workdir: Option<PathBuf>,
    max_result_bytes: usize,
}

impl CommandToolExecutor {
    pub fn new(tools: Vec<ToolConfig>) -> Self {
        Self {
            tools,
            workdir: None,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    async fn run(&self, tool: &ToolConfig, arguments: &str) -> ToolOutcome {
        let args: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) if arguments.trim().is_empty() => {
                debug!("empty arguments for {}: {e}", tool.name);
                serde_json::Value::Object(serde_json::Map::new())
            }
            Err(e) => {
                return ToolOutcome::error(format!(
                    "Error: invalid tool arguments: {e}. \
                     Please provide valid JSON matching the tool's parameter schema."
                ));
            }
        };
        let cmd = render_command(&tool.command, &args);
        info!("[tool] {}: {cmd}", tool.name);

        let mut command = Command::new("sh");
        command.arg("-c").arg(&cmd).kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let timeout = Duration::from_secs(tool.timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS));
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                return ToolOutcome::error(format!("Error executing tool '{}': {e}", tool.name));
            }
            Err(_) => {
                return ToolOutcome::error(format!(
                    "Error: tool '{}' timed out after {}s",
                    tool.name,
                    timeout.as_secs()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let (text, failed) = if !output.status.success() {
            (
                format!(
                    "Tool '{}' exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    tool.name, output.status
                ),
                true,
            )
        } else if stderr.is_empty() {
            (stdout.into_owned(), false)
        } else {
            (format!("{stdout}\n\n[stderr]\n{stderr}"), false)
        };

        let text = truncate_result(text, self.max_result_bytes);
        if failed {
            ToolOutcome::error(text)
        } else {
            ToolOutcome::ok(text)
        }
    }
}

impl ToolExecutor for CommandToolExecutor {
    fn definitions(&self) -> Vec<ToolDef> {
        self.tools.iter().map(ToolConfig::definition).collect()
    }

    fn execute<'a>(
        &'a self,
        name: &'a str,
        arguments: &'a str,
        call_id: &'a str,
    ) -> ToolFuture<'a> {
        Box::pin(async move {
            debug!(call_id, "dispatching {name}");
            match self.tools.iter().find(|t| t.name == name) {
                Some(tool) => self.run(tool, arguments).await,
                None => ToolOutcome::not_found(name),
            }
        })
    }
}

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").ok())
        .as_ref()
}

/// Substitute `{{param}}` placeholders in a command template.
pub fn render_command(template: &str, args: &serde_json::Value) -> String {
    let Some(re) = placeholder_regex() else {
        return template.to_string();
    };
    let rendered = re.replace_all(template, |caps: &regex::Captures<'_>| {
        match args.get(&caps[1]) {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => shell_quote(s),
            Some(other) => shell_quote(&other.to_string()),
        }
    });
    rendered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Truncate a string to at most `max` bytes, appending a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let head = s.get(..end).unwrap_or_default();
    format!("{head}...\n[truncated: {} bytes total]", s.len())
}
