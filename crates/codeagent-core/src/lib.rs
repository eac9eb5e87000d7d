use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Action name the model emits to end a run with a final answer.
pub const FINISH_ACTION: &str = "finish";

/// Name of the designated task-completion tool. Dispatching it with a
/// successful observation terminates the run.
pub const TASK_COMPLETE_TOOL: &str = "task_complete";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".codeagent")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn. History is an ordered, append-only sequence of
/// these; it is replayed verbatim to the model, so order matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One reasoning iteration: what the model thought, what it did, and what
/// came back. Immutable once recorded; discarded at the end of the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub thought: String,
    pub action: String,
    pub action_input: Value,
    pub observation: String,
    pub raw: String,
}

/// A planner-produced intended action. Advisory to the control loop;
/// mutated only through the planner's own completion entrypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub action: String,
    pub reason: String,
    pub completed: bool,
}

/// A named, described, invocable capability. Native tools and MCP-backed
/// adapters both live behind this trait; the control loop never depends on
/// which variant it is holding.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn execute(&self, args: &Map<String, Value>) -> Result<String>;
}

/// External planning collaborator. The control loop asks it for a plan up
/// front and reports completions back; it never depends on how the plan
/// was produced.
pub trait Planner: Send {
    fn plan(&mut self, task: &str) -> Result<Vec<PlanStep>>;
    fn mark_completed(&mut self, step_number: u32, observation: &str);
    fn render(&self) -> String;
}

/// Fatal error taxonomy. Recoverable loop conditions (unknown tool, bad
/// arguments, tool failure) never appear here; they are fed back to the
/// model as observation text.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error("llm provider request failed (status {status:?}): {detail}")]
    Provider {
        status: Option<u16>,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: "https://api.deepseek.com".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            timeout_seconds: 600,
            max_retries: 2,
            retry_base_ms: 1000,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub enable_planning: bool,
    pub enable_compression: bool,
    /// Compress once the history holds this many user turns.
    pub compress_every: usize,
    /// Number of recent turns (2 messages each) kept verbatim.
    pub keep_recent: usize,
    pub completion_tool: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            enable_planning: true,
            enable_compression: true,
            compress_every: 5,
            keep_recent: 3,
            completion_tool: TASK_COMPLETE_TOOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpRuntimeConfig {
    /// Path of the server configuration file, relative to the workspace.
    pub config_path: String,
    /// Bounded polling budget for one capability round trip.
    pub rpc_poll_attempts: u32,
    pub rpc_poll_interval_ms: u64,
}

impl Default for McpRuntimeConfig {
    fn default() -> Self {
        Self {
            config_path: "mcp_config.json".to_string(),
            rpc_poll_attempts: 50,
            rpc_poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub mcp: McpRuntimeConfig,
}

impl AppConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    /// Load settings from the workspace runtime dir; missing file means
    /// defaults.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::settings_path(workspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_roles_serialize_lowercase() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn step_defaults_to_null_input() {
        let step = Step::default();
        assert!(step.action_input.is_null());
        assert!(step.action.is_empty());
    }

    #[test]
    fn config_round_trip_through_settings_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::default();
        cfg.agent.max_steps = 7;
        cfg.mcp.rpc_poll_attempts = 3;
        cfg.save(tmp.path()).expect("save");

        let loaded = AppConfig::load(tmp.path()).expect("load");
        assert_eq!(loaded.agent.max_steps, 7);
        assert_eq!(loaded.mcp.rpc_poll_attempts, 3);
        assert_eq!(loaded.llm.model, "deepseek-chat");
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = AppConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.agent.max_steps, 200);
        assert_eq!(cfg.agent.compress_every, 5);
        assert_eq!(cfg.agent.keep_recent, 3);
        assert_eq!(cfg.mcp.rpc_poll_attempts, 50);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = AppConfig::settings_path(tmp.path());
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, r#"{"agent": {"max_steps": 3}}"#).expect("write");

        let cfg = AppConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.agent.max_steps, 3);
        assert!(cfg.agent.enable_compression);
        assert_eq!(cfg.llm.api_key_env, "DEEPSEEK_API_KEY");
    }
}
