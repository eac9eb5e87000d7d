//! Scripted collaborators for exercising the agent runtime in tests.

use anyhow::{Result, anyhow};
use codeagent_core::{ChatMessage, PlanStep, Planner, Tool};
use codeagent_llm::{ChatOptions, LlmClient};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// An LLM client that plays back canned replies in order and records every
/// request it receives.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedLlm {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for inspecting recorded requests after the client has been
    /// moved into the agent.
    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        Arc::clone(&self.calls)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat(&self, messages: &[ChatMessage], _options: &ChatOptions) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm ran out of replies"))
    }
}

/// A planner that hands out a fixed plan and records every completion it is
/// told about. Construct it with `failing: true` to exercise the
/// planner-failure path.
pub struct ScriptedPlanner {
    steps: Vec<PlanStep>,
    failing: bool,
    completions: Arc<Mutex<Vec<(u32, String)>>>,
}

impl ScriptedPlanner {
    pub fn new(actions: &[&str]) -> Self {
        let steps = actions
            .iter()
            .enumerate()
            .map(|(i, action)| PlanStep {
                step_number: (i + 1) as u32,
                action: action.to_string(),
                reason: format!("step {} of the scripted plan", i + 1),
                completed: false,
            })
            .collect();
        Self {
            steps,
            failing: false,
            completions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self {
            steps: Vec::new(),
            failing: true,
            completions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn completions(&self) -> Arc<Mutex<Vec<(u32, String)>>> {
        Arc::clone(&self.completions)
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&mut self, _task: &str) -> Result<Vec<PlanStep>> {
        if self.failing {
            return Err(anyhow!("scripted planner failure"));
        }
        Ok(self.steps.clone())
    }

    fn mark_completed(&mut self, step_number: u32, observation: &str) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.step_number == step_number) {
            step.completed = true;
        }
        self.completions
            .lock()
            .expect("completions lock")
            .push((step_number, observation.to_string()));
    }

    fn render(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("{}. {} ({})", s.step_number, s.action, s.reason))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Echoes its `text` argument, or the full argument object when there is
/// no `text`.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echo the given text back. arguments: text (string)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        match args.get("text").and_then(Value::as_str) {
            Some(text) => Ok(text.to_string()),
            None => Ok(Value::Object(args.clone()).to_string()),
        }
    }
}

/// Always fails; used to exercise the failure-to-observation path.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "a tool that always fails"
    }

    fn execute(&self, _args: &Map<String, Value>) -> Result<String> {
        Err(anyhow!("boom"))
    }
}

/// Write a shell script that plays the server side of a capability
/// session: it answers `initialize` and `tools/list` with one `ping` tool,
/// then answers `tools/call` requests until its stdin closes.
pub fn write_fake_mcp_server(dir: &Path) -> std::io::Result<PathBuf> {
    let script = dir.join("fake_mcp_server.sh");
    let body = concat!(
        "#!/bin/sh\n",
        "read line\n",
        "printf '%s\\n' '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"protocolVersion\":\"2024-11-05\"}}'\n",
        "read line\n",
        "printf '%s\\n' '{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[{\"name\":\"ping\",\"description\":\"reply with pong\",\"inputSchema\":{\"type\":\"object\",\"properties\":{}}}]}}'\n",
        "id=2\n",
        "while read line; do\n",
        "  id=$((id + 1))\n",
        "  printf '{\"jsonrpc\":\"2.0\",\"id\":%s,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"pong\"}]}}\\n' \"$id\"\n",
        "done\n",
    );
    std::fs::write(&script, body)?;
    Ok(script)
}
