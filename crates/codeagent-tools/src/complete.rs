use anyhow::Result;
use codeagent_core::Tool;
use serde_json::{Map, Value};

/// The designated completion tool. Dispatching it successfully is the
/// control loop's signal that the task is finished; the observation it
/// returns becomes part of the final step.
pub struct TaskCompleteTool;

impl Tool for TaskCompleteTool {
    fn name(&self) -> &str {
        codeagent_core::TASK_COMPLETE_TOOL
    }

    fn description(&self) -> &str {
        "declare the task finished. arguments: message (string, a short summary of what was done)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        match args.get("message").and_then(Value::as_str) {
            Some(message) if !message.is_empty() => Ok(format!("task complete: {message}")),
            _ => Ok("task complete".to_string()),
        }
    }
}
