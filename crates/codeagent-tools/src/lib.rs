use anyhow::{Result, anyhow};
use codeagent_core::Tool;
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

mod complete;
mod fs_tools;
mod shell;

pub use complete::TaskCompleteTool;
pub use fs_tools::{EditFileTool, ListFilesTool, ReadFileTool, SearchFileTool, WriteFileTool};
pub use shell::{PlatformShellRunner, RunCommandTool, ShellRunResult, ShellRunner};

/// The built-in tool set, all rooted at the given workspace.
pub fn default_tools(workspace: &Path) -> Vec<Arc<dyn Tool>> {
    let workspace = workspace.to_path_buf();
    vec![
        Arc::new(ReadFileTool::new(workspace.clone())),
        Arc::new(WriteFileTool::new(workspace.clone())),
        Arc::new(EditFileTool::new(workspace.clone())),
        Arc::new(ListFilesTool::new(workspace.clone())),
        Arc::new(SearchFileTool::new(workspace.clone())),
        Arc::new(RunCommandTool::new(workspace)),
        Arc::new(TaskCompleteTool),
    ]
}

/// Resolve a tool-supplied path against the workspace, rejecting anything
/// that would land outside it.
pub(crate) fn resolve_path(workspace: &Path, raw: &str) -> Result<PathBuf> {
    let candidate = Path::new(raw);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(anyhow!("path '{raw}' escapes the workspace"));
    }
    if candidate.is_absolute() {
        if candidate.starts_with(workspace) {
            return Ok(candidate.to_path_buf());
        }
        return Err(anyhow!("path '{raw}' is outside the workspace"));
    }
    Ok(workspace.join(candidate))
}

pub(crate) fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(anyhow!("argument '{key}' must be a string")),
        None => Err(anyhow!("missing required argument '{key}'")),
    }
}

pub(crate) fn opt_line_number(args: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let n = value
                .as_u64()
                .filter(|n| *n >= 1)
                .ok_or_else(|| anyhow!("argument '{key}' must be an integer >= 1"))?;
            Ok(Some(n as usize))
        }
    }
}
