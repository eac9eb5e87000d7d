use crate::{opt_line_number, require_str, resolve_path};
use anyhow::{Result, anyhow};
use codeagent_core::Tool;
use regex::Regex;
use serde_json::{Map, Value};
use std::fs;
use std::path::PathBuf;
use walkdir::WalkDir;

const SKIPPED_DIRS: [&str; 3] = [".git", "target", ".codeagent"];
const LIST_LIMIT: usize = 500;

/// Read a whole file or an inclusive 1-based line range of it.
pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "read a file. arguments: path (string, required), line_start (integer), line_end (integer); line range is 1-based and inclusive"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let raw = require_str(args, "path")?;
        let path = resolve_path(&self.workspace, raw)?;
        if !path.exists() {
            return Ok(format!("file {raw} does not exist"));
        }
        let content = fs::read_to_string(&path)?;

        let line_start = opt_line_number(args, "line_start")?;
        let line_end = opt_line_number(args, "line_end")?;
        if line_start.is_none() && line_end.is_none() {
            return Ok(content);
        }

        let lines: Vec<&str> = content.lines().collect();
        let start = line_start.unwrap_or(1);
        let end = line_end.unwrap_or(lines.len()).min(lines.len());
        if start > end || start > lines.len() {
            return Ok(String::new());
        }
        Ok(lines[start - 1..end].join("\n"))
    }
}

/// Create or overwrite a file, creating parent directories as needed.
pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "create or overwrite a file. arguments: path (string, required), content (string, required)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let raw = require_str(args, "path")?;
        let content = require_str(args, "content")?;
        let path = resolve_path(&self.workspace, raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(format!("wrote {} characters to {raw}", content.chars().count()))
    }
}

/// Line-oriented file edits: insert before a line, replace a range, or
/// delete a range. Lines are 1-based; ranges are inclusive.
pub struct EditFileTool {
    workspace: PathBuf,
}

impl EditFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "edit a file by line. arguments: path (string, required), operation (one of insert/replace/delete, required), line_start (integer, required), line_end (integer, defaults to line_start), content (string, required for insert and replace)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let raw = require_str(args, "path")?;
        let operation = require_str(args, "operation")?;
        let path = resolve_path(&self.workspace, raw)?;
        if !path.exists() {
            return Ok(format!("file {raw} does not exist"));
        }

        let line_start = opt_line_number(args, "line_start")?
            .ok_or_else(|| anyhow!("missing required argument 'line_start'"))?;
        let line_end = opt_line_number(args, "line_end")?.unwrap_or(line_start);
        if line_end < line_start {
            return Err(anyhow!("line_end must not be before line_start"));
        }

        let content = fs::read_to_string(&path)?;
        let had_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        match operation {
            "insert" => {
                let text = require_str(args, "content")?;
                if line_start > lines.len() + 1 {
                    return Err(anyhow!("line_start {line_start} is past the end of the file"));
                }
                let new_lines: Vec<String> = text.lines().map(str::to_string).collect();
                lines.splice(line_start - 1..line_start - 1, new_lines);
            }
            "replace" => {
                let text = require_str(args, "content")?;
                if line_end > lines.len() {
                    return Err(anyhow!("line_end {line_end} is past the end of the file"));
                }
                let new_lines: Vec<String> = text.lines().map(str::to_string).collect();
                lines.splice(line_start - 1..line_end, new_lines);
            }
            "delete" => {
                if line_end > lines.len() {
                    return Err(anyhow!("line_end {line_end} is past the end of the file"));
                }
                lines.drain(line_start - 1..line_end);
            }
            other => {
                return Err(anyhow!(
                    "operation must be one of 'insert', 'replace' or 'delete', got '{other}'"
                ));
            }
        }

        let mut rendered = lines.join("\n");
        if had_trailing_newline && !rendered.is_empty() {
            rendered.push('\n');
        }
        fs::write(&path, rendered)?;
        Ok(format!("applied {operation} to {raw}"))
    }
}

/// Recursive file listing rooted at the workspace, skipping VCS and build
/// directories.
pub struct ListFilesTool {
    workspace: PathBuf,
}

impl ListFilesTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "list files under a directory, recursively. arguments: path (string, defaults to the workspace root)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let raw = match args.get("path") {
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(anyhow!("argument 'path' must be a string")),
            None => ".",
        };
        let root = resolve_path(&self.workspace, raw)?;
        if !root.is_dir() {
            return Ok(format!("directory {raw} does not exist"));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
        });
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            files.push(rel);
        }
        files.sort_unstable();

        if files.is_empty() {
            return Ok("no files found".to_string());
        }
        if files.len() > LIST_LIMIT {
            let shown = files[..LIST_LIMIT].join("\n");
            return Ok(format!(
                "{shown}\n... and {} more files",
                files.len() - LIST_LIMIT
            ));
        }
        Ok(files.join("\n"))
    }
}

/// Regex search inside one file, reporting matching lines with numbers.
pub struct SearchFileTool {
    workspace: PathBuf,
}

impl SearchFileTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

impl Tool for SearchFileTool {
    fn name(&self) -> &str {
        "search_in_file"
    }

    fn description(&self) -> &str {
        "search a file with a regular expression. arguments: path (string, required), pattern (string, required)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let raw = require_str(args, "path")?;
        let pattern = require_str(args, "pattern")?;
        let regex = Regex::new(pattern).map_err(|e| anyhow!("invalid pattern: {e}"))?;

        let path = resolve_path(&self.workspace, raw)?;
        if !path.exists() {
            return Ok(format!("file {raw} does not exist"));
        }
        let content = fs::read_to_string(&path)?;

        let matches: Vec<String> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| regex.is_match(line))
            .map(|(i, line)| format!("{}: {line}", i + 1))
            .collect();
        if matches.is_empty() {
            return Ok(format!("no matches for '{pattern}' in {raw}"));
        }
        Ok(matches.join("\n"))
    }
}
