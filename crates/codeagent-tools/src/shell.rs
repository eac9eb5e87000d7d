use crate::require_str;
use anyhow::{Result, anyhow};
use codeagent_core::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait ShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        let mut child = spawn_command(cmd, cwd)?;

        let status = child.wait_timeout(timeout)?;
        if status.is_none() {
            child.kill()?;
            let output = child.wait_with_output()?;
            return Ok(ShellRunResult {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: true,
            });
        }

        let output = child.wait_with_output()?;
        Ok(ShellRunResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            timed_out: false,
        })
    }
}

fn spawn_command(cmd: &str, cwd: &Path) -> Result<Child> {
    let cwd = if cwd.exists() {
        std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
    } else {
        cwd.to_path_buf()
    };
    let mut errors = Vec::new();
    for mut command in candidate_commands(cmd) {
        command.current_dir(&cwd);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(Stdio::null());
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(target_os = "windows")]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut cmd_shell = Command::new("cmd");
    cmd_shell.arg("/C").arg(cmd);
    commands.push(cmd_shell);

    let mut ps_shell = Command::new("powershell");
    ps_shell
        .arg("-NoLogo")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(cmd);
    commands.push(ps_shell);

    commands
}

#[cfg(not(target_os = "windows"))]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut sh_shell = Command::new("sh");
    sh_shell.arg("-lc").arg(cmd);
    commands.push(sh_shell);

    let mut bash_shell = Command::new("bash");
    bash_shell.arg("-lc").arg(cmd);
    commands.push(bash_shell);

    commands
}

/// Run a shell command inside the workspace with a bounded runtime.
pub struct RunCommandTool {
    workspace: PathBuf,
    runner: PlatformShellRunner,
}

impl RunCommandTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            runner: PlatformShellRunner,
        }
    }
}

impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "run a shell command in the workspace. arguments: command (string, required), timeout_seconds (integer, defaults to 60)"
    }

    fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let command = require_str(args, "command")?;
        let timeout = match args.get("timeout_seconds") {
            None | Some(Value::Null) => DEFAULT_TIMEOUT,
            Some(value) => {
                let secs = value
                    .as_u64()
                    .filter(|s| *s >= 1)
                    .ok_or_else(|| anyhow!("argument 'timeout_seconds' must be an integer >= 1"))?;
                Duration::from_secs(secs)
            }
        };

        let result = self.runner.run(command, &self.workspace, timeout)?;
        Ok(render_result(&result))
    }
}

fn render_result(result: &ShellRunResult) -> String {
    let code = result
        .status
        .map(|c| c.to_string())
        .unwrap_or_else(|| "killed".to_string());
    let mut out = format!("returncode: {code}\n");
    if result.timed_out {
        out.push_str("command timed out\n");
    }
    if !result.stdout.is_empty() {
        out.push_str(&format!("stdout:\n{}\n", clip(&result.stdout)));
    }
    if !result.stderr.is_empty() {
        out.push_str(&format!("stderr:\n{}\n", clip(&result.stderr)));
    }
    out.trim_end().to_string()
}

fn clip(text: &str) -> String {
    if text.chars().count() <= OUTPUT_LIMIT {
        return text.trim_end().to_string();
    }
    let clipped: String = text.chars().take(OUTPUT_LIMIT).collect();
    format!("{}\n... output truncated", clipped.trim_end())
}
