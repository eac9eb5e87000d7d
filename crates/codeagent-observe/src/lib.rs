use anyhow::Result;
use chrono::Utc;
use codeagent_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File-backed observer for the agent runtime. Every warning lands in the
/// workspace log file; verbose lines additionally go to stderr.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("agent.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[codeagent]` prefix when verbose mode
    /// is on; always appended to the log file.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[codeagent] {msg}");
        }
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
    }

    /// Log a warning to stderr and the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[codeagent WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
