use anyhow::{Result, anyhow};
use codeagent_core::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const STOP_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One server entry from the `mcpServers` configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default = "default_enabled", skip_serializing_if = "is_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn is_enabled(v: &bool) -> bool {
    *v
}

/// The full server configuration file. A missing or unreadable file is
/// treated as an empty configuration, never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl McpConfig {
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &McpServerConfig)> {
        self.servers.iter().filter(|(_, s)| s.enabled)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: json!(id),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One tool as advertised by a server's `tools/list` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Bounded polling budget for one request/response round trip.
#[derive(Debug, Clone, Copy)]
pub struct RpcBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RpcBudget {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_secs(1),
        }
    }
}

impl From<&codeagent_core::McpRuntimeConfig> for RpcBudget {
    fn from(cfg: &codeagent_core::McpRuntimeConfig) -> Self {
        Self {
            attempts: cfg.rpc_poll_attempts,
            interval: Duration::from_millis(cfg.rpc_poll_interval_ms),
        }
    }
}

struct SessionIo {
    next_id: u64,
    stdin: Option<ChildStdin>,
}

/// One live connection to a capability server: a child process speaking
/// newline-delimited JSON-RPC over its stdio. The `io` mutex is held across
/// an entire send-and-await round trip, which gives both monotonically
/// increasing request ids and at most one in-flight request per session.
pub struct McpSession {
    name: String,
    config: McpServerConfig,
    budget: RpcBudget,
    process: Mutex<Option<Child>>,
    io: Mutex<SessionIo>,
    lines: Arc<Mutex<VecDeque<String>>>,
    running: Arc<AtomicBool>,
    tools: Mutex<Vec<ToolSpec>>,
}

impl McpSession {
    pub fn new(name: impl Into<String>, config: McpServerConfig, budget: RpcBudget) -> Self {
        Self {
            name: name.into(),
            config,
            budget,
            process: Mutex::new(None),
            io: Mutex::new(SessionIo {
                next_id: 0,
                stdin: None,
            }),
            lines: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            tools: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the server process, perform the `initialize` handshake, and
    /// cache its advertised tools. On any failure the process is torn down
    /// before the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(env) = &self.config.env {
            cmd.envs(env);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn server '{}': {e}", self.name))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("server '{}' has no stdout", self.name))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("server '{}' has no stdin", self.name))?;

        self.io.lock().expect("io lock").stdin = Some(stdin);
        *self.process.lock().expect("process lock") = Some(child);
        self.running.store(true, Ordering::SeqCst);

        let lines = Arc::clone(&self.lines);
        let running = Arc::clone(&self.running);
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while running.load(Ordering::SeqCst) {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim().to_string();
                        if !line.is_empty() {
                            lines.lock().expect("lines lock").push_back(line);
                        }
                    }
                }
            }
        });

        if let Err(e) = self.handshake() {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn handshake(&self) -> Result<()> {
        self.send_request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "codeagent",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )?;

        let listed = self.send_request("tools/list", Value::Null)?;
        let specs: Vec<ToolSpec> = listed
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| anyhow!("server '{}' listed no tools", self.name))?;
        *self.tools.lock().expect("tools lock") = specs;
        Ok(())
    }

    /// Send one request and poll the line queue for its response. Lines that
    /// are not valid JSON are discarded; responses carrying another id are
    /// put back for later. Each empty poll and each re-queue consumes one
    /// attempt from the budget, so the wait is always bounded.
    fn send_request(&self, method: &str, params: Value) -> Result<Value> {
        let mut io = self.io.lock().expect("io lock");
        io.next_id += 1;
        let id = io.next_id;

        let request = JsonRpcRequest::new(id, method, params);
        let stdin = io
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("server '{}' is not running", self.name))?;
        writeln!(stdin, "{}", serde_json::to_string(&request)?)?;
        stdin.flush()?;

        let mut attempts = 0;
        while attempts < self.budget.attempts {
            let line = self.lines.lock().expect("lines lock").pop_front();
            let Some(line) = line else {
                thread::sleep(self.budget.interval);
                attempts += 1;
                continue;
            };
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) else {
                continue;
            };
            if response.id != json!(id) {
                self.lines.lock().expect("lines lock").push_back(line);
                thread::sleep(self.budget.interval);
                attempts += 1;
                continue;
            }
            if let Some(err) = response.error {
                return Err(anyhow!(
                    "server '{}' rejected {method}: {} (code {})",
                    self.name,
                    err.message,
                    err.code
                ));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
        Err(anyhow!(
            "no response from server '{}' to {method} within {} polls",
            self.name,
            self.budget.attempts
        ))
    }

    /// Invoke a remote tool and flatten its reply to plain text. The first
    /// `content` item's `text` field wins; anything else is serialized.
    pub fn call(&self, tool: &str, arguments: Value) -> Result<String> {
        let result = self.send_request(
            "tools/call",
            json!({"tool": tool, "arguments": arguments}),
        )?;
        let content = result
            .get("content")
            .ok_or_else(|| anyhow!("tool '{tool}' returned no content"))?;
        match content {
            Value::Array(items) => match items.first() {
                Some(first) => {
                    if let Some(text) = first.get("text").and_then(Value::as_str) {
                        Ok(text.to_string())
                    } else {
                        Ok(first.to_string())
                    }
                }
                None => Ok(String::new()),
            },
            other => Ok(other.to_string()),
        }
    }

    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools.lock().expect("tools lock").clone()
    }

    pub fn is_running(&self) -> bool {
        let mut guard = self.process.lock().expect("process lock");
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the server: close its stdin so it can exit on its own, give it
    /// a grace period, then kill it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.io.lock().expect("io lock").stdin.take();
        if let Some(mut child) = self.process.lock().expect("process lock").take() {
            match child.wait_timeout(STOP_GRACE) {
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tool adapter
// ---------------------------------------------------------------------------

/// Presents one remote tool behind the local `Tool` trait. The exposed name
/// is `mcp_<server>_<tool>`, which keeps names unique across servers.
pub struct McpToolAdapter {
    name: String,
    description: String,
    remote_name: String,
    session: Arc<McpSession>,
}

impl McpToolAdapter {
    pub fn new(session: Arc<McpSession>, spec: &ToolSpec) -> Self {
        Self {
            name: adapter_name(session.name(), &spec.name),
            description: render_description(spec),
            remote_name: spec.name.clone(),
            session,
        }
    }
}

impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn execute(&self, args: &Map<String, Value>) -> codeagent_core::Result<String> {
        match self
            .session
            .call(&self.remote_name, Value::Object(args.clone()))
        {
            Ok(text) => Ok(text),
            Err(e) => Ok(format!("mcp call failed: {e}")),
        }
    }
}

pub fn adapter_name(server: &str, tool: &str) -> String {
    format!("mcp_{server}_{tool}")
}

/// Tool description plus a one-line rendering of its input schema, so the
/// model can see parameter names and which are required.
fn render_description(spec: &ToolSpec) -> String {
    let required: Vec<&str> = spec
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut params = Vec::new();
    if let Some(props) = spec.input_schema.get("properties").and_then(Value::as_object) {
        for (name, schema) in props {
            let ty = schema
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any");
            if required.contains(&name.as_str()) {
                params.push(format!("{name} ({ty}, required)"));
            } else {
                params.push(format!("{name} ({ty})"));
            }
        }
    }

    if params.is_empty() {
        spec.description.clone()
    } else {
        format!("{} parameters: {}", spec.description, params.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owns the sessions for every configured server and hands out their tools
/// as trait objects.
pub struct McpRegistry {
    config: McpConfig,
    budget: RpcBudget,
    sessions: BTreeMap<String, Arc<McpSession>>,
}

impl McpRegistry {
    pub fn new(config: McpConfig, budget: RpcBudget) -> Self {
        Self {
            config,
            budget,
            sessions: BTreeMap::new(),
        }
    }

    /// Replace the configuration. Running sessions are kept; they are only
    /// torn down through `stop_one`/`stop_all`.
    pub fn configure(&mut self, config: McpConfig) {
        self.config = config;
    }

    /// Start every enabled server, skipping ones that fail. Returns the
    /// number of servers running afterwards.
    pub fn start_all(&mut self) -> usize {
        let names: Vec<String> = self.config.enabled_servers().map(|(n, _)| n.clone()).collect();
        let mut started = 0;
        for name in names {
            if matches!(self.start_one(&name), Ok(true)) {
                started += 1;
            }
        }
        started
    }

    /// Start one server by name. Unknown or disabled names are not an
    /// error, they report `false`; a spawn or handshake failure is.
    pub fn start_one(&mut self, name: &str) -> Result<bool> {
        let Some(server) = self.config.servers.get(name) else {
            return Ok(false);
        };
        if !server.enabled {
            return Ok(false);
        }
        if let Some(existing) = self.sessions.get(name) {
            if existing.is_running() {
                return Ok(true);
            }
        }
        let session = Arc::new(McpSession::new(name, server.clone(), self.budget));
        session.start()?;
        self.sessions.insert(name.to_string(), session);
        Ok(true)
    }

    pub fn stop_one(&mut self, name: &str) -> bool {
        match self.sessions.remove(name) {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        for (_, session) in std::mem::take(&mut self.sessions) {
            session.stop();
        }
    }

    /// Adapters for every tool of every live session, named
    /// `mcp_<server>_<tool>`.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut out: Vec<Arc<dyn Tool>> = Vec::new();
        for session in self.sessions.values() {
            for spec in session.list_tools() {
                out.push(Arc::new(McpToolAdapter::new(Arc::clone(session), &spec)));
            }
        }
        out
    }

    /// Running-state of every configured server.
    pub fn server_status(&self) -> BTreeMap<String, bool> {
        self.config
            .servers
            .keys()
            .map(|name| {
                let running = self
                    .sessions
                    .get(name)
                    .map(|s| s.is_running())
                    .unwrap_or(false);
                (name.clone(), running)
            })
            .collect()
    }
}
