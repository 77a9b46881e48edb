//! MCP bridge: a long-lived tool-server child process.
//!
//! The bridge owns one child process speaking JSON-RPC 2.0 framed as one
//! JSON object per line over stdin/stdout. It keeps a pending-request map
//! keyed by request id, a line-oriented stdout reader task, and a bounded
//! stderr tail used to enrich crash reports.
//!
//! # Lifecycle
//!
//! [`McpBridge::start`] spawns the child and performs the handshake:
//! `initialize` (expects a non-empty `protocolVersion`), the `initialized`
//! notification, then `tools/list` (must contain `ask_code`). A failed
//! handshake aborts the child and surfaces the error.
//!
//! [`McpBridge::close`] closes stdin and gives the child two seconds to
//! exit before killing it. [`McpBridge::abort`] is the immediate variant of
//! the same graceful-then-forceful shutdown.
//!
//! # Cancellation
//!
//! `ask_code` waits on either the response future or the caller's cancel
//! token. On cancel the child is aborted and [`BridgeError::Cancelled`] is
//! returned; no response is awaited.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lines retained from the child's stderr.
const STDERR_TAIL_LINES: usize = 30;
/// Cap on the stderr excerpt embedded in synthesized errors.
const STDERR_EXCERPT_MAX_CHARS: usize = 1200;
/// Grace period between closing stdin and killing the child.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MCP handshake failed: {0}")]
    Handshake(String),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    /// Error payload surfaced by the `ask_code` tool itself.
    #[error("{0}")]
    Tool(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("failed to spawn MCP process: {0}")]
    Spawn(String),
    #[error("MCP_COMMAND is invalid: {0}")]
    Command(String),
}

/// Child command line plus environment overrides layered on the parent env.
#[derive(Debug, Clone)]
pub struct McpBridgeConfig {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Parse the tool-server command from `MCP_COMMAND` (shell-style quoting).
pub fn resolve_mcp_command<E>(env: E) -> Result<Vec<String>, BridgeError>
where
    E: Fn(&str) -> Option<String>,
{
    let raw = env("MCP_COMMAND").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BridgeError::Command(
            "MCP_COMMAND is not set; point it at the tool server command".to_string(),
        ));
    }

    let parsed = shell_words::split(raw)
        .map_err(|err| BridgeError::Command(format!("unbalanced quoting in '{raw}': {err}")))?;
    if parsed.is_empty() {
        return Err(BridgeError::Command("MCP_COMMAND is empty".to_string()));
    }
    Ok(parsed)
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;
type StderrTail = Arc<Mutex<VecDeque<String>>>;

struct BridgeProcess {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Pending,
    stderr_tail: StderrTail,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// The operations a session needs from its bridge. The agent is written
/// against this trait so tests can substitute a scripted bridge.
#[async_trait]
pub trait AskBridge: Send + Sync {
    async fn start(&self) -> Result<(), BridgeError>;
    async fn ask_code(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError>;
    async fn abort(&self);
    async fn close(&self);
}

/// Bridge over a real child process.
pub struct McpBridge {
    config: McpBridgeConfig,
    process: Mutex<Option<BridgeProcess>>,
}

impl McpBridge {
    pub fn new(config: McpBridgeConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }

    /// Synthesize the message reported when the child dies mid-request:
    /// the base message plus exit code and a truncated stderr excerpt.
    fn build_process_exit_error(
        message: &str,
        exit_code: Option<String>,
        stderr_tail: &[String],
    ) -> String {
        let mut details = Vec::new();
        if let Some(code) = exit_code {
            details.push(format!("exit={code}"));
        }
        if !stderr_tail.is_empty() {
            let mut excerpt = stderr_tail.join(" | ");
            if excerpt.chars().count() > STDERR_EXCERPT_MAX_CHARS {
                let tail: String = excerpt
                    .chars()
                    .skip(excerpt.chars().count() - STDERR_EXCERPT_MAX_CHARS)
                    .collect();
                excerpt = format!("...{tail}");
            }
            details.push(format!("stderr={excerpt}"));
        }

        if details.is_empty() {
            message.to_string()
        } else {
            format!("{message} ({})", details.join("; "))
        }
    }

    async fn process_exit_error(&self, message: &str) -> BridgeError {
        let (exit_code, tail) = {
            let guard = self.process.lock().await;
            match guard.as_ref() {
                Some(proc) => {
                    let exit_code = proc
                        .child
                        .lock()
                        .await
                        .try_wait()
                        .ok()
                        .flatten()
                        .map(|status| match status.code() {
                            Some(code) => code.to_string(),
                            None => format!("{status}"),
                        });
                    let tail: Vec<String> =
                        proc.stderr_tail.lock().await.iter().cloned().collect();
                    (exit_code, tail)
                }
                None => (None, Vec::new()),
            }
        };
        BridgeError::Protocol(Self::build_process_exit_error(message, exit_code, &tail))
    }

    async fn handles(&self) -> Result<(Arc<Mutex<ChildStdin>>, Pending), BridgeError> {
        let guard = self.process.lock().await;
        match guard.as_ref() {
            Some(proc) => Ok((proc.stdin.clone(), proc.pending.clone())),
            None => Err(BridgeError::Protocol("MCP process is not running".to_string())),
        }
    }

    async fn write_line(
        &self,
        stdin: &Arc<Mutex<ChildStdin>>,
        payload: &Value,
    ) -> Result<(), BridgeError> {
        let mut line = payload.to_string();
        line.push('\n');
        let mut guard = stdin.lock().await;
        if let Err(err) = guard.write_all(line.as_bytes()).await {
            return Err(self
                .process_exit_error(&format!("MCP stdin write failed: {err}"))
                .await);
        }
        if let Err(err) = guard.flush().await {
            return Err(self
                .process_exit_error(&format!("MCP stdin flush failed: {err}"))
                .await);
        }
        Ok(())
    }

    /// Send a request and await its response, matching strictly by id.
    async fn request(&self, payload: Value) -> Result<Value, BridgeError> {
        let id = payload
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| BridgeError::Protocol("request without id".to_string()))?;

        let (stdin, pending) = self.handles().await?;
        let (sender, receiver) = oneshot::channel();
        pending.lock().await.insert(id.clone(), sender);

        if let Err(err) = self.write_line(&stdin, &payload).await {
            pending.lock().await.remove(&id);
            return Err(err);
        }

        match receiver.await {
            Ok(response) => Ok(response),
            Err(_) => Err(self.process_exit_error("MCP closed stdout").await),
        }
    }

    async fn handshake(&self) -> Result<(), BridgeError> {
        let init = self
            .request(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
            .await?;
        let protocol = init
            .pointer("/result/protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if protocol.is_empty() {
            return Err(BridgeError::Handshake(
                "initialize response is missing protocolVersion".to_string(),
            ));
        }

        let (stdin, _) = self.handles().await?;
        self.write_line(&stdin, &json!({"jsonrpc": "2.0", "method": "initialized"}))
            .await?;

        let tools = self
            .request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await?;
        let has_ask_code = tools
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .any(|tool| tool.get("name").and_then(Value::as_str) == Some("ask_code"))
            })
            .unwrap_or(false);
        if !has_ask_code {
            return Err(BridgeError::Handshake(
                "tool server does not expose ask_code".to_string(),
            ));
        }

        debug!(protocol, "MCP handshake complete");
        Ok(())
    }

    async fn shutdown(&self) {
        let Some(proc) = self.process.lock().await.take() else {
            return;
        };

        // Closing stdin asks the child to exit on its own; after the grace
        // period it is killed.
        drop(proc.stdin);
        let child = proc.child.clone();
        let exited = tokio::time::timeout(SHUTDOWN_GRACE, async {
            child.lock().await.wait().await
        })
        .await;
        if exited.is_err() {
            warn!("MCP child did not exit within grace period, killing");
            let _ = child.lock().await.kill().await;
        }

        proc.stdout_task.abort();
        proc.stderr_task.abort();
        proc.pending.lock().await.clear();
    }
}

#[async_trait]
impl AskBridge for McpBridge {
    /// Spawn the child, install the readers, and run the handshake.
    /// A bridge whose child is still alive is left untouched.
    async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut guard = self.process.lock().await;
            if let Some(proc) = guard.as_mut() {
                if proc.child.lock().await.try_wait().ok().flatten().is_none() {
                    return Ok(());
                }
            }

            let (program, args) = self
                .config
                .command
                .split_first()
                .ok_or_else(|| BridgeError::Command("empty command".to_string()))?;

            let mut child = Command::new(program)
                .args(args)
                .envs(&self.config.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| BridgeError::Spawn(format!("{program}: {err}")))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| BridgeError::Spawn("child stdin unavailable".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BridgeError::Spawn("child stdout unavailable".to_string()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| BridgeError::Spawn("child stderr unavailable".to_string()))?;

            let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
            let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));

            let reader_pending = pending.clone();
            let stdout_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                        continue;
                    };
                    let Some(id) = message.get("id") else {
                        continue;
                    };
                    let key = match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if let Some(sender) = reader_pending.lock().await.remove(&key) {
                        let _ = sender.send(message);
                    }
                }
                // EOF or read error: dropping the senders fails every
                // pending future; callers synthesize the crash report.
                reader_pending.lock().await.clear();
            });

            let tail = stderr_tail.clone();
            let stderr_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let mut guard = tail.lock().await;
                    guard.push_back(line);
                    while guard.len() > STDERR_TAIL_LINES {
                        guard.pop_front();
                    }
                }
            });

            *guard = Some(BridgeProcess {
                child: Arc::new(Mutex::new(child)),
                stdin: Arc::new(Mutex::new(stdin)),
                pending,
                stderr_tail,
                stdout_task,
                stderr_task,
            });
        }

        if let Err(err) = self.handshake().await {
            self.abort().await;
            return Err(err);
        }
        Ok(())
    }

    /// Call the `ask_code` tool and return its parsed JSON output.
    async fn ask_code(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Value, BridgeError> {
        self.start().await?;

        let request_id = Uuid::new_v4().to_string();
        let (stdin, pending) = self.handles().await?;
        let (sender, receiver) = oneshot::channel();
        pending.lock().await.insert(request_id.clone(), sender);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "tools/call",
            "params": {"name": "ask_code", "arguments": arguments},
        });
        if let Err(err) = self.write_line(&stdin, &payload).await {
            pending.lock().await.remove(&request_id);
            return Err(err);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                pending.lock().await.remove(&request_id);
                self.abort().await;
                Err(BridgeError::Cancelled)
            }
            response = receiver => match response {
                Ok(message) => parse_tools_call_result(&message),
                Err(_) => Err(self.process_exit_error("MCP closed stdout").await),
            }
        }
    }

    /// Immediate graceful-then-forceful shutdown.
    async fn abort(&self) {
        self.shutdown().await;
    }

    /// Graceful close: stdin EOF, two-second grace, then kill.
    async fn close(&self) {
        self.shutdown().await;
    }
}

/// Validate and unwrap a `tools/call` response into the tool's JSON output.
pub(crate) fn parse_tools_call_result(response: &Value) -> Result<Value, BridgeError> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("MCP error")
            .to_string();
        return Err(BridgeError::Tool(message));
    }

    let result = response
        .get("result")
        .and_then(Value::as_object)
        .ok_or_else(|| BridgeError::Protocol("response without a valid result".to_string()))?;

    let content = result
        .get("content")
        .and_then(Value::as_array)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| BridgeError::Protocol("response without content".to_string()))?;

    let text = content[0]
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Protocol("response without text content".to_string()))?;

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(BridgeError::Tool(text.to_string()));
    }

    let output: Value = serde_json::from_str(text)
        .map_err(|_| BridgeError::Protocol("tool output is not valid JSON".to_string()))?;
    if !output.is_object() {
        return Err(BridgeError::Protocol(
            "tool output is not a JSON object".to_string(),
        ));
    }
    Ok(output)
}
