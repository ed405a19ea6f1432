//! One MCP client: a supervised subprocess (or any stdio-like pair) with a
//! reader task dispatching responses to a pending-request table.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    initialize_params, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef,
    ToolCallResult, ToolsListResult,
};

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server error: {message} (code {code})")]
    Rpc { code: i64, message: String },

    #[error("MCP handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("MCP request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("MCP client shutdown")]
    Shutdown,

    #[error("MCP client is closed")]
    Closed,
}

/// Outcome of a `tools/call`: text plus a success flag, ready to feed back
/// to the LLM as a tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub text: String,
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>>;

pub struct McpClient {
    skill: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingTable,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    tools: RwLock<Arc<Vec<McpToolDef>>>,
    last_activity: Mutex<Instant>,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl McpClient {
    /// Wire a client over arbitrary reader/writer halves. Used directly in
    /// tests (duplex pipes); `spawn` wraps child stdio into the same path.
    pub fn connect<R, W>(skill: impl Into<String>, reader: R, writer: W, request_timeout: Duration) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let skill = skill.into();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_handle = tokio::spawn(read_loop(
            skill.clone(),
            BufReader::new(reader),
            pending.clone(),
            alive.clone(),
        ));

        Arc::new(Self {
            skill,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            tools: RwLock::new(Arc::new(Vec::new())),
            last_activity: Mutex::new(Instant::now()),
            request_timeout,
            reader: Mutex::new(Some(reader_handle)),
            child: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawn the configured command and wire its stdio. Stderr is drained
    /// to debug logs in a background task.
    pub async fn spawn(
        skill: impl Into<String>,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        request_timeout: Duration,
    ) -> Result<Arc<Self>, McpError> {
        let skill = skill.into();
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdin unavailable",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdout unavailable",
            ))
        })?;
        if let Some(stderr) = child.stderr.take() {
            let skill2 = skill.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(skill = %skill2, line = %line, "mcp stderr");
                }
            });
        }

        let client = Self::connect(skill, stdout, stdin, request_timeout);
        *client.child.lock().await = Some(child);
        Ok(client)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Cached tool catalog — a cheap snapshot, filled by `handshake`.
    pub fn tools(&self) -> Arc<Vec<McpToolDef>> {
        self.tools.read().unwrap().clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Run the MCP handshake: `initialize` → `notifications/initialized` →
    /// `tools/list`, all within `startup_timeout`. Caches the tool catalog.
    pub async fn handshake(&self, startup_timeout: Duration) -> Result<Arc<Vec<McpToolDef>>, McpError> {
        let result = tokio::time::timeout(startup_timeout, async {
            self.request(
                "initialize",
                Some(initialize_params("minder", env!("CARGO_PKG_VERSION"))),
            )
            .await?;
            self.notify("notifications/initialized").await?;
            let listed = self.request("tools/list", None).await?;
            let parsed: ToolsListResult = serde_json::from_value(listed)?;
            Ok::<_, McpError>(parsed.tools)
        })
        .await;

        match result {
            Ok(Ok(tools)) => {
                debug!(skill = %self.skill, tool_count = tools.len(), "mcp handshake complete");
                let snapshot = Arc::new(tools);
                *self.tools.write().unwrap() = snapshot.clone();
                Ok(snapshot)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::HandshakeTimeout(startup_timeout)),
        }
    }

    /// Call a tool by name. Text items of the reply are concatenated with
    /// LF; `isError` turns the reply into a failed `ToolOutput`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        let parsed: ToolCallResult = serde_json::from_value(result)?;
        let text = parsed.joined_text();
        Ok(if parsed.is_error {
            ToolOutput {
                success: false,
                text: if text.is_empty() {
                    "MCP tool error".to_string()
                } else {
                    text
                },
            }
        } else {
            ToolOutput {
                success: true,
                text: if text.is_empty() {
                    "(no output)".to_string()
                } else {
                    text
                },
            }
        })
    }

    /// Send a request and await the matching response by id.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_alive() {
            return Err(McpError::Closed);
        }
        self.touch();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.write_line(&line).await {
            // A failed write fails this call but does not tear the client
            // down; the reader decides liveness from the stream.
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => {
                self.touch();
                result
            }
            Ok(Err(_)) => Err(McpError::Shutdown),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(McpError::RequestTimeout(self.request_timeout))
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str) -> Result<(), McpError> {
        if !self.is_alive() {
            return Err(McpError::Closed);
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method))?;
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the client down: complete all pending calls with a shutdown
    /// failure, stop the reader, and destroy the subprocess — politely
    /// first, by force after `grace`.
    pub async fn close(&self, grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);

        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(Err(McpError::Shutdown));
        }

        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(skill = %self.skill, ?status, "mcp server exited");
                }
                Ok(Err(e)) => {
                    warn!(skill = %self.skill, error = %e, "mcp server wait failed");
                }
                Err(_) => {
                    warn!(skill = %self.skill, "mcp server ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Reader task: parse one JSON-RPC response per line and complete the
/// matching waiter. Invalid lines are dropped at debug level. On EOF the
/// client is marked dead and all waiters fail.
async fn read_loop<R>(
    skill: String,
    mut reader: BufReader<R>,
    pending: PendingTable,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(skill = %skill, error = %e, "mcp reader error");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                debug!(skill = %skill, error = %e, "mcp: dropping non-JSON-RPC line");
                continue;
            }
        };
        let Some(id) = response.id else {
            debug!(skill = %skill, "mcp: dropping message without id");
            continue;
        };

        let waiter = pending.lock().unwrap().remove(&id);
        let Some(tx) = waiter else {
            debug!(skill = %skill, id, "mcp: response for unknown request id");
            continue;
        };

        let outcome = match response.error {
            Some(err) => Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    alive.store(false, Ordering::SeqCst);
    let waiters: Vec<_> = {
        let mut table = pending.lock().unwrap();
        table.drain().collect()
    };
    for (_, tx) in waiters {
        let _ = tx.send(Err(McpError::Shutdown));
    }
    debug!(skill = %skill, "mcp reader finished");
}
