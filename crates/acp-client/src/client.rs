//! JSON-RPC 2.0 client for a locally spawned ACP agent subprocess.
//!
//! One long-lived child process serves many sessions. The client owns the
//! child's three piped streams: requests go out over stdin (one JSON object
//! per line), a single stdout reader task demultiplexes responses,
//! notifications and reverse requests, and stderr is drained and discarded.
//! If the child dies, every outstanding call is resolved with a synthetic
//! error and the next call respawns it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use crate::error::{AcpError, Result};
use crate::types::{
    PermissionOption, PromptResult, RequestPermissionParams, RpcEnvelope, RpcErrorBody,
    SessionNewResult, SessionUpdateParams,
};

/// Async callback invoked for every `session/update` notification, on the
/// stdout reader task. Must not block for long.
pub type SessionUpdateHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

type PendingReply = std::result::Result<Value, RpcErrorBody>;

/// Client for one ACP agent subprocess.
pub struct AcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    command: Vec<String>,
    cwd: PathBuf,
    on_session_update: Option<SessionUpdateHandler>,

    /// Guards process lifecycle transitions.
    proc: Mutex<Option<ProcHandle>>,
    /// Guards writes to the child's stdin. Boxed so tests can inject an
    /// in-memory pipe.
    stdin: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,

    next_id: AtomicI64,
    initialized: AtomicBool,

    pending: SyncMutex<HashMap<String, oneshot::Sender<PendingReply>>>,
}

struct ProcHandle {
    child: Arc<Mutex<Child>>,
    stopped: Arc<AtomicBool>,
}

impl AcpClient {
    /// Create a client for `command`, run with `cwd` as its working
    /// directory. The process is spawned lazily on the first call.
    pub fn new(
        command: Vec<String>,
        cwd: PathBuf,
        on_session_update: Option<SessionUpdateHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                command,
                cwd,
                on_session_update,
                proc: Mutex::new(None),
                stdin: Mutex::new(None),
                next_id: AtomicI64::new(0),
                initialized: AtomicBool::new(false),
                pending: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Run the `initialize` handshake once per child process. Subsequent
    /// calls are no-ops until the process is respawned.
    pub async fn initialize(&self, timeout: Duration) -> Result<()> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": 1,
            "clientCapabilities": {
                "fs": {
                    "readTextFile": false,
                    "writeTextFile": false,
                },
                "terminal": false,
            },
            "clientInfo": {
                "name": "agent-bridge",
                "title": "Agent Bridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        self.call("initialize", params, timeout).await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Create a new agent session rooted at `cwd` and return its id.
    pub async fn new_session(&self, cwd: &str, timeout: Duration) -> Result<String> {
        let params = json!({ "cwd": cwd, "mcpServers": [] });
        let raw = self.call("session/new", params, timeout).await?;
        let result: SessionNewResult = serde_json::from_value(raw)?;
        if result.session_id.is_empty() {
            return Err(AcpError::InvalidResponse(
                "session/new returned empty sessionId".to_string(),
            ));
        }
        Ok(result.session_id)
    }

    /// Send a single text prompt into a session and wait for the turn to
    /// complete.
    pub async fn prompt(
        &self,
        session_id: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<PromptResult> {
        let params = json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": prompt }],
        });
        let raw = self.call("session/prompt", params, timeout).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Issue one JSON-RPC request and wait for the matching response.
    ///
    /// Spawns the agent process if it is not running. The pending slot is
    /// removed on every exit path so a late response is dropped silently.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.ensure_running().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let key = id.to_string();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(key.clone(), tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(error) = self.inner.write_line(&request).await {
            self.inner.pending.lock().remove(&key);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(remote))) => Err(AcpError::Rpc {
                code: remote.code,
                message: remote.message,
                data: remote.data,
            }),
            Ok(Err(_)) => {
                self.inner.pending.lock().remove(&key);
                Err(AcpError::PeerExited)
            }
            Err(_) => {
                self.inner.pending.lock().remove(&key);
                Err(AcpError::Timeout)
            }
        }
    }

    /// Spawn the agent process if none is running. Idempotent.
    async fn ensure_running(&self) -> Result<()> {
        let mut proc = self.inner.proc.lock().await;

        if let Some(handle) = proc.as_ref() {
            if !handle.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        if self.inner.command.is_empty() {
            return Err(AcpError::EmptyCommand);
        }

        let mut command = Command::new(&self.inner.command[0]);
        command
            .args(&self.inner.command[1..])
            .current_dir(&self.inner.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        tracing::info!(
            target = "acp_client::client",
            command = ?self.inner.command,
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(AcpError::Spawn)?;
        let stdin = child.stdin.take().ok_or(AcpError::StdinUnavailable)?;
        let stdout = child.stdout.take().ok_or(AcpError::StdoutUnavailable)?;
        let stderr = child.stderr.take().ok_or(AcpError::StderrUnavailable)?;

        *self.inner.stdin.lock().await = Some(Box::new(stdin));
        self.inner.initialized.store(false, Ordering::SeqCst);

        let child = Arc::new(Mutex::new(child));
        let stopped = Arc::new(AtomicBool::new(false));
        *proc = Some(ProcHandle {
            child: child.clone(),
            stopped: stopped.clone(),
        });

        tokio::spawn(read_stdout(self.inner.clone(), stdout, child, stopped));
        tokio::spawn(drain_stderr(stderr));

        Ok(())
    }
}

impl ClientInner {
    /// Serialize `value` and write it as one `\n`-terminated line on the
    /// child's stdin. The stdin mutex serializes concurrent writers.
    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut payload = serde_json::to_vec(value)?;
        payload.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AcpError::StdinUnavailable)?;
        stdin.write_all(&payload).await.map_err(AcpError::Write)?;
        stdin.flush().await.map_err(AcpError::Write)?;
        Ok(())
    }

    /// Classify and handle one trimmed stdout line. Unparseable lines are
    /// dropped without comment.
    async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }

        let envelope: RpcEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(_) => return,
        };

        // Agent -> client notification.
        if let (Some(method), None) = (envelope.method.as_deref(), envelope.id.as_ref()) {
            if method == "session/update" {
                if let Some(handler) = self.on_session_update.as_ref() {
                    let params: SessionUpdateParams =
                        match serde_json::from_value(envelope.params.unwrap_or(Value::Null)) {
                            Ok(params) => params,
                            Err(_) => return,
                        };
                    handler(params.session_id, params.update).await;
                }
            }
            return;
        }

        // Agent -> client request; must be answered or the agent stalls.
        if let (Some(method), Some(id)) = (envelope.method.as_deref(), envelope.id.clone()) {
            if method == "session/request_permission" {
                self.handle_request_permission(id, envelope.params.unwrap_or(Value::Null))
                    .await;
                return;
            }

            let _ = self
                .write_line(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("method not supported: {method}"),
                    },
                }))
                .await;
            return;
        }

        // Response to one of our calls.
        if let Some(id) = envelope.id {
            let key = id_key(&id);
            let slot = self.pending.lock().remove(&key);
            let Some(tx) = slot else {
                return;
            };
            let reply = match envelope.error {
                Some(error) => Err(error),
                None => Ok(envelope.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
        }
    }

    /// Answer a permission prompt without human input: prefer the first
    /// `allow_once` option, fall back to the first option, cancel otherwise.
    async fn handle_request_permission(&self, id: Value, params: Value) {
        let params: RequestPermissionParams = serde_json::from_value(params).unwrap_or_default();

        let outcome = match select_permission_option(&params.options) {
            Some(option_id) => json!({
                "outcome": { "outcome": "selected", "optionId": option_id },
            }),
            None => json!({
                "outcome": { "outcome": "cancelled" },
            }),
        };

        let _ = self
            .write_line(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": outcome,
            }))
            .await;
    }
}

/// Pick the option an unattended bridge should choose.
fn select_permission_option(options: &[PermissionOption]) -> Option<&str> {
    options
        .iter()
        .find(|option| option.kind == "allow_once")
        .or_else(|| options.first())
        .map(|option| option.option_id.as_str())
}

/// Reduce an inbound response id to the same key form used for outbound
/// requests. Integers and strings collapse to their natural text; anything
/// else is tolerated as its serialized form so a deviating peer cannot make
/// a call hang.
fn id_key(id: &Value) -> String {
    match id {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Sole reader of the child's stdout. On EOF or read error it resolves every
/// pending call with a synthetic error, reaps the child, and latches the
/// stopped flag so the next call respawns.
async fn read_stdout(
    inner: Arc<ClientInner>,
    stdout: ChildStdout,
    child: Arc<Mutex<Child>>,
    stopped: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        inner.handle_line(line.trim()).await;
    }

    let drained: Vec<(String, oneshot::Sender<PendingReply>)> =
        inner.pending.lock().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(RpcErrorBody {
            code: -1,
            message: "agent process exited".to_string(),
            data: None,
        }));
    }

    {
        let mut guard = child.lock().await;
        let _ = guard.kill().await;
        let _ = guard.wait().await;
    }

    stopped.store(true, Ordering::SeqCst);
    tracing::warn!(target = "acp_client::client", "agent process exited");
}

/// The agent may be noisy on stderr; consume it so the pipe never fills.
async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(_)) = lines.next_line().await {}
}
