//! The bridge loop: connects to the orchestrator, registers the agent,
//! heartbeats, and fans control messages out to bounded concurrent task
//! handlers that drive the ACP agent subprocess.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acp_client::{AcpClient, SessionUpdateHandler};
use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::coalesce::ChunkCoalescer;
use crate::config::Config;
use crate::protocol::{ExecuteTaskMessage, Outbound, PromptRunMessage};
use crate::sessions::SessionRegistry;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);
const SESSION_NEW_TIMEOUT: Duration = Duration::from_secs(60);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct Bridge {
    cfg: Config,

    /// Write half of the orchestrator connection; `None` while disconnected.
    sink: Mutex<Option<WsSink>>,

    /// Singleton ACP client, created on first task.
    acp: Mutex<Option<Arc<AcpClient>>>,

    /// Admission semaphore bounding concurrent task handlers.
    exec_sem: Arc<Semaphore>,

    sessions: SessionRegistry,
    chunks: ChunkCoalescer,
}

impl Bridge {
    pub fn new(cfg: Config) -> Self {
        let exec_sem = Arc::new(Semaphore::new(cfg.agent.max_concurrent.max(1)));
        Self {
            sink: Mutex::new(None),
            acp: Mutex::new(None),
            exec_sem,
            sessions: SessionRegistry::new(),
            chunks: ChunkCoalescer::new(),
            cfg,
        }
    }

    /// Supervisor loop: serve one connection, then reconnect after a pause.
    /// Never returns.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(error) = self.connect_and_serve().await {
                tracing::warn!(
                    target = "agent_bridge::bridge",
                    error = %error,
                    "bridge connection error"
                );
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_serve(self: &Arc<Self>) -> Result<()> {
        tracing::info!(
            target = "agent_bridge::bridge",
            url = %self.cfg.orchestrator_url,
            "connecting to orchestrator"
        );

        let mut request = self
            .cfg
            .orchestrator_url
            .as_str()
            .into_client_request()
            .context("invalid orchestrator url")?;
        if let Some(token) = self.cfg.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let header = format!("Bearer {token}")
                .parse()
                .context("auth_token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, header);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("orchestrator dial failed")?;
        let (sink, mut read) = stream.split();
        *self.sink.lock().await = Some(sink);

        let result = async {
            self.send(&Outbound::RegisterAgent {
                agent: self.cfg.agent.clone(),
            })
            .await
            .context("register_agent failed")?;

            let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
            let (cancel_tx, cancel_rx) = watch::channel(false);

            let outcome = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text, &cancel_rx),
                    Some(Ok(Message::Close(_))) => {
                        break Err(anyhow!("orchestrator closed the connection"))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        break Err(anyhow::Error::from(error).context("orchestrator read failed"))
                    }
                    None => break Err(anyhow!("orchestrator stream ended")),
                }
            };

            heartbeat.abort();
            let _ = cancel_tx.send(true);
            outcome
        }
        .await;

        *self.sink.lock().await = None;
        result
    }

    /// Route one inbound text frame. Unknown or malformed frames are logged
    /// and skipped; valid control messages each get their own handler task.
    fn dispatch(self: &Arc<Self>, raw: &str, cancel: &watch::Receiver<bool>) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    target = "agent_bridge::bridge",
                    error = %error,
                    "ignoring malformed control frame"
                );
                return;
            }
        };

        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match msg_type.as_str() {
            "execute_task" => match serde_json::from_value::<ExecuteTaskMessage>(value) {
                Ok(msg) => {
                    let bridge = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { bridge.handle_execute_task(msg, cancel).await });
                }
                Err(error) => {
                    tracing::warn!(
                        target = "agent_bridge::bridge",
                        error = %error,
                        "bad execute_task message"
                    );
                }
            },
            "prompt_run" => match serde_json::from_value::<PromptRunMessage>(value) {
                Ok(msg) => {
                    let bridge = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { bridge.handle_prompt_run(msg, cancel).await });
                }
                Err(error) => {
                    tracing::warn!(
                        target = "agent_bridge::bridge",
                        error = %error,
                        "bad prompt_run message"
                    );
                }
            },
            other => {
                tracing::debug!(
                    target = "agent_bridge::bridge",
                    message_type = %other,
                    "ignoring unsupported control message"
                );
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.cfg.heartbeat_seconds);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let message = Outbound::Heartbeat {
                agent_id: self.cfg.agent.id.clone(),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
            };
            if let Err(error) = self.send(&message).await {
                tracing::debug!(
                    target = "agent_bridge::bridge",
                    error = %error,
                    "heartbeat not delivered"
                );
            }
        }
    }

    async fn handle_execute_task(
        self: Arc<Self>,
        msg: ExecuteTaskMessage,
        mut cancel: watch::Receiver<bool>,
    ) {
        let _permit = tokio::select! {
            permit = self.exec_sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancel.changed() => return,
        };

        if self.cfg.mock_mode {
            self.mock_round_trip(&msg.run_id, &msg.prompt).await;
            return;
        }

        let client = self.ensure_acp_client().await;

        if let Err(error) = client.initialize(INITIALIZE_TIMEOUT).await {
            self.send_text_update(&msg.run_id, format!("ACP initialize 失败: {error}"))
                .await;
            return;
        }

        let session_id = match self.sessions.session_for_run(&msg.run_id) {
            Some(session_id) => session_id,
            None => match client.new_session(&self.cfg.cwd, SESSION_NEW_TIMEOUT).await {
                Ok(session_id) => {
                    self.sessions.bind(&msg.run_id, &session_id);
                    self.send_update(
                        &msg.run_id,
                        json!({"type": "session_created", "session_id": session_id}),
                    )
                    .await;
                    self.send_text_update(
                        &msg.run_id,
                        format!("✅ ACP session 已创建: {session_id}"),
                    )
                    .await;
                    session_id
                }
                Err(error) => {
                    self.send_text_update(&msg.run_id, format!("ACP session/new 失败: {error}"))
                        .await;
                    return;
                }
            },
        };

        let result = tokio::select! {
            result = client.prompt(&session_id, &msg.prompt, PROMPT_TIMEOUT) => result,
            _ = cancel.changed() => return,
        };
        match result {
            Ok(result) => {
                self.flush_and_send_chunks(&msg.run_id, &session_id).await;
                self.send_update(
                    &msg.run_id,
                    json!({
                        "type": "prompt_result",
                        "stopReason": result.stop_reason,
                        "output": result.output,
                    }),
                )
                .await;
            }
            Err(error) => {
                self.send_text_update(&msg.run_id, format!("ACP session/prompt 失败: {error}"))
                    .await;
            }
        }
    }

    async fn handle_prompt_run(
        self: Arc<Self>,
        msg: PromptRunMessage,
        mut cancel: watch::Receiver<bool>,
    ) {
        let _permit = tokio::select! {
            permit = self.exec_sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancel.changed() => return,
        };

        if self.cfg.mock_mode {
            self.mock_round_trip(&msg.run_id, &msg.prompt).await;
            return;
        }

        let mut session_id = self.sessions.session_for_run(&msg.run_id);
        if session_id.is_none() {
            if let Some(supplied) = msg.session_id.as_deref().filter(|s| !s.is_empty()) {
                self.sessions.bind(&msg.run_id, supplied);
                session_id = Some(supplied.to_string());
            }
        }

        let client = self.ensure_acp_client().await;

        if let Err(error) = client.initialize(INITIALIZE_TIMEOUT).await {
            self.send_text_update(&msg.run_id, format!("ACP initialize 失败: {error}"))
                .await;
            return;
        }

        let mut session_id = match session_id {
            Some(session_id) => session_id,
            None => match client.new_session(&self.cfg.cwd, SESSION_NEW_TIMEOUT).await {
                Ok(session_id) => {
                    self.sessions.bind(&msg.run_id, &session_id);
                    self.send_update(
                        &msg.run_id,
                        json!({"type": "session_created", "session_id": session_id}),
                    )
                    .await;
                    self.send_text_update(
                        &msg.run_id,
                        format!(
                            "⚠️ ACP session 不存在/已丢失，已创建新 session: {session_id}（上下文可能丢失）"
                        ),
                    )
                    .await;
                    session_id
                }
                Err(error) => {
                    self.send_text_update(&msg.run_id, format!("ACP session/new 失败: {error}"))
                        .await;
                    return;
                }
            },
        };

        let mut result = tokio::select! {
            result = client.prompt(&session_id, &msg.prompt, PROMPT_TIMEOUT) => result,
            _ = cancel.changed() => return,
        };

        if result.is_err() {
            // The agent may have dropped the session; rebuild it once and
            // retry rather than bouncing the failure straight back.
            if let Ok(rebuilt) = client.new_session(&self.cfg.cwd, SESSION_NEW_TIMEOUT).await {
                session_id = rebuilt;
                self.sessions.bind(&msg.run_id, &session_id);
                self.send_update(
                    &msg.run_id,
                    json!({"type": "session_created", "session_id": session_id}),
                )
                .await;
                self.send_text_update(
                    &msg.run_id,
                    format!("⚠️ ACP session 已失效，已重建 session: {session_id}（上下文可能丢失）"),
                )
                .await;

                result = tokio::select! {
                    result = client.prompt(&session_id, &msg.prompt, PROMPT_TIMEOUT) => result,
                    _ = cancel.changed() => return,
                };
            }
        }

        match result {
            Ok(result) => {
                self.flush_and_send_chunks(&msg.run_id, &session_id).await;
                self.send_update(
                    &msg.run_id,
                    json!({
                        "type": "prompt_result",
                        "stopReason": result.stop_reason,
                        "output": result.output,
                    }),
                )
                .await;
            }
            Err(error) => {
                self.send_text_update(&msg.run_id, format!("ACP session/prompt 失败: {error}"))
                    .await;
            }
        }
    }

    async fn mock_round_trip(&self, run_id: &str, prompt: &str) {
        self.send_text_update(run_id, format!("[mock] received prompt: {prompt}"))
            .await;
        self.send_update(
            run_id,
            json!({
                "type": "prompt_result",
                "stopReason": "end_turn",
                "output": [{"type": "text", "text": "[mock] done"}],
            }),
        )
        .await;
    }

    /// Get the singleton ACP client, creating it with the session-update
    /// callback on first use. One long-lived child per bridge process;
    /// sessions are cheap, processes are not.
    async fn ensure_acp_client(self: &Arc<Self>) -> Arc<AcpClient> {
        let mut guard = self.acp.lock().await;
        if let Some(client) = guard.as_ref() {
            return client.clone();
        }

        let bridge = self.clone();
        let handler: SessionUpdateHandler =
            Arc::new(move |session_id, update| -> BoxFuture<'static, ()> {
                let bridge = bridge.clone();
                Box::pin(async move { bridge.on_session_update(session_id, update).await })
            });

        let client = Arc::new(AcpClient::new(
            self.cfg.agent_command.clone(),
            PathBuf::from(&self.cfg.cwd),
            Some(handler),
        ));
        *guard = Some(client.clone());
        client
    }

    /// Runs on the ACP client's stdout reader task, so it must stay brief.
    /// Chunk updates feed the coalescer; anything else flushes buffered
    /// chunks first so the upstream sees streamed text and structural events
    /// in the order the agent emitted them.
    async fn on_session_update(&self, session_id: String, update: Value) {
        let Some(run_id) = self.sessions.run_for_session(&session_id) else {
            return;
        };

        if let Some(kind) = update.get("sessionUpdate").and_then(Value::as_str) {
            if kind == "agent_message_chunk" {
                if let Some(text) = extract_text_content(update.get("content")) {
                    if !text.is_empty() {
                        if let Some(batch) = self.chunks.append(&session_id, text) {
                            self.send_chunk_update(&run_id, &session_id, &batch).await;
                        }
                        return;
                    }
                }
            }
            self.flush_and_send_chunks(&run_id, &session_id).await;
        }

        self.send_update(
            &run_id,
            json!({
                "type": "session_update",
                "update": update,
                "session": session_id,
            }),
        )
        .await;
    }

    async fn send_chunk_update(&self, run_id: &str, session_id: &str, text: &str) {
        self.send_update(
            run_id,
            json!({
                "type": "session_update",
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": text},
                },
                "session": session_id,
            }),
        )
        .await;
    }

    async fn flush_and_send_chunks(&self, run_id: &str, session_id: &str) {
        if let Some(batch) = self.chunks.flush(session_id) {
            self.send_chunk_update(run_id, session_id, &batch).await;
        }
    }

    async fn send_update(&self, run_id: &str, content: Value) {
        let message = Outbound::AgentUpdate {
            run_id: run_id.to_string(),
            content,
        };
        if let Err(error) = self.send(&message).await {
            // Loss is tolerated: the dispatcher reconnects and the
            // orchestrator re-sends work.
            tracing::debug!(
                target = "agent_bridge::bridge",
                run_id = %run_id,
                error = %error,
                "dropping agent update"
            );
        }
    }

    async fn send_text_update(&self, run_id: &str, text: String) {
        self.send_update(run_id, json!({"type": "text", "text": text}))
            .await;
    }

    /// Serialize and write one text frame on the current connection.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let text =
            serde_json::to_string(message).context("failed to serialize outbound message")?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("orchestrator connection is down"))?;
        sink.send(Message::Text(text))
            .await
            .context("orchestrator write failed")?;
        Ok(())
    }
}

fn extract_text_content(content: Option<&Value>) -> Option<&str> {
    let content = content?;
    if content.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    content.get("text").and_then(Value::as_str)
}
