//! End-to-end tests driving the bridge over a loopback WebSocket server that
//! stands in for the orchestrator, with scripted shell agents standing in for
//! the ACP subprocess.

use std::sync::Arc;
use std::time::Duration;

use agent_bridge::{AgentConfig, Bridge, Config};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("bridge did not connect")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_json(ws: &mut ServerWs) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn test_config(listener: &TcpListener, mock_mode: bool, agent_command: Vec<String>) -> Config {
    let mut cfg = Config {
        orchestrator_url: format!("ws://{}", listener.local_addr().unwrap()),
        auth_token: None,
        cwd: std::env::temp_dir().to_string_lossy().into_owned(),
        heartbeat_seconds: 600,
        mock_mode,
        agent_command,
        agent: AgentConfig {
            id: "bridge-1".to_string(),
            name: String::new(),
            max_concurrent: 1,
            capabilities: None,
        },
    };
    cfg.apply_defaults().unwrap();
    cfg
}

/// Collect agent updates for a run until a content type in `until` shows up.
async fn collect_updates(ws: &mut ServerWs, until: &str) -> Vec<Value> {
    let mut updates = Vec::new();
    loop {
        let frame = next_json(ws).await;
        if frame["type"] != "agent_update" {
            continue;
        }
        let done = frame["content"]["type"] == until;
        updates.push(frame);
        if done {
            return updates;
        }
    }
}

#[cfg(unix)]
fn write_script(dir: &tempfile::TempDir, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-agent.sh");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn registers_on_connect_and_answers_mock_tasks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, true, vec!["ignored".to_string()]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;

    let register = next_json(&mut ws).await;
    assert_eq!(register["type"], "register_agent");
    assert_eq!(register["agent"]["id"], "bridge-1");
    assert_eq!(register["agent"]["name"], "bridge-1");
    assert_eq!(register["agent"]["max_concurrent"], 1);

    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "hello"}),
    )
    .await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "agent_update");
    assert_eq!(first["run_id"], "r1");
    assert_eq!(first["content"]["type"], "text");
    assert_eq!(first["content"]["text"], "[mock] received prompt: hello");

    let second = next_json(&mut ws).await;
    assert_eq!(second["content"]["type"], "prompt_result");
    assert_eq!(second["content"]["stopReason"], "end_turn");
    assert_eq!(second["content"]["output"][0]["text"], "[mock] done");
}

#[tokio::test]
async fn unknown_message_types_are_ignored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, true, vec!["ignored".to_string()]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "mystery", "payload": 42})).await;
    send_json(&mut ws, json!({"no_type_at_all": true})).await;
    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "still alive"}),
    )
    .await;

    let first = next_json(&mut ws).await;
    assert_eq!(
        first["content"]["text"],
        "[mock] received prompt: still alive"
    );
}

#[tokio::test]
async fn heartbeats_flow_after_registration() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config(&listener, true, vec!["ignored".to_string()]);
    cfg.heartbeat_seconds = 1;
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    let heartbeat = next_json(&mut ws).await;
    assert_eq!(heartbeat["type"], "heartbeat");
    assert_eq!(heartbeat["agent_id"], "bridge-1");
    assert!(heartbeat["timestamp"].is_string());
}

#[tokio::test]
async fn reconnects_after_the_connection_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, true, vec!["ignored".to_string()]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let first_register = next_json(&mut ws).await;
    assert_eq!(first_register["type"], "register_agent");
    drop(ws);

    let mut ws = accept_ws(&listener).await;
    let second_register = next_json(&mut ws).await;
    assert_eq!(second_register["type"], "register_agent");
}

#[tokio::test]
async fn empty_agent_command_reports_initialize_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config(&listener, false, vec!["ignored".to_string()]);
    cfg.agent_command = Vec::new();
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "hello"}),
    )
    .await;

    let update = next_json(&mut ws).await;
    assert_eq!(update["type"], "agent_update");
    assert_eq!(update["content"]["type"], "text");
    let text = update["content"]["text"].as_str().unwrap();
    assert!(text.contains("ACP initialize 失败"), "got {text:?}");

    // The task handler stops there; nothing else may follow.
    let extra = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(extra.is_err(), "expected no further frames, got {extra:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn empty_session_id_reports_session_new_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":""}}\n' "$id"
      ;;
  esac
done
"#,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, false, vec![script]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "do something"}),
    )
    .await;

    let update = next_json(&mut ws).await;
    let text = update["content"]["text"].as_str().unwrap();
    assert!(text.contains("ACP session/new 失败"), "got {text:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn execute_task_happy_path_streams_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1"}}\n' "$id"
      ;;
    *'"session/prompt"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sess-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"working on it\n"}}}}'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1","stopReason":"end_turn","output":[{"type":"text","text":"done"}]}}\n' "$id"
      ;;
  esac
done
"#,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, false, vec![script]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "do something"}),
    )
    .await;

    let updates = collect_updates(&mut ws, "prompt_result").await;

    let mut saw_session_created = false;
    let mut saw_created_text = false;
    let mut streamed = String::new();
    for update in &updates {
        assert_eq!(update["run_id"], "r1");
        match update["content"]["type"].as_str().unwrap() {
            "session_created" => {
                assert_eq!(update["content"]["session_id"], "sess-1");
                saw_session_created = true;
            }
            "text" => {
                let text = update["content"]["text"].as_str().unwrap();
                if text.contains("ACP session 已创建") && text.contains("sess-1") {
                    saw_created_text = true;
                }
            }
            "session_update" => {
                assert_eq!(update["content"]["session"], "sess-1");
                let chunk = &update["content"]["update"];
                assert_eq!(chunk["sessionUpdate"], "agent_message_chunk");
                streamed.push_str(chunk["content"]["text"].as_str().unwrap());
            }
            _ => {}
        }
    }

    assert!(saw_session_created, "missing session_created: {updates:?}");
    assert!(saw_created_text, "missing created text: {updates:?}");
    assert_eq!(streamed, "working on it\n");

    let last = updates.last().unwrap();
    assert_eq!(last["content"]["type"], "prompt_result");
    assert_eq!(last["content"]["stopReason"], "end_turn");
    assert_eq!(last["content"]["output"][0]["text"], "done");
}

#[cfg(unix)]
#[tokio::test]
async fn execute_task_reports_prompt_failure_after_session_creation() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1"}}\n' "$id"
      ;;
    *'"session/prompt"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"boom"}}\n' "$id"
      ;;
  esac
done
"#,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, false, vec![script]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "execute_task", "run_id": "r1", "prompt": "do something"}),
    )
    .await;

    let mut saw_created_text = false;
    loop {
        let update = next_json(&mut ws).await;
        if update["content"]["type"] != "text" {
            continue;
        }
        let text = update["content"]["text"].as_str().unwrap();
        if text.contains("ACP session 已创建") && text.contains("sess-1") {
            saw_created_text = true;
        }
        if text.contains("ACP session/prompt 失败") {
            break;
        }
    }
    assert!(saw_created_text);
}

#[cfg(unix)]
#[tokio::test]
async fn prompt_run_rebuilds_the_session_once_on_prompt_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-1"}}\n' "$id"
      ;;
    *'"session/prompt"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"boom"}}\n' "$id"
      ;;
  esac
done
"#,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = test_config(&listener, false, vec![script]);
    let bridge = Arc::new(Bridge::new(cfg));
    tokio::spawn(bridge.run());

    let mut ws = accept_ws(&listener).await;
    let _register = next_json(&mut ws).await;

    send_json(
        &mut ws,
        json!({"type": "prompt_run", "run_id": "r2", "prompt": "go"}),
    )
    .await;

    let mut session_created_count = 0;
    let mut saw_rebuilt_text = false;
    loop {
        let update = next_json(&mut ws).await;
        match update["content"]["type"].as_str().unwrap() {
            "session_created" => session_created_count += 1,
            "text" => {
                let text = update["content"]["text"].as_str().unwrap();
                if text.contains("已重建 session") {
                    saw_rebuilt_text = true;
                }
                if text.contains("ACP session/prompt 失败") {
                    break;
                }
            }
            _ => {}
        }
    }

    assert_eq!(session_created_count, 2);
    assert!(saw_rebuilt_text);
}
