//! End-to-end adapter scenarios over in-memory transports: a scripted RPC
//! backend on one duplex pair, a scripted channel peer on another.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use monitor_codex::{
    AdapterConfig, AdapterError, CodexAdapter, CodexBackendConfig, CodexRpc, RpcError,
    SendMessageOptions,
};
use monitor_ipc::{ChannelConfig, DuplexChannel, read_frame, write_frame};
use monitor_proto::{
    BroadcastFrame, Frame, InitializeResponseFrame, RequestFrame, ResponseFrame,
    STREAM_EVENT_METHOD,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ok(result: Value) -> Value {
    json!({"result": result})
}

fn backend_error(code: i64, message: &str) -> Value {
    json!({"error": {"code": code, "message": message}})
}

/// Marker reply telling the fake backend to drop its end of the pipe.
fn hang_up() -> Value {
    json!({"closeBackend": true})
}

fn spawn_backend(
    reader: ReadHalf<DuplexStream>,
    mut writer: WriteHalf<DuplexStream>,
    mut script: impl FnMut(&str, &Value) -> Value + Send + 'static,
    reply_delay: Duration,
) -> CallLog {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&calls);
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let value: Value = match serde_json::from_str(line.trim()) {
                Ok(value) => value,
                Err(_) => continue,
            };
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            lock(&log).push((method.clone(), params.clone()));

            if !reply_delay.is_zero() {
                tokio::time::sleep(reply_delay).await;
            }

            let mut reply = script(&method, &params);
            if reply.get("closeBackend").is_some() {
                break;
            }
            if let Some(object) = reply.as_object_mut() {
                object.insert("id".to_string(), id);
            }
            let mut line = reply.to_string();
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    calls
}

struct ChannelPeer {
    outbound: mpsc::UnboundedSender<Frame>,
    requests: Arc<Mutex<Vec<RequestFrame>>>,
}

impl ChannelPeer {
    fn send_stream_event(&self, thread_id: &str, source: &str, change: Value) {
        let frame = Frame::Broadcast(BroadcastFrame {
            method: STREAM_EVENT_METHOD.to_string(),
            params: json!({"conversationId": thread_id, "change": change}),
            source_client_id: source.to_string(),
            version: "1".to_string(),
            target_client_id: None,
        });
        let _ = self.outbound.send(frame);
    }
}

fn spawn_channel_peer(
    mut reader: ReadHalf<DuplexStream>,
    mut writer: WriteHalf<DuplexStream>,
) -> ChannelPeer {
    // All writes funnel through one task so inbound reads never interleave
    // with pushed broadcasts mid-frame.
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Frame>();
    let requests: Arc<Mutex<Vec<RequestFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let reply_tx = write_tx.clone();
    tokio::spawn(async move {
        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            let reply = match frame {
                Frame::Initialize(init) => Frame::InitializeResponse(InitializeResponseFrame {
                    request_id: init.request_id,
                    result: Some(json!({"clientId": "monitor-1"})),
                }),
                Frame::Request(request) => {
                    lock(&seen).push(request.clone());
                    Frame::Response(ResponseFrame {
                        request_id: request.request_id,
                        method: Some(request.method),
                        result: Some(json!({"ok": true})),
                        error: None,
                    })
                }
                _ => continue,
            };
            if reply_tx.send(reply).is_err() {
                break;
            }
        }
    });

    ChannelPeer {
        outbound: write_tx,
        requests,
    }
}

fn harness(
    script: impl FnMut(&str, &Value) -> Value + Send + 'static,
    reply_delay: Duration,
) -> (CodexAdapter, CallLog, ChannelPeer) {
    let (rpc_ours, rpc_theirs) = tokio::io::duplex(64 * 1024);
    let (rpc_read, rpc_write) = tokio::io::split(rpc_ours);
    let (backend_read, backend_write) = tokio::io::split(rpc_theirs);
    let rpc = CodexRpc::connect_with_io(CodexBackendConfig::default(), rpc_read, rpc_write);
    let calls = spawn_backend(backend_read, backend_write, script, reply_delay);

    let (channel_ours, channel_theirs) = tokio::io::duplex(64 * 1024);
    let (channel_read, channel_write) = tokio::io::split(channel_ours);
    let (peer_read, peer_write) = tokio::io::split(channel_theirs);
    let channel = DuplexChannel::new(ChannelConfig::default());
    channel
        .connect_with_io(channel_read, channel_write)
        .expect("attach channel");
    let peer = spawn_channel_peer(peer_read, peer_write);

    let config = AdapterConfig {
        reconnect_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let adapter = CodexAdapter::with_transports(config, rpc, channel);
    (adapter, calls, peer)
}

fn default_script(method: &str, _params: &Value) -> Value {
    match method {
        "thread/list" => ok(json!({"data": []})),
        "thread/read" => ok(json!({"thread": {"id": "thr-1", "turns": []}})),
        "thread/resume" => ok(json!({"thread": {"id": "thr-1"}})),
        "turn/start" => ok(json!({"turn": {"id": "t-1"}})),
        _ => backend_error(-32601, "method not found"),
    }
}

fn methods(calls: &CallLog) -> Vec<String> {
    lock(calls).iter().map(|(method, _)| method.clone()).collect()
}

#[tokio::test]
async fn bootstrap_reaches_ready_and_probes_the_backend() {
    let (adapter, calls, _peer) = harness(default_script, Duration::ZERO);

    adapter.start().await.expect("bootstrap");

    let state = adapter.runtime_state();
    assert!(state.app_ready);
    assert!(state.ipc_connected);
    assert!(state.ipc_initialized);
    assert!(state.codex_available);
    assert_eq!(state.last_error, None);
    assert_eq!(methods(&calls), vec!["thread/list".to_string()]);

    adapter.stop().await;
}

#[tokio::test]
async fn concurrent_starts_share_one_bootstrap_attempt() {
    let (adapter, calls, _peer) = harness(default_script, Duration::from_millis(40));

    let (first, second) = tokio::join!(adapter.start(), adapter.start());
    first.expect("first start");
    second.expect("second start");

    let probes = methods(&calls)
        .iter()
        .filter(|method| method.as_str() == "thread/list")
        .count();
    assert_eq!(probes, 1, "single-flight bootstrap must probe once");

    adapter.stop().await;
}

#[tokio::test]
async fn not_found_send_resumes_and_retries_exactly_once() {
    let mut turn_starts = 0usize;
    let script = move |method: &str, params: &Value| match method {
        "turn/start" => {
            turn_starts += 1;
            if turn_starts == 1 {
                backend_error(-32001, "conversation not found")
            } else {
                ok(json!({"turn": {"id": "t-2"}}))
            }
        }
        "thread/resume" => {
            assert_eq!(
                params.get("threadId").and_then(Value::as_str),
                Some("thr-1")
            );
            ok(json!({"thread": {"id": "thr-1"}}))
        }
        _ => default_script(method, params),
    };
    let (adapter, calls, _peer) = harness(script, Duration::ZERO);

    let response = adapter
        .send_message("thr-1", "hello there", SendMessageOptions::default())
        .await
        .expect("send after resume");
    assert_eq!(response.turn.id, "t-2");
    assert_eq!(
        methods(&calls),
        vec![
            "turn/start".to_string(),
            "thread/resume".to_string(),
            "turn/start".to_string(),
        ]
    );

    adapter.stop().await;
}

#[tokio::test]
async fn a_second_not_found_after_retry_propagates() {
    let script = |method: &str, params: &Value| match method {
        "turn/start" => backend_error(-32001, "thread not loaded"),
        "thread/resume" => ok(json!({"thread": {"id": "thr-1"}})),
        _ => default_script(method, params),
    };
    let (adapter, calls, _peer) = harness(script, Duration::ZERO);

    let error = adapter
        .send_message("thr-1", "hello", SendMessageOptions::default())
        .await
        .expect_err("second failure propagates");
    assert!(matches!(
        error,
        AdapterError::Rpc(RpcError::Backend { .. })
    ));
    // Exactly one resume, exactly one retry, then give up.
    assert_eq!(
        methods(&calls),
        vec![
            "turn/start".to_string(),
            "thread/resume".to_string(),
            "turn/start".to_string(),
        ]
    );

    adapter.stop().await;
}

#[tokio::test]
async fn interrupt_without_an_active_turn_is_a_noop() {
    let script = |method: &str, params: &Value| match method {
        "thread/read" => ok(json!({"thread": {"id": "thr-1", "turns": [
            {"turnId": "t1", "status": "completed"},
            {"turnId": "t2", "status": "CANCELLED"},
        ]}})),
        _ => default_script(method, params),
    };
    let (adapter, calls, _peer) = harness(script, Duration::ZERO);

    let interrupted = adapter.interrupt("thr-1").await.expect("noop interrupt");
    assert_eq!(interrupted, None);
    assert!(!methods(&calls).contains(&"turn/interrupt".to_string()));

    adapter.stop().await;
}

#[tokio::test]
async fn interrupt_finds_the_most_recent_non_terminal_turn() {
    let script = |method: &str, params: &Value| match method {
        "thread/read" => ok(json!({"thread": {"id": "thr-1", "turns": [
            {"turnId": "t1", "status": "completed"},
            {"turnId": "t2", "status": "inProgress"},
            {"turnId": "t3", "status": "failed"},
        ]}})),
        "turn/interrupt" => ok(json!({})),
        _ => default_script(method, params),
    };
    let (adapter, calls, _peer) = harness(script, Duration::ZERO);

    let interrupted = adapter.interrupt("thr-1").await.expect("interrupt");
    assert_eq!(interrupted.as_deref(), Some("t2"));

    let recorded = lock(&calls);
    let (_, params) = recorded
        .iter()
        .find(|(method, _)| method == "turn/interrupt")
        .expect("interrupt issued");
    assert_eq!(params.get("turnId").and_then(Value::as_str), Some("t2"));

    adapter.stop().await;
}

#[tokio::test]
async fn steering_with_no_active_turn_is_an_error() {
    let (adapter, _calls, _peer) = harness(default_script, Duration::ZERO);

    let error = adapter
        .steer_turn("thr-1", "change of plans")
        .await
        .expect_err("no active turn");
    assert!(matches!(error, AdapterError::NoActiveTurn { .. }));

    adapter.stop().await;
}

#[tokio::test]
async fn live_state_builds_from_broadcasts_and_prunes_invalid_events() {
    let (adapter, _calls, peer) = harness(default_script, Duration::ZERO);
    adapter.start().await.expect("bootstrap");

    peer.send_stream_event(
        "thr-1",
        "desktop-1",
        json!({"type": "snapshot", "conversationState": {"id": "thr-1", "requests": []}}),
    );
    peer.send_stream_event("thr-1", "desktop-1", json!({"type": "rewind"}));
    peer.send_stream_event(
        "thr-1",
        "desktop-1",
        json!({"type": "patches", "patches": [
            {"op": "replace", "path": ["requests"], "value": [{"id": "req-1", "completed": false}]},
        ]}),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.read_stream_events("thr-1").len(), 3);

    let live = adapter.read_live_state("thr-1");
    assert!(live.live_state_error.is_none());
    assert_eq!(live.owner_client_id.as_deref(), Some("desktop-1"));
    let state = live.conversation_state.expect("state present");
    let requests = state
        .get("requests")
        .and_then(Value::as_array)
        .expect("requests array");
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].get("id").and_then(Value::as_str),
        Some("req-1")
    );

    // The malformed event was pruned from the buffer for good.
    assert_eq!(adapter.read_stream_events("thr-1").len(), 2);

    adapter.stop().await;
}

#[tokio::test]
async fn live_state_degrades_with_a_structured_error() {
    let (adapter, _calls, peer) = harness(default_script, Duration::ZERO);
    adapter.start().await.expect("bootstrap");

    // A patch with no snapshot and no persisted read has no base to build on.
    peer.send_stream_event(
        "thr-9",
        "desktop-1",
        json!({"type": "patches", "patches": [
            {"op": "replace", "path": ["title"], "value": "x"},
        ]}),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let live = adapter.read_live_state("thr-9");
    assert_eq!(live.conversation_state, None);
    let error = live.live_state_error.expect("structured error");
    let monitor_codex::LiveStateError::ReductionFailed(failure) = error;
    assert_eq!(failure.thread_id, "thr-9");
    assert_eq!(failure.event_index, 0);
    assert_eq!(failure.patch_index, 0);

    adapter.stop().await;
}

#[tokio::test]
async fn targeted_requests_use_the_observed_owner() {
    let (adapter, _calls, peer) = harness(default_script, Duration::ZERO);
    adapter.start().await.expect("bootstrap");

    peer.send_stream_event(
        "thr-1",
        "desktop-1",
        json!({"type": "snapshot", "conversationState": {"id": "thr-1"}}),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The observed owner wins even when the caller supplies an override.
    let owner = adapter
        .resolve_owner_client_id("thr-1", Some("override-7"))
        .expect("owner resolved");
    assert_eq!(owner, "desktop-1");

    adapter
        .set_collaboration_mode("thr-1", "plan", None)
        .await
        .expect("mode set");

    let requests = lock(&peer.requests);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "collaborationMode/set");
    assert_eq!(requests[0].target_client_id.as_deref(), Some("desktop-1"));
    assert_eq!(
        requests[0].params.get("mode").and_then(Value::as_str),
        Some("plan")
    );
    drop(requests);

    adapter.stop().await;
}

#[tokio::test]
async fn owner_resolution_fails_loudly_when_nothing_is_known() {
    let (adapter, _calls, _peer) = harness(default_script, Duration::ZERO);

    let error = adapter
        .submit_user_input("thr-unknown", "req-1", json!({"answer": "yes"}), None)
        .await
        .expect_err("no owner known");
    assert!(matches!(error, AdapterError::Ownership(_)));

    adapter.stop().await;
}

#[tokio::test]
async fn rpc_level_errors_keep_the_backend_marked_ready() {
    let mut reads = 0usize;
    let script = move |method: &str, params: &Value| match method {
        "thread/read" => {
            reads += 1;
            if reads == 1 {
                backend_error(-32001, "thread not found")
            } else {
                hang_up()
            }
        }
        _ => default_script(method, params),
    };
    let (adapter, _calls, _peer) = harness(script, Duration::ZERO);
    adapter.start().await.expect("bootstrap");

    // Backend rejected the call: the process itself is still up.
    let error = adapter.read_thread("thr-404").await.expect_err("rejected");
    assert!(matches!(error, AdapterError::Rpc(RpcError::Backend { .. })));
    let state = adapter.runtime_state();
    assert!(state.app_ready);
    assert!(state.last_error.is_some());

    // Backend hangs up mid-call: transport failure, process presumed down.
    let error = adapter.read_thread("thr-404").await.expect_err("down");
    assert!(matches!(error, AdapterError::Rpc(RpcError::Transport(_))));
    assert!(!adapter.runtime_state().app_ready);

    adapter.stop().await;
}

#[tokio::test]
async fn project_directories_are_distinct_and_most_recent_first() {
    let script = |method: &str, params: &Value| match method {
        "thread/list" => ok(json!({"data": [
            {"id": "a", "cwd": "/work/site", "updatedAt": 10, "createdAt": 1},
            {"id": "b", "cwd": "/work/api", "updatedAt": 30, "createdAt": 2},
            {"id": "c", "cwd": "/work/site", "updatedAt": 20, "createdAt": 3},
            {"id": "d", "updatedAt": 40, "createdAt": 4},
        ]})),
        _ => default_script(method, params),
    };
    let (adapter, _calls, _peer) = harness(script, Duration::ZERO);

    let directories = adapter
        .list_project_directories()
        .await
        .expect("directories");
    assert_eq!(directories, vec!["/work/api".to_string(), "/work/site".to_string()]);

    adapter.stop().await;
}
