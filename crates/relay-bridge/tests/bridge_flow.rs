use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use relay_bridge::{AgentError, Bridge, BridgeError};
use relay_config::{Config, GatewayConfig};
use relay_gateway::{AuthError, Authenticator, BackendResult, GatewayServer, RobotBackend};
use relay_protocol::{
    Conversation, GroupInfo, GroupMember, GroupMemberList, ImResult, MessagePayload, OutputMessageData,
    PushMessage, RobotProfile, SendMessageResult, UserInfo,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

// ---- IM side: the real gateway with a recording backend ----

type Sent = (Conversation, MessagePayload);

struct RecordingBackend {
    sent: mpsc::UnboundedSender<Sent>,
}

fn unsupported<T>() -> BackendResult<T> {
    Ok(ImResult::error(501, "unsupported"))
}

#[async_trait]
impl RobotBackend for RecordingBackend {
    async fn send_message(
        &self,
        _from: &str,
        conv: Conversation,
        payload: MessagePayload,
        _to_users: Option<Vec<String>>,
    ) -> BackendResult<SendMessageResult> {
        let _ = self.sent.send((conv, payload));
        Ok(ImResult::ok(SendMessageResult::default()))
    }

    async fn reply_message(&self, _: i64, _: MessagePayload, _: bool) -> BackendResult<SendMessageResult> {
        unsupported()
    }

    async fn recall_message(&self, _: i64) -> BackendResult<String> {
        unsupported()
    }

    async fn update_message(&self, _: i64, _: MessagePayload) -> BackendResult<()> {
        unsupported()
    }

    async fn get_user_info(&self, _: &str) -> BackendResult<UserInfo> {
        unsupported()
    }

    async fn get_user_info_by_mobile(&self, _: &str) -> BackendResult<UserInfo> {
        unsupported()
    }

    async fn get_profile(&self) -> BackendResult<RobotProfile> {
        unsupported()
    }

    async fn get_group_info(&self, _: &str) -> BackendResult<GroupInfo> {
        unsupported()
    }

    async fn get_group_members(&self, _: &str) -> BackendResult<GroupMemberList> {
        unsupported()
    }

    async fn get_group_member(&self, _: &str, _: &str) -> BackendResult<GroupMember> {
        unsupported()
    }
}

struct RecordingAuthenticator {
    sent: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Authenticator for RecordingAuthenticator {
    async fn authenticate(&self, _robot_id: &str, secret: &str) -> Result<Arc<dyn RobotBackend>, AuthError> {
        if secret != "good" {
            return Err(AuthError::new(401, "Invalid secret"));
        }
        Ok(Arc::new(RecordingBackend {
            sent: self.sent.clone(),
        }))
    }
}

async fn start_im_gateway() -> (GatewayServer, String, mpsc::UnboundedReceiver<Sent>) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let server = GatewayServer::new(
        GatewayConfig {
            bind: "127.0.0.1:0".to_string(),
            max_connections: 10,
        },
        Arc::new(RecordingAuthenticator { sent: sent_tx }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/robot/gateway", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, url, sent_rx)
}

// ---- Agent side: a scripted agent gateway ----

struct FakeAgent {
    url: String,
    connections: Arc<AtomicUsize>,
    chats: mpsc::UnboundedReceiver<Value>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    kill: broadcast::Sender<()>,
}

impl FakeAgent {
    /// Sends a raw frame on the newest connection.
    fn inject(&self, frame: Value) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(Message::Text(frame.to_string()));
        }
    }
}

#[derive(Clone)]
struct AgentScript {
    token: &'static str,
    /// This connection (1-based) drops right after its handshake succeeds.
    drop_after_hello: Option<usize>,
    connections: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
    chats: mpsc::UnboundedSender<Value>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    kill: broadcast::Sender<()>,
}

fn frame(value: Value) -> Message {
    Message::Text(value.to_string())
}

fn agent_event(run_id: &str, stream: &str, data: Value) -> Message {
    frame(json!({
        "type": "event",
        "event": "agent",
        "payload": { "runId": run_id, "stream": stream, "data": data }
    }))
}

async fn start_fake_agent(token: &'static str) -> FakeAgent {
    start_scripted_agent(token, None).await
}

async fn start_scripted_agent(token: &'static str, drop_after_hello: Option<usize>) -> FakeAgent {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (chats_tx, chats_rx) = mpsc::unbounded_channel();
    let (kill, _) = broadcast::channel(4);

    let script = AgentScript {
        token,
        drop_after_hello,
        connections: Arc::new(AtomicUsize::new(0)),
        runs: Arc::new(AtomicUsize::new(0)),
        chats: chats_tx,
        current: Arc::new(Mutex::new(None)),
        kill: kill.clone(),
    };
    let agent = FakeAgent {
        url,
        connections: script.connections.clone(),
        chats: chats_rx,
        current: script.current.clone(),
        kill,
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_agent(stream, script.clone()));
        }
    });
    agent
}

async fn serve_agent(stream: TcpStream, script: AgentScript) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let number = script.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *script.current.lock().unwrap() = Some(tx.clone());
    let mut kill = script.kill.subscribe();

    let _ = tx.send(frame(json!({
        "type": "event",
        "event": "connect.challenge",
        "payload": { "nonce": "n-1", "ts": 0 }
    })));

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            Some(out) = rx.recv() => {
                if sink.send(out).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    let id = request["id"].clone();
                    match request["method"].as_str() {
                        Some("connect") => {
                            let ok = request["params"]["auth"]["token"] == script.token;
                            let hello = frame(json!({
                                "type": "res", "id": id, "ok": ok,
                                "payload": { "type": "hello-ok", "protocol": 3 },
                                "error": if ok { Value::Null } else { json!({ "message": "bad token" }) }
                            }));
                            if ok && script.drop_after_hello == Some(number) {
                                let _ = sink.send(hello).await;
                                break;
                            }
                            let _ = tx.send(hello);
                        }
                        Some("chat.send") => {
                            let run = format!("run-{}", script.runs.fetch_add(1, Ordering::SeqCst) + 1);
                            let _ = script.chats.send(request["params"].clone());
                            let _ = tx.send(frame(json!({
                                "type": "res", "id": id, "ok": true,
                                "payload": { "runId": run, "status": "started" }
                            })));
                            let _ = tx.send(agent_event(&run, "assistant", json!({ "text": "Hel" })));
                            let _ = tx.send(agent_event(&run, "assistant", json!({ "text": "Hello" })));
                            let _ = tx.send(agent_event(&run, "lifecycle", json!({ "phase": "end" })));
                            let _ = tx.send(frame(json!({
                                "type": "event", "event": "chat",
                                "payload": {
                                    "runId": run, "state": "final",
                                    "message": { "content": [{ "type": "text", "text": "Hello" }] }
                                }
                            })));
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// ---- helpers ----

fn bridge_config(im_url: &str, agent: &FakeAgent, token: &str) -> Config {
    let mut config = Config::default();
    config.im.gateway_url = im_url.to_string();
    config.im.robot_id = "bot".to_string();
    config.im.robot_secret = "good".to_string();
    config.im.connect_timeout_secs = 5;
    config.agent.url = agent.url.clone();
    config.agent.token = Some(token.to_string());
    config.agent.reconnect_interval_secs = 1;
    config.agent.auth_timeout_secs = 5;
    config.agent.max_reconnect_attempts = 3;
    config
}

fn private_text(sender: &str, text: &str) -> PushMessage {
    PushMessage::message(OutputMessageData {
        sender: sender.to_string(),
        conv: Conversation::single("bot"),
        payload: MessagePayload::text(text),
        timestamp: 1,
        ..Default::default()
    })
}

async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no message sent to IM in time")
        .expect("IM backend gone")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn expect_stream_reply(sent: &mut mpsc::UnboundedReceiver<Sent>, to: &str) {
    let (conv, payload) = next_sent(sent).await;
    assert_eq!(conv, Conversation::single(to));
    assert_eq!((payload.payload_type, payload.searchable_content.as_str()), (14, "Hel"));
    let run_id = payload.content.clone();
    assert!(run_id.starts_with("run-"));

    let (_, payload) = next_sent(sent).await;
    assert_eq!((payload.payload_type, payload.searchable_content.as_str()), (14, "Hello"));

    let (conv, payload) = next_sent(sent).await;
    assert_eq!(conv, Conversation::single(to));
    assert_eq!((payload.payload_type, payload.searchable_content.as_str()), (15, "Hello"));
    assert_eq!(payload.content, run_id);
}

// ---- tests ----

#[tokio::test]
async fn streams_agent_reply_back_to_sender() {
    let (im, im_url, mut sent) = start_im_gateway().await;
    let mut agent = start_fake_agent("tok").await;
    let bridge = Bridge::new(bridge_config(&im_url, &agent, "tok"));

    bridge.start().await.unwrap();
    assert!(bridge.is_running());
    assert!(bridge.is_im_connected());
    assert!(bridge.is_agent_connected());

    im.push_to_robot("bot", &private_text("u1", "hello agent")).unwrap();

    let chat = tokio::time::timeout(Duration::from_secs(3), agent.chats.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat["message"], "hello agent");
    assert_eq!(chat["sessionKey"], "main");

    expect_stream_reply(&mut sent, "u1").await;

    // The chat-level final arrives after the stream completed the run; nothing more is sent.
    assert!(tokio::time::timeout(Duration::from_millis(300), sent.recv()).await.is_err());
    let stats = bridge.stats();
    assert_eq!(stats.messages_forwarded, 1);
    assert_eq!(stats.replies_sent, 3);
    assert_eq!(stats.contexts.active, 0);
    assert_eq!(stats.contexts.provisional, 0);

    bridge.stop().await;
    assert!(!bridge.is_running());
}

#[tokio::test]
async fn orphan_event_is_dropped_and_processing_continues() {
    let (im, im_url, mut sent) = start_im_gateway().await;
    let mut agent = start_fake_agent("tok").await;
    let bridge = Bridge::new(bridge_config(&im_url, &agent, "tok"));
    bridge.start().await.unwrap();

    agent.inject(json!({
        "type": "event",
        "event": "agent",
        "payload": { "runId": "r-orphan", "stream": "assistant", "data": { "text": "ghost" } }
    }));
    eventually(|| bridge.stats().events_unresolved == 1).await;

    im.push_to_robot("bot", &private_text("u2", "still there?")).unwrap();
    agent.chats.recv().await.unwrap();
    expect_stream_reply(&mut sent, "u2").await;

    bridge.stop().await;
}

#[tokio::test]
async fn filtered_messages_never_reach_agent() {
    let (im, im_url, _sent) = start_im_gateway().await;
    let mut agent = start_fake_agent("tok").await;
    let mut config = bridge_config(&im_url, &agent, "tok");
    config.whitelist.enabled = true;
    config.whitelist.blocked_users = vec!["spam".to_string()];
    let bridge = Bridge::new(config);
    bridge.start().await.unwrap();

    im.push_to_robot("bot", &private_text("spam", "buy now")).unwrap();
    im.push_to_robot(
        "bot",
        &PushMessage::message(OutputMessageData {
            sender: "u1".to_string(),
            conv: Conversation::group("g1"),
            payload: MessagePayload::text("just chatting"),
            ..Default::default()
        }),
    )
    .unwrap();
    im.push_to_robot(
        "bot",
        &PushMessage::message(OutputMessageData {
            sender: "u1".to_string(),
            conv: Conversation::single("bot"),
            payload: MessagePayload {
                payload_type: 50,
                searchable_content: "custom".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }),
    )
    .unwrap();

    eventually(|| bridge.stats().messages_filtered == 3).await;
    assert!(tokio::time::timeout(Duration::from_millis(200), agent.chats.recv()).await.is_err());
    assert_eq!(bridge.stats().messages_forwarded, 0);

    bridge.stop().await;
}

#[tokio::test]
async fn agent_drop_is_reconnected() {
    let (_im, im_url, _sent) = start_im_gateway().await;
    let agent = start_fake_agent("tok").await;
    let bridge = Bridge::new(bridge_config(&im_url, &agent, "tok"));
    bridge.start().await.unwrap();
    assert_eq!(agent.connections.load(Ordering::SeqCst), 1);

    agent.kill.send(()).unwrap();
    // The first attempt is immediate, so the disconnected window is too short to observe.
    eventually(|| {
        agent.connections.load(Ordering::SeqCst) == 2
            && bridge.is_agent_connected()
            && bridge.stats().agent_reconnects >= 1
    })
    .await;
    // The IM side is independent of the agent connection.
    assert!(bridge.is_im_connected());

    bridge.stop().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(agent.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn drop_right_after_reconnect_is_reconnected_again() {
    let (_im, im_url, _sent) = start_im_gateway().await;
    let agent = start_scripted_agent("tok", Some(2)).await;
    let bridge = Bridge::new(bridge_config(&im_url, &agent, "tok"));
    bridge.start().await.unwrap();

    agent.kill.send(()).unwrap();
    eventually(|| agent.connections.load(Ordering::SeqCst) == 3 && bridge.is_agent_connected()).await;
    assert!(bridge.stats().agent_reconnects >= 2);

    bridge.stop().await;
}

#[tokio::test]
async fn bad_agent_token_fails_start() {
    let (im, im_url, _sent) = start_im_gateway().await;
    let agent = start_fake_agent("tok").await;
    let bridge = Bridge::new(bridge_config(&im_url, &agent, "wrong"));

    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::Agent(AgentError::Rejected { .. })), "{:?}", err);
    assert!(!bridge.is_running());

    // The IM session was closed on the way out.
    eventually(|| im.registry().session_count() == 0).await;
}

#[tokio::test]
async fn bad_im_secret_fails_start() {
    let (_im, im_url, _sent) = start_im_gateway().await;
    let agent = start_fake_agent("tok").await;
    let mut config = bridge_config(&im_url, &agent, "tok");
    config.im.robot_secret = "bad".to_string();
    let bridge = Bridge::new(config);

    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::Im(_)));
    assert!(!bridge.is_running());
    assert_eq!(agent.connections.load(Ordering::SeqCst), 0);
}
