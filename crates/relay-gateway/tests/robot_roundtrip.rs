use async_trait::async_trait;
use futures_util::StreamExt;
use relay_client::{ClientConfig, ClientError, ClientHandler, RobotServiceClient};
use relay_config::GatewayConfig;
use relay_gateway::{AuthError, Authenticator, BackendError, BackendResult, GatewayServer, RobotBackend};
use relay_protocol::{
    Conversation, GroupInfo, GroupMember, GroupMemberList, ImResult, MessagePayload, OutputMessageData,
    PushMessage, RobotProfile, SendMessageResult, UserInfo,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// In-memory IM backend for one robot
struct MemoryBackend {
    robot_id: String,
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl RobotBackend for MemoryBackend {
    async fn send_message(
        &self,
        from: &str,
        _conv: Conversation,
        payload: MessagePayload,
        _to_users: Option<Vec<String>>,
    ) -> BackendResult<SendMessageResult> {
        if from != self.robot_id {
            return Err(BackendError::failed(403, "sender mismatch"));
        }
        Ok(ImResult::ok(SendMessageResult {
            message_id: payload.searchable_content.len() as i64,
            message_uid: 1,
            timestamp: 2,
        }))
    }

    async fn reply_message(&self, _: i64, _: MessagePayload, _: bool) -> BackendResult<SendMessageResult> {
        Ok(ImResult::ok(SendMessageResult::default()))
    }

    async fn recall_message(&self, _: i64) -> BackendResult<String> {
        Ok(ImResult::error(9, "too late"))
    }

    async fn update_message(&self, _: i64, _: MessagePayload) -> BackendResult<()> {
        Ok(ImResult::ok(()))
    }

    async fn get_user_info(&self, user_id: &str) -> BackendResult<UserInfo> {
        Ok(ImResult::ok(UserInfo {
            user_id: user_id.to_string(),
            ..Default::default()
        }))
    }

    async fn get_user_info_by_mobile(&self, _: &str) -> BackendResult<UserInfo> {
        Err(BackendError::Unavailable("lookup disabled".into()))
    }

    async fn get_profile(&self) -> BackendResult<RobotProfile> {
        Ok(ImResult::ok(RobotProfile {
            user_id: self.robot_id.clone(),
            name: "Helper".to_string(),
            secret: Some("good".to_string()),
            callback: Some("http://callback".to_string()),
            state: 0,
        }))
    }

    async fn get_group_info(&self, group_id: &str) -> BackendResult<GroupInfo> {
        Ok(ImResult::ok(GroupInfo {
            group_id: group_id.to_string(),
            ..Default::default()
        }))
    }

    async fn get_group_members(&self, _: &str) -> BackendResult<GroupMemberList> {
        Ok(ImResult::ok(GroupMemberList::default()))
    }

    async fn get_group_member(&self, _: &str, _: &str) -> BackendResult<GroupMember> {
        Ok(ImResult::error(404, "no such member"))
    }

    fn release(&self) -> Result<(), BackendError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryAuthenticator {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl Authenticator for MemoryAuthenticator {
    async fn authenticate(&self, robot_id: &str, secret: &str) -> Result<Arc<dyn RobotBackend>, AuthError> {
        if secret != "good" {
            return Err(AuthError::new(401, "Invalid secret"));
        }
        Ok(Arc::new(MemoryBackend {
            robot_id: robot_id.to_string(),
            released: self.released.clone(),
        }))
    }
}

struct Pushes(mpsc::UnboundedSender<PushMessage>);

#[async_trait]
impl ClientHandler for Pushes {
    async fn on_message(&self, message: PushMessage) {
        let _ = self.0.send(message);
    }
}

async fn start_gateway(max_connections: usize) -> (GatewayServer, String, Arc<AtomicUsize>) {
    let released = Arc::new(AtomicUsize::new(0));
    let server = GatewayServer::new(
        GatewayConfig {
            bind: "127.0.0.1:0".to_string(),
            max_connections,
        },
        Arc::new(MemoryAuthenticator {
            released: released.clone(),
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/robot/gateway", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (server, url, released)
}

fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        gateway_url: url.to_string(),
        reconnect_interval: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn robot_calls_through_gateway() {
    let (server, url, released) = start_gateway(10).await;
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let client = RobotServiceClient::new(client_config(&url), Arc::new(Pushes(push_tx)));

    client.connect("helper", "good", Duration::from_secs(3)).await.unwrap();
    eventually(|| server.registry().lookup_by_remote_identity("helper").is_some()).await;

    let profile = client.get_profile().await.unwrap();
    assert!(profile.is_success());
    let profile = profile.result.unwrap();
    assert_eq!(profile.user_id, "helper");
    assert!(profile.secret.is_none());
    assert!(profile.callback.is_none());

    let sent = client
        .send_message(&Conversation::single("u1"), &MessagePayload::text("hello"))
        .await
        .unwrap();
    assert_eq!(sent.result.unwrap().message_id, 5);

    // IM-level failure is a result, not an error.
    let recalled = client.recall_message(1).await.unwrap();
    assert_eq!(recalled.code, 9);

    // Backend failure surfaces with the gateway's code.
    let lookup = client.get_user_info_by_mobile("123").await.unwrap();
    assert_eq!(lookup.code, 500);

    server
        .push_to_robot("helper", &PushMessage::message(OutputMessageData {
            sender: "u1".to_string(),
            conv: Conversation::single("helper"),
            payload: MessagePayload::text("hi robot"),
            ..Default::default()
        }))
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(2), push_rx.recv()).await.unwrap() {
        Some(PushMessage::Message { data }) => assert_eq!(data.payload.searchable_content, "hi robot"),
        other => panic!("unexpected push: {:?}", other),
    }

    client.close().await;
    eventually(|| server.registry().session_count() == 0).await;
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_secret_is_rejected_and_not_retried() {
    let (server, url, _) = start_gateway(10).await;
    let client = RobotServiceClient::new(client_config(&url), Arc::new(relay_client::NoopHandler));

    let err = client.connect("helper", "bad", Duration::from_secs(3)).await.unwrap_err();
    assert!(matches!(err, ClientError::AuthenticationFailed { code: 401, .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.registry().session_count(), 0);
    assert!(!client.connection().is_running());
}

#[tokio::test]
async fn connection_limit_rejects_extra_clients() {
    let (server, url, _) = start_gateway(1).await;
    let client = RobotServiceClient::new(client_config(&url), Arc::new(relay_client::NoopHandler));
    client.connect("helper", "good", Duration::from_secs(3)).await.unwrap();

    let (mut extra, _) = connect_async(url.as_str()).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), extra.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Message::Text(text) => {
            let reply: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(reply["type"], "connect");
            assert_eq!(reply["code"], 503);
        }
        other => panic!("unexpected frame: {:?}", other),
    }
    assert_eq!(server.registry().session_count(), 1);

    client.close().await;
}

#[tokio::test]
async fn unauthenticated_request_closes_connection() {
    let (server, url, _) = start_gateway(10).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    use futures_util::SinkExt;
    ws.send(Message::Text(
        r#"{"requestId":"r1","method":"getProfile","params":[]}"#.to_string(),
    ))
    .await
    .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["code"], 401);

    // The close frame follows, then the stream ends.
    let mut closed = false;
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(closed);
    eventually(|| server.registry().session_count() == 0).await;
}
