//! Session registry
//!
//! One session per accepted connection. A session starts unauthenticated and
//! is bound to a robot identity and its backend exactly once. The backend is
//! released exactly once, when the session is removed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_observability::metrics::SessionMetrics;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::RobotBackend;
use crate::connection::ConnectionHandle;
use crate::error::SessionError;

pub type SessionId = String;

struct Binding {
    identity: String,
    backend: Arc<dyn RobotBackend>,
    authenticated_at: DateTime<Utc>,
}

struct Session {
    connection: ConnectionHandle,
    /// Present iff the session is authenticated.
    binding: Option<Binding>,
    created_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

/// Read-only view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub identity: Option<String>,
    pub connection: ConnectionHandle,
    pub created_at: DateTime<Utc>,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Tracks all server-side sessions
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Session>>,
    /// identity -> most recently authenticated session
    by_identity: Arc<DashMap<String, SessionId>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("identities", &self.by_identity.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new unauthenticated session
    pub fn add_session(&self, connection: ConnectionHandle) -> SessionId {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.sessions.insert(
            id.clone(),
            Session {
                connection,
                binding: None,
                created_at: now,
                last_heartbeat: now,
            },
        );
        SessionMetrics::set_active(self.sessions.len());
        info!(session_id = %id, total = self.sessions.len(), "Session added");
        id
    }

    /// Binds a session to a robot identity and its backend.
    ///
    /// On error the offered backend is released and any existing binding is
    /// left untouched.
    pub fn authenticate(
        &self,
        session_id: &str,
        identity: &str,
        backend: Arc<dyn RobotBackend>,
    ) -> Result<(), SessionError> {
        {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                warn!(session_id = %session_id, "Session not found for authentication");
                release(session_id, backend.as_ref());
                return Err(SessionError::NotFound(session_id.to_string()));
            };

            if session.binding.is_some() {
                drop(session);
                release(session_id, backend.as_ref());
                return Err(SessionError::AlreadyAuthenticated(session_id.to_string()));
            }

            session.binding = Some(Binding {
                identity: identity.to_string(),
                backend,
                authenticated_at: Utc::now(),
            });
        }

        if let Some(previous) = self
            .by_identity
            .insert(identity.to_string(), session_id.to_string())
        {
            if previous != session_id {
                warn!(robot_id = %identity, previous = %previous, "Robot identity claimed by a newer session");
            }
        }
        info!(session_id = %session_id, robot_id = %identity, "Session authenticated");
        Ok(())
    }

    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.binding.is_some())
            .unwrap_or(false)
    }

    pub fn identity(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.binding.as_ref().map(|b| b.identity.clone()))
    }

    /// Backend bound to an authenticated session
    pub fn backend(&self, session_id: &str) -> Option<Arc<dyn RobotBackend>> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.binding.as_ref().map(|b| Arc::clone(&b.backend)))
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(session_id)
            .map(|s| snapshot(session_id, &s))
    }

    /// Session currently representing `identity`
    pub fn lookup_by_remote_identity(&self, identity: &str) -> Option<SessionSnapshot> {
        let session_id = self.by_identity.get(identity)?.value().clone();
        self.get(&session_id)
    }

    pub fn touch_heartbeat(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Delivers a frame to the session of `identity`
    pub fn send_to_identity<T: Serialize>(&self, identity: &str, frame: &T) -> Result<(), SessionError> {
        let session = self
            .lookup_by_remote_identity(identity)
            .ok_or_else(|| SessionError::IdentityNotFound(identity.to_string()))?;
        session.connection.send_json(frame)
    }

    /// Removes a session and releases its backend. Idempotent.
    pub fn remove(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        if let Some(binding) = session.binding {
            self.by_identity
                .remove_if(&binding.identity, |_, current| current == session_id);
            release(session_id, binding.backend.as_ref());
        }

        SessionMetrics::set_active(self.sessions.len());
        info!(session_id = %session_id, total = self.sessions.len(), "Session removed");
        true
    }

    /// Closes every connection and releases every backend
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some(session) = self.sessions.get(id) {
                session.connection.close(
                    tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Away,
                    "Gateway shutting down",
                );
            }
            self.remove(id);
        }
        info!(count = ids.len(), "All sessions closed");
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.binding.is_some()).count()
    }
}

fn snapshot(id: &str, session: &Session) -> SessionSnapshot {
    SessionSnapshot {
        id: id.to_string(),
        identity: session.binding.as_ref().map(|b| b.identity.clone()),
        connection: session.connection.clone(),
        created_at: session.created_at,
        authenticated_at: session.binding.as_ref().map(|b| b.authenticated_at),
        last_heartbeat: session.last_heartbeat,
    }
}

fn release(session_id: &str, backend: &dyn RobotBackend) {
    match backend.release() {
        Ok(()) => debug!(session_id = %session_id, "Backend released"),
        Err(e) => warn!(session_id = %session_id, "Failed to release backend: {}", e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::BackendResult;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use relay_protocol::{
        Conversation, GroupInfo, GroupMember, GroupMemberList, ImResult, MessagePayload, RobotProfile,
        SendMessageResult, UserInfo,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    /// Backend that counts releases and answers every call with canned data.
    #[derive(Default)]
    pub(crate) struct CountingBackend {
        pub releases: AtomicUsize,
        pub fail_release: bool,
    }

    #[async_trait]
    impl RobotBackend for CountingBackend {
        async fn send_message(
            &self,
            _from: &str,
            conv: Conversation,
            _payload: MessagePayload,
            _to_users: Option<Vec<String>>,
        ) -> BackendResult<SendMessageResult> {
            if conv.target == "blocked" {
                return Err(BackendError::failed(403, "target blocked"));
            }
            Ok(ImResult::ok(SendMessageResult {
                message_id: 42,
                message_uid: 4200,
                timestamp: 1,
            }))
        }

        async fn reply_message(&self, _: i64, _: MessagePayload, _: bool) -> BackendResult<SendMessageResult> {
            Ok(ImResult::ok(SendMessageResult::default()))
        }

        async fn recall_message(&self, message_id: i64) -> BackendResult<String> {
            Ok(ImResult::ok(message_id.to_string()))
        }

        async fn update_message(&self, _: i64, _: MessagePayload) -> BackendResult<()> {
            Ok(ImResult::ok(()))
        }

        async fn get_user_info(&self, user_id: &str) -> BackendResult<UserInfo> {
            Ok(ImResult::ok(UserInfo {
                user_id: user_id.to_string(),
                display_name: "Alice".to_string(),
                ..Default::default()
            }))
        }

        async fn get_user_info_by_mobile(&self, _: &str) -> BackendResult<UserInfo> {
            Ok(ImResult::error(404, "not found"))
        }

        async fn get_profile(&self) -> BackendResult<RobotProfile> {
            Ok(ImResult::ok(RobotProfile {
                user_id: "robot".to_string(),
                name: "Robot".to_string(),
                secret: Some("s3cret".to_string()),
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

        async fn get_group_member(&self, group_id: &str, member_id: &str) -> BackendResult<GroupMember> {
            Ok(ImResult::ok(GroupMember {
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                ..Default::default()
            }))
        }

        fn release(&self) -> Result<(), BackendError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                Err(BackendError::Unavailable("already gone".into()))
            } else {
                Ok(())
            }
        }
    }

    pub(crate) fn test_connection() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(
            "conn",
            "127.0.0.1:9".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (handle, rx)
    }

    #[test]
    fn authenticate_binds_once() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = test_connection();
        let id = registry.add_session(conn);
        assert!(!registry.is_authenticated(&id));
        assert!(registry.backend(&id).is_none());

        let first = Arc::new(CountingBackend::default());
        registry.authenticate(&id, "robot-a", first.clone()).unwrap();
        assert!(registry.is_authenticated(&id));

        let second = Arc::new(CountingBackend::default());
        assert_eq!(
            registry.authenticate(&id, "robot-b", second.clone()),
            Err(SessionError::AlreadyAuthenticated(id.clone()))
        );
        assert_eq!(registry.identity(&id).as_deref(), Some("robot-a"));
        assert_eq!(second.releases.load(Ordering::SeqCst), 1);
        assert_eq!(first.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn authenticate_unknown_session_releases_offered_backend() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(CountingBackend::default());
        assert!(matches!(
            registry.authenticate("missing", "robot", backend.clone()),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_releases_exactly_once() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = test_connection();
        let id = registry.add_session(conn);
        let backend = Arc::new(CountingBackend {
            fail_release: true,
            ..Default::default()
        });
        registry.authenticate(&id, "robot", backend.clone()).unwrap();

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        assert!(registry.lookup_by_remote_identity("robot").is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn newest_session_wins_identity_lookup() {
        let registry = SessionRegistry::new();
        let (old_conn, _old_rx) = test_connection();
        let (new_conn, _new_rx) = test_connection();
        let old = registry.add_session(old_conn);
        let new = registry.add_session(new_conn);

        registry
            .authenticate(&old, "robot", Arc::new(CountingBackend::default()))
            .unwrap();
        registry
            .authenticate(&new, "robot", Arc::new(CountingBackend::default()))
            .unwrap();
        assert_eq!(registry.lookup_by_remote_identity("robot").unwrap().id, new);

        // Removing the stale session must not drop the newer index entry.
        registry.remove(&old);
        assert_eq!(registry.lookup_by_remote_identity("robot").unwrap().id, new);
    }

    #[test]
    fn send_to_identity_reaches_connection() {
        let registry = SessionRegistry::new();
        let (conn, mut rx) = test_connection();
        let id = registry.add_session(conn);
        registry
            .authenticate(&id, "robot", Arc::new(CountingBackend::default()))
            .unwrap();

        registry
            .send_to_identity("robot", &serde_json::json!({ "type": "event", "event": "ping" }))
            .unwrap();
        match rx.try_recv().unwrap() {
            Message::Text(text) => assert!(text.contains("\"ping\"")),
            other => panic!("unexpected frame: {:?}", other),
        }

        assert_eq!(
            registry.send_to_identity("nobody", &1),
            Err(SessionError::IdentityNotFound("nobody".to_string()))
        );
    }

    #[test]
    fn concurrent_add_and_remove() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let (conn, _rx) = test_connection();
                        let id = registry.add_session(conn);
                        registry
                            .authenticate(&id, &id.clone(), Arc::new(CountingBackend::default()))
                            .unwrap();
                        assert!(registry.remove(&id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn close_all_releases_every_backend() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(CountingBackend::default());
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (conn, rx) = test_connection();
            receivers.push(rx);
            let id = registry.add_session(conn);
            registry
                .authenticate(&id, &format!("robot-{}", i), backend.clone())
                .unwrap();
        }

        registry.close_all();
        assert_eq!(registry.session_count(), 0);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 3);
        for mut rx in receivers {
            assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
        }
    }
}
