//! Protocol dispatcher
//!
//! Per-connection state machine: `Unauthenticated -> Authenticated -> Closed`.
//! Requests are routed through an explicit [`HandlerTable`]; nothing outside
//! the table is reachable, and credential/callback management is denied by
//! name.

use futures_util::future::{BoxFuture, FutureExt};
use relay_observability::metrics::DispatchMetrics;
use relay_protocol::{
    now_millis, ConnectMessage, Conversation, ImResult, MessagePayload, RequestMessage, ResponseMessage,
    ServerFrame, HEARTBEAT_METHOD,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{Authenticator, RobotBackend};
use crate::error::{BackendError, DispatchError, SessionError};
use crate::session::SessionRegistry;

/// Operations that are never exposed, whatever the table holds.
pub const DENIED_METHODS: [&str; 3] = ["setCallback", "getCallback", "deleteCallback"];

pub type HandlerResult = Result<Value, DispatchError>;

/// A named operation: backend plus positional params in, JSON result out.
pub type Handler = fn(Arc<dyn RobotBackend>, Vec<Value>) -> BoxFuture<'static, HandlerResult>;

/// Explicit operation name -> handler mapping
#[derive(Clone)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, Handler>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods = self.methods();
        methods.sort_unstable();
        f.debug_struct("HandlerTable").field("methods", &methods).finish()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::robot_api()
    }
}

impl HandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Robot API exposed to gateway clients
    pub fn robot_api() -> Self {
        let mut table = Self::empty();
        table.register("sendMessage", |b, p| send_message(b, p).boxed());
        table.register("replyMessage", |b, p| reply_message(b, p).boxed());
        table.register("recallMessage", |b, p| recall_message(b, p).boxed());
        table.register("updateMessage", |b, p| update_message(b, p).boxed());
        table.register("getUserInfo", |b, p| get_user_info(b, p).boxed());
        table.register("getUserInfoByMobile", |b, p| get_user_info_by_mobile(b, p).boxed());
        table.register("getProfile", |b, p| get_profile(b, p).boxed());
        table.register("getGroupInfo", |b, p| get_group_info(b, p).boxed());
        table.register("getGroupMembers", |b, p| get_group_members(b, p).boxed());
        table.register("getGroupMember", |b, p| get_group_member(b, p).boxed());
        table
    }

    /// Adds an operation. Denied names are refused.
    pub fn register(&mut self, method: &'static str, handler: Handler) -> bool {
        if DENIED_METHODS.contains(&method) {
            warn!(method, "Refusing to register denied method");
            return false;
        }
        self.handlers.insert(method, handler);
        true
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub async fn invoke(&self, method: &str, backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
        if DENIED_METHODS.contains(&method) {
            return Err(DispatchError::Denied(method.to_string()));
        }
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))?;
        handler(backend, params).await
    }
}

/// What to do after handling one frame
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Frame to send back, if any
    pub reply: Option<String>,
    /// Close the connection after sending the reply
    pub close: bool,
}

impl DispatchOutcome {
    fn reply<T: Serialize>(frame: &T) -> Self {
        Self {
            reply: serde_json::to_string(frame).ok(),
            close: false,
        }
    }

    fn reply_and_close<T: Serialize>(frame: &T) -> Self {
        Self {
            reply: serde_json::to_string(frame).ok(),
            close: true,
        }
    }
}

/// Server-role protocol handling for every session
#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    authenticator: Arc<dyn Authenticator>,
    handlers: Arc<HandlerTable>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: SessionRegistry, authenticator: Arc<dyn Authenticator>, handlers: HandlerTable) -> Self {
        Self {
            registry,
            authenticator,
            handlers: Arc::new(handlers),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handles one text frame from `session_id`.
    pub async fn handle_text(&self, session_id: &str, text: &str) -> DispatchOutcome {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                if !self.registry.is_authenticated(session_id) {
                    return self.reject_unauthenticated(session_id);
                }
                warn!(session_id = %session_id, "Failed to parse frame: {}", e);
                DispatchMetrics::record("invalid_json");
                return DispatchOutcome::reply(&ConnectMessage::error(
                    400,
                    format!("Invalid JSON format: {}", e),
                ));
            }
        };

        if let ServerFrame::Connect(connect) = frame {
            return self.handle_connect(session_id, connect).await;
        }

        if !self.registry.is_authenticated(session_id) {
            return self.reject_unauthenticated(session_id);
        }

        match frame {
            ServerFrame::MalformedRequest { request_id } => {
                DispatchMetrics::record("malformed");
                DispatchOutcome::reply(&ResponseMessage::error(
                    request_id,
                    400,
                    "Invalid request format: requestId and method are required",
                ))
            }
            ServerFrame::Request(request) if request.method == HEARTBEAT_METHOD => {
                self.registry.touch_heartbeat(session_id);
                debug!(session_id = %session_id, "Heartbeat");
                DispatchOutcome::reply(&ResponseMessage::success(
                    Some(request.request_id),
                    Some(Value::from(now_millis())),
                ))
            }
            ServerFrame::Request(request) => DispatchOutcome::reply(&self.dispatch(session_id, request).await),
            ServerFrame::Connect(_) => DispatchOutcome::default(),
        }
    }

    async fn handle_connect(&self, session_id: &str, connect: ConnectMessage) -> DispatchOutcome {
        if self.registry.is_authenticated(session_id) {
            DispatchMetrics::record("already_authenticated");
            return DispatchOutcome::reply(&ConnectMessage::error(400, "Already authenticated"));
        }

        let (Some(robot_id), Some(secret)) = (connect.robot_id, connect.secret) else {
            return DispatchOutcome::reply(&ConnectMessage::error(
                400,
                "Invalid connect message: robotId and secret are required",
            ));
        };

        info!(session_id = %session_id, robot_id = %robot_id, "Authenticating session");
        let backend = match self.authenticator.authenticate(&robot_id, &secret).await {
            Ok(backend) => backend,
            Err(rejection) => {
                warn!(session_id = %session_id, robot_id = %robot_id, code = rejection.code, "Authentication failed: {}", rejection.msg);
                return DispatchOutcome::reply(&ConnectMessage::error(rejection.code, rejection.msg));
            }
        };

        match self.registry.authenticate(session_id, &robot_id, backend) {
            Ok(()) => DispatchOutcome::reply(&ConnectMessage::success()),
            // Lost a race with a concurrent connect on the same session.
            Err(SessionError::AlreadyAuthenticated(_)) => {
                DispatchOutcome::reply(&ConnectMessage::error(400, "Already authenticated"))
            }
            Err(e) => DispatchOutcome::reply(&ConnectMessage::error(500, e.to_string())),
        }
    }

    fn reject_unauthenticated(&self, session_id: &str) -> DispatchOutcome {
        warn!(session_id = %session_id, "Frame before authentication, closing");
        DispatchMetrics::record("unauthenticated");
        DispatchOutcome::reply_and_close(&ConnectMessage::error(
            401,
            "Not authenticated. Please send connect message first.",
        ))
    }

    /// Runs a request through the handler table.
    pub async fn dispatch(&self, session_id: &str, request: RequestMessage) -> ResponseMessage {
        let request_id = Some(request.request_id.clone());
        info!(session_id = %session_id, request_id = %request.request_id, method = %request.method, "Handling request");

        let outcome = match self.registry.backend(session_id) {
            Some(backend) => {
                self.handlers
                    .invoke(&request.method, backend, request.params)
                    .await
            }
            None if self.registry.is_authenticated(session_id) => Err(DispatchError::BackendMissing),
            None => Err(DispatchError::NotAuthenticated),
        };

        match outcome {
            Ok(result) => {
                DispatchMetrics::record("ok");
                ResponseMessage::success(request_id, Some(result))
            }
            Err(e) => {
                warn!(method = %request.method, code = e.code(), "Request failed: {}", e);
                DispatchMetrics::record(e.outcome());
                ResponseMessage::error(request_id, e.code(), e.to_string())
            }
        }
    }
}

/// Positional parameters with arity checking.
struct Args {
    params: Vec<Value>,
}

impl Args {
    fn new(params: Vec<Value>, min: usize, max: usize) -> Result<Self, DispatchError> {
        if params.len() < min || params.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{}..{}", min, max)
            };
            return Err(DispatchError::InvalidArguments(format!(
                "expected {} parameters, got {}",
                expected,
                params.len()
            )));
        }
        Ok(Self { params })
    }

    /// Converts a parameter; a missing one reads as `null`.
    fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, DispatchError> {
        let value = self.params.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| DispatchError::InvalidArguments(format!("parameter {}: {}", index, e)))
    }
}

fn encode<T: Serialize>(result: Result<ImResult<T>, BackendError>) -> HandlerResult {
    let result = result?;
    serde_json::to_value(result).map_err(|e| DispatchError::Encode(e.to_string()))
}

async fn send_message(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 3, 4)?;
    let from: String = args.get(0)?;
    let conv: Conversation = args.get(1)?;
    let payload: MessagePayload = args.get(2)?;
    let to_users: Option<Vec<String>> = args.get(3)?;
    encode(backend.send_message(&from, conv, payload, to_users).await)
}

async fn reply_message(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 3, 3)?;
    let message_id: i64 = args.get(0)?;
    let payload: MessagePayload = args.get(1)?;
    let mention_sender: bool = args.get(2)?;
    encode(backend.reply_message(message_id, payload, mention_sender).await)
}

async fn recall_message(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 1, 1)?;
    encode(backend.recall_message(args.get(0)?).await)
}

async fn update_message(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 2, 2)?;
    let message_id: i64 = args.get(0)?;
    let payload: MessagePayload = args.get(1)?;
    encode(backend.update_message(message_id, payload).await)
}

async fn get_user_info(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 1, 1)?;
    let user_id: String = args.get(0)?;
    encode(backend.get_user_info(&user_id).await)
}

async fn get_user_info_by_mobile(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 1, 1)?;
    let mobile: String = args.get(0)?;
    encode(backend.get_user_info_by_mobile(&mobile).await)
}

async fn get_profile(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    Args::new(params, 0, 0)?;
    let mut profile = backend.get_profile().await?;
    // Robots never see their own secret or callback.
    if profile.is_success() {
        profile.result = profile.result.map(|p| p.redacted());
    }
    encode(Ok(profile))
}

async fn get_group_info(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 1, 1)?;
    let group_id: String = args.get(0)?;
    encode(backend.get_group_info(&group_id).await)
}

async fn get_group_members(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 1, 1)?;
    let group_id: String = args.get(0)?;
    encode(backend.get_group_members(&group_id).await)
}

async fn get_group_member(backend: Arc<dyn RobotBackend>, params: Vec<Value>) -> HandlerResult {
    let args = Args::new(params, 2, 2)?;
    let group_id: String = args.get(0)?;
    let member_id: String = args.get(1)?;
    encode(backend.get_group_member(&group_id, &member_id).await)
}
