//! Agent gateway frames.
//!
//! Every frame is a JSON object with a `type` of `req`, `res` or `event`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 3;
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_CHAT_SEND: &str = "chat.send";

pub const EVENT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_AGENT: &str = "agent";
pub const EVENT_CHAT: &str = "chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentFrame {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename = "res")]
    Response(AgentResponse),
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl AgentFrame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(AgentFrame::Request {
            id: id.into(),
            method: method.into(),
            params: serde_json::to_value(params)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl AgentResponse {
    pub fn run_id(&self) -> Option<&str> {
        self.payload.as_ref()?.get("runId")?.as_str()
    }

    /// Human readable error, whether the gateway sent a string or an object.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthInfo>,
    pub user_agent: String,
}

impl ConnectParams {
    pub fn operator(token: Option<&str>) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "cli".to_string(),
                version: CLIENT_VERSION.to_string(),
                platform: "rust".to_string(),
                mode: "cli".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            auth: token.filter(|t| !t.is_empty()).map(|t| AuthInfo { token: t.to_string() }),
            user_agent: format!("relay/{}", CLIENT_VERSION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthInfo {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Lifecycle step of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    /// Assistant text in progress
    Delta,
    /// `agent` event with `phase: end`
    End,
    /// `chat` event with `state: final`
    Final,
    Error(String),
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::End | RunPhase::Final | RunPhase::Error(_))
    }
}

/// A streaming event tagged with its run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    pub run_id: String,
    pub phase: RunPhase,
    pub text: Option<String>,
}

impl RunEvent {
    /// Interprets an `agent` or `chat` event payload.
    ///
    /// Returns `None` for events that carry nothing to relay (tool streams,
    /// chat deltas that duplicate the agent stream, missing run id).
    pub fn from_event(event: &str, payload: &Value) -> Option<Self> {
        let run_id = payload.get("runId")?.as_str().filter(|id| !id.is_empty())?.to_string();
        match event {
            EVENT_AGENT => {
                let stream = payload.get("stream").and_then(Value::as_str).unwrap_or_default();
                let data = payload.get("data");
                let text = data
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                let phase = match data.and_then(|d| d.get("phase")).and_then(Value::as_str) {
                    Some("start") => RunPhase::Start,
                    Some("end") => RunPhase::End,
                    _ if stream == "assistant" => RunPhase::Delta,
                    _ => return None,
                };
                Some(RunEvent { run_id, phase, text })
            }
            EVENT_CHAT => {
                let phase = match payload.get("state").and_then(Value::as_str)? {
                    "final" => RunPhase::Final,
                    "error" => RunPhase::Error(
                        payload
                            .get("errorMessage")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string(),
                    ),
                    _ => return None,
                };
                let text = payload
                    .pointer("/message/content/0/text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
                Some(RunEvent { run_id, phase, text })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connect_request_wire_shape() {
        let frame = AgentFrame::request("c1", METHOD_CONNECT, ConnectParams::operator(Some("tok"))).unwrap();
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["type"], "req");
        assert_eq!(json["method"], "connect");
        assert_eq!(json["params"]["minProtocol"], 3);
        assert_eq!(json["params"]["maxProtocol"], 3);
        assert_eq!(json["params"]["role"], "operator");
        assert_eq!(json["params"]["scopes"], json!(["operator.read", "operator.write"]));
        assert_eq!(json["params"]["auth"], json!({ "token": "tok" }));

        let anonymous = serde_json::to_value(ConnectParams::operator(Some(""))).unwrap();
        assert!(anonymous.get("auth").is_none());
    }

    #[test]
    fn response_run_id_and_errors() {
        let frame: AgentFrame =
            serde_json::from_str(r#"{"type":"res","id":"1","ok":true,"payload":{"runId":"run-9"}}"#).unwrap();
        let AgentFrame::Response(response) = frame else {
            panic!("not a response");
        };
        assert_eq!(response.run_id(), Some("run-9"));

        let rejected: AgentResponse =
            serde_json::from_str(r#"{"id":"2","ok":false,"error":{"code":"bad","message":"nope"}}"#).unwrap();
        assert_eq!(rejected.error_message(), "nope");
    }

    #[test]
    fn agent_events_map_to_phases() {
        let delta = RunEvent::from_event(
            EVENT_AGENT,
            &json!({ "runId": "r1", "stream": "assistant", "data": { "text": "Hel" } }),
        )
        .unwrap();
        assert_eq!(delta.phase, RunPhase::Delta);
        assert_eq!(delta.text.as_deref(), Some("Hel"));

        let end = RunEvent::from_event(
            EVENT_AGENT,
            &json!({ "runId": "r1", "stream": "lifecycle", "data": { "phase": "end" } }),
        )
        .unwrap();
        assert_eq!(end.phase, RunPhase::End);
        assert!(end.text.is_none());

        let tool = RunEvent::from_event(EVENT_AGENT, &json!({ "runId": "r1", "stream": "tool", "data": {} }));
        assert!(tool.is_none());
        assert!(RunEvent::from_event(EVENT_AGENT, &json!({ "stream": "assistant" })).is_none());
    }

    #[test]
    fn chat_events_map_to_terminal_phases() {
        let done = RunEvent::from_event(
            EVENT_CHAT,
            &json!({ "runId": "r1", "state": "final", "message": { "content": [{ "type": "text", "text": "Done" }] } }),
        )
        .unwrap();
        assert_eq!(done.phase, RunPhase::Final);
        assert_eq!(done.text.as_deref(), Some("Done"));

        let failed =
            RunEvent::from_event(EVENT_CHAT, &json!({ "runId": "r1", "state": "error", "errorMessage": "boom" }))
                .unwrap();
        assert_eq!(failed.phase, RunPhase::Error("boom".to_string()));
        assert!(failed.phase.is_terminal());

        assert!(RunEvent::from_event(EVENT_CHAT, &json!({ "runId": "r1", "state": "delta" })).is_none());
    }
}
