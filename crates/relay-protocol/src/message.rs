//! Frames exchanged between a robot client and the IM gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::OutputMessageData;

/// Method name reserved for keep-alive requests.
pub const HEARTBEAT_METHOD: &str = "heartbeat";

/// Result code for success in every frame that carries a code.
pub const CODE_SUCCESS: i32 = 0;

/// Authentication handshake, in both directions.
///
/// The client sends `robotId` + `secret`; the gateway replies with `code` + `msg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "connect", rename_all = "camelCase")]
pub struct ConnectMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ConnectMessage {
    /// Credential frame sent by a client.
    pub fn request(robot_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            robot_id: Some(robot_id.into()),
            secret: Some(secret.into()),
            code: None,
            msg: None,
        }
    }

    pub fn success() -> Self {
        Self::reply(CODE_SUCCESS, "success")
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self::reply(code, msg)
    }

    fn reply(code: i32, msg: impl Into<String>) -> Self {
        Self {
            robot_id: None,
            secret: None,
            code: Some(code),
            msg: Some(msg.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(CODE_SUCCESS)
    }

    /// A reply carries a code; a credential frame does not.
    pub fn is_reply(&self) -> bool {
        self.code.is_some()
    }
}

/// Client-originated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub request_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

impl RequestMessage {
    /// Builds a request with a fresh v4 request id.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn heartbeat(timestamp_millis: i64) -> Self {
        Self::new(
            HEARTBEAT_METHOD,
            vec![serde_json::json!({ "type": "heartbeat", "timestamp": timestamp_millis })],
        )
    }
}

/// Gateway reply to a [`RequestMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub request_id: Option<String>,
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ResponseMessage {
    pub fn success(request_id: Option<String>, result: Option<Value>) -> Self {
        Self {
            request_id,
            code: CODE_SUCCESS,
            msg: "success".to_string(),
            result,
        }
    }

    pub fn error(request_id: Option<String>, code: i32, msg: impl Into<String>) -> Self {
        Self {
            request_id,
            code,
            msg: msg.into(),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Unsolicited gateway-to-client delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    /// An IM message addressed to the robot.
    Message { data: OutputMessageData },
    /// A named gateway event with free-form extra data.
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra: Option<Value>,
    },
}

impl PushMessage {
    pub fn message(data: OutputMessageData) -> Self {
        PushMessage::Message { data }
    }

    pub fn event(event: impl Into<String>, extra: Option<Value>) -> Self {
        PushMessage::Event {
            event: event.into(),
            extra,
        }
    }
}
