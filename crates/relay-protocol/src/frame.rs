//! Classification of raw text frames.

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::message::{ConnectMessage, PushMessage, RequestMessage, ResponseMessage};

/// A frame received by a robot client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to our connect frame.
    ConnectReply(ConnectMessage),
    Response(ResponseMessage),
    Push(PushMessage),
}

impl InboundFrame {
    /// Classifies in order: connect reply, then anything carrying a
    /// `requestId`, then push.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        if value.get("type").and_then(Value::as_str) == Some("connect") && value.get("code").is_some() {
            return Ok(InboundFrame::ConnectReply(serde_json::from_value(value)?));
        }

        if value.get("requestId").is_some() {
            return Ok(InboundFrame::Response(serde_json::from_value(value)?));
        }

        match value.get("type").and_then(Value::as_str) {
            Some("message") | Some("event") => Ok(InboundFrame::Push(serde_json::from_value(value)?)),
            Some(other) => Err(ProtocolError::UnknownFrame(other.to_string())),
            None => Err(ProtocolError::MissingField("type")),
        }
    }
}

/// A frame received by the gateway from a robot.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Connect(ConnectMessage),
    Request(RequestMessage),
    /// Parsed as JSON but missing `requestId` or `method`.
    MalformedRequest { request_id: Option<String> },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        if value.get("type").and_then(Value::as_str) == Some("connect") {
            return Ok(ServerFrame::Connect(serde_json::from_value(value)?));
        }

        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let has_method = value.get("method").and_then(Value::as_str).is_some();

        match request_id {
            Some(_) if has_method => match serde_json::from_value(value) {
                Ok(request) => Ok(ServerFrame::Request(request)),
                Err(_) => Ok(ServerFrame::MalformedRequest { request_id }),
            },
            _ => Ok(ServerFrame::MalformedRequest { request_id }),
        }
    }
}
