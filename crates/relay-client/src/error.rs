use relay_protocol::ProtocolError;

use crate::correlator::CorrelationError;

/// Client-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected to gateway")]
    NotConnected,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Authentication failed ({code}): {msg}")]
    AuthenticationFailed { code: i32, msg: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Client stopped")]
    Stopped,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<CorrelationError> for ClientError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout => ClientError::Timeout,
            CorrelationError::ConnectionClosed(reason) => ClientError::ConnectionClosed(reason),
            CorrelationError::SendFailed(reason) => ClientError::SendFailed(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
