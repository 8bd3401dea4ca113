use relay_client::{ClientError, CorrelationError};

/// Errors from the agent gateway connection.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] ClientError),

    #[error("Not connected to agent gateway")]
    NotConnected,

    #[error("Not authenticated with agent gateway")]
    NotAuthenticated,

    #[error("Agent gateway rejected {method}: {reason}")]
    Rejected { method: String, reason: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CorrelationError> for AgentError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout => AgentError::Timeout,
            CorrelationError::ConnectionClosed(reason) | CorrelationError::SendFailed(reason) => {
                AgentError::ConnectionClosed(reason)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("IM gateway: {0}")]
    Im(#[from] ClientError),

    #[error("Agent gateway: {0}")]
    Agent(#[from] AgentError),

    #[error("Bridge already running")]
    AlreadyRunning,

    #[error("Bridge not running")]
    NotRunning,

    #[error("Agent gateway did not authenticate within {0:?}")]
    AuthTimeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
