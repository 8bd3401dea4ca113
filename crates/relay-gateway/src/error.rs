//! Gateway error types

/// Server-level errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Session registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already authenticated: {0}")]
    AlreadyAuthenticated(String),
    #[error("No session for robot: {0}")]
    IdentityNotFound(String),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

/// Failure reported by a robot backend call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend answered with an error code
    #[error("{message}")]
    Failed { code: i32, message: String },
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        BackendError::Failed {
            code,
            message: message.into(),
        }
    }

    /// Response code to report to the robot.
    pub fn code(&self) -> i32 {
        match self {
            BackendError::Failed { code, .. } => *code,
            BackendError::Unavailable(_) => 500,
        }
    }
}

/// Credential check rejection, carried back in the connect reply
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Authentication rejected ({code}): {msg}")]
pub struct AuthError {
    pub code: i32,
    pub msg: String,
}

impl AuthError {
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

/// Request dispatch errors, each mapped to a response code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Bad Request({0})")]
    Denied(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Robot service not found")]
    BackendMissing,
    #[error("Failed to execute: {0}")]
    Backend(BackendError),
    #[error("Failed to encode result: {0}")]
    Encode(String),
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::NotAuthenticated => 401,
            DispatchError::Denied(_) | DispatchError::InvalidArguments(_) => 400,
            DispatchError::MethodNotFound(_) => 404,
            DispatchError::BackendMissing | DispatchError::Encode(_) => 500,
            DispatchError::Backend(e) => e.code(),
        }
    }

    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::NotAuthenticated => "unauthenticated",
            DispatchError::Denied(_) => "denied",
            DispatchError::MethodNotFound(_) => "not_found",
            DispatchError::InvalidArguments(_) => "invalid_arguments",
            DispatchError::BackendMissing | DispatchError::Encode(_) => "internal",
            DispatchError::Backend(_) => "backend_error",
        }
    }
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        DispatchError::Backend(err)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
