use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unknown frame type: {0}")]
    UnknownFrame(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
