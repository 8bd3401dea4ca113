//! Handle to one accepted WebSocket connection

use serde::Serialize;
use std::borrow::Cow;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// Sending side of a connection; frames are written by the connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: impl Into<String>,
        peer: SocketAddr,
        tx: mpsc::UnboundedSender<Message>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            peer,
            tx,
            closed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send_text(&self, text: String) -> Result<(), SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::ConnectionClosed(self.id.clone()));
        }
        self.tx
            .send(Message::Text(text))
            .map_err(|_| SessionError::ConnectionClosed(self.id.clone()))
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SessionError> {
        let text = serde_json::to_string(value)
            .map_err(|e| SessionError::ConnectionClosed(format!("{}: {}", self.id, e)))?;
        self.send_text(text)
    }

    pub(crate) fn send_raw(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    /// Queues a close frame and stops the connection.
    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })));
        self.closed.cancel();
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}
