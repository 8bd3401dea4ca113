//! Outbound WebSocket transport.
//!
//! Splits the socket into a writer task fed by an unbounded channel and a
//! reader task that forwards text frames. The reader reports closure exactly
//! once, whichever side ends the connection.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::ClientError;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    /// The connection is gone; carries a reason when one is known.
    Closed(Option<String>),
}

/// Sending half of an open connection.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
}

impl TransportHandle {
    pub fn send_text(&self, text: String) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), ClientError> {
        self.send_text(serde_json::to_string(value)?)
    }

    pub fn send_ping(&self) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .send(Message::Ping(Vec::new()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Sends a close frame and tears both tasks down.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Opens a connection to `url`.
pub async fn connect(
    url: &str,
    timeout: Duration,
) -> Result<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>), ClientError> {
    let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| ClientError::Timeout)??;
    debug!(url = %url, "WebSocket connected");

    let (mut sink, mut stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let writer_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            // Queued frames (including a final close) go out before shutdown is observed.
            let message = tokio::select! {
                biased;
                message = outbound_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = writer_shutdown.cancelled() => break,
            };
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!("Failed to write frame: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
        writer_shutdown.cancel();
    });

    let reader_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = reader_shutdown.cancelled() => break Some("closed locally".to_string()),
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Frame received");
                        if event_tx.send(TransportEvent::Text(text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by peer".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket read error: {}", e);
                        break Some(e.to_string());
                    }
                    None => break Some("stream ended".to_string()),
                }
            }
        };
        reader_shutdown.cancel();
        let _ = event_tx.send(TransportEvent::Closed(reason));
    });

    Ok((
        TransportHandle {
            outbound: outbound_tx,
            shutdown,
        },
        event_rx,
    ))
}
