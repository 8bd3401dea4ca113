//! Gateway server
//!
//! Accepts robot connections and runs one task per connection. Frames from a
//! connection are handled in arrival order; replies and pushes go through the
//! connection's writer task.

use futures_util::{SinkExt, StreamExt};
use relay_config::GatewayConfig;
use relay_observability::logging::session_span;
use relay_protocol::{ConnectMessage, PushMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backend::Authenticator;
use crate::connection::ConnectionHandle;
use crate::dispatcher::{Dispatcher, HandlerTable};
use crate::error::{GatewayError, Result};
use crate::session::SessionRegistry;

/// The robot gateway server
#[derive(Debug, Clone)]
pub struct GatewayServer {
    config: GatewayConfig,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self::with_handlers(config, authenticator, HandlerTable::robot_api())
    }

    pub fn with_handlers(
        config: GatewayConfig,
        authenticator: Arc<dyn Authenticator>,
        handlers: HandlerTable,
    ) -> Self {
        let registry = SessionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), authenticator, handlers);
        Self {
            config,
            registry,
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Binds the configured address and serves until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Gateway listening on ws://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            debug!("New connection from {}", peer);

            if self.registry.session_count() >= self.config.max_connections {
                warn!("Connection limit reached, rejecting {}", peer);
                tokio::spawn(async move {
                    if let Err(e) = reject_connection(stream, "Server at capacity").await {
                        debug!("Failed to reject {}: {}", peer, e);
                    }
                });
                continue;
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer).await {
                    error!("Connection error for {}: {}", peer, e);
                }
            });
        }

        self.registry.close_all();
        info!("Gateway stopped");
        Ok(())
    }

    /// Stops accepting and closes every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.close_all();
    }

    /// Pushes a message or event to the session of `robot_id`.
    pub fn push_to_robot(&self, robot_id: &str, push: &PushMessage) -> Result<()> {
        self.registry.send_to_identity(robot_id, push)?;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut sink, mut source) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let closed = CancellationToken::new();
        let connection = ConnectionHandle::new(Uuid::new_v4().to_string(), peer, tx, closed.clone());
        let session_id = self.registry.add_session(connection.clone());

        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Failed to write frame: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let dispatcher = self.dispatcher.clone();
        let reader_session = session_id.clone();
        let reader_connection = connection.clone();
        let reader_closed = closed.clone();
        async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = source.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = dispatcher.handle_text(&reader_session, &text).await;
                        if let Some(reply) = outcome.reply {
                            let _ = reader_connection.send_text(reply);
                        }
                        if outcome.close {
                            reader_connection.close(CloseCode::Policy, "Not authenticated");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => reader_connection.send_raw(Message::Pong(data)),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
        .instrument(session_span(&session_id, None))
        .await;

        self.registry.remove(&session_id);
        closed.cancel();
        let _ = writer.await;
        info!(session_id = %session_id, peer = %peer, "Connection {} disconnected", connection.id());
        Ok(())
    }
}

async fn reject_connection(stream: TcpStream, reason: &str) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut sender, _) = ws_stream.split();
    let json = serde_json::to_string(&ConnectMessage::error(503, reason))?;
    sender.send(Message::Text(json)).await?;
    sender.close().await.map_err(GatewayError::from)?;
    Ok(())
}
