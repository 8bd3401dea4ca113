//! One connection to the agent gateway.
//!
//! The gateway opens with a `connect.challenge` event; the client answers
//! with a `connect` request and is usable once that request succeeds.
//! Everything the bridge needs to react to is reported on a single ordered
//! event channel, so a run's acknowledgement is always seen before its
//! streaming events.

use parking_lot::Mutex;
use relay_client::transport::{self, TransportEvent, TransportHandle};
use relay_client::{CorrelationError, PendingRequest, PendingResponse, ReplyContext, RequestCorrelator};
use relay_config::AgentConfig;
use relay_observability::logging::connection_span;
use relay_observability::metrics::ConnectionMetrics;
use relay_protocol::now_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

use super::protocol::{
    AgentFrame, AgentResponse, ChatSendParams, ConnectParams, RunEvent, EVENT_CHALLENGE, METHOD_CHAT_SEND,
    METHOD_CONNECT,
};
use crate::error::AgentError;

#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    pub url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&AgentConfig> for AgentClientConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            url: config.url.clone(),
            token: config.token.clone(),
            connect_timeout: config.auth_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport open, waiting for the challenge or the connect reply
    Handshaking,
    Authenticated,
    Rejected,
    Closed,
}

/// What the agent connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Authenticated { generation: u64 },
    AuthenticationFailed { generation: u64, reason: String },
    /// A `chat.send` was acknowledged with its run id.
    RunAccepted {
        request_id: String,
        run_id: String,
        context: Option<ReplyContext>,
    },
    Run(RunEvent),
    Disconnected { generation: u64, reason: Option<String> },
}

/// Acknowledgement of one `chat.send`.
#[derive(Debug)]
pub struct ChatAck {
    pending: PendingResponse<AgentResponse>,
}

impl ChatAck {
    pub fn request_id(&self) -> &str {
        self.pending.request_id()
    }

    /// Waits for the acknowledgement and returns the run id.
    pub async fn run_id(self) -> Result<String, AgentError> {
        let response = self.pending.wait().await?;
        if !response.ok {
            return Err(AgentError::Rejected {
                method: METHOD_CHAT_SEND.to_string(),
                reason: response.error_message(),
            });
        }
        response
            .run_id()
            .map(str::to_string)
            .ok_or_else(|| AgentError::Rejected {
                method: METHOD_CHAT_SEND.to_string(),
                reason: "acknowledgement without runId".to_string(),
            })
    }
}

struct AgentShared {
    config: AgentClientConfig,
    generation: u64,
    transport: TransportHandle,
    correlator: RequestCorrelator<AgentResponse>,
    state: watch::Sender<LinkState>,
    events: mpsc::UnboundedSender<AgentEvent>,
    last_ping: AtomicI64,
    /// Set once by `reject`; survives the `Closed` that follows.
    rejection: Mutex<Option<String>>,
}

/// Handle to one agent gateway connection. A dropped connection is not
/// reopened; the owner creates a new client.
#[derive(Clone)]
pub struct AgentClient {
    shared: Arc<AgentShared>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("url", &self.shared.config.url)
            .field("generation", &self.shared.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl AgentClient {
    /// Opens the transport and starts the handshake.
    pub async fn connect(
        config: AgentClientConfig,
        generation: u64,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<Self, AgentError> {
        let (transport, inbound) = transport::connect(&config.url, config.connect_timeout).await?;
        info!(url = %config.url, generation, "Connected to agent gateway");

        let (state, _) = watch::channel(LinkState::Handshaking);
        let shared = Arc::new(AgentShared {
            config,
            generation,
            transport,
            correlator: RequestCorrelator::new(),
            state,
            events,
            last_ping: AtomicI64::new(0),
            rejection: Mutex::new(None),
        });
        let span = connection_span("agent-gateway", &shared.config.url);
        tokio::spawn(Arc::clone(&shared).run(inbound).instrument(span));
        Ok(Self { shared })
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    /// Waits until the handshake has finished, one way or the other.
    pub async fn wait_authenticated(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut state = self.shared.state.subscribe();
        let settled = tokio::time::timeout(timeout, state.wait_for(|s| *s != LinkState::Handshaking))
            .await
            .map_err(|_| AgentError::Timeout)?
            .map(|s| *s)
            .map_err(|_| AgentError::NotConnected)?;
        if let Some(reason) = self.shared.rejection.lock().clone() {
            return Err(AgentError::Rejected {
                method: METHOD_CONNECT.to_string(),
                reason,
            });
        }
        match settled {
            LinkState::Authenticated => Ok(()),
            _ => Err(AgentError::NotConnected),
        }
    }

    /// Sends a message to the agent. The frame is written before this
    /// returns; the returned [`ChatAck`] resolves to the run id.
    ///
    /// `request_id` doubles as the provisional context key; the
    /// acknowledgement is also reported as [`AgentEvent::RunAccepted`].
    pub fn chat_send(
        &self,
        request_id: &str,
        params: ChatSendParams,
        context: ReplyContext,
    ) -> Result<ChatAck, AgentError> {
        if !self.is_authenticated() {
            return Err(AgentError::NotAuthenticated);
        }
        let meta = PendingRequest::new(METHOD_CHAT_SEND).with_context(context);
        let pending = self.shared.send_request(request_id, METHOD_CHAT_SEND, params, meta)?;
        Ok(ChatAck { pending })
    }

    /// WebSocket-level keepalive, only once authenticated.
    pub fn ping(&self) -> bool {
        if !self.is_authenticated() {
            return false;
        }
        match self.shared.transport.send_ping() {
            Ok(()) => {
                self.shared.last_ping.store(now_millis(), Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("Agent ping failed: {}", e);
                false
            }
        }
    }

    pub fn last_ping(&self) -> i64 {
        self.shared.last_ping.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    pub fn close(&self) {
        self.shared.transport.close();
    }
}

impl AgentShared {
    fn emit(&self, event: AgentEvent) {
        // The owner may already be gone during shutdown.
        let _ = self.events.send(event);
    }

    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Text(text) => self.handle_frame(&text),
                TransportEvent::Closed(reason) => {
                    self.on_closed(reason);
                    return;
                }
            }
        }
        self.on_closed(None);
    }

    fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame: AgentFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed agent frame: {}", e);
                return;
            }
        };

        match frame {
            AgentFrame::Event { event, .. } if event == EVENT_CHALLENGE => self.start_handshake(),
            AgentFrame::Event { event, payload } => match RunEvent::from_event(&event, &payload) {
                Some(run) => self.emit(AgentEvent::Run(run)),
                None => trace!(event = %event, "Ignoring agent event"),
            },
            AgentFrame::Response(response) => self.handle_response(response),
            AgentFrame::Request { method, .. } => debug!(method = %method, "Ignoring request from agent gateway"),
        }
    }

    fn handle_response(&self, response: AgentResponse) {
        let request_id = response.id.clone();
        let ok = response.ok;
        let run_id = response.run_id().map(str::to_string);

        let Some(meta) = self.correlator.complete(&request_id, response) else {
            return;
        };
        if meta.method != METHOD_CHAT_SEND || !ok {
            return;
        }
        match run_id {
            Some(run_id) => self.emit(AgentEvent::RunAccepted {
                request_id,
                run_id,
                context: meta.context,
            }),
            None => warn!(request_id = %request_id, "chat.send acknowledged without runId"),
        }
    }

    /// Answers the challenge off the read loop; the reply arrives through it.
    fn start_handshake(self: &Arc<Self>) {
        if self.state() != LinkState::Handshaking {
            debug!("Ignoring repeated connect challenge");
            return;
        }
        info!("Received connect challenge");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let params = ConnectParams::operator(shared.config.token.as_deref());
            let request_id = Uuid::new_v4().to_string();
            let outcome = match shared.send_request(
                &request_id,
                METHOD_CONNECT,
                params,
                PendingRequest::new(METHOD_CONNECT),
            ) {
                Ok(pending) => pending.wait().await.map_err(AgentError::from),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) if response.ok => {
                    shared.state.send_replace(LinkState::Authenticated);
                    info!(generation = shared.generation, "Authenticated with agent gateway");
                    shared.emit(AgentEvent::Authenticated {
                        generation: shared.generation,
                    });
                }
                Ok(response) => shared.reject(response.error_message()),
                Err(_) if shared.state() == LinkState::Closed => {
                    debug!("Agent connection closed during handshake");
                }
                Err(e) => shared.reject(e.to_string()),
            }
        });
    }

    fn reject(&self, reason: String) {
        error!(reason = %reason, "Agent gateway authentication failed");
        ConnectionMetrics::record_auth_failure("agent");
        self.rejection.lock().get_or_insert_with(|| reason.clone());
        self.state.send_replace(LinkState::Rejected);
        self.emit(AgentEvent::AuthenticationFailed {
            generation: self.generation,
            reason,
        });
        self.transport.close();
    }

    fn send_request(
        &self,
        request_id: &str,
        method: &str,
        params: impl Serialize,
        meta: PendingRequest,
    ) -> Result<PendingResponse<AgentResponse>, AgentError> {
        let frame = AgentFrame::request(request_id, method, params)?;
        let pending = self
            .correlator
            .register(request_id, meta, self.config.request_timeout);

        if let Err(e) = self.transport.send_json(&frame) {
            self.correlator.fail(request_id, CorrelationError::SendFailed(e.to_string()));
        } else {
            debug!(request_id = %request_id, method = %method, "Agent request sent");
        }
        Ok(pending)
    }

    fn on_closed(&self, reason: Option<String>) {
        if self.state.send_replace(LinkState::Closed) == LinkState::Closed {
            return;
        }
        let cancelled = self.correlator.cancel_all("Agent connection closed");
        warn!(reason = ?reason, cancelled, generation = self.generation, "Disconnected from agent gateway");
        self.emit(AgentEvent::Disconnected {
            generation: self.generation,
            reason,
        });
    }
}
