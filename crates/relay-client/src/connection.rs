//! Lifecycle of a robot's connection to the IM gateway.
//!
//! One [`ConnectionManager`] owns one outbound connection. It connects,
//! authenticates, heartbeats while authenticated, and reconnects after a
//! drop as long as the last credentials have not been invalidated. An
//! authentication failure is terminal for the credential set: credentials are
//! discarded and the manager stops.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use relay_config::ImConfig;
use relay_observability::logging::connection_span;
use relay_observability::metrics::ConnectionMetrics;
use relay_protocol::{now_millis, ConnectMessage, InboundFrame, PushMessage, RequestMessage, ResponseMessage};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::correlator::{PendingRequest, RequestCorrelator};
use crate::error::{ClientError, Result};
use crate::transport::{self, TransportEvent, TransportHandle};

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway url (e.g., "ws://localhost:8884/robot/gateway")
    pub gateway_url: String,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may wait for its reply
    pub heartbeat_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:8884/robot/gateway".to_string(),
            reconnect_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(270),
            heartbeat_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ImConfig> for ClientConfig {
    fn from(config: &ImConfig) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            reconnect_interval: config.reconnect_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport open, not yet authenticated
    Connected,
    Authenticated,
    ReconnectScheduled,
}

/// Callbacks for events on the IM side.
///
/// Pushes are delivered in arrival order on a dedicated task, so a slow
/// `on_message` never delays response correlation.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    async fn on_message(&self, _message: PushMessage) {}

    /// `true` once authenticated, `false` when an authenticated connection is lost.
    async fn on_connection_changed(&self, _connected: bool) {}

    async fn on_error(&self, _error: String) {}
}

/// Handler that ignores everything.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}

#[derive(Clone, PartialEq, Eq)]
struct Credentials {
    robot_id: String,
    secret: String,
}

struct Link {
    generation: u64,
    transport: TransportHandle,
}

struct Shared {
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    state: watch::Sender<ConnectionState>,
    running: AtomicBool,
    credentials: Mutex<Option<Credentials>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    correlator: RequestCorrelator<ResponseMessage>,
    auth_waiter: Mutex<Option<oneshot::Sender<ConnectMessage>>>,
    /// Held for a whole sign-in so only one connect frame is ever in flight.
    auth_gate: tokio::sync::Mutex<()>,
    reconnect_pending: AtomicBool,
    heartbeat: Mutex<Option<CancellationToken>>,
    /// Cancelled by `stop()`; aborts a scheduled reconnect.
    lifecycle: Mutex<CancellationToken>,
    last_heartbeat: AtomicI64,
}

/// Owns the robot's connection to the IM gateway.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.gateway_url)
            .field("state", &self.state())
            .field("pending", &self.shared.correlator.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                state,
                running: AtomicBool::new(false),
                credentials: Mutex::new(None),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                correlator: RequestCorrelator::new(),
                auth_waiter: Mutex::new(None),
                auth_gate: tokio::sync::Mutex::new(()),
                reconnect_pending: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
                lifecycle: Mutex::new(CancellationToken::new()),
                last_heartbeat: AtomicI64::new(0),
            }),
        }
    }

    /// Begins connecting in the background. Calling it again is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shared.lifecycle.lock() = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.connect().await {
                debug!("Initial connect failed: {}", e);
            }
        });
    }

    /// Connects if needed and authenticates with the given credentials.
    ///
    /// On success the credentials are kept for silent re-authentication after
    /// reconnects. On failure they are discarded and the manager stops.
    pub async fn connect_and_authenticate(
        &self,
        robot_id: &str,
        secret: &str,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_authenticated() && self.robot_id().as_deref() == Some(robot_id) {
            return Ok(());
        }

        let credentials = Credentials {
            robot_id: robot_id.to_string(),
            secret: secret.to_string(),
        };
        let shared = Arc::clone(&self.shared);

        let attempt = async {
            if !shared.running.swap(true, Ordering::SeqCst) {
                *shared.lifecycle.lock() = CancellationToken::new();
                Arc::clone(&shared).connect().await?;
            } else {
                shared.wait_for_transport().await?;
            }
            shared.sign_in(&credentials, timeout, true).await
        };

        let outcome = match tokio::time::timeout(timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Timeout),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                shared.on_authentication_failed(&e).await;
                Err(e)
            }
        }
    }

    /// Stops for good: clears credentials, closes the transport and fails
    /// pending requests. No reconnect follows.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.running.store(false, Ordering::SeqCst);
        shared.credentials.lock().take();
        shared.lifecycle.lock().cancel();
        shared.stop_heartbeat();

        match shared.current_transport() {
            Some(transport) => {
                let mut state = shared.state.subscribe();
                transport.close();
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    state.wait_for(|s| *s == ConnectionState::Disconnected),
                )
                .await;
            }
            None => shared.set_state(ConnectionState::Disconnected),
        }

        shared.correlator.cancel_all("Client stopped");
        info!("Connection manager stopped");
    }

    /// Sends a request and waits for its correlated response.
    pub async fn send_request(&self, method: &str, params: Vec<Value>) -> Result<ResponseMessage> {
        if self.state() != ConnectionState::Authenticated {
            return Err(ClientError::NotAuthenticated);
        }
        self.shared
            .request(RequestMessage::new(method, params), self.shared.config.request_timeout)
            .await
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether reconnects are currently permitted.
    pub fn has_credentials(&self) -> bool {
        self.shared.credentials.lock().is_some()
    }

    pub fn robot_id(&self) -> Option<String> {
        self.shared
            .credentials
            .lock()
            .as_ref()
            .map(|c| c.robot_id.clone())
    }

    /// Milliseconds timestamp of the last acknowledged heartbeat.
    pub fn last_heartbeat(&self) -> i64 {
        self.shared.last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Connection state changed");
        }
    }

    fn current_transport(&self) -> Option<TransportHandle> {
        self.link.lock().as_ref().map(|link| link.transport.clone())
    }

    async fn wait_for_transport(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Authenticated))
            .await
            .map_err(|_| ClientError::Stopped)?;
        Ok(())
    }

    /// Opens a new transport and starts its event loop.
    fn connect(self: Arc<Self>) -> BoxFuture<'static, Result<()>> {
        async move {
            self.set_state(ConnectionState::Connecting);
            let url = self.config.gateway_url.clone();

            let (transport, events) = match transport::connect(&url, self.config.connect_timeout).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(url = %url, "Failed to connect to gateway: {}", e);
                    self.handler.on_error(format!("Failed to connect: {}", e)).await;
                    self.set_state(ConnectionState::Disconnected);
                    self.schedule_reconnect();
                    return Err(e);
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                transport.close();
                self.set_state(ConnectionState::Disconnected);
                return Err(ClientError::Stopped);
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *self.link.lock() = Some(Link {
                generation,
                transport,
            });
            self.set_state(ConnectionState::Connected);
            info!(url = %url, generation, "Connected to gateway");

            let (push_tx, push_rx) = mpsc::unbounded_channel();
            let span = connection_span("im-gateway", &url);
            tokio::spawn(dispatch_pushes(Arc::clone(&self.handler), push_rx).instrument(span.clone()));
            tokio::spawn(
                Arc::clone(&self)
                    .run_event_loop(generation, events, push_tx)
                    .instrument(span),
            );

            self.on_open(generation);
            Ok(())
        }
        .boxed()
    }

    async fn run_event_loop(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        push_tx: mpsc::UnboundedSender<PushMessage>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Text(text) => self.handle_frame(&text, &push_tx).await,
                TransportEvent::Closed(reason) => {
                    self.on_closed(generation, reason).await;
                    break;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, push_tx: &mpsc::UnboundedSender<PushMessage>) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::ConnectReply(reply)) => match self.auth_waiter.lock().take() {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                None => debug!(code = ?reply.code, "Unsolicited connect reply"),
            },
            Ok(InboundFrame::Response(response)) => match response.request_id.clone() {
                Some(request_id) => {
                    self.correlator.complete(&request_id, response);
                }
                None => warn!(code = response.code, msg = %response.msg, "Response without requestId"),
            },
            Ok(InboundFrame::Push(push)) => {
                let _ = push_tx.send(push);
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.handler.on_error(format!("Malformed frame: {}", e)).await;
            }
        }
    }

    /// Silent re-authentication after a reconnect.
    fn on_open(self: &Arc<Self>, generation: u64) {
        let Some(credentials) = self.credentials.lock().clone() else {
            return;
        };
        if self.state() == ConnectionState::Authenticated {
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            info!(robot_id = %credentials.robot_id, "Re-authenticating");
            match shared.sign_in(&credentials, shared.config.connect_timeout, false).await {
                Ok(()) => {}
                // Lost the connection mid-handshake; the close path decides what's next.
                Err(ClientError::ConnectionClosed(_)) | Err(ClientError::NotConnected) => {
                    debug!(generation, "Connection lost during re-authentication");
                }
                Err(e) => shared.on_authentication_failed(&e).await,
            }
        });
    }

    /// Authenticates unless these credentials already hold the connection.
    ///
    /// Explicit and silent attempts queue on `auth_gate`; the gate is
    /// released only after the state reads `Authenticated`, so a queued
    /// attempt never sends a second connect frame on an accepted connection.
    async fn sign_in(self: &Arc<Self>, credentials: &Credentials, timeout: Duration, retain: bool) -> Result<()> {
        let _gate = self.auth_gate.lock().await;
        let current = self.credentials.lock().as_ref() == Some(credentials);
        let authenticated = self.state() == ConnectionState::Authenticated;
        if authenticated && (current || !retain) {
            debug!(robot_id = %credentials.robot_id, "Already authenticated");
            return Ok(());
        }
        if !retain && !current {
            // Replaced or cleared while this silent attempt was queued.
            debug!(robot_id = %credentials.robot_id, "Dropping stale re-authentication");
            return Ok(());
        }

        self.authenticate(credentials, timeout).await?;
        if retain {
            *self.credentials.lock() = Some(credentials.clone());
        }
        self.on_authenticated().await;
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials, timeout: Duration) -> Result<()> {
        let (waiter, reply) = oneshot::channel();
        *self.auth_waiter.lock() = Some(waiter);

        let transport = self.current_transport().ok_or(ClientError::NotConnected)?;
        transport.send_json(&ConnectMessage::request(&credentials.robot_id, &credentials.secret))?;

        let reply = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(ClientError::ConnectionClosed(
                    "connection closed during authentication".to_string(),
                ))
            }
            Err(_) => {
                self.auth_waiter.lock().take();
                return Err(ClientError::Timeout);
            }
        };

        if reply.is_success() {
            Ok(())
        } else {
            Err(ClientError::AuthenticationFailed {
                code: reply.code.unwrap_or(-1),
                msg: reply.msg.unwrap_or_default(),
            })
        }
    }

    async fn on_authenticated(self: &Arc<Self>) {
        self.set_state(ConnectionState::Authenticated);
        self.last_heartbeat.store(now_millis(), Ordering::SeqCst);
        self.start_heartbeat();
        info!("Authenticated with gateway");
        self.handler.on_connection_changed(true).await;
    }

    async fn on_authentication_failed(&self, error: &ClientError) {
        error!("Authentication failed: {}", error);
        ConnectionMetrics::record_auth_failure("im");

        // Credentials go first so the close below cannot schedule a reconnect.
        self.credentials.lock().take();
        self.running.store(false, Ordering::SeqCst);
        self.lifecycle.lock().cancel();
        self.stop_heartbeat();

        match self.current_transport() {
            Some(transport) => transport.close(),
            None => self.set_state(ConnectionState::Disconnected),
        }

        self.handler.on_connection_changed(false).await;
        self.handler.on_error(error.to_string()).await;
    }

    async fn on_closed(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut link = self.link.lock();
            if link.as_ref().map(|current| current.generation) != Some(generation) {
                debug!(generation, "Ignoring close of a stale connection");
                return;
            }
            *link = None;
        }

        let was_authenticated = self.state() == ConnectionState::Authenticated;
        self.stop_heartbeat();
        self.auth_waiter.lock().take();
        let cancelled = self.correlator.cancel_all("Connection closed");
        info!(reason = ?reason, cancelled, "Disconnected from gateway");

        self.set_state(ConnectionState::Disconnected);
        if was_authenticated {
            self.handler.on_connection_changed(false).await;
        }
        self.schedule_reconnect();
    }

    /// Schedules a single reconnect when running with valid credentials.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) || self.credentials.lock().is_none() {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(ConnectionState::ReconnectScheduled);
        let delay = self.config.reconnect_interval;
        let lifecycle = self.lifecycle.lock().clone();
        let shared = Arc::clone(self);
        info!("Reconnecting in {:?}", delay);

        tokio::spawn(async move {
            tokio::select! {
                _ = lifecycle.cancelled() => {
                    shared.reconnect_pending.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            shared.reconnect_pending.store(false, Ordering::SeqCst);

            if shared.running.load(Ordering::SeqCst) && shared.credentials.lock().is_some() {
                ConnectionMetrics::record_reconnect("im");
                if let Err(e) = Arc::clone(&shared).connect().await {
                    debug!("Reconnect attempt failed: {}", e);
                }
            }
        });
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.heartbeat.lock().replace(token.clone()) {
            previous.cancel();
        }

        let shared = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if shared.state() != ConnectionState::Authenticated {
                            continue;
                        }
                        if let Err(e) = shared.send_heartbeat().await {
                            warn!("Heartbeat failed, dropping connection: {}", e);
                            if let Some(transport) = shared.current_transport() {
                                transport.close();
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    fn stop_heartbeat(&self) {
        if let Some(token) = self.heartbeat.lock().take() {
            token.cancel();
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let response = self
            .request(RequestMessage::heartbeat(now_millis()), self.config.heartbeat_timeout)
            .await?;
        if !response.is_success() {
            // Answered, so the link itself is alive.
            warn!(code = response.code, msg = %response.msg, "Heartbeat rejected by gateway");
            return Ok(());
        }
        self.last_heartbeat.store(now_millis(), Ordering::SeqCst);
        debug!(code = response.code, "Heartbeat acknowledged");
        Ok(())
    }

    async fn request(&self, request: RequestMessage, timeout: Duration) -> Result<ResponseMessage> {
        let transport = self.current_transport().ok_or(ClientError::NotConnected)?;
        let pending = self.correlator.register(
            request.request_id.clone(),
            PendingRequest::new(&request.method),
            timeout,
        );

        if let Err(e) = transport.send_json(&request) {
            self.correlator.fail(
                &request.request_id,
                crate::correlator::CorrelationError::SendFailed(e.to_string()),
            );
        }

        Ok(pending.wait().await?)
    }
}

async fn dispatch_pushes(handler: Arc<dyn ClientHandler>, mut pushes: mpsc::UnboundedReceiver<PushMessage>) {
    while let Some(push) = pushes.recv().await {
        handler.on_message(push).await;
    }
}
