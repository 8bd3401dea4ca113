//! Bridge orchestrator
//!
//! Owns both sides of the relay: the robot's connection to the IM gateway
//! and the operator connection to the agent gateway. IM pushes that pass
//! the filter chain are sent to the agent; agent run events are resolved to
//! the conversation that started the run and sent back to the IM side.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use relay_client::{ClientConfig, ClientHandler, RobotServiceClient};
use relay_config::Config;
use relay_observability::logging::run_span;
use relay_observability::metrics::{BridgeMetrics, ConnectionMetrics, ContextMetrics};
use relay_protocol::{OutputMessageData, PushMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::agent::protocol::ChatSendParams;
use crate::agent::{AgentClient, AgentClientConfig, AgentEvent, RunEvent, RunPhase};
use crate::context::{ContextSource, Resolution, StreamingContextTracker, TrackerStats};
use crate::converter::{MessageConverter, StreamState};
use crate::error::{AgentError, BridgeError, Result};
use crate::filter::FilterChain;

/// Point-in-time counters of a running bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub running: bool,
    pub im_connected: bool,
    pub agent_connected: bool,
    pub messages_received: u64,
    pub messages_filtered: u64,
    pub messages_forwarded: u64,
    pub replies_sent: u64,
    pub replies_failed: u64,
    pub events_unresolved: u64,
    pub agent_reconnects: u64,
    pub contexts: TrackerStats,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    filtered: AtomicU64,
    forwarded: AtomicU64,
    replies_sent: AtomicU64,
    replies_failed: AtomicU64,
    unresolved: AtomicU64,
    agent_reconnects: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct BridgeInner {
    config: Config,
    im: RobotServiceClient,
    tracker: StreamingContextTracker,
    converter: MessageConverter,
    filters: FilterChain,
    agent: RwLock<Option<AgentClient>>,
    agent_generation: AtomicU64,
    agent_events: Mutex<Option<mpsc::UnboundedSender<AgentEvent>>>,
    /// Set when the agent gateway refuses our credentials; stops reconnects.
    agent_rejected: AtomicBool,
    running: AtomicBool,
    reconnecting: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
    counters: Counters,
}

/// The IM ⇄ agent bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("running", &self.is_running())
            .field("im_connected", &self.is_im_connected())
            .field("agent_connected", &self.is_agent_connected())
            .finish()
    }
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BridgeInner>| {
            let handler = Arc::new(ImEvents { bridge: weak.clone() });
            BridgeInner {
                im: RobotServiceClient::new(ClientConfig::from(&config.im), handler),
                tracker: StreamingContextTracker::new(),
                converter: MessageConverter::new(),
                filters: FilterChain::new(config.whitelist.clone(), config.group.clone()),
                agent: RwLock::new(None),
                agent_generation: AtomicU64::new(0),
                agent_events: Mutex::new(None),
                agent_rejected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                lifecycle: Mutex::new(CancellationToken::new()),
                counters: Counters::default(),
                config,
            }
        });
        Self { inner }
    }

    /// Connects and authenticates the IM side, then the agent side.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }
        let lifecycle = CancellationToken::new();
        *inner.lifecycle.lock() = lifecycle.clone();
        inner.agent_rejected.store(false, Ordering::SeqCst);

        let im = &inner.config.im;
        info!(url = %im.gateway_url, robot_id = %im.robot_id, "Connecting to IM gateway");
        if let Err(e) = inner.im.connect(&im.robot_id, &im.robot_secret, im.connect_timeout()).await {
            error!("Failed to connect to IM gateway: {}", e);
            self.stop().await;
            return Err(e.into());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *inner.agent_events.lock() = Some(events_tx);
        tokio::spawn(Arc::clone(inner).run_agent_events(events_rx, lifecycle.clone()));

        info!(url = %inner.config.agent.url, "Connecting to agent gateway");
        if let Err(e) = inner.connect_agent().await {
            error!("Failed to connect to agent gateway: {}", e);
            self.stop().await;
            return Err(e);
        }

        tokio::spawn(Arc::clone(inner).housekeeping(lifecycle));
        info!("Bridge started");
        Ok(())
    }

    /// Closes both sides. No reconnection happens afterwards.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.lifecycle.lock().cancel();
        inner.agent_events.lock().take();
        let agent = inner.agent.write().take();
        if let Some(agent) = agent {
            agent.close();
        }
        inner.im.close().await;
        info!("Bridge stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_im_connected(&self) -> bool {
        self.inner.im.is_authenticated()
    }

    pub fn is_agent_connected(&self) -> bool {
        self.inner.is_agent_connected()
    }

    pub fn tracker(&self) -> &StreamingContextTracker {
        &self.inner.tracker
    }

    pub fn stats(&self) -> BridgeStats {
        let counters = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        BridgeStats {
            running: self.is_running(),
            im_connected: self.is_im_connected(),
            agent_connected: self.is_agent_connected(),
            messages_received: load(&counters.received),
            messages_filtered: load(&counters.filtered),
            messages_forwarded: load(&counters.forwarded),
            replies_sent: load(&counters.replies_sent),
            replies_failed: load(&counters.replies_failed),
            events_unresolved: load(&counters.unresolved),
            agent_reconnects: load(&counters.agent_reconnects),
            contexts: self.inner.tracker.stats(),
        }
    }
}

impl BridgeInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current_agent(&self) -> Option<AgentClient> {
        self.agent.read().clone()
    }

    fn is_agent_connected(&self) -> bool {
        self.agent.read().as_ref().is_some_and(AgentClient::is_authenticated)
    }

    /// Opens a new agent connection and installs it once authenticated.
    async fn connect_agent(&self) -> Result<()> {
        let events = self.agent_events.lock().clone().ok_or(BridgeError::NotRunning)?;
        let generation = self.agent_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = AgentClient::connect(AgentClientConfig::from(&self.config.agent), generation, events).await?;

        let timeout = self.config.agent.auth_timeout();
        if let Err(e) = client.wait_authenticated(timeout).await {
            client.close();
            return Err(match e {
                AgentError::Timeout => BridgeError::AuthTimeout(timeout),
                other => other.into(),
            });
        }
        if !self.is_running() {
            client.close();
            return Err(BridgeError::NotRunning);
        }

        let previous = self.agent.write().replace(client);
        if let Some(previous) = previous {
            previous.close();
        }
        info!(generation, "Agent gateway ready");
        Ok(())
    }

    async fn run_agent_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>, lifecycle: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = lifecycle.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                AgentEvent::Authenticated { generation } => debug!(generation, "Agent connection authenticated"),
                AgentEvent::AuthenticationFailed { generation, reason } => {
                    error!(generation, reason = %reason, "Agent gateway rejected credentials");
                    self.agent_rejected.store(true, Ordering::SeqCst);
                }
                AgentEvent::RunAccepted {
                    request_id,
                    run_id,
                    context,
                } => {
                    if !self.tracker.promote(&request_id, &run_id) {
                        // Provisional entry already swept; the request still knows its target.
                        if let Some(context) = context {
                            self.tracker.register(&run_id, context);
                        }
                    }
                }
                AgentEvent::Run(run) => {
                    let span = run_span(&run.run_id);
                    self.handle_run_event(run).instrument(span).await;
                }
                AgentEvent::Disconnected { generation, reason } => self.on_agent_disconnected(generation, reason),
            }
        }
        debug!("Agent event loop stopped");
    }

    async fn handle_push(&self, push: PushMessage) {
        if !self.is_running() {
            warn!("Bridge not running, ignoring IM push");
            return;
        }
        match push {
            PushMessage::Message { data } => self.forward_to_agent(data),
            PushMessage::Event { event, .. } => debug!(event = %event, "IM gateway event"),
        }
    }

    fn forward_to_agent(&self, data: OutputMessageData) {
        bump(&self.counters.received);
        debug!(sender = %data.sender, conv_type = data.conv.conv_type, "Message from IM");

        if let Err(rejection) = self.filters.admit_push(&data) {
            debug!(sender = %data.sender, reason = ?rejection, "Message filtered");
            bump(&self.counters.filtered);
            BridgeMetrics::record_message("inbound", rejection.as_str());
            return;
        }

        let Some(message) = self.converter.to_agent(&data) else {
            BridgeMetrics::record_message("inbound", "unconvertible");
            return;
        };

        let robot_id = self.im.robot_id().unwrap_or_else(|| self.config.im.robot_id.clone());
        if let Err(rejection) = self.filters.admit_message(&message, &robot_id) {
            debug!(thread = %message.thread_id, reason = ?rejection, "Group message filtered");
            bump(&self.counters.filtered);
            BridgeMetrics::record_message("inbound", rejection.as_str());
            return;
        }

        if message.sender_id.is_empty() {
            warn!("Message without sender, skipping");
            return;
        }

        let Some(agent) = self.current_agent() else {
            warn!("Agent gateway not connected, dropping message");
            BridgeMetrics::record_message("inbound", "agent_unavailable");
            return;
        };

        let request_id = Uuid::new_v4().to_string();
        let context = message.reply_context();
        self.tracker.register_provisional(&request_id, context.clone());

        let params = ChatSendParams {
            session_key: self.config.agent.session_key.clone(),
            message: message.text,
            idempotency_key: Uuid::new_v4().to_string(),
            attachments: message.attachment.into_iter().collect(),
        };

        let ack = match agent.chat_send(&request_id, params, context) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Failed to send message to agent: {}", e);
                self.tracker.discard(&request_id);
                BridgeMetrics::record_message("inbound", "send_failed");
                return;
            }
        };
        bump(&self.counters.forwarded);
        BridgeMetrics::record_message("inbound", "forwarded");

        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match ack.run_id().await {
                Ok(run_id) => debug!(request_id = %request_id, run_id = %run_id, "Agent accepted message"),
                Err(e) => {
                    warn!(request_id = %request_id, "Agent did not accept message: {}", e);
                    tracker.discard(&request_id);
                }
            }
        });
    }

    /// Routes one run event back to the IM side.
    ///
    /// Agent stream events are relayed for registered runs and, through the
    /// fallback, for runs the bridge never started; such a run is adopted so
    /// its later events and final text stay together. Chat-level terminal
    /// events only act on registered runs, since the agent stream has already
    /// completed any run that was adopted or cleared.
    async fn handle_run_event(&self, event: RunEvent) {
        let Some(resolution) = self.tracker.resolve(&event.run_id) else {
            debug!(run_id = %event.run_id, "No context for run, dropping event");
            bump(&self.counters.unresolved);
            ContextMetrics::record_unresolved();
            return;
        };

        let registered = resolution.source == ContextSource::Registered;
        if !registered && !event.phase.is_terminal() {
            debug!(run_id = %event.run_id, "Adopting run through fallback context");
            self.tracker.register(&event.run_id, resolution.target.clone());
        }
        if let Some(text) = &event.text {
            self.tracker.record_text(&event.run_id, text);
        }

        let last_text = || {
            event
                .text
                .clone()
                .or_else(|| resolution.last_text.clone())
        };
        let outgoing = match &event.phase {
            RunPhase::Start | RunPhase::Delta => event.text.clone().map(|t| (t, Some(StreamState::Generating))),
            RunPhase::End => last_text().map(|t| (t, Some(StreamState::Completed))),
            RunPhase::Final if registered => last_text().map(|t| (t, Some(StreamState::Completed))),
            RunPhase::Error(message) if registered => Some((format!("[Agent error] {}", message), None)),
            RunPhase::Final | RunPhase::Error(_) => None,
        };

        if event.phase.is_terminal() {
            self.tracker.complete(&event.run_id);
        }

        if let Some((text, state)) = outgoing {
            self.send_reply(&resolution, &text, state).await;
        }
    }

    async fn send_reply(&self, resolution: &Resolution, text: &str, state: Option<StreamState>) {
        let stream = state.map(|state| (resolution.run_id.as_str(), state));
        let message = self.converter.to_im(&resolution.target, text, stream);

        match self.im.send_message(&message.conversation, &message.payload).await {
            Ok(result) if result.is_success() => {
                bump(&self.counters.replies_sent);
                BridgeMetrics::record_message("outbound", "sent");
                debug!(target = %message.conversation.target, state = ?state, "Reply sent to IM");
            }
            Ok(result) => {
                bump(&self.counters.replies_failed);
                BridgeMetrics::record_message("outbound", "rejected");
                warn!(code = result.code, msg = %result.msg, "IM gateway rejected reply");
            }
            Err(e) => {
                bump(&self.counters.replies_failed);
                BridgeMetrics::record_message("outbound", "failed");
                warn!("Failed to send reply to IM: {}", e);
            }
        }
    }

    fn on_agent_disconnected(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        {
            let mut agent = self.agent.write();
            if agent.as_ref().map(AgentClient::generation) != Some(generation) {
                debug!(generation, "Ignoring close of a replaced agent connection");
                return;
            }
            *agent = None;
        }
        warn!(generation, reason = ?reason, "Agent gateway connection lost");

        if self.is_running() && !self.agent_rejected.load(Ordering::SeqCst) {
            self.schedule_agent_reconnect();
        }
    }

    /// Bounded reconnect loop; at most one runs at a time.
    fn schedule_agent_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Agent reconnect already in progress");
            return;
        }

        let inner = Arc::clone(self);
        let lifecycle = self.lifecycle.lock().clone();
        tokio::spawn(async move {
            let max_attempts = inner.config.agent.max_reconnect_attempts;
            let interval = inner.config.agent.reconnect_interval();
            let mut attempt = 0;
            let mut reconnected = false;

            while attempt < max_attempts
                && inner.is_running()
                && !inner.is_agent_connected()
                && !inner.agent_rejected.load(Ordering::SeqCst)
            {
                attempt += 1;
                info!(attempt, max_attempts, "Reconnecting to agent gateway");
                ConnectionMetrics::record_reconnect("agent");
                bump(&inner.counters.agent_reconnects);

                match inner.connect_agent().await {
                    Ok(()) => {
                        info!(attempt, "Reconnected to agent gateway");
                        reconnected = true;
                        break;
                    }
                    Err(BridgeError::Agent(AgentError::Rejected { reason, .. })) => {
                        error!(reason = %reason, "Agent gateway rejected reconnect");
                        inner.agent_rejected.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(attempt, "Agent reconnect failed: {}", e),
                }

                if attempt < max_attempts {
                    tokio::select! {
                        _ = lifecycle.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }

            if !reconnected && inner.is_running() && !inner.is_agent_connected() {
                error!(attempts = attempt, "Giving up on agent gateway");
            }
            inner.reconnecting.store(false, Ordering::SeqCst);

            // A drop that raced the flag above found a reconnect still in progress.
            if reconnected
                && inner.is_running()
                && !inner.is_agent_connected()
                && !inner.agent_rejected.load(Ordering::SeqCst)
            {
                inner.schedule_agent_reconnect();
            }
        });
    }

    /// Agent keepalive and context eviction on one cadence.
    async fn housekeeping(self: Arc<Self>, lifecycle: CancellationToken) {
        let period = self.config.agent.heartbeat_interval();
        let ttl = self.config.session.context_ttl();
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(agent) = self.current_agent() {
                        agent.ping();
                    }
                    self.tracker.sweep(ttl);
                }
            }
        }
    }
}

/// IM-side callbacks; holds the bridge weakly so dropping the bridge ends it.
struct ImEvents {
    bridge: Weak<BridgeInner>,
}

#[async_trait]
impl ClientHandler for ImEvents {
    async fn on_message(&self, message: PushMessage) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.handle_push(message).await;
        }
    }

    async fn on_connection_changed(&self, connected: bool) {
        if connected {
            info!("IM gateway connected");
        } else {
            warn!("IM gateway connection lost");
        }
    }

    async fn on_error(&self, error: String) {
        warn!(error = %error, "IM gateway error");
    }
}
