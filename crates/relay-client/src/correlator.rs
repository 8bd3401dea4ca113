//! Request/response correlation with per-request timeouts.
//!
//! Every registered request is completed exactly once: by its response, by
//! its timer, or by a connection-wide cancellation. `DashMap::remove` is the
//! only way a slot is taken, so whichever path removes it first wins.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_observability::metrics::RequestMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Where a late response should be routed when no caller is waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub sender_id: String,
    pub thread_id: String,
    pub is_group: bool,
}

/// Bookkeeping for one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub method: String,
    pub created_at: DateTime<Utc>,
    pub context: Option<ReplyContext>,
}

impl PendingRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            created_at: Utc::now(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ReplyContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("Request timeout")]
    Timeout,
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
}

struct Slot<T> {
    meta: PendingRequest,
    waiter: oneshot::Sender<Result<T, CorrelationError>>,
    timer: Option<AbortHandle>,
}

impl<T> Slot<T> {
    fn finish(self, outcome: Result<T, CorrelationError>) -> PendingRequest {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.waiter.send(outcome);
        self.meta
    }
}

/// The caller's side of a registered request.
#[derive(Debug)]
pub struct PendingResponse<T> {
    request_id: String,
    receiver: oneshot::Receiver<Result<T, CorrelationError>>,
}

impl<T> PendingResponse<T> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the single completion of this request.
    pub async fn wait(self) -> Result<T, CorrelationError> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CorrelationError::ConnectionClosed(
                "correlator dropped".to_string(),
            )),
        }
    }
}

/// Maps request ids to waiters.
pub struct RequestCorrelator<T> {
    pending: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Clone for RequestCorrelator<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for RequestCorrelator<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }
}

impl<T> std::fmt::Debug for RequestCorrelator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<T: Send + 'static> RequestCorrelator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and arms its timeout.
    ///
    /// Registering an id that is still pending replaces the old slot, which is
    /// failed with `ConnectionClosed`.
    pub fn register(
        &self,
        request_id: impl Into<String>,
        meta: PendingRequest,
        timeout: Duration,
    ) -> PendingResponse<T> {
        let request_id = request_id.into();
        let (waiter, receiver) = oneshot::channel();

        let slot = Slot {
            meta,
            waiter,
            timer: None,
        };
        if let Some(previous) = self.pending.insert(request_id.clone(), slot) {
            warn!(request_id = %request_id, "Duplicate request id, failing previous waiter");
            previous.finish(Err(CorrelationError::ConnectionClosed(
                "superseded by a request with the same id".to_string(),
            )));
        }

        let pending = Arc::clone(&self.pending);
        let timer_id = request_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, slot)) = pending.remove(&timer_id) {
                warn!(request_id = %timer_id, method = %slot.meta.method, "Request timed out");
                RequestMetrics::record_timeout();
                // Not finish(): the stored abort handle is this task.
                let Slot { meta: _, waiter, timer: _ } = slot;
                let _ = waiter.send(Err(CorrelationError::Timeout));
            }
        });

        // The timer may already have fired for a zero timeout.
        if let Some(mut slot) = self.pending.get_mut(&request_id) {
            slot.timer = Some(timer.abort_handle());
        }

        PendingResponse {
            request_id,
            receiver,
        }
    }

    /// Completes a request with its response.
    ///
    /// Returns the request metadata, or `None` when the id is unknown or
    /// already completed; such responses are dropped.
    pub fn complete(&self, request_id: &str, response: T) -> Option<PendingRequest> {
        match self.pending.remove(request_id) {
            Some((_, slot)) => {
                RequestMetrics::record_completed();
                Some(slot.finish(Ok(response)))
            }
            None => {
                debug!(request_id = %request_id, "Response for unknown or completed request dropped");
                RequestMetrics::record_orphaned();
                None
            }
        }
    }

    /// Fails a single request, e.g. when its frame could not be written.
    pub fn fail(&self, request_id: &str, error: CorrelationError) -> bool {
        match self.pending.remove(request_id) {
            Some((_, slot)) => {
                slot.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every pending request with `ConnectionClosed`.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                slot.finish(Err(CorrelationError::ConnectionClosed(reason.to_string())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(count = cancelled, reason = %reason, "Cancelled pending requests");
            RequestMetrics::record_cancelled(cancelled);
        }
        cancelled
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
