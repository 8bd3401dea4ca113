//! 流式上下文追踪
//!
//! The agent gateway answers a `chat.send` with a run id and then streams
//! events tagged with that id. The tracker maps run ids back to the
//! conversation that started the run so late replies can be routed.
//!
//! The run id is only known once the send is acknowledged, so a context is
//! first registered provisionally under the request id and promoted when the
//! acknowledgement arrives. Events for run ids that were never registered
//! resolve to a single fallback context: the most recent registration.

use dashmap::DashMap;
use parking_lot::Mutex;
use relay_client::ReplyContext;
use relay_observability::metrics::ContextMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Where one run's replies go.
#[derive(Debug, Clone)]
pub struct StreamingContext {
    pub run_id: String,
    pub target: ReplyContext,
    /// Last non-empty text streamed for the run
    pub last_text: Option<String>,
    last_activity: Instant,
}

impl StreamingContext {
    fn new(run_id: impl Into<String>, target: ReplyContext) -> Self {
        Self {
            run_id: run_id.into(),
            target,
            last_text: None,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > max_age
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    /// Registered under the run id
    Registered,
    /// Run id unknown; the most recent registration stands in
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub run_id: String,
    pub target: ReplyContext,
    pub last_text: Option<String>,
    pub source: ContextSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub active: usize,
    pub provisional: usize,
    pub private: usize,
    pub group: usize,
    pub has_fallback: bool,
}

#[derive(Debug, Default)]
struct TrackerInner {
    runs: DashMap<String, StreamingContext>,
    provisional: DashMap<String, StreamingContext>,
    fallback: Mutex<Option<StreamingContext>>,
}

/// Run id → reply target map with a fallback and TTL eviction.
#[derive(Debug, Clone, Default)]
pub struct StreamingContextTracker {
    inner: Arc<TrackerInner>,
}

impl StreamingContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overwrites) the context of `run_id` and makes it the fallback.
    pub fn register(&self, run_id: &str, target: ReplyContext) {
        let context = StreamingContext::new(run_id, target);
        *self.inner.fallback.lock() = Some(context.clone());
        self.inner.runs.insert(run_id.to_string(), context);
        debug!(run_id = %run_id, "Streaming context registered");
    }

    /// Registers a context under a local key until the run id is known.
    pub fn register_provisional(&self, key: &str, target: ReplyContext) {
        let context = StreamingContext::new(key, target);
        *self.inner.fallback.lock() = Some(context.clone());
        self.inner.provisional.insert(key.to_string(), context);
    }

    /// Moves a provisional context to its run id. Returns `false` if `key`
    /// was never registered, already discarded, or swept.
    pub fn promote(&self, key: &str, run_id: &str) -> bool {
        match self.inner.provisional.remove(key) {
            Some((_, mut context)) => {
                context.run_id = run_id.to_string();
                context.touch();
                self.inner.runs.insert(run_id.to_string(), context);
                debug!(key = %key, run_id = %run_id, "Streaming context promoted");
                true
            }
            None => false,
        }
    }

    /// Drops a provisional context whose send failed.
    pub fn discard(&self, key: &str) -> bool {
        self.inner.provisional.remove(key).is_some()
    }

    /// Finds the reply target for `run_id`, refreshing its activity.
    pub fn resolve(&self, run_id: &str) -> Option<Resolution> {
        if let Some(mut context) = self.inner.runs.get_mut(run_id) {
            context.touch();
            return Some(Resolution {
                run_id: run_id.to_string(),
                target: context.target.clone(),
                last_text: context.last_text.clone(),
                source: ContextSource::Registered,
            });
        }

        self.inner.fallback.lock().as_ref().map(|context| Resolution {
            run_id: run_id.to_string(),
            target: context.target.clone(),
            last_text: None,
            source: ContextSource::Fallback,
        })
    }

    /// Remembers the latest text of a registered run.
    pub fn record_text(&self, run_id: &str, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match self.inner.runs.get_mut(run_id) {
            Some(mut context) => {
                context.last_text = Some(text.to_string());
                context.touch();
                true
            }
            None => false,
        }
    }

    /// Clears a run on its terminal event.
    pub fn complete(&self, run_id: &str) -> Option<StreamingContext> {
        self.inner.runs.remove(run_id).map(|(_, context)| context)
    }

    /// Evicts every context idle for longer than `max_age`.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        let mut evict = |_: &String, context: &mut StreamingContext| {
            if context.is_expired(now, max_age) {
                removed += 1;
                false
            } else {
                true
            }
        };
        self.inner.runs.retain(&mut evict);
        self.inner.provisional.retain(&mut evict);

        {
            let mut fallback = self.inner.fallback.lock();
            if fallback.as_ref().is_some_and(|context| context.is_expired(now, max_age)) {
                *fallback = None;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept idle streaming contexts");
            ContextMetrics::record_swept(removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.runs.is_empty()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.runs.contains_key(run_id)
    }

    pub fn has_fallback(&self) -> bool {
        self.inner.fallback.lock().is_some()
    }

    pub fn stats(&self) -> TrackerStats {
        let group = self
            .inner
            .runs
            .iter()
            .filter(|entry| entry.value().target.is_group)
            .count();
        let active = self.inner.runs.len();
        TrackerStats {
            active,
            provisional: self.inner.provisional.len(),
            private: active.saturating_sub(group),
            group,
            has_fallback: self.has_fallback(),
        }
    }
}
