//! Event Router
//!
//! In-process pub/sub fan-out. Subscribers register against a topic (or
//! `all`) and are invoked either synchronously on the caller's task, or
//! concurrently, or through a bounded queue drained in batches by one
//! background task. A failing subscriber is logged and skipped; it never
//! aborts sibling deliveries. The subscriber set is cloned before each
//! delivery so no lock is held across user code.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::{ROUTER_DRAIN_BATCH, ROUTER_QUEUE_CAPACITY};
use crate::events::IndexerEvent;
use crate::metrics;

pub const TOPIC_ALL: &str = "all";

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type Handler = Arc<dyn Fn(Arc<IndexerEvent>) -> HandlerFuture + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
    once: bool,
}

struct RouterState {
    subscriptions: HashMap<String, Vec<Subscription>>,
    queue: VecDeque<Arc<IndexerEvent>>,
}

/// Handle returned by subscribe; dropping it removes the subscription.
pub struct SubscriberHandle {
    router: Arc<EventRouter>,
    topic: String,
    id: u64,
    closed: AtomicBool,
}

impl SubscriberHandle {
    /// Explicit removal (drop does the same)
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.router.remove(&self.topic, self.id);
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct EventRouter {
    state: Mutex<RouterState>,
    next_id: AtomicU64,
    drainer_notify: tokio::sync::Notify,
    drainer_started: AtomicBool,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                subscriptions: HashMap::new(),
                queue: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
            drainer_notify: tokio::sync::Notify::new(),
            drainer_started: AtomicBool::new(false),
        }
    }

    /// Register a handler for a topic (`all` receives every event)
    pub fn subscribe<F>(self: &Arc<Self>, topic: &str, handler: F) -> SubscriberHandle
    where
        F: Fn(Arc<IndexerEvent>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler), false)
    }

    /// Register a single-delivery handler that removes itself afterwards
    pub fn subscribe_once<F>(self: &Arc<Self>, topic: &str, handler: F) -> SubscriberHandle
    where
        F: Fn(Arc<IndexerEvent>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(topic, Arc::new(handler), true)
    }

    fn register(self: &Arc<Self>, topic: &str, handler: Handler, once: bool) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id, handler, once });

        SubscriberHandle {
            router: Arc::clone(self),
            topic: topic.to_string(),
            id,
            closed: AtomicBool::new(false),
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscriptions.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                state.subscriptions.remove(topic);
            }
        }
    }

    /// Snapshot matching handlers in registration order, dropping `once`
    /// subscribers from the live set as they are claimed
    fn claim_handlers(&self, topic: &str) -> Vec<(u64, Handler, String)> {
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        for key in [topic, TOPIC_ALL] {
            if let Some(subs) = state.subscriptions.get_mut(key) {
                for sub in subs.iter() {
                    claimed.push((sub.id, Arc::clone(&sub.handler), key.to_string()));
                }
                subs.retain(|s| !s.once);
                if subs.is_empty() {
                    state.subscriptions.remove(key);
                }
            }
        }
        claimed
    }

    /// Invoke every subscriber in registration order on the caller's task
    pub async fn emit_sync(&self, event: IndexerEvent) {
        let topic = event.topic();
        let event = Arc::new(event);
        for (id, handler, _) in self.claim_handlers(&topic) {
            if let Err(e) = handler(Arc::clone(&event)).await {
                warn!("📣 Subscriber {} failed on {}: {}", id, topic, e);
            }
        }
    }

    /// Schedule every subscriber concurrently and await completion
    pub async fn emit_async(&self, event: IndexerEvent) {
        let topic = event.topic();
        let event = Arc::new(event);
        let handlers = self.claim_handlers(&topic);

        let futures = handlers.into_iter().map(|(id, handler, _)| {
            let event = Arc::clone(&event);
            let topic = topic.clone();
            async move {
                if let Err(e) = handler(event).await {
                    warn!("📣 Subscriber {} failed on {}: {}", id, topic, e);
                }
            }
        });
        futures::future::join_all(futures).await;
    }

    /// Append to the bounded queue; the background drainer delivers in
    /// batches. Overflow drops the oldest undelivered event.
    pub fn queue(self: &Arc<Self>, event: IndexerEvent) {
        {
            let mut state = self.state.lock();
            if state.queue.len() >= ROUTER_QUEUE_CAPACITY {
                state.queue.pop_front();
                metrics::EVENT_QUEUE_OVERFLOW.inc();
                debug!("📣 Router queue overflow, oldest event dropped");
            }
            state.queue.push_back(Arc::new(event));
        }

        if !self.drainer_started.swap(true, Ordering::SeqCst) {
            let router = Arc::clone(self);
            tokio::spawn(async move {
                router.drain_loop().await;
            });
        }
        self.drainer_notify.notify_one();
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            self.drainer_notify.notified().await;
            loop {
                let batch: Vec<Arc<IndexerEvent>> = {
                    let mut state = self.state.lock();
                    let take = state.queue.len().min(ROUTER_DRAIN_BATCH);
                    state.queue.drain(..take).collect()
                };
                if batch.is_empty() {
                    break;
                }
                for event in batch {
                    let topic = event.topic();
                    for (id, handler, _) in self.claim_handlers(&topic) {
                        if let Err(e) = handler(Arc::clone(&event)).await {
                            warn!("📣 Queued subscriber {} failed on {}: {}", id, topic, e);
                        }
                    }
                }
                // Cooperative yield between batches
                tokio::task::yield_now().await;
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
