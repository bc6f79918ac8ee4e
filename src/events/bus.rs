//! Bounded pub/sub event bus.
//!
//! Publishers never block: `publish` is a try-send that reports drops
//! through a counter. One consumer task dequeues events and dispatches
//! each to every matching subscription, higher priority first, awaiting
//! the whole batch before the next dequeue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::alerts::Alert;
use crate::errors::{Error, Result};
use crate::events::event::{EventKind, StreamEvent};
use crate::events::filter::EventFilter;
use crate::feeds::PriceTick;
use crate::logging::targets;
use crate::tracker::{HoldingUpdate, PortfolioMetrics};

/// Event bus sizing.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pending event queue capacity
    pub queue_capacity: usize,
    /// Retained event history capacity
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            history_capacity: 1000,
        }
    }
}

/// Receives events matched by a subscription's filter.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &StreamEvent) -> Result<()>;
}

/// Adapter so plain closures can subscribe.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&StreamEvent) -> Result<()> + Send + Sync,
{
    async fn handle_event(&self, event: &StreamEvent) -> Result<()> {
        (self.0)(event)
    }
}

/// Per-subscription delivery counters.
#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    pub id: String,
    pub priority: i32,
    pub events_handled: u64,
    pub errors: u64,
    pub last_event_age: Option<Duration>,
}

struct SubscriptionEntry {
    id: String,
    handler: Arc<dyn EventHandler>,
    filter: EventFilter,
    priority: i32,
    events_handled: AtomicU64,
    errors: AtomicU64,
    /// Nanos since bus creation; 0 = never
    last_event: AtomicU64,
}

/// Aggregate bus counters.
#[derive(Debug, Clone)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub subscriptions: usize,
    pub history_len: usize,
    pub queue_capacity: usize,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct BusInner {
    config: BusConfig,
    tx: mpsc::Sender<StreamEvent>,
    rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    subscriptions: RwLock<Vec<Arc<SubscriptionEntry>>>,
    history: Mutex<VecDeque<StreamEvent>>,
    lifecycle: AtomicU8,
    stop_notify: Notify,
    published: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    start_time: Instant,
}

/// Bounded, prioritized pub/sub bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                subscriptions: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                lifecycle: AtomicU8::new(STATE_IDLE),
                stop_notify: Notify::new(),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Relaxed) == STATE_RUNNING
    }

    /// Start the consumer task. Events published before `start` are
    /// already queued and get dispatched first.
    pub fn start(&self) {
        if self
            .inner
            .lifecycle
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let Some(rx) = self.inner.rx.lock().unwrap().take() else {
            return;
        };
        info!(target: targets::EVENTS, "event bus started");
        let bus = self.clone();
        tokio::spawn(async move { bus.consume_loop(rx).await });
    }

    /// Stop the consumer and discard anything still queued.
    pub fn stop(&self) {
        let was = self.inner.lifecycle.swap(STATE_STOPPED, Ordering::Relaxed);
        if was == STATE_RUNNING {
            self.inner.stop_notify.notify_waiters();
            info!(target: targets::EVENTS, "event bus stopped");
        }
    }

    /// Enqueue an event without blocking.
    ///
    /// Returns `false` (and counts a drop) when the queue is full or the
    /// bus has been stopped.
    pub fn publish(&self, event: StreamEvent) -> bool {
        if self.inner.lifecycle.load(Ordering::Relaxed) == STATE_STOPPED {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.inner.tx.try_send(event) {
            Ok(()) => {
                self.inner.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(target: targets::EVENTS, "queue full, event dropped");
                false
            }
        }
    }

    /// Publish a `PriceUpdate` event for one tick, tagged with the
    /// provider it came from.
    pub fn publish_price_update(&self, tick: &PriceTick) -> bool {
        let data = serde_json::to_value(tick).unwrap_or(Value::Null);
        self.publish(StreamEvent::new(EventKind::PriceUpdate, data).with_source(tick.source.as_str()))
    }

    /// Publish a `PortfolioUpdate` event carrying a metrics snapshot and
    /// the per-holding breakdown.
    pub fn publish_portfolio_update(
        &self,
        metrics: &PortfolioMetrics,
        holdings: &[HoldingUpdate],
    ) -> bool {
        let data = json!({
            "metrics": metrics,
            "holdings": holdings,
        });
        self.publish(StreamEvent::new(EventKind::PortfolioUpdate, data).with_source("tracker"))
    }

    /// Publish an `AlertTriggered` event for a fired alert.
    pub fn publish_alert(&self, alert: &Alert) -> bool {
        let data = serde_json::to_value(alert).unwrap_or(Value::Null);
        self.publish(StreamEvent::new(EventKind::AlertTriggered, data).with_source("alerts"))
    }

    /// Register a handler. Higher `priority` dispatches first.
    pub async fn subscribe(
        &self,
        id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        filter: EventFilter,
        priority: i32,
    ) -> Result<()> {
        let id = id.into();
        let mut subs = self.inner.subscriptions.write().await;
        if subs.iter().any(|s| s.id == id) {
            return Err(Error::DuplicateSubscription(id));
        }
        subs.push(Arc::new(SubscriptionEntry {
            id,
            handler,
            filter,
            priority,
            events_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_event: AtomicU64::new(0),
        }));
        subs.sort_by_key(|s| std::cmp::Reverse(s.priority));
        Ok(())
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let mut subs = self.inner.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(Error::SubscriptionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn subscription_stats(&self, id: &str) -> Option<SubscriptionStats> {
        let subs = self.inner.subscriptions.read().await;
        let entry = subs.iter().find(|s| s.id == id)?;
        let last = entry.last_event.load(Ordering::Relaxed);
        let last_event_age = if last == 0 {
            None
        } else {
            let now = self.inner.start_time.elapsed().as_nanos() as u64;
            Some(Duration::from_nanos(now.saturating_sub(last)))
        };
        Some(SubscriptionStats {
            id: entry.id.clone(),
            priority: entry.priority,
            events_handled: entry.events_handled.load(Ordering::Relaxed),
            errors: entry.errors.load(Ordering::Relaxed),
            last_event_age,
        })
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            subscriptions: self.inner.subscriptions.read().await.len(),
            history_len: self.inner.history.lock().unwrap().len(),
            queue_capacity: self.inner.config.queue_capacity,
        }
    }

    /// Events dropped at publish or discarded on stop never enter the ring.
    fn remember(&self, event: StreamEvent) {
        let mut history = self.inner.history.lock().unwrap();
        if history.len() == self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Most recent consumed events in chronological order, optionally
    /// narrowed to one kind.
    pub fn recent_events(&self, limit: usize, kind: Option<EventKind>) -> Vec<StreamEvent> {
        let history = self.inner.history.lock().unwrap();
        let mut out: Vec<StreamEvent> = history
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    async fn consume_loop(self, mut rx: mpsc::Receiver<StreamEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.stop_notify.notified() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.remember(event.clone());
            self.dispatch(&event).await;
        }
        // Discard whatever is still queued
        let mut discarded = 0u64;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(target: targets::EVENTS, discarded, "queue drained on stop");
        }
    }

    async fn dispatch(&self, event: &StreamEvent) {
        let matching: Vec<Arc<SubscriptionEntry>> = {
            let subs = self.inner.subscriptions.read().await;
            subs.iter()
                .filter(|s| s.filter.matches(event))
                .cloned()
                .collect()
        };
        if matching.is_empty() {
            self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Entries are priority-sorted; futures start in that order and
        // the whole batch completes before the next event.
        let now_nanos = self.inner.start_time.elapsed().as_nanos() as u64;
        join_all(matching.iter().map(|entry| {
            let entry = entry.clone();
            async move {
                match entry.handler.handle_event(event).await {
                    Ok(()) => {
                        entry.events_handled.fetch_add(1, Ordering::Relaxed);
                        entry.last_event.store(now_nanos, Ordering::Relaxed);
                    }
                    Err(e) => {
                        entry.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: targets::EVENTS,
                            subscription = %entry.id,
                            error = %e,
                            "event handler failed"
                        );
                    }
                }
            }
        }))
        .await;
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}
