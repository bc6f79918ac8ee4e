//! Composition root wiring feeds, tracker, alerts, and the event bus.
//!
//! The service owns one of each component and bridges them: ticks from
//! the aggregator drive the tracker and the alert manager's price
//! rules and are republished onto the bus, tracker snapshots flow to
//! the bus and the alert manager's portfolio rules, and a periodic
//! health check publishes a system status event.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::alerts::{AlertManager, AlertManagerConfig};
use crate::errors::Result;
use crate::events::{BusConfig, BusStats, EventBus, EventKind, StreamEvent};
use crate::feeds::{AggregatorConfig, PriceFeedAggregator};
use crate::logging::targets;
use crate::tracker::{PortfolioTracker, TrackerConfig};

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub health_check_interval: Duration,
    pub bus: BusConfig,
    pub aggregator: AggregatorConfig,
    pub tracker: TrackerConfig,
    pub alerts: AlertManagerConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            bus: BusConfig::default(),
            aggregator: AggregatorConfig::default(),
            tracker: TrackerConfig::default(),
            alerts: AlertManagerConfig::default(),
        }
    }
}

/// Service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    /// A core background task died; `stop()` still tears down cleanly
    Error = 4,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceStatus::Starting,
            2 => ServiceStatus::Running,
            3 => ServiceStatus::Stopping,
            4 => ServiceStatus::Error,
            _ => ServiceStatus::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time service counters.
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub status: ServiceStatus,
    pub uptime: Option<Duration>,
    pub snapshots_computed: u64,
    pub alerts_triggered: u64,
    pub alerts_suppressed: u64,
    pub stale_symbols: Vec<String>,
    pub bus: BusStats,
}

type StatusHandler = Arc<dyn Fn(ServiceStatus) + Send + Sync>;

struct ServiceInner {
    config: MonitoringConfig,
    bus: EventBus,
    aggregator: PriceFeedAggregator,
    tracker: PortfolioTracker,
    alerts: AlertManager,
    status: AtomicU8,
    started_at: StdMutex<Option<Instant>>,
    status_handlers: StdMutex<Vec<StatusHandler>>,
    stop_notify: Notify,
}

impl ServiceInner {
    fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: ServiceStatus) {
        self.status.store(status as u8, Ordering::Release);
        let handlers = self.status_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(status);
        }
    }
}

/// Top-level monitoring engine.
#[derive(Clone)]
pub struct MonitoringService {
    inner: Arc<ServiceInner>,
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

impl MonitoringService {
    pub fn new(config: MonitoringConfig) -> Self {
        let bus = EventBus::new(config.bus.clone());
        let aggregator = PriceFeedAggregator::new(config.aggregator.clone());
        let tracker = PortfolioTracker::new(config.tracker.clone());
        let alerts = AlertManager::new(config.alerts.clone());

        alerts.attach_bus(bus.clone());
        tracker.attach_bus(bus.clone());
        tracker.attach_alerts(alerts.clone());

        Self {
            inner: Arc::new(ServiceInner {
                config,
                bus,
                aggregator,
                tracker,
                alerts,
                status: AtomicU8::new(ServiceStatus::Stopped as u8),
                started_at: StdMutex::new(None),
                status_handlers: StdMutex::new(Vec::new()),
                stop_notify: Notify::new(),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn aggregator(&self) -> &PriceFeedAggregator {
        &self.inner.aggregator
    }

    pub fn tracker(&self) -> &PortfolioTracker {
        &self.inner.tracker
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.inner.alerts
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.status()
    }

    /// Called on every lifecycle transition, including from `start`
    /// and `stop` themselves.
    pub fn on_status_change(&self, handler: impl Fn(ServiceStatus) + Send + Sync + 'static) {
        self.inner.status_handlers.lock().unwrap().push(Arc::new(handler));
    }

    /// Bring the whole stack up. Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        match self.inner.status() {
            ServiceStatus::Stopped => {}
            _ => return Ok(()),
        }
        self.inner.set_status(ServiceStatus::Starting);
        info!(target: targets::SERVICE, "monitoring service starting");

        self.inner.bus.start();
        self.inner.aggregator.start().await?;
        self.inner
            .tracker
            .start(self.inner.aggregator.subscribe_ticks())
            .await?;

        let inner = self.inner.clone();
        let mut ticks = self.inner.aggregator.subscribe_ticks();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.stop_notify.notified() => break,
                    tick = ticks.recv() => {
                        let Some(tick) = tick else { break };
                        inner.alerts.evaluate_price_update(&tick).await;
                        inner.bus.publish_price_update(&tick);
                    }
                }
            }
            debug!(target: targets::SERVICE, "tick bridge exited");
        });

        let service = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(service.inner.config.health_check_interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = service.inner.stop_notify.notified() => break,
                    _ = timer.tick() => {
                        // A stop between polls can miss the notify
                        if !matches!(
                            service.inner.status(),
                            ServiceStatus::Running | ServiceStatus::Error
                        ) {
                            break;
                        }
                        service.publish_health().await;
                    }
                }
            }
        });

        *self.inner.started_at.lock().unwrap() = Some(Instant::now());
        self.inner.set_status(ServiceStatus::Running);
        info!(target: targets::SERVICE, "monitoring service running");
        Ok(())
    }

    /// Tear the stack down in dependency order. Idempotent; also valid
    /// from `Error`.
    pub async fn stop(&self) {
        if !matches!(
            self.inner.status(),
            ServiceStatus::Running | ServiceStatus::Error
        ) {
            return;
        }
        self.inner.set_status(ServiceStatus::Stopping);
        info!(target: targets::SERVICE, "monitoring service stopping");

        self.inner.stop_notify.notify_waiters();
        self.inner.tracker.stop();
        self.inner.aggregator.stop().await;
        self.inner.bus.stop();

        *self.inner.started_at.lock().unwrap() = None;
        self.inner.set_status(ServiceStatus::Stopped);
        info!(target: targets::SERVICE, "monitoring service stopped");
    }

    pub fn current_metrics(&self) -> Option<crate::tracker::PortfolioMetrics> {
        self.inner.tracker.latest_metrics()
    }

    pub fn recent_alerts(&self, window: Duration) -> Vec<crate::alerts::Alert> {
        self.inner.alerts.recent_alerts(window)
    }

    pub async fn stats(&self) -> ServiceStats {
        // Copy out of the guard before awaiting bus stats
        let uptime = self.inner.started_at.lock().unwrap().map(|t| t.elapsed());
        ServiceStats {
            status: self.inner.status(),
            uptime,
            snapshots_computed: self.inner.tracker.updates_computed(),
            alerts_triggered: self.inner.alerts.alerts_triggered(),
            alerts_suppressed: self.inner.alerts.alerts_suppressed(),
            stale_symbols: self.inner.aggregator.stale_symbols(),
            bus: self.inner.bus.stats().await,
        }
    }

    async fn publish_health(&self) {
        if self.inner.status() == ServiceStatus::Running
            && self.inner.tracker.state() == crate::tracker::TrackerState::Error
        {
            error!(target: targets::SERVICE, "tracker loop died");
            self.inner.set_status(ServiceStatus::Error);
        }
        let stats = self.stats().await;
        let data = json!({
            "status": stats.status.as_str(),
            "uptime_secs": stats.uptime.map(|u| u.as_secs()),
            "snapshots_computed": stats.snapshots_computed,
            "alerts_triggered": stats.alerts_triggered,
            "stale_symbols": stats.stale_symbols,
            "events_dropped": stats.bus.dropped,
        });
        self.inner
            .bus
            .publish(StreamEvent::new(EventKind::SystemStatus, data).with_source("service"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertKind, AlertRule, NotificationHandler};
    use crate::events::{EventFilter, FnHandler};
    use crate::feeds::{MockFeed, MockFeedConfig, PriceFeed};
    use crate::tracker::HoldingPosition;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<Alert>>>);

    #[async_trait]
    impl NotificationHandler for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        async fn send_alert(&self, alert: &Alert) -> Result<()> {
            self.0.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn fast_mock_feed() -> Arc<MockFeed> {
        Arc::new(MockFeed::new(
            MockFeedConfig {
                tick_interval: Duration::from_millis(10),
                seed: Some(7),
                default_price: dec!(100),
            },
            Default::default(),
        ))
    }

    #[tokio::test]
    async fn test_lifecycle_and_status_handlers() {
        let service = MonitoringService::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        service.on_status_change(move |s| seen_clone.lock().unwrap().push(s));

        service.start().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        // second start is a no-op
        service.start().await.unwrap();

        service.stop().await;
        service.stop().await;
        assert_eq!(service.status(), ServiceStatus::Stopped);

        let transitions = seen.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                ServiceStatus::Starting,
                ServiceStatus::Running,
                ServiceStatus::Stopping,
                ServiceStatus::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_end_to_end_price_flow() {
        let service = MonitoringService::default();
        let feed = fast_mock_feed();
        feed.add_symbols(&["BTC".to_string()]).await.unwrap();
        service.aggregator().add_provider(feed, true).await.unwrap();

        service
            .tracker()
            .add_holding(HoldingPosition::new("BTC", dec!(2), dec!(90)))
            .await
            .unwrap();

        let alerts = Arc::new(Mutex::new(Vec::new()));
        service.alerts().add_handler(Arc::new(Capture(alerts.clone()))).await;
        // mock walks from 100 in sub-percent steps, so 50 always trips
        service
            .alerts()
            .add_rule(
                AlertRule::new("floor", AlertKind::PriceThreshold)
                    .with_symbol("BTC")
                    .with_threshold(dec!(50)),
            )
            .await
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        service
            .bus()
            .subscribe(
                "capture",
                Arc::new(FnHandler(move |e: &StreamEvent| {
                    events_clone.lock().unwrap().push(e.kind);
                    Ok(())
                })),
                EventFilter::any(),
                0,
            )
            .await
            .unwrap();

        service.start().await.unwrap();
        for _ in 0..200 {
            if !alerts.lock().unwrap().is_empty()
                && service.tracker().latest_metrics().is_some()
                && events.lock().unwrap().contains(&EventKind::PriceUpdate)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.stop().await;

        assert!(!alerts.lock().unwrap().is_empty());
        let metrics = service.tracker().latest_metrics().unwrap();
        assert!(metrics.total_value > dec!(0));
        let kinds = events.lock().unwrap().clone();
        assert!(kinds.contains(&EventKind::PriceUpdate));
        assert!(kinds.contains(&EventKind::PortfolioUpdate));
        assert!(kinds.contains(&EventKind::AlertTriggered));
    }

    #[tokio::test]
    async fn test_health_check_publishes_system_status() {
        let service = MonitoringService::new(MonitoringConfig {
            health_check_interval: Duration::from_millis(20),
            ..MonitoringConfig::default()
        });
        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = seen.clone();
        service
            .bus()
            .subscribe(
                "health",
                Arc::new(FnHandler(move |_e: &StreamEvent| {
                    *seen_clone.lock().unwrap() += 1;
                    Ok(())
                })),
                EventFilter::any().for_kinds([EventKind::SystemStatus]),
                0,
            )
            .await
            .unwrap();

        service.start().await.unwrap();
        for _ in 0..100 {
            if *seen.lock().unwrap() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        service.stop().await;
        assert!(*seen.lock().unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let service = MonitoringService::default();
        let stats = service.stats().await;
        assert_eq!(stats.status, ServiceStatus::Stopped);
        assert!(stats.uptime.is_none());

        service.start().await.unwrap();
        let stats = service.stats().await;
        assert_eq!(stats.status, ServiceStatus::Running);
        assert!(stats.uptime.is_some());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stats_from_spawned_task() {
        // stats() runs inside spawned loops, so its future must be Send
        let service = MonitoringService::default();
        service.start().await.unwrap();
        let clone = service.clone();
        let stats = tokio::spawn(async move { clone.stats().await })
            .await
            .unwrap();
        assert_eq!(stats.status, ServiceStatus::Running);
        service.stop().await;
    }
}
