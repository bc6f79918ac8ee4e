//! Live portfolio valuation.
//!
//! The tracker owns the holding set and a price cache fed by a tick
//! stream. In continuous mode every tick for a held symbol produces a
//! fresh snapshot; in interval mode ticks only refresh the cache and a
//! timer drives recomputation. The first snapshot with a nonzero value
//! becomes the daily baseline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::alerts::AlertManager;
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::feeds::PriceTick;
use crate::logging::targets;
use crate::tracker::holdings::{HoldingPosition, HoldingUpdate};
use crate::tracker::metrics::{BasicMetricsEngine, MetricsEngine, PortfolioMetrics};

/// How snapshot recomputation is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerMode {
    /// Recompute on every tick for a held symbol.
    Continuous,
    /// Recompute on a fixed timer; ticks only refresh the price cache.
    Interval,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub mode: TrackerMode,
    /// Timer period for [`TrackerMode::Interval`]
    pub update_interval: Duration,
    /// Retained snapshot history capacity
    pub history_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            mode: TrackerMode::Continuous,
            update_interval: Duration::from_secs(30),
            history_capacity: 1000,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == TrackerMode::Interval && self.update_interval.is_zero() {
            return Err(Error::invalid_config(
                "update_interval must be nonzero in interval mode",
            ));
        }
        Ok(())
    }
}

/// Tracker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    /// The drive loop died without a stop request
    Error = 4,
}

impl TrackerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TrackerState::Starting,
            2 => TrackerState::Running,
            3 => TrackerState::Stopping,
            4 => TrackerState::Error,
            _ => TrackerState::Stopped,
        }
    }
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackerState::Stopped => "stopped",
            TrackerState::Starting => "starting",
            TrackerState::Running => "running",
            TrackerState::Stopping => "stopping",
            TrackerState::Error => "error",
        };
        f.write_str(s)
    }
}

struct TrackerInner {
    config: TrackerConfig,
    engine: Box<dyn MetricsEngine>,
    state: AtomicU8,
    holdings: RwLock<HashMap<String, HoldingPosition>>,
    prices: RwLock<HashMap<String, PriceTick>>,
    baseline: StdMutex<Option<Decimal>>,
    latest: StdMutex<Option<PortfolioMetrics>>,
    history: StdMutex<VecDeque<PortfolioMetrics>>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<PortfolioMetrics>>>,
    bus: StdMutex<Option<EventBus>>,
    alerts: StdMutex<Option<AlertManager>>,
    stop_notify: Notify,
    updates_computed: AtomicU64,
}

impl TrackerInner {
    fn state(&self) -> TrackerState {
        TrackerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TrackerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Tracks holdings against live prices and emits metric snapshots.
#[derive(Clone)]
pub struct PortfolioTracker {
    inner: Arc<TrackerInner>,
}

impl Default for PortfolioTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl PortfolioTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_engine(config, Box::new(BasicMetricsEngine))
    }

    pub fn with_engine(config: TrackerConfig, engine: Box<dyn MetricsEngine>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                config,
                engine,
                state: AtomicU8::new(TrackerState::Stopped as u8),
                holdings: RwLock::new(HashMap::new()),
                prices: RwLock::new(HashMap::new()),
                baseline: StdMutex::new(None),
                latest: StdMutex::new(None),
                history: StdMutex::new(VecDeque::new()),
                subscribers: StdMutex::new(Vec::new()),
                bus: StdMutex::new(None),
                alerts: StdMutex::new(None),
                stop_notify: Notify::new(),
                updates_computed: AtomicU64::new(0),
            }),
        }
    }

    pub fn attach_bus(&self, bus: EventBus) {
        *self.inner.bus.lock().unwrap() = Some(bus);
    }

    /// Route every snapshot through the alert manager's portfolio rules.
    pub fn attach_alerts(&self, alerts: AlertManager) {
        *self.inner.alerts.lock().unwrap() = Some(alerts);
    }

    pub fn state(&self) -> TrackerState {
        self.inner.state()
    }

    pub fn updates_computed(&self) -> u64 {
        self.inner.updates_computed.load(Ordering::Relaxed)
    }

    pub async fn add_holding(&self, holding: HoldingPosition) -> Result<()> {
        holding.validate()?;
        info!(
            target: targets::TRACKER,
            symbol = %holding.symbol,
            quantity = %holding.quantity,
            "holding added"
        );
        self.inner
            .holdings
            .write()
            .await
            .insert(holding.symbol.clone(), holding);
        if self.inner.state() == TrackerState::Running {
            self.recompute().await;
        }
        Ok(())
    }

    pub async fn remove_holding(&self, symbol: &str) -> Result<HoldingPosition> {
        let removed = self
            .inner
            .holdings
            .write()
            .await
            .remove(&symbol.to_uppercase())
            .ok_or_else(|| Error::HoldingNotFound(symbol.to_string()))?;
        if self.inner.state() == TrackerState::Running {
            self.recompute().await;
        }
        Ok(removed)
    }

    pub async fn update_quantity(&self, symbol: &str, quantity: Decimal) -> Result<()> {
        if quantity < Decimal::ZERO {
            return Err(Error::invalid_config("quantity cannot be negative"));
        }
        {
            let mut holdings = self.inner.holdings.write().await;
            let holding = holdings
                .get_mut(&symbol.to_uppercase())
                .ok_or_else(|| Error::HoldingNotFound(symbol.to_string()))?;
            holding.quantity = quantity;
        }
        if self.inner.state() == TrackerState::Running {
            self.recompute().await;
        }
        Ok(())
    }

    pub async fn holdings(&self) -> Vec<HoldingPosition> {
        self.inner.holdings.read().await.values().cloned().collect()
    }

    pub fn latest_metrics(&self) -> Option<PortfolioMetrics> {
        self.inner.latest.lock().unwrap().clone()
    }

    /// The most recent `limit` snapshots, oldest first.
    pub fn metrics_history(&self, limit: usize) -> Vec<PortfolioMetrics> {
        let history = self.inner.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Per-holding valuations from the current price cache. Holdings
    /// without a cached price are omitted.
    pub async fn holding_updates(&self) -> Vec<HoldingUpdate> {
        let holdings = self.inner.holdings.read().await;
        let prices = self.inner.prices.read().await;
        holdings
            .values()
            .filter_map(|h| {
                let tick = prices.get(&h.symbol)?;
                Some(HoldingUpdate::from_price(
                    h,
                    tick.price,
                    tick.change_percent_24h,
                ))
            })
            .collect()
    }

    /// Each subscriber gets every snapshot from this point on.
    pub fn subscribe_updates(&self) -> UnboundedReceiver<PortfolioMetrics> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Start consuming `ticks`. Idempotent while running.
    pub async fn start(&self, ticks: UnboundedReceiver<PriceTick>) -> Result<()> {
        self.inner.config.validate()?;
        match self.inner.state() {
            TrackerState::Stopped => {}
            TrackerState::Running | TrackerState::Starting => return Ok(()),
            state => {
                return Err(Error::InvalidState {
                    component: "tracker".to_string(),
                    state: state.to_string(),
                })
            }
        }
        self.inner.set_state(TrackerState::Starting);
        info!(target: targets::TRACKER, mode = ?self.inner.config.mode, "tracker starting");

        self.recompute().await;
        self.inner.set_state(TrackerState::Running);

        let inner = self.inner.clone();
        let tracker = self.clone();
        tokio::spawn(async move {
            match inner.config.mode {
                TrackerMode::Continuous => tracker.run_continuous(ticks).await,
                TrackerMode::Interval => tracker.run_interval(ticks).await,
            }
            // An exit nobody asked for leaves the tracker in Error
            if inner.state() == TrackerState::Stopping {
                inner.set_state(TrackerState::Stopped);
            } else {
                inner.set_state(TrackerState::Error);
            }
            debug!(target: targets::TRACKER, "tracker loop exited");
        });
        Ok(())
    }

    pub fn stop(&self) {
        match self.inner.state() {
            TrackerState::Running => {
                info!(target: targets::TRACKER, "tracker stopping");
                self.inner.set_state(TrackerState::Stopping);
                // notify_one stores a permit so a loop between polls still stops
                self.inner.stop_notify.notify_one();
            }
            TrackerState::Error => self.inner.set_state(TrackerState::Stopped),
            _ => {}
        }
    }

    /// Recompute immediately, outside the normal drive cycle.
    pub async fn force_update(&self) -> Result<PortfolioMetrics> {
        if self.inner.state() != TrackerState::Running {
            return Err(Error::NotRunning("tracker".to_string()));
        }
        self.recompute().await;
        self.latest_metrics()
            .ok_or_else(|| Error::NotRunning("tracker".to_string()))
    }

    async fn run_continuous(&self, mut ticks: UnboundedReceiver<PriceTick>) {
        loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => break,
                tick = ticks.recv() => {
                    let Some(tick) = tick else {
                        warn!(target: targets::TRACKER, "tick stream closed");
                        break;
                    };
                    let held = self.absorb_tick(tick).await;
                    if held {
                        self.recompute().await;
                    }
                }
            }
        }
    }

    async fn run_interval(&self, mut ticks: UnboundedReceiver<PriceTick>) {
        // The startup snapshot already ran; first timer fire waits a full period
        let period = self.inner.config.update_interval;
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => break,
                _ = timer.tick() => self.recompute().await,
                tick = ticks.recv() => {
                    let Some(tick) = tick else {
                        warn!(target: targets::TRACKER, "tick stream closed");
                        break;
                    };
                    self.absorb_tick(tick).await;
                }
            }
        }
    }

    /// Cache a tick, reporting whether its symbol is currently held.
    async fn absorb_tick(&self, tick: PriceTick) -> bool {
        let held = self.inner.holdings.read().await.contains_key(&tick.symbol);
        self.inner.prices.write().await.insert(tick.symbol.clone(), tick);
        held
    }

    async fn recompute(&self) {
        let snapshot = {
            let holdings = self.inner.holdings.read().await;
            let prices = self.inner.prices.read().await;
            let holdings: Vec<HoldingPosition> = holdings.values().cloned().collect();
            let baseline = *self.inner.baseline.lock().unwrap();
            self.inner.engine.compute_snapshot(&holdings, &prices, baseline)
        };

        {
            let mut baseline = self.inner.baseline.lock().unwrap();
            if baseline.is_none() && !snapshot.total_value.is_zero() {
                *baseline = Some(snapshot.total_value);
            }
        }

        // Snapshot timestamps never move backwards.
        let snapshot = {
            let mut latest = self.inner.latest.lock().unwrap();
            let mut snapshot = snapshot;
            if let Some(prev) = latest.as_ref() {
                if snapshot.timestamp < prev.timestamp {
                    snapshot.timestamp = prev.timestamp;
                }
            }
            *latest = Some(snapshot.clone());
            snapshot
        };
        {
            let mut history = self.inner.history.lock().unwrap();
            if history.len() == self.inner.config.history_capacity {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }
        self.inner.updates_computed.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(snapshot.clone()).is_ok());

        let bus = self.inner.bus.lock().unwrap().clone();
        if let Some(bus) = bus {
            let updates = self.holding_updates().await;
            bus.publish_portfolio_update(&snapshot, &updates);
        }

        let alerts = self.inner.alerts.lock().unwrap().clone();
        if let Some(alerts) = alerts {
            alerts.evaluate_portfolio(&snapshot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::FeedProvider;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, price: Decimal) -> PriceTick {
        PriceTick::new(symbol, price, FeedProvider::Mock)
    }

    #[tokio::test]
    async fn test_holding_bookkeeping() {
        let tracker = PortfolioTracker::default();
        tracker
            .add_holding(HoldingPosition::new("btc", dec!(2), dec!(30000)))
            .await
            .unwrap();
        tracker.update_quantity("BTC", dec!(3)).await.unwrap();
        assert_eq!(tracker.holdings().await[0].quantity, dec!(3));

        let removed = tracker.remove_holding("btc").await.unwrap();
        assert_eq!(removed.symbol, "BTC");
        assert!(matches!(
            tracker.remove_holding("BTC").await.unwrap_err(),
            Error::HoldingNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_holding_rejected() {
        let tracker = PortfolioTracker::default();
        let err = tracker
            .add_holding(HoldingPosition::new("BTC", dec!(-1), dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_continuous_mode_recomputes_per_held_tick() {
        let tracker = PortfolioTracker::default();
        tracker
            .add_holding(HoldingPosition::new("BTC", dec!(1), dec!(40000)))
            .await
            .unwrap();
        let mut updates = tracker.subscribe_updates();

        let (tx, rx) = mpsc::unbounded_channel();
        tracker.start(rx).await.unwrap();
        // startup snapshot
        let first = updates.recv().await.unwrap();
        assert_eq!(first.total_value, dec!(40000));

        tx.send(tick("BTC", dec!(50000))).unwrap();
        let next = updates.recv().await.unwrap();
        assert_eq!(next.total_value, dec!(50000));
        assert_eq!(next.total_return, dec!(10000));

        // unrelated symbol refreshes the cache without a snapshot
        tx.send(tick("DOGE", dec!(1))).unwrap();
        tx.send(tick("BTC", dec!(51000))).unwrap();
        let next = updates.recv().await.unwrap();
        assert_eq!(next.total_value, dec!(51000));

        tracker.stop();
    }

    #[tokio::test]
    async fn test_baseline_from_first_valued_snapshot() {
        let tracker = PortfolioTracker::default();
        tracker
            .add_holding(HoldingPosition::new("BTC", dec!(1), dec!(40000)))
            .await
            .unwrap();
        let mut updates = tracker.subscribe_updates();
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.start(rx).await.unwrap();
        updates.recv().await.unwrap();

        // daily pnl is measured from the 40000 startup value
        tx.send(tick("BTC", dec!(44000))).unwrap();
        let next = updates.recv().await.unwrap();
        assert_eq!(next.daily_pnl, dec!(4000));
        assert_eq!(next.daily_pnl_percentage, dec!(10));

        tracker.stop();
    }

    #[tokio::test]
    async fn test_interval_mode_cycle_count() {
        let tracker = PortfolioTracker::new(TrackerConfig {
            mode: TrackerMode::Interval,
            update_interval: Duration::from_millis(50),
            ..TrackerConfig::default()
        });
        tracker
            .add_holding(HoldingPosition::new("BTC", dec!(1), dec!(100)))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.start(rx).await.unwrap();

        // ticks arrive much faster than the timer
        let feeder = tokio::spawn(async move {
            for i in 0..40u32 {
                if tx.send(tick("BTC", dec!(100) + Decimal::from(i))).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(220)).await;
        tracker.stop();
        feeder.abort();

        // startup snapshot + ~4 timer cycles; the first fire waits a full period
        let computed = tracker.updates_computed();
        assert!((4..=6).contains(&computed), "computed {computed} cycles");
    }

    #[tokio::test]
    async fn test_interval_zero_rejected() {
        let tracker = PortfolioTracker::new(TrackerConfig {
            mode: TrackerMode::Interval,
            update_interval: Duration::ZERO,
            ..TrackerConfig::default()
        });
        let (_tx, rx) = mpsc::unbounded_channel::<PriceTick>();
        assert!(tracker.start(rx).await.is_err());
    }

    #[tokio::test]
    async fn test_force_update_requires_running() {
        let tracker = PortfolioTracker::default();
        assert!(matches!(
            tracker.force_update().await.unwrap_err(),
            Error::NotRunning(_)
        ));

        tracker
            .add_holding(HoldingPosition::new("BTC", dec!(1), dec!(100)))
            .await
            .unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        tracker.start(rx).await.unwrap();
        let metrics = tracker.force_update().await.unwrap();
        assert_eq!(metrics.total_value, dec!(100));
        tracker.stop();
    }

    #[tokio::test]
    async fn test_history_bounded_and_ordered() {
        let tracker = PortfolioTracker::new(TrackerConfig {
            history_capacity: 3,
            ..TrackerConfig::default()
        });
        tracker
            .add_holding(HoldingPosition::new("BTC", dec!(1), dec!(100)))
            .await
            .unwrap();
        let mut updates = tracker.subscribe_updates();
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.start(rx).await.unwrap();
        updates.recv().await.unwrap();

        for i in 1..=4u32 {
            tx.send(tick("BTC", dec!(100) + Decimal::from(i))).unwrap();
            updates.recv().await.unwrap();
        }
        tracker.stop();

        // 5 snapshots computed, 3 retained, newest last
        let history = tracker.metrics_history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].total_value, dec!(104));
        assert_eq!(tracker.metrics_history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_tick_stream_is_an_error() {
        let tracker = PortfolioTracker::default();
        let (tx, rx) = mpsc::unbounded_channel::<PriceTick>();
        tracker.start(rx).await.unwrap();
        drop(tx);

        for _ in 0..100 {
            if tracker.state() == TrackerState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.state(), TrackerState::Error);

        // stop from Error clears the fault
        tracker.stop();
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_returns_to_stopped() {
        let tracker = PortfolioTracker::default();
        let (_tx, rx) = mpsc::unbounded_channel::<PriceTick>();
        tracker.start(rx).await.unwrap();
        assert_eq!(tracker.state(), TrackerState::Running);

        tracker.stop();
        for _ in 0..100 {
            if tracker.state() == TrackerState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }
}
