//! Multi-provider price aggregation.
//!
//! Merges ticks from one primary and any number of fallback providers
//! into a single stream, keeps the latest tick per symbol, and runs a
//! staleness monitor: a symbol unseen for longer than the threshold is
//! flagged and logged. Staleness is a monitoring signal only; providers
//! are never failed over automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::feeds::tick::{FeedProvider, PriceFeed, PriceTick, TickFanout};
use crate::logging::targets;

/// Aggregator tuning knobs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// A symbol unseen for this long is stale (default: 60s)
    pub stale_threshold: Duration,
    /// Staleness sweep cadence (default: 30s)
    pub check_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(60),
            check_interval: Duration::from_secs(30),
        }
    }
}

/// Registration status of one provider.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub provider: FeedProvider,
    pub is_primary: bool,
    pub running: bool,
}

struct ProviderEntry {
    feed: Arc<dyn PriceFeed>,
    is_primary: bool,
}

struct AggregatorInner {
    config: AggregatorConfig,
    providers: RwLock<Vec<ProviderEntry>>,
    fanout: TickFanout,
    running: AtomicBool,
    stop_notify: Notify,
    last_seen: StdMutex<HashMap<String, Instant>>,
    latest: StdMutex<HashMap<String, PriceTick>>,
}

/// Merges provider feeds and watches for stale symbols.
#[derive(Clone)]
pub struct PriceFeedAggregator {
    inner: Arc<AggregatorInner>,
}

impl PriceFeedAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                config,
                providers: RwLock::new(Vec::new()),
                fanout: TickFanout::default(),
                running: AtomicBool::new(false),
                stop_notify: Notify::new(),
                last_seen: StdMutex::new(HashMap::new()),
                latest: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a provider. At most one may be primary; the provider
    /// tag must be unique. On a running aggregator the feed is started
    /// and merged immediately.
    pub async fn add_provider(&self, feed: Arc<dyn PriceFeed>, is_primary: bool) -> Result<()> {
        let mut providers = self.inner.providers.write().await;
        if providers.iter().any(|p| p.feed.provider() == feed.provider()) {
            return Err(Error::DuplicateProvider(feed.provider().to_string()));
        }
        if is_primary && providers.iter().any(|p| p.is_primary) {
            return Err(Error::invalid_config("primary provider already registered"));
        }
        if self.is_running() {
            self.wire_feed(&feed).await?;
        }
        info!(
            target: targets::FEEDS,
            provider = %feed.provider(),
            is_primary,
            "provider registered"
        );
        providers.push(ProviderEntry { feed, is_primary });
        Ok(())
    }

    /// Stop a provider and drop its registration. Its merge task exits
    /// when the feed's tick stream closes.
    pub async fn remove_provider(&self, provider: FeedProvider) -> Result<()> {
        let mut providers = self.inner.providers.write().await;
        let idx = providers
            .iter()
            .position(|p| p.feed.provider() == provider)
            .ok_or_else(|| Error::ProviderNotFound(provider.to_string()))?;
        let entry = providers.remove(idx);
        drop(providers);
        entry.feed.stop().await;
        info!(target: targets::FEEDS, provider = %provider, "provider removed");
        Ok(())
    }

    /// Start the feed and spawn the task that merges its ticks into
    /// the shared fanout.
    async fn wire_feed(&self, feed: &Arc<dyn PriceFeed>) -> Result<()> {
        feed.start().await?;
        let mut rx = feed.subscribe_ticks();
        let agg = self.clone();
        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                agg.record(&tick);
                agg.inner.fanout.send(&tick);
            }
        });
        Ok(())
    }

    /// Start every provider, the merge tasks, and the staleness sweep.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let providers = self.inner.providers.read().await;
        for entry in providers.iter() {
            self.wire_feed(&entry.feed).await?;
        }
        drop(providers);

        let agg = self.clone();
        tokio::spawn(async move { agg.staleness_loop().await });
        info!(target: targets::FEEDS, "aggregator started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.inner.stop_notify.notify_waiters();
        let providers = self.inner.providers.read().await;
        for entry in providers.iter() {
            entry.feed.stop().await;
        }
        info!(target: targets::FEEDS, "aggregator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Merged tick stream across all providers.
    pub fn subscribe_ticks(&self) -> mpsc::UnboundedReceiver<PriceTick> {
        self.inner.fanout.subscribe()
    }

    /// Latest observed tick for a symbol, from any provider.
    pub fn latest(&self, symbol: &str) -> Option<PriceTick> {
        self.inner.latest.lock().unwrap().get(symbol).cloned()
    }

    /// Symbols whose last tick is older than the staleness threshold.
    pub fn stale_symbols(&self) -> Vec<String> {
        let threshold = self.inner.config.stale_threshold;
        let seen = self.inner.last_seen.lock().unwrap();
        seen.iter()
            .filter(|(_, at)| at.elapsed() > threshold)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        self.inner
            .providers
            .read()
            .await
            .iter()
            .map(|entry| ProviderStatus {
                provider: entry.feed.provider(),
                is_primary: entry.is_primary,
                running: entry.feed.is_running(),
            })
            .collect()
    }

    fn record(&self, tick: &PriceTick) {
        self.inner
            .last_seen
            .lock()
            .unwrap()
            .insert(tick.symbol.clone(), Instant::now());
        self.inner
            .latest
            .lock()
            .unwrap()
            .insert(tick.symbol.clone(), tick.clone());
    }

    async fn staleness_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => return,
                _ = ticker.tick() => {}
            }
            if !self.is_running() {
                return;
            }
            let stale = self.stale_symbols();
            if !stale.is_empty() {
                warn!(
                    target: targets::FEEDS,
                    symbols = ?stale,
                    threshold_secs = self.inner.config.stale_threshold.as_secs_f64(),
                    "stale price data"
                );
            }
        }
    }
}
