//! Mock price feed.
//!
//! Random-walk generator for demos and tests. Each tick moves a symbol
//! by up to ±50 bps; a fixed seed makes the walk reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::info;

use crate::errors::Result;
use crate::feeds::tick::{FeedProvider, PriceFeed, PriceTick, TickFanout};
use crate::logging::targets;

/// Mock feed settings.
#[derive(Debug, Clone)]
pub struct MockFeedConfig {
    /// Cadence of generated ticks (default: 1s)
    pub tick_interval: Duration,
    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Starting price for symbols without an explicit base
    pub default_price: Decimal,
}

impl Default for MockFeedConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            seed: None,
            default_price: Decimal::ONE_HUNDRED,
        }
    }
}

struct MockInner {
    config: MockFeedConfig,
    fanout: TickFanout,
    running: AtomicBool,
    stop_notify: Notify,
    /// symbol -> current price
    prices: RwLock<HashMap<String, Decimal>>,
    rng: Mutex<StdRng>,
}

/// Random-walk price feed.
#[derive(Clone)]
pub struct MockFeed {
    inner: Arc<MockInner>,
}

impl MockFeed {
    pub fn new(config: MockFeedConfig, base_prices: HashMap<String, Decimal>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(MockInner {
                config,
                fanout: TickFanout::default(),
                running: AtomicBool::new(false),
                stop_notify: Notify::new(),
                prices: RwLock::new(
                    base_prices
                        .into_iter()
                        .map(|(s, p)| (s.to_uppercase(), p))
                        .collect(),
                ),
                rng: Mutex::new(rng),
            }),
        }
    }

    async fn emit_round(&self) {
        let mut prices = self.inner.prices.write().await;
        let mut rng = self.inner.rng.lock().await;
        for (symbol, price) in prices.iter_mut() {
            // ±50 bps step
            let bps: i64 = rng.gen_range(-50..=50);
            let next = *price * (Decimal::new(10_000 + bps, 0) / Decimal::new(10_000, 0));
            let change = next - *price;
            let percent = if price.is_zero() {
                Decimal::ZERO
            } else {
                change / *price * Decimal::ONE_HUNDRED
            };
            *price = next;

            let tick = PriceTick::new(symbol.clone(), next, FeedProvider::Mock)
                .with_change(change, percent);
            self.inner.fanout.send(&tick);
        }
    }
}

#[async_trait]
impl PriceFeed for MockFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Mock
    }

    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!(target: targets::FEEDS, "mock feed started");
        let feed = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(feed.inner.config.tick_interval);
            loop {
                tokio::select! {
                    _ = feed.inner.stop_notify.notified() => return,
                    _ = ticker.tick() => {}
                }
                if !feed.inner.running.load(Ordering::Relaxed) {
                    return;
                }
                feed.emit_round().await;
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        if self.inner.running.swap(false, Ordering::Relaxed) {
            self.inner.stop_notify.notify_waiters();
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    fn subscribe_ticks(&self) -> mpsc::UnboundedReceiver<PriceTick> {
        self.inner.fanout.subscribe()
    }

    async fn add_symbols(&self, symbols: &[String]) -> Result<()> {
        let mut prices = self.inner.prices.write().await;
        for symbol in symbols {
            prices
                .entry(symbol.to_uppercase())
                .or_insert(self.inner.config.default_price);
        }
        Ok(())
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        let mut prices = self.inner.prices.write().await;
        for symbol in symbols {
            prices.remove(&symbol.to_uppercase());
        }
        Ok(())
    }

    async fn symbols(&self) -> Vec<String> {
        self.inner.prices.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_feed(interval: Duration) -> MockFeed {
        let mut prices = HashMap::new();
        prices.insert("BTC".to_string(), dec!(50000));
        MockFeed::new(
            MockFeedConfig {
                tick_interval: interval,
                seed: Some(42),
                ..Default::default()
            },
            prices,
        )
    }

    #[tokio::test]
    async fn test_emits_ticks() {
        let feed = btc_feed(Duration::from_millis(5));
        let mut rx = feed.subscribe_ticks();
        feed.start().await.unwrap();

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol, "BTC");
        assert_eq!(tick.source, FeedProvider::Mock);
        assert!(tick.price > Decimal::ZERO);
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_walk_stays_within_step() {
        let feed = btc_feed(Duration::from_millis(1));
        let mut rx = feed.subscribe_ticks();
        feed.start().await.unwrap();

        let mut prev = dec!(50000);
        for _ in 0..10 {
            let tick = rx.recv().await.unwrap();
            let move_bps = ((tick.price - prev) / prev * dec!(10000)).abs();
            assert!(move_bps <= dec!(50.01), "step too large: {move_bps} bps");
            prev = tick.price;
        }
        feed.stop().await;
    }

    #[tokio::test]
    async fn test_add_remove_symbols() {
        let feed = btc_feed(Duration::from_secs(60));
        feed.add_symbols(&["eth".to_string()]).await.unwrap();
        let mut symbols = feed.symbols().await;
        symbols.sort();
        assert_eq!(symbols, vec!["BTC", "ETH"]);

        feed.remove_symbols(&["BTC".to_string()]).await.unwrap();
        assert_eq!(feed.symbols().await, vec!["ETH"]);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let feed = btc_feed(Duration::from_millis(50));
        feed.start().await.unwrap();
        feed.start().await.unwrap();
        assert!(feed.is_running());
        feed.stop().await;
        assert!(!feed.is_running());
    }
}
