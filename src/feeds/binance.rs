//! Binance ticker feed.
//!
//! One supervised stream per symbol against the combined-quote ticker
//! endpoint (`<symbol><quote>@ticker`). Ticker frames are normalized
//! into [`PriceTick`]s with the quote suffix stripped from the symbol.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::feeds::tick::{FeedProvider, PriceFeed, PriceTick, TickFanout};
use crate::logging::targets;
use crate::stream::{ConnectionConfig, StreamSupervisor, SupervisorConfig};

/// Binance endpoint settings.
#[derive(Debug, Clone)]
pub struct BinanceFeedConfig {
    /// WebSocket base, joined with `<symbol><quote>@ticker`
    pub ws_base: String,
    /// Quote currency appended to each symbol (default: USDT)
    pub quote: String,
}

impl Default for BinanceFeedConfig {
    fn default() -> Self {
        Self {
            ws_base: "wss://stream.binance.com:9443/ws".to_string(),
            quote: "USDT".to_string(),
        }
    }
}

struct BinanceInner {
    config: BinanceFeedConfig,
    supervisor: StreamSupervisor,
    fanout: TickFanout,
    running: AtomicBool,
    symbols: RwLock<HashSet<String>>,
}

/// Price feed over Binance's public ticker streams.
#[derive(Clone)]
pub struct BinanceFeed {
    inner: Arc<BinanceInner>,
}

impl BinanceFeed {
    pub fn new(config: BinanceFeedConfig, symbols: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(BinanceInner {
                config,
                supervisor: StreamSupervisor::new(SupervisorConfig::default()),
                fanout: TickFanout::default(),
                running: AtomicBool::new(false),
                symbols: RwLock::new(symbols.into_iter().map(|s| s.to_uppercase()).collect()),
            }),
        }
    }

    fn stream_id(symbol: &str) -> String {
        format!("binance-{}", symbol.to_lowercase())
    }

    fn stream_url(&self, symbol: &str) -> String {
        format!(
            "{}/{}{}@ticker",
            self.inner.config.ws_base,
            symbol.to_lowercase(),
            self.inner.config.quote.to_lowercase()
        )
    }

    async fn open_stream(&self, symbol: &str) -> Result<()> {
        let config = ConnectionConfig {
            stream_id: Self::stream_id(symbol),
            url: self.stream_url(symbol),
            symbols: vec![symbol.to_string()],
            ..Default::default()
        };
        let conn = self.inner.supervisor.add_stream(config).await?;

        let mut rx = conn.subscribe();
        let feed = self.clone();
        let quote = self.inner.config.quote.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                match parse_ticker(&raw, &quote) {
                    Some(tick) => feed.inner.fanout.send(&tick),
                    None => {
                        debug!(target: targets::FEEDS, "unrecognized binance frame");
                    }
                }
            }
        });
        Ok(())
    }
}

/// Normalize a Binance `24hrTicker` frame.
fn parse_ticker(raw: &Value, quote: &str) -> Option<PriceTick> {
    let pair = raw.get("s")?.as_str()?;
    let symbol = pair
        .strip_suffix(&quote.to_uppercase())
        .unwrap_or(pair)
        .to_string();
    let price = Decimal::from_str(raw.get("c")?.as_str()?).ok()?;

    let mut tick = PriceTick {
        symbol,
        price,
        volume_24h: decimal_field(raw, "v"),
        change_24h: decimal_field(raw, "p"),
        change_percent_24h: decimal_field(raw, "P"),
        timestamp: Utc::now(),
        source: FeedProvider::Binance,
    };
    if tick.symbol.is_empty() {
        tick.symbol = pair.to_string();
    }
    Some(tick)
}

fn decimal_field(raw: &Value, key: &str) -> Option<Decimal> {
    Decimal::from_str(raw.get(key)?.as_str()?).ok()
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Binance
    }

    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.inner.supervisor.start().await?;
        let symbols: Vec<String> = self.inner.symbols.read().await.iter().cloned().collect();
        for symbol in symbols {
            if let Err(e) = self.open_stream(&symbol).await {
                warn!(
                    target: targets::FEEDS,
                    symbol = %symbol,
                    error = %e,
                    "binance stream failed to open"
                );
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.inner.supervisor.stop().await;
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    fn subscribe_ticks(&self) -> mpsc::UnboundedReceiver<PriceTick> {
        self.inner.fanout.subscribe()
    }

    async fn add_symbols(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            let symbol = symbol.to_uppercase();
            if !self.inner.symbols.write().await.insert(symbol.clone()) {
                continue;
            }
            if self.is_running() {
                self.open_stream(&symbol).await?;
            }
        }
        Ok(())
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            let symbol = symbol.to_uppercase();
            if !self.inner.symbols.write().await.remove(&symbol) {
                continue;
            }
            if self.is_running() {
                self.inner
                    .supervisor
                    .remove_stream(&Self::stream_id(&symbol))
                    .await?;
            }
        }
        Ok(())
    }

    async fn symbols(&self) -> Vec<String> {
        self.inner.symbols.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_ticker() {
        let raw = json!({
            "e": "24hrTicker",
            "s": "BTCUSDT",
            "c": "50250.10",
            "v": "12345.6",
            "p": "-150.00",
            "P": "-0.30"
        });
        let tick = parse_ticker(&raw, "USDT").unwrap();
        assert_eq!(tick.symbol, "BTC");
        assert_eq!(tick.price, dec!(50250.10));
        assert_eq!(tick.volume_24h, Some(dec!(12345.6)));
        assert_eq!(tick.change_percent_24h, Some(dec!(-0.30)));
        assert_eq!(tick.source, FeedProvider::Binance);
    }

    #[test]
    fn test_parse_ticker_rejects_junk() {
        assert!(parse_ticker(&json!({"s": "BTCUSDT"}), "USDT").is_none());
        assert!(parse_ticker(&json!({"c": "1.0"}), "USDT").is_none());
        assert!(parse_ticker(&json!({"s": "BTCUSDT", "c": "not-a-number"}), "USDT").is_none());
    }

    #[test]
    fn test_stream_url() {
        let feed = BinanceFeed::new(BinanceFeedConfig::default(), vec!["BTC".to_string()]);
        assert_eq!(
            feed.stream_url("BTC"),
            "wss://stream.binance.com:9443/ws/btcusdt@ticker"
        );
        assert_eq!(BinanceFeed::stream_id("BTC"), "binance-btc");
    }

    #[tokio::test]
    async fn test_symbol_bookkeeping() {
        let feed = BinanceFeed::new(BinanceFeedConfig::default(), vec!["BTC".to_string()]);
        feed.add_symbols(&["eth".to_string()]).await.unwrap();
        let mut symbols = feed.symbols().await;
        symbols.sort();
        assert_eq!(symbols, vec!["BTC", "ETH"]);

        feed.remove_symbols(&["BTC".to_string()]).await.unwrap();
        assert_eq!(feed.symbols().await, vec!["ETH"]);
    }
}
