//! Coinbase ticker feed.
//!
//! One supervised stream for all symbols. The subscribe payload is sent
//! on every established session, so reconnects pick the channel set
//! back up automatically.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::feeds::tick::{FeedProvider, PriceFeed, PriceTick, TickFanout};
use crate::logging::targets;
use crate::stream::{ConnectionConfig, StreamConnection, StreamSupervisor, SupervisorConfig};

const STREAM_ID: &str = "coinbase";

/// Coinbase endpoint settings.
#[derive(Debug, Clone)]
pub struct CoinbaseFeedConfig {
    pub ws_url: String,
    /// Quote currency for product ids (`BTC-USD`)
    pub quote: String,
}

impl Default for CoinbaseFeedConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            quote: "USD".to_string(),
        }
    }
}

struct CoinbaseInner {
    config: CoinbaseFeedConfig,
    supervisor: StreamSupervisor,
    fanout: TickFanout,
    running: AtomicBool,
    symbols: RwLock<HashSet<String>>,
}

/// Price feed over Coinbase's public ticker channel.
#[derive(Clone)]
pub struct CoinbaseFeed {
    inner: Arc<CoinbaseInner>,
}

impl CoinbaseFeed {
    pub fn new(config: CoinbaseFeedConfig, symbols: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Arc::new(CoinbaseInner {
                config,
                supervisor: StreamSupervisor::new(SupervisorConfig::default()),
                fanout: TickFanout::default(),
                running: AtomicBool::new(false),
                symbols: RwLock::new(symbols.into_iter().map(|s| s.to_uppercase()).collect()),
            }),
        }
    }

    fn product_id(&self, symbol: &str) -> String {
        format!("{}-{}", symbol.to_uppercase(), self.inner.config.quote)
    }

    async fn subscribe_payload(&self, channel_type: &str) -> Value {
        let products: Vec<String> = self
            .inner
            .symbols
            .read()
            .await
            .iter()
            .map(|s| self.product_id(s))
            .collect();
        json!({
            "type": channel_type,
            "product_ids": products,
            "channels": ["ticker"],
        })
    }

    async fn send_subscribe(&self, conn: &StreamConnection) {
        let payload = self.subscribe_payload("subscribe").await;
        if let Err(e) = conn.send_json(&payload) {
            warn!(target: targets::FEEDS, error = %e, "coinbase subscribe failed");
        }
    }
}

/// Normalize a Coinbase `ticker` frame. The 24h change is derived from
/// `open_24h` since Coinbase does not send it directly.
fn parse_ticker(raw: &Value, quote: &str) -> Option<PriceTick> {
    if raw.get("type")?.as_str()? != "ticker" {
        return None;
    }
    let product = raw.get("product_id")?.as_str()?;
    let symbol = product
        .strip_suffix(&format!("-{quote}"))
        .unwrap_or(product)
        .to_string();
    let price = Decimal::from_str(raw.get("price")?.as_str()?).ok()?;

    let open = raw
        .get("open_24h")
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s).ok());
    let (change, percent) = match open {
        Some(open) if !open.is_zero() => {
            let change = price - open;
            (Some(change), Some(change / open * Decimal::ONE_HUNDRED))
        }
        _ => (None, None),
    };

    Some(PriceTick {
        symbol,
        price,
        volume_24h: raw
            .get("volume_24h")
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok()),
        change_24h: change,
        change_percent_24h: percent,
        timestamp: Utc::now(),
        source: FeedProvider::Coinbase,
    })
}

#[async_trait]
impl PriceFeed for CoinbaseFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Coinbase
    }

    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.inner.supervisor.start().await?;

        let config = ConnectionConfig {
            stream_id: STREAM_ID.to_string(),
            url: self.inner.config.ws_url.clone(),
            symbols: self.symbols().await,
            ..Default::default()
        };
        let conn = self.inner.supervisor.add_connection(
            StreamConnection::new(config)?,
        ).await?;

        // Re-subscribe on every session, reconnects included
        let feed = self.clone();
        let session_conn = conn.clone();
        let mut sessions = conn.session_updates();
        tokio::spawn(async move {
            // The initial session may already be up; send right away.
            if *sessions.borrow_and_update() > 0 {
                feed.send_subscribe(&session_conn).await;
            }
            while sessions.changed().await.is_ok() {
                feed.send_subscribe(&session_conn).await;
            }
        });

        let mut rx = conn.subscribe();
        let feed = self.clone();
        let quote = self.inner.config.quote.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                match parse_ticker(&raw, &quote) {
                    Some(tick) => feed.inner.fanout.send(&tick),
                    None => debug!(target: targets::FEEDS, "non-ticker coinbase frame"),
                }
            }
        });
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
        {
            let mut set = self.inner.symbols.write().await;
            for symbol in symbols {
                set.insert(symbol.to_uppercase());
            }
        }
        if self.is_running() {
            if let Some(conn) = self.inner.supervisor.connection(STREAM_ID).await {
                self.send_subscribe(&conn).await;
            }
        }
        Ok(())
    }

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()> {
        let removed: Vec<String> = {
            let mut set = self.inner.symbols.write().await;
            symbols
                .iter()
                .map(|s| s.to_uppercase())
                .filter(|s| set.remove(s))
                .collect()
        };
        if self.is_running() && !removed.is_empty() {
            if let Some(conn) = self.inner.supervisor.connection(STREAM_ID).await {
                let payload = json!({
                    "type": "unsubscribe",
                    "product_ids": removed
                        .iter()
                        .map(|s| self.product_id(s))
                        .collect::<Vec<_>>(),
                    "channels": ["ticker"],
                });
                if let Err(e) = conn.send_json(&payload) {
                    warn!(target: targets::FEEDS, error = %e, "coinbase unsubscribe failed");
                }
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

    #[test]
    fn test_parse_ticker_with_change() {
        let raw = json!({
            "type": "ticker",
            "product_id": "BTC-USD",
            "price": "51000.00",
            "open_24h": "50000.00",
            "volume_24h": "888.8"
        });
        let tick = parse_ticker(&raw, "USD").unwrap();
        assert_eq!(tick.symbol, "BTC");
        assert_eq!(tick.price, dec!(51000.00));
        assert_eq!(tick.change_24h, Some(dec!(1000.00)));
        assert_eq!(tick.change_percent_24h, Some(dec!(2)));
        assert_eq!(tick.source, FeedProvider::Coinbase);
    }

    #[test]
    fn test_parse_ignores_other_message_types() {
        let raw = json!({"type": "subscriptions", "channels": []});
        assert!(parse_ticker(&raw, "USD").is_none());
    }

    #[test]
    fn test_parse_zero_open_skips_change() {
        let raw = json!({
            "type": "ticker",
            "product_id": "ETH-USD",
            "price": "3000",
            "open_24h": "0"
        });
        let tick = parse_ticker(&raw, "USD").unwrap();
        assert_eq!(tick.change_24h, None);
        assert_eq!(tick.change_percent_24h, None);
    }

    #[tokio::test]
    async fn test_subscribe_payload() {
        let feed = CoinbaseFeed::new(CoinbaseFeedConfig::default(), vec!["BTC".to_string()]);
        let payload = feed.subscribe_payload("subscribe").await;
        assert_eq!(payload["type"], "subscribe");
        assert_eq!(payload["product_ids"][0], "BTC-USD");
        assert_eq!(payload["channels"][0], "ticker");
    }
}
