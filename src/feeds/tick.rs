//! Normalized price ticks and the feed contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::errors::Result;

/// Identity of a price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedProvider {
    Binance,
    Coinbase,
    Mock,
}

impl FeedProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedProvider::Binance => "binance",
            FeedProvider::Coinbase => "coinbase",
            FeedProvider::Mock => "mock",
        }
    }
}

impl std::fmt::Display for FeedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub source: FeedProvider,
}

impl PriceTick {
    pub fn new(symbol: impl Into<String>, price: Decimal, source: FeedProvider) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume_24h: None,
            change_24h: None,
            change_percent_24h: None,
            timestamp: Utc::now(),
            source,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume_24h = Some(volume);
        self
    }

    pub fn with_change(mut self, change: Decimal, percent: Decimal) -> Self {
        self.change_24h = Some(change);
        self.change_percent_24h = Some(percent);
        self
    }
}

/// A source of [`PriceTick`]s for a dynamic symbol set.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn provider(&self) -> FeedProvider;

    /// Begin streaming. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop streaming. Idempotent.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Channel of ticks emitted from now on.
    fn subscribe_ticks(&self) -> mpsc::UnboundedReceiver<PriceTick>;

    async fn add_symbols(&self, symbols: &[String]) -> Result<()>;

    async fn remove_symbols(&self, symbols: &[String]) -> Result<()>;

    async fn symbols(&self) -> Vec<String>;
}

/// Shared tick fan-out. Closed receivers are pruned on send.
#[derive(Default)]
pub(crate) struct TickFanout {
    senders: Mutex<Vec<mpsc::UnboundedSender<PriceTick>>>,
}

impl TickFanout {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<PriceTick> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub(crate) fn send(&self, tick: &PriceTick) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(tick.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tick_serde() {
        let tick = PriceTick::new("BTC", dec!(50000.25), FeedProvider::Binance)
            .with_volume(dec!(1234.5))
            .with_change(dec!(-120.5), dec!(-0.24));

        let raw = serde_json::to_string(&tick).unwrap();
        assert!(raw.contains("\"source\":\"binance\""));
        let parsed: PriceTick = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, tick);
    }

    #[test]
    fn test_fanout_prunes_closed_receivers() {
        let fanout = TickFanout::default();
        let mut rx1 = fanout.subscribe();
        let rx2 = fanout.subscribe();
        drop(rx2);

        fanout.send(&PriceTick::new("ETH", dec!(3000), FeedProvider::Mock));
        assert_eq!(rx1.try_recv().unwrap().symbol, "ETH");
        assert_eq!(fanout.senders.lock().unwrap().len(), 1);
    }
}
