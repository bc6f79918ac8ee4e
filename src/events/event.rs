//! Event types and wire schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Category of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PriceUpdate,
    PortfolioUpdate,
    AlertTriggered,
    ConnectionStatus,
    SystemStatus,
    MarketData,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::PriceUpdate => "price_update",
            EventKind::PortfolioUpdate => "portfolio_update",
            EventKind::AlertTriggered => "alert_triggered",
            EventKind::ConnectionStatus => "connection_status",
            EventKind::SystemStatus => "system_status",
            EventKind::MarketData => "market_data",
        };
        write!(f, "{s}")
    }
}

/// An event flowing through the bus.
///
/// The wire form is `{"event_type", "data", "timestamp", "source",
/// "event_id", "correlation_id"}` with the optional fields omitted when
/// unset; `from_json(to_json(e)) == e`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl StreamEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            source: None,
            event_id: None,
            correlation_id: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Symbol carried in the payload, when present.
    pub fn symbol(&self) -> Option<&str> {
        self.data.get("symbol").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_round_trip() {
        let event = StreamEvent::new(EventKind::PriceUpdate, json!({"symbol": "BTC", "price": "50000"}))
            .with_source("binance")
            .with_correlation_id("req-7");

        let raw = event.to_json().unwrap();
        let parsed = StreamEvent::from_json(&raw).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_wire_field_names() {
        let event = StreamEvent::new(EventKind::AlertTriggered, json!({}));
        let raw: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(raw["event_type"], "alert_triggered");
        assert!(raw.get("timestamp").is_some());
        // Unset optionals are omitted, not null
        assert!(raw.get("event_id").is_none());
        assert!(raw.get("source").is_none());
    }

    #[test]
    fn test_symbol_extraction() {
        let event = StreamEvent::new(EventKind::PriceUpdate, json!({"symbol": "ETH"}));
        assert_eq!(event.symbol(), Some("ETH"));

        let event = StreamEvent::new(EventKind::SystemStatus, json!({"status": "ok"}));
        assert_eq!(event.symbol(), None);
    }
}
