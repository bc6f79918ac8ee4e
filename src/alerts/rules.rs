//! Alert rules and triggered alerts.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, Result};

/// What condition a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Portfolio value at or above a threshold
    PortfolioValue,
    /// Absolute total return percentage at or above a threshold
    PercentageChange,
    /// Symbol price at or above a threshold
    PriceThreshold,
    /// Symbol price at or below a threshold; always critical
    StopLoss,
    /// Symbol price at or above a target
    TakeProfit,
    /// 24h volume at or above a threshold
    VolumeSpike,
    /// A single holding dominates the portfolio
    RebalanceNeeded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PortfolioValue => "portfolio_value",
            AlertKind::PercentageChange => "percentage_change",
            AlertKind::PriceThreshold => "price_threshold",
            AlertKind::StopLoss => "stop_loss",
            AlertKind::TakeProfit => "take_profit",
            AlertKind::VolumeSpike => "volume_spike",
            AlertKind::RebalanceNeeded => "rebalance_needed",
        }
    }

    /// Rules of these kinds evaluate against price updates and need a
    /// symbol; the rest evaluate against portfolio metrics.
    pub fn is_price_kind(&self) -> bool {
        matches!(
            self,
            AlertKind::PriceThreshold
                | AlertKind::StopLoss
                | AlertKind::TakeProfit
                | AlertKind::VolumeSpike
        )
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Urgency of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_threshold: Option<Decimal>,
    pub severity: AlertSeverity,
    pub enabled: bool,
    /// Minimum spacing between triggers of this rule per symbol
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

impl AlertRule {
    pub fn new(rule_id: impl Into<String>, kind: AlertKind) -> Self {
        Self {
            rule_id: rule_id.into(),
            kind,
            symbol: None,
            threshold_value: None,
            percentage_threshold: None,
            severity: AlertSeverity::Warning,
            enabled: true,
            cooldown: Duration::from_secs(300),
            metadata: HashMap::new(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into().to_uppercase());
        self
    }

    pub fn with_threshold(mut self, value: Decimal) -> Self {
        self.threshold_value = Some(value);
        self
    }

    pub fn with_percentage(mut self, percent: Decimal) -> Self {
        self.percentage_threshold = Some(percent);
        self
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check that the rule carries the inputs its kind evaluates.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::InvalidRule {
                rule_id: self.rule_id.clone(),
                reason: reason.to_string(),
            })
        };
        if self.rule_id.is_empty() {
            return fail("rule_id must not be empty");
        }
        match self.kind {
            AlertKind::PercentageChange => {
                if self.percentage_threshold.is_none() {
                    return fail("percentage_threshold required");
                }
            }
            AlertKind::RebalanceNeeded => {}
            _ => {
                if self.threshold_value.is_none() {
                    return fail("threshold_value required");
                }
            }
        }
        if self.kind.is_price_kind() && self.symbol.is_none() {
            return fail("symbol required for price rules");
        }
        Ok(())
    }
}

/// A triggered alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    #[serde(rename = "alert_type")]
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_value: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Alert {
    pub fn new(
        rule: &AlertRule,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: format!("{:016x}", rand::random::<u64>()),
            rule_id: rule.rule_id.clone(),
            kind: rule.kind,
            severity,
            title: title.into(),
            message: message.into(),
            symbol: rule.symbol.clone(),
            current_value: None,
            threshold_value: rule.threshold_value,
            timestamp: Utc::now(),
            metadata: rule.metadata.clone(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_value(mut self, value: Decimal) -> Self {
        self.current_value = Some(value);
        self
    }

    pub fn with_threshold(mut self, threshold: Decimal) -> Self {
        self.threshold_value = Some(threshold);
        self
    }
}
