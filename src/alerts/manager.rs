//! Rule evaluation and alert fan-out.
//!
//! The manager keeps a rule table, evaluates price and portfolio
//! updates against it, and enforces a per-`(rule, symbol)` cooldown. A
//! trigger appends to the bounded history, stamps the cooldown, fans
//! out to every enabled notification channel, and publishes an
//! `AlertTriggered` event when a bus is attached.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::alerts::notify::NotificationHandler;
use crate::alerts::rules::{Alert, AlertKind, AlertRule, AlertSeverity};
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::feeds::PriceTick;
use crate::logging::targets;
use crate::tracker::PortfolioMetrics;

/// Allocation share above which a rebalance alert fires.
const REBALANCE_DOMINANCE_PERCENT: u32 = 50;

/// Alert manager sizing.
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Retained alert history capacity
    pub history_capacity: usize,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

type CooldownKey = (String, Option<String>);

struct ManagerInner {
    config: AlertManagerConfig,
    rules: RwLock<HashMap<String, AlertRule>>,
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
    cooldowns: StdMutex<HashMap<CooldownKey, Instant>>,
    history: StdMutex<VecDeque<Alert>>,
    bus: StdMutex<Option<EventBus>>,
    triggered: AtomicU64,
    suppressed: AtomicU64,
}

/// Evaluates alert rules and delivers triggered alerts.
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<ManagerInner>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertManagerConfig::default())
    }
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                rules: RwLock::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
                cooldowns: StdMutex::new(HashMap::new()),
                history: StdMutex::new(VecDeque::new()),
                bus: StdMutex::new(None),
                triggered: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    /// Publish `AlertTriggered` events onto `bus` from now on.
    pub fn attach_bus(&self, bus: EventBus) {
        *self.inner.bus.lock().unwrap() = Some(bus);
    }

    /// Add or replace a rule. Validation failures reject the rule at
    /// this point; evaluation never sees a malformed rule.
    pub async fn add_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;
        info!(
            target: targets::ALERTS,
            rule_id = %rule.rule_id,
            kind = %rule.kind,
            "rule added"
        );
        self.inner.rules.write().await.insert(rule.rule_id.clone(), rule);
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<()> {
        self.inner
            .rules
            .write()
            .await
            .remove(rule_id)
            .ok_or_else(|| Error::RuleNotFound(rule_id.to_string()))?;
        Ok(())
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.inner.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| Error::RuleNotFound(rule_id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.inner.rules.read().await.values().cloned().collect()
    }

    pub async fn add_handler(&self, handler: Arc<dyn NotificationHandler>) {
        self.inner.handlers.write().await.push(handler);
    }

    /// Evaluate price-kind rules against a tick.
    pub async fn evaluate_price_update(&self, tick: &PriceTick) {
        let rules: Vec<AlertRule> = {
            let rules = self.inner.rules.read().await;
            rules
                .values()
                .filter(|r| {
                    r.enabled
                        && r.kind.is_price_kind()
                        && r.symbol.as_deref() == Some(tick.symbol.as_str())
                })
                .cloned()
                .collect()
        };
        for rule in rules {
            if self.on_cooldown(&rule) {
                continue;
            }
            if let Some(alert) = evaluate_price_rule(&rule, tick) {
                self.trigger(&rule, alert).await;
            }
        }
    }

    /// Evaluate portfolio-kind rules against a metrics snapshot.
    pub async fn evaluate_portfolio(&self, metrics: &PortfolioMetrics) {
        let rules: Vec<AlertRule> = {
            let rules = self.inner.rules.read().await;
            rules
                .values()
                .filter(|r| r.enabled && !r.kind.is_price_kind())
                .cloned()
                .collect()
        };
        for rule in rules {
            if self.on_cooldown(&rule) {
                continue;
            }
            if let Some(alert) = evaluate_portfolio_rule(&rule, metrics) {
                self.trigger(&rule, alert).await;
            }
        }
    }

    /// Alerts triggered within the last `window`.
    pub fn recent_alerts(&self, window: Duration) -> Vec<Alert> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let history = self.inner.history.lock().unwrap();
        history
            .iter()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn alerts_triggered(&self) -> u64 {
        self.inner.triggered.load(Ordering::Relaxed)
    }

    pub fn alerts_suppressed(&self) -> u64 {
        self.inner.suppressed.load(Ordering::Relaxed)
    }

    /// Cooldown gate, consulted before any predicate work.
    fn on_cooldown(&self, rule: &AlertRule) -> bool {
        let key = (rule.rule_id.clone(), rule.symbol.clone());
        let cooldowns = self.inner.cooldowns.lock().unwrap();
        match cooldowns.get(&key) {
            Some(last) if last.elapsed() < rule.cooldown => {
                self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    async fn trigger(&self, rule: &AlertRule, alert: Alert) {
        {
            let mut cooldowns = self.inner.cooldowns.lock().unwrap();
            cooldowns.insert((rule.rule_id.clone(), rule.symbol.clone()), Instant::now());
        }
        {
            let mut history = self.inner.history.lock().unwrap();
            if history.len() == self.inner.config.history_capacity {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }
        self.inner.triggered.fetch_add(1, Ordering::Relaxed);
        info!(
            target: targets::ALERTS,
            rule_id = %alert.rule_id,
            severity = %alert.severity,
            title = %alert.title,
            "alert triggered"
        );

        let handlers: Vec<Arc<dyn NotificationHandler>> = {
            let handlers = self.inner.handlers.read().await;
            handlers.iter().filter(|h| h.is_enabled()).cloned().collect()
        };
        for handler in handlers {
            if let Err(e) = handler.send_alert(&alert).await {
                warn!(
                    target: targets::ALERTS,
                    channel = %handler.name(),
                    error = %e,
                    "notification delivery failed"
                );
            }
        }

        let bus = self.inner.bus.lock().unwrap().clone();
        if let Some(bus) = bus {
            bus.publish_alert(&alert);
        }
    }
}

fn evaluate_price_rule(rule: &AlertRule, tick: &PriceTick) -> Option<Alert> {
    let threshold = rule.threshold_value?;
    match rule.kind {
        AlertKind::PriceThreshold if tick.price >= threshold => Some(
            Alert::new(
                rule,
                rule.severity,
                format!("{} above {}", tick.symbol, threshold),
                format!("{} reached {}", tick.symbol, tick.price),
            )
            .with_value(tick.price),
        ),
        // Stop losses escalate regardless of the configured severity
        AlertKind::StopLoss if tick.price <= threshold => Some(
            Alert::new(
                rule,
                AlertSeverity::Critical,
                format!("{} stop loss at {}", tick.symbol, threshold),
                format!("{} fell to {}", tick.symbol, tick.price),
            )
            .with_value(tick.price),
        ),
        AlertKind::TakeProfit if tick.price >= threshold => Some(
            Alert::new(
                rule,
                rule.severity,
                format!("{} take profit at {}", tick.symbol, threshold),
                format!("{} reached {}", tick.symbol, tick.price),
            )
            .with_value(tick.price),
        ),
        AlertKind::VolumeSpike => {
            let volume = tick.volume_24h?;
            if volume >= threshold {
                Some(
                    Alert::new(
                        rule,
                        rule.severity,
                        format!("{} volume spike", tick.symbol),
                        format!("{} 24h volume at {}", tick.symbol, volume),
                    )
                    .with_value(volume),
                )
            } else {
                None
            }
        }
        _ => None,
    }
}

fn evaluate_portfolio_rule(rule: &AlertRule, metrics: &PortfolioMetrics) -> Option<Alert> {
    match rule.kind {
        AlertKind::PortfolioValue => {
            let threshold = rule.threshold_value?;
            if metrics.total_value >= threshold {
                Some(
                    Alert::new(
                        rule,
                        rule.severity,
                        format!("Portfolio above {threshold}"),
                        format!("Portfolio value reached {}", metrics.total_value),
                    )
                    .with_value(metrics.total_value),
                )
            } else {
                None
            }
        }
        AlertKind::PercentageChange => {
            let threshold = rule.percentage_threshold?;
            if metrics.return_percentage.abs() >= threshold {
                Some(
                    Alert::new(
                        rule,
                        rule.severity,
                        format!("Portfolio moved {}%", metrics.return_percentage.round_dp(2)),
                        format!(
                            "Total return {}% crossed the {threshold}% band",
                            metrics.return_percentage.round_dp(2)
                        ),
                    )
                    .with_value(metrics.return_percentage),
                )
            } else {
                None
            }
        }
        AlertKind::RebalanceNeeded => {
            // Dominance heuristic: any single holding above half the
            // portfolio value.
            let limit = Decimal::from(REBALANCE_DOMINANCE_PERCENT);
            let dominant = metrics.allocations.keys().find(|symbol| {
                metrics
                    .allocation_percent(symbol)
                    .is_some_and(|pct| pct > limit)
            })?;
            let pct = metrics.allocation_percent(dominant)?;
            Some(
                Alert::new(
                    rule,
                    rule.severity,
                    "Rebalance suggested".to_string(),
                    format!("{dominant} is {}% of the portfolio", pct.round_dp(1)),
                )
                .with_symbol(dominant.clone())
                .with_value(pct),
            )
        }
        _ => None,
    }
}
