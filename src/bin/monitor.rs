//! Portfolio monitor CLI
//!
//! Wires a price feed, the portfolio tracker, and the alert manager
//! together and runs until interrupted. With `--provider mock` it is
//! fully self-contained; `--provider binance` streams live tickers.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;
use tracing::{error, info};

use portfolio_stream::alerts::{AlertKind, AlertRule, ConsoleNotifier};
use portfolio_stream::feeds::{BinanceFeed, BinanceFeedConfig, MockFeed, MockFeedConfig, PriceFeed};
use portfolio_stream::tracker::{HoldingPosition, TrackerConfig, TrackerMode};
use portfolio_stream::{init_logging, LogConfig, LogFormat, MonitoringConfig, MonitoringService};

#[derive(Parser)]
#[command(name = "monitor")]
#[command(version, about = "Real-time portfolio monitor", long_about = None)]
struct Cli {
    /// Price source
    #[arg(long, value_enum, default_value = "mock")]
    provider: Provider,

    /// Holdings as SYMBOL:QUANTITY:COST_BASIS, repeatable
    #[arg(long = "holding", value_parser = parse_holding)]
    holdings: Vec<HoldingPosition>,

    /// Extra symbols to watch without holding them
    #[arg(long = "watch")]
    watch: Vec<String>,

    /// Alert when a symbol crosses above a price, as SYMBOL:PRICE
    #[arg(long = "price-alert", value_parser = parse_price_alert)]
    price_alerts: Vec<(String, Decimal)>,

    /// Recompute on a timer instead of per tick
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Mock,
    Binance,
}

fn parse_holding(s: &str) -> Result<HoldingPosition, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err("expected SYMBOL:QUANTITY:COST_BASIS".to_string());
    }
    let quantity: Decimal = parts[1].parse().map_err(|_| "bad quantity".to_string())?;
    let cost: Decimal = parts[2].parse().map_err(|_| "bad cost basis".to_string())?;
    let holding = HoldingPosition::new(parts[0], quantity, cost);
    holding.validate().map_err(|e| e.to_string())?;
    Ok(holding)
}

fn parse_price_alert(s: &str) -> Result<(String, Decimal), String> {
    let (symbol, price) = s
        .split_once(':')
        .ok_or_else(|| "expected SYMBOL:PRICE".to_string())?;
    let price: Decimal = price.parse().map_err(|_| "bad price".to_string())?;
    Ok((symbol.to_uppercase(), price))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format,
    });

    if let Err(e) = run(cli).await {
        error!(error = %e, "monitor failed");
        std::process::exit(1);
    }
}

fn tracker_config(interval_secs: Option<u64>) -> TrackerConfig {
    match interval_secs {
        Some(secs) => TrackerConfig {
            mode: TrackerMode::Interval,
            update_interval: Duration::from_secs(secs),
            ..TrackerConfig::default()
        },
        None => TrackerConfig::default(),
    }
}

async fn run(cli: Cli) -> portfolio_stream::Result<()> {
    let tracker = tracker_config(cli.interval_secs);
    let service = MonitoringService::new(MonitoringConfig {
        tracker,
        ..MonitoringConfig::default()
    });

    let mut symbols: Vec<String> = cli
        .holdings
        .iter()
        .map(|h| h.symbol.clone())
        .chain(cli.watch.iter().map(|s| s.to_uppercase()))
        .collect();
    symbols.sort();
    symbols.dedup();
    if symbols.is_empty() {
        symbols.push("BTC".to_string());
    }

    match cli.provider {
        Provider::Mock => {
            let feed = Arc::new(MockFeed::new(MockFeedConfig::default(), Default::default()));
            feed.add_symbols(&symbols).await?;
            service.aggregator().add_provider(feed, true).await?;
        }
        Provider::Binance => {
            let feed = Arc::new(BinanceFeed::new(
                BinanceFeedConfig::default(),
                symbols.iter().cloned(),
            ));
            service.aggregator().add_provider(feed, true).await?;
        }
    }

    for holding in cli.holdings {
        service.tracker().add_holding(holding).await?;
    }
    service.alerts().add_handler(Arc::new(ConsoleNotifier)).await;
    for (symbol, price) in cli.price_alerts {
        let rule = AlertRule::new(format!("price-{}", symbol.to_lowercase()), AlertKind::PriceThreshold)
            .with_symbol(&symbol)
            .with_threshold(price)
            .with_cooldown(Duration::from_secs(60));
        service.alerts().add_rule(rule).await?;
    }

    service.start().await?;
    info!(symbols = ?symbols, "monitoring, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| portfolio_stream::Error::invalid_config(e.to_string()))?;

    let stats = service.stats().await;
    info!(
        snapshots = stats.snapshots_computed,
        alerts = stats.alerts_triggered,
        events_dropped = stats.bus.dropped,
        "shutting down"
    );
    service.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_config_interval_override() {
        let config = tracker_config(Some(5));
        assert_eq!(config.mode, TrackerMode::Interval);
        assert_eq!(config.update_interval, Duration::from_secs(5));
        assert_eq!(config.history_capacity, TrackerConfig::default().history_capacity);

        let config = tracker_config(None);
        assert_eq!(config.mode, TrackerConfig::default().mode);
    }
}
