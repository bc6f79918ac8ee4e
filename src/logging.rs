//! Structured logging setup.
//!
//! Component log targets for filtering:
//!
//! | Target | Description |
//! |--------|-------------|
//! | `portfolio_stream::stream` | Connections, supervision, reconnects |
//! | `portfolio_stream::feeds` | Price feed adapters & aggregation |
//! | `portfolio_stream::events` | Event bus dispatch |
//! | `portfolio_stream::alerts` | Rule evaluation & notifications |
//! | `portfolio_stream::tracker` | Portfolio valuation loop |
//! | `portfolio_stream::service` | Monitoring service lifecycle |
//!
//! ```bash
//! # Debug only the reconnection machinery
//! RUST_LOG=portfolio_stream::stream=debug cargo run --bin monitor
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format with colors (default for development)
    #[default]
    Pretty,
    /// JSON format (best for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

/// Logging configuration for the monitoring engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Base level when RUST_LOG is unset (default: "info")
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// Config for development (pretty, info).
    pub fn development() -> Self {
        Self::default()
    }

    /// Config for production (JSON).
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Noisy transport
/// crates are capped at warn unless explicitly raised.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(&config.level)
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap())
            .add_directive("tokio_tungstenite=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap())
    });

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}

/// Log target constants for component-specific logging.
///
/// ```ignore
/// tracing::debug!(target: targets::STREAM, stream_id = %id, "reconnecting");
/// ```
pub mod targets {
    /// Connections, supervision, reconnects
    pub const STREAM: &str = "portfolio_stream::stream";
    /// Price feed adapters & aggregation
    pub const FEEDS: &str = "portfolio_stream::feeds";
    /// Event bus dispatch
    pub const EVENTS: &str = "portfolio_stream::events";
    /// Rule evaluation & notifications
    pub const ALERTS: &str = "portfolio_stream::alerts";
    /// Portfolio valuation loop
    pub const TRACKER: &str = "portfolio_stream::tracker";
    /// Monitoring service lifecycle
    pub const SERVICE: &str = "portfolio_stream::service";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_production() {
        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_log_format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");

        let parsed: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(parsed, LogFormat::Compact);
    }
}
