//! Notification channels.
//!
//! Each triggered alert is fanned out to every enabled handler. A
//! failing channel is logged and never blocks the others.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::alerts::rules::{Alert, AlertSeverity};
use crate::errors::{Error, Result};
use crate::logging::targets;

/// Delivery channel for triggered alerts.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Channel name, for logs and error reports.
    fn name(&self) -> &str;

    /// Disabled handlers are skipped during fan-out.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to stdout.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl NotificationHandler for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let tag = match alert.severity {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARN",
            AlertSeverity::Critical => "CRIT",
        };
        println!(
            "[{tag}] {} | {} — {}",
            alert.timestamp.format("%Y-%m-%d %H:%M:%S"),
            alert.title,
            alert.message
        );
        Ok(())
    }
}

/// Appends formatted alert lines to a file.
#[derive(Debug)]
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NotificationHandler for FileNotifier {
    fn name(&self) -> &str {
        "file"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let line = format!(
            "{} [{}] {} {}: {}\n",
            alert.timestamp.to_rfc3339(),
            alert.severity,
            alert.kind,
            alert.title,
            alert.message
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::notification("file", e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::notification("file", e.to_string()))?;
        Ok(())
    }
}

/// POSTs the alert wire JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationHandler for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::notification("webhook", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::notification(
                "webhook",
                format!("endpoint returned {}", response.status()),
            ));
        }
        info!(target: targets::ALERTS, alert_id = %alert.alert_id, "webhook delivered");
        Ok(())
    }
}

/// Posts a Slack attachment to an incoming-webhook URL.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn slack_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "good",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Critical => "danger",
    }
}

#[async_trait]
impl NotificationHandler for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        let payload = json!({
            "attachments": [{
                "color": slack_color(alert.severity),
                "title": alert.title,
                "text": alert.message,
                "footer": alert.kind.as_str(),
                "ts": alert.timestamp.timestamp(),
            }]
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::notification("slack", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::notification(
                "slack",
                format!("slack returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rules::{AlertKind, AlertRule};
    use rust_decimal_macros::dec;

    fn sample_alert() -> Alert {
        let rule = AlertRule::new("r1", AlertKind::PriceThreshold)
            .with_symbol("BTC")
            .with_threshold(dec!(50000));
        Alert::new(&rule, AlertSeverity::Warning, "BTC above 50000", "price crossed")
            .with_value(dec!(50100))
    }

    #[test]
    fn test_slack_colors() {
        assert_eq!(slack_color(AlertSeverity::Info), "good");
        assert_eq!(slack_color(AlertSeverity::Warning), "warning");
        assert_eq!(slack_color(AlertSeverity::Critical), "danger");
    }

    #[tokio::test]
    async fn test_console_notifier() {
        // Console delivery cannot fail
        ConsoleNotifier.send_alert(&sample_alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_notifier_appends() {
        let dir = std::env::temp_dir().join(format!("alerts-test-{:x}", rand::random::<u64>()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("alerts.log");
        let notifier = FileNotifier::new(&path);

        notifier.send_alert(&sample_alert()).await.unwrap();
        notifier.send_alert(&sample_alert()).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("BTC above 50000"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_notifier_bad_path() {
        let notifier = FileNotifier::new("/nonexistent-dir/alerts.log");
        let err = notifier.send_alert(&sample_alert()).await.unwrap_err();
        assert!(matches!(err, Error::Notification { .. }));
    }
}
