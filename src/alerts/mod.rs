//! Alert rules, evaluation, and notification delivery.

mod manager;
mod notify;
mod rules;

pub use manager::{AlertManager, AlertManagerConfig};
pub use notify::{
    ConsoleNotifier, FileNotifier, NotificationHandler, SlackNotifier, WebhookNotifier,
};
pub use rules::{Alert, AlertKind, AlertRule, AlertSeverity};
