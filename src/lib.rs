#![deny(unreachable_pub)]

// Core modules
mod errors;
pub mod logging;

// Feature modules
pub mod alerts;
pub mod events;
pub mod feeds;
pub mod service;
pub mod stream;
pub mod tracker;

// Re-exports
pub use alerts::{Alert, AlertKind, AlertManager, AlertRule, AlertSeverity, NotificationHandler};
pub use errors::{Error, ParseError, Result, TransportError};
pub use events::{EventBus, EventFilter, EventHandler, EventKind, StreamEvent};
pub use feeds::{FeedProvider, PriceFeed, PriceFeedAggregator, PriceTick};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use service::{MonitoringConfig, MonitoringService, ServiceStatus};
pub use stream::{ConnectionConfig, ConnectionState, StreamConnection, StreamSupervisor};
pub use tracker::{HoldingPosition, PortfolioMetrics, PortfolioTracker, TrackerConfig, TrackerMode};
