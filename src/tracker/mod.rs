//! Portfolio holdings, valuation metrics, and the live tracker.

mod holdings;
mod metrics;
mod tracker;

pub use holdings::{HoldingPosition, HoldingUpdate};
pub use metrics::{BasicMetricsEngine, MetricsEngine, PortfolioMetrics};
pub use tracker::{PortfolioTracker, TrackerConfig, TrackerMode, TrackerState};
