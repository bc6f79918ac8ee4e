//! Price feeds: provider adapters and aggregation.

mod aggregator;
mod binance;
mod coinbase;
mod mock;
mod tick;

pub use aggregator::{AggregatorConfig, PriceFeedAggregator, ProviderStatus};
pub use binance::{BinanceFeed, BinanceFeedConfig};
pub use coinbase::{CoinbaseFeed, CoinbaseFeedConfig};
pub use mock::{MockFeed, MockFeedConfig};
pub use tick::{FeedProvider, PriceFeed, PriceTick};
