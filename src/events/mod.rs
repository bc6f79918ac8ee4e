//! Bounded pub/sub event distribution.

mod bus;
mod event;
mod filter;

pub use bus::{BusConfig, BusStats, EventBus, EventHandler, FnHandler, SubscriptionStats};
pub use event::{EventKind, StreamEvent};
pub use filter::EventFilter;
