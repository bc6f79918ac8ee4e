//! Supervised streaming transport: connections, reconnection policy,
//! and health supervision.

mod backoff;
mod connection;
mod supervisor;
mod transport;

pub use backoff::{backoff_delay, ReconnectPolicy};
pub use connection::{ConnectionConfig, ConnectionMetrics, ConnectionState, StreamConnection};
pub use supervisor::{StreamSupervisor, SupervisorConfig, SupervisorStats};
pub use transport::{Transport, TransportMessage, TransportStream, WsTransport};
