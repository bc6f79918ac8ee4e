use thiserror::Error;

/// Transport-level errors (WebSocket connect/send/read).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Reconnection attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

/// Parsing and serialization errors.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Invalid decimal string: {0}")]
    Decimal(String),
    #[error("Unexpected message shape: {0}")]
    MessageShape(String),
}

/// Main error type for the streaming engine.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport failure with classification
    #[error("Transport error ({stream_id}): {kind}")]
    Transport {
        stream_id: String,
        kind: TransportError,
    },

    /// Invalid configuration detected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stream id already registered with the supervisor
    #[error("Stream already exists: {0}")]
    DuplicateStream(String),

    /// Stream id not registered with the supervisor
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Feed provider already registered with the aggregator
    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),

    /// Feed provider not registered with the aggregator
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Subscription id already registered on the bus
    #[error("Subscription already exists: {0}")]
    DuplicateSubscription(String),

    /// Subscription id not registered on the bus
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Alert rule rejected at creation
    #[error("Invalid alert rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// Alert rule id not registered with the manager
    #[error("Alert rule not found: {0}")]
    RuleNotFound(String),

    /// Holding symbol not present in the portfolio
    #[error("Holding not found: {0}")]
    HoldingNotFound(String),

    /// Notification delivery failure
    #[error("Notification error ({channel}): {message}")]
    Notification { channel: String, message: String },

    /// Component asked to transition from an incompatible state
    #[error("Invalid state for {component}: {state}")]
    InvalidState { component: String, state: String },

    /// Component task is not running (stopped or never started)
    #[error("{0} is not running")]
    NotRunning(String),

    /// JSON parse error
    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// Generic parse error
    #[error("Generic parse error: {0}")]
    GenericParse(String),
}

// Convenience constructors for common error patterns
impl Error {
    /// Create a transport error for a stream.
    pub fn transport(stream_id: impl Into<String>, kind: TransportError) -> Self {
        Error::Transport {
            stream_id: stream_id.into(),
            kind,
        }
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Create a JSON parse error.
    pub fn json_parse(msg: impl Into<String>) -> Self {
        Error::JsonParse(msg.into())
    }

    /// Create a notification delivery error.
    pub fn notification(channel: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Notification {
            channel: channel.into(),
            message: msg.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonParse(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
