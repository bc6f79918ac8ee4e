//! Supervised stream connection.
//!
//! A [`StreamConnection`] owns one transport session plus the tasks that
//! keep it alive: an I/O loop (inbound frames + outbound queue), a
//! heartbeat loop, and a dispatcher that fans decoded messages out to
//! subscribers through a bounded buffer. Session loss triggers a
//! reconnect cycle with exponential backoff; exhausting the attempt
//! budget parks the connection in a terminal `Error` state until an
//! explicit `reconnect()` or `stop()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result, TransportError};
use crate::logging::targets;
use crate::stream::backoff::ReconnectPolicy;
use crate::stream::transport::{Transport, TransportMessage, TransportStream};

/// Configuration for a single stream connection. Immutable once the
/// connection is created.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Unique id for this stream within a supervisor
    pub stream_id: String,
    /// WebSocket endpoint
    pub url: String,
    /// Symbols this stream carries (adapter concern; carried for status)
    pub symbols: Vec<String>,
    /// Connect attempts per reconnect cycle
    pub reconnect_attempts: u32,
    /// Base backoff delay
    pub reconnect_delay: Duration,
    /// Backoff delay cap
    pub max_reconnect_delay: Duration,
    /// Ping cadence; zero disables the heartbeat loop
    pub heartbeat_interval: Duration,
    /// Inbound message buffer capacity (drop-oldest on overflow)
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stream_id: String::new(),
            url: String::new(),
            symbols: Vec::new(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: 1000,
        }
    }
}

impl ConnectionConfig {
    /// Minimal config for an endpoint.
    pub fn new(stream_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.stream_id.is_empty() {
            return Err(Error::invalid_config("stream_id must not be empty"));
        }
        if self.url.is_empty() {
            return Err(Error::invalid_config("url must not be empty"));
        }
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("buffer_size must be positive"));
        }
        Ok(())
    }

    fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            base_delay: self.reconnect_delay,
            max_delay: self.max_reconnect_delay,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected, no session in flight
    Disconnected = 0,
    /// Initial connect in progress
    Connecting = 1,
    /// Session established, loops running
    Connected = 2,
    /// Reconnect cycle in progress
    Reconnecting = 3,
    /// Terminal failure (connect failed or attempts exhausted)
    Error = 4,
    /// Stopped by request
    Stopped = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Error,
            5 => ConnectionState::Stopped,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
            ConnectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time metrics snapshot for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub state: ConnectionState,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connection_count: u64,
    pub reconnection_count: u64,
    pub error_count: u64,
    pub dropped_messages: u64,
    /// Age of the last inbound message; `None` if never received
    pub last_message_age: Option<Duration>,
    /// Total time spent in `Connected`, across sessions
    pub uptime: Duration,
}

/// Bounded inbound buffer. Overflow discards the oldest entry.
struct MessageBuffer {
    queue: Mutex<VecDeque<Arc<Value>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MessageBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, msg: Arc<Value>) {
        let mut q = self.queue.lock().unwrap();
        if q.len() == self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(msg);
    }

    fn drain(&self) -> Vec<Arc<Value>> {
        let mut q = self.queue.lock().unwrap();
        q.drain(..).collect()
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ConnectionInner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    buffer: MessageBuffer,
    buffer_notify: Notify,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<Value>>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>,
    /// One dispatcher task per connection across sessions
    dispatcher_running: AtomicBool,
    /// Bumped once per established session; lets adapters re-send
    /// subscribe payloads after a reconnect
    session_tx: watch::Sender<u64>,

    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    connection_count: AtomicU64,
    reconnection_count: AtomicU64,
    error_count: AtomicU64,
    /// Nanos since `start_time`; 0 = never
    last_message: AtomicU64,
    /// Nanos since `start_time`; 0 = never
    last_heartbeat: AtomicU64,
    /// Nanos since `start_time` of the current session; 0 = offline
    connected_since: AtomicU64,
    /// Connected time from completed sessions
    uptime_nanos: AtomicU64,
    start_time: Instant,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn touch(&self, slot: &AtomicU64) {
        let nanos = self.start_time.elapsed().as_nanos() as u64;
        slot.store(nanos, Ordering::Relaxed);
    }

    fn elapsed_since(&self, slot: &AtomicU64) -> Option<Duration> {
        let nanos = slot.load(Ordering::Relaxed);
        if nanos == 0 {
            return None;
        }
        let now = self.start_time.elapsed().as_nanos() as u64;
        Some(Duration::from_nanos(now.saturating_sub(nanos)))
    }

    /// Fold the finished session's connected time into the total.
    fn accumulate_uptime(&self) {
        let since = self.connected_since.swap(0, Ordering::Relaxed);
        if since != 0 {
            let now = self.start_time.elapsed().as_nanos() as u64;
            self.uptime_nanos
                .fetch_add(now.saturating_sub(since), Ordering::Relaxed);
        }
    }

    fn uptime(&self) -> Duration {
        let mut nanos = self.uptime_nanos.load(Ordering::Relaxed);
        let since = self.connected_since.load(Ordering::Relaxed);
        if since != 0 {
            let now = self.start_time.elapsed().as_nanos() as u64;
            nanos += now.saturating_sub(since);
        }
        Duration::from_nanos(nanos)
    }
}

/// A supervised connection to one streaming endpoint.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<ConnectionInner>,
}

impl StreamConnection {
    /// Create a connection over the production WebSocket transport.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(crate::stream::transport::WsTransport))
    }

    /// Create a connection over an arbitrary transport.
    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let buffer = MessageBuffer::new(config.buffer_size);
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                transport,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                stop_flag: AtomicBool::new(false),
                stop_notify: Notify::new(),
                buffer,
                buffer_notify: Notify::new(),
                subscribers: Mutex::new(Vec::new()),
                outbound: Mutex::new(None),
                dispatcher_running: AtomicBool::new(false),
                session_tx: watch::channel(0).0,
                messages_received: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                connection_count: AtomicU64::new(0),
                reconnection_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_message: AtomicU64::new(0),
                last_heartbeat: AtomicU64::new(0),
                connected_since: AtomicU64::new(0),
                uptime_nanos: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.config.stream_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Age of the last successful heartbeat (ping write or pong read).
    pub fn last_heartbeat_age(&self) -> Option<Duration> {
        self.inner.elapsed_since(&self.inner.last_heartbeat)
    }

    /// Watch the session counter. It increments every time a transport
    /// session comes up, including after reconnects.
    pub fn session_updates(&self) -> watch::Receiver<u64> {
        self.inner.session_tx.subscribe()
    }

    /// Register a subscriber for decoded inbound messages. Messages that
    /// arrive from now on are delivered as `Arc<Value>`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Establish the initial session. No-op when a session is already up
    /// or being established.
    pub async fn connect(&self) -> Result<()> {
        match self.inner.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting => return Ok(()),
            _ => {}
        }
        self.inner.stop_flag.store(false, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connecting);
        info!(
            target: targets::STREAM,
            stream_id = %self.stream_id(),
            url = %self.inner.config.url,
            "connecting"
        );

        match self.inner.transport.connect(&self.inner.config.url).await {
            Ok(stream) => {
                self.install_session(stream);
                Ok(())
            }
            Err(e) => {
                self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                self.inner.set_state(ConnectionState::Error);
                error!(
                    target: targets::STREAM,
                    stream_id = %self.stream_id(),
                    error = %e,
                    "connect failed"
                );
                Err(Error::transport(self.stream_id(), e))
            }
        }
    }

    /// Tear down the current session with backoff until a fresh one is
    /// up or the attempt budget is exhausted.
    ///
    /// Attempt 0 fires immediately; failure `i` is followed by a wait of
    /// `min(base * 2^i, max)` before the next attempt.
    pub async fn reconnect(&self) -> Result<()> {
        let policy = self.inner.config.policy();
        self.inner.set_state(ConnectionState::Reconnecting);
        self.inner.outbound.lock().unwrap().take();

        for attempt in 0..policy.max_attempts {
            if self.inner.stop_flag.load(Ordering::Relaxed) {
                self.inner.set_state(ConnectionState::Stopped);
                return Ok(());
            }
            if attempt > 0 {
                let delay = policy.delay_after_failure(attempt - 1);
                debug!(
                    target: targets::STREAM,
                    stream_id = %self.stream_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            match self.inner.transport.connect(&self.inner.config.url).await {
                Ok(stream) => {
                    self.inner.reconnection_count.fetch_add(1, Ordering::Relaxed);
                    self.install_session(stream);
                    info!(
                        target: targets::STREAM,
                        stream_id = %self.stream_id(),
                        attempt,
                        "reconnected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: targets::STREAM,
                        stream_id = %self.stream_id(),
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }

        self.inner.set_state(ConnectionState::Error);
        error!(
            target: targets::STREAM,
            stream_id = %self.stream_id(),
            attempts = policy.max_attempts,
            "reconnection attempts exhausted"
        );
        Err(Error::transport(
            self.stream_id(),
            TransportError::ReconnectExhausted {
                attempts: policy.max_attempts,
            },
        ))
    }

    /// Queue a text frame for the current session.
    ///
    /// When no session is up this logs a warning and returns without
    /// error; nothing is queued.
    pub fn send_text(&self, text: String) -> Result<()> {
        if self.inner.state() != ConnectionState::Connected {
            warn!(
                target: targets::STREAM,
                stream_id = %self.stream_id(),
                state = %self.inner.state(),
                "send while not connected, dropping"
            );
            return Ok(());
        }
        let guard = self.inner.outbound.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(TransportMessage::Text(text)).is_err() {
                self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                return Err(Error::transport(
                    self.stream_id(),
                    TransportError::Send("session closed".into()),
                ));
            }
        }
        Ok(())
    }

    /// Serialize `payload` and queue it for the current session.
    pub fn send_json(&self, payload: &Value) -> Result<()> {
        self.send_text(serde_json::to_string(payload)?)
    }

    /// Stop the connection and all its tasks. Terminal; `connect()` may
    /// be called again to start a fresh lifecycle.
    pub async fn stop(&self) {
        self.inner.stop_flag.store(true, Ordering::Relaxed);
        self.inner.stop_notify.notify_waiters();
        self.inner.buffer_notify.notify_waiters();
        self.inner.outbound.lock().unwrap().take();
        self.inner.set_state(ConnectionState::Stopped);
        info!(target: targets::STREAM, stream_id = %self.stream_id(), "stopped");
    }

    /// Snapshot the connection counters.
    pub fn metrics(&self) -> ConnectionMetrics {
        let inner = &self.inner;
        ConnectionMetrics {
            state: inner.state(),
            messages_received: inner.messages_received.load(Ordering::Relaxed),
            messages_sent: inner.messages_sent.load(Ordering::Relaxed),
            bytes_received: inner.bytes_received.load(Ordering::Relaxed),
            bytes_sent: inner.bytes_sent.load(Ordering::Relaxed),
            connection_count: inner.connection_count.load(Ordering::Relaxed),
            reconnection_count: inner.reconnection_count.load(Ordering::Relaxed),
            error_count: inner.error_count.load(Ordering::Relaxed),
            dropped_messages: inner.buffer.dropped(),
            last_message_age: inner.elapsed_since(&inner.last_message),
            uptime: inner.uptime(),
        }
    }

    /// Wire a fresh transport stream: outbound queue, I/O loop,
    /// heartbeat loop, dispatcher.
    fn install_session(&self, stream: Box<dyn TransportStream>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock().unwrap() = Some(out_tx.clone());
        self.inner.connection_count.fetch_add(1, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connected);
        self.inner.touch(&self.inner.connected_since);
        // A live session counts as a heartbeat; staleness is measured
        // from here until the first ping outcome.
        self.inner.touch(&self.inner.last_heartbeat);

        let conn = self.clone();
        tokio::spawn(async move { conn.io_loop(stream, out_rx).await });

        if !self.inner.dispatcher_running.swap(true, Ordering::Relaxed) {
            let conn = self.clone();
            tokio::spawn(async move { conn.dispatch_loop().await });
        }

        if !self.inner.config.heartbeat_interval.is_zero() {
            let conn = self.clone();
            tokio::spawn(async move { conn.heartbeat_loop(out_tx).await });
        }

        self.inner.session_tx.send_modify(|n| *n += 1);
    }

    async fn io_loop(
        self,
        mut stream: Box<dyn TransportStream>,
        mut out_rx: mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        let session_lost = loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => {
                    stream.close().await;
                    break false;
                }
                out = out_rx.recv() => {
                    let Some(msg) = out else { break false };
                    let is_ping = matches!(msg, TransportMessage::Ping(_));
                    let len = match &msg {
                        TransportMessage::Text(s) => s.len() as u64,
                        TransportMessage::Binary(b) => b.len() as u64,
                        _ => 0,
                    };
                    match stream.send(msg).await {
                        Ok(()) => {
                            // Pings are accounted by the pong they earn
                            if !is_ping {
                                self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
                                self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                target: targets::STREAM,
                                stream_id = %self.stream_id(),
                                error = %e,
                                "send failed, dropping session"
                            );
                            break true;
                        }
                    }
                }
                inbound = stream.next_message() => {
                    match inbound {
                        Some(Ok(TransportMessage::Text(text))) => self.handle_text(&text),
                        Some(Ok(TransportMessage::Binary(bytes))) => {
                            self.inner.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        }
                        Some(Ok(TransportMessage::Ping(payload))) => {
                            if stream.send(TransportMessage::Pong(payload)).await.is_err() {
                                break true;
                            }
                        }
                        Some(Ok(TransportMessage::Pong(_))) => {
                            self.inner.touch(&self.inner.last_heartbeat);
                        }
                        Some(Ok(TransportMessage::Close)) | None => {
                            debug!(
                                target: targets::STREAM,
                                stream_id = %self.stream_id(),
                                "peer closed session"
                            );
                            break true;
                        }
                        Some(Err(e)) => {
                            self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                target: targets::STREAM,
                                stream_id = %self.stream_id(),
                                error = %e,
                                "read failed, dropping session"
                            );
                            break true;
                        }
                    }
                }
            }
        };

        self.inner.accumulate_uptime();

        if session_lost && !self.inner.stop_flag.load(Ordering::Relaxed) {
            let conn = self.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.reconnect().await {
                    error!(
                        target: targets::STREAM,
                        stream_id = %conn.stream_id(),
                        error = %e,
                        "connection lost permanently"
                    );
                }
            });
        }
    }

    fn handle_text(&self, text: &str) {
        self.inner
            .bytes_received
            .fetch_add(text.len() as u64, Ordering::Relaxed);
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
                self.inner.touch(&self.inner.last_message);
                self.inner.buffer.push(Arc::new(value));
                self.inner.buffer_notify.notify_one();
            }
            Err(e) => {
                self.inner.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: targets::STREAM,
                    stream_id = %self.stream_id(),
                    error = %e,
                    "discarding malformed frame"
                );
            }
        }
    }

    async fn dispatch_loop(self) {
        loop {
            if self.inner.stop_flag.load(Ordering::Relaxed) {
                self.inner.dispatcher_running.store(false, Ordering::Relaxed);
                return;
            }
            for msg in self.inner.buffer.drain() {
                let mut subs = self.inner.subscribers.lock().unwrap();
                subs.retain(|tx| tx.send(msg.clone()).is_ok());
            }
            self.inner.buffer_notify.notified().await;
        }
    }

    async fn heartbeat_loop(self, out_tx: mpsc::UnboundedSender<TransportMessage>) {
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if self.inner.stop_flag.load(Ordering::Relaxed) {
                return;
            }
            if out_tx.send(TransportMessage::Ping(Vec::new())).is_err() {
                // Session gone; the replacement session spawns its own loop.
                return;
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.stop_notify.notify_waiters();
        self.buffer_notify.notify_waiters();
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("stream_id", &self.inner.config.stream_id)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::testing::ScriptedTransport;
    use serde_json::json;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            stream_id: "test".into(),
            url: "wss://example.invalid/ws".into(),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(60),
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ConnectionConfig::new("", "wss://x").validate().is_err());
        assert!(ConnectionConfig::new("s", "").validate().is_err());
        let mut cfg = ConnectionConfig::new("s", "wss://x");
        cfg.buffer_size = 0;
        assert!(cfg.validate().is_err());
        cfg.buffer_size = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let buf = MessageBuffer::new(2);
        buf.push(Arc::new(json!(1)));
        buf.push(Arc::new(json!(2)));
        buf.push(Arc::new(json!(3)));

        assert_eq!(buf.dropped(), 1);
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(*drained[0], json!(2));
        assert_eq!(*drained[1], json!(3));
    }

    #[tokio::test]
    async fn test_connect_success_transitions() {
        let transport = Arc::new(ScriptedTransport::new(vec![true]));
        let conn = StreamConnection::with_transport(test_config(), transport.clone()).unwrap();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let m = conn.metrics();
        assert_eq!(m.connection_count, 1);
        assert_eq!(m.reconnection_count, 0);
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![false]));
        let conn = StreamConnection::with_transport(test_config(), transport).unwrap();

        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.metrics().error_count, 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new(vec![true]));
        let conn = StreamConnection::with_transport(test_config(), transport.clone()).unwrap();

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert_eq!(transport.attempt_count(), 1);
        assert_eq!(conn.metrics().connection_count, 1);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_noop() {
        let transport = Arc::new(ScriptedTransport::new(vec![true]));
        let conn = StreamConnection::with_transport(test_config(), transport).unwrap();

        conn.send_text("hello".into()).unwrap();
        assert_eq!(conn.metrics().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_inbound_fanout() {
        let transport = Arc::new(ScriptedTransport::new(vec![true]).with_sessions(vec![vec![
            TransportMessage::Text(r#"{"px":"100.5"}"#.into()),
            TransportMessage::Text("not json".into()),
            TransportMessage::Text(r#"{"px":"101.0"}"#.into()),
        ]]));
        let conn = StreamConnection::with_transport(test_config(), transport).unwrap();
        let mut rx = conn.subscribe();

        conn.connect().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(*first, json!({"px": "100.5"}));
        let second = rx.recv().await.unwrap();
        assert_eq!(*second, json!({"px": "101.0"}));

        // Malformed frame was counted, not delivered
        let m = conn.metrics();
        assert_eq!(m.messages_received, 2);
        assert_eq!(m.error_count, 1);
        conn.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_schedule() {
        // 3 failures then success: waits of 100ms, 200ms, 400ms
        let transport = Arc::new(ScriptedTransport::new(vec![false, false, false, true]));
        let conn = StreamConnection::with_transport(test_config(), transport.clone()).unwrap();

        let start = tokio::time::Instant::now();
        conn.reconnect().await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(700));
        assert_eq!(transport.attempt_count(), 4);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.metrics().reconnection_count, 1);
        conn.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_capped() {
        let mut cfg = test_config();
        cfg.reconnect_delay = Duration::from_millis(100);
        cfg.max_reconnect_delay = Duration::from_millis(250);
        cfg.reconnect_attempts = 5;
        // 4 failures then success: 100 + 200 + 250 + 250
        let transport = Arc::new(ScriptedTransport::new(vec![false, false, false, false, true]));
        let conn = StreamConnection::with_transport(cfg, transport).unwrap();

        let start = tokio::time::Instant::now();
        conn.reconnect().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(800));
        conn.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_terminal() {
        let mut cfg = test_config();
        cfg.reconnect_attempts = 2;
        let transport = Arc::new(ScriptedTransport::new(vec![false]));
        let conn = StreamConnection::with_transport(cfg, transport.clone()).unwrap();

        let err = conn.reconnect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                kind: TransportError::ReconnectExhausted { attempts: 2 },
                ..
            }
        ));
        assert_eq!(transport.attempt_count(), 2);
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(conn.metrics().reconnection_count, 0);
    }

    #[tokio::test]
    async fn test_session_loss_triggers_reconnect() {
        // First session delivers one frame then the peer closes; the
        // replacement session stays open.
        let transport = Arc::new(ScriptedTransport::new(vec![true, true]).with_sessions(vec![
            vec![
                TransportMessage::Text(r#"{"n":1}"#.into()),
                TransportMessage::Close,
            ],
        ]));
        let mut cfg = test_config();
        cfg.reconnect_delay = Duration::from_millis(1);
        let conn = StreamConnection::with_transport(cfg, transport.clone()).unwrap();

        conn.connect().await.unwrap();

        // Wait for the reconnect to land
        for _ in 0..100 {
            if conn.metrics().reconnection_count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.attempt_count(), 2);
        assert_eq!(conn.metrics().reconnection_count, 1);
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.stop().await;
    }
}
