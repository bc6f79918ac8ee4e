//! Stream supervision.
//!
//! The supervisor owns a table of [`StreamConnection`]s keyed by stream
//! id and runs a periodic health sweep. A connected stream whose last
//! sign of life (inbound message or heartbeat pong) is older than
//! `stale_factor x heartbeat_interval` is forced through a reconnect
//! cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::logging::targets;
use crate::stream::connection::{
    ConnectionConfig, ConnectionMetrics, ConnectionState, StreamConnection,
};

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Health sweep cadence (default: 10s)
    pub poll_interval: Duration,
    /// Staleness threshold as a multiple of each stream's heartbeat
    /// interval (default: 3)
    pub stale_factor: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_factor: 3,
        }
    }
}

/// Aggregate statistics across supervised streams.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    pub total_streams: usize,
    pub connected: usize,
    pub reconnecting: usize,
    pub errored: usize,
    pub total_messages_received: u64,
    pub total_dropped_messages: u64,
    pub total_reconnections: u64,
}

struct SupervisorInner {
    config: SupervisorConfig,
    connections: RwLock<HashMap<String, StreamConnection>>,
    running: AtomicBool,
    stop_notify: Notify,
}

/// Owns and health-checks a set of stream connections.
#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<SupervisorInner>,
}

impl StreamSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                connections: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Start the health sweep and connect all registered streams.
    /// Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!(target: targets::STREAM, "supervisor starting");

        let conns: Vec<StreamConnection> =
            self.inner.connections.read().await.values().cloned().collect();
        for conn in conns {
            if let Err(e) = conn.connect().await {
                warn!(
                    target: targets::STREAM,
                    stream_id = %conn.stream_id(),
                    error = %e,
                    "initial connect failed"
                );
            }
        }

        let sup = self.clone();
        tokio::spawn(async move { sup.health_loop().await });
        Ok(())
    }

    /// Stop the sweep and all connections.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.inner.stop_notify.notify_waiters();
        let conns: Vec<StreamConnection> =
            self.inner.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.stop().await;
        }
        info!(target: targets::STREAM, "supervisor stopped");
    }

    /// Register a stream. Connects immediately when the supervisor is
    /// running; a failed initial connect leaves the stream registered in
    /// `Error` state and returns the failure.
    pub async fn add_stream(&self, config: ConnectionConfig) -> Result<StreamConnection> {
        let conn = StreamConnection::new(config)?;
        self.add_connection(conn).await
    }

    /// Register a pre-built connection (custom transport).
    pub async fn add_connection(&self, conn: StreamConnection) -> Result<StreamConnection> {
        {
            let mut conns = self.inner.connections.write().await;
            if conns.contains_key(conn.stream_id()) {
                return Err(Error::DuplicateStream(conn.stream_id().to_string()));
            }
            conns.insert(conn.stream_id().to_string(), conn.clone());
        }
        info!(
            target: targets::STREAM,
            stream_id = %conn.stream_id(),
            "stream registered"
        );
        if self.is_running() {
            conn.connect().await?;
        }
        Ok(conn)
    }

    /// Stop and forget a stream.
    pub async fn remove_stream(&self, stream_id: &str) -> Result<()> {
        let conn = self
            .inner
            .connections
            .write()
            .await
            .remove(stream_id)
            .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?;
        conn.stop().await;
        info!(target: targets::STREAM, stream_id, "stream removed");
        Ok(())
    }

    pub async fn connection(&self, stream_id: &str) -> Option<StreamConnection> {
        self.inner.connections.read().await.get(stream_id).cloned()
    }

    /// Queue a JSON payload on a stream.
    pub async fn send_to_stream(&self, stream_id: &str, payload: &Value) -> Result<()> {
        let conn = self
            .connection(stream_id)
            .await
            .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?;
        conn.send_json(payload)
    }

    /// Subscribe to decoded messages from one stream.
    pub async fn subscribe(&self, stream_id: &str) -> Result<mpsc::UnboundedReceiver<Arc<Value>>> {
        let conn = self
            .connection(stream_id)
            .await
            .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?;
        Ok(conn.subscribe())
    }

    pub async fn stream_metrics(&self, stream_id: &str) -> Result<ConnectionMetrics> {
        let conn = self
            .connection(stream_id)
            .await
            .ok_or_else(|| Error::StreamNotFound(stream_id.to_string()))?;
        Ok(conn.metrics())
    }

    pub async fn all_metrics(&self) -> HashMap<String, ConnectionMetrics> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .map(|(id, conn)| (id.clone(), conn.metrics()))
            .collect()
    }

    pub async fn stats(&self) -> SupervisorStats {
        let conns = self.inner.connections.read().await;
        let mut stats = SupervisorStats {
            total_streams: conns.len(),
            ..Default::default()
        };
        for conn in conns.values() {
            let m = conn.metrics();
            match m.state {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Reconnecting => stats.reconnecting += 1,
                ConnectionState::Error => stats.errored += 1,
                _ => {}
            }
            stats.total_messages_received += m.messages_received;
            stats.total_dropped_messages += m.dropped_messages;
            stats.total_reconnections += m.reconnection_count;
        }
        stats
    }

    async fn health_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.stop_notify.notified() => return,
                _ = ticker.tick() => {}
            }
            if !self.is_running() {
                return;
            }
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let conns: Vec<StreamConnection> =
            self.inner.connections.read().await.values().cloned().collect();
        for conn in conns {
            if conn.state() != ConnectionState::Connected {
                continue;
            }
            let Some(threshold) = stale_threshold(
                conn.config().heartbeat_interval,
                self.inner.config.stale_factor,
            ) else {
                continue;
            };
            if liveness_age(&conn).is_some_and(|age| age > threshold) {
                warn!(
                    target: targets::STREAM,
                    stream_id = %conn.stream_id(),
                    threshold_secs = threshold.as_secs_f64(),
                    "stream stale, forcing reconnect"
                );
                let conn = conn.clone();
                tokio::spawn(async move {
                    let _ = conn.reconnect().await;
                });
            }
        }
    }
}

/// Staleness cutoff for a stream; `None` when heartbeats are disabled.
fn stale_threshold(heartbeat_interval: Duration, factor: u32) -> Option<Duration> {
    if heartbeat_interval.is_zero() {
        return None;
    }
    Some(heartbeat_interval * factor)
}

/// Age of the freshest sign of life on a connection.
fn liveness_age(conn: &StreamConnection) -> Option<Duration> {
    let msg_age = conn.metrics().last_message_age;
    let hb_age = conn.last_heartbeat_age();
    match (msg_age, hb_age) {
        (Some(m), Some(h)) => Some(m.min(h)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::testing::ScriptedTransport;

    fn stream_config(id: &str, heartbeat: Duration) -> ConnectionConfig {
        ConnectionConfig {
            stream_id: id.into(),
            url: "wss://example.invalid/ws".into(),
            heartbeat_interval: heartbeat,
            reconnect_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn scripted(id: &str, heartbeat: Duration) -> StreamConnection {
        StreamConnection::with_transport(
            stream_config(id, heartbeat),
            Arc::new(ScriptedTransport::new(vec![true])),
        )
        .unwrap()
    }

    #[test]
    fn test_stale_threshold() {
        assert_eq!(
            stale_threshold(Duration::from_secs(30), 3),
            Some(Duration::from_secs(90))
        );
        assert_eq!(stale_threshold(Duration::ZERO, 3), None);
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let sup = StreamSupervisor::new(SupervisorConfig::default());
        sup.add_connection(scripted("s1", Duration::ZERO)).await.unwrap();
        let err = sup
            .add_connection(scripted("s1", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStream(_)));
    }

    #[tokio::test]
    async fn test_remove_unknown_stream() {
        let sup = StreamSupervisor::new(SupervisorConfig::default());
        assert!(matches!(
            sup.remove_stream("nope").await.unwrap_err(),
            Error::StreamNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_add_stream_connects_when_running() {
        let sup = StreamSupervisor::new(SupervisorConfig::default());
        sup.start().await.unwrap();

        let conn = sup
            .add_connection(scripted("s1", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        sup.stop().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_add_stream_stays_registered_until_started() {
        let sup = StreamSupervisor::new(SupervisorConfig::default());
        let conn = sup
            .add_connection(scripted("s1", Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        sup.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let sup = StreamSupervisor::new(SupervisorConfig::default());
        sup.start().await.unwrap();
        sup.add_connection(scripted("a", Duration::ZERO)).await.unwrap();
        sup.add_connection(scripted("b", Duration::ZERO)).await.unwrap();

        let stats = sup.stats().await;
        assert_eq!(stats.total_streams, 2);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.errored, 0);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stale_stream_forced_to_reconnect() {
        // Heartbeats every 30ms, stale after 90ms. The scripted stream
        // never answers pings, so the sweep must fire.
        let sup = StreamSupervisor::new(SupervisorConfig {
            poll_interval: Duration::from_millis(20),
            stale_factor: 3,
        });
        sup.start().await.unwrap();
        let conn = sup
            .add_connection(scripted("s1", Duration::from_millis(30)))
            .await
            .unwrap();

        let mut reconnected = false;
        for _ in 0..100 {
            if conn.metrics().reconnection_count > 0 {
                reconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconnected);
        sup.stop().await;
    }
}
