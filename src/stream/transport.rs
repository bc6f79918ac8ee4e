//! Transport abstraction over the wire protocol.
//!
//! Connections talk to a [`Transport`] rather than tokio-tungstenite
//! directly so that scripted transports can drive the state machine in
//! tests. [`WsTransport`] is the production implementation.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::TransportError;

type WsResult<T> = std::result::Result<T, TransportError>;

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Connection factory. One per protocol/endpoint style.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh stream to `url`. Each call is an independent
    /// connection attempt.
    async fn connect(&self, url: &str) -> WsResult<Box<dyn TransportStream>>;
}

/// An open, bidirectional message stream.
#[async_trait]
pub trait TransportStream: Send {
    async fn send(&mut self, msg: TransportMessage) -> WsResult<()>;

    /// Next inbound frame. `None` means the peer closed cleanly.
    async fn next_message(&mut self) -> Option<WsResult<TransportMessage>>;

    /// Best-effort close; errors are ignored.
    async fn close(&mut self);
}

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

type WsStreamInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsStream {
    writer: SplitSink<WsStreamInner, protocol::Message>,
    reader: SplitStream<WsStreamInner>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> WsResult<Box<dyn TransportStream>> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (writer, reader) = ws_stream.split();
        Ok(Box::new(WsStream { writer, reader }))
    }
}

fn to_wire(msg: TransportMessage) -> protocol::Message {
    match msg {
        TransportMessage::Text(s) => protocol::Message::Text(s),
        TransportMessage::Binary(b) => protocol::Message::Binary(b),
        TransportMessage::Ping(p) => protocol::Message::Ping(p),
        TransportMessage::Pong(p) => protocol::Message::Pong(p),
        TransportMessage::Close => protocol::Message::Close(None),
    }
}

fn from_wire(msg: protocol::Message) -> TransportMessage {
    match msg {
        protocol::Message::Text(s) => TransportMessage::Text(s),
        protocol::Message::Binary(b) => TransportMessage::Binary(b),
        protocol::Message::Ping(p) => TransportMessage::Ping(p),
        protocol::Message::Pong(p) => TransportMessage::Pong(p),
        protocol::Message::Close(_) => TransportMessage::Close,
        protocol::Message::Frame(_) => TransportMessage::Close,
    }
}

#[async_trait]
impl TransportStream for WsStream {
    async fn send(&mut self, msg: TransportMessage) -> WsResult<()> {
        self.writer
            .send(to_wire(msg))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<WsResult<TransportMessage>> {
        match self.reader.next().await? {
            Ok(msg) => Some(Ok(from_wire(msg))),
            Err(e) => Some(Err(TransportError::Connection(e.to_string()))),
        }
    }

    async fn close(&mut self) {
        let _ = self.writer.send(protocol::Message::Close(None)).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transports for driving connection tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Transport whose connect attempts succeed or fail per a script.
    pub(crate) struct ScriptedTransport {
        /// Per-attempt outcome; `true` = connect succeeds. Attempts past
        /// the end of the script reuse the last entry.
        outcomes: Mutex<VecDeque<bool>>,
        last: bool,
        pub(crate) attempts: Arc<AtomicU64>,
        /// Frame script per successful session, in connect order.
        /// Sessions past the end get no frames. A stream that runs out
        /// of frames stays open (pends) unless its script ends with
        /// [`TransportMessage::Close`].
        sessions: Mutex<VecDeque<Vec<TransportMessage>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(outcomes: Vec<bool>) -> Self {
            let last = outcomes.last().copied().unwrap_or(false);
            Self {
                outcomes: Mutex::new(outcomes.into()),
                last,
                attempts: Arc::new(AtomicU64::new(0)),
                sessions: Mutex::new(VecDeque::new()),
            }
        }

        pub(crate) fn with_sessions(self, sessions: Vec<Vec<TransportMessage>>) -> Self {
            *self.sessions.lock().unwrap() = sessions.into();
            self
        }

        pub(crate) fn attempt_count(&self) -> u64 {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, _url: &str) -> WsResult<Box<dyn TransportStream>> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let ok = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.last);
            if !ok {
                return Err(TransportError::Connection("scripted failure".into()));
            }
            let frames = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedStream {
                pending: frames.into(),
            }))
        }
    }

    pub(crate) struct ScriptedStream {
        pending: VecDeque<TransportMessage>,
    }

    #[async_trait]
    impl TransportStream for ScriptedStream {
        async fn send(&mut self, _msg: TransportMessage) -> WsResult<()> {
            Ok(())
        }

        async fn next_message(&mut self) -> Option<WsResult<TransportMessage>> {
            match self.pending.pop_front() {
                Some(msg) => Some(Ok(msg)),
                // Out of scripted frames: stay open forever
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }
}
