//! Per-connection handle, connection state and reconnect backoff.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, Notify};

use gatewatch_core::prelude::*;

use crate::config::BackoffConfig;
use crate::ws::WsWriter;

/// Type-erased write half, so tests can run the supervisor over any stream.
pub type BoxedWriter = WsWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Upper bound on sending the Close frame during teardown. A peer that stopped
/// reading must not hold `stop()` hostage.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Lifecycle of the single supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, either before `start()`, after `stop()`, or between retries.
    Disconnected,
    /// Dialing and upgrading the socket.
    Connecting,
    /// Socket open, waiting for the `connect.challenge` event.
    AwaitingChallenge,
    /// `connect` request sent, waiting for the terminal response.
    Authenticating,
    /// Authenticated; requests may be issued.
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingChallenge => "awaiting challenge",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling reconnect delay with a cap. Reset to the floor once a connection
/// authenticates.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
        )
    }

    /// Return the delay to wait now and double the next one, up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    #[cfg(test)]
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Shared handle to one physical socket.
///
/// The read half is owned by the read loop; everything here is usable from
/// any task. `generation` identifies the connection so a superseded socket
/// can never mutate the state of its successor.
pub struct Connection {
    generation: u64,
    writer: tokio::sync::Mutex<BoxedWriter>,
    handshake_started: AtomicBool,
    pong_waiter: Mutex<Option<oneshot::Sender<()>>>,
    closed: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(generation: u64, writer: BoxedWriter) -> Self {
        Self {
            generation,
            writer: tokio::sync::Mutex::new(writer),
            handshake_started: AtomicBool::new(false),
            pong_waiter: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write one text frame. Serialized with every other writer of this socket.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.writer.lock().await.send_text(text).await
    }

    pub async fn send_pong(&self, payload: &[u8]) -> Result<()> {
        self.writer.lock().await.send_pong(payload).await
    }

    /// Claim the right to answer the challenge. Returns `true` exactly once.
    pub fn begin_handshake(&self) -> bool {
        !self.handshake_started.swap(true, Ordering::SeqCst)
    }

    /// Send a ping and wait for the matching pong. `timeout` covers the
    /// writer lock and the write as well as the wait.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiter = self.pong_waiter.lock().unwrap_or_else(|e| e.into_inner());
            *waiter = Some(tx);
        }

        let exchange = async {
            self.writer.lock().await.send_ping(b"health").await?;
            rx.await.map_err(|_| Error::ConnectionClosed)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.pong_waiter
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                Err(Error::timeout("ping", timeout))
            }
        }
    }

    /// Wake the pending [`Connection::ping`], if any.
    pub fn complete_ping(&self) {
        let waiter = self
            .pong_waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }

    /// Ask the read loop owning this connection to give up on it.
    pub fn shutdown(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`Connection::shutdown`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    /// Send a Close frame and shut down the write side, giving up after
    /// [`CLOSE_TIMEOUT`].
    pub async fn close(&self) {
        let close = async { self.writer.lock().await.close().await };
        if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            debug!(
                "Close frame for connection {} not written within {:?}",
                self.generation, CLOSE_TIMEOUT
            );
        }
        let waiter = self
            .pong_waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{WsMessage, WsReader};

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(4000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_large_cap_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::MAX);
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::AwaitingChallenge.to_string(),
            "awaiting challenge"
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Authenticating.is_connected());
    }

    fn duplex_connection() -> (Connection, WsReader<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(1024);
        let writer: BoxedWriter = WsWriter::new(Box::new(client));
        (Connection::new(7, writer), WsReader::new(server))
    }

    #[test]
    fn test_begin_handshake_only_once() {
        let (conn, _server) = duplex_connection();
        assert!(conn.begin_handshake());
        assert!(!conn.begin_handshake());
    }

    #[tokio::test]
    async fn test_ping_completes_on_pong() {
        let (conn, mut server) = duplex_connection();
        let conn = std::sync::Arc::new(conn);

        let pinger = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.ping(Duration::from_secs(2)).await })
        };

        match server.next_message().await.unwrap() {
            WsMessage::Ping(payload) => assert_eq!(payload, b"health"),
            other => panic!("expected ping, got {other:?}"),
        }
        conn.complete_ping();
        assert!(pinger.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_ping_times_out() {
        let (conn, _server) = duplex_connection();
        let err = conn.ping(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    /// A writer stuck on a peer that stopped reading holds the writer lock.
    fn stalled_connection() -> (
        std::sync::Arc<Connection>,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (client, server) = tokio::io::duplex(1024);
        let writer: BoxedWriter = WsWriter::new(Box::new(client));
        let conn = std::sync::Arc::new(Connection::new(9, writer));
        let blocked = {
            let conn = conn.clone();
            let big = "x".repeat(64 * 1024);
            tokio::spawn(async move { conn.send_text(&big).await })
        };
        (conn, server, blocked)
    }

    #[tokio::test]
    async fn test_ping_deadline_covers_writer_lock() {
        let (conn, _server, blocked) = stalled_connection();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let err = conn.ping(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!blocked.is_finished());
        blocked.abort();
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_peer_stops_reading() {
        let (conn, _server, blocked) = stalled_connection();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(CLOSE_TIMEOUT + Duration::from_secs(1), conn.close())
            .await
            .expect("close() gives up on a stalled peer");
        blocked.abort();
    }

    #[tokio::test]
    async fn test_shutdown_wakes_closed() {
        let (conn, _server) = duplex_connection();
        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("closed() resolves after shutdown()");
    }
}
