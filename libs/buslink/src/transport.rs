//! Bus transport
//!
//! Owns the single TCP connection to the RS-485 gateway. Writes are
//! serialized behind one lock because the physical medium is half-duplex;
//! the read loop decodes frames and forwards them, in socket order, to the
//! channel given at construction. The connection is reference-counted:
//! lazily opened by the first subscriber, closed again by the last.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::error::{BusLinkError, Result};
use crate::frame::{Command, Frame};

/// Gateway connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusTransportConfig {
    /// Gateway host address
    pub host: String,
    /// Gateway port number
    pub port: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles after every failed attempt
    pub initial_retry_delay: Duration,
    /// Reconnect delay ceiling
    pub max_retry_delay: Duration,
}

impl Default for BusTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8899,
            connect_timeout: Duration::from_secs(10),
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

impl BusTransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(BusLinkError::config("Host cannot be empty"));
        }
        if self.port == 0 {
            return Err(BusLinkError::config("Port cannot be zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(BusLinkError::config("Timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Transport counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
}

#[derive(Debug, Default)]
struct StatsCells {
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    connection_attempts: AtomicU64,
    successful_connections: AtomicU64,
}

/// Lifecycle state guarded by a single mutex so that concurrent
/// subscribe/unsubscribe interleavings keep `live == 0 <=> closed`.
#[derive(Default)]
struct Lifecycle {
    subscribers: usize,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

struct Inner {
    config: BusTransportConfig,
    frames_tx: mpsc::UnboundedSender<Frame>,
    /// Write half; the lock doubles as the half-duplex send lock
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    stats: StatsCells,
}

/// Shared transport for one `(host, port)` gateway.
///
/// Cheap to clone; every clone refers to the same connection. Passed
/// explicitly to the components that need it, never looked up ambiently.
#[derive(Clone)]
pub struct BusTransport {
    inner: Arc<Inner>,
}

impl BusTransport {
    /// Create a transport. Decoded frames are forwarded to `frames_tx` in
    /// socket order; the receiving side is expected to dispatch them.
    pub fn new(config: BusTransportConfig, frames_tx: mpsc::UnboundedSender<Frame>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                frames_tx,
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
                stats: StatsCells::default(),
            }),
        })
    }

    /// Register a consumer and make sure the connection task is running.
    ///
    /// Idempotent with respect to the connection: the first caller starts
    /// the task, later callers only bump the live count.
    pub async fn open(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.subscribers += 1;
        let running = matches!(&lifecycle.task, Some((_, handle)) if !handle.is_finished());
        if !running {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_connection(self.inner.clone(), cancel.clone()));
            lifecycle.task = Some((cancel, handle));
            debug!("connection task started for {}:{}", self.inner.config.host, self.inner.config.port);
        }
    }

    /// Drop a consumer. When the live count reaches zero the connection task
    /// is cancelled and joined and the socket is closed; otherwise a no-op.
    pub async fn close(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
        if lifecycle.subscribers > 0 {
            return;
        }
        if let Some((cancel, handle)) = lifecycle.task.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        self.inner.writer.lock().await.take();
        self.inner.connected.store(false, Ordering::SeqCst);
        info!("bus connection closed");
    }

    /// Write raw bytes to the gateway.
    ///
    /// Holds the exclusive send lock for the duration of the write: only one
    /// request may be outstanding on the half-duplex line. Failures are
    /// recoverable; callers retry on their next tick.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let stream = writer.as_mut().ok_or(BusLinkError::NotConnected)?;
        if let Err(e) = stream.write_all(data).await {
            // The read loop notices the broken socket on its own; just drop
            // our half so later sends fail fast until reconnect.
            writer.take();
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(BusLinkError::io(format!("bus write failed: {e}")));
        }
        self.inner
            .stats
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!("bus TX: {}B", data.len());
        Ok(())
    }

    /// Encode and send a command
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        let bytes = command.encode()?;
        self.send(&bytes).await
    }

    /// Whether the socket is currently up
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Current live-subscriber count
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lifecycle.lock().await.subscribers
    }

    /// Snapshot of the transport counters
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_received: self.inner.stats.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.stats.bytes_sent.load(Ordering::Relaxed),
            connection_attempts: self.inner.stats.connection_attempts.load(Ordering::Relaxed),
            successful_connections: self
                .inner
                .stats
                .successful_connections
                .load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Connection task: connect, run the read loop, reconnect with backoff
/// until cancelled.
async fn run_connection(inner: Arc<Inner>, cancel: CancellationToken) {
    let addr = format!("{}:{}", inner.config.host, inner.config.port);
    let mut retry_delay = inner.config.initial_retry_delay;

    loop {
        inner
            .stats
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(inner.config.connect_timeout, TcpStream::connect(&addr)) => result,
        };

        match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                let (read_half, write_half) = stream.into_split();
                *inner.writer.lock().await = Some(write_half);
                inner.connected.store(true, Ordering::SeqCst);
                inner
                    .stats
                    .successful_connections
                    .fetch_add(1, Ordering::Relaxed);
                retry_delay = inner.config.initial_retry_delay;
                info!("bus connected: {}", addr);

                read_loop(&inner, read_half, &cancel).await;

                inner.connected.store(false, Ordering::SeqCst);
                inner.writer.lock().await.take();
            },
            Ok(Err(e)) => warn!("bus connect failed: {} - {}", addr, e),
            Err(_) => warn!("bus connect timeout: {}", addr),
        }

        if cancel.is_cancelled() {
            return;
        }

        let delay = jittered(retry_delay);
        info!("bus reconnect to {} in {:?}", addr, delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {},
        }
        retry_delay = (retry_delay * 2).min(inner.config.max_retry_delay);
    }
}

/// Read loop: decode frames and forward them until the socket dies or the
/// transport is cancelled. Malformed records are handled inside the codec
/// and never terminate the loop.
async fn read_loop(inner: &Inner, read_half: OwnedReadHalf, cancel: &CancellationToken) {
    let mut framed = FramedRead::new(read_half, FrameCodec);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            item = framed.next() => match item {
                Some(Ok(frame)) => {
                    inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    if inner.frames_tx.send(frame).is_err() {
                        warn!("frame sink dropped, stopping read loop");
                        return;
                    }
                },
                Some(Err(e)) => {
                    warn!("bus read error: {}", e);
                    return;
                },
                None => {
                    warn!("bus connection closed by gateway");
                    return;
                },
            },
        }
    }
}

/// Add up to 10% random jitter so reconnecting clients do not stampede
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    delay.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_transport() -> (BusTransport, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = BusTransportConfig {
            host: "127.0.0.1".to_string(),
            port: 59999,
            connect_timeout: Duration::from_millis(200),
            initial_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_millis(200),
        };
        (BusTransport::new(config, tx).unwrap(), rx)
    }

    #[test]
    fn test_config_validation() {
        let mut config = BusTransportConfig::default();
        assert!(config.validate().is_ok());

        config.host = String::new();
        assert!(config.validate().is_err());

        config.host = "127.0.0.1".to_string();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_not_connected_initially() {
        let (transport, _rx) = test_transport();
        assert!(!transport.is_connected());
        assert_eq!(transport.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_without_connection_is_recoverable() {
        let (transport, _rx) = test_transport();
        let err = transport.send(&[0x55]).await.unwrap_err();
        assert!(matches!(err, BusLinkError::NotConnected));
        assert!(err.needs_reconnect());
    }

    #[tokio::test]
    async fn test_refcount_open_close() {
        let (transport, _rx) = test_transport();
        transport.open().await;
        transport.open().await;
        assert_eq!(transport.subscriber_count().await, 2);

        transport.close().await;
        assert_eq!(transport.subscriber_count().await, 1);

        transport.close().await;
        assert_eq!(transport.subscriber_count().await, 0);
        assert!(!transport.is_connected());

        // Excess close stays a no-op
        transport.close().await;
        assert_eq!(transport.subscriber_count().await, 0);
    }
}
