//! Transport
//!
//! The single persistent duplex connection to the backend. Writes are
//! serialised through a mutex around the sink; the reader runs on its own task
//! and forwards text frames to the dispatcher. When the connection dies the
//! transport raises a reconnect request instead of calling back into its
//! owner.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::reconnect::ReconnectRequester;
use crate::error::{AgentError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Bound on the TCP + WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on any write made while no explicit deadline is set
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the close handshake during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Message-oriented duplex connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the connection is still believed to be usable
    fn is_alive(&self) -> bool;

    /// Write one text frame, honouring the current write deadline
    async fn send_text(&self, text: String) -> Result<()>;

    /// Bound subsequent writes; `None` falls back to the transport's default
    /// bound
    fn set_write_deadline(&self, deadline: Option<Duration>);

    fn write_deadline(&self) -> Option<Duration>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}

/// WebSocket implementation of [`Transport`]
pub struct WebSocketTransport {
    sink: Arc<Mutex<WsSink>>,
    alive: Arc<AtomicBool>,
    write_deadline: SyncMutex<Option<Duration>>,
    default_write_timeout: Duration,
    cancel: CancellationToken,
    reconnect: ReconnectRequester,
}

impl WebSocketTransport {
    /// Open a connection and start its reader task.
    ///
    /// Text frames are forwarded to `inbound`; a close, a read error or the
    /// end of the stream marks the transport dead and requests a reconnect.
    pub async fn connect(
        url: &str,
        inbound: mpsc::Sender<String>,
        reconnect: ReconnectRequester,
    ) -> Result<Arc<Self>> {
        Self::connect_with_write_timeout(url, inbound, reconnect, DEFAULT_WRITE_TIMEOUT).await
    }

    /// [`connect`](Self::connect) with a custom bound for writes that have no
    /// explicit deadline
    pub async fn connect_with_write_timeout(
        url: &str,
        inbound: mpsc::Sender<String>,
        reconnect: ReconnectRequester,
        default_write_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| AgentError::Connection(format!("connect timed out after {:?}", CONNECT_TIMEOUT)))??;

        let (sink, stream) = stream.split();
        let transport = Arc::new(Self {
            sink: Arc::new(Mutex::new(sink)),
            alive: Arc::new(AtomicBool::new(true)),
            write_deadline: SyncMutex::new(None),
            default_write_timeout,
            cancel: CancellationToken::new(),
            reconnect,
        });

        tokio::spawn(Self::read_loop(
            stream,
            transport.sink.clone(),
            default_write_timeout,
            transport.alive.clone(),
            transport.cancel.clone(),
            transport.reconnect.clone(),
            inbound,
        ));

        info!("WebSocket connection established");
        Ok(transport)
    }

    async fn read_loop(
        mut stream: SplitStream<WsStream>,
        sink: Arc<Mutex<WsSink>>,
        pong_timeout: Duration,
        alive: Arc<AtomicBool>,
        cancel: CancellationToken,
        reconnect: ReconnectRequester,
        inbound: mpsc::Sender<String>,
    ) {
        let reason = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transport reader cancelled");
                    return;
                }
                msg = stream.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text.to_string()).await.is_err() {
                        debug!("Dispatcher gone, stopping reader");
                        return;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    debug!("Received ping, sending pong");
                    let pong = timeout(pong_timeout, async {
                        sink.lock().await.send(Message::Pong(data)).await
                    });
                    match pong.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break format!("pong failed: {}", e),
                        Err(_) => break "pong timed out".to_string(),
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Received close frame");
                    break "server closed connection".to_string();
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Received binary message (ignored)");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket read error");
                    break format!("read error: {}", e);
                }
                None => {
                    break "stream ended".to_string();
                }
            }
        };

        alive.store(false, Ordering::Release);
        if !cancel.is_cancelled() {
            reconnect.request(&reason);
        }
    }

    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) && !self.cancel.is_cancelled() {
            self.reconnect.request(reason);
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_alive() {
            return Err(AgentError::NotConnected);
        }

        // Waiting for the sink counts against the bound as well.
        let deadline = *self.write_deadline.lock();
        let limit = deadline.unwrap_or(self.default_write_timeout);
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Text(text)).await
        };
        let result = match timeout(limit, write).await {
            Ok(sent) => sent.map_err(AgentError::from),
            Err(_) => Err(AgentError::WriteTimeout(limit)),
        };

        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!(error = %e, "Write failed, marking transport dead");
                self.mark_dead("write failed");
            }
        }
        result
    }

    fn set_write_deadline(&self, deadline: Option<Duration>) {
        *self.write_deadline.lock() = deadline;
    }

    fn write_deadline(&self) -> Option<Duration> {
        *self.write_deadline.lock()
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.alive.store(false, Ordering::Release);

        let Ok(mut sink) = timeout(CLOSE_TIMEOUT, self.sink.lock()).await else {
            warn!("Sink busy, dropping connection without close handshake");
            return;
        };
        match timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await {
            Ok(Ok(())) => debug!("Close frame sent"),
            Ok(Err(e)) => debug!(error = %e, "Close frame not sent"),
            Err(_) => debug!("Close frame timed out"),
        }
        let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        info!("WebSocket connection closed");
    }
}

/// Slot holding the one active transport.
///
/// Only the backend client replaces or clears it (on the supervisor's
/// behalf); any component may take a reference and write through it.
#[derive(Clone, Default)]
pub struct TransportSlot {
    inner: Arc<RwLock<Option<Arc<dyn Transport>>>>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current transport, if any
    pub fn current(&self) -> Option<Arc<dyn Transport>> {
        self.inner.read().clone()
    }

    /// Install a new transport, returning the one it replaces
    pub fn replace(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.inner.write().replace(transport)
    }

    pub fn take(&self) -> Option<Arc<dyn Transport>> {
        self.inner.write().take()
    }

    pub fn is_alive(&self) -> bool {
        self.current().map_or(false, |t| t.is_alive())
    }

    /// Write a frame through the current transport
    pub async fn send_text(&self, text: String) -> Result<()> {
        match self.current() {
            Some(transport) => transport.send_text(text).await,
            None => Err(AgentError::NotConnected),
        }
    }
}
