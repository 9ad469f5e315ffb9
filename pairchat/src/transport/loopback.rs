//! Loopback connector for testing.
//!
//! Every [`LoopbackConnector::connect`] creates a fresh pair of in-process
//! channels and hands the server side ([`LoopbackServer`]) to whoever holds
//! the matching [`LoopbackAcceptor`]. Frames still pass through the JSON
//! codec, so tests exercise the same encode/validate path as the WebSocket
//! connector. Dropping a [`LoopbackServer`] simulates the server going away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use pairchat_proto::event::{self, ClientEvent, ServerEvent};

use super::{Connection, Connector, TransportError};

/// Connector that produces in-process connections.
#[derive(Clone)]
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<LoopbackServer>,
    refuse: Arc<AtomicBool>,
    buffer: usize,
}

/// Receives the server side of every connection opened by the paired
/// [`LoopbackConnector`].
pub struct LoopbackAcceptor {
    accept_rx: mpsc::UnboundedReceiver<LoopbackServer>,
    refuse: Arc<AtomicBool>,
}

/// Client side of a loopback connection.
pub struct LoopbackConnection {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

/// Server side of a loopback connection, driven by the test.
pub struct LoopbackServer {
    rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<String>,
}

impl LoopbackConnector {
    /// Create a connector and the acceptor that receives its connections.
    ///
    /// `buffer` is the per-direction channel capacity.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, LoopbackAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        (
            Self {
                accept_tx,
                refuse: Arc::clone(&refuse),
                buffer,
            },
            LoopbackAcceptor { accept_rx, refuse },
        )
    }
}

impl Connector for LoopbackConnector {
    type Conn = LoopbackConnection;

    async fn connect(&self) -> Result<LoopbackConnection, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("loopback".into()));
        }
        let (client_tx, server_rx) = mpsc::channel(self.buffer);
        let (server_tx, client_rx) = mpsc::channel(self.buffer);
        self.accept_tx
            .send(LoopbackServer {
                rx: server_rx,
                tx: server_tx,
            })
            .map_err(|_| TransportError::Unreachable("loopback".into()))?;
        Ok(LoopbackConnection {
            tx: Some(client_tx),
            rx: client_rx,
        })
    }
}

impl LoopbackAcceptor {
    /// Wait for the next connection attempt.
    pub async fn accept(&mut self) -> Option<LoopbackServer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connection for LoopbackConnection {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        let frame = event::encode_client(event)?;
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<ServerEvent> {
        loop {
            let frame = self.rx.recv().await?;
            match event::decode_server(&frame) {
                Ok(evt) => return Some(evt),
                Err(e) => tracing::warn!(err = %e, "dropping malformed loopback frame"),
            }
        }
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

impl LoopbackServer {
    /// Receive the next client event, or `None` once the client closed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the client sent an invalid frame.
    pub async fn recv(&mut self) -> Option<Result<ClientEvent, event::ProtocolError>> {
        let frame = self.rx.recv().await?;
        Some(event::decode_client(&frame))
    }

    /// Send an event to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client is gone.
    pub async fn send(&self, event: &ServerEvent) -> Result<(), TransportError> {
        let frame = event::encode_server(event)?;
        self.send_raw(frame).await
    }

    /// Send an arbitrary text frame, bypassing the encoder.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client is gone.
    pub async fn send_raw(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(frame.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
