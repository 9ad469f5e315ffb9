//! WebSocket connector for `PairChat`.
//!
//! Each [`WsConnection`] wraps one WebSocket to the chat server. Outbound
//! [`ClientEvent`]s are written as JSON text frames; a background reader task
//! decodes inbound frames into [`ServerEvent`]s. Malformed frames are logged
//! and skipped so a misbehaving server cannot take the session down.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use pairchat_proto::event::{self, ClientEvent, ServerEvent};

use super::{Connection, Connector, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the channel between the reader task and [`WsConnection::recv`].
const INBOUND_BUFFER: usize = 256;

/// Opens WebSocket connections to a fixed server URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for `url` (ws:// or wss://).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Return the server URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    /// Open a WebSocket to the server and start the reader task.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake does not finish in time.
    /// - [`TransportError::Unreachable`] if the server refuses the connection.
    /// - [`TransportError::Io`] for TLS, HTTP, and other handshake failures.
    async fn connect(&self) -> Result<WsConnection, TransportError> {
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, err = %e, "WebSocket connect failed");
                    map_ws_connect_error(&self.url, e)
                })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let reader = tokio::spawn(reader_loop(ws_reader, tx));

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(WsConnection {
            ws_sender,
            incoming: rx,
            reader,
            closed: false,
        })
    }
}

/// A single WebSocket connection to the chat server.
pub struct WsConnection {
    ws_sender: WsSender,
    incoming: mpsc::Receiver<ServerEvent>,
    reader: tokio::task::JoinHandle<()>,
    closed: bool,
}

impl Connection for WsConnection {
    /// Encode and write one event as a text frame.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionClosed`] if the socket is closed or the write fails.
    /// - [`TransportError::Protocol`] if the event breaks a protocol rule.
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = event::encode_client(event)?;
        self.ws_sender
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, event = event.name(), "WebSocket send failed");
                TransportError::ConnectionClosed
            })
    }

    async fn recv(&mut self) -> Option<ServerEvent> {
        self.incoming.recv().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws_sender.close().await {
            tracing::debug!(err = %e, "WebSocket close handshake failed");
        }
        self.reader.abort();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background task that reads WebSocket frames and decodes them.
///
/// Exits when the socket closes or errors, or when the connection is dropped.
/// Dropping `tx` on exit is what makes [`WsConnection::recv`] return `None`.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::Sender<ServerEvent>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match event::decode_server(text.as_str()) {
                Ok(evt) => {
                    if tx.send(evt).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "dropping malformed server frame");
                }
            },
            Ok(Message::Binary(data)) => {
                tracing::warn!(len = data.len(), "dropping unexpected binary frame");
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    tracing::debug!("WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "HTTP error during upgrade: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
