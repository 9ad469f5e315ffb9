//! Transport layer for `PairChat`.
//!
//! A [`Connector`] opens one [`Connection`] at a time; the
//! [`supervisor::ChatTransport`] owns it, performs the join handshake, and
//! reconnects with backoff when it drops. Implementations:
//! - [`ws::WsConnector`] -- JSON text frames over a WebSocket
//! - [`loopback::LoopbackConnector`] -- in-process channels for testing

pub mod loopback;
pub mod supervisor;
pub mod ws;

use std::fmt;
use std::future::Future;

use pairchat_proto::event::{ClientEvent, ProtocolError, ServerEvent};
use pairchat_proto::room::{RoomId, RoomIdError};

pub use supervisor::{ChatTransport, TransportEvent};

/// Connection state surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Joined to the room; sends go out immediately.
    Connected,
    /// Connection lost; waiting before retry number `attempt`.
    Reconnecting {
        /// 1-based retry counter.
        attempt: u32,
    },
    /// Closed locally or retry budget exhausted.
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The server answered the join announcement with an error.
    #[error("join rejected: {0}")]
    JoinRejected(String),

    /// The server placed us in a different room than we derived.
    #[error("room mismatch: derived {expected}, server joined {actual}")]
    RoomMismatch {
        /// Room derived locally.
        expected: RoomId,
        /// Room reported by the server.
        actual: RoomId,
    },

    /// The participant ids cannot form a room.
    #[error("invalid participants: {0}")]
    InvalidParticipants(#[from] RoomIdError),

    /// An outbound event could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live bidirectional event channel to the chat server.
///
/// Inbound frames that fail to decode are dropped by the implementation;
/// [`Connection::recv`] only yields well-formed events.
pub trait Connection: Send + 'static {
    /// Send one event to the server.
    fn send(
        &mut self,
        event: &ClientEvent,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next event, or `None` once the connection is gone.
    fn recv(&mut self) -> impl Future<Output = Option<ServerEvent>> + Send;

    /// Close the connection. Safe to call more than once.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Factory for [`Connection`]s, called once per (re)connect attempt.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced.
    type Conn: Connection;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}
