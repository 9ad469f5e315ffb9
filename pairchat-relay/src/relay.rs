//! Relay server core: shared state, WebSocket handler, and the history
//! endpoint.
//!
//! Every connection announces itself with `joinChat`. The server derives the
//! room for the pair (the placement is authoritative), adds the connection
//! to it, and acknowledges with `joined { roomId }`. Messages are broadcast
//! to the whole room, the sender included, and appended to the room's
//! history; typing signals go to the other members only. A connection that
//! leaves its room mid-burst is reported to the others as having stopped
//! typing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use pairchat_proto::event::{
    self, ClientEvent, Joined, MessageReceived, SendMessage, ServerError, ServerEvent,
    TypingSignal,
};
use pairchat_proto::history::HistoryResponse;
use pairchat_proto::room::{self, ParticipantId, RoomId};

use crate::rooms::{ConnId, RoomMembers};
use crate::store::{HistoryStore, StoredMessage};

/// Header carrying the caller's identity on history requests.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared relay server state.
pub struct RelayState {
    /// Live room membership.
    pub rooms: RoomMembers,
    /// Per-room message history.
    pub store: HistoryStore,
    next_conn: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(HistoryStore::new())
    }

    /// Creates a relay state around a pre-configured history store.
    #[must_use]
    pub fn with_store(store: HistoryStore) -> Self {
        Self {
            rooms: RoomMembers::new(),
            store,
            next_conn: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a WebSocket Close frame to every joined connection.
    ///
    /// Clients see a disconnect and start reconnecting.
    pub async fn close_all_connections(&self) {
        self.rooms.close_all().await;
    }
}

/// Where a connection currently sits.
#[derive(Debug, Clone)]
struct Membership {
    room_id: RoomId,
    user_id: ParticipantId,
    /// Last typing signal relayed for this member was `typing`.
    typing: bool,
}

/// Per-connection context passed to the frame handlers.
struct Conn<'a> {
    id: ConnId,
    state: &'a RelayState,
    tx: &'a mpsc::UnboundedSender<Message>,
    joined: Option<Membership>,
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Frames are read and decoded as JSON client events.
/// 2. `joinChat` places the connection in the pair's room (and moves it out
///    of any previous room).
/// 3. On disconnect, the connection leaves its room, ending any typing burst
///    it had announced.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.next_conn_id();
    tracing::debug!(conn_id, "connection opened");

    // Writer: forwards queued frames to the socket.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut conn = Conn {
        id: conn_id,
        state: &state,
        tx: &tx,
        joined: None,
    };

    let reader = async {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => conn.handle_frame(text.as_str()).await,
                Message::Binary(data) => {
                    tracing::warn!(conn_id, len = data.len(), "ignoring binary frame");
                }
                Message::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    };

    tokio::select! {
        () = reader => {}
        _ = &mut write_task => {}
    }
    write_task.abort();

    conn.leave().await;
    tracing::debug!(conn_id, "connection closed");
}

impl Conn<'_> {
    async fn handle_frame(&mut self, frame: &str) {
        let event = match event::decode_client(frame) {
            Ok(evt) => evt,
            Err(e) => {
                tracing::warn!(conn_id = self.id, error = %e, "rejecting client frame");
                self.send_error(e.to_string());
                return;
            }
        };
        tracing::debug!(conn_id = self.id, event = event.name(), "client event");

        match event {
            ClientEvent::JoinChat(join) => {
                self.join(join.user_id, &join.target_user_id, &join.first_name)
                    .await;
            }
            ClientEvent::SendMessage(msg) => self.relay_message(msg).await,
            ClientEvent::Typing(signal) => self.relay_typing(&signal, true).await,
            ClientEvent::StopTyping(signal) => self.relay_typing(&signal, false).await,
        }
    }

    async fn join(&mut self, user_id: ParticipantId, target: &ParticipantId, first_name: &str) {
        let room_id = match RoomId::derive(&user_id, target) {
            Ok(id) => id,
            Err(e) => {
                self.send_error(e.to_string());
                return;
            }
        };

        if self
            .joined
            .as_ref()
            .is_some_and(|previous| previous.room_id != room_id)
        {
            self.leave().await;
        }
        self.state
            .rooms
            .join(&room_id, self.id, self.tx.clone())
            .await;
        tracing::info!(
            conn_id = self.id,
            user_id = %user_id,
            first_name,
            room_id = %room_id,
            "joined room"
        );

        self.send(&ServerEvent::Joined(Joined {
            room_id: room_id.clone(),
        }));
        let typing = self
            .joined
            .take()
            .is_some_and(|previous| previous.room_id == room_id && previous.typing);
        self.joined = Some(Membership {
            room_id,
            user_id,
            typing,
        });
    }

    /// Leave the current room, telling the others if a burst was open.
    async fn leave(&mut self) {
        let Some(membership) = self.joined.take() else {
            return;
        };
        self.state.rooms.leave(&membership.room_id, self.id).await;
        if membership.typing {
            match event::encode_server(&ServerEvent::UserStoppedTyping) {
                Ok(frame) => {
                    self.state
                        .rooms
                        .broadcast(&membership.room_id, &frame, Some(self.id))
                        .await;
                }
                Err(e) => tracing::error!(error = %e, "failed to encode userStoppedTyping"),
            }
        }
        tracing::info!(
            conn_id = self.id,
            user_id = %membership.user_id,
            room_id = %membership.room_id,
            stopped_typing = membership.typing,
            "left room"
        );
    }

    async fn relay_message(&self, msg: SendMessage) {
        let Some(membership) = &self.joined else {
            self.send_error("join a chat before sending".to_string());
            return;
        };
        if msg.user_id != membership.user_id {
            tracing::warn!(
                conn_id = self.id,
                claimed = %msg.user_id,
                joined = %membership.user_id,
                "sender id does not match joined user"
            );
            self.send_error("userId does not match the joined user".to_string());
            return;
        }
        match room::derive(msg.user_id.as_str(), msg.target_user_id.as_str()) {
            Ok(room_id) if room_id == membership.room_id => {}
            _ => {
                self.send_error("not joined to a chat with that user".to_string());
                return;
            }
        }

        let stored = StoredMessage {
            sender_id: msg.user_id.clone(),
            first_name: msg.first_name.clone(),
            last_name: msg.last_name.clone(),
            photo_url: msg.photo_url.clone(),
            text: msg.text.clone(),
            created_at: Utc::now(),
        };
        self.state.store.append(&membership.room_id, stored).await;

        let out = ServerEvent::MessageReceived(MessageReceived {
            first_name: msg.first_name,
            last_name: msg.last_name,
            text: msg.text,
            photo_url: msg.photo_url,
            sender_id: Some(msg.user_id),
            client_id: msg.client_id,
        });
        match event::encode_server(&out) {
            Ok(frame) => {
                let delivered = self
                    .state
                    .rooms
                    .broadcast(&membership.room_id, &frame, None)
                    .await;
                tracing::debug!(room_id = %membership.room_id, delivered, "message relayed");
            }
            Err(e) => tracing::error!(error = %e, "failed to encode messageReceived"),
        }
    }

    async fn relay_typing(&mut self, signal: &TypingSignal, typing: bool) {
        let Some(membership) = &mut self.joined else {
            tracing::debug!(conn_id = self.id, "typing signal before join, ignoring");
            return;
        };
        if signal.room_id != membership.room_id {
            tracing::warn!(
                conn_id = self.id,
                signalled = %signal.room_id,
                joined = %membership.room_id,
                "typing signal for another room, ignoring"
            );
            return;
        }
        membership.typing = typing;
        let out = if typing {
            ServerEvent::UserTyping
        } else {
            ServerEvent::UserStoppedTyping
        };
        match event::encode_server(&out) {
            Ok(frame) => {
                self.state
                    .rooms
                    .broadcast(&membership.room_id, &frame, Some(self.id))
                    .await;
            }
            Err(e) => tracing::error!(error = %e, "failed to encode typing event"),
        }
    }

    fn send(&self, event: &ServerEvent) {
        match event::encode_server(event) {
            Ok(frame) => {
                let _ = self.tx.send(Message::Text(frame.into()));
            }
            Err(e) => tracing::error!(error = %e, event = event.name(), "failed to encode"),
        }
    }

    fn send_error(&self, reason: String) {
        self.send(&ServerEvent::Error(ServerError { reason }));
    }
}

/// `GET /chat/{target}`: stored messages between the caller and `target`.
///
/// The caller is identified by the `X-User-Id` header.
///
/// # Errors
///
/// `401` without a caller id, `400` when the pair cannot form a room.
pub async fn history_handler(
    State(state): State<Arc<RelayState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, (StatusCode, String)> {
    let Some(caller) = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    else {
        return Err((StatusCode::UNAUTHORIZED, "missing X-User-Id".to_string()));
    };
    let room_id =
        room::derive(caller, &target).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let messages = state.store.history(&room_id).await;
    tracing::debug!(caller, target = %target, count = messages.len(), "history served");
    Ok(Json(HistoryResponse { messages }))
}

/// Starts the relay server on the given address.
///
/// Returns the bound address and a [`tokio::task::JoinHandle`] for the
/// server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/chat/{target}", axum::routing::get(history_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(event::MAX_FRAME_LEN)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
