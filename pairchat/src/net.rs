//! Chat-screen coordinator.
//!
//! Wires the presentation layer to the session state, the typing debouncer,
//! the history client, and the chat transport. One background task per open
//! chat screen owns all of them and is the only writer of the
//! [`ChatSession`]:
//!
//! ```text
//! UI  ─── ChatCommand ──▶  coordinator task  ◀── TransportEvent ── ChatTransport
//!     ◀── ChatUpdate ───        │   ▲
//!     ◀── ChatSnapshot ──┘      ▼   └── history result ── HistorySource
//!                         TypingDebouncer deadline
//! ```
//!
//! Switching to another chat partner is [`ChatHandle::close`] followed by a
//! new [`open_chat`] / [`spawn_chat`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use pairchat_proto::event::{ClientMessageId, MAX_TEXT_LEN};
use pairchat_proto::history::HistoryRecord;
use pairchat_proto::room::{ParticipantId, RoomId, RoomIdError};

use crate::config::ReconnectConfig;
use crate::history::{HistoryError, HistorySource, HttpHistoryClient};
use crate::session::{
    ChatMessage, ChatSession, HistoryGeneration, HistoryOutcome, MessageOutcome, SessionChange,
};
use crate::transport::ws::WsConnector;
use crate::transport::{ChatTransport, ConnectionStatus, Connector, TransportError, TransportEvent};
use crate::typing::{TypingChange, TypingDebouncer};
use crate::user::LocalUser;

/// Commands from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// The input field changed.
    Input {
        /// Current input text.
        text: String,
    },
    /// The user submitted a message.
    Send {
        /// Message text; surrounding whitespace is trimmed.
        text: String,
    },
    /// Leave the chat screen.
    Close,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// A message was added to the end of the log.
    MessageAppended {
        /// Position in the log.
        index: usize,
        /// The new entry.
        message: ChatMessage,
    },
    /// A pending local echo was confirmed by the server.
    MessageConfirmed {
        /// Position in the log.
        index: usize,
    },
    /// A local message was dropped before reaching the server.
    MessageFailed {
        /// Position in the log.
        index: usize,
    },
    /// A submitted message was refused for its length and not recorded.
    MessageTooLong {
        /// Length of the trimmed text in bytes.
        len: usize,
        /// Largest accepted length in bytes.
        max: usize,
    },
    /// The peer started or stopped typing.
    PeerTyping(bool),
    /// The connection state changed.
    Status(ConnectionStatus),
    /// History replaced the log. One [`ChatUpdate::MessageAppended`] per
    /// entry of the new log follows.
    HistoryLoaded {
        /// Number of history records.
        records: usize,
    },
    /// History could not be fetched; the log shows live messages only.
    /// Messages held back during the fetch follow as
    /// [`ChatUpdate::MessageAppended`].
    HistoryFailed,
    /// The coordinator has shut down.
    Closed,
}

/// Point-in-time view of the chat screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    /// The conversation log.
    pub messages: Vec<ChatMessage>,
    /// Whether the peer is typing.
    pub peer_typing: bool,
    /// Connection state.
    pub status: ConnectionStatus,
    /// Index of the message that gets the "Seen" marker.
    pub seen_marker: Option<usize>,
    /// Whether history is still loading.
    pub loading_history: bool,
    /// Whether the view should scroll to the latest message.
    pub scroll_to_latest: bool,
}

/// Errors from opening a chat screen.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The participant ids cannot form a room.
    #[error("invalid participants: {0}")]
    InvalidParticipants(#[from] RoomIdError),

    /// The transport could not be started.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The history client could not be built.
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// The coordinator task is gone.
    #[error("chat is closed")]
    Closed,
}

/// Everything needed to open a chat screen against real servers.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Realtime WebSocket URL.
    pub server_url: String,
    /// Base URL of the history service.
    pub api_base: String,
    /// Session cookie forwarded to the history service.
    pub session_cookie: Option<String>,
    /// The signed-in user.
    pub local: LocalUser,
    /// The chat partner.
    pub target: ParticipantId,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Timeout for the history request.
    pub history_timeout: Duration,
    /// Typing quiet period.
    pub typing_quiet_period: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Channel capacity for command/update channels.
    pub channel_capacity: usize,
}

/// Tunables for [`spawn_chat`].
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Typing quiet period.
    pub typing_quiet_period: Duration,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Channel capacity for command/update channels.
    pub channel_capacity: usize,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            typing_quiet_period: crate::typing::DEFAULT_QUIET_PERIOD,
            reconnect: ReconnectConfig::default(),
            channel_capacity: 256,
        }
    }
}

/// Handle to a running chat screen.
pub struct ChatHandle {
    room_id: RoomId,
    local: LocalUser,
    cmd_tx: mpsc::Sender<ChatCommand>,
    snapshot: Arc<Mutex<ChatSnapshot>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChatHandle {
    /// The room for this conversation.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Whether the local user wrote `message`.
    #[must_use]
    pub fn is_own_message(&self, message: &ChatMessage) -> bool {
        crate::session::is_authored_by(message, &self.local)
    }

    /// Report an input change (keystroke).
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Closed`] if the chat has shut down.
    pub async fn input(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.command(ChatCommand::Input { text: text.into() }).await
    }

    /// Submit a message. Blank messages are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Closed`] if the chat has shut down.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.command(ChatCommand::Send { text: text.into() }).await
    }

    /// Forward a raw command.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Closed`] if the chat has shut down.
    pub async fn command(&self, cmd: ChatCommand) -> Result<(), ChatError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ChatError::Closed)
    }

    /// Copy of the current chat view.
    #[must_use]
    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.lock().clone()
    }

    /// Return and clear the "scroll to latest" request.
    pub fn take_scroll_request(&self) -> bool {
        std::mem::take(&mut self.snapshot.lock().scroll_to_latest)
    }

    /// Leave the chat screen: cancel the history fetch, stop typing
    /// presence, and close the connection.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.cmd_tx.send(ChatCommand::Close).await;
        if let Err(e) = task.await {
            tracing::warn!(err = %e, "chat coordinator failed");
        }
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Open a chat screen against the configured WebSocket and history servers.
///
/// # Errors
///
/// Returns [`ChatError`] if the participants are invalid or the history
/// endpoint cannot be built.
pub fn open_chat(
    config: ChatConfig,
) -> Result<(ChatHandle, mpsc::Receiver<ChatUpdate>), ChatError> {
    let connector =
        WsConnector::new(config.server_url).with_connect_timeout(config.connect_timeout);
    let history = HttpHistoryClient::new(
        &config.api_base,
        config.local.id.clone(),
        config.session_cookie,
        config.history_timeout,
    )?;
    let options = ChatOptions {
        typing_quiet_period: config.typing_quiet_period,
        reconnect: config.reconnect,
        channel_capacity: config.channel_capacity,
    };
    spawn_chat(connector, history, config.local, config.target, options)
}

/// Spawn the coordinator for the `(local, target)` conversation.
///
/// Starts the connection and the history fetch concurrently and returns
/// immediately.
///
/// # Errors
///
/// Returns [`ChatError::InvalidParticipants`] if either id is empty.
pub fn spawn_chat<C: Connector, H: HistorySource>(
    connector: C,
    history: H,
    local: LocalUser,
    target: ParticipantId,
    options: ChatOptions,
) -> Result<(ChatHandle, mpsc::Receiver<ChatUpdate>), ChatError> {
    let session = ChatSession::new(local.clone(), target.clone())?;
    let capacity = options.channel_capacity.max(1);
    let (transport, transport_rx) = ChatTransport::open(
        connector,
        local.clone(),
        target,
        options.reconnect.clone(),
        capacity,
    )?;
    let room_id = session.room_id().clone();

    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (update_tx, update_rx) = mpsc::channel(capacity);
    let snapshot = Arc::new(Mutex::new(ChatSnapshot {
        messages: Vec::new(),
        peer_typing: false,
        status: session.status(),
        seen_marker: None,
        loading_history: true,
        scroll_to_latest: false,
    }));

    let coordinator = Coordinator {
        session,
        transport,
        debouncer: TypingDebouncer::new(options.typing_quiet_period),
        update_tx,
        snapshot: Arc::clone(&snapshot),
    };
    let task = tokio::spawn(coordinator.run(Arc::new(history), cmd_rx, transport_rx));

    Ok((
        ChatHandle {
            room_id,
            local,
            cmd_tx,
            snapshot,
            task: Some(task),
        },
        update_rx,
    ))
}

type HistoryResult = (HistoryGeneration, Result<Vec<HistoryRecord>, HistoryError>);

struct Coordinator {
    session: ChatSession,
    transport: ChatTransport,
    debouncer: TypingDebouncer,
    update_tx: mpsc::Sender<ChatUpdate>,
    snapshot: Arc<Mutex<ChatSnapshot>>,
}

impl Coordinator {
    async fn run<H: HistorySource>(
        mut self,
        history: Arc<H>,
        mut cmd_rx: mpsc::Receiver<ChatCommand>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let (history_tx, mut history_rx) = mpsc::channel::<HistoryResult>(1);
        let generation = self.session.begin_history_load();
        let target = self.session.target().clone();
        let history_task = tokio::spawn(async move {
            let result = history.fetch(&target).await;
            let _ = history_tx.send((generation, result)).await;
        });
        self.publish_snapshot();

        loop {
            let deadline = self.debouncer.deadline();
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ChatCommand::Close) => break,
                    Some(ChatCommand::Input { text }) => self.on_input(&text),
                    Some(ChatCommand::Send { text }) => self.on_send(&text).await,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    if let Some(TypingChange::Stopped) = self.debouncer.on_deadline(Instant::now()) {
                        self.transport.signal_stop_typing();
                    }
                }
                Some(event) = transport_rx.recv() => self.on_transport_event(event).await,
                Some((generation, result)) = history_rx.recv() => {
                    self.on_history(generation, result).await;
                }
            }
        }

        history_task.abort();
        self.session.cancel_history_load();
        // Queued ahead of the shutdown, so the peer sees it before the close.
        if let Some(TypingChange::Stopped) = self.debouncer.on_send() {
            self.transport.signal_stop_typing();
        }
        self.transport.close().await;
        self.session.set_connection_status(ConnectionStatus::Disconnected);
        self.publish([
            ChatUpdate::Status(ConnectionStatus::Disconnected),
            ChatUpdate::Closed,
        ])
        .await;
        tracing::info!(room_id = %self.session.room_id(), "chat closed");
    }

    fn on_input(&mut self, text: &str) {
        if text.is_empty() {
            // Clearing the field ends the burst like a send would.
            if let Some(TypingChange::Stopped) = self.debouncer.on_send() {
                self.transport.signal_stop_typing();
            }
            return;
        }
        if let Some(TypingChange::Started) = self.debouncer.on_input(Instant::now()) {
            self.transport.signal_typing();
        }
    }

    async fn on_send(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if text.len() > MAX_TEXT_LEN {
            tracing::warn!(len = text.len(), max = MAX_TEXT_LEN, "message too long, not sent");
            self.publish([ChatUpdate::MessageTooLong {
                len: text.len(),
                max: MAX_TEXT_LEN,
            }])
            .await;
            return;
        }
        if let Some(TypingChange::Stopped) = self.debouncer.on_send() {
            self.transport.signal_stop_typing();
        }

        let (client_id, outcome) = self.session.record_outbound(text.to_string(), Utc::now());
        let update = self.message_update(outcome);
        self.publish(update).await;
        self.submit(text, client_id).await;
    }

    async fn submit(&mut self, text: &str, client_id: ClientMessageId) {
        if let Err(e) = self.transport.send(text.to_string(), client_id).await {
            tracing::warn!(err = %e, %client_id, "message not sent");
            let update = self
                .session
                .mark_undelivered(client_id)
                .map(|index| ChatUpdate::MessageFailed { index });
            self.publish(update).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let mut updates = Vec::new();
        match event {
            TransportEvent::Status(status) => {
                let was_typing = self.session.peer_typing();
                self.session.set_connection_status(status);
                if status != ConnectionStatus::Connected {
                    // Nothing can be delivered; start a fresh burst next time.
                    self.debouncer.reset();
                }
                updates.push(ChatUpdate::Status(status));
                if was_typing && !self.session.peer_typing() {
                    updates.push(ChatUpdate::PeerTyping(false));
                }
            }
            TransportEvent::Inbound(event) => {
                match self.session.apply_server_event(event, Utc::now()) {
                    Some(SessionChange::Message(outcome)) => {
                        updates.extend(self.message_update(outcome));
                    }
                    Some(SessionChange::PeerTyping(typing)) => {
                        updates.push(ChatUpdate::PeerTyping(typing));
                    }
                    None => {}
                }
            }
            TransportEvent::Undelivered(client_id) => {
                tracing::warn!(%client_id, "message dropped by transport");
                updates.extend(
                    self.session
                        .mark_undelivered(client_id)
                        .map(|index| ChatUpdate::MessageFailed { index }),
                );
            }
        }
        self.publish(updates).await;
    }

    async fn on_history(
        &mut self,
        generation: HistoryGeneration,
        result: Result<Vec<HistoryRecord>, HistoryError>,
    ) {
        let (update, appended) = match self.session.apply_history(generation, result, Utc::now())
        {
            HistoryOutcome::Loaded {
                records, appended, ..
            } => (ChatUpdate::HistoryLoaded { records }, appended),
            HistoryOutcome::Failed { appended, .. } => (ChatUpdate::HistoryFailed, appended),
            HistoryOutcome::Stale => return,
        };
        let mut updates = vec![update];
        updates.extend(
            appended.filter_map(|index| self.message_update(MessageOutcome::Appended(index))),
        );
        self.publish(updates).await;
    }

    fn message_update(&self, outcome: MessageOutcome) -> Option<ChatUpdate> {
        match outcome {
            MessageOutcome::Appended(index) => {
                self.session
                    .messages()
                    .get(index)
                    .map(|message| ChatUpdate::MessageAppended {
                        index,
                        message: message.clone(),
                    })
            }
            MessageOutcome::Confirmed(index) => Some(ChatUpdate::MessageConfirmed { index }),
            MessageOutcome::Deferred => None,
        }
    }

    /// Refresh the snapshot, then notify. Readers woken by an update always
    /// see a snapshot that includes it.
    async fn publish(&mut self, updates: impl IntoIterator<Item = ChatUpdate>) {
        self.publish_snapshot();
        for update in updates {
            self.emit(update).await;
        }
    }

    async fn emit(&self, update: ChatUpdate) {
        if self.update_tx.send(update).await.is_err() {
            tracing::debug!("chat update receiver dropped");
        }
    }

    fn publish_snapshot(&mut self) {
        let mut snapshot = self.snapshot.lock();
        *snapshot = snapshot_of(&mut self.session, &snapshot);
    }
}

fn snapshot_of(session: &mut ChatSession, previous: &ChatSnapshot) -> ChatSnapshot {
    ChatSnapshot {
        messages: session.messages().to_vec(),
        peer_typing: session.peer_typing(),
        status: session.status(),
        seen_marker: session.seen_marker_index(),
        loading_history: session.is_loading_history(),
        // Sticky until the view takes it.
        scroll_to_latest: session.take_scroll_request() || previous.scroll_to_latest,
    }
}
