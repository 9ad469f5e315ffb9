//! Chat session state for one conversation.
//!
//! [`ChatSession`] merges the history snapshot and the live event stream
//! into a single ordered message log, tracks whether the peer is typing, and
//! reconciles optimistic local echoes with the server's confirmation.
//!
//! The session is plain data: it never awaits and never touches the
//! network. The coordinator in [`crate::net`] is its only writer.

use std::ops::Range;

use chrono::{DateTime, Utc};

use pairchat_proto::DEFAULT_AVATAR;
use pairchat_proto::event::{ClientMessageId, MessageReceived, ServerEvent};
use pairchat_proto::history::HistoryRecord;
use pairchat_proto::room::{ParticipantId, RoomId, RoomIdError};

use crate::history::{HistoryError, map_record};
use crate::transport::ConnectionStatus;
use crate::user::LocalUser;

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Sender's first name.
    pub first_name: String,
    /// Sender's last name.
    pub last_name: String,
    /// Sender's avatar; never empty.
    pub photo_url: String,
    /// Message body.
    pub text: String,
    /// Server timestamp for history, receipt or send time for live messages.
    pub created_at: DateTime<Utc>,
    /// Sender's stable id, when the source provided one.
    pub sender_id: Option<ParticipantId>,
    /// Correlation id of a locally sent message.
    pub client_id: Option<ClientMessageId>,
    /// Shown locally but not yet echoed by the server.
    pub pending: bool,
    /// Dropped by the transport before the server accepted it.
    pub failed: bool,
}

impl ChatMessage {
    /// Builds a log entry from a live `messageReceived` event.
    #[must_use]
    pub fn from_received(msg: MessageReceived, received_at: DateTime<Utc>) -> Self {
        Self {
            first_name: msg.first_name,
            last_name: msg.last_name,
            photo_url: msg
                .photo_url
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
            text: msg.text,
            created_at: received_at,
            sender_id: msg.sender_id,
            client_id: msg.client_id,
            pending: false,
            failed: false,
        }
    }
}

/// Token identifying one history load. Results for older tokens are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryGeneration(u64);

/// What [`ChatSession::apply_history`] did with a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// History was installed; `buffered` live messages were appended after it.
    Loaded {
        /// Number of history records.
        records: usize,
        /// Live messages released from the buffer.
        buffered: usize,
        /// Log indices that are new: the whole log, since it was replaced.
        appended: Range<usize>,
    },
    /// The fetch failed; the log only received buffered live messages.
    Failed {
        /// Live messages released from the buffer.
        buffered: usize,
        /// Log indices of the released messages.
        appended: Range<usize>,
    },
    /// The result belonged to a superseded or cancelled load.
    Stale,
}

/// What happened to an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Appended to the log at this index.
    Appended(usize),
    /// Confirmed an optimistic echo already in the log at this index.
    Confirmed(usize),
    /// Held until the in-flight history load settles.
    Deferred,
}

/// Mutation produced by one server event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    /// A chat message was appended, confirmed, or deferred.
    Message(MessageOutcome),
    /// The peer-typing flag changed to this value.
    PeerTyping(bool),
}

#[derive(Debug)]
enum HistoryLoad {
    Idle,
    Loading(HistoryGeneration),
}

/// State of one open chat screen.
#[derive(Debug)]
pub struct ChatSession {
    local: LocalUser,
    target: ParticipantId,
    room_id: RoomId,
    messages: Vec<ChatMessage>,
    peer_typing: bool,
    status: ConnectionStatus,
    history: HistoryLoad,
    next_generation: u64,
    /// Live and locally sent messages held while history is loading.
    deferred: Vec<ChatMessage>,
    scroll_requested: bool,
}

impl ChatSession {
    /// Creates an empty session for the conversation with `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError::InvalidInput`] if either participant id is empty.
    pub fn new(local: LocalUser, target: ParticipantId) -> Result<Self, RoomIdError> {
        let room_id = RoomId::derive(&local.id, &target)?;
        Ok(Self {
            local,
            target,
            room_id,
            messages: Vec::new(),
            peer_typing: false,
            status: ConnectionStatus::Connecting,
            history: HistoryLoad::Idle,
            next_generation: 0,
            deferred: Vec::new(),
            scroll_requested: false,
        })
    }

    /// The local user.
    #[must_use]
    pub const fn local(&self) -> &LocalUser {
        &self.local
    }

    /// The chat partner.
    #[must_use]
    pub const fn target(&self) -> &ParticipantId {
        &self.target
    }

    /// The room both participants derive for this pair.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The ordered conversation log.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Whether the peer is currently typing.
    #[must_use]
    pub const fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    /// Last reported connection state.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Whether a history load is in flight.
    #[must_use]
    pub const fn is_loading_history(&self) -> bool {
        matches!(self.history, HistoryLoad::Loading(_))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Start a history load and return its token.
    ///
    /// Any earlier load still in flight becomes stale. Live messages are
    /// deferred until [`apply_history`](Self::apply_history) is called with
    /// the returned token.
    pub fn begin_history_load(&mut self) -> HistoryGeneration {
        self.next_generation += 1;
        let generation = HistoryGeneration(self.next_generation);
        self.history = HistoryLoad::Loading(generation);
        generation
    }

    /// Settle the history load identified by `generation`.
    ///
    /// On success the records replace the log, followed by any deferred live
    /// messages in arrival order. On failure the log keeps what it had and
    /// the deferred messages are appended. Either way the outcome names the
    /// log indices the caller has not been told about yet.
    pub fn apply_history(
        &mut self,
        generation: HistoryGeneration,
        result: Result<Vec<HistoryRecord>, HistoryError>,
        now: DateTime<Utc>,
    ) -> HistoryOutcome {
        match self.history {
            HistoryLoad::Loading(current) if current == generation => {}
            _ => {
                tracing::debug!(?generation, "ignoring stale history result");
                return HistoryOutcome::Stale;
            }
        }
        self.history = HistoryLoad::Idle;

        let buffered = self.deferred.len();
        let outcome = match result {
            Ok(records) => {
                let count = records.len();
                self.messages = records.into_iter().map(|r| map_record(r, now)).collect();
                tracing::info!(records = count, buffered, target = %self.target, "history loaded");
                self.release_deferred();
                HistoryOutcome::Loaded {
                    records: count,
                    buffered,
                    appended: 0..self.messages.len(),
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, target = %self.target, "history load failed");
                let start = self.messages.len();
                self.release_deferred();
                HistoryOutcome::Failed {
                    buffered,
                    appended: start..self.messages.len(),
                }
            }
        };
        self.scroll_requested = true;
        outcome
    }

    /// Abandon any in-flight history load.
    ///
    /// A result that arrives later is reported as [`HistoryOutcome::Stale`].
    pub fn cancel_history_load(&mut self) {
        if self.is_loading_history() {
            tracing::debug!("history load cancelled");
            self.history = HistoryLoad::Idle;
            self.release_deferred();
        }
    }

    fn release_deferred(&mut self) {
        if !self.deferred.is_empty() {
            self.messages.append(&mut self.deferred);
            self.scroll_requested = true;
        }
    }

    // -----------------------------------------------------------------------
    // Live events
    // -----------------------------------------------------------------------

    /// Apply one inbound server event.
    ///
    /// Returns `None` for events that do not change the session.
    pub fn apply_server_event(
        &mut self,
        event: ServerEvent,
        now: DateTime<Utc>,
    ) -> Option<SessionChange> {
        match event {
            ServerEvent::MessageReceived(msg) => {
                Some(SessionChange::Message(self.receive_message(msg, now)))
            }
            ServerEvent::UserTyping => self
                .set_peer_typing(true)
                .then_some(SessionChange::PeerTyping(true)),
            ServerEvent::UserStoppedTyping => self
                .set_peer_typing(false)
                .then_some(SessionChange::PeerTyping(false)),
            ServerEvent::Joined(_) | ServerEvent::Error(_) => None,
        }
    }

    /// Record a live message from the server.
    ///
    /// A message whose `client_id` matches a pending local echo confirms that
    /// echo in place; everything else is appended at the tail.
    pub fn receive_message(&mut self, msg: MessageReceived, now: DateTime<Utc>) -> MessageOutcome {
        if let Some(client_id) = msg.client_id {
            if let Some(index) = find_pending(&self.messages, client_id) {
                let echo = &mut self.messages[index];
                echo.pending = false;
                if echo.sender_id.is_none() {
                    echo.sender_id = msg.sender_id;
                }
                return MessageOutcome::Confirmed(index);
            }
            if let Some(index) = find_pending(&self.deferred, client_id) {
                self.deferred[index].pending = false;
                return MessageOutcome::Deferred;
            }
        }
        self.push(ChatMessage::from_received(msg, now))
    }

    /// Show a message the local user just sent, before the server echoes it.
    ///
    /// Returns the correlation id to send with the message.
    pub fn record_outbound(
        &mut self,
        text: String,
        now: DateTime<Utc>,
    ) -> (ClientMessageId, MessageOutcome) {
        let client_id = ClientMessageId::new();
        let message = ChatMessage {
            first_name: self.local.first_name.clone(),
            last_name: self.local.last_name.clone(),
            photo_url: self
                .local
                .photo_url
                .clone()
                .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
            text,
            created_at: now,
            sender_id: Some(self.local.id.clone()),
            client_id: Some(client_id),
            pending: true,
            failed: false,
        };
        (client_id, self.push(message))
    }

    /// Mark a pending local message as never delivered.
    ///
    /// Returns its log index, or `None` when the message is still held in
    /// the history buffer or is not pending.
    pub fn mark_undelivered(&mut self, client_id: ClientMessageId) -> Option<usize> {
        if let Some(index) = find_pending(&self.messages, client_id) {
            let message = &mut self.messages[index];
            message.pending = false;
            message.failed = true;
            return Some(index);
        }
        if let Some(index) = find_pending(&self.deferred, client_id) {
            let message = &mut self.deferred[index];
            message.pending = false;
            message.failed = true;
        }
        None
    }

    fn push(&mut self, message: ChatMessage) -> MessageOutcome {
        if self.is_loading_history() {
            self.deferred.push(message);
            return MessageOutcome::Deferred;
        }
        self.messages.push(message);
        self.scroll_requested = true;
        MessageOutcome::Appended(self.messages.len() - 1)
    }

    // -----------------------------------------------------------------------
    // Presence and status
    // -----------------------------------------------------------------------

    /// Set the peer-typing flag. Returns whether it changed.
    pub fn set_peer_typing(&mut self, typing: bool) -> bool {
        let changed = self.peer_typing != typing;
        self.peer_typing = typing;
        changed
    }

    /// Clear the peer-typing flag. Returns whether it was set.
    pub fn reset_typing(&mut self) -> bool {
        self.set_peer_typing(false)
    }

    /// Record a connection state change.
    ///
    /// Any state other than `Connected` clears the peer-typing flag, as does
    /// a fresh `Connected` after a reconnect.
    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        if status != ConnectionStatus::Connected || status != self.status {
            self.reset_typing();
        }
        self.status = status;
    }

    // -----------------------------------------------------------------------
    // Presentation helpers
    // -----------------------------------------------------------------------

    /// Whether `message` was written by the local user.
    ///
    /// Compares ids when the message carries one; otherwise falls back to
    /// comparing first names.
    #[must_use]
    pub fn is_own_message(&self, message: &ChatMessage) -> bool {
        is_authored_by(message, &self.local)
    }

    /// Index of the last message when the local user sent it and it was
    /// not dropped.
    ///
    /// That is where the "Seen" marker goes.
    #[must_use]
    pub fn seen_marker_index(&self) -> Option<usize> {
        let last = self.messages.last()?;
        (self.is_own_message(last) && !last.failed).then(|| self.messages.len() - 1)
    }

    /// Return and clear the "scroll to latest" request.
    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.scroll_requested)
    }
}

/// Whether `user` wrote `message`: by id when known, else by first name.
#[must_use]
pub fn is_authored_by(message: &ChatMessage, user: &LocalUser) -> bool {
    message.sender_id.as_ref().map_or_else(
        || message.first_name == user.first_name,
        |id| *id == user.id,
    )
}

fn find_pending(log: &[ChatMessage], client_id: ClientMessageId) -> Option<usize> {
    log.iter()
        .rposition(|m| m.pending && m.client_id == Some(client_id))
}
