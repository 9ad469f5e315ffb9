//! Realtime protocol events exchanged over the chat WebSocket.
//!
//! Every frame is a JSON text frame of the form
//! `{"event": "<name>", "data": { ... }}` with camelCase field names.
//! [`ClientEvent`] flows client → server, [`ServerEvent`] server → client.
//! Decoding validates the payload shape; anything that fails is a
//! [`ProtocolError`] and must be dropped by the receiver, never acted on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::room::{ParticipantId, RoomId};

/// Maximum accepted length of a message text, in bytes.
pub const MAX_TEXT_LEN: usize = 16 * 1024;

/// Maximum accepted size of a single encoded frame, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Error type for event encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not match any known event shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame parsed but violates a protocol rule.
    #[error("protocol violation: {0}")]
    Violation(String),
    /// The frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    Oversized(usize),
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Client-generated correlation id attached to an outbound message.
///
/// The server echoes it on the matching `messageReceived`, which lets the
/// sender reconcile its optimistic local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMessageId(Uuid);

impl ClientMessageId {
    /// Creates a new time-ordered correlation id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientMessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Join announcement: the first event on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChat {
    /// Display name of the joining user.
    pub first_name: String,
    /// Stable id of the joining user.
    pub user_id: ParticipantId,
    /// Stable id of the user on the other side of the chat.
    pub target_user_id: ParticipantId,
}

/// A chat message sent by the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Sender first name.
    pub first_name: String,
    /// Sender last name.
    #[serde(default)]
    pub last_name: String,
    /// Stable id of the sender.
    pub user_id: ParticipantId,
    /// Stable id of the recipient.
    pub target_user_id: ParticipantId,
    /// Message body.
    pub text: String,
    /// Sender avatar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    /// Correlation id for echo reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// Payload of `typing` and `stopTyping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    /// Room the signal applies to.
    pub room_id: RoomId,
}

/// Server acknowledgement of a join, carrying the room the server placed
/// the connection into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    /// Server-derived room id.
    pub room_id: RoomId,
}

/// A chat message delivered to every member of the room, sender included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    /// Sender first name.
    pub first_name: String,
    /// Sender last name.
    #[serde(default)]
    pub last_name: String,
    /// Message body. Empty only when the server omitted it.
    #[serde(default)]
    pub text: String,
    /// Sender avatar, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    /// Stable id of the sender, when the server provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ParticipantId>,
    /// Correlation id copied from the originating `sendMessage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// Server-reported error condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Human-readable error description.
    pub reason: String,
}

/// Events sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// `joinChat`
    JoinChat(JoinChat),
    /// `sendMessage`
    SendMessage(SendMessage),
    /// `typing`
    Typing(TypingSignal),
    /// `stopTyping`
    StopTyping(TypingSignal),
}

/// Events sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// `joined`
    Joined(Joined),
    /// `messageReceived`
    MessageReceived(MessageReceived),
    /// `userTyping`
    UserTyping,
    /// `userStoppedTyping`
    UserStoppedTyping,
    /// `error`
    Error(ServerError),
}

impl ClientEvent {
    /// Returns the wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinChat(_) => "joinChat",
            Self::SendMessage(_) => "sendMessage",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stopTyping",
        }
    }

    /// Checks the protocol rules that the type system does not encode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Violation`] describing the first broken rule.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::JoinChat(join) => {
                require_id(&join.user_id, "userId")?;
                require_id(&join.target_user_id, "targetUserId")
            }
            Self::SendMessage(msg) => {
                require_id(&msg.user_id, "userId")?;
                require_id(&msg.target_user_id, "targetUserId")?;
                if msg.text.trim().is_empty() {
                    return Err(ProtocolError::Violation("text must not be blank".into()));
                }
                check_text_len(&msg.text)
            }
            Self::Typing(signal) | Self::StopTyping(signal) => check_room_id(&signal.room_id),
        }
    }
}

impl ServerEvent {
    /// Returns the wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Joined(_) => "joined",
            Self::MessageReceived(_) => "messageReceived",
            Self::UserTyping => "userTyping",
            Self::UserStoppedTyping => "userStoppedTyping",
            Self::Error(_) => "error",
        }
    }

    /// Checks the protocol rules that the type system does not encode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Violation`] describing the first broken rule.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Joined(joined) => check_room_id(&joined.room_id),
            Self::MessageReceived(msg) => {
                if let Some(sender) = &msg.sender_id {
                    require_id(sender, "senderId")?;
                }
                check_text_len(&msg.text)
            }
            Self::UserTyping | Self::UserStoppedTyping | Self::Error(_) => Ok(()),
        }
    }
}

/// Encodes a [`ClientEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `ProtocolError::Violation` if the event breaks a protocol rule,
/// or `ProtocolError::Serialization` if it cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, ProtocolError> {
    event.validate()?;
    serde_json::to_string(event).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decodes and validates a [`ClientEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for oversized, malformed or invalid frames.
pub fn decode_client(frame: &str) -> Result<ClientEvent, ProtocolError> {
    let event: ClientEvent = parse(frame)?;
    event.validate()?;
    Ok(event)
}

/// Encodes a [`ServerEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `ProtocolError::Violation` if the event breaks a protocol rule,
/// or `ProtocolError::Serialization` if it cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    event.validate()?;
    serde_json::to_string(event).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decodes and validates a [`ServerEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns a [`ProtocolError`] for oversized, malformed or invalid frames.
pub fn decode_server(frame: &str) -> Result<ServerEvent, ProtocolError> {
    let event: ServerEvent = parse(frame)?;
    event.validate()?;
    Ok(event)
}

fn parse<T: serde::de::DeserializeOwned>(frame: &str) -> Result<T, ProtocolError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(frame.len()));
    }
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn require_id(id: &ParticipantId, field: &str) -> Result<(), ProtocolError> {
    if id.as_str().trim().is_empty() {
        return Err(ProtocolError::Violation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn check_text_len(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_TEXT_LEN {
        return Err(ProtocolError::Violation(format!(
            "text is {} bytes (max {MAX_TEXT_LEN})",
            text.len()
        )));
    }
    Ok(())
}

fn check_room_id(room_id: &RoomId) -> Result<(), ProtocolError> {
    let hex = room_id.as_str();
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(ProtocolError::Violation(format!("invalid roomId: {hex:?}")));
    }
    Ok(())
}
