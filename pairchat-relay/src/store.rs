//! In-memory per-room chat history.
//!
//! The [`HistoryStore`] keeps a capped FIFO log of messages for every room.
//! It backs the `GET /chat/{target}` endpoint; nothing survives a restart.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::RwLock;

use pairchat_proto::history::{HistoryRecord, SenderProfile};
use pairchat_proto::room::{ParticipantId, RoomId};

/// Default maximum number of stored messages per room before FIFO eviction.
const DEFAULT_MAX_HISTORY: usize = 1000;

/// A message kept for later history requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Sender's id.
    pub sender_id: ParticipantId,
    /// Sender's first name.
    pub first_name: String,
    /// Sender's last name.
    pub last_name: String,
    /// Sender's avatar, if any.
    pub photo_url: Option<String>,
    /// Message body.
    pub text: String,
    /// When the relay accepted the message.
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Converts to the history service's wire shape.
    #[must_use]
    pub fn to_record(&self) -> HistoryRecord {
        HistoryRecord {
            sender_id: Some(SenderProfile {
                id: Some(self.sender_id.clone()),
                first_name: Some(self.first_name.clone()),
                last_name: Some(self.last_name.clone()),
                photo_url: self.photo_url.clone(),
            }),
            text: Some(self.text.clone()),
            created_at: Some(self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

/// In-memory per-room message log with FIFO eviction.
///
/// Each room has an independent log capped at a configurable maximum; when
/// the cap is exceeded the oldest message is dropped.
pub struct HistoryStore {
    rooms: RwLock<HashMap<RoomId, VecDeque<StoredMessage>>>,
    max_per_room: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Creates an empty store with the default per-room cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_per_room(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store with a custom per-room cap.
    #[must_use]
    pub fn with_max_per_room(max_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_per_room,
        }
    }

    /// Appends a message to a room's log, returning the new log length.
    pub async fn append(&self, room_id: &RoomId, message: StoredMessage) -> usize {
        let mut rooms = self.rooms.write().await;
        let log = rooms.entry(room_id.clone()).or_default();
        log.push_back(message);
        if log.len() > self.max_per_room {
            log.pop_front();
        }
        let len = log.len();
        drop(rooms);
        len
    }

    /// All stored messages for a room, oldest first.
    pub async fn history(&self, room_id: &RoomId) -> Vec<HistoryRecord> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|log| log.iter().map(StoredMessage::to_record).collect())
            .unwrap_or_default()
    }

    /// Number of messages stored for a room.
    pub async fn len(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map_or(0, VecDeque::len)
    }
}
