//! Room membership for the relay server.
//!
//! Tracks which live connections are joined to which [`RoomId`]. A room
//! exists while at least one connection is in it; entries are ephemeral and
//! lost on restart.

use std::collections::HashMap;

use axum::extract::ws::Message;
use tokio::sync::{RwLock, mpsc};

use pairchat_proto::room::RoomId;

/// Server-assigned identifier of one WebSocket connection.
pub type ConnId = u64;

/// In-memory room → connections directory.
#[derive(Default)]
pub struct RoomMembers {
    rooms: RwLock<HashMap<RoomId, HashMap<ConnId, mpsc::UnboundedSender<Message>>>>,
}

impl RoomMembers {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to a room. Re-joining the same room replaces the
    /// stored sender.
    pub async fn join(&self, room_id: &RoomId, conn: ConnId, tx: mpsc::UnboundedSender<Message>) {
        let mut rooms = self.rooms.write().await;
        rooms.entry(room_id.clone()).or_default().insert(conn, tx);
    }

    /// Removes a connection from a room, dropping the room when it empties.
    pub async fn leave(&self, room_id: &RoomId, conn: ConnId) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(&conn);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Sends a frame to every member of a room except `skip`.
    ///
    /// Returns how many connections the frame was queued for.
    pub async fn broadcast(&self, room_id: &RoomId, frame: &str, skip: Option<ConnId>) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|(conn, _)| Some(**conn) != skip)
            .filter(|(_, tx)| tx.send(Message::Text(frame.to_owned().into())).is_ok())
            .count()
    }

    /// Number of connections in a room.
    pub async fn member_count(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map_or(0, HashMap::len)
    }

    /// Sends a Close frame to every connection in every room.
    pub async fn close_all(&self) {
        let rooms = self.rooms.read().await;
        for (room_id, members) in rooms.iter() {
            tracing::info!(room_id = %room_id, members = members.len(), "closing room connections");
            for tx in members.values() {
                let _ = tx.send(Message::Close(None));
            }
        }
    }
}
