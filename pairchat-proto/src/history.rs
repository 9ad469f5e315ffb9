//! Response shapes of the message-history service.
//!
//! `GET /chat/{targetUserId}` returns a [`HistoryResponse`]. Every field the
//! client does not strictly need is optional so that partially populated
//! records still load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::room::ParticipantId;

/// Body of a history response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Stored messages, oldest first.
    #[serde(default)]
    pub messages: Vec<HistoryRecord>,
}

/// One stored message as returned by the history service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// Populated sender profile. The service names this field `senderId`.
    #[serde(default)]
    pub sender_id: Option<SenderProfile>,
    /// Message body.
    #[serde(default)]
    pub text: Option<String>,
    /// Server creation time as an ISO-8601 string.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Sender profile nested inside a [`HistoryRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    /// Stable id of the sender, when the service includes it.
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ParticipantId>,
    /// First name.
    #[serde(default)]
    pub first_name: Option<String>,
    /// Last name.
    #[serde(default)]
    pub last_name: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl HistoryRecord {
    /// Parses `created_at` as an RFC 3339 timestamp.
    ///
    /// Returns `None` when the field is missing or unparseable.
    #[must_use]
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
