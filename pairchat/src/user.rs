//! The signed-in user on this client.

use pairchat_proto::room::ParticipantId;

/// Profile of the local user, as needed by the chat protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    /// Stable participant id.
    pub id: ParticipantId,
    /// First name, shown to the peer and used by legacy own-message checks.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Avatar URL, if the user has one.
    pub photo_url: Option<String>,
}

impl LocalUser {
    /// Creates a user with no last name and no avatar.
    pub fn new(id: impl Into<ParticipantId>, first_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: first_name.into(),
            last_name: String::new(),
            photo_url: None,
        }
    }

    /// Sets the last name.
    #[must_use]
    pub fn with_last_name(mut self, last_name: impl Into<String>) -> Self {
        self.last_name = last_name.into();
        self
    }

    /// Sets the avatar URL.
    #[must_use]
    pub fn with_photo_url(mut self, photo_url: impl Into<String>) -> Self {
        self.photo_url = Some(photo_url.into());
        self
    }
}
