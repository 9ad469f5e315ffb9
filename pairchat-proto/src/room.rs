//! Deterministic room identity for a pair of participants.
//!
//! Both peers compute the same [`RoomId`] for their conversation without any
//! negotiation. The relay computes it too when a connection joins, and echoes
//! the result back so the client can check its own derivation.
//!
//! Wire format of the digest input:
//! `[u32 len (BE)][low id bytes][u32 len (BE)][high id bytes]`
//! where "low" and "high" are the two identifiers sorted byte-wise.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors produced by room identity derivation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    /// One of the participant identifiers was empty.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// An identifier is too long to be length-prefixed with a `u32`.
    #[error("invalid input: identifier of {0} bytes exceeds the length prefix")]
    TooLong(usize),
}

/// Stable, opaque identifier of a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Channel identifier shared by exactly one unordered pair of participants.
///
/// Always 64 lowercase hex characters (a SHA-256 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derives the room identifier for the pair `(a, b)`.
    ///
    /// The result does not depend on argument order.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError::InvalidInput`] if either identifier is empty.
    pub fn derive(a: &ParticipantId, b: &ParticipantId) -> Result<Self, RoomIdError> {
        derive(a.as_str(), b.as_str())
    }

    /// Wraps an already-derived identifier, e.g. one echoed by the server.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the room identifier for two raw identifier strings.
///
/// # Errors
///
/// Returns [`RoomIdError::InvalidInput`] if either identifier is empty, or
/// [`RoomIdError::TooLong`] if one does not fit a `u32` length prefix.
pub fn derive(a: &str, b: &str) -> Result<RoomId, RoomIdError> {
    if a.is_empty() || b.is_empty() {
        return Err(RoomIdError::InvalidInput("participant id must not be empty"));
    }

    let (low, high) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };

    let mut hasher = Sha256::new();
    for id in [low, high] {
        let len = u32::try_from(id.len()).map_err(|_| RoomIdError::TooLong(id.len()))?;
        hasher.update(len.to_be_bytes());
        hasher.update(id.as_bytes());
    }
    Ok(RoomId(hex::encode(hasher.finalize())))
}
