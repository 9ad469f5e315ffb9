//! Shared protocol definitions for the `PairChat` wire format.

pub mod event;
pub mod history;
pub mod room;

/// Avatar path used whenever a sender has no photo URL.
pub const DEFAULT_AVATAR: &str = "/default-avatar.png";
