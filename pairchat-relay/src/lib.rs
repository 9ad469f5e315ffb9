//! `PairChat` relay server library.
//!
//! Exposes the relay for use in tests and embedding. The relay accepts
//! WebSocket connections, places each one in the room derived for its
//! participant pair, fans out messages and typing signals, and serves the
//! per-pair history over `GET /chat/{target}`.

pub mod config;
pub mod relay;
pub mod rooms;
pub mod store;
