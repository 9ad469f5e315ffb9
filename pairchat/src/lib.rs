//! `PairChat` -- per-pair realtime chat client library.

pub mod config;
pub mod history;
pub mod net;
pub mod session;
pub mod transport;
pub mod typing;
pub mod user;
