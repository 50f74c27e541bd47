//! `skirmish_server`
//!
//! Server-side systems:
//! - Connection pipeline (decode, queue, dispatch, flush)
//! - Session lifecycle (handshake, promotion, in-world handling)
//! - World replication to in-world players
//! - Fixed-rate tick loop
//!
//! Networking model:
//! - TCP with length-prefixed frames; one packet per binary frame

pub mod connection;
pub mod server;
pub mod session;
pub mod sync;

pub use server::{GameServer, ServerContext};
