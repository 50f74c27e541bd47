//! `skirmish_shared`
//!
//! Protocol and simulation core shared by the server and its clients.
//!
//! Design goals:
//! - Explicit, versionable binary serialization (codec, packets, entities).
//! - One authoritative world, mutated only by its owner.
//! - Traits at the seams (packets, entities, transport).
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod entities;
pub mod entity;
pub mod error;
pub mod event;
pub mod math;
pub mod net;
pub mod packet;
pub mod packets;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::entities::*;
    pub use crate::entity::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::packet::*;
    pub use crate::packets::*;
    pub use crate::world::*;
}
