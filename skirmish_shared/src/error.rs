//! Error taxonomy for the shared libraries.
//!
//! Decode faults (`CodecError`, `PacketError::BadPacketId`,
//! `EntityError::BadEntityId`) are recovered locally by the caller: the
//! offending message or entity is dropped and logged. Registration faults are
//! startup configuration errors and should abort initialization.

use thiserror::Error;

/// Faults raised by [`crate::codec::ByteStream`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("reached end of stream: needed {needed} bytes, {remaining} remaining")]
    EndOfStream { needed: usize, remaining: usize },

    #[error("string too big: {len} code units (max {max})")]
    ValueTooLarge { len: usize, max: usize },

    #[error("received string length longer than maximum allowed ({len} > {max})")]
    LengthExceeded { len: usize, max: usize },

    #[error("string is not valid UTF-16")]
    InvalidString,
}

/// Faults raised by the packet registry and frame protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet with id {0} already exists")]
    DuplicateId(u16),

    #[error("packet \"{0}\" already exists")]
    DuplicateType(&'static str),

    #[error("{0} not decorated with packet info")]
    NotDecorated(&'static str),

    #[error("packet id {id} does not fit a {bits}-bit identifier")]
    IdOutOfRange { id: u16, bits: u8 },

    #[error("bad packet id {0}")]
    BadPacketId(u16),

    #[error("unknown packet for write: {0}")]
    UnknownPacket(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Faults raised by the entity registry and entity wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("entity with type id {0} already exists")]
    DuplicateId(u16),

    #[error("entity \"{0}\" already exists")]
    DuplicateType(&'static str),

    #[error("{0} not decorated as entity")]
    NotDecorated(&'static str),

    #[error("bad entity id {0}")]
    BadEntityId(u16),

    #[error("entity type {0} has no type id")]
    MissingTypeId(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Faults raised by [`crate::world::World`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("entity id {0} is already live")]
    IdInUse(u32),

    #[error("entity id must be positive")]
    InvalidId,
}
