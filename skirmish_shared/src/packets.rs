//! The game protocol's packets.
//!
//! | id  | packet       | direction | urgency   |
//! |-----|--------------|-----------|-----------|
//! | 1   | Handshake    | to server | normal    |
//! | 2   | WorldInfo    | to client | normal    |
//! | 3   | Chat         | both      | normal    |
//! | 4   | SpawnEntity  | to client | normal    |
//! | 5   | DamageEntity | to client | normal    |
//! | 6   | MoveEntity   | both      | normal    |
//! | 255 | Kicked       | to client | immediate |

use bytes::Bytes;

use crate::{
    codec::{ByteStream, MAX_STRING_LEN},
    entities::sanitize_username,
    entity::{Entity, EntityId, EntityRegistry},
    error::{EntityError, PacketError},
    math::{angle_from_wire, angle_to_wire, Vec2},
    packet::{Directions, Packet, PacketInfo, PacketKind, PacketRegistry},
    packet_any,
};

pub const PROTOCOL_VERSION: u16 = 1;
pub const WORLD_VERSION: u16 = 1;
pub const MAX_USERNAME_LEN: usize = 32;

/// First packet of every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u16,
    pub username: String,
}

impl Handshake {
    pub fn new(username: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            username: sanitize_username(username),
        }
    }
}

impl Packet for Handshake {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        self.protocol_version = input.read_u16()?;
        self.username = sanitize_username(&input.read_string(MAX_STRING_LEN)?);
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_u16(self.protocol_version);
        out.write_string(&self.username)?;
        Ok(())
    }

    packet_any!();
}

impl PacketKind for Handshake {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(1, Directions::TO_SERVER));
}

/// Tells a freshly joined client which entity it controls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldInfo {
    pub world_version: u16,
    pub player_entity_id: EntityId,
}

impl Packet for WorldInfo {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        self.world_version = input.read_u16()?;
        self.player_entity_id = input.read_u32()?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_u16(self.world_version);
        out.write_u32(self.player_entity_id);
        Ok(())
    }

    packet_any!();
}

impl PacketKind for WorldInfo {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(2, Directions::TO_CLIENT));
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chat {
    pub message: String,
}

impl Chat {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Packet for Chat {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        self.message = input.read_string(MAX_STRING_LEN)?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_string(&self.message)?;
        Ok(())
    }

    packet_any!();
}

impl PacketKind for Chat {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(3, Directions::BOTH));
}

/// An entity entering the client's view, in entity wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnEntity {
    pub data: Bytes,
}

impl SpawnEntity {
    pub fn from_entity(registry: &EntityRegistry, entity: &dyn Entity) -> Result<Self, EntityError> {
        Ok(Self {
            data: registry.encode_entity(entity)?,
        })
    }

    /// Rebuilds the carried entity; `None` when it cannot be decoded.
    pub fn entity(&self, registry: &EntityRegistry) -> Option<Box<dyn Entity>> {
        registry.decode_entity(&self.data)
    }
}

impl Packet for SpawnEntity {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        let len = input.read_u32()? as usize;
        self.data = Bytes::copy_from_slice(input.read_bytes(len)?);
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_u32(self.data.len() as u32);
        out.write_bytes(&self.data);
        Ok(())
    }

    packet_any!();
}

impl PacketKind for SpawnEntity {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(4, Directions::TO_CLIENT));
}

/// Health change of an entity. Also announces removals (`killed` with zero
/// health and damage).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DamageEntity {
    pub entity_id: EntityId,
    /// Zero when there is no attacker.
    pub attacker_id: EntityId,
    pub health: u32,
    pub damage: i32,
    pub killed: bool,
}

impl DamageEntity {
    pub fn removal(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            killed: true,
            ..Self::default()
        }
    }

    pub fn attacker(&self) -> Option<EntityId> {
        (self.attacker_id != 0).then_some(self.attacker_id)
    }
}

impl Packet for DamageEntity {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        self.entity_id = input.read_u32()?;
        self.attacker_id = input.read_u32()?;
        self.health = input.read_u32()?;
        self.damage = input.read_i32()?;
        self.killed = input.read_bool()?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_u32(self.entity_id);
        out.write_u32(self.attacker_id);
        out.write_u32(self.health);
        out.write_i32(self.damage);
        out.write_bool(self.killed);
        Ok(())
    }

    packet_any!();
}

impl PacketKind for DamageEntity {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(5, Directions::TO_CLIENT));
}

/// One entity's movement state. Angles are whole degrees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMove {
    pub entity_id: EntityId,
    pub position: Vec2,
    pub speed: f32,
    pub head_angle: u16,
    pub move_angle: u16,
    pub strafe_angle: u16,
    pub moving: bool,
    pub teleport: bool,
}

impl EntityMove {
    /// Snapshot of `entity`. `speed` is the walking speed, sent whether or
    /// not the entity is moving; angles and speed stay zero for entities
    /// that cannot walk.
    pub fn of(entity: &dyn Entity, teleport: bool) -> Self {
        let mut m = Self {
            entity_id: entity.id(),
            position: entity.core().position(),
            teleport,
            ..Self::default()
        };
        if let Some(living) = entity.living() {
            m.speed = living.default_speed;
            m.head_angle = angle_to_wire(living.head_angle);
            m.move_angle = angle_to_wire(living.move_angle);
            m.strafe_angle = angle_to_wire(living.strafe_angle);
            m.moving = living.is_moving();
        }
        m
    }

    /// Writes this move into `entity`: position, angles and walking state.
    pub fn apply_to(&self, entity: &mut dyn Entity) {
        entity.core_mut().set_position(self.position);
        if let Some(living) = entity.living_mut() {
            living.head_angle = angle_from_wire(self.head_angle);
            living.move_angle = angle_from_wire(self.move_angle);
            living.strafe_angle = angle_from_wire(self.strafe_angle);
            living.set_moving(self.moving);
        }
    }

    fn read(input: &mut ByteStream) -> Result<Self, PacketError> {
        Ok(Self {
            entity_id: input.read_u32()?,
            position: Vec2::read_from(input)?,
            speed: input.read_f32()?,
            head_angle: input.read_u16()? % 360,
            move_angle: input.read_u16()? % 360,
            strafe_angle: input.read_u16()? % 360,
            moving: input.read_bool()?,
            teleport: input.read_bool()?,
        })
    }

    fn write(&self, out: &mut ByteStream) {
        out.write_u32(self.entity_id);
        self.position.write_to(out);
        out.write_f32(self.speed);
        out.write_u16(self.head_angle);
        out.write_u16(self.move_angle);
        out.write_u16(self.strafe_angle);
        out.write_bool(self.moving);
        out.write_bool(self.teleport);
    }
}

/// Batch of movement updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveEntity {
    pub moves: Vec<EntityMove>,
}

impl MoveEntity {
    pub fn single(m: EntityMove) -> Self {
        Self { moves: vec![m] }
    }

    pub fn push(&mut self, m: EntityMove) {
        self.moves.push(m);
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

impl Packet for MoveEntity {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        let count = input.read_u16()?;
        self.moves = (0..count)
            .map(|_| EntityMove::read(input))
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        let count = u16::try_from(self.moves.len()).map_err(|_| {
            PacketError::Codec(crate::error::CodecError::ValueTooLarge {
                len: self.moves.len(),
                max: usize::from(u16::MAX),
            })
        })?;
        out.write_u16(count);
        for m in &self.moves {
            m.write(out);
        }
        Ok(())
    }

    packet_any!();
}

impl PacketKind for MoveEntity {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(6, Directions::BOTH));
}

/// Last packet a kicked client receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Kicked {
    pub reason: String,
}

impl Kicked {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.trim().to_string(),
        }
    }
}

impl Packet for Kicked {
    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), PacketError> {
        self.reason = input.read_string(MAX_STRING_LEN)?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), PacketError> {
        out.write_string(&self.reason)?;
        Ok(())
    }

    packet_any!();
}

impl PacketKind for Kicked {
    const INFO: Option<PacketInfo> = Some(PacketInfo::new(255, Directions::TO_CLIENT).immediate());
}

/// Installs the game protocol.
pub fn register_standard_packets(registry: &mut PacketRegistry) -> Result<(), PacketError> {
    registry.register::<Handshake>()?;
    registry.register::<WorldInfo>()?;
    registry.register::<Chat>()?;
    registry.register::<SpawnEntity>()?;
    registry.register::<DamageEntity>()?;
    registry.register::<MoveEntity>()?;
    registry.register::<Kicked>()?;
    Ok(())
}
