//! Entities and the entity wire format.
//!
//! Every entity owns an [`EntityCore`] (identity, position, size, health and
//! listeners) and implements [`Entity`] on top of it. Concrete types are
//! registered with an [`EntityRegistry`] under a numeric type id.
//!
//! Wire layout of one entity:
//!
//! ```text
//! [type id: u16][entity id: u32][x: f32][y: f32][health: u32][payload...]
//! ```
//!
//! The registry writes and reads the base fields; the payload is produced by
//! the concrete type, whose `read_data`/`write_data` call their parent link
//! first so base fields always precede derived ones.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
};

use bytes::Bytes;
use tracing::warn;

use crate::{
    codec::ByteStream,
    entities::Living,
    error::EntityError,
    event::EntityEvent,
    math::Vec2,
    world::{TickContext, WorldHandle},
};

/// Entity identifier, unique within one world. Zero means "not assigned".
pub type EntityId = u32;

/// Callback receiving an entity's own notifications.
pub type EntityListener = Box<dyn FnMut(EntityId, &EntityEvent) + Send>;

/// State shared by every entity kind.
pub struct EntityCore {
    id: EntityId,
    world: Option<WorldHandle>,
    position: Vec2,
    size: Vec2,
    health: u32,
    max_health: u32,
    last_attacker: Option<EntityId>,
    listeners: Vec<EntityListener>,
}

impl fmt::Debug for EntityCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCore")
            .field("id", &self.id)
            .field("world", &self.world)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("health", &self.health)
            .field("max_health", &self.max_health)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl EntityCore {
    /// A detached entity at full health.
    pub fn new(size: Vec2, max_health: u32) -> Self {
        Self {
            id: 0,
            world: None,
            position: Vec2::ZERO,
            size,
            health: max_health,
            max_health,
            last_attacker: None,
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Handle of the owning world while the entity is live.
    pub fn world(&self) -> Option<WorldHandle> {
        self.world
    }

    pub fn is_live(&self) -> bool {
        self.world.is_some()
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec2) {
        self.position = position;
    }

    pub fn size(&self) -> Vec2 {
        self.size
    }

    pub fn center(&self) -> Vec2 {
        self.position + self.size * 0.5
    }

    pub fn health(&self) -> u32 {
        self.health
    }

    pub fn max_health(&self) -> u32 {
        self.max_health
    }

    pub fn is_dead(&self) -> bool {
        self.health == 0
    }

    pub fn last_attacker(&self) -> Option<EntityId> {
        self.last_attacker
    }

    /// Sets health clamped to `[0, max_health]`. Fires `Died` when this call
    /// moves health from positive to zero.
    pub fn set_health(&mut self, health: i64) {
        let clamped = health.clamp(0, i64::from(self.max_health)) as u32;
        if clamped == self.health {
            return;
        }
        let was_dead = self.is_dead();
        self.health = clamped;
        if !was_dead && self.is_dead() {
            self.emit(EntityEvent::Died);
        }
    }

    /// Returns false when nothing was applied (non-positive power or dead).
    pub fn heal(&mut self, power: u32, healer: Option<EntityId>) -> bool {
        if power == 0 || self.is_dead() {
            return false;
        }
        self.last_attacker = healer;
        self.set_health(i64::from(self.health) + i64::from(power));
        self.emit(EntityEvent::Healed {
            amount: power,
            healer,
        });
        true
    }

    /// Returns false when nothing was applied (non-positive power or dead).
    pub fn damage(&mut self, power: u32, attacker: Option<EntityId>) -> bool {
        if power == 0 || self.is_dead() {
            return false;
        }
        self.last_attacker = attacker;
        self.set_health(i64::from(self.health) - i64::from(power));
        self.emit(EntityEvent::Damaged {
            amount: power,
            attacker,
        });
        true
    }

    pub fn kill(&mut self) {
        self.set_health(0);
    }

    pub fn subscribe(&mut self, listener: EntityListener) {
        self.listeners.push(listener);
    }

    pub fn emit(&mut self, event: EntityEvent) {
        let id = self.id;
        for listener in &mut self.listeners {
            listener(id, &event);
        }
    }

    pub(crate) fn attach(&mut self, id: EntityId, world: WorldHandle) {
        self.id = id;
        self.world = Some(world);
        self.health = self.max_health;
    }

    pub(crate) fn detach(&mut self) {
        self.world = None;
    }

    fn write_base(&self, out: &mut ByteStream) {
        out.write_u32(self.id);
        self.position.write_to(out);
        out.write_u32(self.health);
    }

    fn read_base(&mut self, input: &mut ByteStream) -> Result<(), EntityError> {
        self.id = input.read_u32()?;
        self.position = Vec2::read_from(input)?;
        self.health = input.read_u32()?.min(self.max_health);
        Ok(())
    }
}

/// Behaviour and payload of one entity kind.
pub trait Entity: Any + Send + fmt::Debug {
    fn core(&self) -> &EntityCore;

    fn core_mut(&mut self) -> &mut EntityCore;

    /// Advances the entity by `delta` nominal ticks.
    fn tick(&mut self, _delta: f32, _ctx: &mut TickContext<'_>) {}

    /// Reads the type-specific payload. Overrides call their parent link first.
    fn read_data(&mut self, _input: &mut ByteStream) -> Result<(), EntityError> {
        Ok(())
    }

    /// Writes the type-specific payload. Overrides call their parent link first.
    fn write_data(&self, _out: &mut ByteStream) -> Result<(), EntityError> {
        Ok(())
    }

    /// Movement state for entities that walk.
    fn living(&self) -> Option<&Living> {
        None
    }

    fn living_mut(&mut self) -> Option<&mut Living> {
        None
    }

    fn entity_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A concrete, registrable entity type.
///
/// Types that leave `TYPE_ID` as `None` are rejected at registration.
pub trait EntityKind: Entity + Default {
    const TYPE_ID: Option<u16> = None;
}

impl dyn Entity {
    pub fn id(&self) -> EntityId {
        self.core().id()
    }

    pub fn is<T: Entity>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Entity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Entity>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Implements the naming and `Any` plumbing of [`Entity`] for a concrete type.
#[macro_export]
macro_rules! entity_any {
    () => {
        fn entity_name(&self) -> &'static str {
            ::std::any::type_name::<Self>()
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }
    };
}

type EntityFactory = fn() -> Box<dyn Entity>;

fn create<T: EntityKind>() -> Box<dyn Entity> {
    Box::new(T::default())
}

/// Bidirectional entity type <-> type id map and wire codec.
#[derive(Default)]
pub struct EntityRegistry {
    by_id: HashMap<u16, (&'static str, EntityFactory)>,
    by_type: HashMap<TypeId, u16>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: EntityKind>(&mut self) -> Result<u16, EntityError> {
        let name = type_name::<T>();
        let type_id = T::TYPE_ID.ok_or(EntityError::NotDecorated(name))?;

        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(EntityError::DuplicateType(name));
        }
        if self.by_id.contains_key(&type_id) {
            return Err(EntityError::DuplicateId(type_id));
        }

        self.by_id.insert(type_id, (name, create::<T>));
        self.by_type.insert(TypeId::of::<T>(), type_id);
        Ok(type_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn is_registered(&self, type_id: u16) -> bool {
        self.by_id.contains_key(&type_id)
    }

    pub fn type_id_of<T: Entity>(&self) -> Option<u16> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Type id of an already-built entity.
    pub fn type_id_for(&self, entity: &dyn Entity) -> Option<u16> {
        self.by_type.get(&entity.as_any().type_id()).copied()
    }

    /// Instantiates a detached entity of `type_id`.
    pub fn create(&self, type_id: u16) -> Option<Box<dyn Entity>> {
        self.by_id.get(&type_id).map(|(_, create)| create())
    }

    pub fn write_entity(&self, entity: &dyn Entity, out: &mut ByteStream) -> Result<(), EntityError> {
        let type_id = self
            .type_id_for(entity)
            .ok_or(EntityError::MissingTypeId(entity.entity_name()))?;
        out.write_u16(type_id);
        entity.core().write_base(out);
        entity.write_data(out)
    }

    pub fn encode_entity(&self, entity: &dyn Entity) -> Result<Bytes, EntityError> {
        let mut out = ByteStream::with_capacity(64);
        self.write_entity(entity, &mut out)?;
        Ok(out.into_bytes())
    }

    pub fn try_read_entity(&self, input: &mut ByteStream) -> Result<Box<dyn Entity>, EntityError> {
        let type_id = input.read_u16()?;
        let mut entity = self
            .create(type_id)
            .ok_or(EntityError::BadEntityId(type_id))?;
        entity.core_mut().read_base(input)?;
        entity.read_data(input)?;
        Ok(entity)
    }

    /// Decodes one entity; faults are logged and yield `None` ("not spawned").
    pub fn read_entity(&self, input: &mut ByteStream) -> Option<Box<dyn Entity>> {
        match self.try_read_entity(input) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(error = %e, "Failed to decode entity");
                None
            }
        }
    }

    pub fn decode_entity(&self, data: &[u8]) -> Option<Box<dyn Entity>> {
        self.read_entity(&mut ByteStream::from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::entities::{register_standard_entities, Player, Zombie};

    #[derive(Debug)]
    struct Crate {
        core: EntityCore,
        loot: u8,
    }

    impl Default for Crate {
        fn default() -> Self {
            Self {
                core: EntityCore::new(Vec2::new(16.0, 16.0), 10),
                loot: 0,
            }
        }
    }

    impl Entity for Crate {
        fn core(&self) -> &EntityCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut EntityCore {
            &mut self.core
        }

        fn read_data(&mut self, input: &mut ByteStream) -> Result<(), EntityError> {
            self.loot = input.read_u8()?;
            Ok(())
        }

        fn write_data(&self, out: &mut ByteStream) -> Result<(), EntityError> {
            out.write_u8(self.loot);
            Ok(())
        }

        entity_any!();
    }

    impl EntityKind for Crate {}

    fn registry() -> EntityRegistry {
        let mut reg = EntityRegistry::new();
        register_standard_entities(&mut reg).unwrap();
        reg
    }

    #[test]
    fn registration_failures() {
        let mut reg = registry();
        assert!(matches!(
            reg.register::<Player>(),
            Err(EntityError::DuplicateType(_))
        ));
        assert!(matches!(
            reg.register::<Crate>(),
            Err(EntityError::NotDecorated(_))
        ));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn player_round_trip() {
        let reg = registry();
        let mut player = Player::with_username("alice");
        player.core.set_position(Vec2::new(12.5, -3.0));
        player.core.set_health(42);
        player.living.default_speed = 2.0;
        player.living.current_speed = 2.0;
        player.living.head_angle = 1.25;
        player.living.strafe_angle = 0.5;

        let bytes = reg.encode_entity(&player).unwrap();
        assert_eq!(&bytes[..2], &0u16.to_le_bytes());

        let decoded = reg.decode_entity(&bytes).unwrap();
        let back = decoded.downcast_ref::<Player>().unwrap();
        assert_eq!(back.core.id(), player.core.id());
        assert_eq!(back.core.position(), player.core.position());
        assert_eq!(back.core.health(), 42);
        assert_eq!(back.living, player.living);
        assert_eq!(back.username(), "alice");
        assert!(!back.core.is_live());
    }

    #[test]
    fn base_fields_precede_payload() {
        let reg = registry();
        let zombie = Zombie::default();
        let bytes = reg.encode_entity(&zombie).unwrap();
        // type id + id + position + health + four living floats
        assert_eq!(bytes.len(), 2 + 4 + 8 + 4 + 16);
        let speed = f32::from_le_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]);
        assert_eq!(speed, zombie.living.default_speed);
    }

    #[test]
    fn zombie_round_trip() {
        let reg = registry();
        let mut world = crate::world::World::with_seed(4);
        let id = world
            .spawn(Box::new(Zombie::at(Vec2::new(-7.5, 30.25))), None)
            .unwrap();
        {
            let zombie = world.get_mut(id).unwrap().downcast_mut::<Zombie>().unwrap();
            zombie.core.set_health(13);
            zombie.living.start();
            zombie.living.head_angle = 2.5;
            zombie.living.strafe_angle = 0.25;
        }
        let original = world.get(id).unwrap().downcast_ref::<Zombie>().unwrap();

        let bytes = reg.encode_entity(original).unwrap();
        assert_eq!(&bytes[..2], &crate::entities::ZOMBIE_TYPE_ID.to_le_bytes());

        let decoded = reg.decode_entity(&bytes).unwrap();
        let back = decoded.downcast_ref::<Zombie>().unwrap();
        assert_eq!(back.core.id(), id);
        assert_eq!(back.core.position(), Vec2::new(-7.5, 30.25));
        assert_eq!(back.core.health(), 13);
        assert_eq!(back.living.default_speed, original.living.default_speed);
        assert_eq!(back.living.current_speed, original.living.current_speed);
        assert_eq!(back.living.head_angle, 2.5);
        assert_eq!(back.living.strafe_angle, 0.25);
        assert!(back.living.is_moving());
    }

    #[test]
    fn unknown_type_id_yields_none() {
        let reg = registry();
        let mut out = ByteStream::new();
        out.write_u16(77);
        out.write_u32(1);
        assert!(reg.decode_entity(out.as_slice()).is_none());
        assert!(matches!(
            reg.try_read_entity(&mut ByteStream::from_slice(out.as_slice())),
            Err(EntityError::BadEntityId(77))
        ));
    }

    #[test]
    fn truncated_entity_yields_none() {
        let reg = registry();
        let bytes = reg.encode_entity(&Player::with_username("bob")).unwrap();
        assert!(reg.decode_entity(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn unregistered_type_cannot_be_written() {
        let reg = registry();
        assert!(matches!(
            reg.encode_entity(&Crate::default()),
            Err(EntityError::MissingTypeId(_))
        ));
    }

    #[test]
    fn health_stays_in_bounds_and_died_fires_once() {
        let deaths = Arc::new(AtomicUsize::new(0));
        let mut core = EntityCore::new(Vec2::ZERO, 100);
        let counter = Arc::clone(&deaths);
        core.subscribe(Box::new(move |_, event| {
            if *event == EntityEvent::Died {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let steps: [(bool, u32); 8] = [
            (false, 30),
            (true, 500),
            (false, 99),
            (false, 250),
            (false, 10),
            (true, 50),
            (false, 1),
            (true, 1),
        ];
        for (heal, power) in steps {
            if heal {
                core.heal(power, None);
            } else {
                core.damage(power, Some(7));
            }
            assert!(core.health() <= core.max_health());
        }

        assert!(core.is_dead());
        assert_eq!(deaths.load(Ordering::SeqCst), 1);
        // Dead entities cannot be healed back.
        assert!(!core.heal(10, None));
        assert_eq!(core.last_attacker(), Some(7));
    }

    #[test]
    fn center_is_offset_by_half_size() {
        let mut core = EntityCore::new(Vec2::new(32.0, 16.0), 1);
        core.set_position(Vec2::new(10.0, 10.0));
        assert_eq!(core.center(), Vec2::new(26.0, 18.0));
    }
}
