//! The simulated world.
//!
//! - Owns the live entity set and the allocated id set.
//! - Advances entities once per tick, removing the dead.
//! - Answers nearest-entity queries.
//! - Records [`WorldEvent`]s for replication.

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU32, Ordering},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use crate::{
    entity::{Entity, EntityId},
    error::WorldError,
    event::{EntityEvent, EventQueue, WorldEvent},
    math::Vec2,
};

/// Largest id the world hands out.
pub const MAX_ENTITY_ID: EntityId = i32::MAX as EntityId;

static NEXT_WORLD_HANDLE: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a [`World`]; what an entity keeps as its
/// back-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldHandle(pub u32);

impl WorldHandle {
    fn new_unique() -> Self {
        Self(NEXT_WORLD_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Restricts a nearest-entity query to some entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    Exact(TypeId),
    /// Any entity with movement state.
    Living,
}

impl TypeFilter {
    pub fn of<T: Entity>() -> Self {
        Self::Exact(TypeId::of::<T>())
    }

    pub fn matches(&self, entity: &dyn Entity) -> bool {
        match self {
            Self::Exact(t) => entity.as_any().type_id() == *t,
            Self::Living => entity.living().is_some(),
        }
    }
}

/// Where a nearest-entity query measures from.
#[derive(Clone, Copy)]
pub enum Origin<'e> {
    Point(Vec2),
    /// The entity's center; the entity itself is excluded.
    Entity(&'e dyn Entity),
}

/// Entities sharing one exact squared distance.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceBucket {
    pub distance_sq: f32,
    pub ids: Vec<EntityId>,
}

/// Closest match of a nearest-entity query.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    /// True (non-squared) distance.
    pub distance: f32,
    /// Every entity tied at that distance.
    pub ids: Vec<EntityId>,
}

/// Nearest-entity query parameters.
#[derive(Clone, Copy)]
pub struct NearestQuery<'q> {
    pub origin: Origin<'q>,
    /// Zero means unbounded.
    pub max_distance: f32,
    pub filter: Option<TypeFilter>,
    pub exclude: &'q [EntityId],
}

impl<'q> NearestQuery<'q> {
    pub fn new(origin: Origin<'q>) -> Self {
        Self {
            origin,
            max_distance: 0.0,
            filter: None,
            exclude: &[],
        }
    }

    pub fn within(mut self, max_distance: f32) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn filter(mut self, filter: TypeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn exclude(mut self, ids: &'q [EntityId]) -> Self {
        self.exclude = ids;
        self
    }
}

type EntityMap = HashMap<EntityId, Box<dyn Entity>>;

fn bucket_by_distance(entities: &EntityMap, query: &NearestQuery<'_>) -> Vec<DistanceBucket> {
    let (center, self_id) = match query.origin {
        Origin::Point(p) => (p, None),
        Origin::Entity(e) => (e.core().center(), Some(e.id())),
    };
    let max_sq = query.max_distance * query.max_distance;

    let mut hits: Vec<(f32, EntityId)> = entities
        .iter()
        .filter(|(id, _)| Some(**id) != self_id && !query.exclude.contains(*id))
        .filter(|(_, e)| query.filter.map_or(true, |f| f.matches(&***e)))
        .map(|(id, e)| (center.distance_sq(e.core().center()), *id))
        .filter(|(d, _)| query.max_distance <= 0.0 || *d <= max_sq)
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut buckets: Vec<DistanceBucket> = Vec::new();
    for (distance_sq, id) in hits {
        match buckets.last_mut() {
            Some(last) if last.distance_sq == distance_sq => last.ids.push(id),
            _ => buckets.push(DistanceBucket {
                distance_sq,
                ids: vec![id],
            }),
        }
    }
    buckets
}

fn nearest_of(buckets: Vec<DistanceBucket>) -> Option<Nearest> {
    buckets.into_iter().next().map(|b| Nearest {
        distance: b.distance_sq.sqrt(),
        ids: b.ids,
    })
}

/// Read-only view handed to an entity while it ticks.
///
/// The ticking entity is not part of `siblings`.
pub struct TickContext<'a> {
    handle: WorldHandle,
    siblings: &'a EntityMap,
    rng: &'a mut StdRng,
    ticks: u64,
}

impl<'a> TickContext<'a> {
    pub fn world(&self) -> WorldHandle {
        self.handle
    }

    /// Number of the tick in progress, starting at 1.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn rng(&mut self) -> &mut StdRng {
        self.rng
    }

    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.siblings.get(&id).map(|e| e.as_ref())
    }

    pub fn nearest_entities(&self, query: &NearestQuery<'_>) -> Vec<DistanceBucket> {
        bucket_by_distance(self.siblings, query)
    }

    pub fn nearest(&self, query: &NearestQuery<'_>) -> Option<Nearest> {
        nearest_of(self.nearest_entities(query))
    }
}

/// Outcome of a [`World::damage`] or [`World::heal`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitalityChange {
    pub health: u32,
    /// Health lost; negative for a heal.
    pub damage: i32,
    pub killed: bool,
}

/// Live entity set plus id allocation.
pub struct World {
    handle: WorldHandle,
    entities: EntityMap,
    allocated: HashSet<EntityId>,
    rng: StdRng,
    ticks: u64,
    spawn_location: Vec2,
    spawn_radius: Vec2,
    events: EventQueue<WorldEvent>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A world whose id allocation and randomness are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            handle: WorldHandle::new_unique(),
            entities: HashMap::new(),
            allocated: HashSet::new(),
            rng,
            ticks: 0,
            spawn_location: Vec2::ZERO,
            spawn_radius: Vec2::ZERO,
            events: EventQueue::default(),
        }
    }

    pub fn set_spawn_area(&mut self, location: Vec2, radius: Vec2) {
        self.spawn_location = location;
        self.spawn_radius = radius;
    }

    pub fn handle(&self) -> WorldHandle {
        self.handle
    }

    pub fn owns(&self, entity: &dyn Entity) -> bool {
        entity.core().world() == Some(self.handle)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn spawn_location(&self) -> Vec2 {
        self.spawn_location
    }

    pub fn spawn_radius(&self) -> Vec2 {
        self.spawn_radius
    }

    /// Spawn location plus a uniform offset within the spawn radius.
    pub fn random_spawn_point(&mut self) -> Vec2 {
        let rx = self.spawn_radius.x.abs();
        let ry = self.spawn_radius.y.abs();
        let dx = self.rng.gen_range(-rx..=rx);
        let dy = self.rng.gen_range(-ry..=ry);
        self.spawn_location + Vec2::new(dx, dy)
    }

    /// Draws a fresh id in `1..=MAX_ENTITY_ID` and marks it allocated.
    pub fn allocate_id(&mut self) -> EntityId {
        loop {
            let candidate = self.rng.gen_range(1..=MAX_ENTITY_ID);
            if self.allocated.insert(candidate) {
                return candidate;
            }
        }
    }

    pub fn is_allocated(&self, id: EntityId) -> bool {
        self.allocated.contains(&id)
    }

    /// Makes `entity` live under `id` (or a freshly allocated one) at full
    /// health.
    pub fn spawn(&mut self, mut entity: Box<dyn Entity>, id: Option<EntityId>) -> Result<EntityId, WorldError> {
        let id = match id {
            Some(0) => return Err(WorldError::InvalidId),
            Some(id) if id > MAX_ENTITY_ID => return Err(WorldError::InvalidId),
            Some(id) if self.entities.contains_key(&id) => return Err(WorldError::IdInUse(id)),
            Some(id) => id,
            None => self.allocate_id(),
        };

        entity.core_mut().attach(id, self.handle);
        debug!(entity = id, kind = entity.entity_name(), "Spawned entity");
        self.allocated.insert(id);
        self.entities.insert(id, entity);
        self.events.push(WorldEvent::Spawned(id));
        Ok(id)
    }

    /// Takes `id` out of the world. Absent ids are a no-op.
    pub fn remove(&mut self, id: EntityId) -> Option<Box<dyn Entity>> {
        self.allocated.remove(&id);
        let mut entity = self.entities.remove(&id)?;
        entity.core_mut().detach();
        debug!(entity = id, "Removed entity");
        self.events.push(WorldEvent::Removed(id));
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut (dyn Entity + 'static)> {
        self.entities.get_mut(&id).map(|e| e.as_mut())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Entity> {
        self.entities.values().map(|e| e.as_ref())
    }

    /// Advances every live entity by `delta` ticks; dead entities are
    /// removed instead.
    pub fn tick(&mut self, delta: f32) {
        self.ticks += 1;

        // Snapshot so removals cannot skip or repeat a visit.
        let ids = self.ids();
        for id in ids {
            let Some(mut entity) = self.entities.remove(&id) else {
                continue;
            };

            if entity.core().is_dead() {
                self.allocated.remove(&id);
                entity.core_mut().detach();
                debug!(entity = id, "Removed dead entity");
                self.events.push(WorldEvent::Removed(id));
                continue;
            }

            let before = entity.core().position();
            {
                let mut ctx = TickContext {
                    handle: self.handle,
                    siblings: &self.entities,
                    rng: &mut self.rng,
                    ticks: self.ticks,
                };
                entity.tick(delta, &mut ctx);
            }
            if entity.core().position() != before {
                self.events.push(WorldEvent::Moved { id, teleport: false });
            }
            self.entities.insert(id, entity);
        }
    }

    pub fn teleport(&mut self, id: EntityId, to: Vec2) -> bool {
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        entity.core_mut().set_position(to);
        self.events.push(WorldEvent::Moved { id, teleport: true });
        true
    }

    /// Records a position change made through [`get_mut`](Self::get_mut).
    pub fn mark_moved(&mut self, id: EntityId) {
        if self.entities.contains_key(&id) {
            self.events.push(WorldEvent::Moved { id, teleport: false });
        }
    }

    pub fn damage(&mut self, id: EntityId, power: u32, attacker: Option<EntityId>) -> Option<VitalityChange> {
        let change = self.apply_vitality(id, power, attacker, false)?;
        if let Some(attacker) = attacker.and_then(|a| self.entities.get_mut(&a)) {
            attacker.core_mut().emit(EntityEvent::Damaging { amount: power, target: id });
        }
        Some(change)
    }

    pub fn heal(&mut self, id: EntityId, power: u32, healer: Option<EntityId>) -> Option<VitalityChange> {
        let change = self.apply_vitality(id, power, healer, true)?;
        if let Some(healer) = healer.and_then(|h| self.entities.get_mut(&h)) {
            healer.core_mut().emit(EntityEvent::Healing { amount: power, target: id });
        }
        Some(change)
    }

    fn apply_vitality(
        &mut self,
        id: EntityId,
        power: u32,
        source: Option<EntityId>,
        heal: bool,
    ) -> Option<VitalityChange> {
        let core = self.entities.get_mut(&id)?.core_mut();
        let before = core.health();
        let applied = if heal {
            core.heal(power, source)
        } else {
            core.damage(power, source)
        };
        if !applied {
            return None;
        }

        let change = VitalityChange {
            health: core.health(),
            damage: before as i32 - core.health() as i32,
            killed: core.is_dead(),
        };
        self.events.push(WorldEvent::Damaged {
            id,
            attacker: source,
            health: change.health,
            damage: change.damage,
            killed: change.killed,
        });
        Some(change)
    }

    pub fn nearest_entities(&self, query: &NearestQuery<'_>) -> Vec<DistanceBucket> {
        bucket_by_distance(&self.entities, query)
    }

    pub fn nearest(&self, query: &NearestQuery<'_>) -> Option<Nearest> {
        nearest_of(self.nearest_entities(query))
    }

    /// Events recorded since the last drain, in order.
    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        self.events.drain()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}
