//! Event and notification types.
//!
//! - `EntityEvent`: vitality notifications delivered to callbacks registered
//!   on an entity.
//! - `WorldEvent`: state changes the world records while it is mutated; the
//!   server drains them once per tick and turns them into packets.
//!
//! Both sets are closed enums; there is no string-keyed bus.

use crate::entity::EntityId;

/// Notification delivered to an entity's own listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    /// Health went from positive to zero. Fires once per life.
    Died,
    Healed {
        amount: u32,
        healer: Option<EntityId>,
    },
    Damaged {
        amount: u32,
        attacker: Option<EntityId>,
    },
    /// This entity healed `target`.
    Healing { amount: u32, target: EntityId },
    /// This entity damaged `target`.
    Damaging { amount: u32, target: EntityId },
}

/// Change to the live set or to an entity, as seen by replication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorldEvent {
    Spawned(EntityId),
    Removed(EntityId),
    Moved {
        id: EntityId,
        teleport: bool,
    },
    /// Health changed. `damage` is negative for a heal.
    Damaged {
        id: EntityId,
        attacker: Option<EntityId>,
        health: u32,
        damage: i32,
        killed: bool,
    },
}

/// FIFO of typed events.
#[derive(Debug)]
pub struct EventQueue<E> {
    events: Vec<E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> EventQueue<E> {
    /// Pushes an event into the queue.
    pub fn push(&mut self, e: E) {
        self.events.push(e);
    }

    /// Drains all queued events in push order.
    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.events.iter()
    }
}
