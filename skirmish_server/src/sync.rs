//! Replication and broadcast.
//!
//! `SyncManager` knows every in-world player (username, entity, outbound
//! handle) and turns the world's recorded events into packets once per tick.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use skirmish_shared::{
    entity::{EntityId, EntityRegistry},
    event::WorldEvent,
    net::ConnId,
    packet::Packet,
    packets::{Chat, DamageEntity, EntityMove, MoveEntity, SpawnEntity},
    world::World,
};
use tracing::{debug, warn};

use crate::connection::PacketSender;

/// An in-world player.
#[derive(Debug)]
pub struct PlayerSlot {
    pub username: String,
    pub entity_id: EntityId,
    pub sender: PacketSender,
    /// Entities already sent in the join snapshot and not yet replicated by
    /// events.
    snapshot: HashSet<EntityId>,
}

#[derive(Debug, Default)]
pub struct SyncManager {
    players: HashMap<ConnId, PlayerSlot>,
    /// Lowercased username -> holder, from handshake acceptance on.
    usernames: HashMap<String, ConnId>,
    owners: HashMap<EntityId, ConnId>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn player(&self, conn: ConnId) -> Option<&PlayerSlot> {
        self.players.get(&conn)
    }

    pub fn owner_of(&self, entity: EntityId) -> Option<ConnId> {
        self.owners.get(&entity).copied()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.players.values().map(|p| p.username.as_str())
    }

    /// Claims `username` for `conn`, case-insensitively. False when someone
    /// else holds it.
    pub fn reserve_username(&mut self, username: &str, conn: ConnId) -> bool {
        let key = username.to_lowercase();
        match self.usernames.get(&key) {
            Some(holder) if *holder != conn => false,
            _ => {
                self.usernames.insert(key, conn);
                true
            }
        }
    }

    pub fn release_username(&mut self, conn: ConnId) {
        self.usernames.retain(|_, holder| *holder != conn);
    }

    /// Registers a promoted connection. `snapshot` is the set of entities
    /// the player has already been sent.
    pub fn join(
        &mut self,
        conn: ConnId,
        username: String,
        entity_id: EntityId,
        sender: PacketSender,
        snapshot: HashSet<EntityId>,
    ) {
        self.owners.insert(entity_id, conn);
        self.players.insert(
            conn,
            PlayerSlot {
                username,
                entity_id,
                sender,
                snapshot,
            },
        );
    }

    /// Unregisters `conn` and frees its username.
    pub fn leave(&mut self, conn: ConnId) -> Option<PlayerSlot> {
        self.release_username(conn);
        let slot = self.players.remove(&conn)?;
        self.owners.remove(&slot.entity_id);
        Some(slot)
    }

    /// Queues one shared copy of `packet` for every player except `except`.
    /// Returns how many players it was queued for.
    pub fn send_to_all<P: Packet>(&self, packet: P, except: Option<ConnId>) -> usize {
        let packet: Arc<dyn Packet> = Arc::new(packet);
        let mut queued = 0;
        for (conn, slot) in &self.players {
            if Some(*conn) != except && slot.sender.send_shared(Arc::clone(&packet)) {
                queued += 1;
            }
        }
        queued
    }

    pub fn chat_to_all(&self, message: impl Into<String>) -> usize {
        self.send_to_all(Chat::new(message), None)
    }

    /// Sends every live entity to `sender`; returns the ids sent.
    pub fn send_all_entities_to(
        &self,
        sender: &PacketSender,
        world: &World,
        entities: &EntityRegistry,
    ) -> HashSet<EntityId> {
        let mut sent = HashSet::new();
        for entity in world.iter() {
            match SpawnEntity::from_entity(entities, entity) {
                Ok(packet) => {
                    sender.send(packet);
                    sent.insert(entity.id());
                }
                Err(e) => warn!(entity = entity.id(), error = %e, "Cannot replicate entity"),
            }
        }
        sent
    }

    /// Drains the world's events into packets for the players.
    ///
    /// - spawns go to everyone but the entity's owner and players whose join
    ///   snapshot already held it;
    /// - removals and health changes go to everyone;
    /// - moves are batched into one `MoveEntity` per player, leaving out a
    ///   player's own non-teleport moves.
    pub fn dispatch_world_events(&mut self, world: &mut World, entities: &EntityRegistry) {
        let events = world.drain_events();
        let mut moves: Vec<EntityMove> = Vec::new();
        let mut move_index: HashMap<EntityId, usize> = HashMap::new();

        for event in events {
            match event {
                WorldEvent::Spawned(id) => {
                    let Some(entity) = world.get(id) else { continue };
                    let packet: Arc<dyn Packet> = match SpawnEntity::from_entity(entities, entity) {
                        Ok(p) => Arc::new(p),
                        Err(e) => {
                            warn!(entity = id, error = %e, "Cannot replicate entity");
                            continue;
                        }
                    };
                    let owner = self.owner_of(id);
                    for (conn, slot) in &self.players {
                        if Some(*conn) != owner && !slot.snapshot.contains(&id) {
                            slot.sender.send_shared(Arc::clone(&packet));
                        }
                    }
                }
                WorldEvent::Removed(id) => {
                    self.send_to_all(DamageEntity::removal(id), None);
                }
                WorldEvent::Damaged {
                    id,
                    attacker,
                    health,
                    damage,
                    killed,
                } => {
                    self.send_to_all(
                        DamageEntity {
                            entity_id: id,
                            attacker_id: attacker.unwrap_or(0),
                            health,
                            damage,
                            killed,
                        },
                        None,
                    );
                }
                WorldEvent::Moved { id, teleport } => {
                    let Some(entity) = world.get(id) else { continue };
                    let m = EntityMove::of(entity, teleport);
                    match move_index.get(&id) {
                        Some(&i) => {
                            let teleport = moves[i].teleport || teleport;
                            moves[i] = EntityMove { teleport, ..m };
                        }
                        None => {
                            move_index.insert(id, moves.len());
                            moves.push(m);
                        }
                    }
                }
            }
        }

        for slot in self.players.values_mut() {
            slot.snapshot.clear();
        }
        if moves.is_empty() {
            return;
        }

        for (conn, slot) in &self.players {
            let batch: Vec<EntityMove> = moves
                .iter()
                .filter(|m| m.teleport || self.owners.get(&m.entity_id) != Some(conn))
                .cloned()
                .collect();
            if !batch.is_empty() {
                debug!(conn = %conn, moves = batch.len(), "Replicating moves");
                slot.sender.send(MoveEntity { moves: batch });
            }
        }
    }
}
