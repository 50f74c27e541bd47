//! Session lifecycle: login (pre-auth) and play (in-world).
//!
//! A connection starts with a [`LoginHandler`]. Its first packet must be a
//! valid [`Handshake`]; once accepted, the server promotes the connection on
//! its next tick and swaps in a [`PlayHandler`] bound to the new player
//! entity.

use std::mem;

use anyhow::Context;
use async_trait::async_trait;
use skirmish_shared::{
    entities::Player,
    entity::EntityId,
    packet::Packet,
    packets::{Chat, Handshake, MoveEntity, WorldInfo, PROTOCOL_VERSION, WORLD_VERSION},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, PacketHandler},
    server::ServerContext,
};

pub const KICK_NOT_HANDSHAKE: &str = "The first package should be a handshake!";
pub const KICK_SERVER_OUTDATED: &str = "Server protocol is out of date!";
pub const KICK_CLIENT_OUTDATED: &str = "Your protocol is out of date!";
pub const KICK_USERNAME_TAKEN: &str = "Username already registered!";
pub const KICK_INVALID_USERNAME: &str = "Invalid username!";
pub const KICK_TIMEOUT: &str = "Took too long to log in!";
pub const KICK_REPEATED_HANDSHAKE: &str = "Quit repeating yourself!";
pub const KICK_SERVER_FULL: &str = "Server is full!";
pub const KICK_SERVER_STOPPED: &str = "Server stopped.";

/// Handles a connection until its handshake is accepted.
#[derive(Debug, Default)]
pub struct LoginHandler {
    elapsed_ticks: u64,
    accepted: Option<String>,
    deferred: Vec<Box<dyn Packet>>,
}

impl LoginHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Username of the accepted handshake, if any.
    pub fn accepted(&self) -> Option<&str> {
        self.accepted.as_deref()
    }

    /// Takes the handshake accepted on an earlier tick along with the
    /// packets deferred behind it.
    pub fn take_accepted(&mut self) -> Option<(String, Vec<Box<dyn Packet>>)> {
        let username = self.accepted.take()?;
        Some((username, mem::take(&mut self.deferred)))
    }

    /// Advances the login clock by one tick, after this tick's packets were
    /// handled. True once `timeout_ticks` passed without an accepted
    /// handshake.
    pub fn tick_expired(&mut self, timeout_ticks: u64) -> bool {
        if self.accepted.is_some() {
            return false;
        }
        self.elapsed_ticks += 1;
        self.elapsed_ticks >= timeout_ticks
    }
}

#[async_trait]
impl<'a> PacketHandler<ServerContext<'a>> for LoginHandler {
    async fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: Box<dyn Packet>,
        ctx: &mut ServerContext<'a>,
    ) -> anyhow::Result<()> {
        if self.accepted.is_some() {
            if packet.is::<Handshake>() {
                conn.kick(KICK_REPEATED_HANDSHAKE).await;
            } else {
                self.deferred.push(packet);
            }
            return Ok(());
        }

        let Some(handshake) = packet.downcast::<Handshake>() else {
            conn.kick(KICK_NOT_HANDSHAKE).await;
            return Ok(());
        };

        if handshake.protocol_version > PROTOCOL_VERSION {
            conn.kick(KICK_SERVER_OUTDATED).await;
            return Ok(());
        }
        if handshake.protocol_version < PROTOCOL_VERSION {
            conn.kick(KICK_CLIENT_OUTDATED).await;
            return Ok(());
        }
        if handshake.username.is_empty() {
            conn.kick(KICK_INVALID_USERNAME).await;
            return Ok(());
        }
        if !ctx.sync.reserve_username(&handshake.username, conn.id()) {
            conn.kick(KICK_USERNAME_TAKEN).await;
            return Ok(());
        }

        info!(conn = %conn.id(), username = %handshake.username, "Handshake accepted");
        self.accepted = Some(handshake.username);
        Ok(())
    }
}

/// Spawns the player of a freshly accepted connection and announces it.
pub fn promote(conn: &Connection, username: String, ctx: &mut ServerContext<'_>) -> anyhow::Result<PlayHandler> {
    let mut player = Player::with_username(&username);
    player.core.set_position(ctx.world.random_spawn_point());
    let entity_id = ctx
        .world
        .spawn(Box::new(player), None)
        .context("spawn player")?;

    let sender = conn.sender();
    let snapshot = ctx.sync.send_all_entities_to(&sender, &*ctx.world, ctx.entities);
    sender.send(WorldInfo {
        world_version: WORLD_VERSION,
        player_entity_id: entity_id,
    });
    ctx.sync
        .join(conn.id(), username.clone(), entity_id, sender, snapshot);
    ctx.sync.chat_to_all(format!("{username} joined the game!"));

    info!(conn = %conn.id(), %username, entity = entity_id, "Player joined");
    Ok(PlayHandler {
        entity_id,
        username,
    })
}

/// Handles an in-world connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayHandler {
    entity_id: EntityId,
    username: String,
}

impl PlayHandler {
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn on_chat(&self, chat: &Chat, ctx: &mut ServerContext<'_>) {
        let message = chat.message.trim();
        if message.is_empty() {
            return;
        }
        info!(username = %self.username, %message, "[CHAT]");
        ctx.sync.chat_to_all(format!("{}: {}", self.username, message));
    }

    fn on_move(&self, conn: &Connection, moves: &MoveEntity, ctx: &mut ServerContext<'_>) {
        for m in &moves.moves {
            if m.entity_id != self.entity_id {
                warn!(conn = %conn.id(), entity = m.entity_id, "Ignoring move of a foreign entity");
                continue;
            }
            let Some(entity) = ctx.world.get_mut(m.entity_id) else {
                continue;
            };
            m.apply_to(entity);
            ctx.world.mark_moved(m.entity_id);
        }
    }
}

#[async_trait]
impl<'a> PacketHandler<ServerContext<'a>> for PlayHandler {
    async fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: Box<dyn Packet>,
        ctx: &mut ServerContext<'a>,
    ) -> anyhow::Result<()> {
        if let Some(chat) = packet.downcast_ref::<Chat>() {
            self.on_chat(chat, ctx);
        } else if let Some(moves) = packet.downcast_ref::<MoveEntity>() {
            self.on_move(conn, moves, ctx);
        } else if packet.is::<Handshake>() {
            conn.kick(KICK_REPEATED_HANDSHAKE).await;
        } else {
            debug!(conn = %conn.id(), packet = packet.packet_name(), "Ignoring packet");
        }
        Ok(())
    }
}

/// Handler state of one connection.
#[derive(Debug)]
pub enum Session {
    Login(LoginHandler),
    Play(PlayHandler),
}

impl Default for Session {
    fn default() -> Self {
        Session::Login(LoginHandler::new())
    }
}

impl Session {
    pub fn is_in_world(&self) -> bool {
        matches!(self, Session::Play(_))
    }
}

#[async_trait]
impl<'a> PacketHandler<ServerContext<'a>> for Session {
    async fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: Box<dyn Packet>,
        ctx: &mut ServerContext<'a>,
    ) -> anyhow::Result<()> {
        match self {
            Session::Login(login) => login.handle_packet(conn, packet, ctx).await,
            Session::Play(play) => play.handle_packet(conn, packet, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_times_out_after_configured_ticks() {
        let mut login = LoginHandler::new();
        for _ in 0..2 {
            assert!(!login.tick_expired(3));
        }
        assert!(login.tick_expired(3));
    }

    #[test]
    fn accepted_login_never_expires() {
        let mut login = LoginHandler::new();
        login.accepted = Some("zed".into());
        for _ in 0..5 {
            assert!(!login.tick_expired(1));
        }
    }

    #[test]
    fn accepted_login_is_taken_with_deferred_packets() {
        let mut login = LoginHandler::new();
        assert!(login.take_accepted().is_none());

        login.accepted = Some("zed".into());
        login.deferred.push(Box::new(Chat::new("early")));
        let (username, deferred) = login.take_accepted().unwrap();
        assert_eq!(username, "zed");
        assert_eq!(deferred.len(), 1);
        assert!(deferred[0].is::<Chat>());
        assert!(login.accepted().is_none());
        assert!(login.take_accepted().is_none());
    }

    #[test]
    fn new_session_starts_in_login() {
        assert!(!Session::default().is_in_world());
    }
}
