//! Server implementation.
//!
//! An authoritative, tick-based game server:
//! - Accepts TCP connections and enforces the slot limit
//! - Runs the login/play session of every connection
//! - Steps the world at a fixed rate
//! - Replicates world changes to in-world players
//!
//! Everything runs on one task: transport events, accepts and ticks are
//! interleaved by `select!`, never executed in parallel.

use anyhow::Context;
use skirmish_shared::{
    config::ServerConfig,
    entities::{register_standard_entities, Zombie},
    entity::EntityRegistry,
    math::Vec2,
    net::{spawn_reader, ConnId, FrameListener, TcpReader, TcpTransport, Transport, TransportEvent},
    packet::PacketRegistry,
    packets::register_standard_packets,
    world::World,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, Inbound},
    session::{promote, Session, KICK_SERVER_FULL, KICK_SERVER_STOPPED, KICK_TIMEOUT},
    sync::SyncManager,
};

/// Zombies present when the server starts.
const INITIAL_ZOMBIES: [Vec2; 3] = [
    Vec2::new(50.0, 50.0),
    Vec2::new(150.0, 150.0),
    Vec2::new(250.0, 250.0),
];

/// What packet handlers may touch while a tick runs.
pub struct ServerContext<'a> {
    pub world: &'a mut World,
    pub sync: &'a mut SyncManager,
    pub entities: &'a EntityRegistry,
    pub config: &'a ServerConfig,
}

/// Connected client state.
struct Client {
    conn: Connection,
    session: Session,
    reader: Option<JoinHandle<()>>,
}

/// Game server.
pub struct GameServer {
    pub cfg: ServerConfig,
    packets: Arc<PacketRegistry>,
    entities: EntityRegistry,
    world: World,
    sync: SyncManager,
    clients: HashMap<ConnId, Client>,

    listener: Option<FrameListener>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,

    tick: u64,
}

impl GameServer {
    /// Creates a server without a socket; connections are added by hand.
    pub fn new(cfg: ServerConfig) -> anyhow::Result<Self> {
        let mut packets = PacketRegistry::new(cfg.wide_packet_ids);
        register_standard_packets(&mut packets).context("register packets")?;
        let mut entities = EntityRegistry::new();
        register_standard_entities(&mut entities).context("register entities")?;

        let mut world = match cfg.world_seed {
            Some(seed) => World::with_seed(seed),
            None => World::new(),
        };
        world.set_spawn_area(cfg.spawn_location(), cfg.spawn_radius());
        for at in INITIAL_ZOMBIES {
            world
                .spawn(Box::new(Zombie::at(at)), None)
                .context("spawn zombie")?;
        }
        world.drain_events();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            packets: Arc::new(packets),
            entities,
            world,
            sync: SyncManager::new(),
            clients: HashMap::new(),
            listener: None,
            events_tx,
            events_rx,
            tick: 0,
        })
    }

    /// Creates a server listening on `cfg.server_addr`.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = FrameListener::bind(addr).await?;
        let mut server = Self::new(cfg)?;
        server.listener = Some(listener);
        Ok(server)
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .as_ref()
            .context("server is not bound")?
            .local_addr()
    }

    pub fn packets(&self) -> &Arc<PacketRegistry> {
        &self.packets
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_in_world(&self, conn: ConnId) -> bool {
        self.clients
            .get(&conn)
            .is_some_and(|c| c.session.is_in_world())
    }

    /// Sender feeding this server's transport event loop.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.events_tx.clone()
    }

    /// Admits a new connection, or kicks it when every slot is taken.
    pub async fn add_connection(&mut self, transport: Box<dyn Transport>) -> Option<ConnId> {
        let id = ConnId::new_unique();
        let mut conn = Connection::new(id, Arc::clone(&self.packets), transport);

        if self.clients.len() >= self.cfg.max_players {
            conn.kick(KICK_SERVER_FULL).await;
            return None;
        }

        info!(conn = %id, peer = %conn.addr(), "Client connected");
        self.clients.insert(
            id,
            Client {
                conn,
                session: Session::default(),
                reader: None,
            },
        );
        Some(id)
    }

    /// Feeds one transport event to its connection.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let id = event.conn();
        let Some(client) = self.clients.get_mut(&id) else {
            debug!(conn = %id, "Event for unknown connection");
            return;
        };
        let mut ctx = ServerContext {
            world: &mut self.world,
            sync: &mut self.sync,
            entities: &self.entities,
            config: &self.cfg,
        };

        match event {
            TransportEvent::Message(_, msg) => {
                if let Inbound::Immediate(packet) = client.conn.on_message(msg).await {
                    client.conn.dispatch(&mut client.session, packet, &mut ctx).await;
                    client.conn.flush().await;
                }
            }
            TransportEvent::Error(_, error) => client.conn.on_error(&error).await,
            TransportEvent::Closed(_) => client.conn.on_closed().await,
        }

        if !client.conn.is_open() {
            self.disconnect(id).await;
        }
    }

    /// Executes one simulation step of `delta` nominal ticks.
    pub async fn tick(&mut self, delta: f32) {
        let mut ids: Vec<ConnId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        let timeout = self.cfg.handshake_timeout_ticks;

        {
            let mut ctx = ServerContext {
                world: &mut self.world,
                sync: &mut self.sync,
                entities: &self.entities,
                config: &self.cfg,
            };

            // Pre-auth connections. A handshake accepted last tick is
            // promoted now and its queued packets go to the in-world pass.
            // Otherwise the queue is drained before the login clock runs,
            // so a handshake queued in the last allowed tick still counts.
            for id in &ids {
                let Some(client) = self.clients.get_mut(id) else { continue };
                let Session::Login(login) = &mut client.session else { continue };
                if !client.conn.is_open() {
                    continue;
                }

                let Some((username, deferred)) = login.take_accepted() else {
                    client.conn.process(login, &mut ctx).await;
                    if client.conn.is_open() && login.tick_expired(timeout) {
                        client.conn.kick(KICK_TIMEOUT).await;
                    }
                    continue;
                };

                match promote(&client.conn, username, &mut ctx) {
                    Ok(play) => {
                        client.session = Session::Play(play);
                        for packet in deferred {
                            client.conn.dispatch(&mut client.session, packet, &mut ctx).await;
                        }
                    }
                    Err(e) => {
                        warn!(conn = %id, error = %e, "Promotion failed");
                        client.conn.close().await;
                    }
                }
            }

            // In-world connections.
            for id in &ids {
                let Some(client) = self.clients.get_mut(id) else { continue };
                if client.session.is_in_world() {
                    client.conn.process(&mut client.session, &mut ctx).await;
                }
            }
        }

        self.world.tick(delta);
        self.sync.dispatch_world_events(&mut self.world, &self.entities);

        for client in self.clients.values_mut() {
            client.conn.flush().await;
        }

        let closed: Vec<ConnId> = self
            .clients
            .iter()
            .filter(|(_, c)| !c.conn.is_open())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.disconnect(id).await;
        }

        self.tick += 1;
        if self.cfg.tick_hz > 0 && self.tick % u64::from(self.cfg.tick_hz) == 0 {
            debug!(
                tick = self.tick,
                clients = self.clients.len(),
                players = self.sync.len(),
                entities = self.world.len(),
                bytes_in = self.packets.received_bytes(),
                bytes_out = self.packets.sent_bytes(),
                "Server status"
            );
        }
    }

    /// Drops a connection and everything bound to it.
    pub async fn disconnect(&mut self, id: ConnId) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        client.conn.close().await;
        if let Some(task) = client.reader.take() {
            task.abort();
        }

        match client.session {
            Session::Play(play) => {
                self.world.remove(play.entity_id());
                self.sync.leave(id);
                self.sync
                    .chat_to_all(format!("{} left the game!", play.username()));
                info!(conn = %id, username = %play.username(), "Player left");
            }
            Session::Login(_) => {
                self.sync.release_username(id);
                info!(conn = %id, "Client disconnected");
            }
        }
    }

    /// Kicks every connection.
    pub async fn shutdown(&mut self) {
        info!(clients = self.clients.len(), "Server shutting down");
        let ids: Vec<ConnId> = self.clients.keys().copied().collect();
        for id in ids {
            if let Some(client) = self.clients.get_mut(&id) {
                client.conn.kick(KICK_SERVER_STOPPED).await;
            }
            self.disconnect(id).await;
        }
    }

    /// Runs accept, transport and tick handling until Ctrl-C.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let interval = self.cfg.tick_interval();
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    let elapsed = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    let delta = (elapsed.as_secs_f32() / interval.as_secs_f32())
                        .min(self.cfg.max_delta_ticks);
                    self.tick(delta).await;
                }
                accepted = accept_next(self.listener.as_ref()) => {
                    match accepted {
                        Ok(parts) => self.admit(parts).await,
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
                result = &mut shutdown => {
                    if let Err(e) = result {
                        warn!(error = %e, "Ctrl-C handler failed");
                    }
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Runs `ticks` full-length ticks, handling whatever transport events
    /// are already waiting before each one.
    pub async fn run_for_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_transport_event(event).await;
            }
            self.tick(1.0).await;
        }
    }

    async fn admit(&mut self, (reader, writer): (TcpReader, TcpTransport)) {
        if let Some(id) = self.add_connection(Box::new(writer)).await {
            let task = spawn_reader(id, reader, self.events_tx.clone());
            if let Some(client) = self.clients.get_mut(&id) {
                client.reader = Some(task);
            }
        }
    }
}

/// Waits for the next TCP connection; never resolves without a listener.
async fn accept_next(
    listener: Option<&FrameListener>,
) -> anyhow::Result<(TcpReader, TcpTransport)> {
    match listener {
        Some(listener) => {
            let (reader, writer, _) = listener.accept().await?;
            Ok((reader, writer))
        }
        None => std::future::pending().await,
    }
}

/// Binds a server to an ephemeral localhost port (useful for tests).
pub async fn bind_ephemeral(mut cfg: ServerConfig) -> anyhow::Result<GameServer> {
    cfg.server_addr = "127.0.0.1:0".to_string();
    GameServer::bind(cfg).await
}
