//! Per-client connection.
//!
//! A `Connection` sits between one [`Transport`] and the tick driver:
//! - transport messages are decoded into packets and queued (`on_message`);
//! - once per tick, `process` hands queued packets to a [`PacketHandler`] in
//!   arrival order and flushes whatever was queued for sending meanwhile;
//! - anyone holding a [`PacketSender`] can queue outgoing packets.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use skirmish_shared::{
    net::{ConnId, Message, Transport},
    packet::{Directions, Packet, PacketRegistry, Urgency},
    packets::Kicked,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reacts to packets received on a connection.
#[async_trait]
pub trait PacketHandler<Ctx: Send>: Send {
    async fn handle_packet(
        &mut self,
        conn: &mut Connection,
        packet: Box<dyn Packet>,
        ctx: &mut Ctx,
    ) -> anyhow::Result<()>;
}

/// Counters kept per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub received: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub sent: u64,
}

/// Result of feeding one transport message into a connection.
#[derive(Debug)]
pub enum Inbound {
    /// Queued for the next `process`.
    Queued,
    /// Must be dispatched right away.
    Immediate(Box<dyn Packet>),
    /// Malformed or unexpected; logged and discarded.
    Dropped,
    /// The message closed the connection.
    Closed,
}

/// Cloneable handle that queues packets for one connection.
///
/// Packets queued after the connection closed are silently dropped.
#[derive(Debug, Clone)]
pub struct PacketSender {
    conn: ConnId,
    tx: mpsc::UnboundedSender<Arc<dyn Packet>>,
    open: Arc<AtomicBool>,
}

impl PacketSender {
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send<P: Packet>(&self, packet: P) -> bool {
        self.send_shared(Arc::new(packet))
    }

    /// Queues a packet that may be shared with other connections.
    pub fn send_shared(&self, packet: Arc<dyn Packet>) -> bool {
        if !self.is_open() {
            debug!(conn = %self.conn, packet = packet.packet_name(), "Dropping packet for closed connection");
            return false;
        }
        self.tx.send(packet).is_ok()
    }
}

pub struct Connection {
    id: ConnId,
    addr: SocketAddr,
    registry: Arc<PacketRegistry>,
    transport: Box<dyn Transport>,
    open: Arc<AtomicBool>,
    inbound: VecDeque<Box<dyn Packet>>,
    outbound_tx: mpsc::UnboundedSender<Arc<dyn Packet>>,
    outbound_rx: mpsc::UnboundedReceiver<Arc<dyn Packet>>,
    stats: ConnectionStats,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .field("inbound", &self.inbound.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnId, registry: Arc<PacketRegistry>, transport: Box<dyn Transport>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id,
            addr: transport.peer_addr(),
            registry,
            transport,
            open: Arc::new(AtomicBool::new(true)),
            inbound: VecDeque::new(),
            outbound_tx,
            outbound_rx,
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn sender(&self) -> PacketSender {
        PacketSender {
            conn: self.id,
            tx: self.outbound_tx.clone(),
            open: Arc::clone(&self.open),
        }
    }

    /// Queues `packet` for sending; dropped when closed.
    pub fn send<P: Packet>(&self, packet: P) -> bool {
        self.sender().send(packet)
    }

    /// Decodes one transport message.
    pub async fn on_message(&mut self, msg: Message) -> Inbound {
        if !self.is_open() {
            return Inbound::Dropped;
        }

        let frame = match msg {
            Message::Binary(frame) => frame,
            Message::Text(_) => {
                warn!(conn = %self.id, peer = %self.addr, "Received a non-binary message, closing");
                self.close().await;
                return Inbound::Closed;
            }
        };

        self.stats.received += 1;
        match self.registry.decode(&frame, Directions::TO_SERVER) {
            Ok((packet, info)) if info.urgency == Urgency::Immediate => Inbound::Immediate(packet),
            Ok((packet, _)) => {
                debug!(conn = %self.id, packet = packet.packet_name(), "Queued packet");
                self.inbound.push_back(packet);
                Inbound::Queued
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!(conn = %self.id, error = %e, len = frame.len(), "Dropping malformed frame");
                Inbound::Dropped
            }
        }
    }

    pub async fn on_error(&mut self, error: &str) {
        warn!(conn = %self.id, peer = %self.addr, %error, "Transport error");
        self.close().await;
    }

    pub async fn on_closed(&mut self) {
        if self.is_open() {
            info!(conn = %self.id, peer = %self.addr, "Connection closed by peer");
        }
        self.close().await;
    }

    /// Hands one packet to `handler`; a failure is logged, not propagated.
    pub async fn dispatch<Ctx, H>(&mut self, handler: &mut H, packet: Box<dyn Packet>, ctx: &mut Ctx)
    where
        Ctx: Send,
        H: PacketHandler<Ctx> + ?Sized,
    {
        let name = packet.packet_name();
        match handler.handle_packet(self, packet, ctx).await {
            Ok(()) => self.stats.dispatched += 1,
            Err(e) => warn!(conn = %self.id, packet = name, error = %e, "Packet handler failed"),
        }
    }

    /// Dispatches every queued packet in arrival order, flushing outgoing
    /// packets as they are produced. No-op once closed.
    pub async fn process<Ctx, H>(&mut self, handler: &mut H, ctx: &mut Ctx)
    where
        Ctx: Send,
        H: PacketHandler<Ctx> + ?Sized,
    {
        while self.is_open() {
            let Some(packet) = self.inbound.pop_front() else {
                break;
            };
            self.dispatch(handler, packet, ctx).await;
            self.flush().await;
        }
        self.flush().await;
    }

    /// Sends everything queued on the outbound side.
    pub async fn flush(&mut self) {
        while self.is_open() {
            let Ok(packet) = self.outbound_rx.try_recv() else {
                break;
            };
            let frame = match self.registry.encode(&*packet) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn = %self.id, error = %e, "Failed to encode packet");
                    continue;
                }
            };
            if let Err(e) = self.transport.send(Message::Binary(frame)).await {
                warn!(conn = %self.id, error = %e, "Send failed, closing");
                self.close().await;
                break;
            }
            self.stats.sent += 1;
        }
    }

    /// Sends `reason` straight to the peer, then closes. No-op once closed.
    pub async fn kick(&mut self, reason: &str) {
        if !self.is_open() {
            return;
        }
        info!(conn = %self.id, peer = %self.addr, %reason, "Kicking connection");

        match self.registry.encode(&Kicked::new(reason)) {
            Ok(frame) => match self.transport.send(Message::Binary(frame)).await {
                Ok(()) => self.stats.sent += 1,
                Err(e) => warn!(conn = %self.id, error = %e, "Failed to deliver kick"),
            },
            Err(e) => warn!(conn = %self.id, error = %e, "Failed to encode kick"),
        }
        self.close().await;
    }

    /// Closes the transport and discards both queues.
    pub async fn close(&mut self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inbound.clear();
        while self.outbound_rx.try_recv().is_ok() {}
        self.transport.close().await;
        debug!(conn = %self.id, "Connection closed");
    }
}
