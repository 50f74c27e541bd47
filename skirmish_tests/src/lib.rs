//! Test client used by the integration tests.
//!
//! Speaks the real wire protocol over TCP: framed binary messages carrying
//! registry-encoded packets.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use skirmish_shared::{
    entity::EntityRegistry,
    entities::register_standard_entities,
    net::{connect, Message, TcpReader, TcpTransport, Transport},
    packet::{Directions, Packet, PacketRegistry},
    packets::{register_standard_packets, Handshake, Kicked},
};
use tracing::debug;

/// How long a single receive may wait before the test fails.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A client connection driven step by step from a test.
pub struct TestClient {
    reader: TcpReader,
    writer: TcpTransport,
    packets: PacketRegistry,
    entities: EntityRegistry,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (reader, writer) = connect(addr).await?;
        let mut packets = PacketRegistry::new(false);
        register_standard_packets(&mut packets)?;
        let mut entities = EntityRegistry::new();
        register_standard_entities(&mut entities)?;
        Ok(Self {
            reader,
            writer,
            packets,
            entities,
        })
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    pub async fn send(&mut self, packet: &dyn Packet) -> anyhow::Result<()> {
        let frame = self.packets.encode(packet)?;
        self.writer.send(Message::Binary(frame)).await
    }

    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.writer.send(Message::Text(text.to_string())).await
    }

    /// Next packet from the server; `None` once the server closed the stream.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Box<dyn Packet>>> {
        let msg = tokio::time::timeout(RECV_TIMEOUT, self.reader.recv())
            .await
            .context("timed out waiting for a packet")??;
        match msg {
            None => Ok(None),
            Some(Message::Binary(frame)) => {
                let (packet, _) = self.packets.decode(&frame, Directions::TO_CLIENT)?;
                debug!(packet = packet.packet_name(), "Test client received");
                Ok(Some(packet))
            }
            Some(Message::Text(text)) => bail!("unexpected text message {text:?}"),
        }
    }

    /// Skips packets until one of type `T` arrives.
    pub async fn recv_until<T: Packet>(&mut self) -> anyhow::Result<Box<T>> {
        loop {
            let Some(packet) = self.recv().await? else {
                bail!("connection closed before {}", std::any::type_name::<T>());
            };
            if let Some(found) = packet.downcast::<T>() {
                return Ok(found);
            }
        }
    }

    /// Sends a handshake for `username`.
    pub async fn handshake(&mut self, username: &str) -> anyhow::Result<()> {
        self.send(&Handshake::new(username)).await
    }

    /// Waits for the kick and the end of the stream, returning the reason.
    pub async fn expect_kick(&mut self) -> anyhow::Result<String> {
        let kicked = self.recv_until::<Kicked>().await?;
        while let Ok(Some(_)) = self.recv().await {}
        Ok(kicked.reason)
    }
}
