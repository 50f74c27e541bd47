//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use skirmish_server::server::bind_ephemeral;
use skirmish_shared::{
    config::ServerConfig,
    entities::Player,
    entity::EntityId,
    math::Vec2,
    packets::{Chat, EntityMove, Handshake, MoveEntity, SpawnEntity, WorldInfo, PROTOCOL_VERSION},
};
use skirmish_tests::TestClient;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn config() -> ServerConfig {
    ServerConfig {
        tick_hz: 100,
        world_seed: Some(11),
        ..ServerConfig::default()
    }
}

/// Spawns a server running its real loop and returns its address.
async fn start(cfg: ServerConfig) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>)> {
    let server = bind_ephemeral(cfg).await?;
    let addr = server.local_addr()?;
    Ok((addr, tokio::spawn(server.run())))
}

/// Joins as `username`, returning the id of the controlled entity.
async fn join(client: &mut TestClient, username: &str) -> anyhow::Result<EntityId> {
    client.handshake(username).await?;
    let info = client.recv_until::<WorldInfo>().await?;
    let notice = client.recv_until::<Chat>().await?;
    assert_eq!(notice.message, format!("{username} joined the game!"));
    Ok(info.player_entity_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_joins_world_and_sees_entities() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.handshake("alice").await?;

    let mut spawned = Vec::new();
    let info = loop {
        let packet = client.recv().await?.expect("stream open");
        if let Some(spawn) = packet.downcast_ref::<SpawnEntity>() {
            spawned.push(spawn.entity(client.entities()).expect("known entity"));
        } else if let Some(info) = packet.downcast_ref::<WorldInfo>() {
            break info.clone();
        }
    };

    // Three zombies plus the player itself.
    assert_eq!(spawned.len(), 4);
    let me = spawned
        .iter()
        .find(|e| e.id() == info.player_entity_id)
        .expect("own entity was sent");
    assert_eq!(me.downcast_ref::<Player>().expect("player").username(), "alice");

    let notice = client.recv_until::<Chat>().await?;
    assert_eq!(notice.message, "alice joined the game!");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_reaches_every_player() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut alice = TestClient::connect(addr).await?;
    join(&mut alice, "alice").await?;
    let mut bob = TestClient::connect(addr).await?;
    join(&mut bob, "bob").await?;
    assert_eq!(alice.recv_until::<Chat>().await?.message, "bob joined the game!");

    bob.send(&Chat::new("  hi there ")).await?;
    assert_eq!(alice.recv_until::<Chat>().await?.message, "bob: hi there");
    assert_eq!(bob.recv_until::<Chat>().await?.message, "bob: hi there");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn moves_are_replicated_to_other_players() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut alice = TestClient::connect(addr).await?;
    let alice_entity = join(&mut alice, "alice").await?;
    let mut bob = TestClient::connect(addr).await?;
    join(&mut bob, "bob").await?;

    let target = Vec2::new(123.0, 45.0);
    alice
        .send(&MoveEntity::single(EntityMove {
            entity_id: alice_entity,
            position: target,
            head_angle: 180,
            ..EntityMove::default()
        }))
        .await?;

    loop {
        let moves = bob.recv_until::<MoveEntity>().await?;
        if let Some(m) = moves.moves.iter().find(|m| m.entity_id == alice_entity) {
            assert_eq!(m.position, target);
            assert_eq!(m.head_angle, 180);
            break;
        }
    }

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_player_is_announced() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut alice = TestClient::connect(addr).await?;
    join(&mut alice, "alice").await?;
    let mut bob = TestClient::connect(addr).await?;
    join(&mut bob, "bob").await?;
    drop(bob);

    loop {
        let chat = alice.recv_until::<Chat>().await?;
        if chat.message == "bob left the game!" {
            break;
        }
    }

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outdated_client_is_kicked() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client
        .send(&Handshake {
            protocol_version: PROTOCOL_VERSION - 1,
            username: "old".into(),
        })
        .await?;
    assert_eq!(client.expect_kick().await?, "Your protocol is out of date!");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handshake_times_out() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(ServerConfig {
        handshake_timeout_ticks: 5,
        ..config()
    })
    .await?;

    let mut client = TestClient::connect(addr).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.expect_kick().await?, "Took too long to log in!");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_message_closes_connection() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.send_text("hello?").await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = client.recv().await {}
    })
    .await?;

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_server_rejects_extra_client() -> anyhow::Result<()> {
    init_tracing();
    let (addr, server) = start(ServerConfig {
        max_players: 1,
        ..config()
    })
    .await?;

    let mut first = TestClient::connect(addr).await?;
    join(&mut first, "first").await?;

    let mut second = TestClient::connect(addr).await?;
    assert_eq!(second.expect_kick().await?, "Server is full!");

    server.abort();
    Ok(())
}
