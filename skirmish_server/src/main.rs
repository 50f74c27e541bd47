//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p skirmish_server --bin server -- [--config server.json]
//!     [--addr 127.0.0.1:8081] [--tick-hz 60] [--max-players 10]
//!     [--handshake-ticks 600] [--wide-ids] [--seed 42]
//!
//! Flags override values read from `--config`. Ctrl-C kicks every client
//! and exits.

use std::env;

use anyhow::Context;
use skirmish_server::GameServer;
use skirmish_shared::config::ServerConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ServerConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        None => ServerConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--max-players" if i + 1 < args.len() => {
                cfg.max_players = args[i + 1].parse().unwrap_or(cfg.max_players);
                i += 2;
            }
            "--handshake-ticks" if i + 1 < args.len() => {
                cfg.handshake_timeout_ticks = args[i + 1].parse().unwrap_or(cfg.handshake_timeout_ticks);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                cfg.world_seed = args[i + 1].parse().ok();
                i += 2;
            }
            "--wide-ids" => {
                cfg.wide_packet_ids = true;
                i += 1;
            }
            "--config" => i += 2,
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        max_players = cfg.max_players,
        wide_ids = cfg.wide_packet_ids,
        "Starting server"
    );

    let server = GameServer::bind(cfg).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    server.run().await
}
