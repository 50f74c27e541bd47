//! Configuration system.
//!
//! Loads server configuration from JSON strings (file IO left to the binary).
//! Every field has a default, so `{}` is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::math::Vec2;

/// Root configuration of a game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:8081`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Connections beyond this count are kicked at accept.
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Ticks a connection may spend before its handshake arrives.
    #[serde(default = "default_handshake_timeout_ticks")]
    pub handshake_timeout_ticks: u64,
    /// Two-byte packet ids instead of one.
    #[serde(default)]
    pub wide_packet_ids: bool,
    #[serde(default)]
    pub spawn_location: [f32; 2],
    #[serde(default = "default_spawn_radius")]
    pub spawn_radius: [f32; 2],
    /// Fixed RNG seed; random when absent.
    #[serde(default)]
    pub world_seed: Option<u64>,
    /// Upper bound for one tick's delta, in nominal ticks.
    #[serde(default = "default_max_delta_ticks")]
    pub max_delta_ticks: f32,
}

fn default_server_addr() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_tick_hz() -> u32 {
    60
}

fn default_max_players() -> usize {
    10
}

fn default_handshake_timeout_ticks() -> u64 {
    600
}

fn default_spawn_radius() -> [f32; 2] {
    [50.0, 50.0]
}

fn default_max_delta_ticks() -> f32 {
    3.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            max_players: default_max_players(),
            handshake_timeout_ticks: default_handshake_timeout_ticks(),
            wide_packet_ids: false,
            spawn_location: [0.0, 0.0],
            spawn_radius: default_spawn_radius(),
            world_seed: None,
            max_delta_ticks: default_max_delta_ticks(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn spawn_location(&self) -> Vec2 {
        Vec2::new(self.spawn_location[0], self.spawn_location[1])
    }

    pub fn spawn_radius(&self) -> Vec2 {
        Vec2::new(self.spawn_radius[0], self.spawn_radius[1])
    }

    /// Nominal length of one tick.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / u64::from(self.tick_hz.max(1)))
    }
}
