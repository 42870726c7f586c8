//! Configuration system.
//!
//! Loads game configuration from JSON strings or files. Every field has a
//! default so partial files are accepted.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed server simulation tick rate.
    pub tick_hz: u32,
    /// Client outbox send rate, independent of the frame rate.
    pub send_hz: u32,
    /// Client frame (render + prediction) rate.
    pub frame_hz: u32,
    /// Divergence in pixels above which the client replays pending commands.
    pub reconcile_threshold: f32,
    /// Per-frame lerp factor for remote entities.
    pub interp_factor: f32,
    /// Window in which an unsequenced remote update cannot override a
    /// sequenced one.
    pub unsequenced_guard_ms: u64,
    /// Collision radius of player entities.
    pub entity_radius: f32,
    pub retry: RetryConfig,
    /// Optional ASCII map file (server only). Built-in arena when unset.
    pub map: Option<String>,
    /// Player name (client only).
    pub player_name: String,
}

/// Outbox retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failed sends tolerated before the outbox reports exhaustion.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_backoff_ms: 16,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 60,
            send_hz: 60,
            frame_hz: 60,
            reconcile_threshold: 12.0,
            interp_factor: 0.3,
            unsequenced_guard_ms: 300,
            entity_radius: 12.0,
            retry: RetryConfig::default(),
            map: None,
            player_name: "Player".to_string(),
        }
    }
}

impl GameConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    fn interval(hz: u32) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(hz.max(1)))
    }

    pub fn tick_interval(&self) -> Duration {
        Self::interval(self.tick_hz)
    }

    pub fn send_interval(&self) -> Duration {
        Self::interval(self.send_hz)
    }

    pub fn frame_interval(&self) -> Duration {
        Self::interval(self.frame_hz)
    }

    pub fn unsequenced_guard(&self) -> Duration {
        Duration::from_millis(self.unsequenced_guard_ms)
    }
}
