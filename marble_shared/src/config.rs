//! Configuration system.
//!
//! Loads client configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum heartbeat grace multiple. Below 2× a single missed beat would
/// read as a dead link.
pub const MIN_HEARTBEAT_GRACE: f32 = 2.0;

/// Convergence rate constants for rendered state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterpSpeeds {
    /// Position convergence rate in 1/s: `min(1, rate × dt)` of the gap
    /// closes per frame.
    #[serde(default = "default_position_speed")]
    pub position: f32,
    /// Orientation convergence rate in 1/s. Higher than position so aim
    /// changes feel immediate.
    #[serde(default = "default_orientation_speed")]
    pub orientation: f32,
}

fn default_position_speed() -> f32 {
    10.0
}

fn default_orientation_speed() -> f32 {
    15.0
}

impl Default for InterpSpeeds {
    fn default() -> Self {
        Self {
            position: default_position_speed(),
            orientation: default_orientation_speed(),
        }
    }
}

/// Root client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub server_url: String,
    /// Seconds between heartbeat pings while the link is open.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: f32,
    /// Dead-link threshold as a multiple of the heartbeat interval.
    #[serde(default = "default_heartbeat_grace")]
    pub heartbeat_grace: f32,
    /// First reconnect delay in seconds; doubles on every further attempt.
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: f32,
    /// Reconnect attempts before the session gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub interp: InterpSpeeds,
}

fn default_heartbeat_secs() -> f32 {
    2.0
}

fn default_heartbeat_grace() -> f32 {
    2.5
}

fn default_reconnect_base_secs() -> f32 {
    1.0
}

fn default_max_reconnect_attempts() -> u32 {
    6
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_grace: default_heartbeat_grace(),
            reconnect_base_secs: default_reconnect_base_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            interp: InterpSpeeds::default(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f32(self.heartbeat_secs)
    }

    /// Elapsed time without a pong after which the link counts as dead.
    /// The grace multiple is floored at [`MIN_HEARTBEAT_GRACE`].
    pub fn heartbeat_timeout(&self) -> Duration {
        let grace = self.heartbeat_grace.max(MIN_HEARTBEAT_GRACE);
        Duration::from_secs_f32(self.heartbeat_secs * grace)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs_f32(self.reconnect_base_secs)
    }
}
