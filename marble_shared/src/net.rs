//! Wire protocol.
//!
//! Goals:
//! - Keep the JSON vocabulary explicit and versionable.
//! - Tolerate what the server might send: unknown message types still
//!   reach listeners, malformed payloads are passed through rather than
//!   raised, and entity records decode field-by-field with defaults so a
//!   newer or older server never rejects a whole snapshot.
//!
//! Every message carries a `"type"` discriminator. Outbound traffic is a
//! closed enum; inbound frames are split on the tag first.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for an endpoint going away (tab closed, server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Application close code used when the heartbeat goes silent.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Clean closures do not trigger the reconnect policy; everything else
/// (including [`CLOSE_HEARTBEAT_TIMEOUT`]) does.
pub fn is_clean_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
}

/// Outbound message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Session resume; the first frame after every successful open.
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Heartbeat. `timestamp` is unix milliseconds.
    Ping { timestamp: i64 },
    /// Aim the shooter. `yaw` is radians.
    Aim { yaw: f32 },
    /// Fire the loaded marble.
    Shoot,
    /// Request the public room list.
    ListRooms,
    /// Create a room.
    CreateRoom {
        name: String,
        #[serde(rename = "maxPlayers")]
        max_players: usize,
    },
    /// Join a specific room, optionally resuming a seat by token.
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

/// Serializes an outbound message to a text frame.
pub fn encode(msg: &ClientMsg) -> anyhow::Result<String> {
    serde_json::to_string(msg).context("serialize msg")
}

/// An inbound frame after tolerant decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// JSON object with a string `type` tag.
    Typed { kind: String, payload: Value },
    /// Valid JSON without a usable tag.
    Untyped(Value),
    /// Not JSON; carried through untouched.
    Raw(String),
}

impl Inbound {
    /// Decodes a text frame. Never fails: garbage stays [`Inbound::Raw`].
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(v) => {
                let kind = v.get("type").and_then(Value::as_str).map(str::to_owned);
                match kind {
                    Some(kind) => Inbound::Typed { kind, payload: v },
                    None => Inbound::Untyped(v),
                }
            }
            Err(_) => Inbound::Raw(text.to_string()),
        }
    }
}

/// Marbles rest slightly above the board; used when the wire omits `y`.
pub const MARBLE_REST_HEIGHT: f32 = 0.5;

fn marble_rest_height() -> f32 {
    MARBLE_REST_HEIGHT
}

fn lenient_f32<'de, D: Deserializer<'de>>(d: D) -> Result<f32, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(Value::as_f64).map_or(0.0, |n| n as f32))
}

fn lenient_f32_rest<'de, D: Deserializer<'de>>(d: D) -> Result<f32, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref()
        .and_then(Value::as_f64)
        .map_or(MARBLE_REST_HEIGHT, |n| n as f32))
}

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(Value::as_u64))
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_default())
}

/// Decodes a wire array record-by-record, dropping elements that do not
/// decode instead of rejecting the whole list.
fn lenient_records<'de, D, R>(d: D) -> Result<Vec<R>, D::Error>
where
    D: Deserializer<'de>,
    R: DeserializeOwned,
{
    let v = Value::deserialize(d)?;
    let items = v.as_array().cloned().unwrap_or_default();
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

/// One player entry in an authoritative `state` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerRecord {
    #[serde(deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(deserialize_with = "lenient_f32")]
    pub x: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub y: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub z: f32,
    /// Aim direction in radians.
    #[serde(deserialize_with = "lenient_f32")]
    pub yaw: f32,
    /// Color currently loaded in the shooter.
    #[serde(deserialize_with = "lenient_string")]
    pub loaded_color: String,
    /// Next color in the queue.
    #[serde(deserialize_with = "lenient_string")]
    pub next_color: String,
}

/// One marble entry in an authoritative `state` list. Free marbles and
/// chain marbles arrive flattened into the same list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarbleRecord {
    #[serde(deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(deserialize_with = "lenient_f32")]
    pub x: f32,
    #[serde(default = "marble_rest_height", deserialize_with = "lenient_f32_rest")]
    pub y: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub z: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub vx: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub vy: f32,
    #[serde(deserialize_with = "lenient_f32")]
    pub vz: f32,
    /// Seconds remaining before a free marble despawns.
    #[serde(deserialize_with = "lenient_f32")]
    pub life: f32,
    #[serde(deserialize_with = "lenient_string")]
    pub color: String,
    /// Owning player for fired marbles; absent for the shared chain.
    #[serde(deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub owner: Option<u64>,
}

impl Default for MarbleRecord {
    fn default() -> Self {
        Self {
            id: None,
            x: 0.0,
            y: MARBLE_REST_HEIGHT,
            z: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            life: 0.0,
            color: String::new(),
            owner: None,
        }
    }
}

/// `welcome` payload: the server's session grant.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Welcome {
    pub token: Option<String>,
    pub player: Option<PlayerRecord>,
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
}

impl Welcome {
    /// Extracts a welcome from a raw payload; anything unusable decodes
    /// to an empty grant rather than an error.
    pub fn from_value(v: &Value) -> Self {
        serde_json::from_value(v.clone()).unwrap_or_default()
    }
}

/// `state` payload: the complete live set for both entity kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(deserialize_with = "lenient_records")]
    pub players: Vec<PlayerRecord>,
    #[serde(deserialize_with = "lenient_records")]
    pub marbles: Vec<MarbleRecord>,
}

impl StateUpdate {
    pub fn from_value(v: &Value) -> Self {
        serde_json::from_value(v.clone()).unwrap_or_default()
    }
}
