//! Game messages carried as JSON payloads over relay topics.
//!
//! Every topic maps to exactly one [`GameMessage`] variant. Decoding is the
//! validation boundary: anything that does not parse into a well-formed
//! variant comes back as `None` and is dropped by the caller.

use crate::Vec3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const TOPIC_STATE: &str = "state";
pub const TOPIC_FIRE: &str = "fire";
pub const TOPIC_HIT: &str = "hit";
pub const TOPIC_HIT_RAINBOW: &str = "hit_rainbow";
pub const TOPIC_CHICKEN_HIT: &str = "chicken_hit";
pub const TOPIC_HEART_TAKEN: &str = "heart_taken";
pub const TOPIC_HP_UPDATE: &str = "hp_update";
pub const TOPIC_RESPAWN: &str = "respawn";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub ry: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirePayload {
    pub id: String,
    pub owner: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitPayload {
    pub target_id: String,
    pub attacker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missile_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RainbowHitPayload {
    pub attacker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missile_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChickenHitPayload {
    pub chicken_id: u32,
    pub attacker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missile_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartTakenPayload {
    pub heart_index: usize,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpUpdatePayload {
    pub id: String,
    pub hp: i32,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespawnPayload {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub hp: i32,
}

/// Data a client enters into presence: who it is and how it looks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub id: String,
    pub name: String,
    pub color: String,
    pub score: u32,
    pub hp: i32,
}

impl PresenceData {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let presence: PresenceData = serde_json::from_slice(data).ok()?;
        if presence.id.is_empty() {
            return None;
        }
        Some(presence)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameMessage {
    State(StatePayload),
    Fire(FirePayload),
    Hit(HitPayload),
    HitRainbow(RainbowHitPayload),
    ChickenHit(ChickenHitPayload),
    HeartTaken(HeartTakenPayload),
    HpUpdate(HpUpdatePayload),
    Respawn(RespawnPayload),
}

impl GameMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            GameMessage::State(_) => TOPIC_STATE,
            GameMessage::Fire(_) => TOPIC_FIRE,
            GameMessage::Hit(_) => TOPIC_HIT,
            GameMessage::HitRainbow(_) => TOPIC_HIT_RAINBOW,
            GameMessage::ChickenHit(_) => TOPIC_CHICKEN_HIT,
            GameMessage::HeartTaken(_) => TOPIC_HEART_TAKEN,
            GameMessage::HpUpdate(_) => TOPIC_HP_UPDATE,
            GameMessage::Respawn(_) => TOPIC_RESPAWN,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            GameMessage::State(p) => serde_json::to_vec(p),
            GameMessage::Fire(p) => serde_json::to_vec(p),
            GameMessage::Hit(p) => serde_json::to_vec(p),
            GameMessage::HitRainbow(p) => serde_json::to_vec(p),
            GameMessage::ChickenHit(p) => serde_json::to_vec(p),
            GameMessage::HeartTaken(p) => serde_json::to_vec(p),
            GameMessage::HpUpdate(p) => serde_json::to_vec(p),
            GameMessage::Respawn(p) => serde_json::to_vec(p),
        }
    }

    pub fn decode(topic: &str, data: &[u8]) -> Option<Self> {
        let message = match topic {
            TOPIC_STATE => GameMessage::State(parse(data)?),
            TOPIC_FIRE => GameMessage::Fire(parse(data)?),
            TOPIC_HIT => GameMessage::Hit(parse(data)?),
            TOPIC_HIT_RAINBOW => GameMessage::HitRainbow(parse(data)?),
            TOPIC_CHICKEN_HIT => GameMessage::ChickenHit(parse(data)?),
            TOPIC_HEART_TAKEN => GameMessage::HeartTaken(parse(data)?),
            TOPIC_HP_UPDATE => GameMessage::HpUpdate(parse(data)?),
            TOPIC_RESPAWN => GameMessage::Respawn(parse(data)?),
            _ => return None,
        };

        message.is_well_formed().then_some(message)
    }

    /// The actor this message makes a claim about. Only that actor's own
    /// connection may publish it.
    pub fn claimed_actor(&self) -> &str {
        match self {
            GameMessage::State(p) => &p.id,
            GameMessage::Fire(p) => &p.owner,
            GameMessage::Hit(p) => &p.attacker_id,
            GameMessage::HitRainbow(p) => &p.attacker_id,
            GameMessage::ChickenHit(p) => &p.attacker_id,
            GameMessage::HeartTaken(p) => &p.id,
            GameMessage::HpUpdate(p) => &p.id,
            GameMessage::Respawn(p) => &p.id,
        }
    }

    fn is_well_formed(&self) -> bool {
        match self {
            GameMessage::State(p) => {
                !p.id.is_empty() && Vec3::new(p.x, p.y, p.z).is_finite() && p.ry.is_finite()
            }
            GameMessage::Fire(p) => {
                !p.id.is_empty()
                    && !p.owner.is_empty()
                    && Vec3::new(p.x, p.y, p.z).is_finite()
                    && Vec3::new(p.dx, p.dy, p.dz).is_finite()
            }
            GameMessage::Hit(p) => !p.target_id.is_empty() && !p.attacker_id.is_empty(),
            GameMessage::HitRainbow(p) => !p.attacker_id.is_empty(),
            GameMessage::ChickenHit(p) => !p.attacker_id.is_empty(),
            GameMessage::HeartTaken(p) => !p.id.is_empty(),
            GameMessage::HpUpdate(p) => !p.id.is_empty(),
            GameMessage::Respawn(p) => !p.id.is_empty() && Vec3::new(p.x, p.y, p.z).is_finite(),
        }
    }
}

fn parse<T: DeserializeOwned>(data: &[u8]) -> Option<T> {
    serde_json::from_slice(data).ok()
}
