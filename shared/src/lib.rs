use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod math;
pub mod protocol;

pub use math::{terrain_height, Vec3};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_CHANNEL: &str = "bird-garden-3d-v2";

pub const MAX_HEALTH: i32 = 5;
pub const TERRAIN_SIZE: f32 = 1000.0;
pub const WORLD_EDGE_MARGIN: f32 = 5.0;
pub const MIN_ALTITUDE: f32 = 2.0;
pub const MAX_ALTITUDE: f32 = 150.0;

pub const BIRD_SPEED: f32 = 25.0;
pub const BIRD_TURN_RATE: f32 = 2.5;
pub const BIRD_CLIMB_SPEED: f32 = 15.0;
pub const BIRD_RADIUS: f32 = 1.5;

pub const PROJECTILE_SPEED: f32 = 2.0;
pub const PROJECTILE_MAX_AGE: u32 = 120;
pub const PROJECTILE_RADIUS: f32 = 0.5;
pub const PROJECTILE_TERRAIN_MARGIN: f32 = 0.2;
pub const MUZZLE_OFFSET: f32 = 1.5;
pub const MUZZLE_LIFT: f32 = 0.5;

/// Squared distance under which a projectile counts as touching a bird.
pub const ACTOR_HIT_RADIUS_SQ: f32 = (BIRD_RADIUS + PROJECTILE_RADIUS) * (BIRD_RADIUS + PROJECTILE_RADIUS);

/// Relay-level packets. One bincode-encoded packet per UDP datagram.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    TokenRequest {
        client_version: u32,
        client_id: Option<String>,
    },
    Attach {
        token: String,
        channel: String,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
    PresenceEnter {
        data: Vec<u8>,
    },
    PresenceUpdate {
        data: Vec<u8>,
    },
    PresenceLeave,
    PresenceGet,
    Heartbeat,
    Detach,

    TokenGranted {
        token: String,
        client_id: String,
        capability: String,
        expires_at: u64,
    },
    Attached {
        channel: String,
        client_id: String,
    },
    Message {
        channel: String,
        topic: String,
        client_id: String,
        data: Vec<u8>,
    },
    Presence {
        channel: String,
        action: PresenceAction,
        member: PresenceMember,
    },
    PresenceMembers {
        channel: String,
        members: Vec<PresenceMember>,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Enter,
    Update,
    Leave,
}

/// A roster entry as the relay sees it: who entered, and the opaque data they entered with.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PresenceMember {
    pub client_id: String,
    pub data: Vec<u8>,
}

/// Milliseconds since the unix epoch, saturating to zero on a skewed clock.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
