//! Mirrors of the other players in the room.
//!
//! Every field here belongs to some other client. Updates are applied as
//! overwrites of whatever fields a message carries, never as deltas, so the
//! latest message for an actor always wins regardless of what was missed.

use log::{debug, info};
use shared::protocol::{HpUpdatePayload, PresenceData, RespawnPayload, StatePayload};
use shared::{Vec3, MAX_HEALTH};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Fraction of the remaining distance covered when a state message arrives.
pub const STATE_LERP: f32 = 0.5;

const UNKNOWN_NAME: &str = "???";
const UNKNOWN_COLOR: &str = "#ffffff";
const DEFAULT_SPAWN: Vec3 = Vec3::new(0.0, 10.0, 0.0);

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActor {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: Vec3,
    pub heading: f32,
    pub health: i32,
    pub score: u32,
    pub visible: bool,
    pub last_seen: Instant,
}

impl RemoteActor {
    pub fn new(id: &str, now: Instant) -> Self {
        Self {
            id: id.to_string(),
            name: UNKNOWN_NAME.to_string(),
            color: UNKNOWN_COLOR.to_string(),
            position: DEFAULT_SPAWN,
            heading: 0.0,
            health: MAX_HEALTH,
            score: 0,
            visible: true,
            last_seen: now,
        }
    }

    /// Alive and shown, so it can be hit and counts for respawn spacing.
    pub fn is_targetable(&self) -> bool {
        self.health > 0 && self.visible
    }

    fn set_health(&mut self, health: i32) {
        self.health = health.clamp(0, MAX_HEALTH);
        self.visible = self.health > 0;
    }
}

#[derive(Debug, Default)]
pub struct RemoteRegistry {
    actors: BTreeMap<String, RemoteActor>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self {
            actors: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&RemoteActor> {
        self.actors.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.actors.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteActor> {
        self.actors.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.actors.keys().map(String::as_str)
    }

    /// Returns the actor for `id`, creating it on first sighting.
    fn ensure(&mut self, id: &str, now: Instant) -> (&mut RemoteActor, bool) {
        let created = !self.actors.contains_key(id);
        if created {
            info!("Remote actor {} appeared", id);
        }
        let actor = self
            .actors
            .entry(id.to_string())
            .or_insert_with(|| RemoteActor::new(id, now));
        actor.last_seen = now;
        (actor, created)
    }

    /// Refreshes liveness for an actor we already know about.
    pub fn touch(&mut self, id: &str, now: Instant) {
        if let Some(actor) = self.actors.get_mut(id) {
            actor.last_seen = now;
        }
    }

    pub fn apply_state(&mut self, state: &StatePayload, now: Instant) {
        let target = Vec3::new(state.x, state.y, state.z);
        let (actor, created) = self.ensure(&state.id, now);

        actor.position = if created {
            target
        } else {
            actor.position.lerp(target, STATE_LERP)
        };
        actor.heading = state.ry;
    }

    pub fn apply_hp_update(&mut self, update: &HpUpdatePayload, now: Instant) {
        let (actor, _) = self.ensure(&update.id, now);
        actor.set_health(update.hp);
        actor.score = update.score;
    }

    pub fn apply_respawn(&mut self, respawn: &RespawnPayload, now: Instant) {
        let (actor, _) = self.ensure(&respawn.id, now);
        actor.position = Vec3::new(respawn.x, respawn.y, respawn.z);
        actor.set_health(respawn.hp);
    }

    /// Applies a roster entry. Health and score are only taken from presence
    /// when the actor is new; afterwards they are owned by `hp_update`.
    pub fn apply_presence(&mut self, presence: &PresenceData, now: Instant) {
        let (actor, created) = self.ensure(&presence.id, now);
        actor.name = presence.name.clone();
        actor.color = presence.color.clone();
        if created {
            actor.set_health(presence.hp);
            actor.score = presence.score;
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<RemoteActor> {
        let removed = self.actors.remove(id);
        if removed.is_some() {
            info!("Remote actor {} removed", id);
        }
        removed
    }

    /// Makes the key set equal the member set, minus the local id.
    /// Returns the ids that were removed.
    pub fn reconcile(
        &mut self,
        members: &[PresenceData],
        local_id: &str,
        now: Instant,
    ) -> Vec<String> {
        let mut present = BTreeSet::new();
        for member in members.iter().filter(|m| m.id != local_id) {
            self.apply_presence(member, now);
            present.insert(member.id.as_str());
        }

        let absent: Vec<String> = self
            .actors
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();

        for id in &absent {
            self.remove(id);
        }
        absent
    }

    /// Drops actors nothing has been heard from within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .actors
            .values()
            .filter(|actor| now.saturating_duration_since(actor.last_seen) > timeout)
            .map(|actor| actor.id.clone())
            .collect();

        for id in &stale {
            debug!("Remote actor {} went silent", id);
            self.remove(id);
        }
        stale
    }
}
