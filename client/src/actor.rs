//! The local actor: the one bird this client owns and is authoritative for.

use crate::identity::Identity;
use shared::{
    terrain_height, Vec3, BIRD_CLIMB_SPEED, BIRD_SPEED, BIRD_TURN_RATE, MAX_ALTITUDE, MAX_HEALTH,
    MIN_ALTITUDE, MUZZLE_LIFT, MUZZLE_OFFSET, TERRAIN_SIZE, WORLD_EDGE_MARGIN,
};
use std::time::Instant;

pub const DASH_MIN_TO_START: f32 = 0.1;
pub const DASH_DRAIN_PER_SEC: f32 = 0.5;
pub const DASH_RECOVER_PER_SEC: f32 = 0.72;
pub const DASH_SPEED_MULTIPLIER: f32 = 2.5;

/// Movement intent sampled by the input layer, each axis in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Controls {
    pub forward: f32,
    pub turn: f32,
    pub up: f32,
}

impl Controls {
    pub fn clamped(self) -> Self {
        Self {
            forward: clamp_axis(self.forward),
            turn: clamp_axis(self.turn),
            up: clamp_axis(self.up),
        }
    }
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorStatus {
    Alive,
    Respawning { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// Already down, nothing changed.
    Ignored,
    Damaged,
    Downed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashGauge {
    level: f32,
    active: bool,
}

impl DashGauge {
    pub fn new() -> Self {
        Self {
            level: 1.0,
            active: false,
        }
    }

    /// Starts a dash if enough gauge is left. Returns true if a dash began.
    pub fn start(&mut self) -> bool {
        if self.active || self.level < DASH_MIN_TO_START {
            return false;
        }
        self.active = true;
        true
    }

    pub fn update(&mut self, dt: f32) {
        if self.active {
            self.level -= DASH_DRAIN_PER_SEC * dt;
            if self.level <= 0.0 {
                self.level = 0.0;
                self.active = false;
            }
        } else {
            self.level = (self.level + DASH_RECOVER_PER_SEC * dt).min(1.0);
        }
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn speed_multiplier(&self) -> f32 {
        if self.active {
            DASH_SPEED_MULTIPLIER
        } else {
            1.0
        }
    }
}

impl Default for DashGauge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct LocalActor {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: Vec3,
    pub heading: f32,
    pub health: i32,
    pub score: u32,
    pub status: ActorStatus,
    pub dash: DashGauge,
}

impl LocalActor {
    pub fn new(identity: &Identity, position: Vec3) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            color: identity.color.clone(),
            position,
            heading: 0.0,
            health: MAX_HEALTH,
            score: 0,
            status: ActorStatus::Alive,
            dash: DashGauge::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == ActorStatus::Alive && self.health > 0
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::from_heading(self.heading)
    }

    /// Where a freshly fired projectile starts.
    pub fn muzzle(&self) -> Vec3 {
        self.position + self.forward() * MUZZLE_OFFSET + Vec3::new(0.0, MUZZLE_LIFT, 0.0)
    }

    /// Applies one frame of movement intent. No effect while respawning.
    pub fn steer(&mut self, controls: Controls, dt: f32) {
        if !self.is_alive() {
            return;
        }
        let controls = controls.clamped();

        self.heading -= controls.turn * BIRD_TURN_RATE * dt;

        let speed = BIRD_SPEED * self.dash.speed_multiplier();
        let mut delta = self.forward() * (controls.forward * speed * dt);
        delta.y += controls.up * BIRD_CLIMB_SPEED * dt;

        self.position = clamp_to_world(self.position + delta);
    }

    /// Takes one point of damage. Reaching zero starts the respawn countdown.
    pub fn take_hit(&mut self, respawn_at: Instant) -> HitOutcome {
        if !self.is_alive() {
            return HitOutcome::Ignored;
        }

        self.health = (self.health - 1).max(0);
        if self.health == 0 {
            self.status = ActorStatus::Respawning { until: respawn_at };
            self.dash.stop();
            HitOutcome::Downed
        } else {
            HitOutcome::Damaged
        }
    }

    pub fn respawn_due(&self, now: Instant) -> bool {
        matches!(self.status, ActorStatus::Respawning { until } if now >= until)
    }

    pub fn complete_respawn(&mut self, position: Vec3) {
        self.position = position;
        self.health = MAX_HEALTH;
        self.status = ActorStatus::Alive;
    }

    /// Returns true if health actually went up.
    pub fn heal_full(&mut self) -> bool {
        if !self.is_alive() || self.health >= MAX_HEALTH {
            return false;
        }
        self.health = MAX_HEALTH;
        true
    }

    pub fn add_score(&mut self, points: u32) {
        self.score = self.score.saturating_add(points);
    }
}

/// Keeps a position inside the world square and between the ground and the ceiling.
pub fn clamp_to_world(position: Vec3) -> Vec3 {
    let limit = TERRAIN_SIZE / 2.0 - WORLD_EDGE_MARGIN;
    let x = position.x.clamp(-limit, limit);
    let z = position.z.clamp(-limit, limit);
    let floor = terrain_height(x, z) + MIN_ALTITUDE;
    let y = position.y.clamp(floor.min(MAX_ALTITUDE), MAX_ALTITUDE);
    Vec3::new(x, y, z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::time::Duration;

    fn actor() -> LocalActor {
        let identity = Identity {
            id: "player_test00001".to_string(),
            name: "Tester".to_string(),
            color: "#ffff66".to_string(),
        };
        LocalActor::new(&identity, Vec3::new(0.0, 80.0, 0.0))
    }

    #[test]
    fn test_new_actor_is_alive_with_full_health() {
        let actor = actor();
        assert!(actor.is_alive());
        assert_eq!(actor.health, MAX_HEALTH);
        assert_eq!(actor.score, 0);
    }

    #[test]
    fn test_forward_movement() {
        let mut actor = actor();
        actor.steer(
            Controls {
                forward: 1.0,
                turn: 0.0,
                up: 0.0,
            },
            1.0,
        );
        assert_approx_eq!(actor.position.z, BIRD_SPEED, 1e-4);
        assert_approx_eq!(actor.position.x, 0.0, 1e-4);
    }

    #[test]
    fn test_positive_turn_decreases_heading() {
        let mut actor = actor();
        actor.steer(
            Controls {
                forward: 0.0,
                turn: 1.0,
                up: 0.0,
            },
            0.5,
        );
        assert_approx_eq!(actor.heading, -BIRD_TURN_RATE * 0.5, 1e-6);
    }

    #[test]
    fn test_dash_multiplies_speed() {
        let mut actor = actor();
        assert!(actor.dash.start());
        actor.steer(
            Controls {
                forward: 1.0,
                turn: 0.0,
                up: 0.0,
            },
            0.1,
        );
        assert_approx_eq!(actor.position.z, BIRD_SPEED * DASH_SPEED_MULTIPLIER * 0.1, 1e-4);
    }

    #[test]
    fn test_controls_are_clamped() {
        let controls = Controls {
            forward: 3.0,
            turn: f32::NAN,
            up: -2.0,
        }
        .clamped();
        assert_eq!(controls.forward, 1.0);
        assert_eq!(controls.turn, 0.0);
        assert_eq!(controls.up, -1.0);
    }

    #[test]
    fn test_world_clamp() {
        let clamped = clamp_to_world(Vec3::new(900.0, 400.0, -900.0));
        assert_eq!(clamped.x, 495.0);
        assert_eq!(clamped.z, -495.0);
        assert_eq!(clamped.y, MAX_ALTITUDE);

        let low = clamp_to_world(Vec3::new(0.0, -10.0, 0.0));
        assert_approx_eq!(low.y, terrain_height(0.0, 0.0) + MIN_ALTITUDE, 1e-5);
    }

    #[test]
    fn test_take_hit_until_downed() {
        let mut actor = actor();
        let respawn_at = Instant::now() + Duration::from_secs(3);

        for _ in 0..(MAX_HEALTH - 1) {
            assert_eq!(actor.take_hit(respawn_at), HitOutcome::Damaged);
        }
        assert_eq!(actor.take_hit(respawn_at), HitOutcome::Downed);
        assert_eq!(actor.health, 0);
        assert!(!actor.is_alive());
        assert_eq!(actor.take_hit(respawn_at), HitOutcome::Ignored);
        assert_eq!(actor.health, 0);
    }

    #[test]
    fn test_respawning_suppresses_movement() {
        let mut actor = actor();
        let now = Instant::now();
        actor.health = 1;
        actor.take_hit(now + Duration::from_secs(3));

        let before = actor.position;
        actor.steer(
            Controls {
                forward: 1.0,
                turn: 1.0,
                up: 1.0,
            },
            1.0,
        );
        assert_eq!(actor.position, before);

        assert!(!actor.respawn_due(now));
        assert!(actor.respawn_due(now + Duration::from_secs(3)));

        actor.complete_respawn(Vec3::new(10.0, 50.0, 10.0));
        assert!(actor.is_alive());
        assert_eq!(actor.health, MAX_HEALTH);
        assert_eq!(actor.position, Vec3::new(10.0, 50.0, 10.0));
    }

    #[test]
    fn test_heal_full() {
        let mut actor = actor();
        assert!(!actor.heal_full());
        actor.health = 2;
        assert!(actor.heal_full());
        assert_eq!(actor.health, MAX_HEALTH);
    }

    #[test]
    fn test_dash_gauge_drains_and_recovers() {
        let mut gauge = DashGauge::new();
        assert!(gauge.start());
        assert!(!gauge.start());

        gauge.update(1.0);
        assert_approx_eq!(gauge.level(), 0.5, 1e-6);
        gauge.update(1.5);
        assert_eq!(gauge.level(), 0.0);
        assert!(!gauge.is_active());

        assert!(!gauge.start());
        gauge.update(0.5);
        assert_approx_eq!(gauge.level(), 0.36, 1e-6);
        assert!(gauge.start());

        let mut full = DashGauge::new();
        full.update(10.0);
        assert_eq!(full.level(), 1.0);
    }
}
