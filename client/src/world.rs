//! Consumable world entities: the chicken flock, the rainbow chicken and healing hearts.
//!
//! Layout is derived from a room seed so that every client in the same channel
//! sees the same flock in the same place. Chickens orbit as a pure function of
//! wall-clock time, which keeps peers roughly in agreement without syncing
//! positions over the wire.

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{terrain_height, Vec3, BIRD_RADIUS, PROJECTILE_RADIUS, TERRAIN_SIZE};
use std::f64::consts::TAU;
use std::ops::Range;
use std::time::{Duration, Instant};

pub const CHICKEN_COUNT: usize = 10;
pub const HEART_COUNT: usize = 2;

pub const CHICKEN_RADIUS: f32 = 3.5;
pub const RAINBOW_RADIUS: f32 = 6.0;
pub const HEART_RADIUS: f32 = 1.8;
pub const RAM_RADIUS: f32 = 3.0;

pub const CHICKEN_HIT_RADIUS_SQ: f32 =
    (CHICKEN_RADIUS + PROJECTILE_RADIUS) * (CHICKEN_RADIUS + PROJECTILE_RADIUS);
pub const RAINBOW_HIT_RADIUS_SQ: f32 =
    (RAINBOW_RADIUS + PROJECTILE_RADIUS) * (RAINBOW_RADIUS + PROJECTILE_RADIUS);
pub const CHICKEN_RAM_RADIUS_SQ: f32 = (RAM_RADIUS + CHICKEN_RADIUS) * (RAM_RADIUS + CHICKEN_RADIUS);
pub const RAINBOW_RAM_RADIUS_SQ: f32 = (RAM_RADIUS + RAINBOW_RADIUS) * (RAM_RADIUS + RAINBOW_RADIUS);
pub const HEART_TOUCH_RADIUS_SQ: f32 = (BIRD_RADIUS + HEART_RADIUS) * (BIRD_RADIUS + HEART_RADIUS);

pub const GOLD_CHICKEN_POINTS: u32 = 2;
pub const CHICKEN_POINTS: u32 = 1;
pub const RAINBOW_MAX_HP: i32 = 2;
pub const RAINBOW_KILL_REWARD: u32 = 5;

pub const CHICKEN_RESPAWN_DELAY: Duration = Duration::from_secs(30);
pub const RAINBOW_RESPAWN_DELAY: Duration = Duration::from_secs(5 * 60);
pub const HEART_RESPAWN_DELAY: Duration = Duration::from_secs(20);
pub const RAINBOW_RAM_COOLDOWN: Duration = Duration::from_secs(1);

const HEART_HEIGHT_RANGE: Range<f32> = 8.0..35.0;
const HEART_PLACEMENT_TRIES: usize = 20;
const HEART_LIFT: f32 = 3.5;
const HEART_FALLBACK: Vec3 = Vec3::new(0.0, 20.0, 0.0);

/// FNV-1a over the channel name. Stable across builds and platforms.
pub fn room_seed(channel: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in channel.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Circular flight path around a base point, bobbing up and down.
#[derive(Debug, Clone, PartialEq)]
pub struct Orbit {
    pub base_x: f32,
    pub base_z: f32,
    pub radius: f32,
    pub speed: f64,
    pub phase: f64,
    pub height: f32,
}

impl Orbit {
    fn random(rng: &mut StdRng, radius: Range<f32>, speed: Range<f64>, height: Range<f32>) -> Self {
        let half_span = TERRAIN_SIZE * 0.4;
        Self {
            base_x: rng.gen_range(-half_span..half_span),
            base_z: rng.gen_range(-half_span..half_span),
            radius: rng.gen_range(radius),
            speed: rng.gen_range(speed),
            phase: rng.gen_range(0.0..TAU),
            height: rng.gen_range(height),
        }
    }

    pub fn position_at(&self, wall_ms: f64) -> Vec3 {
        let angle = wall_ms * self.speed + self.phase;
        let bob = (wall_ms * 0.0008 + self.phase).sin() * 7.0;
        Vec3::new(
            self.base_x + (angle.cos() as f32) * self.radius,
            self.height + bob as f32,
            self.base_z + (angle.sin() as f32) * self.radius,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Chicken {
    pub id: u32,
    pub gold: bool,
    pub orbit: Orbit,
    pub position: Vec3,
    pub respawn_at: Option<Instant>,
}

impl Chicken {
    pub fn is_present(&self) -> bool {
        self.respawn_at.is_none()
    }

    pub fn points(&self) -> u32 {
        if self.gold {
            GOLD_CHICKEN_POINTS
        } else {
            CHICKEN_POINTS
        }
    }
}

#[derive(Debug, Clone)]
pub struct RainbowChicken {
    pub orbit: Orbit,
    pub position: Vec3,
    pub hp: i32,
    pub respawn_at: Option<Instant>,
    pub last_hitter: Option<String>,
    last_ram: Option<Instant>,
    generation: u64,
}

impl RainbowChicken {
    pub fn is_present(&self) -> bool {
        self.respawn_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RainbowOutcome {
    /// Not present; the hit did nothing.
    Ignored,
    Damaged { remaining: i32 },
    Killed { by: String },
}

#[derive(Debug, Clone)]
pub struct Heart {
    pub position: Vec3,
    pub respawn_at: Option<Instant>,
    generation: u64,
}

impl Heart {
    pub fn is_present(&self) -> bool {
        self.respawn_at.is_none()
    }
}

#[derive(Debug)]
pub struct World {
    seed: u64,
    pub chickens: Vec<Chicken>,
    pub rainbow: RainbowChicken,
    pub hearts: Vec<Heart>,
}

impl World {
    pub fn new(seed: u64, wall_ms: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let chickens = (0..CHICKEN_COUNT as u32)
            .map(|id| {
                let orbit = Orbit::random(&mut rng, 55.0..115.0, 0.00015..0.00024, 38.0..58.0);
                Chicken {
                    id,
                    gold: id == 0,
                    position: orbit.position_at(wall_ms),
                    orbit,
                    respawn_at: None,
                }
            })
            .collect();

        let orbit = rainbow_orbit(seed, 0);
        let rainbow = RainbowChicken {
            position: orbit.position_at(wall_ms),
            orbit,
            hp: RAINBOW_MAX_HP,
            respawn_at: None,
            last_hitter: None,
            last_ram: None,
            generation: 0,
        };

        let hearts = (0..HEART_COUNT)
            .map(|index| Heart {
                position: heart_position(seed, index, 0),
                respawn_at: None,
                generation: 0,
            })
            .collect();

        Self {
            seed,
            chickens,
            rainbow,
            hearts,
        }
    }

    /// Moves everything present and brings back whatever is due.
    pub fn update(&mut self, now: Instant, wall_ms: f64) {
        for chicken in &mut self.chickens {
            if matches!(chicken.respawn_at, Some(at) if now >= at) {
                chicken.respawn_at = None;
            }
            if chicken.is_present() {
                chicken.position = chicken.orbit.position_at(wall_ms);
            }
        }

        if matches!(self.rainbow.respawn_at, Some(at) if now >= at) {
            self.rainbow.orbit = rainbow_orbit(self.seed, self.rainbow.generation);
            self.rainbow.hp = RAINBOW_MAX_HP;
            self.rainbow.respawn_at = None;
            self.rainbow.last_hitter = None;
            info!("Rainbow chicken is back");
        }
        if self.rainbow.is_present() {
            self.rainbow.position = self.rainbow.orbit.position_at(wall_ms);
        }

        for (index, heart) in self.hearts.iter_mut().enumerate() {
            if matches!(heart.respawn_at, Some(at) if now >= at) {
                heart.position = heart_position(self.seed, index, heart.generation);
                heart.respawn_at = None;
            }
        }
    }

    pub fn chicken(&self, id: u32) -> Option<&Chicken> {
        self.chickens.iter().find(|c| c.id == id)
    }

    /// First present chicken within `radius_sq` of `position`.
    pub fn chicken_near(&self, position: Vec3, radius_sq: f32) -> Option<u32> {
        self.chickens
            .iter()
            .filter(|c| c.is_present())
            .find(|c| c.position.distance_squared(position) < radius_sq)
            .map(|c| c.id)
    }

    /// Every present chicken within `radius_sq` of `position`.
    pub fn chickens_near(&self, position: Vec3, radius_sq: f32) -> Vec<u32> {
        self.chickens
            .iter()
            .filter(|c| c.is_present() && c.position.distance_squared(position) < radius_sq)
            .map(|c| c.id)
            .collect()
    }

    /// Takes a chicken out of the sky. Returns its point value if it was present.
    pub fn remove_chicken(&mut self, id: u32, now: Instant) -> Option<u32> {
        let chicken = self.chickens.iter_mut().find(|c| c.id == id)?;
        if !chicken.is_present() {
            return None;
        }
        chicken.respawn_at = Some(now + CHICKEN_RESPAWN_DELAY);
        Some(chicken.points())
    }

    pub fn rainbow_near(&self, position: Vec3, radius_sq: f32) -> bool {
        self.rainbow.is_present() && self.rainbow.position.distance_squared(position) < radius_sq
    }

    /// Applies one point of damage to the rainbow chicken on behalf of `attacker_id`.
    pub fn hit_rainbow(&mut self, attacker_id: &str, now: Instant) -> RainbowOutcome {
        if !self.rainbow.is_present() {
            return RainbowOutcome::Ignored;
        }

        self.rainbow.hp -= 1;
        self.rainbow.last_hitter = Some(attacker_id.to_string());

        if self.rainbow.hp > 0 {
            return RainbowOutcome::Damaged {
                remaining: self.rainbow.hp,
            };
        }

        info!("Rainbow chicken downed by {}", attacker_id);
        self.rainbow.hp = 0;
        self.rainbow.respawn_at = Some(now + RAINBOW_RESPAWN_DELAY);
        self.rainbow.generation += 1;
        RainbowOutcome::Killed {
            by: attacker_id.to_string(),
        }
    }

    /// Rate-limits dash rams on the rainbow chicken. Returns true if this ram counts.
    pub fn try_ram_rainbow(&mut self, now: Instant) -> bool {
        match self.rainbow.last_ram {
            Some(last) if now.saturating_duration_since(last) < RAINBOW_RAM_COOLDOWN => false,
            _ => {
                self.rainbow.last_ram = Some(now);
                true
            }
        }
    }

    pub fn heart_near(&self, position: Vec3) -> Option<usize> {
        self.hearts
            .iter()
            .position(|h| h.is_present() && h.position.distance_squared(position) < HEART_TOUCH_RADIUS_SQ)
    }

    /// Hides a heart until its respawn. Returns false for unknown or already taken hearts.
    pub fn take_heart(&mut self, index: usize, now: Instant) -> bool {
        match self.hearts.get_mut(index) {
            Some(heart) if heart.is_present() => {
                heart.respawn_at = Some(now + HEART_RESPAWN_DELAY);
                heart.generation += 1;
                true
            }
            _ => false,
        }
    }
}

fn rainbow_orbit(seed: u64, generation: u64) -> Orbit {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5241_494e_424f_5700 ^ generation);
    Orbit::random(&mut rng, 80.0..150.0, 0.00013..0.0002, 45.0..70.0)
}

fn heart_position(seed: u64, index: usize, generation: u64) -> Vec3 {
    let mut rng = StdRng::seed_from_u64(
        seed.wrapping_add(0x4845_4152_5400_0000)
            .wrapping_add((index as u64) << 32)
            .wrapping_add(generation),
    );
    let half_span = TERRAIN_SIZE * 0.45;

    for _ in 0..HEART_PLACEMENT_TRIES {
        let x = rng.gen_range(-half_span..half_span);
        let z = rng.gen_range(-half_span..half_span);
        let ground = terrain_height(x, z);
        if HEART_HEIGHT_RANGE.contains(&ground) {
            return Vec3::new(x, ground + HEART_LIFT, z);
        }
    }
    HEART_FALLBACK
}
