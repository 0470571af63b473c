//! Projectile registry shared by local and remotely announced shots.

use log::debug;
use rand::Rng;
use shared::protocol::FirePayload;
use shared::{
    terrain_height, Vec3, PROJECTILE_MAX_AGE, PROJECTILE_SPEED, PROJECTILE_TERRAIN_MARGIN,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub id: String,
    pub owner_id: String,
    pub position: Vec3,
    pub direction: Vec3,
    pub age: u32,
    pub max_age: u32,
}

impl Projectile {
    pub fn new(id: String, owner_id: String, position: Vec3, direction: Vec3) -> Self {
        Self {
            id,
            owner_id,
            position,
            direction: direction.normalized(),
            age: 0,
            max_age: PROJECTILE_MAX_AGE,
        }
    }

    pub fn from_fire(fire: &FirePayload) -> Self {
        Self::new(
            fire.id.clone(),
            fire.owner.clone(),
            Vec3::new(fire.x, fire.y, fire.z),
            Vec3::new(fire.dx, fire.dy, fire.dz),
        )
    }

    pub fn to_fire(&self) -> FirePayload {
        FirePayload {
            id: self.id.clone(),
            owner: self.owner_id.clone(),
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
            dx: self.direction.x,
            dy: self.direction.y,
            dz: self.direction.z,
        }
    }

    pub fn step(&mut self) {
        self.position += self.direction * PROJECTILE_SPEED;
        self.age += 1;
    }

    pub fn is_expired(&self) -> bool {
        self.age > self.max_age
    }

    pub fn hit_terrain(&self) -> bool {
        self.position.y < terrain_height(self.position.x, self.position.z) + PROJECTILE_TERRAIN_MARGIN
    }
}

/// `m_<owner>_<millis>_<6 hex digits>`
pub fn generate_projectile_id<R: Rng>(rng: &mut R, owner_id: &str, now_ms: u64) -> String {
    let suffix: u32 = rng.gen_range(0..0x100_0000);
    format!("m_{}_{}_{:06x}", owner_id, now_ms, suffix)
}

#[derive(Debug, Default)]
pub struct ProjectileRegistry {
    projectiles: BTreeMap<String, Projectile>,
}

impl ProjectileRegistry {
    pub fn new() -> Self {
        Self {
            projectiles: BTreeMap::new(),
        }
    }

    /// Inserts a projectile. A duplicate id keeps the first entry and returns false.
    pub fn insert(&mut self, projectile: Projectile) -> bool {
        if self.projectiles.contains_key(&projectile.id) {
            debug!("Ignoring duplicate projectile {}", projectile.id);
            return false;
        }
        self.projectiles.insert(projectile.id.clone(), projectile);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Projectile> {
        self.projectiles.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Projectile> {
        self.projectiles.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.projectiles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.projectiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projectiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Projectile> {
        self.projectiles.values()
    }

    /// Moves every projectile one tick along its direction.
    pub fn advance(&mut self) {
        for projectile in self.projectiles.values_mut() {
            projectile.step();
        }
    }
}

/// Memory of projectile ids that were already resolved here.
///
/// Entries are forgotten once they are older than `retention`, which has to
/// outlast any projectile's flight plus relay delay. `capacity` is only a
/// ceiling on memory; under normal fire rates ids age out long before it.
#[derive(Debug)]
pub struct ResolvedIds {
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
    retention: Duration,
    capacity: usize,
}

impl ResolvedIds {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            retention,
            capacity,
        }
    }

    pub fn insert(&mut self, id: &str, now: Instant) {
        self.prune(now);
        if self.capacity == 0 || !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back((id.to_string(), now));
        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Forgets ids resolved more than `retention` ago.
    pub fn prune(&mut self, now: Instant) {
        while let Some((id, resolved_at)) = self.order.front() {
            if now.saturating_duration_since(*resolved_at) <= self.retention {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
