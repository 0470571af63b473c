//! Hit arbitration: deciding, per projectile and per tick, what it touched and
//! whether this client is the one allowed to say so.
//!
//! Authority rules:
//! - Only the target's own client applies damage to that target.
//! - Only the owner's client declares a hit on a remote actor, and a
//!   projectile hits at most one actor.
//! - World entities are resolved by whoever detects them first; only the
//!   owner's client credits score or announces the event.

use crate::projectile::Projectile;
use crate::remote::RemoteRegistry;
use crate::world::{World, CHICKEN_HIT_RADIUS_SQ, RAINBOW_HIT_RADIUS_SQ};
use shared::{Vec3, ACTOR_HIT_RADIUS_SQ};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Outlived its maximum age.
    Expired,
    /// Dropped below the ground.
    TerrainImpact,
    /// A peer's projectile touched the local actor.
    LocalHit,
    /// One of our projectiles touched this remote actor.
    RemoteHit { target_id: String },
    ChickenHit { chicken_id: u32 },
    RainbowHit,
}

/// What a projectile can run into this tick, as seen by one client.
pub struct Arena<'a> {
    pub local_id: &'a str,
    /// Local actor position, or None while the local actor is down.
    pub local_position: Option<Vec3>,
    pub remotes: &'a RemoteRegistry,
    pub world: &'a World,
}

/// Judges one already advanced projectile. `None` means it keeps flying.
pub fn judge(projectile: &Projectile, arena: &Arena<'_>) -> Option<Verdict> {
    if projectile.is_expired() {
        return Some(Verdict::Expired);
    }
    if projectile.hit_terrain() {
        return Some(Verdict::TerrainImpact);
    }

    let owned_locally = projectile.owner_id == arena.local_id;

    if !owned_locally {
        if let Some(local) = arena.local_position {
            if projectile.position.distance_squared(local) < ACTOR_HIT_RADIUS_SQ {
                return Some(Verdict::LocalHit);
            }
        }
    }

    if owned_locally {
        // First match in registry order wins
        let target = arena.remotes.iter().find(|remote| {
            remote.is_targetable()
                && projectile.position.distance_squared(remote.position) < ACTOR_HIT_RADIUS_SQ
        });
        if let Some(remote) = target {
            return Some(Verdict::RemoteHit {
                target_id: remote.id.clone(),
            });
        }
    }

    if let Some(chicken_id) = arena
        .world
        .chicken_near(projectile.position, CHICKEN_HIT_RADIUS_SQ)
    {
        return Some(Verdict::ChickenHit { chicken_id });
    }

    if arena
        .world
        .rainbow_near(projectile.position, RAINBOW_HIT_RADIUS_SQ)
    {
        return Some(Verdict::RainbowHit);
    }

    None
}

/// Judges every projectile in iteration order.
pub fn judge_all<'p, I>(projectiles: I, arena: &Arena<'_>) -> Vec<(Projectile, Verdict)>
where
    I: IntoIterator<Item = &'p Projectile>,
{
    projectiles
        .into_iter()
        .filter_map(|p| judge(p, arena).map(|verdict| (p.clone(), verdict)))
        .collect()
}
