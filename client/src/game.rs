//! The game session: single owner of every registry and the rules that bind them.
//!
//! Nothing in here touches the network. Handlers take decoded messages and
//! push whatever has to go out into an outbox, which the driver flushes after
//! each call. That keeps every mutation on one sequencing point and makes the
//! whole protocol testable without sockets.

use crate::actor::{Controls, HitOutcome, LocalActor};
use crate::arbitration::{judge_all, Arena, Verdict};
use crate::identity::Identity;
use crate::projectile::{generate_projectile_id, Projectile, ProjectileRegistry, ResolvedIds};
use crate::remote::RemoteRegistry;
use crate::world::{
    room_seed, RainbowOutcome, World, CHICKEN_RAM_RADIUS_SQ, RAINBOW_KILL_REWARD,
    RAINBOW_RAM_RADIUS_SQ,
};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::protocol::{
    ChickenHitPayload, GameMessage, HeartTakenPayload, HitPayload, HpUpdatePayload, PresenceData,
    RainbowHitPayload, RespawnPayload, StatePayload,
};
use shared::{terrain_height, PresenceAction, PresenceMember, Vec3, TERRAIN_SIZE};
use std::time::{Duration, Instant};

const RESPAWN_TRIES: usize = 30;
const RESPAWN_MIN_DISTANCE_SQ: f32 = 50.0 * 50.0;
const RESPAWN_MIN_CLEARANCE: f32 = 5.0;
const RESPAWN_FALLBACK: Vec3 = Vec3::new(0.0, 50.0, 0.0);
const RANKING_SIZE: usize = 3;

/// Tunables for the sync core.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tick_interval: Duration,
    pub state_interval: Duration,
    pub presence_interval: Duration,
    pub heartbeat_interval: Duration,
    pub respawn_delay: Duration,
    pub remote_timeout: Duration,
    /// Frames longer than this are simulated as this long.
    pub max_frame_dt: f32,
    /// How long a resolved projectile id is remembered.
    pub resolved_retention: Duration,
    pub resolved_capacity: usize,
    /// First delay before reconnecting after the relay drops us; doubles per failed attempt.
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_micros(16_667),
            state_interval: Duration::from_millis(100),
            presence_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            respawn_delay: Duration::from_secs(3),
            remote_timeout: Duration::from_secs(15),
            max_frame_dt: 0.1,
            resolved_retention: Duration::from_secs(30),
            resolved_capacity: 4096,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Clock readings for one simulation step.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub now: Instant,
    /// Wall-clock milliseconds since the unix epoch, drives entity orbits.
    pub wall_ms: f64,
    pub dt: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Publish(GameMessage),
    PresenceUpdate(PresenceData),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorView {
    pub id: String,
    pub name: String,
    pub color: String,
    pub position: Vec3,
    pub heading: f32,
    pub health: i32,
    pub score: u32,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileView {
    pub position: Vec3,
    pub direction: Vec3,
    pub owned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Chicken,
    GoldChicken,
    Rainbow,
    Heart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub kind: EntityKind,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    pub id: String,
    pub name: String,
    pub score: u32,
    pub is_local: bool,
}

/// Everything the front end needs to draw one frame.
#[derive(Debug, Clone, Default)]
pub struct RenderSnapshot {
    pub local: ActorView,
    pub remotes: Vec<ActorView>,
    pub projectiles: Vec<ProjectileView>,
    pub entities: Vec<EntityView>,
    pub ranking: Vec<RankEntry>,
    pub members: usize,
    pub online: bool,
    pub notice: Option<String>,
    pub dash_level: f32,
    pub dashing: bool,
}

pub struct GameSession {
    config: SessionConfig,
    local: LocalActor,
    remotes: RemoteRegistry,
    projectiles: ProjectileRegistry,
    resolved: ResolvedIds,
    world: World,
    controls: Controls,
    outbox: Vec<Outbound>,
    rng: StdRng,
    members: usize,
    online: bool,
    notice: Option<String>,
    ticks: u64,
}

impl GameSession {
    pub fn new(identity: Identity, channel: &str, config: SessionConfig, wall_ms: f64) -> Self {
        Self::with_rng(identity, channel, config, wall_ms, StdRng::from_entropy())
    }

    pub fn with_rng(
        identity: Identity,
        channel: &str,
        config: SessionConfig,
        wall_ms: f64,
        rng: StdRng,
    ) -> Self {
        let resolved = ResolvedIds::new(config.resolved_retention, config.resolved_capacity);
        let mut session = Self {
            config,
            local: LocalActor::new(&identity, RESPAWN_FALLBACK),
            remotes: RemoteRegistry::new(),
            projectiles: ProjectileRegistry::new(),
            resolved,
            world: World::new(room_seed(channel), wall_ms),
            controls: Controls::default(),
            outbox: Vec::new(),
            rng,
            members: 1,
            online: false,
            notice: None,
            ticks: 0,
        };
        session.local.position = session.find_respawn_position();
        info!(
            "Session {} ({}) spawned at {:?}",
            session.local.id, session.local.name, session.local.position
        );
        session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalActor {
        &self.local
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    pub fn remotes(&self) -> &RemoteRegistry {
        &self.remotes
    }

    pub fn projectiles(&self) -> &ProjectileRegistry {
        &self.projectiles
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_notice(&mut self, notice: impl Into<String>) {
        self.notice = Some(notice.into());
    }

    pub fn set_controls(&mut self, controls: Controls) {
        self.controls = controls.clamped();
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn publish(&mut self, message: GameMessage) {
        self.outbox.push(Outbound::Publish(message));
    }

    pub fn presence_data(&self) -> PresenceData {
        PresenceData {
            id: self.local.id.clone(),
            name: self.local.name.clone(),
            color: self.local.color.clone(),
            score: self.local.score,
            hp: self.local.health,
        }
    }

    /// Announces our own health and score, on the topic and in presence.
    fn publish_hp_update(&mut self) {
        self.publish(GameMessage::HpUpdate(HpUpdatePayload {
            id: self.local.id.clone(),
            hp: self.local.health,
            score: self.local.score,
        }));
        let presence = self.presence_data();
        self.outbox.push(Outbound::PresenceUpdate(presence));
    }

    /// Queues the periodic state broadcast. Nothing is sent while down.
    pub fn queue_state(&mut self) {
        if !self.local.is_alive() {
            return;
        }
        self.publish(GameMessage::State(StatePayload {
            id: self.local.id.clone(),
            x: self.local.position.x,
            y: self.local.position.y,
            z: self.local.position.z,
            ry: self.local.heading,
        }));
    }

    /// Launches a projectile from the local actor. Returns its id.
    pub fn fire(&mut self, now_ms: u64) -> Option<String> {
        if !self.local.is_alive() {
            return None;
        }

        let id = generate_projectile_id(&mut self.rng, &self.local.id, now_ms);
        let projectile = Projectile::new(
            id.clone(),
            self.local.id.clone(),
            self.local.muzzle(),
            self.local.forward(),
        );
        let announcement = projectile.to_fire();

        if !self.projectiles.insert(projectile) {
            return None;
        }
        self.publish(GameMessage::Fire(announcement));
        Some(id)
    }

    pub fn start_dash(&mut self) -> bool {
        self.local.is_alive() && self.local.dash.start()
    }

    /// Advances the simulation by one frame.
    pub fn tick(&mut self, frame: Frame) {
        let dt = frame.dt.clamp(0.0, self.config.max_frame_dt);

        if self.local.respawn_due(frame.now) {
            self.respawn_local();
        }

        if self.local.is_alive() {
            self.local.steer(self.controls, dt);
            self.local.dash.update(dt);
        }

        self.world.update(frame.now, frame.wall_ms);

        if self.local.is_alive() {
            if self.local.dash.is_active() {
                self.resolve_dash_rams(frame.now);
            }
            self.collect_heart(frame.now);
        }

        self.resolved.prune(frame.now);
        self.projectiles.advance();
        let verdicts = {
            let arena = Arena {
                local_id: &self.local.id,
                local_position: self.local.is_alive().then_some(self.local.position),
                remotes: &self.remotes,
                world: &self.world,
            };
            judge_all(self.projectiles.iter(), &arena)
        };
        for (projectile, verdict) in verdicts {
            self.apply_verdict(projectile, verdict, frame.now);
        }

        for id in self.remotes.expire(frame.now, self.config.remote_timeout) {
            info!("Dropped silent remote actor {}", id);
        }

        self.ticks += 1;
    }

    fn apply_verdict(&mut self, projectile: Projectile, verdict: Verdict, now: Instant) {
        self.projectiles.remove(&projectile.id);
        self.resolved.insert(&projectile.id, now);
        let owned_locally = projectile.owner_id == self.local.id;

        match verdict {
            Verdict::Expired | Verdict::TerrainImpact => {}

            Verdict::LocalHit => {
                debug!("Hit by {} ({})", projectile.owner_id, projectile.id);
                self.damage_local(now);
            }

            Verdict::RemoteHit { target_id } => {
                debug!("Our {} hit {}", projectile.id, target_id);
                self.publish(GameMessage::Hit(HitPayload {
                    target_id,
                    attacker_id: self.local.id.clone(),
                    missile_id: Some(projectile.id),
                }));
            }

            Verdict::ChickenHit { chicken_id } => {
                let Some(points) = self.world.remove_chicken(chicken_id, now) else {
                    return;
                };
                if owned_locally {
                    self.local.add_score(points);
                    self.publish(GameMessage::ChickenHit(ChickenHitPayload {
                        chicken_id,
                        attacker_id: self.local.id.clone(),
                        missile_id: Some(projectile.id),
                    }));
                    self.publish_hp_update();
                }
            }

            Verdict::RainbowHit => {
                // A peer's shot is counted when its owner's announcement arrives
                if owned_locally {
                    let attacker = self.local.id.clone();
                    self.publish(GameMessage::HitRainbow(RainbowHitPayload {
                        attacker_id: attacker.clone(),
                        missile_id: Some(projectile.id),
                    }));
                    self.apply_rainbow_hit(&attacker, now);
                }
            }
        }
    }

    fn damage_local(&mut self, now: Instant) {
        match self.local.take_hit(now + self.config.respawn_delay) {
            HitOutcome::Ignored => return,
            HitOutcome::Damaged => debug!("Health down to {}", self.local.health),
            HitOutcome::Downed => info!("Shot down, respawning shortly"),
        }
        self.publish_hp_update();
    }

    fn apply_rainbow_hit(&mut self, attacker_id: &str, now: Instant) {
        if let RainbowOutcome::Killed { by } = self.world.hit_rainbow(attacker_id, now) {
            if by == self.local.id {
                info!("Downed the rainbow chicken");
                self.local.add_score(RAINBOW_KILL_REWARD);
                self.publish_hp_update();
            }
        }
    }

    fn resolve_dash_rams(&mut self, now: Instant) {
        let position = self.local.position;

        for chicken_id in self.world.chickens_near(position, CHICKEN_RAM_RADIUS_SQ) {
            if let Some(points) = self.world.remove_chicken(chicken_id, now) {
                self.local.add_score(points);
                self.publish(GameMessage::ChickenHit(ChickenHitPayload {
                    chicken_id,
                    attacker_id: self.local.id.clone(),
                    missile_id: None,
                }));
                self.publish_hp_update();
            }
        }

        if self.world.rainbow_near(position, RAINBOW_RAM_RADIUS_SQ) && self.world.try_ram_rainbow(now) {
            let attacker = self.local.id.clone();
            self.publish(GameMessage::HitRainbow(RainbowHitPayload {
                attacker_id: attacker.clone(),
                missile_id: None,
            }));
            self.apply_rainbow_hit(&attacker, now);
        }
    }

    fn collect_heart(&mut self, now: Instant) {
        if self.local.health >= shared::MAX_HEALTH {
            return;
        }
        let Some(index) = self.world.heart_near(self.local.position) else {
            return;
        };
        if self.world.take_heart(index, now) && self.local.heal_full() {
            info!("Picked up heart {}", index);
            self.publish_hp_update();
            self.publish(GameMessage::HeartTaken(HeartTakenPayload {
                heart_index: index,
                id: self.local.id.clone(),
            }));
        }
    }

    fn respawn_local(&mut self) {
        let position = self.find_respawn_position();
        self.local.complete_respawn(position);
        info!("Respawned at {:?}", position);

        self.publish(GameMessage::Respawn(RespawnPayload {
            id: self.local.id.clone(),
            x: position.x,
            y: position.y,
            z: position.z,
            hp: self.local.health,
        }));
        let presence = self.presence_data();
        self.outbox.push(Outbound::PresenceUpdate(presence));
    }

    /// A random spot in the air, away from live peers and clear of the ground.
    pub fn find_respawn_position(&mut self) -> Vec3 {
        let half_span = TERRAIN_SIZE * 0.4;

        for _ in 0..RESPAWN_TRIES {
            let x = self.rng.gen_range(-half_span..half_span);
            let z = self.rng.gen_range(-half_span..half_span);
            let y = self.rng.gen_range(30.0..70.0);
            let candidate = Vec3::new(x, y, z);

            let crowded = self.remotes.iter().any(|remote| {
                remote.is_targetable()
                    && remote.position.distance_squared(candidate) < RESPAWN_MIN_DISTANCE_SQ
            });
            if crowded || y < terrain_height(x, z) + RESPAWN_MIN_CLEARANCE {
                continue;
            }
            return candidate;
        }
        RESPAWN_FALLBACK
    }

    /// Applies one message published on the channel by `sender`.
    pub fn handle_message(&mut self, sender: &str, message: GameMessage, now: Instant) {
        if sender == self.local.id {
            return;
        }
        if message.claimed_actor() != sender {
            warn!(
                "Discarding {} from {} claiming to be {}",
                message.topic(),
                sender,
                message.claimed_actor()
            );
            return;
        }
        self.remotes.touch(sender, now);

        match message {
            GameMessage::State(state) => self.remotes.apply_state(&state, now),

            GameMessage::Fire(fire) => {
                if self.resolved.contains(&fire.id) {
                    debug!("Ignoring fire for already resolved {}", fire.id);
                    return;
                }
                self.projectiles.insert(Projectile::from_fire(&fire));
            }

            GameMessage::Hit(hit) => {
                let already_resolved = match &hit.missile_id {
                    Some(missile_id) => self.retire_projectile(missile_id, now),
                    None => false,
                };
                if hit.target_id != self.local.id {
                    return;
                }
                if already_resolved {
                    debug!("Ignoring hit for already resolved projectile");
                    return;
                }
                self.damage_local(now);
            }

            GameMessage::HitRainbow(hit) => {
                if let Some(missile_id) = &hit.missile_id {
                    self.retire_projectile(missile_id, now);
                }
                self.apply_rainbow_hit(&hit.attacker_id, now);
            }

            GameMessage::ChickenHit(hit) => {
                if let Some(missile_id) = &hit.missile_id {
                    self.retire_projectile(missile_id, now);
                }
                self.world.remove_chicken(hit.chicken_id, now);
            }

            GameMessage::HeartTaken(taken) => {
                self.world.take_heart(taken.heart_index, now);
            }

            GameMessage::HpUpdate(update) => self.remotes.apply_hp_update(&update, now),

            GameMessage::Respawn(respawn) => self.remotes.apply_respawn(&respawn, now),
        }
    }

    /// Drops a projectile a peer resolved. Returns true if it had already been
    /// resolved here before.
    fn retire_projectile(&mut self, missile_id: &str, now: Instant) -> bool {
        let seen = self.resolved.contains(missile_id);
        self.projectiles.remove(missile_id);
        self.resolved.insert(missile_id, now);
        seen
    }

    /// Applies a single presence change.
    pub fn handle_presence(&mut self, action: PresenceAction, member: &PresenceMember, now: Instant) {
        if member.client_id == self.local.id {
            return;
        }

        match action {
            PresenceAction::Enter | PresenceAction::Update => {
                match PresenceData::decode(&member.data) {
                    Some(presence) if presence.id == member.client_id => {
                        self.remotes.apply_presence(&presence, now);
                    }
                    _ => debug!("Ignoring unusable presence data from {}", member.client_id),
                }
            }
            PresenceAction::Leave => {
                self.remotes.remove(&member.client_id);
            }
        }
    }

    /// Full roster reconciliation against a point-in-time member list.
    /// Returns the ids that were removed.
    pub fn handle_members(&mut self, members: &[PresenceMember], now: Instant) -> Vec<String> {
        let roster: Vec<PresenceData> = members
            .iter()
            .filter_map(|member| {
                PresenceData::decode(&member.data).filter(|presence| presence.id == member.client_id)
            })
            .collect();

        self.members = roster.len().max(1);
        self.remotes.reconcile(&roster, &self.local.id, now)
    }

    /// Local actor plus every mirrored remote, best score first.
    pub fn ranking(&self) -> Vec<RankEntry> {
        let mut entries: Vec<RankEntry> = std::iter::once(RankEntry {
            id: self.local.id.clone(),
            name: self.local.name.clone(),
            score: self.local.score,
            is_local: true,
        })
        .chain(self.remotes.iter().map(|remote| RankEntry {
            id: remote.id.clone(),
            name: remote.name.clone(),
            score: remote.score,
            is_local: false,
        }))
        .collect();

        entries.sort_by(|a, b| b.score.cmp(&a.score));
        entries.truncate(RANKING_SIZE);
        entries
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        let local = ActorView {
            id: self.local.id.clone(),
            name: self.local.name.clone(),
            color: self.local.color.clone(),
            position: self.local.position,
            heading: self.local.heading,
            health: self.local.health,
            score: self.local.score,
            visible: self.local.is_alive(),
        };

        let remotes = self
            .remotes
            .iter()
            .map(|remote| ActorView {
                id: remote.id.clone(),
                name: remote.name.clone(),
                color: remote.color.clone(),
                position: remote.position,
                heading: remote.heading,
                health: remote.health,
                score: remote.score,
                visible: remote.visible,
            })
            .collect();

        let projectiles = self
            .projectiles
            .iter()
            .map(|p| ProjectileView {
                position: p.position,
                direction: p.direction,
                owned: p.owner_id == self.local.id,
            })
            .collect();

        let mut entities: Vec<EntityView> = self
            .world
            .chickens
            .iter()
            .filter(|c| c.is_present())
            .map(|c| EntityView {
                kind: if c.gold {
                    EntityKind::GoldChicken
                } else {
                    EntityKind::Chicken
                },
                position: c.position,
            })
            .collect();
        if self.world.rainbow.is_present() {
            entities.push(EntityView {
                kind: EntityKind::Rainbow,
                position: self.world.rainbow.position,
            });
        }
        entities.extend(
            self.world
                .hearts
                .iter()
                .filter(|h| h.is_present())
                .map(|h| EntityView {
                    kind: EntityKind::Heart,
                    position: h.position,
                }),
        );

        RenderSnapshot {
            local,
            remotes,
            projectiles,
            entities,
            ranking: self.ranking(),
            members: self.members,
            online: self.online,
            notice: self.notice.clone(),
            dash_level: self.local.dash.level(),
            dashing: self.local.dash.is_active(),
        }
    }

    #[cfg(test)]
    pub(crate) fn local_mut(&mut self) -> &mut LocalActor {
        &mut self.local
    }

    #[cfg(test)]
    pub(crate) fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::FirePayload;
    use shared::MAX_HEALTH;

    const T0: f64 = 1_700_000_000_000.0;
    const LOCAL: &str = "player_local0001";

    fn session() -> GameSession {
        let identity = Identity {
            id: LOCAL.to_string(),
            name: "Local".to_string(),
            color: "#ffff66".to_string(),
        };
        let mut session = GameSession::with_rng(
            identity,
            "test-room",
            SessionConfig::default(),
            T0,
            StdRng::seed_from_u64(99),
        );
        park_world(&mut session);
        session.local_mut().position = Vec3::new(0.0, 100.0, 0.0);
        session
    }

    /// Moves every world entity out of the way and keeps it there.
    fn park_world(session: &mut GameSession) {
        let world = session.world_mut();
        for chicken in &mut world.chickens {
            chicken.orbit.base_x = -450.0;
            chicken.orbit.base_z = -450.0;
            chicken.orbit.radius = 0.0;
            chicken.orbit.height = 140.0;
            chicken.position = Vec3::new(-450.0, 140.0, -450.0);
        }
        world.rainbow.orbit.base_x = 450.0;
        world.rainbow.orbit.base_z = 450.0;
        world.rainbow.orbit.radius = 0.0;
        world.rainbow.orbit.height = 140.0;
        world.rainbow.position = Vec3::new(450.0, 140.0, 450.0);
        for heart in &mut world.hearts {
            heart.position = Vec3::new(-450.0, 140.0, 450.0);
        }
    }

    fn frame(now: Instant) -> Frame {
        Frame {
            now,
            wall_ms: T0,
            dt: 1.0 / 60.0,
        }
    }

    fn hit(target: &str, attacker: &str, missile: Option<&str>) -> GameMessage {
        GameMessage::Hit(HitPayload {
            target_id: target.to_string(),
            attacker_id: attacker.to_string(),
            missile_id: missile.map(str::to_string),
        })
    }

    fn fire(id: &str, owner: &str, at: Vec3, dir: Vec3) -> GameMessage {
        GameMessage::Fire(FirePayload {
            id: id.to_string(),
            owner: owner.to_string(),
            x: at.x,
            y: at.y,
            z: at.z,
            dx: dir.x,
            dy: dir.y,
            dz: dir.z,
        })
    }

    fn state(id: &str, at: Vec3) -> GameMessage {
        GameMessage::State(StatePayload {
            id: id.to_string(),
            x: at.x,
            y: at.y,
            z: at.z,
            ry: 0.0,
        })
    }

    fn member(id: &str, hp: i32, score: u32) -> PresenceMember {
        let data = PresenceData {
            id: id.to_string(),
            name: id.to_uppercase(),
            color: "#00ff00".to_string(),
            score,
            hp,
        };
        PresenceMember {
            client_id: id.to_string(),
            data: data.encode().unwrap(),
        }
    }

    fn published(outbox: &[Outbound]) -> Vec<&GameMessage> {
        outbox
            .iter()
            .filter_map(|o| match o {
                Outbound::Publish(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_repeated_hits_are_not_deduplicated_by_content() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message("p2", hit(LOCAL, "p2", None), now);
        assert_eq!(s.local().health, 4);

        s.handle_message("p2", hit(LOCAL, "p2", None), now);
        assert_eq!(s.local().health, 3);

        let out = s.drain_outbox();
        let updates: Vec<_> = published(&out)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::HpUpdate(u) => Some(u.hp),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![4, 3]);
    }

    #[test]
    fn test_duplicate_fire_creates_one_projectile() {
        let mut s = session();
        let now = Instant::now();
        let message = fire("m1", "p2", Vec3::new(0.0, 120.0, 200.0), Vec3::new(0.0, 0.0, 1.0));

        s.handle_message("p2", message.clone(), now);
        s.handle_message("p2", message, now);

        assert_eq!(s.projectiles().len(), 1);
        assert!(s.projectiles().contains("m1"));
    }

    #[test]
    fn test_respawn_then_stale_hp_update_overwrites() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message(
            "p2",
            GameMessage::Respawn(RespawnPayload {
                id: "p2".to_string(),
                x: 10.0,
                y: 20.0,
                z: 10.0,
                hp: 5,
            }),
            now,
        );
        s.handle_message(
            "p2",
            GameMessage::HpUpdate(HpUpdatePayload {
                id: "p2".to_string(),
                hp: 2,
                score: 7,
            }),
            now,
        );

        let p2 = s.remotes().get("p2").unwrap();
        assert_eq!(p2.health, 2);
        assert_eq!(p2.score, 7);
        assert_eq!(p2.position, Vec3::new(10.0, 20.0, 10.0));
    }

    #[test]
    fn test_last_overwrite_wins_in_any_order() {
        let updates = [(3, 1), (0, 4), (5, 2), (1, 9)];
        let mut s = session();
        let now = Instant::now();

        for (hp, score) in updates.iter().rev() {
            s.handle_message(
                "p2",
                GameMessage::HpUpdate(HpUpdatePayload {
                    id: "p2".to_string(),
                    hp: *hp,
                    score: *score,
                }),
                now,
            );
        }
        let p2 = s.remotes().get("p2").unwrap();
        assert_eq!((p2.health, p2.score), (3, 1));
    }

    #[test]
    fn test_reconcile_removes_departed_member() {
        let mut s = session();
        let now = Instant::now();
        s.handle_members(&[member(LOCAL, 5, 0), member("p2", 5, 0), member("p3", 5, 0)], now);
        assert!(s.remotes().contains("p3"));

        let removed = s.handle_members(&[member(LOCAL, 5, 0), member("p2", 5, 0)], now);
        assert_eq!(removed, vec!["p3".to_string()]);

        let ids: Vec<&str> = s.remotes().ids().collect();
        assert_eq!(ids, vec!["p2"]);
        assert_eq!(s.snapshot().members, 2);
    }

    #[test]
    fn test_roster_rejects_mismatched_member_data() {
        let mut s = session();
        let now = Instant::now();
        let mut spoofed = member("p2", 5, 0);
        spoofed.client_id = "p9".to_string();

        s.handle_members(&[spoofed], now);
        assert!(s.remotes().is_empty());
    }

    #[test]
    fn test_state_never_changes_local_health() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message("p2", state("p2", Vec3::new(5.0, 100.0, 5.0)), now);
        s.handle_message(LOCAL, hit(LOCAL, LOCAL, None), now);
        s.handle_message("p2", hit("p3", "p2", None), now);
        s.handle_message(
            "p2",
            GameMessage::HpUpdate(HpUpdatePayload {
                id: LOCAL.to_string(),
                hp: 0,
                score: 0,
            }),
            now,
        );

        assert_eq!(s.local().health, MAX_HEALTH);
    }

    #[test]
    fn test_foreign_claims_are_discarded() {
        let mut s = session();
        let now = Instant::now();

        // p3 trying to move p2 around, and to hit us in p2's name
        s.handle_message("p3", state("p2", Vec3::new(5.0, 100.0, 5.0)), now);
        s.handle_message("p3", hit(LOCAL, "p2", None), now);

        assert!(!s.remotes().contains("p2"));
        assert_eq!(s.local().health, MAX_HEALTH);
    }

    #[test]
    fn test_own_fire_echo_is_ignored() {
        let mut s = session();
        let now = Instant::now();
        let id = s.fire(1_000).unwrap();

        let out = s.drain_outbox();
        let echo = published(&out)[0].clone();
        s.handle_message(LOCAL, echo, now);

        assert_eq!(s.projectiles().len(), 1);
        assert!(s.projectiles().contains(&id));
    }

    #[test]
    fn test_fire_announcement_keeps_projectile_id() {
        let mut s = session();
        let id = s.fire(1_234).unwrap();
        assert!(id.starts_with(&format!("m_{}_1234_", LOCAL)));

        let out = s.drain_outbox();
        match published(&out).as_slice() {
            [GameMessage::Fire(fire)] => {
                assert_eq!(fire.id, id);
                assert_eq!(fire.owner, LOCAL);
            }
            other => panic!("Unexpected outbox: {:?}", other),
        }
    }

    #[test]
    fn test_owner_declares_remote_hit_once() {
        let mut s = session();
        let now = Instant::now();
        let target = Vec3::new(0.0, 100.0, 3.0);
        s.handle_message("p2", state("p2", target), now);

        let id = s.fire(1).unwrap();
        s.drain_outbox();

        for i in 0..10 {
            s.tick(frame(now + Duration::from_millis(16 * i)));
        }

        let out = s.drain_outbox();
        let hits: Vec<_> = published(&out)
            .into_iter()
            .filter_map(|m| match m {
                GameMessage::Hit(h) => Some(h.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].target_id, "p2");
        assert_eq!(hits[0].attacker_id, LOCAL);
        assert_eq!(hits[0].missile_id.as_deref(), Some(id.as_str()));
        assert!(!s.projectiles().contains(&id));

        // Owner does not change the target's mirrored health itself
        assert_eq!(s.remotes().get("p2").unwrap().health, MAX_HEALTH);
    }

    #[test]
    fn test_peer_projectile_damages_local_actor() {
        let mut s = session();
        let now = Instant::now();
        let here = s.local().position;

        s.handle_message(
            "p2",
            fire("m_p2", "p2", here + Vec3::new(0.0, 0.0, -3.0), Vec3::new(0.0, 0.0, 1.0)),
            now,
        );
        s.tick(frame(now));

        assert_eq!(s.local().health, MAX_HEALTH - 1);
        assert!(!s.projectiles().contains("m_p2"));

        // The owner's own announcement for the same shot is not applied twice
        s.handle_message("p2", hit(LOCAL, "p2", Some("m_p2")), now);
        assert_eq!(s.local().health, MAX_HEALTH - 1);
    }

    #[test]
    fn test_hit_before_local_detection_retires_projectile() {
        let mut s = session();
        let now = Instant::now();
        let here = s.local().position;

        s.handle_message(
            "p2",
            fire("m_p2", "p2", here + Vec3::new(0.0, 0.0, -3.0), Vec3::new(0.0, 0.0, 1.0)),
            now,
        );
        s.handle_message("p2", hit(LOCAL, "p2", Some("m_p2")), now);
        assert_eq!(s.local().health, MAX_HEALTH - 1);
        assert!(!s.projectiles().contains("m_p2"));

        s.tick(frame(now));
        assert_eq!(s.local().health, MAX_HEALTH - 1);

        // A late duplicate fire does not resurrect it
        s.handle_message(
            "p2",
            fire("m_p2", "p2", here + Vec3::new(0.0, 0.0, -3.0), Vec3::new(0.0, 0.0, 1.0)),
            now,
        );
        assert!(!s.projectiles().contains("m_p2"));
    }

    #[test]
    fn test_late_duplicate_hit_after_heavy_fire() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message("p2", hit(LOCAL, "p2", Some("m_first")), now);
        assert_eq!(s.local().health, MAX_HEALTH - 1);

        // A busy sky resolves many other shots in between
        for i in 0..1000u64 {
            let missile = format!("m_p2_{}", i);
            s.handle_message(
                "p2",
                hit("p3", "p2", Some(&missile)),
                now + Duration::from_millis(i),
            );
        }
        s.tick(frame(now + Duration::from_secs(2)));

        s.handle_message("p2", hit(LOCAL, "p2", Some("m_first")), now + Duration::from_secs(5));
        assert_eq!(s.local().health, MAX_HEALTH - 1);
    }

    #[test]
    fn test_downed_then_respawn() {
        let mut s = session();
        let now = Instant::now();
        s.local_mut().health = 1;

        s.handle_message("p2", hit(LOCAL, "p2", None), now);
        assert!(!s.local().is_alive());
        s.drain_outbox();

        s.queue_state();
        assert!(s.drain_outbox().is_empty());
        assert_eq!(s.fire(5), None);

        s.tick(frame(now + Duration::from_secs(1)));
        assert!(!s.local().is_alive());

        s.tick(frame(now + Duration::from_secs(3)));
        assert!(s.local().is_alive());
        assert_eq!(s.local().health, MAX_HEALTH);

        let out = s.drain_outbox();
        let respawn = published(&out).into_iter().find_map(|m| match m {
            GameMessage::Respawn(r) => Some(r.clone()),
            _ => None,
        });
        let respawn = respawn.expect("respawn announced");
        assert_eq!(respawn.hp, MAX_HEALTH);
        assert_eq!(Vec3::new(respawn.x, respawn.y, respawn.z), s.local().position);
    }

    #[test]
    fn test_respawn_position_keeps_distance() {
        let mut s = session();
        let now = Instant::now();
        for i in 0..5 {
            let at = Vec3::new(i as f32 * 100.0 - 200.0, 50.0, 0.0);
            s.handle_message(&format!("p{}", i), state(&format!("p{}", i), at), now);
        }

        for _ in 0..20 {
            let spot = s.find_respawn_position();
            if spot == RESPAWN_FALLBACK {
                continue;
            }
            assert!(spot.y >= terrain_height(spot.x, spot.z) + RESPAWN_MIN_CLEARANCE);
            for remote in s.remotes().iter() {
                assert!(remote.position.distance_squared(spot) >= RESPAWN_MIN_DISTANCE_SQ);
            }
        }
    }

    #[test]
    fn test_own_projectile_scores_chicken() {
        let mut s = session();
        let now = Instant::now();
        let ahead = s.local().muzzle() + s.local().forward() * 4.0;
        {
            let chicken = &mut s.world_mut().chickens[0];
            chicken.orbit.base_x = ahead.x;
            chicken.orbit.base_z = ahead.z;
            chicken.orbit.height = ahead.y;
            chicken.orbit.speed = 0.0;
            chicken.orbit.phase = 0.0;
        }
        // Bobbing with phase 0 at this timestamp stays within the hit radius
        s.world_mut().chickens[0].position = ahead;

        let id = s.fire(1).unwrap();
        s.drain_outbox();
        for i in 0..3 {
            s.tick(Frame {
                now: now + Duration::from_millis(16 * i),
                wall_ms: 0.0,
                dt: 1.0 / 60.0,
            });
        }

        assert_eq!(s.local().score, 2);
        assert!(!s.world().chicken(0).unwrap().is_present());
        let out = s.drain_outbox();
        let chicken_hit = published(&out).into_iter().find_map(|m| match m {
            GameMessage::ChickenHit(c) => Some(c.clone()),
            _ => None,
        });
        let chicken_hit = chicken_hit.expect("chicken hit announced");
        assert_eq!(chicken_hit.chicken_id, 0);
        assert_eq!(chicken_hit.missile_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_peer_chicken_hit_removes_without_credit() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message(
            "p2",
            fire("m_p2", "p2", Vec3::new(200.0, 120.0, 200.0), Vec3::new(0.0, 0.0, 1.0)),
            now,
        );
        s.handle_message(
            "p2",
            GameMessage::ChickenHit(ChickenHitPayload {
                chicken_id: 4,
                attacker_id: "p2".to_string(),
                missile_id: Some("m_p2".to_string()),
            }),
            now,
        );

        assert!(!s.world().chicken(4).unwrap().is_present());
        assert!(!s.projectiles().contains("m_p2"));
        assert_eq!(s.local().score, 0);
    }

    #[test]
    fn test_rainbow_kill_credits_only_killer() {
        let mut s = session();
        let now = Instant::now();

        s.handle_message(
            "p2",
            GameMessage::HitRainbow(RainbowHitPayload {
                attacker_id: "p2".to_string(),
                missile_id: None,
            }),
            now,
        );
        assert_eq!(s.world().rainbow.hp, 1);

        s.handle_message(
            "p2",
            GameMessage::HitRainbow(RainbowHitPayload {
                attacker_id: "p2".to_string(),
                missile_id: None,
            }),
            now,
        );
        assert!(!s.world().rainbow.is_present());
        assert_eq!(s.local().score, 0);
    }

    #[test]
    fn test_dash_ram_rainbow_kill_rewards_local() {
        let mut s = session();
        let now = Instant::now();
        let here = s.local().position;
        {
            let world = s.world_mut();
            world.rainbow.orbit.base_x = here.x;
            world.rainbow.orbit.base_z = here.z;
            world.rainbow.orbit.height = here.y;
            world.rainbow.orbit.speed = 0.0;
            world.rainbow.orbit.phase = 0.0;
            world.rainbow.hp = 1;
        }
        assert!(s.start_dash());
        s.tick(Frame {
            now,
            wall_ms: 0.0,
            dt: 0.0,
        });

        assert_eq!(s.local().score, RAINBOW_KILL_REWARD);
        assert!(!s.world().rainbow.is_present());
    }

    #[test]
    fn test_heart_heals_and_announces() {
        let mut s = session();
        let now = Instant::now();
        let here = s.local().position;
        s.world_mut().hearts[1].position = here;
        s.local_mut().health = 2;

        s.tick(Frame {
            now,
            wall_ms: T0,
            dt: 0.0,
        });

        assert_eq!(s.local().health, MAX_HEALTH);
        assert!(!s.world().hearts[1].is_present());
        let out = s.drain_outbox();
        let messages = published(&out);
        assert!(messages.iter().any(|m| matches!(m, GameMessage::HpUpdate(u) if u.hp == MAX_HEALTH)));
        assert!(messages
            .iter()
            .any(|m| matches!(m, GameMessage::HeartTaken(t) if t.heart_index == 1)));
        assert!(out.iter().any(|o| matches!(o, Outbound::PresenceUpdate(p) if p.hp == MAX_HEALTH)));
    }

    #[test]
    fn test_presence_events() {
        let mut s = session();
        let now = Instant::now();

        s.handle_presence(PresenceAction::Enter, &member("p2", 4, 6), now);
        let p2 = s.remotes().get("p2").unwrap();
        assert_eq!(p2.name, "P2");
        assert_eq!((p2.health, p2.score), (4, 6));

        s.handle_presence(PresenceAction::Enter, &member(LOCAL, 5, 0), now);
        assert!(!s.remotes().contains(LOCAL));

        s.handle_presence(PresenceAction::Leave, &member("p2", 4, 6), now);
        assert!(s.remotes().is_empty());
    }

    #[test]
    fn test_silent_remote_expires() {
        let mut s = session();
        let now = Instant::now();
        s.handle_message("p2", state("p2", Vec3::new(100.0, 100.0, 100.0)), now);

        s.tick(frame(now + Duration::from_secs(10)));
        assert!(s.remotes().contains("p2"));

        s.tick(frame(now + Duration::from_secs(16)));
        assert!(!s.remotes().contains("p2"));
    }

    #[test]
    fn test_ranking_top_three() {
        let mut s = session();
        let now = Instant::now();
        for (id, score) in [("p2", 3), ("p3", 10), ("p4", 1)] {
            s.handle_message(
                id,
                GameMessage::HpUpdate(HpUpdatePayload {
                    id: id.to_string(),
                    hp: 5,
                    score,
                }),
                now,
            );
        }
        s.local_mut().add_score(4);

        let ranking = s.ranking();
        let ids: Vec<&str> = ranking.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["p3", LOCAL, "p2"]);
        assert!(ranking[1].is_local);
    }

    #[test]
    fn test_state_broadcast_excludes_health() {
        let mut s = session();
        s.queue_state();
        let out = s.drain_outbox();
        match published(&out).as_slice() {
            [GameMessage::State(state)] => {
                assert_eq!(state.id, LOCAL);
                let json = String::from_utf8(GameMessage::State(state.clone()).encode().unwrap()).unwrap();
                assert!(!json.contains("hp"));
                assert!(!json.contains("score"));
            }
            other => panic!("Unexpected outbox: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_contents() {
        let mut s = session();
        let now = Instant::now();
        s.set_online(true);
        s.set_notice("hello");
        s.handle_message("p2", state("p2", Vec3::new(100.0, 100.0, 100.0)), now);
        s.fire(1);

        let snapshot = s.snapshot();
        assert!(snapshot.online);
        assert_eq!(snapshot.notice.as_deref(), Some("hello"));
        assert_eq!(snapshot.local.id, LOCAL);
        assert_eq!(snapshot.remotes.len(), 1);
        assert_eq!(snapshot.projectiles.len(), 1);
        assert!(snapshot.projectiles[0].owned);
        assert_eq!(
            snapshot
                .entities
                .iter()
                .filter(|e| e.kind == EntityKind::GoldChicken)
                .count(),
            1
        );
    }
}
