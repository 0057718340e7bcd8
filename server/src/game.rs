//! The authoritative simulation engine.
//!
//! [`GameWorld`] owns the entity registries and advances the world one tick at
//! a time. The driver in `network` holds the world behind a single mutex, so a
//! tick never interleaves with event application or another tick. Within a
//! tick the two collision scans only read shared state and write to local
//! accumulators; outcome application is serialized afterwards.

use crate::collision::{circles_overlap, point_in_bounds, SpatialGrid};
use crate::entities::{
    clamp_to_play_field, score_for_radius, spawn_point, Asteroid, Player, Projectile,
};
use crate::registry::Registry;
use log::{debug, info};
use rand::Rng;
use shared::{
    now_ms, Vec2, WorldSnapshot, ASTEROID_CAP, ASTEROID_GC_MARGIN, ASTEROID_MAX_DRIFT_SPEED,
    ASTEROID_MAX_FALL_SPEED, ASTEROID_MAX_RADIUS, ASTEROID_MIN_FALL_SPEED, ASTEROID_MIN_RADIUS,
    ASTEROID_ROTATION_RATE, ASTEROID_SPAWN_INTERVAL_TICKS, BULLET_GC_MARGIN, PLAYER_HIT_RADIUS,
    WORLD_HEIGHT, WORLD_WIDTH,
};
use std::collections::HashSet;
use std::f32::consts::TAU;

/// Broad-phase cell size, roughly one large asteroid diameter.
const GRID_CELL_SIZE: f32 = 64.0;

/// Typed events handed from the session layer to the engine.
#[derive(Debug, Clone)]
pub enum GameEvent {
    PlayerJoined { player_id: u32 },
    PlayerLeft { player_id: u32 },
    Movement { player_id: u32, position: Vec2 },
    Fire { player_id: u32, position: Vec2, velocity: Vec2 },
}

/// One projectile-asteroid overlap found by the projectile scan.
struct ProjectileHit {
    projectile_id: u64,
    asteroid_id: u64,
    owner: u32,
}

pub struct GameWorld {
    players: Registry<u32, Player>,
    asteroids: Registry<u64, Asteroid>,
    projectiles: Registry<u64, Projectile>,
    grid: SpatialGrid,
    next_entity_id: u64,
    frame_count: u64,
    ticks_since_spawn: u64,
    any_player_joined: bool,
    game_over_logged: bool,
}

impl GameWorld {
    pub fn new() -> Self {
        Self {
            players: Registry::new(),
            asteroids: Registry::new(),
            projectiles: Registry::new(),
            grid: SpatialGrid::new(GRID_CELL_SIZE),
            next_entity_id: 0,
            frame_count: 0,
            ticks_since_spawn: 0,
            any_player_joined: false,
            game_over_logged: false,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_entity_id += 1;
        self.next_entity_id
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn asteroid_count(&self) -> usize {
        self.asteroids.len()
    }

    pub fn projectile_count(&self) -> usize {
        self.projectiles.len()
    }

    pub fn player(&self, id: u32) -> Option<Player> {
        self.players.get(id).map(|p| p.clone())
    }

    pub fn asteroids(&self) -> Vec<Asteroid> {
        self.asteroids.snapshot()
    }

    pub fn projectiles(&self) -> Vec<Projectile> {
        self.projectiles.snapshot()
    }

    /// Places an asteroid directly, bypassing the spawn timer. Used by the
    /// interval spawner and by scenario setup.
    pub fn spawn_asteroid_at(&mut self, position: Vec2, velocity: Vec2, radius: f32) -> u64 {
        let id = self.alloc_id();
        self.asteroids
            .insert(id, Asteroid::new(id, position, velocity, radius));
        id
    }

    /// Applies one inbound event. Invalid events (unknown player, cooldown
    /// still running, inactive player) are dropped here; that is the only
    /// silent drop the pipeline allows.
    pub fn apply_event(&mut self, event: GameEvent) {
        match event {
            GameEvent::PlayerJoined { player_id } => {
                self.players.insert(player_id, Player::new(player_id));
                self.any_player_joined = true;
                info!("Player {} joined at {:?}", player_id, spawn_point());
            }
            GameEvent::PlayerLeft { player_id } => {
                if self.players.remove(player_id).is_some() {
                    info!("Player {} removed", player_id);
                }
            }
            GameEvent::Movement {
                player_id,
                position,
            } => {
                // Server-side clamp regardless of what the client reported.
                self.players.update(player_id, |player| {
                    if player.active {
                        player.position = clamp_to_play_field(position);
                    }
                });
            }
            GameEvent::Fire {
                player_id,
                position,
                velocity,
            } => {
                let now = now_ms();
                let accepted = self
                    .players
                    .update(player_id, |player| {
                        if player.can_fire(now) {
                            player.last_shot_ms = now;
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);

                if accepted {
                    let id = self.alloc_id();
                    self.projectiles
                        .insert(id, Projectile::new(id, player_id, position, velocity, now));
                }
            }
        }
    }

    /// Advances the world one step and returns the snapshot for broadcast.
    pub fn tick(&mut self, dt: f32) -> WorldSnapshot {
        let now = now_ms();

        self.advance_kinematics(dt);
        self.rebuild_grid();

        // The two scans are independent: they read shared entity state and
        // write disjoint accumulators, so they could run concurrently. Both
        // finish before any outcome is applied.
        let projectile_hits = self.scan_projectile_hits();
        let player_hits = self.scan_player_hits(now);

        self.apply_projectile_hits(projectile_hits);
        self.apply_player_hits(player_hits, now);

        self.collect_garbage(now);
        self.maybe_spawn_asteroid();
        self.check_game_over();

        self.frame_count += 1;
        self.build_snapshot()
    }

    fn advance_kinematics(&mut self, dt: f32) {
        self.asteroids.for_each_mut(|asteroid| {
            asteroid.position = asteroid.position.add(&asteroid.velocity.scale(dt));
            asteroid.rotation = (asteroid.rotation + ASTEROID_ROTATION_RATE * dt) % TAU;

            // Screen-edge wrap on the horizontal axis only.
            if asteroid.position.x < -asteroid.radius {
                asteroid.position.x = WORLD_WIDTH + asteroid.radius;
            } else if asteroid.position.x > WORLD_WIDTH + asteroid.radius {
                asteroid.position.x = -asteroid.radius;
            }
        });

        self.projectiles.for_each_mut(|projectile| {
            projectile.position = projectile.position.add(&projectile.velocity.scale(dt));
        });
    }

    fn rebuild_grid(&mut self) {
        self.grid.clear();
        for asteroid in self.asteroids.snapshot() {
            self.grid
                .insert(asteroid.id, asteroid.position, asteroid.radius);
        }
    }

    /// First overlapping projectile claims the asteroid; later pairs in the
    /// same tick are skipped so each asteroid dies at most once and each
    /// projectile consumes at most one target.
    fn scan_projectile_hits(&self) -> Vec<ProjectileHit> {
        let mut hits = Vec::new();
        let mut claimed_asteroids: HashSet<u64> = HashSet::new();

        for projectile in self.projectiles.snapshot() {
            if projectile.consumed {
                continue;
            }
            for asteroid_id in self
                .grid
                .query_circle(projectile.position, projectile.radius)
            {
                if claimed_asteroids.contains(&asteroid_id) {
                    continue;
                }
                let Some(asteroid) = self.asteroids.get(asteroid_id) else {
                    continue;
                };
                if circles_overlap(
                    projectile.position,
                    projectile.radius,
                    asteroid.position,
                    asteroid.radius,
                ) {
                    claimed_asteroids.insert(asteroid_id);
                    hits.push(ProjectileHit {
                        projectile_id: projectile.id,
                        asteroid_id,
                        owner: projectile.owner,
                    });
                    break;
                }
            }
        }

        hits
    }

    /// Each active, vulnerable player is resolved at most once per tick.
    fn scan_player_hits(&self, now: u64) -> Vec<u32> {
        let mut hit_players = Vec::new();

        for player in self.players.snapshot() {
            if !player.active || player.is_invulnerable(now) {
                continue;
            }
            let struck = self
                .grid
                .query_circle(player.position, PLAYER_HIT_RADIUS)
                .into_iter()
                .any(|asteroid_id| {
                    self.asteroids.get(asteroid_id).is_some_and(|asteroid| {
                        circles_overlap(
                            player.position,
                            PLAYER_HIT_RADIUS,
                            asteroid.position,
                            asteroid.radius,
                        )
                    })
                });
            if struck {
                hit_players.push(player.id);
            }
        }

        hit_players
    }

    fn apply_projectile_hits(&mut self, hits: Vec<ProjectileHit>) {
        for hit in hits {
            // The consumed flag flips exactly once; a projectile that already
            // destroyed something this tick does not destroy again.
            let consumed = self
                .projectiles
                .update(hit.projectile_id, |p| p.consume())
                .unwrap_or(false);
            if !consumed {
                continue;
            }
            self.projectiles.remove(hit.projectile_id);

            let Some(asteroid) = self.asteroids.remove(hit.asteroid_id) else {
                continue;
            };

            let points = score_for_radius(asteroid.radius);
            self.players.update(hit.owner, |player| player.score += points);
            debug!(
                "Asteroid {} (r={:.1}) destroyed by player {} for {} points",
                asteroid.id, asteroid.radius, hit.owner, points
            );

            let mut rng = rand::thread_rng();
            let mut next_id = || {
                self.next_entity_id += 1;
                self.next_entity_id
            };
            for child in asteroid.fragment(&mut rng, &mut next_id) {
                self.asteroids.insert(child.id, child);
            }
        }
    }

    fn apply_player_hits(&mut self, hit_players: Vec<u32>, now: u64) {
        for player_id in hit_players {
            self.players.update(player_id, |player| {
                if !player.active {
                    return;
                }
                player.lives = player.lives.saturating_sub(1);
                player.last_damage_ms = now;
                if player.lives == 0 {
                    player.active = false;
                    info!("Player {} eliminated", player_id);
                } else {
                    player.position = spawn_point();
                    info!(
                        "Player {} hit, {} lives left, respawned",
                        player_id, player.lives
                    );
                }
            });
        }
    }

    fn collect_garbage(&mut self, now: u64) {
        self.projectiles.retain(|_, projectile| {
            !projectile.consumed
                && !projectile.is_expired(now)
                && point_in_bounds(
                    projectile.position,
                    WORLD_WIDTH,
                    WORLD_HEIGHT,
                    BULLET_GC_MARGIN,
                )
        });

        // Asteroids wrap horizontally; only falling off the bottom removes
        // them.
        self.asteroids
            .retain(|_, asteroid| asteroid.position.y <= WORLD_HEIGHT + ASTEROID_GC_MARGIN);
    }

    fn maybe_spawn_asteroid(&mut self) {
        self.ticks_since_spawn += 1;
        if self.ticks_since_spawn < ASTEROID_SPAWN_INTERVAL_TICKS {
            return;
        }
        self.ticks_since_spawn = 0;

        if self.asteroids.len() >= ASTEROID_CAP {
            return;
        }

        let mut rng = rand::thread_rng();
        let radius = rng.gen_range(ASTEROID_MIN_RADIUS..=ASTEROID_MAX_RADIUS);
        let position = Vec2::new(rng.gen_range(0.0..WORLD_WIDTH), -radius);
        let velocity = Vec2::new(
            rng.gen_range(-ASTEROID_MAX_DRIFT_SPEED..=ASTEROID_MAX_DRIFT_SPEED),
            rng.gen_range(ASTEROID_MIN_FALL_SPEED..=ASTEROID_MAX_FALL_SPEED),
        );

        let id = self.spawn_asteroid_at(position, velocity, radius);
        debug!("Spawned asteroid {} (r={:.1}) at {:?}", id, radius, position);
    }

    /// All joined players eliminated is observed and logged, never a terminal
    /// transition: the simulation keeps running so players can reconnect.
    fn check_game_over(&mut self) {
        if self.is_game_active() {
            self.game_over_logged = false;
        } else if !self.game_over_logged {
            info!("No active players remain; simulation continues");
            self.game_over_logged = true;
        }
    }

    fn is_game_active(&self) -> bool {
        !self.any_player_joined || self.players.snapshot().iter().any(|p| p.active)
    }

    fn build_snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            jogadores: self
                .players
                .snapshot()
                .iter()
                .filter(|p| p.active)
                .map(Player::to_wire)
                .collect(),
            asteroides: self
                .asteroids
                .snapshot()
                .iter()
                .map(Asteroid::to_wire)
                .collect(),
            tiros: self
                .projectiles
                .snapshot()
                .iter()
                .map(Projectile::to_wire)
                .collect(),
            frame_count: self.frame_count,
            jogo_ativo: self.is_game_active(),
        }
    }
}

impl Default for GameWorld {
    fn default() -> Self {
        Self::new()
    }
}
