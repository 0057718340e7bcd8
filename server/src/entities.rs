//! Entity state and the rules that are local to a single entity: fire
//! cooldown, invulnerability windows, projectile normalization, asteroid
//! fragmentation, and the size-tier scoring table.

use rand::Rng;
use shared::{
    AsteroidWire, PlayerWire, ProjectileWire, Vec2, BULLET_MAX_AGE_MS, BULLET_RADIUS, BULLET_SPEED,
    DAMAGE_INVULN_MS, FIRE_COOLDOWN_MS, FRAGMENT_MIN_RADIUS, FRAGMENT_RADIUS_FACTOR,
    LARGE_TIER_RADIUS, MAX_GENERATION, MEDIUM_TIER_RADIUS, PLAYER_HIT_RADIUS, PLAYER_MAX_LIVES,
    PLAYER_START_LIVES, WORLD_HEIGHT, WORLD_WIDTH,
};

/// Maximum angular dispersion of a fragment's velocity, radians either way.
const FRAGMENT_SPREAD: f32 = 0.8;

/// Where players appear on join and respawn.
pub fn spawn_point() -> Vec2 {
    Vec2::new(WORLD_WIDTH / 2.0, WORLD_HEIGHT - 60.0)
}

/// Clamps a position so the player's hit circle stays inside the play field.
pub fn clamp_to_play_field(p: Vec2) -> Vec2 {
    Vec2::new(
        p.x.clamp(PLAYER_HIT_RADIUS, WORLD_WIDTH - PLAYER_HIT_RADIUS),
        p.y.clamp(PLAYER_HIT_RADIUS, WORLD_HEIGHT - PLAYER_HIT_RADIUS),
    )
}

/// Points awarded for destroying an asteroid of the given radius.
///
/// Smaller targets pay more: large 20, medium 50, small 100. This inverted
/// table is the canonical scoring policy.
pub fn score_for_radius(radius: f32) -> u32 {
    if radius >= LARGE_TIER_RADIUS {
        20
    } else if radius >= MEDIUM_TIER_RADIUS {
        50
    } else {
        100
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: u32,
    pub position: Vec2,
    pub score: u32,
    pub lives: u32,
    pub active: bool,
    /// Epoch ms of the last accepted shot, 0 before the first.
    pub last_shot_ms: u64,
    /// Epoch ms of the last hit taken, 0 before the first.
    pub last_damage_ms: u64,
}

impl Player {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            position: spawn_point(),
            score: 0,
            lives: PLAYER_START_LIVES,
            active: true,
            last_shot_ms: 0,
            last_damage_ms: 0,
        }
    }

    /// Whether the fire cooldown has elapsed. Inactive players never fire.
    pub fn can_fire(&self, now_ms: u64) -> bool {
        self.active && now_ms.saturating_sub(self.last_shot_ms) >= FIRE_COOLDOWN_MS
    }

    /// Whether the post-damage grace window is still open.
    pub fn is_invulnerable(&self, now_ms: u64) -> bool {
        self.last_damage_ms != 0 && now_ms.saturating_sub(self.last_damage_ms) < DAMAGE_INVULN_MS
    }

    /// Adds one life, never exceeding the cap.
    pub fn grant_life(&mut self) {
        self.lives = (self.lives + 1).min(PLAYER_MAX_LIVES);
    }

    pub fn to_wire(&self) -> PlayerWire {
        PlayerWire {
            id: self.id,
            posicao: self.position,
            pontuacao: self.score,
            vidas: self.lives,
            ativo: self.active,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Asteroid {
    pub id: u64,
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    /// Visual spin angle in radians, wraps at 2π.
    pub rotation: f32,
    /// 1 for spawned asteroids, incremented per fragmentation.
    pub generation: u8,
}

impl Asteroid {
    pub fn new(id: u64, position: Vec2, velocity: Vec2, radius: f32) -> Self {
        Self {
            id,
            position,
            velocity,
            radius,
            rotation: 0.0,
            generation: 1,
        }
    }

    /// Only asteroids below the generation cap and above the minimum radius
    /// break apart when destroyed.
    pub fn can_fragment(&self) -> bool {
        self.generation < MAX_GENERATION && self.radius >= FRAGMENT_MIN_RADIUS
    }

    /// Breaks the asteroid into 2 or 3 children with smaller radii, the
    /// parent's velocity fanned out by a random angle, and generation + 1.
    ///
    /// Returns an empty vec when the asteroid may not fragment.
    pub fn fragment<R: Rng>(&self, rng: &mut R, mut next_id: impl FnMut() -> u64) -> Vec<Asteroid> {
        if !self.can_fragment() {
            return Vec::new();
        }

        let count = rng.gen_range(2..=3);
        (0..count)
            .map(|_| {
                let spread = rng.gen_range(-FRAGMENT_SPREAD..=FRAGMENT_SPREAD);
                let speed_jitter = rng.gen_range(0.9..1.3);
                Asteroid {
                    id: next_id(),
                    position: self.position,
                    velocity: self.velocity.rotate(spread).scale(speed_jitter),
                    radius: self.radius * FRAGMENT_RADIUS_FACTOR,
                    rotation: 0.0,
                    generation: self.generation + 1,
                }
            })
            .collect()
    }

    pub fn to_wire(&self) -> AsteroidWire {
        AsteroidWire {
            id: self.id,
            posicao: self.position,
            velocidade: self.velocity,
            raio: self.radius,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Projectile {
    pub id: u64,
    pub position: Vec2,
    pub velocity: Vec2,
    pub owner: u32,
    pub radius: f32,
    pub created_ms: u64,
    /// Set exactly once on first collision so one projectile destroys at most
    /// one target.
    pub consumed: bool,
}

impl Projectile {
    /// Builds a projectile travelling at the fixed bullet speed along the
    /// direction of `velocity`, whatever magnitude the client reported. A zero
    /// direction defaults to straight up.
    pub fn new(id: u64, owner: u32, position: Vec2, velocity: Vec2, now_ms: u64) -> Self {
        let direction = velocity.normalize();
        let direction = if direction.magnitude() == 0.0 {
            Vec2::new(0.0, -1.0)
        } else {
            direction
        };

        Self {
            id,
            position,
            velocity: direction.scale(BULLET_SPEED),
            owner,
            radius: BULLET_RADIUS,
            created_ms: now_ms,
            consumed: false,
        }
    }

    /// Marks the projectile consumed. Returns true only on the first call.
    pub fn consume(&mut self) -> bool {
        if self.consumed {
            false
        } else {
            self.consumed = true;
            true
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) >= BULLET_MAX_AGE_MS
    }

    pub fn to_wire(&self) -> ProjectileWire {
        ProjectileWire {
            id: self.id,
            posicao: self.position,
            velocidade: self.velocity,
            jogador_id: self.owner,
        }
    }
}
