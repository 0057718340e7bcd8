//! Wire protocol and math shared between the asteroid server and its clients.
//!
//! Every message on the wire is one newline-delimited UTF-8 JSON [`Envelope`].
//! The `dados` field carries a second, message-specific JSON document encoded
//! as a string, so decoding is always two steps: envelope first, payload next.
//! Field names follow the original protocol and must not be renamed.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;

pub const PLAYER_HIT_RADIUS: f32 = 15.0;
pub const PLAYER_START_LIVES: u32 = 3;
pub const PLAYER_MAX_LIVES: u32 = 5;
pub const FIRE_COOLDOWN_MS: u64 = 250;
pub const DAMAGE_INVULN_MS: u64 = 2_000;

pub const BULLET_SPEED: f32 = 500.0;
pub const BULLET_RADIUS: f32 = 3.0;
pub const BULLET_MAX_AGE_MS: u64 = 8_000;
pub const BULLET_GC_MARGIN: f32 = 20.0;

pub const ASTEROID_CAP: usize = 12;
pub const ASTEROID_SPAWN_INTERVAL_TICKS: u64 = 120;
pub const ASTEROID_MIN_RADIUS: f32 = 12.0;
pub const ASTEROID_MAX_RADIUS: f32 = 40.0;
pub const ASTEROID_MIN_FALL_SPEED: f32 = 40.0;
pub const ASTEROID_MAX_FALL_SPEED: f32 = 120.0;
pub const ASTEROID_MAX_DRIFT_SPEED: f32 = 30.0;
pub const ASTEROID_ROTATION_RATE: f32 = 1.5;
pub const ASTEROID_GC_MARGIN: f32 = 80.0;

pub const FRAGMENT_MIN_RADIUS: f32 = 16.0;
pub const FRAGMENT_RADIUS_FACTOR: f32 = 0.6;
pub const MAX_GENERATION: u8 = 3;

/// Radius at or above which an asteroid counts as large; below
/// [`MEDIUM_TIER_RADIUS`] it counts as small.
pub const LARGE_TIER_RADIUS: f32 = 30.0;
pub const MEDIUM_TIER_RADIUS: f32 = 20.0;

pub const DEFAULT_TICK_RATE: u32 = 60;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// A vector in 2D screen space. Positive x is right, positive y is down.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Returns the unit vector, or the zero vector when the magnitude is zero.
    pub fn normalize(&self) -> Vec2 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec2::default()
        } else {
            Vec2 {
                x: self.x / mag,
                y: self.y / mag,
            }
        }
    }

    pub fn scale(&self, scalar: f32) -> Vec2 {
        Vec2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    pub fn add(&self, other: &Vec2) -> Vec2 {
        Vec2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }

    /// Rotates the vector by `angle` radians.
    pub fn rotate(&self, angle: f32) -> Vec2 {
        let (sin, cos) = angle.sin_cos();
        Vec2 {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}

/// Message tags recognized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Server to client, assigns the session's player id.
    #[serde(rename = "ID_JOGADOR")]
    PlayerId,
    /// Server to client, `dados` is a [`WorldSnapshot`].
    #[serde(rename = "ESTADO_JOGO")]
    GameState,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    /// Client to server, `dados` is a [`Vec2`] with the requested position.
    #[serde(rename = "MOVIMENTO")]
    Movement,
    /// Client to server, `dados` is a [`ShotData`].
    #[serde(rename = "TIRO")]
    Shot,
    /// Server to client, best-effort notice before the socket closes.
    #[serde(rename = "SERVIDOR_PARANDO")]
    ServerStopping,
}

/// The outer JSON object carried on every line of the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub tipo: MessageKind,
    /// Message-specific payload, itself encoded as JSON.
    pub dados: String,
    #[serde(rename = "jogadorId")]
    pub jogador_id: u32,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(tipo: MessageKind, dados: String, jogador_id: u32) -> Self {
        Self {
            tipo,
            dados,
            jogador_id,
            timestamp: now_ms(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Player state as transmitted inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWire {
    pub id: u32,
    pub posicao: Vec2,
    pub pontuacao: u32,
    pub vidas: u32,
    pub ativo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsteroidWire {
    pub id: u64,
    pub posicao: Vec2,
    pub velocidade: Vec2,
    pub raio: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectileWire {
    pub id: u64,
    pub posicao: Vec2,
    pub velocidade: Vec2,
    #[serde(rename = "jogadorId")]
    pub jogador_id: u32,
}

/// Immutable copy of the world built once per tick for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub jogadores: Vec<PlayerWire>,
    pub asteroides: Vec<AsteroidWire>,
    pub tiros: Vec<ProjectileWire>,
    #[serde(rename = "frameCount")]
    pub frame_count: u64,
    #[serde(rename = "jogoAtivo")]
    pub jogo_ativo: bool,
}

/// Payload of a `TIRO` message: where the projectile starts and which way it
/// travels. The server re-normalizes the velocity to the fixed bullet speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotData {
    pub posicao: Vec2,
    pub velocidade: Vec2,
}
