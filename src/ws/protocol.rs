//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::projectile::FailureReason;
use crate::game::world::{DeliveryTarget, Obstacle, WorldBounds};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Client-simulated kinematics for this frame
    #[serde(alias = "update")]
    Move {
        x: f32,
        y: f32,
        heading: f32,
        #[serde(default)]
        vx: f32,
        #[serde(default)]
        vy: f32,
        #[serde(default)]
        charging: bool,
        #[serde(default)]
        charge: f32,
    },

    /// Turn input (-1.0 = full left, 1.0 = full right)
    Steer { turn: f32 },

    /// Client-computed throw
    Throw { x: f32, y: f32, vx: f32, vy: f32 },

    /// Throw button held or released. Release throws along `aim` (radians)
    /// or the current heading.
    ChargeState {
        charging: bool,
        #[serde(default)]
        aim: Option<f32>,
    },

    BrakeState { braking: bool },

    /// Set display name
    Name { name: String },

    /// Ready to start the match
    Ready,

    /// Reinitialise the world
    Reset,

    /// Leave the room
    Leave,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp, echoed back untouched. Fractional values
        /// such as `performance.now()` are allowed.
        t: f64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        conn_id: Uuid,
        room: String,
        server_time: u64,
    },

    /// Entire world, sent to a joining connection (or everyone after a reset)
    FullState { you: Uuid, world: WorldSnapshot },

    /// A peer joined the room
    PlayerJoined { player: PlayerSnapshot },

    /// A peer left the room
    PlayerLeft { conn_id: Uuid },

    /// Relay of a peer's reported move
    PlayerUpdate {
        id: Uuid,
        x: f32,
        y: f32,
        heading: f32,
        vx: f32,
        vy: f32,
        charging: bool,
        charge: f32,
    },

    /// Relay of a peer's brake/charge flags
    PlayerInput {
        id: Uuid,
        braking: bool,
        charging: bool,
    },

    PlayerRenamed { id: Uuid, name: String },

    PlayerReady { id: Uuid },

    /// A parcel was thrown
    Throw {
        owner: Uuid,
        projectile_id: u64,
        x: f32,
        y: f32,
        vx: f32,
        vy: f32,
    },

    /// All projectiles still in flight
    ProjectileBatch { projectiles: Vec<ProjectileSnapshot> },

    /// All vehicles
    VehicleBatch { vehicles: Vec<VehicleSnapshot> },

    /// Periodic authoritative player state
    Snapshot {
        tick: u64,
        time_remaining: f32,
        players: Vec<PlayerSnapshot>,
    },

    PlayerStunned { id: Uuid },

    DeliveryMade {
        player: Uuid,
        target_index: usize,
        score: u32,
        next_target: Option<usize>,
        deliveries_completed: usize,
    },

    DeliveryFailed {
        player: Uuid,
        reason: FailureReason,
        penalty: u32,
    },

    /// Match has started
    MatchStart {
        bounds: WorldBounds,
        obstacles: Vec<Obstacle>,
        targets: Vec<DeliveryTarget>,
        vehicles: Vec<VehicleSnapshot>,
        time_remaining: f32,
        required_deliveries: usize,
    },

    /// Match has ended
    MatchOver {
        outcome: MatchOutcome,
        time_bonus: u32,
        results: Vec<PlayerResult>,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: f64,
    },
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Required deliveries reached
    Victory,
    /// Timer ran out
    TimeUp,
    /// Nobody can throw and nothing is in flight
    OutOfThrows,
}

/// Complete world state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub bounds: WorldBounds,
    pub obstacles: Vec<Obstacle>,
    pub targets: Vec<DeliveryTarget>,
    pub vehicles: Vec<VehicleSnapshot>,
    pub projectiles: Vec<ProjectileSnapshot>,
    pub players: Vec<PlayerSnapshot>,
    pub time_remaining: f32,
    pub started: bool,
    pub over: bool,
    pub deliveries_completed: usize,
    pub required_deliveries: usize,
}

/// Player state on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub heading: f32,
    pub vx: f32,
    pub vy: f32,
    pub size: f32,
    pub throws_remaining: u32,
    pub deliveries: u32,
    pub score: u32,
    /// Stun frames left (0 = in control)
    pub stunned: u32,
    pub spin_count: u32,
    pub angular_velocity: f32,
    pub charging: bool,
    pub charge: f32,
    pub braking: bool,
    pub current_speed: f32,
    pub target_speed: f32,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub heading: f32,
    pub vx: f32,
    pub vy: f32,
    pub size: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectileSnapshot {
    pub id: u64,
    pub owner: Uuid,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub active: bool,
    pub delivered: bool,
    pub sliding: bool,
}

/// Final tally for one player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerResult {
    pub id: Uuid,
    pub name: String,
    pub score: u32,
    pub deliveries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_snake_case_tags() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"charge_state","charging":true}"#).unwrap();
        assert_eq!(
            msg,
            ClientMsg::ChargeState {
                charging: true,
                aim: None
            }
        );

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(msg, ClientMsg::Ready);
    }

    #[test]
    fn update_is_accepted_as_move() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"update","x":1.0,"y":2.0,"heading":0.5}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Move { x, y, vx, .. } if x == 1.0 && y == 2.0 && vx == 0.0));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(serde_json::from_str::<ClientMsg>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn ping_accepts_fractional_and_epoch_timestamps() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"ping","t":1234.5}"#).unwrap();
        assert_eq!(msg, ClientMsg::Ping { t: 1234.5 });

        let msg: ClientMsg = serde_json::from_str(r#"{"type":"ping","t":1700000000123}"#).unwrap();
        assert_eq!(msg, ClientMsg::Ping { t: 1_700_000_000_123.0 });
    }

    #[test]
    fn pong_echoes_the_timestamp_value() {
        let json = serde_json::to_string(&ServerMsg::Pong { t: 1234.5 }).unwrap();
        let back: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back["type"], "pong");
        assert_eq!(back["t"].as_f64(), Some(1234.5));
    }
}
