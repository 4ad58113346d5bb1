//! Checks applied to client-reported moves before they reach the world

use crate::config::MoveValidation;
use crate::util::time::TICK_MILLIS;
use crate::util::Vec2;

use super::player::{PlayerEntity, MAX_SPEED};

/// A move as reported by a client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedMove {
    pub position: Vec2,
    pub heading: f32,
    pub velocity: Vec2,
}

/// Why a move was refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MoveRejection {
    #[error("NaN or Infinity in move")]
    InvalidFloats,

    #[error("Moved {distance:.1} units in {elapsed_ms} ms, limit {limit:.1}")]
    TooFast {
        distance: f32,
        elapsed_ms: u64,
        limit: f32,
    },

    #[error("Session expired {age_ms} ms after joining")]
    SessionExpired { age_ms: u64 },
}

/// Gate between a received move and the world
pub trait MoveValidator: Send + Sync {
    fn validate(
        &self,
        player: &PlayerEntity,
        proposed: &ProposedMove,
        now_ms: u64,
    ) -> Result<(), MoveRejection>;
}

fn check_finite(proposed: &ProposedMove) -> Result<(), MoveRejection> {
    if proposed.position.is_finite() && proposed.velocity.is_finite() && proposed.heading.is_finite() {
        Ok(())
    } else {
        Err(MoveRejection::InvalidFloats)
    }
}

/// Accepts any finite move; the room clamps it to the world rect
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustClient;

impl MoveValidator for TrustClient {
    fn validate(
        &self,
        _player: &PlayerEntity,
        proposed: &ProposedMove,
        _now_ms: u64,
    ) -> Result<(), MoveRejection> {
        check_finite(proposed)
    }
}

/// Rejects moves that outrun the player's top speed, and any move after the
/// session window has closed
#[derive(Debug, Clone, Copy)]
pub struct SpeedLimit {
    pub max_distance_per_tick: f32,
    /// Multiplier on the limit to absorb jitter and batching
    pub tolerance: f32,
    pub session_expiry_ms: u64,
}

impl Default for SpeedLimit {
    fn default() -> Self {
        Self {
            max_distance_per_tick: MAX_SPEED,
            tolerance: 1.5,
            session_expiry_ms: 60 * 60 * 1000,
        }
    }
}

impl MoveValidator for SpeedLimit {
    fn validate(
        &self,
        player: &PlayerEntity,
        proposed: &ProposedMove,
        now_ms: u64,
    ) -> Result<(), MoveRejection> {
        check_finite(proposed)?;

        let age_ms = now_ms.saturating_sub(player.joined_at);
        if age_ms > self.session_expiry_ms {
            return Err(MoveRejection::SessionExpired { age_ms });
        }

        let since = player.last_move_at.unwrap_or(player.joined_at);
        let elapsed_ms = now_ms.saturating_sub(since);
        let ticks = (elapsed_ms as f32 / TICK_MILLIS).max(1.0);
        let limit = self.max_distance_per_tick * ticks * self.tolerance;
        let distance = player.position.distance_to(proposed.position);
        if distance > limit {
            return Err(MoveRejection::TooFast {
                distance,
                elapsed_ms,
                limit,
            });
        }
        Ok(())
    }
}

/// Validator for the configured mode
pub fn validator_for(mode: MoveValidation) -> Box<dyn MoveValidator> {
    match mode {
        MoveValidation::Trust => Box::new(TrustClient),
        MoveValidation::SpeedLimit => Box::new(SpeedLimit::default()),
    }
}
