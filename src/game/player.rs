//! Authoritative player entity and its per-tick controller

use serde::{Deserialize, Serialize};

use crate::util::vec2::wrap_angle;
use crate::util::Vec2;

use super::projectile::MAX_THROW_SPEED;
use super::router::Vehicle;
use super::world::CityLayout;
use super::ConnectionId;

/// Bounding square edge of a player
pub const PLAYER_SIZE: f32 = 30.0;
pub const MIN_SPEED: f32 = 0.0;
pub const MAX_SPEED: f32 = 5.0;
/// Speed eased towards while the brake is held
pub const BRAKE_SPEED: f32 = 1.5;
/// Divisor of the exponential speed approach
pub const SPEED_TRANSITION_FRAMES: f32 = 20.0;
/// Heading change per tick at full turn input
pub const TURN_RATE: f32 = 0.06;

pub const STUN_FRAMES: u32 = 90;
pub const SPIN_COUNT: u32 = 2;
pub const SPIN_START_SPEED: f32 = 0.45;
pub const SPIN_DECAY: f32 = 0.985;
const MIN_SPIN_SPEED: f32 = 0.08;
/// Ticks after a stun during which collisions block but do not stun
pub const RECOVERY_GRACE_FRAMES: u32 = 30;

/// Charge gained per tick while the throw button is held
pub const CHARGE_RATE: f32 = 0.3;
/// Charge wraps back to zero when held past this
pub const MAX_CHARGE: f32 = MAX_THROW_SPEED;

pub const NAME_MAX_LEN: usize = 16;

/// Movement state machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MotionState {
    /// Steering and driving normally
    Normal,
    /// Knocked out of control after a hit, spinning in place
    Colliding {
        stun_frames: u32,
        spins_remaining: u32,
        /// Radians turned within the current spin
        spin_progress: f32,
        angular_velocity: f32,
    },
    /// Back in control, immune to new stuns for a few frames
    Recovering { grace_frames: u32 },
}

impl MotionState {
    fn collision() -> Self {
        Self::Colliding {
            stun_frames: STUN_FRAMES,
            spins_remaining: SPIN_COUNT,
            spin_progress: 0.0,
            angular_velocity: SPIN_START_SPEED,
        }
    }
}

/// Latest control flags reported by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// -1.0 = full left, 1.0 = full right
    pub turn: f32,
    pub braking: bool,
    pub charging: bool,
}

/// Control intent from a client
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlIntent {
    Steer(f32),
    Brake(bool),
    /// Start charging, or release with an optional aim angle
    Charge { charging: bool, aim: Option<f32> },
}

/// A throw the room should turn into a projectile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrowRequest {
    pub position: Vec2,
    pub velocity: Vec2,
}

/// Something noteworthy that happened during a player tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Stunned,
    Recovered,
}

/// Static surroundings a player collides with
pub struct PlayerEnv<'a> {
    pub city: &'a CityLayout,
    pub vehicles: &'a [Vehicle],
}

/// One connected player
#[derive(Debug, Clone)]
pub struct PlayerEntity {
    pub id: ConnectionId,
    pub name: String,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f32,
    pub size: f32,

    pub throws_remaining: u32,
    pub deliveries: u32,
    pub score: u32,

    pub charge: f32,
    pub current_speed: f32,
    pub target_speed: f32,
    pub motion: MotionState,
    pub input: ControlInput,

    pub ready: bool,
    /// Unix millis of the last accepted client move
    pub last_move_at: Option<u64>,
    pub joined_at: u64,
}

impl PlayerEntity {
    pub fn new(id: ConnectionId, spawn: Vec2, throws: u32, now_ms: u64) -> Self {
        Self {
            id,
            name: default_name(&id),
            position: spawn,
            velocity: Vec2::ZERO,
            heading: 0.0,
            size: PLAYER_SIZE,
            throws_remaining: throws,
            deliveries: 0,
            score: 0,
            charge: 0.0,
            current_speed: MIN_SPEED,
            target_speed: MAX_SPEED,
            motion: MotionState::Normal,
            input: ControlInput::default(),
            ready: false,
            last_move_at: None,
            joined_at: now_ms,
        }
    }

    /// Reset per-match progress and put the player at `spawn`
    pub fn respawn(&mut self, spawn: Vec2, throws: u32) {
        self.position = spawn;
        self.velocity = Vec2::ZERO;
        self.heading = 0.0;
        self.throws_remaining = throws;
        self.deliveries = 0;
        self.score = 0;
        self.charge = 0.0;
        self.current_speed = MIN_SPEED;
        self.target_speed = MAX_SPEED;
        self.motion = MotionState::Normal;
        self.input = ControlInput::default();
        self.last_move_at = None;
    }

    pub fn is_stunned(&self) -> bool {
        matches!(self.motion, MotionState::Colliding { .. })
    }

    /// Remaining stun frames (0 when in control)
    pub fn stunned_frames(&self) -> u32 {
        match self.motion {
            MotionState::Colliding { stun_frames, .. } => stun_frames,
            _ => 0,
        }
    }

    pub fn spin_count(&self) -> u32 {
        match self.motion {
            MotionState::Colliding { spins_remaining, .. } => spins_remaining,
            _ => 0,
        }
    }

    pub fn angular_velocity(&self) -> f32 {
        match self.motion {
            MotionState::Colliding { angular_velocity, .. } => angular_velocity,
            _ => 0.0,
        }
    }

    /// Set a display name. Returns false when nothing usable remains after
    /// trimming.
    pub fn set_name(&mut self, raw: &str) -> bool {
        let name: String = raw.trim().chars().take(NAME_MAX_LEN).collect();
        let name = name.trim_end().to_string();
        if name.is_empty() {
            return false;
        }
        self.name = name;
        true
    }

    /// Record a control intent. A charge release yields a throw.
    pub fn apply_input(&mut self, intent: ControlIntent) -> Option<ThrowRequest> {
        match intent {
            ControlIntent::Steer(turn) => {
                self.input.turn = if turn.is_finite() { turn.clamp(-1.0, 1.0) } else { 0.0 };
                None
            }
            ControlIntent::Brake(braking) => {
                self.input.braking = braking;
                None
            }
            ControlIntent::Charge { charging: true, .. } => {
                if !self.is_stunned() {
                    self.input.charging = true;
                }
                None
            }
            ControlIntent::Charge { charging: false, aim } => {
                let was_charging = std::mem::take(&mut self.input.charging);
                if was_charging {
                    self.release_charge(aim)
                } else {
                    None
                }
            }
        }
    }

    /// Throw with the accumulated charge. No-op while stunned, without
    /// throws, or with nothing charged.
    pub fn release_charge(&mut self, aim: Option<f32>) -> Option<ThrowRequest> {
        let charge = std::mem::take(&mut self.charge);
        self.input.charging = false;
        if charge <= 0.0 || !self.consume_throw() {
            return None;
        }
        let angle = aim.filter(|a| a.is_finite()).unwrap_or(self.heading);
        Some(ThrowRequest {
            position: self.position,
            velocity: Vec2::from_angle(angle) * charge,
        })
    }

    /// Take one throw from the pool if the player may throw right now
    pub fn consume_throw(&mut self) -> bool {
        if self.is_stunned() || self.throws_remaining == 0 {
            return false;
        }
        self.throws_remaining -= 1;
        true
    }

    /// Overwrite kinematics with a client-reported move (already validated)
    pub fn apply_reported_move(
        &mut self,
        position: Vec2,
        heading: f32,
        velocity: Vec2,
        city: &CityLayout,
    ) {
        self.position = city.bounds.clamp(position, self.size / 2.0);
        if heading.is_finite() {
            self.heading = wrap_angle(heading);
        }
        if velocity.is_finite() {
            self.velocity = velocity;
            self.current_speed = velocity.length().clamp(MIN_SPEED, MAX_SPEED);
        }
    }

    /// Advance this player by one high-frequency tick
    pub fn tick(&mut self, env: &PlayerEnv<'_>) -> Option<PlayerEvent> {
        match self.motion {
            MotionState::Colliding {
                stun_frames,
                spins_remaining,
                spin_progress,
                angular_velocity,
            } => self.tick_spin(stun_frames, spins_remaining, spin_progress, angular_velocity),
            MotionState::Normal | MotionState::Recovering { .. } => self.tick_drive(env),
        }
    }

    fn tick_spin(
        &mut self,
        stun_frames: u32,
        mut spins_remaining: u32,
        mut spin_progress: f32,
        angular_velocity: f32,
    ) -> Option<PlayerEvent> {
        self.velocity = Vec2::ZERO;
        self.current_speed = MIN_SPEED;
        self.heading = wrap_angle(self.heading + angular_velocity);

        spin_progress += angular_velocity;
        if spin_progress >= std::f32::consts::TAU {
            spin_progress -= std::f32::consts::TAU;
            spins_remaining = spins_remaining.saturating_sub(1);
        }
        let stun_frames = stun_frames.saturating_sub(1);

        if spins_remaining == 0 || stun_frames == 0 {
            self.motion = MotionState::Recovering {
                grace_frames: RECOVERY_GRACE_FRAMES,
            };
            return Some(PlayerEvent::Recovered);
        }

        self.motion = MotionState::Colliding {
            stun_frames,
            spins_remaining,
            spin_progress,
            angular_velocity: (angular_velocity * SPIN_DECAY).max(MIN_SPIN_SPEED),
        };
        None
    }

    fn tick_drive(&mut self, env: &PlayerEnv<'_>) -> Option<PlayerEvent> {
        self.heading = wrap_angle(self.heading + self.input.turn * TURN_RATE);

        if self.input.charging {
            self.charge += CHARGE_RATE;
            if self.charge > MAX_CHARGE {
                self.charge = 0.0;
            }
        }

        let forward = Vec2::from_angle(self.heading);
        let previous = self.position;
        let moved = env
            .city
            .bounds
            .clamp(self.position + forward * self.current_speed, self.size / 2.0);

        if self.collides_at(moved, env) {
            if let MotionState::Normal = self.motion {
                self.enter_collision();
                return Some(PlayerEvent::Stunned);
            }
            self.position = previous;
            self.velocity = Vec2::ZERO;
        } else {
            self.position = moved;
            self.velocity = moved - previous;
        }

        self.target_speed = if self.input.braking { BRAKE_SPEED } else { MAX_SPEED };
        self.current_speed += (self.target_speed - self.current_speed) / SPEED_TRANSITION_FRAMES;
        self.current_speed = self.current_speed.clamp(MIN_SPEED, MAX_SPEED);

        if let MotionState::Recovering { grace_frames } = self.motion {
            self.motion = match grace_frames.saturating_sub(1) {
                0 => MotionState::Normal,
                left => MotionState::Recovering { grace_frames: left },
            };
        }

        None
    }

    fn collides_at(&self, p: Vec2, env: &PlayerEnv<'_>) -> bool {
        if !env.city.is_on_street(p, self.size) {
            return true;
        }
        let r = self.size / 2.0;
        env.vehicles
            .iter()
            .any(|v| v.position.distance_to(p) < r + v.radius())
    }

    fn enter_collision(&mut self) {
        self.motion = MotionState::collision();
        self.velocity = Vec2::ZERO;
        self.current_speed = MIN_SPEED;
        self.charge = 0.0;
        self.input.charging = false;
    }
}

fn default_name(id: &ConnectionId) -> String {
    id.simple().to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::router::Route;
    use crate::game::world::{Obstacle, ObstacleStyle, WorldBounds};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn open_city() -> CityLayout {
        CityLayout::from_parts(
            WorldBounds {
                width: 1000.0,
                height: 1000.0,
            },
            Vec::new(),
        )
    }

    fn walled_city() -> CityLayout {
        CityLayout::from_parts(
            WorldBounds {
                width: 1000.0,
                height: 1000.0,
            },
            vec![Obstacle::new(520.0, 0.0, 100.0, 1000.0, ObstacleStyle::Warehouse)],
        )
    }

    fn player_at(x: f32, y: f32) -> PlayerEntity {
        PlayerEntity::new(Uuid::new_v4(), Vec2::new(x, y), 5, 0)
    }

    #[test]
    fn idle_player_moves_straight_by_current_speed() {
        let city = open_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(100.0, 200.0);
        p.current_speed = 3.0;
        p.tick(&env);
        assert!((p.position.x - 103.0).abs() < 1e-4);
        assert!((p.position.y - 200.0).abs() < 1e-4);
    }

    #[test]
    fn speed_eases_towards_max_and_brake_target() {
        let city = open_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(100.0, 500.0);
        p.tick(&env);
        assert!((p.current_speed - MAX_SPEED / SPEED_TRANSITION_FRAMES).abs() < 1e-5);

        p.current_speed = MAX_SPEED;
        p.apply_input(ControlIntent::Brake(true));
        p.tick(&env);
        let expected = MAX_SPEED + (BRAKE_SPEED - MAX_SPEED) / SPEED_TRANSITION_FRAMES;
        assert!((p.current_speed - expected).abs() < 1e-5);
    }

    #[test]
    fn wall_hit_stuns_spins_and_recovers_at_rest() {
        let city = walled_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(503.0, 500.0);
        p.current_speed = MAX_SPEED;
        p.input.charging = true;
        p.charge = 4.0;

        assert_eq!(p.tick(&env), Some(PlayerEvent::Stunned));
        assert!(p.is_stunned());
        assert_eq!(p.spin_count(), SPIN_COUNT);
        assert_eq!(p.charge, 0.0);
        assert!(!p.input.charging);
        assert_eq!(p.velocity, Vec2::ZERO);

        let mut ticks = 0;
        while p.is_stunned() {
            p.tick(&env);
            ticks += 1;
            assert!(ticks <= STUN_FRAMES, "stun never cleared");
        }
        assert!(matches!(p.motion, MotionState::Recovering { .. }));
        assert_eq!(p.current_speed, MIN_SPEED);
    }

    #[test]
    fn recovering_player_is_blocked_but_not_restunned() {
        let city = walled_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(503.0, 500.0);
        p.motion = MotionState::Recovering { grace_frames: 5 };
        p.current_speed = MAX_SPEED;
        assert_eq!(p.tick(&env), None);
        assert!(!p.is_stunned());
        assert_eq!(p.position, Vec2::new(503.0, 500.0));
        assert_eq!(p.motion, MotionState::Recovering { grace_frames: 4 });
    }

    #[test]
    fn vehicle_contact_stuns() {
        let city = open_city();
        let vehicles = [Vehicle::new(
            0,
            Route {
                points: vec![Vec2::new(135.0, 100.0)],
                cursor: 0,
                looping: false,
            },
        )];
        let env = PlayerEnv {
            city: &city,
            vehicles: &vehicles,
        };
        let mut p = player_at(100.0, 100.0);
        p.current_speed = MAX_SPEED;
        assert_eq!(p.tick(&env), Some(PlayerEvent::Stunned));
    }

    #[test]
    fn charge_wraps_past_the_cap() {
        let city = open_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(500.0, 500.0);
        p.apply_input(ControlIntent::Charge {
            charging: true,
            aim: None,
        });
        let mut peak: f32 = 0.0;
        let mut wrapped = false;
        for _ in 0..(MAX_CHARGE / CHARGE_RATE) as usize + 3 {
            let before = p.charge;
            p.tick(&env);
            if p.charge < before {
                wrapped = true;
                break;
            }
            peak = peak.max(p.charge);
        }
        assert!(wrapped);
        assert!(peak <= MAX_CHARGE);
        assert!(peak > MAX_CHARGE - 2.0 * CHARGE_RATE);
        assert_eq!(p.charge, 0.0);
    }

    #[test]
    fn release_spawns_along_heading_and_consumes_a_throw() {
        let mut p = player_at(500.0, 500.0);
        p.heading = std::f32::consts::FRAC_PI_2;
        p.input.charging = true;
        p.charge = 10.0;
        let throw = p
            .apply_input(ControlIntent::Charge {
                charging: false,
                aim: None,
            })
            .expect("throw");
        assert_eq!(throw.position, p.position);
        assert!(throw.velocity.x.abs() < 1e-4);
        assert!((throw.velocity.y - 10.0).abs() < 1e-4);
        assert_eq!(p.throws_remaining, 4);
        assert_eq!(p.charge, 0.0);
    }

    #[test]
    fn release_without_throws_or_while_stunned_is_a_noop() {
        let mut p = player_at(500.0, 500.0);
        p.throws_remaining = 0;
        p.charge = 5.0;
        assert!(p.release_charge(None).is_none());

        let mut p = player_at(500.0, 500.0);
        p.charge = 5.0;
        p.motion = MotionState::collision();
        assert!(p.release_charge(None).is_none());
        assert_eq!(p.throws_remaining, 5);
    }

    #[test]
    fn names_are_trimmed_and_capped() {
        let mut p = player_at(0.0, 0.0);
        let default = p.name.clone();
        assert_eq!(default.len(), 8);
        assert!(!p.set_name("    "));
        assert_eq!(p.name, default);
        assert!(p.set_name("  Speedy Courier Extraordinaire  "));
        assert_eq!(p.name, "Speedy Courier E");
    }

    #[test]
    fn position_is_clamped_to_world() {
        let city = open_city();
        let env = PlayerEnv {
            city: &city,
            vehicles: &[],
        };
        let mut p = player_at(995.0, 500.0);
        p.current_speed = MAX_SPEED;
        p.tick(&env);
        assert_eq!(p.position.x, 1000.0 - PLAYER_SIZE / 2.0);
    }

    proptest! {
        #[test]
        fn speed_stays_in_envelope(
            inputs in proptest::collection::vec((-2.0f32..2.0, any::<bool>(), any::<bool>()), 1..200),
            start_speed in -10.0f32..10.0,
        ) {
            let city = walled_city();
            let env = PlayerEnv { city: &city, vehicles: &[] };
            let mut p = player_at(300.0, 500.0);
            p.current_speed = start_speed;
            for (turn, brake, charge) in inputs {
                p.apply_input(ControlIntent::Steer(turn));
                p.apply_input(ControlIntent::Brake(brake));
                p.apply_input(ControlIntent::Charge { charging: charge, aim: None });
                p.tick(&env);
                prop_assert!(p.current_speed >= MIN_SPEED && p.current_speed <= MAX_SPEED);
                prop_assert!(!p.is_stunned() || p.velocity == Vec2::ZERO);
            }
        }
    }
}
