//! Thrown parcels: friction, rebounds and delivery resolution

use serde::{Deserialize, Serialize};

use crate::util::Vec2;

use super::router::Vehicle;
use super::world::{DeliveryTarget, Obstacle, WorldBounds};
use super::ConnectionId;

pub const PROJECTILE_RADIUS: f32 = 8.0;
/// Velocity multiplier applied every tick
pub const FRICTION: f32 = 0.96;
/// Speed kept after a bounce
pub const RESTITUTION: f32 = 0.6;
/// Below this speed a parcel has come to rest
pub const STOP_SPEED: f32 = 0.5;
/// Fastest throw accepted from any source
pub const MAX_THROW_SPEED: f32 = 18.0;

pub const MAX_DELIVERY_SCORE: u32 = 100;
pub const MIN_DELIVERY_SCORE: u32 = 10;
/// Points lost for a parcel that misses or leaves the map
pub const MISS_PENALTY: u32 = 5;

/// A parcel in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projectile {
    pub id: u64,
    pub owner: ConnectionId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub active: bool,
    pub delivered: bool,
    pub sliding: bool,
}

impl Projectile {
    pub fn new(id: u64, owner: ConnectionId, position: Vec2, velocity: Vec2) -> Self {
        Self {
            id,
            owner,
            position,
            velocity: velocity.clamp_length(MAX_THROW_SPEED),
            active: true,
            delivered: false,
            sliding: true,
        }
    }
}

/// Why a parcel scored nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Came to rest outside the active target
    Missed,
    /// Left the world while still sliding
    OutOfBounds,
}

/// Result of one physics step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectileOutcome {
    /// Still moving
    Sliding,
    Delivered {
        target_index: usize,
        distance: f32,
        score: u32,
    },
    Failed(FailureReason),
    /// Already resolved on an earlier tick; nothing happened
    Settled,
}

impl ProjectileOutcome {
    /// Whether the projectile should stay in the world
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sliding)
    }
}

/// Read-only view of the world a projectile interacts with
pub struct PhysicsContext<'a> {
    pub bounds: WorldBounds,
    pub obstacles: &'a [Obstacle],
    pub vehicles: &'a [Vehicle],
    /// Index and data of the currently active target
    pub target: Option<(usize, &'a DeliveryTarget)>,
}

/// Advance one projectile by one tick.
///
/// Resolution (deliver or fail) happens exactly once: on the tick the
/// parcel stops or leaves the world. Afterwards the projectile is inactive
/// and further calls return [`ProjectileOutcome::Settled`].
pub fn update(projectile: &mut Projectile, ctx: &PhysicsContext<'_>) -> ProjectileOutcome {
    if !projectile.active || !projectile.sliding {
        return ProjectileOutcome::Settled;
    }

    projectile.position += projectile.velocity;
    projectile.velocity *= FRICTION;

    if !ctx.bounds.contains(projectile.position) {
        finish(projectile, false);
        return ProjectileOutcome::Failed(FailureReason::OutOfBounds);
    }

    if !bounce_off_obstacles(projectile, ctx.obstacles) {
        bounce_off_vehicles(projectile, ctx.vehicles);
    }

    if projectile.velocity.length() >= STOP_SPEED {
        return ProjectileOutcome::Sliding;
    }

    match ctx.target {
        Some((target_index, target)) => {
            let distance = projectile.position.distance_to(target.position);
            if distance <= target.radius {
                finish(projectile, true);
                ProjectileOutcome::Delivered {
                    target_index,
                    distance,
                    score: accuracy_score(distance, target.radius),
                }
            } else {
                finish(projectile, false);
                ProjectileOutcome::Failed(FailureReason::Missed)
            }
        }
        None => {
            finish(projectile, false);
            ProjectileOutcome::Failed(FailureReason::Missed)
        }
    }
}

fn finish(projectile: &mut Projectile, delivered: bool) {
    projectile.sliding = false;
    projectile.active = false;
    projectile.delivered = delivered;
    projectile.velocity = Vec2::ZERO;
}

/// Points for a parcel resting `distance` from a target's centre: full
/// marks at the centre, falling linearly to the floor at the rim.
pub fn accuracy_score(distance: f32, radius: f32) -> u32 {
    if radius <= 0.0 {
        return MIN_DELIVERY_SCORE;
    }
    let t = (distance / radius).clamp(0.0, 1.0);
    let span = (MAX_DELIVERY_SCORE - MIN_DELIVERY_SCORE) as f32;
    MIN_DELIVERY_SCORE + (span * (1.0 - t)).round() as u32
}

/// Reflect off the first obstacle touched. Returns true on a hit.
fn bounce_off_obstacles(projectile: &mut Projectile, obstacles: &[Obstacle]) -> bool {
    let r = PROJECTILE_RADIUS;
    for obstacle in obstacles {
        let closest = obstacle.closest_point(projectile.position);
        let delta = projectile.position - closest;
        let dist_sq = delta.length_sq();
        if dist_sq >= r * r {
            continue;
        }

        let (normal, surface) = if dist_sq > 0.0 {
            (delta.normalize(), closest)
        } else {
            // Centre is inside the rectangle: leave through the nearest edge
            exit_through_nearest_edge(obstacle, projectile.position)
        };

        reflect(projectile, normal);
        projectile.position = surface + normal * r;
        return true;
    }
    false
}

fn exit_through_nearest_edge(o: &Obstacle, p: Vec2) -> (Vec2, Vec2) {
    let left = p.x - o.x;
    let right = o.x + o.width - p.x;
    let top = p.y - o.y;
    let bottom = o.y + o.height - p.y;
    let min = left.min(right).min(top).min(bottom);
    if min == left {
        (Vec2::new(-1.0, 0.0), Vec2::new(o.x, p.y))
    } else if min == right {
        (Vec2::new(1.0, 0.0), Vec2::new(o.x + o.width, p.y))
    } else if min == top {
        (Vec2::new(0.0, -1.0), Vec2::new(p.x, o.y))
    } else {
        (Vec2::new(0.0, 1.0), Vec2::new(p.x, o.y + o.height))
    }
}

fn bounce_off_vehicles(projectile: &mut Projectile, vehicles: &[Vehicle]) -> bool {
    for vehicle in vehicles {
        let combined = PROJECTILE_RADIUS + vehicle.radius();
        let delta = projectile.position - vehicle.position;
        let dist = delta.length();
        if dist >= combined {
            continue;
        }
        let normal = if dist > 0.0 {
            delta * (1.0 / dist)
        } else {
            (-projectile.velocity).normalize()
        };
        reflect(projectile, normal);
        projectile.position = vehicle.position + normal * combined;
        return true;
    }
    false
}

fn reflect(projectile: &mut Projectile, normal: Vec2) {
    // Only bounce when moving into the surface
    if projectile.velocity.dot(normal) < 0.0 {
        projectile.velocity = projectile.velocity.reflect(normal);
    }
    projectile.velocity *= RESTITUTION;
}
