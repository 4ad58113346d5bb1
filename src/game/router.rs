//! Autonomous vehicle routing over the street grid

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::vec2::wrap_angle;
use crate::util::Vec2;

use super::world::{CityLayout, BLOCK_PITCH};

/// Footprint of a vehicle (square for obstacle tests, circle for contacts)
pub const VEHICLE_SIZE: f32 = 40.0;
/// Distance covered per low-frequency tick
pub const VEHICLE_SPEED: f32 = 14.0;
/// Distance at which a vehicle brakes for traffic ahead
pub const MIN_SEPARATION: f32 = 90.0;

const ROUTE_HOPS: usize = 12;
const WAYPOINT_RADIUS: f32 = 20.0;
/// Fraction of the heading error corrected each tick
const STEER_SMOOTHING: f32 = 0.35;
/// cos(30°): half-angle of the forward cone used for car following
const FOLLOW_CONE_COS: f32 = 0.866;
const FOLLOW_SLOWDOWN: f32 = 0.25;
const BASE_TURN_CHANCE: f64 = 0.15;
const TURN_CHANCE_PER_STRAIGHT: f64 = 0.2;
const MAX_TURN_CHANCE: f64 = 0.9;

/// Grid heading for route construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    fn random(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..4) {
            0 => Self::North,
            1 => Self::East,
            2 => Self::South,
            _ => Self::West,
        }
    }

    fn reverse(self) -> Self {
        match self {
            Self::North => Self::South,
            Self::East => Self::West,
            Self::South => Self::North,
            Self::West => Self::East,
        }
    }

    fn left(self) -> Self {
        match self {
            Self::North => Self::West,
            Self::West => Self::South,
            Self::South => Self::East,
            Self::East => Self::North,
        }
    }

    fn right(self) -> Self {
        self.left().reverse()
    }

    /// Neighbouring intersection, if it exists on a `cols` x `rows` grid
    fn step(self, col: usize, row: usize, cols: usize, rows: usize) -> Option<(usize, usize)> {
        match self {
            Self::North => row.checked_sub(1).map(|r| (col, r)),
            Self::South => (row + 1 < rows).then_some((col, row + 1)),
            Self::West => col.checked_sub(1).map(|c| (c, row)),
            Self::East => (col + 1 < cols).then_some((col + 1, row)),
        }
    }
}

/// Ordered waypoints with a cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub points: Vec<Vec2>,
    pub cursor: usize,
    pub looping: bool,
}

impl Route {
    pub fn current(&self) -> Option<Vec2> {
        self.points.get(self.cursor).copied()
    }

    /// Move to the next waypoint. Non-looping routes are driven back the
    /// way they came.
    pub fn advance_cursor(&mut self) {
        if self.points.len() < 2 {
            return;
        }
        self.cursor += 1;
        if self.cursor >= self.points.len() {
            if self.looping {
                self.cursor = 0;
            } else {
                self.points.reverse();
                self.cursor = 1;
            }
        }
    }
}

/// Autonomous actor driving the city
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: u32,
    pub position: Vec2,
    pub velocity: Vec2,
    pub heading: f32,
    pub size: f32,
    pub route: Route,
    pub min_separation: f32,
}

impl Vehicle {
    pub fn new(id: u32, route: Route) -> Self {
        let position = route.points.first().copied().unwrap_or_default();
        let heading = route
            .points
            .get(1)
            .map(|next| (*next - position).angle())
            .unwrap_or(0.0);
        let mut vehicle = Self {
            id,
            position,
            velocity: Vec2::ZERO,
            heading,
            size: VEHICLE_SIZE,
            route,
            min_separation: MIN_SEPARATION,
        };
        vehicle.route.advance_cursor();
        vehicle
    }

    /// Collision radius used for circle tests
    pub fn radius(&self) -> f32 {
        self.size / 2.0
    }
}

/// Build a random route starting at the intersection nearest `start`.
///
/// Every point of the result is open road: a hop that would leave the
/// world or land on a building is retried reversed, then sideways.
pub fn build_route(rng: &mut impl Rng, start: Vec2, city: &CityLayout) -> Route {
    let (cols, rows) = city.intersection_dims();
    let Some((mut col, mut row)) = nearest_open_intersection(city, start) else {
        return Route::default();
    };
    let origin = city.intersection(col, row);
    let mut points = vec![origin];
    let mut dir = Direction::random(rng);
    let mut straight = 0u32;

    for _ in 0..ROUTE_HOPS {
        let turn_chance =
            (BASE_TURN_CHANCE + straight as f64 * TURN_CHANCE_PER_STRAIGHT).min(MAX_TURN_CHANCE);
        if rng.gen_bool(turn_chance) {
            dir = if rng.gen_bool(0.5) { dir.left() } else { dir.right() };
            straight = 0;
        } else {
            straight += 1;
        }

        let from = city.intersection(col, row);
        let hop = [dir, dir.reverse(), dir.left(), dir.right()]
            .into_iter()
            .find_map(|candidate| {
                let (c, r) = candidate.step(col, row, cols, rows)?;
                let to = city.intersection(c, r);
                hop_is_clear(city, from, to).then_some((c, r, candidate))
            });

        match hop {
            Some((c, r, taken)) => {
                if taken != dir {
                    straight = 0;
                }
                dir = taken;
                col = c;
                row = r;
                points.push(city.intersection(col, row));
            }
            None => break,
        }
    }

    let mut looping = false;
    if points.len() > 2 {
        if let Some(last) = points.last().copied() {
            if last.distance_to(origin) < BLOCK_PITCH * 0.5 {
                looping = true;
                if last == origin {
                    points.pop();
                }
            }
        }
    }

    Route {
        points,
        cursor: 0,
        looping,
    }
}

/// Snap to the closest intersection a vehicle can stand on
fn nearest_open_intersection(city: &CityLayout, p: Vec2) -> Option<(usize, usize)> {
    let (col, row) = city.nearest_intersection(p);
    if city.is_open(city.intersection(col, row), VEHICLE_SIZE) {
        return Some((col, row));
    }
    let (cols, rows) = city.intersection_dims();
    (0..cols)
        .flat_map(|c| (0..rows).map(move |r| (c, r)))
        .filter(|&(c, r)| city.is_open(city.intersection(c, r), VEHICLE_SIZE))
        .min_by(|a, b| {
            let da = city.intersection(a.0, a.1).distance_sq_to(p);
            let db = city.intersection(b.0, b.1).distance_sq_to(p);
            da.total_cmp(&db)
        })
}

fn hop_is_clear(city: &CityLayout, from: Vec2, to: Vec2) -> bool {
    let mid = (from + to) * 0.5;
    city.is_open(to, VEHICLE_SIZE) && city.is_open(mid, VEHICLE_SIZE)
}

/// Spawn `count` vehicles at random intersections
pub fn spawn_vehicles(rng: &mut impl Rng, city: &CityLayout, count: usize) -> Vec<Vehicle> {
    let (cols, rows) = city.intersection_dims();
    (0..count)
        .map(|i| {
            let start = city.intersection(rng.gen_range(0..cols), rng.gen_range(0..rows));
            Vehicle::new(i as u32, build_route(rng, start, city))
        })
        .collect()
}

/// Result of moving one vehicle for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Moved,
    /// Hit something static; a fresh route was built from where it stands
    Rerouted,
}

/// Position/heading view of the other vehicles, taken before the tick
pub type Traffic = [(u32, Vec2)];

/// Move one vehicle along its route for one low-frequency tick
pub fn advance(
    vehicle: &mut Vehicle,
    city: &CityLayout,
    traffic: &Traffic,
    rng: &mut impl Rng,
) -> AdvanceOutcome {
    let Some(mut target) = vehicle.route.current() else {
        vehicle.route = build_route(rng, vehicle.position, city);
        vehicle.velocity = Vec2::ZERO;
        return AdvanceOutcome::Rerouted;
    };

    if vehicle.position.distance_to(target) <= WAYPOINT_RADIUS {
        vehicle.route.advance_cursor();
        target = vehicle.route.current().unwrap_or(target);
    }

    let to_target = target - vehicle.position;
    let desired = to_target.angle();
    vehicle.heading = wrap_angle(vehicle.heading + wrap_angle(desired - vehicle.heading) * STEER_SMOOTHING);
    let forward = Vec2::from_angle(vehicle.heading);

    let mut speed = VEHICLE_SPEED.min(to_target.length().max(1.0));
    let blocked = traffic.iter().any(|(id, pos)| {
        if *id == vehicle.id {
            return false;
        }
        let offset = *pos - vehicle.position;
        let dist = offset.length();
        dist > 0.0 && dist < vehicle.min_separation && offset.normalize().dot(forward) > FOLLOW_CONE_COS
    });
    if blocked {
        speed *= FOLLOW_SLOWDOWN;
    }

    let next = vehicle.position + forward * speed;
    if !city.is_open(next, vehicle.size) {
        vehicle.velocity = Vec2::ZERO;
        vehicle.route = build_route(rng, vehicle.position, city);
        return AdvanceOutcome::Rerouted;
    }

    vehicle.position = next;
    vehicle.velocity = forward * speed;
    AdvanceOutcome::Moved
}
