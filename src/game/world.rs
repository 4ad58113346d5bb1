//! City generation: block grid, obstacle queries, spawn and delivery placement

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::Vec2;

/// Edge length of one city block
pub const BLOCK_SIZE: f32 = 200.0;
/// Width of the streets between blocks
pub const STREET_WIDTH: f32 = 80.0;
/// Distance between neighbouring intersections
pub const BLOCK_PITCH: f32 = BLOCK_SIZE + STREET_WIDTH;
/// Gap left between the two halves of a split block
const ALLEY_WIDTH: f32 = 24.0;

pub const GRID_COLS: usize = 8;
pub const GRID_ROWS: usize = 6;

const MAX_SPAWN_ATTEMPTS: usize = 200;
const DELIVERY_ATTEMPTS_PER_PASS: usize = 5_000;
const DELIVERY_PASSES: usize = 3;

/// Default capture radius of a delivery target
pub const TARGET_RADIUS: f32 = 36.0;

/// Rendering hint for an obstacle; the simulation only reads the rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObstacleStyle {
    /// One building filling the block
    Warehouse,
    /// Two buildings separated by an alley
    Houses,
    /// One arm of an L-shaped building
    Shop,
}

/// Axis-aligned static rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub style: ObstacleStyle,
}

impl Obstacle {
    pub fn new(x: f32, y: f32, width: f32, height: f32, style: ObstacleStyle) -> Self {
        Self {
            x,
            y,
            width,
            height,
            style,
        }
    }

    /// Strict overlap with a square of half-extent `half` centred at `(x, y)`.
    /// Touching edges do not count.
    #[inline]
    pub fn overlaps_square(&self, x: f32, y: f32, half: f32) -> bool {
        x + half > self.x
            && x - half < self.x + self.width
            && y + half > self.y
            && y - half < self.y + self.height
    }

    /// Closest point on (or in) the rectangle to `p`
    pub fn closest_point(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            p.x.clamp(self.x, self.x + self.width),
            p.y.clamp(self.y, self.y + self.height),
        )
    }
}

/// True when a `size`-wide square at `(x, y)` overlaps no obstacle.
///
/// Every collision query in the simulation goes through here.
pub fn is_on_street(x: f32, y: f32, size: f32, obstacles: &[Obstacle]) -> bool {
    let half = size / 2.0;
    !obstacles.iter().any(|o| o.overlaps_square(x, y, half))
}

/// World rectangle anchored at the origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub width: f32,
    pub height: f32,
}

impl WorldBounds {
    pub fn for_grid(cols: usize, rows: usize) -> Self {
        Self {
            width: cols as f32 * BLOCK_PITCH + STREET_WIDTH,
            height: rows as f32 * BLOCK_PITCH + STREET_WIDTH,
        }
    }

    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= 0.0 && p.x <= self.width && p.y >= 0.0 && p.y <= self.height
    }

    /// True when a square of half-extent `half` lies fully inside
    pub fn contains_square(&self, p: Vec2, half: f32) -> bool {
        p.x - half >= 0.0 && p.x + half <= self.width && p.y - half >= 0.0 && p.y + half <= self.height
    }

    /// Clamp a point so a square of half-extent `half` stays inside
    pub fn clamp(&self, p: Vec2, half: f32) -> Vec2 {
        Vec2::new(
            p.x.clamp(half, (self.width - half).max(half)),
            p.y.clamp(half, (self.height - half).max(half)),
        )
    }
}

/// How a single block resolves into buildings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockLayout {
    Single,
    Split,
    LShape,
}

impl BlockLayout {
    fn draw(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..3) {
            0 => Self::Single,
            1 => Self::Split,
            _ => Self::LShape,
        }
    }
}

/// Static city geometry for one match
#[derive(Debug, Clone)]
pub struct CityLayout {
    pub bounds: WorldBounds,
    pub obstacles: Vec<Obstacle>,
    cols: usize,
    rows: usize,
}

impl CityLayout {
    /// Generate the default-size city from an optional seed
    pub fn generate(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self::generate_with(&mut rng, GRID_COLS, GRID_ROWS)
    }

    pub fn generate_with(rng: &mut impl Rng, cols: usize, rows: usize) -> Self {
        let mut obstacles = Vec::with_capacity(cols * rows * 2);

        for row in 0..rows {
            for col in 0..cols {
                let bx = STREET_WIDTH + col as f32 * BLOCK_PITCH;
                let by = STREET_WIDTH + row as f32 * BLOCK_PITCH;
                push_block(rng, bx, by, &mut obstacles);
            }
        }

        Self {
            bounds: WorldBounds::for_grid(cols, rows),
            obstacles,
            cols,
            rows,
        }
    }

    /// Layout from explicit geometry. Intersections are derived from the
    /// standard grid pitch.
    pub fn from_parts(bounds: WorldBounds, obstacles: Vec<Obstacle>) -> Self {
        let cols = ((bounds.width - STREET_WIDTH) / BLOCK_PITCH).max(0.0) as usize;
        let rows = ((bounds.height - STREET_WIDTH) / BLOCK_PITCH).max(0.0) as usize;
        Self {
            bounds,
            obstacles,
            cols,
            rows,
        }
    }

    pub fn is_on_street(&self, p: Vec2, size: f32) -> bool {
        is_on_street(p.x, p.y, size, &self.obstacles)
    }

    /// On-street and fully inside the world
    pub fn is_open(&self, p: Vec2, size: f32) -> bool {
        self.bounds.contains_square(p, size / 2.0) && self.is_on_street(p, size)
    }

    /// Number of intersections along x and y
    pub fn intersection_dims(&self) -> (usize, usize) {
        (self.cols + 1, self.rows + 1)
    }

    /// Centre of the street crossing at grid coordinates
    pub fn intersection(&self, col: usize, row: usize) -> Vec2 {
        Vec2::new(
            STREET_WIDTH / 2.0 + col as f32 * BLOCK_PITCH,
            STREET_WIDTH / 2.0 + row as f32 * BLOCK_PITCH,
        )
    }

    /// Grid coordinates of the intersection closest to `p`
    pub fn nearest_intersection(&self, p: Vec2) -> (usize, usize) {
        let snap = |v: f32, max: usize| -> usize {
            let idx = ((v - STREET_WIDTH / 2.0) / BLOCK_PITCH).round();
            (idx.max(0.0) as usize).min(max)
        };
        (snap(p.x, self.cols), snap(p.y, self.rows))
    }

    /// Random on-street position for an object of `size`.
    ///
    /// Falls back to a random intersection, which is always open road.
    pub fn spawn_point(&self, rng: &mut impl Rng, size: f32) -> Vec2 {
        let half = size / 2.0;
        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let p = Vec2::new(
                rng.gen_range(half..(self.bounds.width - half).max(half + 1.0)),
                rng.gen_range(half..(self.bounds.height - half).max(half + 1.0)),
            );
            if self.is_open(p, size) {
                return p;
            }
        }
        let (cols, rows) = self.intersection_dims();
        self.intersection(rng.gen_range(0..cols), rng.gen_range(0..rows))
    }

    /// Place `count` delivery targets on open road, spread at least one
    /// block apart. The first one starts active.
    pub fn place_delivery_targets(
        &self,
        rng: &mut impl Rng,
        count: usize,
    ) -> Result<DeliveryTargets, GenerationError> {
        for pass in 0..DELIVERY_PASSES {
            if let Some(points) = self.sample_spread_points(rng, count, BLOCK_SIZE) {
                return Ok(DeliveryTargets::new(points, TARGET_RADIUS));
            }
            warn!(pass, count, "Delivery placement pass exhausted its attempts, retrying");
        }

        // Last resort before giving up: halve the spacing
        if let Some(points) = self.sample_spread_points(rng, count, BLOCK_SIZE / 2.0) {
            warn!(count, "Delivery targets placed with relaxed spacing");
            return Ok(DeliveryTargets::new(points, TARGET_RADIUS));
        }

        Err(GenerationError::DeliveryPlacement { required: count })
    }

    fn sample_spread_points(
        &self,
        rng: &mut impl Rng,
        count: usize,
        min_spacing: f32,
    ) -> Option<Vec<Vec2>> {
        let size = TARGET_RADIUS;
        let half = size / 2.0;
        let min_spacing_sq = min_spacing * min_spacing;
        let mut accepted: Vec<Vec2> = Vec::with_capacity(count);

        for _ in 0..DELIVERY_ATTEMPTS_PER_PASS {
            if accepted.len() == count {
                break;
            }
            let p = Vec2::new(
                rng.gen_range(half..(self.bounds.width - half).max(half + 1.0)),
                rng.gen_range(half..(self.bounds.height - half).max(half + 1.0)),
            );
            if !self.is_open(p, size) {
                continue;
            }
            if accepted.iter().any(|q| q.distance_sq_to(p) < min_spacing_sq) {
                continue;
            }
            accepted.push(p);
        }

        (accepted.len() == count).then_some(accepted)
    }
}

fn push_block(rng: &mut impl Rng, bx: f32, by: f32, out: &mut Vec<Obstacle>) {
    let b = BLOCK_SIZE;
    match BlockLayout::draw(rng) {
        BlockLayout::Single => {
            out.push(Obstacle::new(bx, by, b, b, ObstacleStyle::Warehouse));
        }
        BlockLayout::Split => {
            let w = (b - ALLEY_WIDTH) / 2.0;
            if rng.gen_bool(0.5) {
                out.push(Obstacle::new(bx, by, w, b, ObstacleStyle::Houses));
                out.push(Obstacle::new(bx + w + ALLEY_WIDTH, by, w, b, ObstacleStyle::Houses));
            } else {
                out.push(Obstacle::new(bx, by, b, w, ObstacleStyle::Houses));
                out.push(Obstacle::new(bx, by + w + ALLEY_WIDTH, b, w, ObstacleStyle::Houses));
            }
        }
        BlockLayout::LShape => {
            let h = b / 2.0;
            let bar_top = rng.gen_bool(0.5);
            let leg_left = rng.gen_bool(0.5);
            let bar_y = if bar_top { by } else { by + h };
            let leg_y = if bar_top { by + h } else { by };
            let leg_x = if leg_left { bx } else { bx + h };
            out.push(Obstacle::new(bx, bar_y, b, h, ObstacleStyle::Shop));
            out.push(Obstacle::new(leg_x, leg_y, h, h, ObstacleStyle::Shop));
        }
    }
}

/// A place a parcel has to land
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub position: Vec2,
    pub radius: f32,
    pub active: bool,
}

/// Sequential objective list: exactly one target is active until all are
/// done, then none.
#[derive(Debug, Clone, Default)]
pub struct DeliveryTargets {
    targets: Vec<DeliveryTarget>,
    current: Option<usize>,
}

impl DeliveryTargets {
    pub fn new(points: Vec<Vec2>, radius: f32) -> Self {
        let targets: Vec<DeliveryTarget> = points
            .into_iter()
            .enumerate()
            .map(|(i, position)| DeliveryTarget {
                position,
                radius,
                active: i == 0,
            })
            .collect();
        let current = if targets.is_empty() { None } else { Some(0) };
        Self { targets, current }
    }

    pub fn as_slice(&self) -> &[DeliveryTarget] {
        &self.targets
    }

    pub fn active_index(&self) -> Option<usize> {
        self.current
    }

    pub fn active(&self) -> Option<&DeliveryTarget> {
        self.current.and_then(|i| self.targets.get(i))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Deactivate the current target and activate the next one in a
    /// single step. Returns the newly active index.
    pub fn advance(&mut self) -> Option<usize> {
        let i = self.current?;
        if let Some(t) = self.targets.get_mut(i) {
            t.active = false;
        }
        let next = i + 1;
        self.current = match self.targets.get_mut(next) {
            Some(t) => {
                t.active = true;
                Some(next)
            }
            None => None,
        };
        self.current
    }
}

/// World generation failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("Could not place {required} delivery targets within the attempt budget")]
    DeliveryPlacement { required: usize },
}
