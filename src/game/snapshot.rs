//! Snapshot building and send cadence

use crate::ws::protocol::{PlayerSnapshot, ProjectileSnapshot, ServerMsg, VehicleSnapshot};

use super::player::PlayerEntity;
use super::projectile::Projectile;
use super::router::Vehicle;

/// Decides when periodic player snapshots go out
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Build a periodic player snapshot message
    pub fn build<'a>(
        &self,
        tick: u64,
        time_remaining: f32,
        players: impl Iterator<Item = &'a PlayerEntity>,
    ) -> ServerMsg {
        ServerMsg::Snapshot {
            tick,
            time_remaining,
            players: players.map(player_snapshot).collect(),
        }
    }
}

pub fn player_snapshot(p: &PlayerEntity) -> PlayerSnapshot {
    PlayerSnapshot {
        id: p.id,
        name: p.name.clone(),
        x: p.position.x,
        y: p.position.y,
        heading: p.heading,
        vx: p.velocity.x,
        vy: p.velocity.y,
        size: p.size,
        throws_remaining: p.throws_remaining,
        deliveries: p.deliveries,
        score: p.score,
        stunned: p.stunned_frames(),
        spin_count: p.spin_count(),
        angular_velocity: p.angular_velocity(),
        charging: p.input.charging,
        charge: p.charge,
        braking: p.input.braking,
        current_speed: p.current_speed,
        target_speed: p.target_speed,
        ready: p.ready,
    }
}

pub fn vehicle_snapshot(v: &Vehicle) -> VehicleSnapshot {
    VehicleSnapshot {
        id: v.id,
        x: v.position.x,
        y: v.position.y,
        heading: v.heading,
        vx: v.velocity.x,
        vy: v.velocity.y,
        size: v.size,
    }
}

pub fn projectile_snapshot(p: &Projectile) -> ProjectileSnapshot {
    ProjectileSnapshot {
        id: p.id,
        owner: p.owner,
        x: p.position.x,
        y: p.position.y,
        vx: p.velocity.x,
        vy: p.velocity.y,
        active: p.active,
        delivered: p.delivered,
        sliding: p.sliding,
    }
}
