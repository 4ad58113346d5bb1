//! Time utilities and tick rates for the simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// High-frequency tick: timer, players, projectiles, win checks
pub const SIMULATION_TPS: u32 = 60;
/// Low-frequency tick: vehicle routing
pub const VEHICLE_TPS: u32 = 10;
/// Player snapshots sent to clients per second
pub const SNAPSHOT_TPS: u32 = 20;

/// Seconds of simulated time per high-frequency tick
pub fn tick_delta() -> f32 {
    1.0 / SIMULATION_TPS as f32
}

pub fn simulation_period() -> Duration {
    Duration::from_micros(1_000_000 / SIMULATION_TPS as u64)
}

pub fn vehicle_period() -> Duration {
    Duration::from_micros(1_000_000 / VEHICLE_TPS as u64)
}

/// Milliseconds covered by one high-frequency tick
pub const TICK_MILLIS: f32 = 1000.0 / SIMULATION_TPS as f32;
