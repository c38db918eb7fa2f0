//! Time utilities for game simulation

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

/// Physics tick rate (fixed timestep)
pub const TICK_RATE: u32 = 120;
/// Broadcast rate under normal host load
pub const NETWORK_UPDATE_RATE: u32 = 60;
/// Broadcast rate while the host is degraded
pub const DEGRADED_UPDATE_RATE: u32 = 30;

/// Fixed physics delta time in seconds
pub fn tick_delta() -> f32 {
    1.0 / TICK_RATE as f32
}
