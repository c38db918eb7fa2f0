//! Map bounds and player movement

use crate::ws::protocol::Team;

use super::player::Player;

/// Player movement speed in units per second
pub const PLAYER_SPEED: f32 = 23.4;
/// Radius used when clamping move targets to the outer walls
pub const CHARACTER_RADIUS: f32 = 6.0;
/// Remaining distance below which a mover snaps to its target
const SNAP_DISTANCE: f32 = 0.1;

/// Central no-go strip half-width; targets on the line itself are rejected
const NO_GO_HALF_WIDTH: f32 = 18.0;
/// Outer wall on the X axis before the character radius is subtracted
const HALF_WIDTH: f32 = 80.0;
/// Outer wall on the Z axis
const HALF_DEPTH: f32 = 68.0;
/// Corner cut: |x| + |z| must stay strictly below this
const CORNER_LIMIT: f32 = 120.0;

/// Whether a move target is admissible for a player on `team`.
///
/// The playfield is two team halves separated by a central strip, clipped
/// by outer walls and a diagonal corner cut. Points exactly on the strip
/// boundary or the corner-cut line are rejected.
pub fn is_valid_target(team: Team, x: f32, z: f32) -> bool {
    let ax = x.abs();
    let az = z.abs();

    if ax <= NO_GO_HALF_WIDTH {
        return false;
    }
    let on_own_side = match team {
        Team::One => x <= -NO_GO_HALF_WIDTH,
        Team::Two => x >= NO_GO_HALF_WIDTH,
    };
    on_own_side && ax <= HALF_WIDTH - CHARACTER_RADIUS && az <= HALF_DEPTH && ax + az < CORNER_LIMIT
}

/// Advance one living, moving player toward its target at `PLAYER_SPEED`.
/// Snaps to the target when the remaining distance falls below the snap
/// threshold or within one step.
pub fn integrate(player: &mut Player, dt: f32) {
    if player.is_dead || !player.is_moving {
        return;
    }

    let dx = player.target_x - player.x;
    let dz = player.target_z - player.z;
    let distance = (dx * dx + dz * dz).sqrt();
    let step = PLAYER_SPEED * dt;

    if distance < SNAP_DISTANCE || distance <= step {
        player.x = player.target_x;
        player.z = player.target_z;
        player.is_moving = false;
    } else {
        player.x += dx / distance * step;
        player.z += dz / distance * step;
    }
}
