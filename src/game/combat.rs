//! Hit detection - swept collision tests with lag compensation

use uuid::Uuid;

use crate::ws::protocol::Team;

use super::history::PositionHistory;
use super::player::PlayerTable;
use super::projectile::ProjectileTable;

/// Player hitbox radius for the swept test
pub const COLLISION_RADIUS: f32 = 11.025;
/// Rewind window; lag at or beyond this uses current positions
pub const LAG_WINDOW_MS: u64 = 1_000;
/// Client timestamps further ahead of server time than this are invalid
pub const CLIENT_AHEAD_TOLERANCE_MS: u64 = 100;

/// One resolved hit from a detection pass
#[derive(Debug, Clone)]
pub struct HitRecord {
    pub knife_id: String,
    pub victim_player_id: u32,
    pub health: u8,
    pub is_dead: bool,
    pub x: f32,
    pub z: f32,
}

/// Swept line-vs-circle test from (p1x, p1z) to (p2x, p2z) against a circle
/// at (cx, cz). Squared distances throughout; a zero-length segment falls
/// back to a point-in-circle test.
pub fn swept_circle_hit(
    p1x: f32,
    p1z: f32,
    p2x: f32,
    p2z: f32,
    cx: f32,
    cz: f32,
    radius: f32,
) -> bool {
    let seg_x = p2x - p1x;
    let seg_z = p2z - p1z;
    let len_sq = seg_x * seg_x + seg_z * seg_z;
    let r_sq = radius * radius;

    if len_sq <= f32::EPSILON {
        let dx = cx - p1x;
        let dz = cz - p1z;
        return dx * dx + dz * dz < r_sq;
    }

    let t = (((cx - p1x) * seg_x + (cz - p1z) * seg_z) / len_sq).clamp(0.0, 1.0);
    let qx = p1x + seg_x * t;
    let qz = p1z + seg_z * t;
    let dx = cx - qx;
    let dz = cz - qz;
    dx * dx + dz * dz < r_sq
}

/// Position to test a victim at, rewound to the thrower's wall-clock when
/// the reported lag is inside the window. Falls back to the current
/// position when the timestamp is invalid, the lag is outside (0, window),
/// or the historical entry is missing, dead, or on the thrower's own team.
fn resolve_target_position(
    session: &Uuid,
    current: (f32, f32),
    owner_team: Team,
    client_ms: u64,
    history: &PositionHistory,
    now_ms: u64,
) -> (f32, f32) {
    if client_ms > now_ms + CLIENT_AHEAD_TOLERANCE_MS {
        return current;
    }
    let lag_ms = now_ms.saturating_sub(client_ms);
    if lag_ms == 0 || lag_ms >= LAG_WINDOW_MS {
        return current;
    }

    match history.lookup(client_ms) {
        Some(snapshot) => match snapshot.players.get(session) {
            Some(entry) if !entry.is_dead && entry.team != owner_team => (entry.x, entry.z),
            _ => current,
        },
        None => current,
    }
}

/// One hit-detection pass over all live projectiles.
///
/// Within a projectile's sweep the first collision wins: `has_hit` is set,
/// the victim loses one health (clamped at zero, flipping `is_dead` on the
/// transition), and no further players are checked for that projectile.
pub fn detect_hits(
    projectiles: &mut ProjectileTable,
    players: &mut PlayerTable,
    history: &PositionHistory,
    now_ms: u64,
) -> Vec<HitRecord> {
    let mut hits = Vec::new();

    for projectile in projectiles.values_mut() {
        if projectile.has_hit {
            continue;
        }

        for (session, player) in players.iter_mut() {
            if player.is_dead || player.team == projectile.owner_team {
                continue;
            }

            let (tx, tz) = resolve_target_position(
                session,
                (player.x, player.z),
                projectile.owner_team,
                projectile.client_ms,
                history,
                now_ms,
            );

            if swept_circle_hit(
                projectile.prev_x,
                projectile.prev_z,
                projectile.x,
                projectile.z,
                tx,
                tz,
                COLLISION_RADIUS,
            ) {
                projectile.has_hit = true;
                player.apply_hit();
                hits.push(HitRecord {
                    knife_id: projectile.id.clone(),
                    victim_player_id: player.player_id,
                    health: player.health,
                    is_dead: player.is_dead,
                    x: projectile.x,
                    z: projectile.z,
                });
                break;
            }
        }
    }

    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::Player;
    use crate::game::projectile::Projectile;
    use crate::ws::protocol::Team;

    fn knife(owner_team: Team, prev: (f32, f32), cur: (f32, f32), client_ms: u64) -> Projectile {
        Projectile {
            id: "T-1".to_string(),
            owner: Uuid::new_v4(),
            owner_team,
            action_id: "a1".to_string(),
            x: cur.0,
            z: cur.1,
            prev_x: prev.0,
            prev_z: prev.1,
            vx: 0.0,
            vz: 0.0,
            spawn_ms: 0,
            client_ms,
            has_hit: false,
        }
    }

    fn table_with(session: Uuid, team: Team, x: f32, z: f32) -> PlayerTable {
        let mut table = PlayerTable::new();
        let mut player = Player::new(2, team);
        player.x = x;
        player.z = z;
        table.insert(session, player);
        table
    }

    #[test]
    fn swept_test_catches_tunneling_between_ticks() {
        // Segment crosses straight through the circle; both endpoints are
        // outside the radius
        assert!(swept_circle_hit(-20.0, 0.0, 20.0, 0.0, 0.0, 5.0, 11.025));
        assert!(!swept_circle_hit(-20.0, 30.0, 20.0, 30.0, 0.0, 5.0, 11.025));
    }

    #[test]
    fn degenerate_segment_falls_back_to_point_test() {
        assert!(swept_circle_hit(1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 11.025));
        assert!(!swept_circle_hit(1.0, 1.0, 1.0, 1.0, 50.0, 50.0, 11.025));
    }

    #[test]
    fn boundary_distance_is_a_miss() {
        // distance exactly equal to the radius is not a hit
        assert!(!swept_circle_hit(0.0, 0.0, 0.0, 0.0, 11.025, 0.0, 11.025));
    }

    #[test]
    fn zero_and_windowed_lag_use_current_position() {
        let session = Uuid::new_v4();
        let mut history = PositionHistory::new(8);
        let old = table_with(session, Team::Two, 30.0, 0.0);
        history.record(1_000, &old);

        let current = (30.0, 50.0);

        // lag == 0: current
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 2_000, &history, 2_000),
            current
        );
        // lag >= window: current
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 1_000, &history, 2_000),
            current
        );
        // strictly inside the window: rewound
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 1_500, &history, 2_000),
            (30.0, 0.0)
        );
    }

    #[test]
    fn future_client_timestamp_disables_rewind() {
        let session = Uuid::new_v4();
        let mut history = PositionHistory::new(8);
        let old = table_with(session, Team::Two, 30.0, 0.0);
        history.record(1_000, &old);

        let current = (30.0, 50.0);
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 2_101, &history, 2_000),
            current
        );
        // inside the tolerance the timestamp is still valid, lag is 0
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 2_100, &history, 2_000),
            current
        );
    }

    #[test]
    fn rewound_hit_lands_on_historical_position() {
        let session = Uuid::new_v4();
        let mut history = PositionHistory::new(8);

        // Victim was at (30, 4) 200 ms ago, has since moved to (30, 50)
        let past = table_with(session, Team::Two, 30.0, 4.0);
        history.record(1_800, &past);
        let mut players = table_with(session, Team::Two, 30.0, 50.0);

        let mut projectiles = ProjectileTable::new();
        projectiles.insert(knife(Team::One, (20.0, 4.0), (40.0, 4.0), 1_800));

        let hits = detect_hits(&mut projectiles, &mut players, &history, 2_000);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].health, 4);
        assert!(!hits[0].is_dead);
    }

    #[test]
    fn dead_historical_entry_falls_back_to_current() {
        let session = Uuid::new_v4();
        let mut history = PositionHistory::new(8);

        let mut past = table_with(session, Team::Two, 30.0, 4.0);
        past.get_mut(&session).expect("player").is_dead = true;
        history.record(1_800, &past);

        let current = (30.0, 50.0);
        assert_eq!(
            resolve_target_position(&session, current, Team::One, 1_800, &history, 2_000),
            current
        );
    }

    #[test]
    fn own_team_is_never_damaged() {
        let session = Uuid::new_v4();
        let history = PositionHistory::new(8);
        let mut players = table_with(session, Team::One, 30.0, 0.0);

        let mut projectiles = ProjectileTable::new();
        projectiles.insert(knife(Team::One, (20.0, 0.0), (40.0, 0.0), 2_000));

        let hits = detect_hits(&mut projectiles, &mut players, &history, 2_000);
        assert!(hits.is_empty());
    }

    #[test]
    fn hit_flag_is_one_way_and_stops_further_checks() {
        let session = Uuid::new_v4();
        let history = PositionHistory::new(8);
        let mut players = table_with(session, Team::Two, 30.0, 0.0);

        let mut projectiles = ProjectileTable::new();
        projectiles.insert(knife(Team::One, (20.0, 0.0), (40.0, 0.0), 2_000));

        let first = detect_hits(&mut projectiles, &mut players, &history, 2_000);
        assert_eq!(first.len(), 1);

        // Second pass: the projectile already hit, nothing new
        let second = detect_hits(&mut projectiles, &mut players, &history, 2_001);
        assert!(second.is_empty());
        assert_eq!(players.get(&session).expect("player").health, 4);
    }
}
