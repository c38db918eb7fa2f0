//! Broadcast message encoding

use crate::ws::protocol::{KnifeSnapshot, LobbyPlayer, PlayerSnapshot, ServerMsg};

use super::room::RoomState;

/// Full room-state message sent at the broadcast rate
pub fn encode_game_state(state: &RoomState, now_ms: u64) -> ServerMsg {
    let mut players: Vec<PlayerSnapshot> = state
        .players
        .values()
        .map(|p| PlayerSnapshot {
            player_id: p.player_id,
            team: p.team,
            x: p.x,
            z: p.z,
            target_x: p.target_x,
            target_z: p.target_z,
            is_moving: p.is_moving,
            is_dead: p.is_dead,
            health: p.health,
            last_processed_seq: p.last_processed_seq,
        })
        .collect();
    players.sort_unstable_by_key(|p| p.player_id);

    let mut knives: Vec<KnifeSnapshot> = state
        .projectiles
        .values()
        .map(|k| KnifeSnapshot {
            knife_id: k.id.clone(),
            owner_team: k.owner_team,
            x: k.x,
            z: k.z,
            velocity_x: k.vx,
            velocity_z: k.vz,
        })
        .collect();
    knives.sort_unstable_by(|a, b| a.knife_id.cmp(&b.knife_id));

    ServerMsg::ServerGameState {
        tick: state.tick,
        server_time: now_ms,
        players,
        knives,
    }
}

/// Lobby snapshot, broadcast after every lobby mutation
pub fn encode_room_state(state: &RoomState) -> ServerMsg {
    let host_id = state
        .host
        .and_then(|session| state.players.get(&session))
        .map(|p| p.player_id);

    let mut players: Vec<LobbyPlayer> = state
        .players
        .values()
        .map(|p| LobbyPlayer {
            player_id: p.player_id,
            team: p.team,
            ready: p.ready,
            loaded: p.loaded,
        })
        .collect();
    players.sort_unstable_by_key(|p| p.player_id);

    ServerMsg::RoomState {
        room_code: state.code.clone(),
        game_mode: state.mode,
        host_id,
        players,
    }
}
